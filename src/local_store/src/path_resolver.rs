use std::path::{Component, Path, PathBuf, MAIN_SEPARATOR};

use crate::{FsError, FsResult};

pub(crate) const SEPARATOR: char = '/';

/// Translates a logical name into host separators.
pub(crate) fn to_local_name(name: &str) -> String {
    if MAIN_SEPARATOR == SEPARATOR {
        name.to_string()
    } else {
        name.replace(SEPARATOR, &MAIN_SEPARATOR.to_string())
    }
}

/// Translates a host-relative path back into a `/`-delimited logical name.
pub(crate) fn to_remote_name(path: &Path) -> String {
    let s = path.to_string_lossy();
    if MAIN_SEPARATOR == SEPARATOR {
        s.into_owned()
    } else {
        s.replace(MAIN_SEPARATOR, &SEPARATOR.to_string())
    }
}

/// Maps a logical name onto an absolute path under `storage`.
///
/// The resolution is purely lexical: `.` and `..` are collapsed without
/// touching the filesystem. Names that are empty, absolute, escape the
/// storage root, or land inside `temp_dir` are rejected as forbidden.
pub(crate) fn resolve(storage: &Path, temp_dir: &Path, name: &str) -> FsResult<PathBuf> {
    if name.is_empty() {
        return Err(FsError::ForbiddenPath("empty name".to_string()));
    }

    let local = to_local_name(name);
    if Path::new(&local).is_absolute() {
        return Err(FsError::ForbiddenPath(name.to_string()));
    }

    let mut resolved = PathBuf::new();
    for component in storage.join(local).components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !resolved.pop() {
                    return Err(FsError::ForbiddenPath(name.to_string()));
                }
            }
            other => resolved.push(other),
        }
    }

    if !resolved.starts_with(storage) {
        return Err(FsError::ForbiddenPath(name.to_string()));
    }
    if resolved.starts_with(temp_dir) {
        return Err(FsError::ForbiddenPath(name.to_string()));
    }
    Ok(resolved)
}

/// Logical name of `path` relative to `storage`, for error messages.
pub(crate) fn relative_name(storage: &Path, path: &Path) -> String {
    match path.strip_prefix(storage) {
        Ok(rel) => to_remote_name(rel),
        Err(_) => to_remote_name(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage() -> PathBuf {
        PathBuf::from("/data/store")
    }

    fn temp_dir() -> PathBuf {
        PathBuf::from("/data/store/.upload")
    }

    #[test]
    fn test_resolve_plain_names() {
        let path = resolve(&storage(), &temp_dir(), "a/b.txt").unwrap();
        assert_eq!(path, PathBuf::from("/data/store/a/b.txt"));

        let path = resolve(&storage(), &temp_dir(), "top.bin").unwrap();
        assert_eq!(path, PathBuf::from("/data/store/top.bin"));
    }

    #[test]
    fn test_resolve_collapses_dots_inside_root() {
        let path = resolve(&storage(), &temp_dir(), "a/./b/../c").unwrap();
        assert_eq!(path, PathBuf::from("/data/store/a/c"));
    }

    #[test]
    fn test_resolve_rejects_escape() {
        for name in ["..", "../escape", "a/../../escape", "a/../../../../etc/passwd"] {
            let err = resolve(&storage(), &temp_dir(), name).unwrap_err();
            assert!(err.is_forbidden(), "{} should be forbidden", name);
        }
    }

    #[test]
    fn test_resolve_rejects_empty_and_absolute() {
        assert!(resolve(&storage(), &temp_dir(), "").unwrap_err().is_forbidden());
        assert!(resolve(&storage(), &temp_dir(), "/abs").unwrap_err().is_forbidden());
    }

    #[test]
    fn test_resolve_rejects_temp_dir() {
        for name in [".upload", ".upload/staged", "a/../.upload/x"] {
            let err = resolve(&storage(), &temp_dir(), name).unwrap_err();
            assert!(err.is_forbidden(), "{} should be forbidden", name);
        }
    }

    #[test]
    fn test_resolve_allows_sibling_of_temp_dir() {
        let path = resolve(&storage(), &temp_dir(), ".uploads/file").unwrap();
        assert_eq!(path, PathBuf::from("/data/store/.uploads/file"));
    }

    #[test]
    fn test_relative_name_round_trip() {
        let path = resolve(&storage(), &temp_dir(), "a/b/c.bin").unwrap();
        assert_eq!(relative_name(&storage(), &path), "a/b/c.bin");
    }
}
