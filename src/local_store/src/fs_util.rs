use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use glob::MatchOptions;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::path_resolver::{relative_name, to_remote_name, SEPARATOR};
use crate::{FsError, FsResult};

/// Everything in this module performs blocking filesystem calls and must only
/// run on the worker pool, never on the event-loop side of the runtime.

const GLOB_META: &[char] = &['*', '?', '[', '{', '\\'];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    /// Byte length of the file.
    pub size: u64,
    /// Last-modified time in milliseconds since the epoch.
    pub timestamp: i64,
}

pub(crate) fn current_time_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Creates the storage root and the staging directory.
pub(crate) fn init(storage: &Path, temp_dir: &Path, synced: bool) -> io::Result<()> {
    fs::create_dir_all(storage)?;
    fs::create_dir_all(temp_dir)?;
    if synced {
        try_fsync(storage);
        try_fsync(temp_dir);
    }
    Ok(())
}

/// Best-effort directory (or file) sync. Directory fsync is rejected on some
/// platforms, so failures are logged and swallowed.
pub(crate) fn try_fsync(path: &Path) {
    match fs::File::open(path).and_then(|f| f.sync_all()) {
        Ok(()) => {}
        Err(e) => debug!("fsync skipped for {}: {}", path.display(), e),
    }
}

/// Syncs file data to the device. An `Unsupported` outcome is tolerated, any
/// other failure is reported to the caller.
pub(crate) fn fsync_file(file: &fs::File) -> io::Result<()> {
    match file.sync_all() {
        Err(e) if e.kind() == io::ErrorKind::Unsupported => Ok(()),
        other => other,
    }
}

/// Runs `action` against `target`, creating the parent directory chain on
/// demand and translating collision errors into domain errors.
///
/// When `source` is given and has disappeared, the failure is reported as
/// missing source rather than missing target. After a successful `action` the
/// parent directory is fsynced if `synced` is set.
pub(crate) fn ensure_target<T>(
    source: Option<&Path>,
    target: &Path,
    storage: &Path,
    synced: bool,
    action: impl Fn() -> io::Result<T>,
) -> FsResult<T> {
    loop {
        match action() {
            Ok(value) => {
                if synced {
                    if let Some(parent) = target.parent() {
                        try_fsync(parent);
                    }
                }
                return Ok(value);
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                if let Some(source) = source {
                    if !source.exists() {
                        return Err(FsError::NotFound(relative_name(storage, source)));
                    }
                }
                let parent = match target.parent() {
                    Some(parent) => parent,
                    None => return Err(FsError::IoError(e.to_string())),
                };
                if parent.exists() {
                    return Err(classify_target_error(e, target, storage));
                }
                fs::create_dir_all(parent)
                    .map_err(|e| classify_target_error(e, target, storage))?;
                if synced {
                    try_fsync(parent);
                }
            }
            Err(e) => return Err(classify_target_error(e, target, storage)),
        }
    }
}

fn classify_target_error(e: io::Error, target: &Path, storage: &Path) -> FsError {
    if target.is_dir() {
        return FsError::IsADirectory(relative_name(storage, target));
    }
    if let Some(component) = path_contains_file(target) {
        return FsError::PathContainsFile(relative_name(storage, &component));
    }
    if e.kind() == io::ErrorKind::NotFound {
        return FsError::NotFound(relative_name(storage, target));
    }
    warn!("target operation on {} failed: {}", target.display(), e);
    FsError::IoError(e.to_string())
}

/// Finds an intermediate component of `target` that exists as a regular file.
fn path_contains_file(target: &Path) -> Option<PathBuf> {
    target
        .ancestors()
        .skip(1)
        .find(|ancestor| ancestor.is_file())
        .map(Path::to_path_buf)
}

/// Classifies a host error for a single-name operation, stat'ing the resolved
/// path to pick the most specific domain error.
pub(crate) fn scalar_error(e: io::Error, name: &str, path: &Path) -> FsError {
    match e.kind() {
        io::ErrorKind::NotFound => FsError::NotFound(name.to_string()),
        io::ErrorKind::AlreadyExists => {
            if path.is_dir() {
                FsError::IsADirectory(name.to_string())
            } else {
                FsError::PathContainsFile(name.to_string())
            }
        }
        _ => {
            if !path.exists() {
                return FsError::NotFound(name.to_string());
            }
            if path.is_dir() {
                return FsError::IsADirectory(name.to_string());
            }
            warn!("operation on {} failed: {}", name, e);
            FsError::IoError(e.to_string())
        }
    }
}

/// Moves `source` onto `target`, preferring a hardlink-then-unlink so the
/// target never observes partial content, with the host's atomic rename as
/// the fallback.
pub(crate) fn move_via_hardlink(source: &Path, target: &Path, now_ms: i64) -> io::Result<()> {
    match fs::hard_link(source, target) {
        Ok(()) => {
            if let Err(e) = fs::remove_file(source) {
                if e.kind() != io::ErrorKind::NotFound {
                    return Err(e);
                }
            }
        }
        Err(link_err) => {
            debug!(
                "hardlink move {} -> {} failed ({}), using rename",
                source.display(),
                target.display(),
                link_err
            );
            fs::rename(source, target)?;
        }
    }
    touch(target, now_ms)
}

/// Zero-byte copy: a second directory entry for the same inode. The mtime is
/// left alone; both names share it, so bumping the target would rewrite the
/// source's timestamp too.
pub(crate) fn copy_via_hardlink(source: &Path, target: &Path) -> io::Result<()> {
    fs::hard_link(source, target)
}

/// Copies `source` into a fresh staging file under `temp_dir`, then renames
/// it onto `target`. The staging file is unlinked if any step fails.
pub(crate) fn copy_via_temp_dir(
    source: &Path,
    target: &Path,
    now_ms: i64,
    temp_dir: &Path,
    synced: bool,
) -> io::Result<()> {
    let staged = tempfile::Builder::new().prefix("copy").tempfile_in(temp_dir)?;
    let (mut file, staging_path) = staged.into_parts();
    let mut source_file = fs::File::open(source)?;
    io::copy(&mut source_file, &mut file)?;
    if synced {
        fsync_file(&file)?;
    }
    drop(file);
    fs::rename(&staging_path, target)?;
    let _ = staging_path.keep();
    touch(target, now_ms)
}

/// Sets the last-modified time of an existing path.
pub(crate) fn touch(path: &Path, now_ms: i64) -> io::Result<()> {
    let file = fs::OpenOptions::new().write(true).open(path)?;
    let mtime = UNIX_EPOCH + Duration::from_millis(now_ms.max(0) as u64);
    file.set_modified(mtime)
}

/// Metadata for regular files; directories and missing paths are absent.
pub(crate) fn to_file_metadata(path: &Path) -> io::Result<Option<FileMetadata>> {
    match fs::metadata(path) {
        Ok(meta) if meta.is_file() => {
            let timestamp = meta
                .modified()?
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as i64;
            Ok(Some(FileMetadata {
                size: meta.len(),
                timestamp,
            }))
        }
        Ok(_) => Ok(None),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Longest literal directory prefix of `glob`: every whole segment before the
/// first one carrying a glob metacharacter. The trailing segment is always
/// treated as a pattern. Returns a prefix ending in `/`, or an empty string.
pub(crate) fn extract_sub_dir(glob: &str) -> &str {
    let segments: Vec<&str> = glob.split(SEPARATOR).collect();
    let mut end = 0;
    for segment in &segments[..segments.len().saturating_sub(1)] {
        if segment.contains(GLOB_META) {
            break;
        }
        end += segment.len() + 1;
    }
    &glob[..end]
}

pub(crate) fn glob_match_options() -> MatchOptions {
    MatchOptions {
        case_sensitive: true,
        // `*` and `?` stay within one path segment; `**` crosses segments
        require_literal_separator: true,
        require_literal_leading_dot: false,
    }
}

/// Walks `subdir` and collects every regular file whose root-relative
/// `/`-delimited name matches `pattern`. The staging subtree is skipped
/// entirely. A missing `subdir` matches nothing.
pub(crate) fn find_matching(
    storage: &Path,
    temp_dir: &Path,
    subdir: &Path,
    pattern: &glob::Pattern,
) -> io::Result<Vec<(String, FileMetadata)>> {
    if !subdir.is_dir() {
        return Ok(Vec::new());
    }
    let options = glob_match_options();
    let mut found = Vec::new();
    let walker = WalkDir::new(subdir)
        .into_iter()
        .filter_entry(|entry| entry.path() != temp_dir);
    for entry in walker {
        let entry = entry.map_err(io::Error::from)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry.path().strip_prefix(storage).unwrap_or(entry.path());
        let name = to_remote_name(rel);
        if pattern.matches_with(&name, options) {
            if let Some(metadata) = to_file_metadata(entry.path())? {
                found.push((name, metadata));
            }
        }
    }
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_extract_sub_dir() {
        assert_eq!(extract_sub_dir("sub/dir/*.bin"), "sub/dir/");
        assert_eq!(extract_sub_dir("*.bin"), "");
        assert_eq!(extract_sub_dir("**"), "");
        assert_eq!(extract_sub_dir("a/b.txt"), "a/");
        assert_eq!(extract_sub_dir("a/b*/c.txt"), "a/");
        assert_eq!(extract_sub_dir("a/{x,y}/z"), "a/");
        assert_eq!(extract_sub_dir("plain"), "");
    }

    #[test]
    fn test_touch_missing_file() {
        let root = TempDir::new().unwrap();
        let err = touch(&root.path().join("absent"), current_time_ms()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_metadata_absent_for_dirs_and_missing() {
        let root = TempDir::new().unwrap();
        assert!(to_file_metadata(root.path()).unwrap().is_none());
        assert!(to_file_metadata(&root.path().join("nope")).unwrap().is_none());

        let file = root.path().join("data.bin");
        fs::write(&file, b"abc").unwrap();
        let meta = to_file_metadata(&file).unwrap().unwrap();
        assert_eq!(meta.size, 3);
        assert!(meta.timestamp > 0);
    }

    #[test]
    fn test_ensure_target_creates_parent_chain() {
        let root = TempDir::new().unwrap();
        let target = root.path().join("a/b/c.txt");
        ensure_target(None, &target, root.path(), false, || {
            fs::write(&target, b"payload")
        })
        .unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"payload");
    }

    #[test]
    fn test_ensure_target_reports_directory_collision() {
        let root = TempDir::new().unwrap();
        let source = root.path().join("src.txt");
        fs::write(&source, b"x").unwrap();
        let target = root.path().join("occupied");
        fs::create_dir(&target).unwrap();

        let err = ensure_target(Some(&source), &target, root.path(), false, || {
            move_via_hardlink(&source, &target, current_time_ms())
        })
        .unwrap_err();
        assert!(matches!(err, FsError::IsADirectory(name) if name == "occupied"));
    }

    #[test]
    fn test_ensure_target_reports_file_in_path() {
        let root = TempDir::new().unwrap();
        fs::write(root.path().join("blocker"), b"x").unwrap();
        let target = root.path().join("blocker/inner.txt");

        let err = ensure_target(None, &target, root.path(), false, || {
            fs::write(&target, b"payload")
        })
        .unwrap_err();
        assert!(matches!(err, FsError::PathContainsFile(_)));
    }

    #[test]
    fn test_copy_via_temp_dir_replaces_target() {
        let root = TempDir::new().unwrap();
        let temp_dir = root.path().join(".upload");
        fs::create_dir_all(&temp_dir).unwrap();
        let source = root.path().join("src.bin");
        let target = root.path().join("dst.bin");
        fs::write(&source, b"fresh").unwrap();
        fs::write(&target, b"stale").unwrap();

        copy_via_temp_dir(&source, &target, current_time_ms(), &temp_dir, false).unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"fresh");
        // no staging residue
        assert_eq!(fs::read_dir(&temp_dir).unwrap().count(), 0);
    }

    #[test]
    fn test_move_via_hardlink_removes_source() {
        let root = TempDir::new().unwrap();
        let source = root.path().join("from.bin");
        let target = root.path().join("to.bin");
        fs::write(&source, b"bytes").unwrap();

        move_via_hardlink(&source, &target, current_time_ms()).unwrap();
        assert!(!source.exists());
        assert_eq!(fs::read(&target).unwrap(), b"bytes");
    }
}
