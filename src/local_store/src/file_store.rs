use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio::fs::File;
use tokio::io::{AsyncSeekExt, SeekFrom};

use crate::fs_util::{self, FileMetadata};
use crate::path_resolver;
use crate::reader::FileReader;
use crate::stats::StoreStats;
use crate::writer::{AppendWriter, UploadWriter};
use crate::{
    BatchError, FsError, FsResult, DEFAULT_READER_BUFFER_SIZE, DEFAULT_SYNCED,
    DEFAULT_SYNCED_APPEND, DEFAULT_TEMP_DIR,
};

const UPLOAD_PREFIX: &str = "upload";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalStoreConfig {
    pub reader_buffer_size: usize,
    pub hardlink_on_copy: bool,
    pub synced: bool,
    pub synced_append: bool,
    pub temp_dir: Option<PathBuf>,
}

impl Default for LocalStoreConfig {
    fn default() -> Self {
        Self {
            reader_buffer_size: DEFAULT_READER_BUFFER_SIZE,
            hardlink_on_copy: false,
            synced: *DEFAULT_SYNCED,
            synced_append: *DEFAULT_SYNCED_APPEND,
            temp_dir: None,
        }
    }
}

impl LocalStoreConfig {
    pub async fn from_json_file(path: &Path) -> FsResult<Self> {
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            warn!("read store config failed: {}", e);
            FsError::IoError(format!("read store config failed: {}", e))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            warn!("parse store config failed: {}", e);
            FsError::IoError(format!("store config invalid: {}", e))
        })
    }
}

#[derive(Clone, Copy)]
enum TransferKind {
    Copy,
    Move,
}

/// File store over a bounded directory of the host filesystem.
///
/// Every logical name resolves strictly below the storage root; uploads are
/// staged in a temp dir and published with an atomic rename, so a live name
/// never observes partial content. Blocking filesystem work is dispatched to
/// the runtime's worker pool.
#[derive(Debug)]
pub struct LocalFileStore {
    storage: PathBuf,
    temp_dir: PathBuf,
    reader_buffer_size: usize,
    hardlink_on_copy: bool,
    synced: bool,
    synced_append: bool,
    stats: Arc<StoreStats>,
}

impl LocalFileStore {
    pub fn new(storage: impl Into<PathBuf>) -> Self {
        Self::from_config(storage, LocalStoreConfig::default())
    }

    pub fn from_config(storage: impl Into<PathBuf>, config: LocalStoreConfig) -> Self {
        let storage = storage.into();
        let temp_dir = config
            .temp_dir
            .unwrap_or_else(|| storage.join(DEFAULT_TEMP_DIR));
        Self {
            storage,
            temp_dir,
            reader_buffer_size: config.reader_buffer_size,
            hardlink_on_copy: config.hardlink_on_copy,
            synced: config.synced,
            synced_append: config.synced_append,
            stats: Arc::new(StoreStats::default()),
        }
    }

    /// Block size used by download channels.
    pub fn with_reader_buffer_size(mut self, size: usize) -> Self {
        self.reader_buffer_size = size;
        self
    }

    /// When set, copies try a hardlink before falling back to a staged copy.
    pub fn with_hardlink_on_copy(mut self, hardlink_on_copy: bool) -> Self {
        self.hardlink_on_copy = hardlink_on_copy;
        self
    }

    /// Overrides the staging directory. It must lie under the storage root.
    pub fn with_temp_dir(mut self, temp_dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = temp_dir.into();
        self
    }

    /// When set, every create/replace is fsynced together with its parent
    /// directory. Slows writes down considerably.
    pub fn with_synced(mut self, synced: bool) -> Self {
        self.synced = synced;
        self
    }

    /// When set, append channels are opened with the synchronous-write flag.
    pub fn with_synced_append(mut self, synced_append: bool) -> Self {
        self.synced_append = synced_append;
        self
    }

    pub fn storage_root(&self) -> &Path {
        &self.storage
    }

    pub fn stats(&self) -> Arc<StoreStats> {
        self.stats.clone()
    }

    /// Creates the storage root and the staging directory.
    pub async fn start(&self) -> FsResult<()> {
        if !self.temp_dir.starts_with(&self.storage) {
            return Err(FsError::ForbiddenPath(format!(
                "temp dir {} must live under the storage root",
                self.temp_dir.display()
            )));
        }
        let storage = self.storage.clone();
        let temp_dir = self.temp_dir.clone();
        let synced = self.synced;
        execute(move || fs_util::init(&storage, &temp_dir, synced).map_err(FsError::from)).await
    }

    pub async fn stop(&self) -> FsResult<()> {
        Ok(())
    }

    /// The local store is always reachable.
    pub async fn ping(&self) -> FsResult<()> {
        Ok(())
    }

    fn resolve(&self, name: &str) -> FsResult<PathBuf> {
        path_resolver::resolve(&self.storage, &self.temp_dir, name)
    }

    /// Opens an upload channel for `name`. Bytes land in a staging file and
    /// become visible under `name` only when the returned writer is finished.
    pub async fn upload(&self, name: &str) -> FsResult<UploadWriter> {
        self.upload_impl(name, None).await
    }

    /// Like [`upload`](Self::upload), but the channel enforces an exact byte
    /// count: any other count fails the acknowledgement and nothing is
    /// published.
    pub async fn upload_sized(&self, name: &str, size: u64) -> FsResult<UploadWriter> {
        self.upload_impl(name, Some(size)).await
    }

    async fn upload_impl(&self, name: &str, expected_size: Option<u64>) -> FsResult<UploadWriter> {
        self.stats.upload_begin.record_start();
        let result = self.upload_open(name, expected_size).await;
        self.stats.upload_begin.record_result(&result);
        result
    }

    async fn upload_open(&self, name: &str, expected_size: Option<u64>) -> FsResult<UploadWriter> {
        let target = self.resolve(name)?;
        let temp_dir = self.temp_dir.clone();
        let (file, staging) = execute(move || {
            std::fs::create_dir_all(&temp_dir).map_err(FsError::from)?;
            let staged = tempfile::Builder::new()
                .prefix(UPLOAD_PREFIX)
                .tempfile_in(&temp_dir)
                .map_err(FsError::from)?;
            Ok(staged.into_parts())
        })
        .await?;
        debug!("upload {} staged at {}", name, staging.display());
        Ok(UploadWriter::new(
            File::from_std(file),
            staging,
            target,
            name.to_string(),
            self.storage.clone(),
            self.synced,
            expected_size,
            self.stats.clone(),
        ))
    }

    /// Opens an append channel positioned at `offset`. With `offset == 0` the
    /// file is created when absent; otherwise it must exist, and the offset
    /// must not exceed its current size.
    pub async fn append(&self, name: &str, offset: u64) -> FsResult<AppendWriter> {
        self.stats.append_begin.record_start();
        let result = self.append_open(name, offset).await;
        self.stats.append_begin.record_result(&result);
        result
    }

    async fn append_open(&self, name: &str, offset: u64) -> FsResult<AppendWriter> {
        let path = self.resolve(name)?;
        let storage = self.storage.clone();
        let synced = self.synced;
        let synced_append = self.synced_append;
        let owned_name = name.to_string();

        let file = execute(move || {
            let file = if offset == 0 {
                fs_util::ensure_target(None, &path, &storage, synced, || {
                    open_for_append(&path, true, synced_append)
                })?
            } else {
                open_for_append(&path, false, synced_append)
                    .map_err(|e| fs_util::scalar_error(e, &owned_name, &path))?
            };
            let size = file
                .metadata()
                .map_err(|e| fs_util::scalar_error(e, &owned_name, &path))?
                .len();
            if size < offset {
                return Err(FsError::OffsetTooLarge(format!(
                    "{}: offset {} exceeds file size {}",
                    owned_name, offset, size
                )));
            }
            Ok(file)
        })
        .await?;

        let mut file = File::from_std(file);
        if offset > 0 {
            file.seek(SeekFrom::Start(offset))
                .await
                .map_err(|e| FsError::IoError(e.to_string()))?;
        }
        let opened_sync = cfg!(unix) && self.synced_append;
        let force_on_close = (self.synced || self.synced_append) && !opened_sync;
        Ok(AppendWriter::new(
            file,
            name.to_string(),
            force_on_close,
            self.stats.clone(),
        ))
    }

    /// Opens a download channel at `offset`, bounded by `limit` bytes
    /// (`u64::MAX` reads to the end of the file).
    pub async fn download(&self, name: &str, offset: u64, limit: u64) -> FsResult<FileReader> {
        self.stats.download_begin.record_start();
        let result = self.download_open(name, offset, limit).await;
        self.stats.download_begin.record_result(&result);
        result
    }

    async fn download_open(&self, name: &str, offset: u64, limit: u64) -> FsResult<FileReader> {
        let path = self.resolve(name)?;
        let owned_name = name.to_string();
        let (file, size) = execute(move || {
            let meta = std::fs::metadata(&path)
                .map_err(|e| fs_util::scalar_error(e, &owned_name, &path))?;
            if meta.is_dir() {
                return Err(FsError::IsADirectory(owned_name));
            }
            let size = meta.len();
            if size < offset {
                return Err(FsError::OffsetTooLarge(format!(
                    "{}: offset {} exceeds file size {}",
                    owned_name, offset, size
                )));
            }
            let file = std::fs::File::open(&path)
                .map_err(|e| fs_util::scalar_error(e, &owned_name, &path))?;
            Ok((file, size))
        })
        .await?;

        let mut file = File::from_std(file);
        if offset > 0 {
            file.seek(SeekFrom::Start(offset))
                .await
                .map_err(|e| FsError::IoError(e.to_string()))?;
        }
        Ok(FileReader::new(
            file,
            self.reader_buffer_size,
            limit,
            size,
            self.stats.clone(),
        ))
    }

    /// Lists every file whose root-relative `/`-delimited name matches `glob`.
    /// The staging subtree is never listed. An empty glob matches nothing.
    pub async fn list(&self, glob: &str) -> FsResult<HashMap<String, FileMetadata>> {
        self.stats.list.record_start();
        let result = self.list_impl(glob).await;
        self.stats.list.record_result(&result);
        result
    }

    async fn list_impl(&self, glob: &str) -> FsResult<HashMap<String, FileMetadata>> {
        if glob.is_empty() {
            return Ok(HashMap::new());
        }
        let pattern =
            glob::Pattern::new(glob).map_err(|e| FsError::MalformedGlob(e.to_string()))?;
        let sub_dir = fs_util::extract_sub_dir(glob);
        let subdir = if sub_dir.is_empty() {
            self.storage.clone()
        } else {
            self.resolve(sub_dir.trim_end_matches(path_resolver::SEPARATOR))?
        };
        let storage = self.storage.clone();
        let temp_dir = self.temp_dir.clone();
        execute(move || {
            let entries = fs_util::find_matching(&storage, &temp_dir, &subdir, &pattern)
                .map_err(|e| FsError::IoError(e.to_string()))?;
            Ok(entries.into_iter().collect())
        })
        .await
    }

    /// Metadata of `name`, or `None` when it does not exist or is a directory.
    pub async fn info(&self, name: &str) -> FsResult<Option<FileMetadata>> {
        self.stats.info.record_start();
        let result = self.info_impl(name).await;
        self.stats.info.record_result(&result);
        result
    }

    async fn info_impl(&self, name: &str) -> FsResult<Option<FileMetadata>> {
        let path = self.resolve(name)?;
        let owned_name = name.to_string();
        execute(move || {
            fs_util::to_file_metadata(&path).map_err(|e| {
                warn!("failed to retrieve metadata for {}: {}", owned_name, e);
                FsError::IoError("failed to retrieve metadata".to_string())
            })
        })
        .await
    }

    /// Metadata for every present name of the set; absent names are omitted.
    pub async fn info_all(
        &self,
        names: HashSet<String>,
    ) -> FsResult<HashMap<String, FileMetadata>> {
        self.stats.info_all.record_start();
        let result = self.info_all_impl(names).await;
        self.stats.info_all.record_result(&result);
        result
    }

    async fn info_all_impl(
        &self,
        names: HashSet<String>,
    ) -> FsResult<HashMap<String, FileMetadata>> {
        if names.is_empty() {
            return Ok(HashMap::new());
        }
        let resolved = names
            .into_iter()
            .map(|name| self.resolve(&name).map(|path| (name, path)))
            .collect::<FsResult<Vec<_>>>()?;
        execute(move || {
            let mut result = HashMap::new();
            for (name, path) in resolved {
                let metadata = fs_util::to_file_metadata(&path).map_err(|e| {
                    warn!("failed to retrieve metadata for {}: {}", name, e);
                    FsError::IoError("failed to retrieve metadata".to_string())
                })?;
                if let Some(metadata) = metadata {
                    result.insert(name, metadata);
                }
            }
            Ok(result)
        })
        .await
    }

    pub async fn copy(&self, name: &str, target: &str) -> FsResult<()> {
        self.stats.copy.record_start();
        let result = self
            .transfer_all(single_pair(name, target), TransferKind::Copy)
            .await
            .map_err(BatchError::into_scalar);
        self.stats.copy.record_result(&result);
        result
    }

    /// Copies each source onto its target. Targets must be unique. Per-name
    /// failures are collected; the rest of the batch still runs.
    pub async fn copy_all(
        &self,
        source_to_target: HashMap<String, String>,
    ) -> Result<(), BatchError> {
        self.stats.copy_all.record_start();
        assert!(is_bijection(&source_to_target), "targets must be unique");
        if source_to_target.is_empty() {
            self.stats.copy_all.record_result::<(), ()>(&Ok(()));
            return Ok(());
        }
        let result = self.transfer_all(source_to_target, TransferKind::Copy).await;
        self.stats.copy_all.record_result(&result);
        result
    }

    pub async fn move_file(&self, name: &str, target: &str) -> FsResult<()> {
        self.stats.mv.record_start();
        let result = self
            .transfer_all(single_pair(name, target), TransferKind::Move)
            .await
            .map_err(BatchError::into_scalar);
        self.stats.mv.record_result(&result);
        result
    }

    /// Moves each source onto its target. Targets must be unique. Per-name
    /// failures are collected; sources of failed entries stay in place.
    pub async fn move_all(
        &self,
        source_to_target: HashMap<String, String>,
    ) -> Result<(), BatchError> {
        self.stats.mv_all.record_start();
        assert!(is_bijection(&source_to_target), "targets must be unique");
        if source_to_target.is_empty() {
            self.stats.mv_all.record_result::<(), ()>(&Ok(()));
            return Ok(());
        }
        let result = self.transfer_all(source_to_target, TransferKind::Move).await;
        self.stats.mv_all.record_result(&result);
        result
    }

    async fn transfer_all(
        &self,
        source_to_target: HashMap<String, String>,
        kind: TransferKind,
    ) -> Result<(), BatchError> {
        let storage = self.storage.clone();
        let temp_dir = self.temp_dir.clone();
        let synced = self.synced;
        let hardlink_on_copy = self.hardlink_on_copy;
        execute_batch(move || {
            let mut errors = HashMap::new();
            for (name, target_name) in source_to_target {
                if let Err(e) = transfer_one(
                    &storage,
                    &temp_dir,
                    synced,
                    hardlink_on_copy,
                    kind,
                    &name,
                    &target_name,
                ) {
                    errors.insert(name, e);
                }
            }
            if errors.is_empty() {
                Ok(())
            } else {
                Err(BatchError::new(errors))
            }
        })
        .await
    }

    /// Removes `name` if present. Removing a missing name succeeds; removing
    /// the storage root itself is a no-op.
    pub async fn delete(&self, name: &str) -> FsResult<()> {
        self.stats.delete.record_start();
        let mut names = HashSet::new();
        names.insert(name.to_string());
        let result = self
            .delete_impl(names)
            .await
            .map_err(BatchError::into_scalar);
        self.stats.delete.record_result(&result);
        result
    }

    pub async fn delete_all(&self, names: HashSet<String>) -> Result<(), BatchError> {
        self.stats.delete_all.record_start();
        if names.is_empty() {
            self.stats.delete_all.record_result::<(), ()>(&Ok(()));
            return Ok(());
        }
        let result = self.delete_impl(names).await;
        self.stats.delete_all.record_result(&result);
        result
    }

    async fn delete_impl(&self, names: HashSet<String>) -> Result<(), BatchError> {
        let storage = self.storage.clone();
        let temp_dir = self.temp_dir.clone();
        execute_batch(move || {
            let mut errors = HashMap::new();
            for name in names {
                if let Err(e) = delete_one(&storage, &temp_dir, &name) {
                    errors.insert(name, e);
                }
            }
            if errors.is_empty() {
                Ok(())
            } else {
                Err(BatchError::new(errors))
            }
        })
        .await
    }
}

/// Ships a blocking closure to the worker pool and resumes the caller with
/// its outcome.
async fn execute<T>(task: impl FnOnce() -> FsResult<T> + Send + 'static) -> FsResult<T>
where
    T: Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|e| FsError::IoError(format!("blocking task failed: {}", e)))?
}

async fn execute_batch(
    task: impl FnOnce() -> Result<(), BatchError> + Send + 'static,
) -> Result<(), BatchError> {
    match tokio::task::spawn_blocking(task).await {
        Ok(result) => result,
        Err(e) => Err(BatchError::single(
            String::new(),
            FsError::IoError(format!("blocking task failed: {}", e)),
        )),
    }
}

fn single_pair(name: &str, target: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    map.insert(name.to_string(), target.to_string());
    map
}

fn is_bijection(map: &HashMap<String, String>) -> bool {
    let mut seen = HashSet::with_capacity(map.len());
    map.values().all(|target| seen.insert(target))
}

fn open_for_append(path: &Path, create: bool, synced_append: bool) -> io::Result<std::fs::File> {
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(create);
    #[cfg(unix)]
    if synced_append {
        use std::os::unix::fs::OpenOptionsExt;
        options.custom_flags(libc::O_SYNC);
    }
    #[cfg(not(unix))]
    let _ = synced_append;
    options.open(path)
}

fn transfer_one(
    storage: &Path,
    temp_dir: &Path,
    synced: bool,
    hardlink_on_copy: bool,
    kind: TransferKind,
    name: &str,
    target_name: &str,
) -> FsResult<()> {
    let path = path_resolver::resolve(storage, temp_dir, name)?;
    let meta = std::fs::metadata(&path).map_err(|e| fs_util::scalar_error(e, name, &path))?;
    if meta.is_dir() {
        return Err(FsError::IsADirectory(name.to_string()));
    }
    let target = path_resolver::resolve(storage, temp_dir, target_name)?;
    if path == target {
        fs_util::touch(&path, fs_util::current_time_ms())
            .map_err(|e| fs_util::scalar_error(e, name, &path))?;
        if synced {
            fs_util::try_fsync(&path);
        }
        return Ok(());
    }
    match kind {
        TransferKind::Move => fs_util::ensure_target(Some(&path), &target, storage, synced, || {
            fs_util::move_via_hardlink(&path, &target, fs_util::current_time_ms())
        }),
        TransferKind::Copy => copy_one(storage, temp_dir, synced, hardlink_on_copy, &path, &target),
    }
}

fn copy_one(
    storage: &Path,
    temp_dir: &Path,
    synced: bool,
    hardlink_on_copy: bool,
    path: &Path,
    target: &Path,
) -> FsResult<()> {
    let staged_copy = || {
        fs_util::ensure_target(Some(path), target, storage, synced, || {
            fs_util::copy_via_temp_dir(path, target, fs_util::current_time_ms(), temp_dir, synced)
        })
    };

    if !hardlink_on_copy {
        return staged_copy();
    }

    let linked = fs_util::ensure_target(Some(path), target, storage, synced, || {
        fs_util::copy_via_hardlink(path, target)
    });
    match linked {
        Ok(()) => Ok(()),
        Err(link_err) => {
            warn!(
                "could not copy {} via hardlink ({}), copying via temp dir",
                path.display(),
                link_err
            );
            staged_copy().map_err(|e| match e {
                FsError::IoError(msg) => {
                    FsError::IoError(format!("{}; hardlink copy failed first: {}", msg, link_err))
                }
                other => other,
            })
        }
    }
}

fn delete_one(storage: &Path, temp_dir: &Path, name: &str) -> FsResult<()> {
    let path = path_resolver::resolve(storage, temp_dir, name)?;
    // the storage root itself is never deleted
    if path == storage {
        return Ok(());
    }
    match std::fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(fs_util::scalar_error(e, name, &path)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn new_store() -> (TempDir, LocalFileStore) {
        let root = TempDir::new().unwrap();
        let store = LocalFileStore::new(root.path().join("store"));
        store.start().await.unwrap();
        (root, store)
    }

    async fn put(store: &LocalFileStore, name: &str, bytes: &[u8]) {
        let mut writer = store.upload(name).await.unwrap();
        writer.write_all(bytes).await.unwrap();
        writer.finish().await.unwrap();
    }

    async fn read_all(reader: &mut FileReader) -> Vec<u8> {
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes).await.unwrap();
        bytes
    }

    #[tokio::test]
    async fn test_upload_then_download() {
        let (_root, store) = new_store().await;
        put(&store, "a/b.txt", &[0x01, 0x02, 0x03]).await;

        let info = store.info("a/b.txt").await.unwrap().unwrap();
        assert_eq!(info.size, 3);

        let mut reader = store.download("a/b.txt", 1, 10).await.unwrap();
        assert_eq!(reader.size(), 3);
        assert_eq!(read_all(&mut reader).await, vec![0x02, 0x03]);
    }

    #[tokio::test]
    async fn test_upload_replaces_existing_content() {
        let (_root, store) = new_store().await;
        put(&store, "doc.txt", b"old contents").await;
        put(&store, "doc.txt", b"new").await;

        let mut reader = store.download("doc.txt", 0, u64::MAX).await.unwrap();
        assert_eq!(read_all(&mut reader).await, b"new");
    }

    #[tokio::test]
    async fn test_upload_forbidden_traversal() {
        let (_root, store) = new_store().await;
        let err = store.upload("../escape").await.unwrap_err();
        assert!(err.is_forbidden());

        let err = store.upload(".upload/staged").await.unwrap_err();
        assert!(err.is_forbidden());
    }

    #[tokio::test]
    async fn test_sized_upload_mismatch_publishes_nothing() {
        let (_root, store) = new_store().await;

        let mut writer = store.upload_sized("fixed.bin", 5).await.unwrap();
        writer.write_all(b"ab").await.unwrap();
        let err = writer.finish().await.unwrap_err();
        assert!(matches!(err, FsError::UnexpectedSize(_)));
        assert!(store.info("fixed.bin").await.unwrap().is_none());

        let mut writer = store.upload_sized("fixed.bin", 2).await.unwrap();
        writer.write_all(b"toolong").await.unwrap_err();
        let err = writer.finish().await.unwrap_err();
        assert!(matches!(err, FsError::UnexpectedSize(_)));
        assert!(store.info("fixed.bin").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sized_upload_exact() {
        let (_root, store) = new_store().await;
        let mut writer = store.upload_sized("fixed.bin", 4).await.unwrap();
        writer.write_all(b"1234").await.unwrap();
        writer.finish().await.unwrap();
        assert_eq!(store.info("fixed.bin").await.unwrap().unwrap().size, 4);
    }

    #[tokio::test]
    async fn test_aborted_upload_leaves_no_file() {
        let (_root, store) = new_store().await;
        let mut writer = store.upload("half.bin").await.unwrap();
        writer.write_all(b"partial bytes").await.unwrap();
        writer.abort().await;

        assert!(store.info("half.bin").await.unwrap().is_none());
        assert!(store.list("**").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_append_creates_at_offset_zero() {
        let (_root, store) = new_store().await;
        let mut writer = store.append("log.txt", 0).await.unwrap();
        writer.write_all(b"hello").await.unwrap();
        writer.finish().await.unwrap();

        let mut writer = store.append("log.txt", 5).await.unwrap();
        writer.write_all(b" world").await.unwrap();
        writer.finish().await.unwrap();

        let mut reader = store.download("log.txt", 0, u64::MAX).await.unwrap();
        assert_eq!(read_all(&mut reader).await, b"hello world");
    }

    #[tokio::test]
    async fn test_append_overwrites_mid_file() {
        let (_root, store) = new_store().await;
        put(&store, "data.txt", b"abcdef").await;

        let mut writer = store.append("data.txt", 2).await.unwrap();
        writer.write_all(b"XY").await.unwrap();
        writer.finish().await.unwrap();

        let mut reader = store.download("data.txt", 0, u64::MAX).await.unwrap();
        assert_eq!(read_all(&mut reader).await, b"abXYef");
    }

    #[tokio::test]
    async fn test_append_offset_beyond_size() {
        let (_root, store) = new_store().await;
        put(&store, "small.txt", b"ab").await;

        let err = store.append("small.txt", 3).await.unwrap_err();
        assert!(matches!(err, FsError::OffsetTooLarge(_)));
    }

    #[tokio::test]
    async fn test_append_missing_file_at_nonzero_offset() {
        let (_root, store) = new_store().await;
        let err = store.append("absent.txt", 1).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_download_errors() {
        let (_root, store) = new_store().await;
        put(&store, "dir/file.txt", b"x").await;

        let err = store.download("absent.txt", 0, u64::MAX).await.unwrap_err();
        assert!(err.is_not_found());

        let err = store.download("dir", 0, u64::MAX).await.unwrap_err();
        assert!(matches!(err, FsError::IsADirectory(_)));

        let err = store.download("dir/file.txt", 2, u64::MAX).await.unwrap_err();
        assert!(matches!(err, FsError::OffsetTooLarge(_)));
    }

    #[tokio::test]
    async fn test_download_limit_and_offset() {
        let (_root, store) = new_store().await;
        put(&store, "seq.bin", &(0u8..100).collect::<Vec<_>>()).await;

        let mut reader = store.download("seq.bin", 10, 5).await.unwrap();
        assert_eq!(read_all(&mut reader).await, vec![10, 11, 12, 13, 14]);

        // limit larger than the remainder stops at EOF
        let mut reader = store.download("seq.bin", 95, 50).await.unwrap();
        assert_eq!(read_all(&mut reader).await, vec![95, 96, 97, 98, 99]);
    }

    #[tokio::test]
    async fn test_info_on_directory_is_absent() {
        let (_root, store) = new_store().await;
        put(&store, "sub/inner.txt", b"x").await;
        assert!(store.info("sub").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_info_all_skips_absent_names() {
        let (_root, store) = new_store().await;
        put(&store, "one.txt", b"1").await;
        put(&store, "two.txt", b"22").await;

        let names: HashSet<String> = ["one.txt", "two.txt", "three.txt"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let infos = store.info_all(names).await.unwrap();
        assert_eq!(infos.len(), 2);
        assert_eq!(infos["one.txt"].size, 1);
        assert_eq!(infos["two.txt"].size, 2);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let (_root, store) = new_store().await;
        put(&store, "victim.txt", b"x").await;

        store.delete("victim.txt").await.unwrap();
        assert!(store.info("victim.txt").await.unwrap().is_none());
        store.delete("victim.txt").await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_directory_fails() {
        let (_root, store) = new_store().await;
        put(&store, "dir/inner.txt", b"x").await;

        let err = store.delete("dir").await.unwrap_err();
        assert!(matches!(err, FsError::IsADirectory(name) if name == "dir"));
    }

    #[tokio::test]
    async fn test_delete_storage_root_is_noop() {
        let (_root, store) = new_store().await;
        put(&store, "keep.txt", b"x").await;

        store.delete(".").await.unwrap();
        assert!(store.info("keep.txt").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_append_counters_are_dedicated() {
        let (_root, store) = new_store().await;
        let stats = store.stats();

        let mut writer = store.append("log.txt", 0).await.unwrap();
        writer.write_all(b"x").await.unwrap();
        writer.finish().await.unwrap();

        assert_eq!(stats.append_begin.started(), 1);
        assert_eq!(stats.append_begin.completed(), 1);
        assert_eq!(stats.append_finish.completed(), 1);
        assert_eq!(stats.upload_begin.started(), 0);
        assert_eq!(stats.upload_finish.started(), 0);
    }

    #[tokio::test]
    async fn test_ping() {
        let (_root, store) = new_store().await;
        store.ping().await.unwrap();
        store.stop().await.unwrap();
    }
}
