mod file_store;
mod fs_util;
mod path_resolver;
mod reader;
mod stats;
mod writer;


pub use file_store::{LocalFileStore, LocalStoreConfig};
pub use fs_util::FileMetadata;
pub use reader::FileReader;
pub use stats::{OpStats, StoreStats};
pub use writer::{AppendWriter, UploadWriter};

use once_cell::sync::Lazy;
use std::collections::HashMap;
use thiserror::Error;

/// Staging directory created under the storage root. Logical names are never
/// allowed to resolve into it.
pub const DEFAULT_TEMP_DIR: &str = ".upload";

/// Block size used by download channels.
pub const DEFAULT_READER_BUFFER_SIZE: usize = 256 * 1024;

/// Process-wide default for `synced`, read once from the environment.
pub static DEFAULT_SYNCED: Lazy<bool> = Lazy::new(|| env_flag("LOCAL_STORE_SYNCED"));

/// Process-wide default for `synced_append`, read once from the environment.
pub static DEFAULT_SYNCED_APPEND: Lazy<bool> = Lazy::new(|| env_flag("LOCAL_STORE_SYNCED_APPEND"));

fn env_flag(key: &str) -> bool {
    std::env::var(key)
        .map(|v| {
            let v = v.trim();
            v.eq_ignore_ascii_case("true") || v == "1"
        })
        .unwrap_or(false)
}

#[derive(Error, Debug)]
pub enum FsError {
    #[error("forbidden path: {0}")]
    ForbiddenPath(String),
    #[error("file not found: {0}")]
    NotFound(String),
    #[error("path is a directory: {0}")]
    IsADirectory(String),
    #[error("path contains a regular file: {0}")]
    PathContainsFile(String),
    #[error("offset too large: {0}")]
    OffsetTooLarge(String),
    #[error("unexpected size: {0}")]
    UnexpectedSize(String),
    #[error("malformed glob: {0}")]
    MalformedGlob(String),
    #[error("I/O error: {0}")]
    IoError(String),
}

impl FsError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, FsError::NotFound(_))
    }

    pub fn is_forbidden(&self) -> bool {
        matches!(self, FsError::ForbiddenPath(_))
    }
}

pub type FsResult<T> = std::result::Result<T, FsError>;

impl From<std::io::Error> for FsError {
    fn from(err: std::io::Error) -> Self {
        FsError::IoError(err.to_string())
    }
}

/// Per-name failures of a multi-key operation. Deliberately not an [`FsError`]
/// variant: scalar and batch failures are different shapes.
#[derive(Error, Debug)]
#[error("batch operation failed for {} name(s)", .errors.len())]
pub struct BatchError {
    pub errors: HashMap<String, FsError>,
}

impl BatchError {
    pub fn new(errors: HashMap<String, FsError>) -> Self {
        Self { errors }
    }

    pub fn single(name: impl Into<String>, error: FsError) -> Self {
        let mut errors = HashMap::new();
        errors.insert(name.into(), error);
        Self { errors }
    }

    /// Unwraps the batch produced by a single-key convenience call back into
    /// its scalar error.
    pub fn into_scalar(mut self) -> FsError {
        debug_assert_eq!(self.errors.len(), 1);
        let key = self.errors.keys().next().cloned();
        match key.and_then(|k| self.errors.remove(&k)) {
            Some(e) => e,
            None => FsError::IoError("empty batch error".to_string()),
        }
    }
}
