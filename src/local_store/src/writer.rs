use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tempfile::TempPath;
use tokio::fs::File;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::fs_util;
use crate::stats::StoreStats;
use crate::{FsError, FsResult};

async fn sync_tolerating_unsupported(file: &File) -> io::Result<()> {
    match file.sync_all().await {
        Err(e) if e.kind() == io::ErrorKind::Unsupported => Ok(()),
        other => other,
    }
}

/// Upload sink channel.
///
/// Bytes are streamed into a staging file below the store's temp dir. Nothing
/// is visible under the logical name until [`finish`](Self::finish) succeeds,
/// which atomically moves the staged bytes onto the target. Dropping the
/// writer without finishing cancels the upload and unlinks the staging file
/// best-effort, off the event loop.
#[derive(Debug)]
pub struct UploadWriter {
    file: Option<File>,
    staging: Option<TempPath>,
    target: PathBuf,
    name: String,
    storage: PathBuf,
    synced: bool,
    expected_size: Option<u64>,
    written: u64,
    oversized: bool,
    stats: Arc<StoreStats>,
}

impl UploadWriter {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        file: File,
        staging: TempPath,
        target: PathBuf,
        name: String,
        storage: PathBuf,
        synced: bool,
        expected_size: Option<u64>,
        stats: Arc<StoreStats>,
    ) -> Self {
        Self {
            file: Some(file),
            staging: Some(staging),
            target,
            name,
            storage,
            synced,
            expected_size,
            written: 0,
            oversized: false,
            stats,
        }
    }

    /// Bytes accepted so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Acknowledges the upload: flushes, optionally fsyncs, and publishes the
    /// staged bytes under the logical name. On failure the staging file is
    /// removed and the target is left untouched.
    pub async fn finish(mut self) -> FsResult<()> {
        self.stats.upload_finish.record_start();
        let result = self.finish_inner().await;
        self.stats.upload_finish.record_result(&result);
        result
    }

    async fn finish_inner(&mut self) -> FsResult<()> {
        if let Some(expected) = self.expected_size {
            if self.oversized {
                return Err(FsError::UnexpectedSize(format!(
                    "{}: more than the declared {} bytes were offered",
                    self.name, expected
                )));
            }
            if self.written != expected {
                return Err(FsError::UnexpectedSize(format!(
                    "{}: expected {} bytes, got {}",
                    self.name, expected, self.written
                )));
            }
        }

        let mut file = self
            .file
            .take()
            .ok_or_else(|| FsError::IoError("upload channel already closed".to_string()))?;
        file.flush()
            .await
            .map_err(|e| FsError::IoError(e.to_string()))?;
        if self.synced {
            sync_tolerating_unsupported(&file)
                .await
                .map_err(|e| FsError::IoError(e.to_string()))?;
        }
        // close the staging handle before the rename
        drop(file);

        let staging = self
            .staging
            .take()
            .ok_or_else(|| FsError::IoError("upload channel already closed".to_string()))?;
        let target = self.target.clone();
        let storage = self.storage.clone();
        let synced = self.synced;
        tokio::task::spawn_blocking(move || publish_staging(staging, &target, &storage, synced))
            .await
            .map_err(|e| FsError::IoError(format!("blocking task failed: {}", e)))?
    }

    /// Cancels the upload and removes the staging file.
    pub async fn abort(mut self) {
        self.file.take();
        if let Some(staging) = self.staging.take() {
            let _ = tokio::task::spawn_blocking(move || drop(staging)).await;
        }
    }
}

fn publish_staging(
    staging: TempPath,
    target: &std::path::Path,
    storage: &std::path::Path,
    synced: bool,
) -> FsResult<()> {
    let staging_path = staging.to_path_buf();
    let result = fs_util::ensure_target(Some(&staging_path), target, storage, synced, || {
        fs_util::move_via_hardlink(&staging_path, target, fs_util::current_time_ms())
    });
    match result {
        Ok(()) => {
            // the path was renamed away; disarm the auto-unlink
            let _ = staging.keep();
            Ok(())
        }
        Err(e) => {
            drop(staging);
            Err(e)
        }
    }
}

impl AsyncWrite for UploadWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if let Some(expected) = this.expected_size {
            if this.written + buf.len() as u64 > expected {
                // rejected here at the channel level; the acknowledgement
                // reports it as an unexpected size
                this.oversized = true;
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("upload exceeds declared size of {} bytes", expected),
                )));
            }
        }
        let file = match this.file.as_mut() {
            Some(file) => file,
            None => return Poll::Ready(Err(closed())),
        };
        match Pin::new(file).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                this.written += n as u64;
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.file.as_mut() {
            Some(file) => Pin::new(file).poll_flush(cx),
            None => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.file.as_mut() {
            Some(file) => Pin::new(file).poll_shutdown(cx),
            None => Poll::Ready(Ok(())),
        }
    }
}

impl Drop for UploadWriter {
    fn drop(&mut self) {
        if let Some(staging) = self.staging.take() {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    let _ = handle.spawn_blocking(move || drop(staging));
                }
                Err(_) => drop(staging),
            }
        }
    }
}

/// Append sink channel, positioned at the requested offset.
#[derive(Debug)]
pub struct AppendWriter {
    file: Option<File>,
    name: String,
    force_on_close: bool,
    stats: Arc<StoreStats>,
}

impl AppendWriter {
    pub(crate) fn new(file: File, name: String, force_on_close: bool, stats: Arc<StoreStats>) -> Self {
        Self {
            file: Some(file),
            name,
            force_on_close,
            stats,
        }
    }

    /// Closes the channel. When the store is synced but the handle was not
    /// opened with the synchronous-write flag, data is forced to the device
    /// here.
    pub async fn finish(mut self) -> FsResult<()> {
        self.stats.append_finish.record_start();
        let result = self.finish_inner().await;
        self.stats.append_finish.record_result(&result);
        result
    }

    async fn finish_inner(&mut self) -> FsResult<()> {
        let mut file = self
            .file
            .take()
            .ok_or_else(|| FsError::IoError("append channel already closed".to_string()))?;
        file.flush()
            .await
            .map_err(|e| FsError::IoError(format!("{}: {}", self.name, e)))?;
        if self.force_on_close {
            sync_tolerating_unsupported(&file)
                .await
                .map_err(|e| FsError::IoError(format!("{}: {}", self.name, e)))?;
        }
        Ok(())
    }
}

impl AsyncWrite for AppendWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match this.file.as_mut() {
            Some(file) => Pin::new(file).poll_write(cx, buf),
            None => Poll::Ready(Err(closed())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.file.as_mut() {
            Some(file) => Pin::new(file).poll_flush(cx),
            None => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.file.as_mut() {
            Some(file) => Pin::new(file).poll_shutdown(cx),
            None => Poll::Ready(Ok(())),
        }
    }
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "channel is closed")
}
