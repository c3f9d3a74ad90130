use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for one public operation.
#[derive(Debug, Default)]
pub struct OpStats {
    started: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

impl OpStats {
    pub(crate) fn record_start(&self) {
        self.started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_result<T, E>(&self, result: &Result<T, E>) {
        match result {
            Ok(_) => self.completed.fetch_add(1, Ordering::Relaxed),
            Err(_) => self.failed.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub fn started(&self) -> u64 {
        self.started.load(Ordering::Relaxed)
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

/// Per-operation counters exposed by the store. Begin/finish pairs track the
/// two phases of channel-based operations: opening the channel and the
/// acknowledgement or end-of-stream.
///
/// Append has its own counters; they are never aliased to the upload ones.
#[derive(Debug, Default)]
pub struct StoreStats {
    pub upload_begin: OpStats,
    pub upload_finish: OpStats,
    pub append_begin: OpStats,
    pub append_finish: OpStats,
    pub download_begin: OpStats,
    pub download_finish: OpStats,
    pub list: OpStats,
    pub info: OpStats,
    pub info_all: OpStats,
    pub copy: OpStats,
    pub copy_all: OpStats,
    pub mv: OpStats,
    pub mv_all: OpStats,
    pub delete: OpStats,
    pub delete_all: OpStats,
}
