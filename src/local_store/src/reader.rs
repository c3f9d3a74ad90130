use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::fs::File;
use tokio::io::{AsyncRead, BufReader, ReadBuf};

use crate::stats::StoreStats;

/// Download channel: a buffered, bounded reader over an open file.
///
/// At most `limit` bytes are produced; reads beyond the end of the file stop
/// at EOF. The end-of-stream (or the first read error) is reported to the
/// store's download counters exactly once.
#[derive(Debug)]
pub struct FileReader {
    inner: BufReader<File>,
    remaining: u64,
    size: u64,
    stats: Arc<StoreStats>,
    finished: bool,
}

impl FileReader {
    pub(crate) fn new(
        file: File,
        buffer_size: usize,
        limit: u64,
        size: u64,
        stats: Arc<StoreStats>,
    ) -> Self {
        stats.download_finish.record_start();
        Self {
            inner: BufReader::with_capacity(buffer_size, file),
            remaining: limit,
            size,
            stats,
            finished: false,
        }
    }

    /// Total size of the underlying file in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    fn record_end(&mut self, result: Result<(), ()>) {
        if !self.finished {
            self.finished = true;
            self.stats.download_finish.record_result(&result);
        }
    }
}

impl AsyncRead for FileReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if this.remaining == 0 {
            this.record_end(Ok(()));
            return Poll::Ready(Ok(()));
        }

        let max_to_read = buf.remaining().min(this.remaining.min(usize::MAX as u64) as usize);
        if max_to_read == 0 {
            return Poll::Ready(Ok(()));
        }

        let mut limited = ReadBuf::new(&mut buf.initialize_unfilled()[..max_to_read]);
        match Pin::new(&mut this.inner).poll_read(cx, &mut limited) {
            Poll::Ready(Ok(())) => {
                let filled = limited.filled().len();
                buf.advance(filled);
                this.remaining -= filled as u64;
                if filled == 0 || this.remaining == 0 {
                    this.record_end(Ok(()));
                }
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(e)) => {
                this.record_end(Err(()));
                Poll::Ready(Err(e))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
