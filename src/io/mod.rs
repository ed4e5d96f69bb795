mod buffer;
mod http;
mod local;

pub use buffer::BufferReader;
pub use http::{HttpRangeReader, HttpSource};
pub use local::LocalFileReader;

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::error::{ArchiveError, Result};

/// A `{offset, length}` request. `length: None` reads to the end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub offset: u64,
    pub length: Option<u64>,
}

impl ByteRange {
    pub fn new(offset: u64, length: u64) -> Self {
        Self {
            offset,
            length: Some(length),
        }
    }

    pub fn to_end(offset: u64) -> Self {
        Self { offset, length: None }
    }

    /// Clamp against a resource of `size` bytes, returning the inclusive end,
    /// or `None` when nothing is left to read.
    pub fn clamp(&self, size: u64) -> Option<(u64, u64)> {
        if self.offset >= size || self.length == Some(0) {
            return None;
        }
        let end = match self.length {
            Some(len) => self.offset.saturating_add(len).min(size),
            None => size,
        };
        Some((self.offset, end - 1))
    }
}

/// Random access reads from a data source.
#[async_trait]
pub trait ReadAt: Send + Sync {
    /// Read the requested range, clamped to the end of the source.
    ///
    /// Fails with `Cancelled` as soon as `cancel` fires.
    async fn read_range(&self, range: ByteRange, cancel: &CancellationToken) -> Result<Bytes>;

    /// Get the total size of the data source
    fn size(&self) -> u64;
}

/// Run `fut` unless `cancel` fires first. Dropping `fut` aborts whatever
/// transfer it was driving.
pub(crate) async fn cancellable<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ArchiveError::Cancelled),
        res = fut => res,
    }
}

/// Network accounting for one source.
#[derive(Debug, Default)]
pub struct TransferStats {
    bytes: AtomicU64,
    requests: AtomicU64,
}

impl TransferStats {
    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub(crate) fn add_bytes(&self, n: u64) {
        self.bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }
}
