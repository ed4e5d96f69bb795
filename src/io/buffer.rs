use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use super::{ByteRange, ReadAt};
use crate::error::{ArchiveError, Result};

/// In-memory source. Reads are zero-copy slices of the buffer.
#[derive(Debug, Clone)]
pub struct BufferReader {
    data: Bytes,
}

impl BufferReader {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }

    pub fn bytes(&self) -> &Bytes {
        &self.data
    }
}

#[async_trait]
impl ReadAt for BufferReader {
    async fn read_range(&self, range: ByteRange, cancel: &CancellationToken) -> Result<Bytes> {
        if cancel.is_cancelled() {
            return Err(ArchiveError::Cancelled);
        }
        Ok(match range.clamp(self.size()) {
            Some((start, end)) => self.data.slice(start as usize..=end as usize),
            None => Bytes::new(),
        })
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }
}
