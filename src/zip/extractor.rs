use std::io::Read;
use std::sync::Arc;

use bytes::Bytes;
use flate2::read::DeflateDecoder;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::entry::{ArchiveEntry, EntryHandle};
use crate::error::{ArchiveError, Result};
use crate::io::{ByteRange, ReadAt};

use super::parser::local_data_offset;
use super::structures::{CompressionMethod, LFH_SIZE};

/// Single-entry ZIP extraction.
///
/// Only the entry's Local File Header and compressed data are read; the
/// central directory is never revisited.
pub struct ZipExtractor<R: ReadAt + ?Sized> {
    reader: Arc<R>,
}

impl<R: ReadAt + ?Sized> ZipExtractor<R> {
    pub fn new(reader: Arc<R>) -> Self {
        Self { reader }
    }

    /// Extract file data to memory
    pub async fn extract_to_memory(
        &self,
        entry: &ArchiveEntry,
        cancel: &CancellationToken,
    ) -> Result<Bytes> {
        let EntryHandle::Zip {
            local_header_offset,
            method,
            crc32,
            encrypted,
            header_hint,
        } = entry.handle
        else {
            return Err(ArchiveError::Unsupported(format!(
                "{} has no ZIP data",
                entry.filename
            )));
        };

        if entry.directory {
            return Err(ArchiveError::Unsupported(format!(
                "{} is a directory",
                entry.filename
            )));
        }
        if encrypted {
            return Err(ArchiveError::Unsupported(format!(
                "{} is encrypted",
                entry.filename
            )));
        }
        if let CompressionMethod::Unknown(m) = method {
            return Err(ArchiveError::Unsupported(format!(
                "compression method {m} for {}",
                entry.filename
            )));
        }

        let compressed_size = entry.compressed_size;

        // One speculative read: the local header usually repeats the
        // central directory's name and extra field.
        let guess = LFH_SIZE as u64 + header_hint + compressed_size;
        let head = self
            .reader
            .read_range(ByteRange::new(local_header_offset, guess), cancel)
            .await?;
        let data_start = local_data_offset(&head)?;

        let data = match data_start.checked_add(compressed_size) {
            Some(end) if end <= head.len() as u64 => head.slice(data_start as usize..end as usize),
            _ => {
                debug!(name = %entry.filename, "local header larger than expected, second read");
                self.reader
                    .read_range(
                        ByteRange::new(local_header_offset + data_start, compressed_size),
                        cancel,
                    )
                    .await?
            }
        };

        if (data.len() as u64) < compressed_size {
            return Err(ArchiveError::malformed(format!(
                "{} is truncated",
                entry.filename
            )));
        }

        let out = decompress(method, data, entry.uncompressed_size)?;

        let mut crc = flate2::Crc::new();
        crc.update(&out);
        if crc.sum() != crc32 {
            return Err(ArchiveError::malformed(format!(
                "CRC mismatch for {}",
                entry.filename
            )));
        }

        Ok(out)
    }
}

fn decompress(method: CompressionMethod, data: Bytes, uncompressed_size: u64) -> Result<Bytes> {
    match method {
        CompressionMethod::Stored => Ok(data),
        CompressionMethod::Deflate => {
            let mut out = Vec::with_capacity(uncompressed_size.min(64 << 20) as usize);
            DeflateDecoder::new(&data[..])
                .read_to_end(&mut out)
                .map_err(|e| ArchiveError::malformed(format!("deflate stream: {e}")))?;
            Ok(Bytes::from(out))
        }
        CompressionMethod::Unknown(m) => Err(ArchiveError::Unsupported(format!(
            "compression method {m}"
        ))),
    }
}
