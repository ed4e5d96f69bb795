//! Incremental gzip decoding feeding the TAR scanner.
//!
//! `.tar.gz` cannot be read at random: TAR offsets exist only in
//! decompressed space. [`GzipTarStream`] accepts compressed chunks as they
//! arrive, inflates them, hands newly completed TAR entries back and also
//! returns the decompressed bytes so the caller can keep them for later
//! extraction.
//!
//! Concatenated gzip members (pigz, bgzip) decode as one stream.

use std::io::{Read, Write};

use bytes::Bytes;
use flate2::read::MultiGzDecoder as MultiGzReader;
use flate2::write::MultiGzDecoder;
use tracing::debug;

use crate::entry::ArchiveEntry;
use crate::error::{ArchiveError, Result};
use crate::tar::TarStreamFeeder;

/// What one compressed chunk produced.
#[derive(Debug, Default)]
pub struct GzipProgress {
    pub entries: Vec<ArchiveEntry>,
    pub decompressed: Bytes,
}

/// Streaming inflate + TAR scan.
pub struct GzipTarStream {
    decoder: MultiGzDecoder<Vec<u8>>,
    feeder: TarStreamFeeder,
    decompressed_total: u64,
}

impl Default for GzipTarStream {
    fn default() -> Self {
        Self::new()
    }
}

impl GzipTarStream {
    pub fn new() -> Self {
        Self {
            decoder: MultiGzDecoder::new(Vec::new()),
            feeder: TarStreamFeeder::new(),
            decompressed_total: 0,
        }
    }

    /// Total decompressed bytes produced so far.
    pub fn decompressed_total(&self) -> u64 {
        self.decompressed_total
    }

    /// Feed the next compressed chunk.
    pub fn push(&mut self, mut compressed: &[u8]) -> Result<GzipProgress> {
        while !compressed.is_empty() {
            let n = self.decoder.write(compressed).map_err(gzip_error)?;
            if n == 0 {
                debug!(ignored = compressed.len(), "gzip decoder accepted no more input");
                break;
            }
            compressed = &compressed[n..];
        }

        self.decoder.flush().map_err(gzip_error)?;
        self.drain()
    }

    /// Signal end of input: verifies the gzip trailer and flushes the scanner.
    pub fn finish(&mut self) -> Result<GzipProgress> {
        self.decoder.try_finish().map_err(gzip_error)?;
        let progress = self.drain()?;
        self.feeder.finish();
        Ok(progress)
    }

    fn drain(&mut self) -> Result<GzipProgress> {
        let out = std::mem::take(self.decoder.get_mut());
        if out.is_empty() {
            return Ok(GzipProgress::default());
        }
        self.decompressed_total += out.len() as u64;
        let entries = self.feeder.feed(&out)?;
        Ok(GzipProgress {
            entries,
            decompressed: Bytes::from(out),
        })
    }
}

/// Inflate a whole gzip buffer in memory.
pub fn decompress_all(compressed: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(compressed.len().saturating_mul(4));
    MultiGzReader::new(compressed)
        .read_to_end(&mut out)
        .map_err(gzip_error)?;
    Ok(out)
}

fn gzip_error(err: std::io::Error) -> ArchiveError {
    ArchiveError::malformed(format!("gzip: {err}"))
}
