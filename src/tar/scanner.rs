//! Sequential TAR header walking.
//!
//! [`TarScanner`] is a plain-data state machine: it says which bytes it
//! needs next ([`Need`]) and is handed them by a driver. Three drivers share
//! it: range reads ([`RemoteTarScanner`]), a resident buffer
//! ([`scan_buffer`]) and a stream of decompressed chunks ([`TarStreamFeeder`]).

use std::sync::Arc;

use chrono::DateTime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::header::*;
use crate::entry::{ArchiveEntry, EntryHandle};
use crate::error::{ArchiveError, Result};
use crate::io::{ByteRange, ReadAt};

/// Longest extension body (long name / PAX record set) accepted.
const MAX_EXTENSION_SIZE: u64 = 1 << 20;

/// The next span of archive bytes the scanner wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Need {
    Header { offset: u64 },
    Extension { offset: u64, len: u64 },
    Done,
}

impl Need {
    /// `(offset, len)` of the span, or `None` once scanning is over.
    pub fn span(&self) -> Option<(u64, u64)> {
        match *self {
            Need::Header { offset } => Some((offset, BLOCK_SIZE)),
            Need::Extension { offset, len } => Some((offset, len)),
            Need::Done => None,
        }
    }
}

#[derive(Debug, Clone)]
struct PendingExtension {
    typeflag: u8,
    offset: u64,
    len: u64,
}

/// Resumable TAR scanning state.
#[derive(Debug, Clone, Default)]
pub struct TarScanner {
    /// Offset of the next header block.
    cursor: u64,
    pending: Option<PendingExtension>,
    long_name: Option<String>,
    pax_path: Option<String>,
    pax_size: Option<u64>,
    pax_mtime: Option<i64>,
    /// Archive length, when the driver knows it.
    limit: Option<u64>,
    done: bool,
}

impl TarScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// A scanner for an archive of exactly `len` bytes. Entries whose data
    /// would run past the end are rejected.
    pub fn with_limit(len: u64) -> Self {
        Self {
            limit: Some(len),
            ..Self::default()
        }
    }

    /// Offset just past `len` bytes of data starting at `data_offset`,
    /// rounded up to whole blocks.
    fn span_end(&self, data_offset: u64, len: u64) -> Result<u64> {
        if let Some(limit) = self.limit {
            if data_offset.checked_add(len).is_none_or(|end| end > limit) {
                return Err(ArchiveError::malformed(format!(
                    "TAR entry at {data_offset} claims {len} bytes, past the end of the archive"
                )));
            }
        }
        data_offset
            .checked_add(padded_size(len)?)
            .ok_or_else(|| ArchiveError::malformed("TAR offset overflow"))
    }

    pub fn need(&self) -> Need {
        if self.done {
            Need::Done
        } else if let Some(ext) = &self.pending {
            Need::Extension {
                offset: ext.offset,
                len: ext.len,
            }
        } else {
            Need::Header {
                offset: self.cursor,
            }
        }
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// The resource ended before the scanner was done.
    pub fn finish(&mut self) {
        if !self.done {
            debug!(cursor = self.cursor, "TAR ended without terminator blocks");
        }
        self.done = true;
        self.pending = None;
    }

    /// Consume the header block requested by [`Need::Header`].
    pub fn on_header(&mut self, block: &[u8]) -> Result<Option<ArchiveEntry>> {
        let Some(header) = TarHeader::parse(block)? else {
            trace!(offset = self.cursor, "zero block, end of archive");
            self.done = true;
            return Ok(None);
        };

        let data_offset = self
            .cursor
            .checked_add(BLOCK_SIZE)
            .ok_or_else(|| ArchiveError::malformed("TAR offset overflow"))?;

        if header.is_extension() {
            self.cursor = self.span_end(data_offset, header.size)?;
            // Long link targets, global PAX and volume labels are skipped unread.
            if matches!(header.typeflag, TYPE_GNU_LONGNAME | TYPE_PAX_LOCAL) {
                if header.size > MAX_EXTENSION_SIZE {
                    return Err(ArchiveError::malformed(format!(
                        "TAR extension header of {} bytes",
                        header.size
                    )));
                }
                self.pending = Some(PendingExtension {
                    typeflag: header.typeflag,
                    offset: data_offset,
                    len: header.size,
                });
            }
            return Ok(None);
        }

        let directory = header.is_directory();
        let name = self
            .pax_path
            .take()
            .or_else(|| self.long_name.take())
            .unwrap_or(header.name);
        self.long_name = None;
        let size = self.pax_size.take().unwrap_or(header.size);
        let mtime = self.pax_mtime.take().unwrap_or(header.mtime);

        // Only regular-ish entries carry data blocks.
        let data_len = if directory || matches!(header.typeflag, b'1' | b'2') {
            0
        } else {
            size
        };
        self.cursor = self.span_end(data_offset, data_len)?;

        Ok(Some(ArchiveEntry::new(
            &name,
            directory,
            data_len,
            data_len,
            DateTime::from_timestamp(mtime, 0).map(|dt| dt.naive_utc()),
            EntryHandle::Tar {
                data_offset,
                length: data_len,
            },
        )))
    }

    /// Consume the extension body requested by [`Need::Extension`].
    pub fn on_extension(&mut self, body: &[u8]) -> Result<()> {
        let Some(ext) = self.pending.take() else {
            return Ok(());
        };

        match ext.typeflag {
            TYPE_GNU_LONGNAME => {
                let end = body.iter().position(|&b| b == 0).unwrap_or(body.len());
                self.long_name = Some(String::from_utf8_lossy(&body[..end]).into_owned());
            }
            TYPE_PAX_LOCAL => {
                for (key, value) in parse_pax_records(body)? {
                    match key {
                        "path" => self.pax_path = Some(value.to_string()),
                        "size" => {
                            self.pax_size = Some(value.parse().map_err(|_| {
                                ArchiveError::malformed(format!("invalid PAX size {value:?}"))
                            })?)
                        }
                        "mtime" => {
                            let secs = value.split('.').next().unwrap_or_default();
                            self.pax_mtime = secs.parse().ok();
                        }
                        _ => {}
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// Split a PAX extended header body into `key=value` records.
///
/// Each record is `"<len> <key>=<value>\n"` where `len` counts the whole
/// record including itself.
fn parse_pax_records(body: &[u8]) -> Result<Vec<(&str, &str)>> {
    let mut records = Vec::new();
    let mut rest = body;

    while !rest.is_empty() && rest[0] != 0 {
        let space = rest
            .iter()
            .position(|&b| b == b' ')
            .ok_or_else(|| ArchiveError::malformed("PAX record without length"))?;
        let len: usize = std::str::from_utf8(&rest[..space])
            .ok()
            .and_then(|s| s.parse().ok())
            .filter(|&len| len > space + 1 && len <= rest.len())
            .ok_or_else(|| ArchiveError::malformed("invalid PAX record length"))?;

        let record = std::str::from_utf8(&rest[space + 1..len])
            .map_err(|_| ArchiveError::malformed("PAX record is not UTF-8"))?;
        let record = record.strip_suffix('\n').unwrap_or(record);
        if let Some((key, value)) = record.split_once('=') {
            records.push((key, value));
        }
        rest = &rest[len..];
    }

    Ok(records)
}

/// Scan a fully resident TAR.
pub fn scan_buffer(data: &[u8]) -> Result<Vec<ArchiveEntry>> {
    let mut scanner = TarScanner::with_limit(data.len() as u64);
    let mut entries = Vec::new();

    loop {
        let need = scanner.need();
        let Some((offset, len)) = need.span() else {
            break;
        };
        let Some(span) = usize::try_from(offset)
            .ok()
            .zip(usize::try_from(len).ok())
            .and_then(|(start, len)| data.get(start..start.checked_add(len)?))
        else {
            scanner.finish();
            break;
        };

        match need {
            Need::Header { .. } => entries.extend(scanner.on_header(span)?),
            Need::Extension { .. } => scanner.on_extension(span)?,
            Need::Done => unreachable!(),
        }
    }

    Ok(entries)
}

/// TAR scanning through range reads: one header read per entry, file
/// contents are skipped.
pub struct RemoteTarScanner<R: ReadAt + ?Sized> {
    reader: Arc<R>,
    scanner: TarScanner,
}

impl<R: ReadAt + ?Sized> RemoteTarScanner<R> {
    pub fn new(reader: Arc<R>) -> Self {
        let scanner = TarScanner::with_limit(reader.size());
        Self { reader, scanner }
    }

    pub fn is_done(&self) -> bool {
        self.scanner.is_done()
    }

    /// Advance to the next entry. `None` once the archive is exhausted.
    pub async fn next_entry(&mut self, cancel: &CancellationToken) -> Result<Option<ArchiveEntry>> {
        loop {
            let need = self.scanner.need();
            let Some((offset, len)) = need.span() else {
                return Ok(None);
            };

            let bytes = self
                .reader
                .read_range(ByteRange::new(offset, len), cancel)
                .await?;
            if (bytes.len() as u64) < len {
                self.scanner.finish();
                return Ok(None);
            }

            match need {
                Need::Header { .. } => {
                    if let Some(entry) = self.scanner.on_header(&bytes)? {
                        return Ok(Some(entry));
                    }
                }
                Need::Extension { .. } => self.scanner.on_extension(&bytes)?,
                Need::Done => return Ok(None),
            }
        }
    }
}

/// Drives a [`TarScanner`] from a growing byte stream.
///
/// Only the bytes of the span currently needed are held; file contents
/// between headers are dropped as they pass.
#[derive(Debug, Default)]
pub struct TarStreamFeeder {
    scanner: TarScanner,
    /// Stream offset of `buf[0]`, or of the next byte when `buf` is empty.
    base: u64,
    buf: Vec<u8>,
}

impl TarStreamFeeder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_done(&self) -> bool {
        self.scanner.is_done()
    }

    /// Feed the next chunk of the stream and return the entries it completed.
    pub fn feed(&mut self, mut chunk: &[u8]) -> Result<Vec<ArchiveEntry>> {
        let mut entries = Vec::new();

        loop {
            let need = self.scanner.need();
            let Some((offset, len)) = need.span() else {
                self.buf = Vec::new();
                return Ok(entries);
            };

            if self.buf.is_empty() && self.base < offset {
                let skip = (offset - self.base).min(chunk.len() as u64);
                chunk = &chunk[skip as usize..];
                self.base += skip;
                if self.base < offset {
                    return Ok(entries);
                }
            }

            let missing = len as usize - self.buf.len();
            let take = missing.min(chunk.len());
            self.buf.extend_from_slice(&chunk[..take]);
            chunk = &chunk[take..];
            if self.buf.len() < len as usize {
                return Ok(entries);
            }

            let span = std::mem::take(&mut self.buf);
            self.base += len;
            match need {
                Need::Header { .. } => entries.extend(self.scanner.on_header(&span)?),
                Need::Extension { .. } => self.scanner.on_extension(&span)?,
                Need::Done => unreachable!(),
            }
        }
    }

    /// The stream ended.
    pub fn finish(&mut self) {
        self.scanner.finish();
        self.buf = Vec::new();
    }
}
