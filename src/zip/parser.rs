//! Low-level ZIP archive parser.
//!
//! This module handles the binary parsing of ZIP file structures, either
//! through any source that implements the [`ReadAt`] trait or straight out
//! of an in-memory buffer.
//!
//! ## Parsing Strategy
//!
//! ZIP files are designed to be read from the end:
//! 1. Find the End of Central Directory (EOCD) in a tail window
//! 2. If ZIP64, read the ZIP64 EOCD for large file support
//! 3. Read the Central Directory to get metadata for all files
//!
//! This approach is efficient for HTTP Range requests, as we only
//! need to fetch the file's tail to list contents: one tail read plus one
//! central directory read, and a window expansion only when a long archive
//! comment pushes the EOCD out of the first guess.

use byteorder::{LittleEndian, ReadBytesExt};
use bytes::Bytes;
use std::io::{Cursor, Read};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::entry::ArchiveEntry;
use crate::error::{ArchiveError, Result};
use crate::io::{ByteRange, ReadAt};

use super::structures::*;

/// Maximum ZIP comment size allowed by the format (65535 bytes).
const MAX_COMMENT_SIZE: u64 = 65535;

/// Tail size guaranteed to hold the EOCD, its comment and the Zip64 records
/// that usually sit right before it.
const EXPANDED_TAIL_WINDOW: u64 = MAX_COMMENT_SIZE
    + EndOfCentralDirectory::SIZE as u64
    + Zip64EOCDLocator::SIZE as u64
    + Zip64EOCD::MIN_SIZE as u64;

/// Bytes already fetched, anchored at an absolute offset in the archive.
struct Window {
    data: Bytes,
    offset: u64,
}

impl Window {
    fn get(&self, abs: u64, len: u64) -> Option<Bytes> {
        let start = abs.checked_sub(self.offset)?;
        let end = start.checked_add(len)?;
        if end > self.data.len() as u64 {
            return None;
        }
        Some(self.data.slice(start as usize..end as usize))
    }
}

/// Range-driven ZIP index.
///
/// Generic over the reader so the same code lists a remote archive through
/// HTTP Range requests or a local file through positional reads.
pub struct ZipParser<R: ReadAt + ?Sized> {
    /// The underlying data source
    reader: Arc<R>,
    /// Total size of the archive in bytes
    size: u64,
    tail_window: u64,
}

impl<R: ReadAt + ?Sized> ZipParser<R> {
    pub fn new(reader: Arc<R>, tail_window: u64) -> Self {
        let size = reader.size();
        Self {
            reader,
            size,
            tail_window: tail_window.max(EndOfCentralDirectory::SIZE as u64),
        }
    }

    /// Read the last `len` bytes of the archive.
    async fn read_tail(&self, len: u64, cancel: &CancellationToken) -> Result<Window> {
        let len = len.min(self.size);
        let offset = self.size - len;
        let data = self
            .reader
            .read_range(ByteRange::new(offset, len), cancel)
            .await?;
        Ok(Window { data, offset })
    }

    async fn bytes_at(
        &self,
        window: &Window,
        abs: u64,
        len: u64,
        cancel: &CancellationToken,
    ) -> Result<Bytes> {
        if let Some(bytes) = window.get(abs, len) {
            return Ok(bytes);
        }
        let bytes = self
            .reader
            .read_range(ByteRange::new(abs, len), cancel)
            .await?;
        if (bytes.len() as u64) < len {
            return Err(ArchiveError::malformed("ZIP structure extends past end of file"));
        }
        Ok(bytes)
    }

    /// Find the EOCD and resolve the central directory location, promoting
    /// to Zip64 when the classic fields are saturated.
    ///
    /// Returns the location together with the window it was found in.
    async fn locate(&self, cancel: &CancellationToken) -> Result<(CentralDirectoryLocation, Window)> {
        let mut window = self.read_tail(self.tail_window, cancel).await?;
        let mut pos = find_eocd(&window.data);

        if pos.is_none() && window.offset > 0 && self.tail_window < EXPANDED_TAIL_WINDOW {
            debug!(
                tail = self.tail_window,
                expanded = EXPANDED_TAIL_WINDOW,
                "EOCD not in tail window, expanding"
            );
            window = self.read_tail(EXPANDED_TAIL_WINDOW, cancel).await?;
            pos = find_eocd(&window.data);
        }

        let pos = pos.ok_or_else(|| ArchiveError::malformed("End of Central Directory not found"))?;
        let eocd = EndOfCentralDirectory::from_bytes(&window.data[pos..])?;
        let eocd_offset = window.offset + pos as u64;

        let location = if eocd.is_zip64() {
            let locator_offset = eocd_offset
                .checked_sub(Zip64EOCDLocator::SIZE as u64)
                .ok_or_else(|| ArchiveError::malformed("missing ZIP64 locator"))?;
            let locator_buf = self
                .bytes_at(&window, locator_offset, Zip64EOCDLocator::SIZE as u64, cancel)
                .await?;
            let locator = Zip64EOCDLocator::from_bytes(&locator_buf)?;

            let eocd64_buf = self
                .bytes_at(&window, locator.eocd64_offset, Zip64EOCD::MIN_SIZE as u64, cancel)
                .await?;
            let eocd64 = Zip64EOCD::from_bytes(&eocd64_buf)?;
            CentralDirectoryLocation {
                offset: eocd64.cd_offset,
                size: eocd64.cd_size,
                total_entries: eocd64.total_entries,
            }
        } else {
            classic_location(&eocd)
        };

        check_location(&location, self.size)?;
        Ok((location, window))
    }

    /// List all entries in the archive as a single batch.
    ///
    /// Reads the EOCD first, then fetches the entire Central Directory in
    /// one request unless the tail window already covers it.
    pub async fn list_entries(&self, cancel: &CancellationToken) -> Result<Vec<ArchiveEntry>> {
        let (location, window) = self.locate(cancel).await?;
        debug!(
            cd_offset = location.offset,
            cd_size = location.size,
            entries = location.total_entries,
            "central directory located"
        );

        let cd_data = self
            .bytes_at(&window, location.offset, location.size, cancel)
            .await?;
        let records = parse_central_directory(&cd_data, location.total_entries)?;
        Ok(records.into_iter().map(CentralDirectoryRecord::into_entry).collect())
    }
}

/// Index a fully materialised ZIP archive.
pub fn index_buffer(data: &[u8]) -> Result<Vec<ArchiveEntry>> {
    let pos = find_eocd(data).ok_or_else(|| ArchiveError::malformed("End of Central Directory not found"))?;
    let eocd = EndOfCentralDirectory::from_bytes(&data[pos..])?;

    let location = if eocd.is_zip64() {
        let locator_offset = pos
            .checked_sub(Zip64EOCDLocator::SIZE)
            .ok_or_else(|| ArchiveError::malformed("missing ZIP64 locator"))?;
        let locator = Zip64EOCDLocator::from_bytes(&data[locator_offset..])?;
        let eocd64 = usize::try_from(locator.eocd64_offset)
            .ok()
            .and_then(|off| data.get(off..))
            .ok_or_else(|| ArchiveError::malformed("ZIP64 record past end of file"))?;
        let eocd64 = Zip64EOCD::from_bytes(eocd64)?;
        CentralDirectoryLocation {
            offset: eocd64.cd_offset,
            size: eocd64.cd_size,
            total_entries: eocd64.total_entries,
        }
    } else {
        classic_location(&eocd)
    };

    check_location(&location, data.len() as u64)?;
    let start = location.offset as usize;
    let cd_data = &data[start..start + location.size as usize];
    let records = parse_central_directory(cd_data, location.total_entries)?;
    Ok(records.into_iter().map(CentralDirectoryRecord::into_entry).collect())
}

fn classic_location(eocd: &EndOfCentralDirectory) -> CentralDirectoryLocation {
    CentralDirectoryLocation {
        offset: eocd.cd_offset as u64,
        size: eocd.cd_size as u64,
        total_entries: eocd.total_entries as u64,
    }
}

fn check_location(location: &CentralDirectoryLocation, archive_size: u64) -> Result<()> {
    match location.offset.checked_add(location.size) {
        Some(end) if end <= archive_size => Ok(()),
        _ => Err(ArchiveError::malformed(
            "central directory lies outside the archive",
        )),
    }
}

/// Search backwards for the EOCD signature (PK\x05\x06).
///
/// A record whose comment length exactly reaches the end of `buf` wins;
/// otherwise the last record whose comment fits is accepted, which
/// tolerates trailing bytes after the archive.
pub fn find_eocd(buf: &[u8]) -> Option<usize> {
    if buf.len() < EndOfCentralDirectory::SIZE {
        return None;
    }

    let candidates = (0..=buf.len() - EndOfCentralDirectory::SIZE)
        .rev()
        .filter(|&i| &buf[i..i + 4] == EndOfCentralDirectory::SIGNATURE)
        .map(|i| {
            let comment_len = u16::from_le_bytes([buf[i + 20], buf[i + 21]]) as usize;
            (i, buf.len() - i - EndOfCentralDirectory::SIZE, comment_len)
        });

    let mut fallback = None;
    for (i, remaining, comment_len) in candidates {
        if comment_len == remaining {
            return Some(i);
        }
        if comment_len < remaining && fallback.is_none() {
            fallback = Some(i);
        }
    }
    fallback
}

/// Parse every Central Directory File Header in `data`, in directory order.
pub fn parse_central_directory(data: &[u8], expected: u64) -> Result<Vec<CentralDirectoryRecord>> {
    let mut records = Vec::with_capacity(expected.min(1 << 16) as usize);
    let mut cursor = Cursor::new(data);

    while (cursor.position() as usize) + 4 <= data.len() {
        let pos = cursor.position() as usize;
        if &data[pos..pos + 4] != CDFH_SIGNATURE {
            // Digital signature / zip64 records may follow the headers.
            if records.is_empty() {
                return Err(ArchiveError::malformed("invalid Central Directory File Header"));
            }
            break;
        }
        records.push(parse_cdfh(&mut cursor)?);
    }

    if records.len() as u64 != expected {
        debug!(
            expected,
            found = records.len(),
            "central directory entry count differs from EOCD"
        );
    }
    Ok(records)
}

/// Parse a Central Directory File Header from a cursor.
///
/// The CDFH contains metadata about a file in the archive, including
/// its name, sizes, and location of the actual file data.
fn parse_cdfh(cursor: &mut Cursor<&[u8]>) -> Result<CentralDirectoryRecord> {
    // Read and verify the signature (PK\x01\x02)
    let mut sig = [0u8; 4];
    cursor.read_exact(&mut sig)?;
    if sig != CDFH_SIGNATURE {
        return Err(ArchiveError::malformed("invalid Central Directory File Header"));
    }

    // Read fixed-size header fields
    let version_made_by = cursor.read_u16::<LittleEndian>()?;
    let _version_needed = cursor.read_u16::<LittleEndian>()?;
    let flags = cursor.read_u16::<LittleEndian>()?;
    let compression_method = cursor.read_u16::<LittleEndian>()?;
    let last_mod_time = cursor.read_u16::<LittleEndian>()?;
    let last_mod_date = cursor.read_u16::<LittleEndian>()?;
    let crc32 = cursor.read_u32::<LittleEndian>()?;
    let mut compressed_size = cursor.read_u32::<LittleEndian>()? as u64;
    let mut uncompressed_size = cursor.read_u32::<LittleEndian>()? as u64;
    let file_name_length = cursor.read_u16::<LittleEndian>()?;
    let extra_field_length = cursor.read_u16::<LittleEndian>()?;
    let file_comment_length = cursor.read_u16::<LittleEndian>()?;
    let _disk_number_start = cursor.read_u16::<LittleEndian>()?;
    let _internal_attrs = cursor.read_u16::<LittleEndian>()?;
    let external_attrs = cursor.read_u32::<LittleEndian>()?;
    let mut lfh_offset = cursor.read_u32::<LittleEndian>()? as u64;

    // Read the variable-length file name
    let mut file_name_bytes = vec![0u8; file_name_length as usize];
    cursor.read_exact(&mut file_name_bytes)?;
    // Use lossy conversion to handle non-UTF8 filenames gracefully
    let mut file_name = String::from_utf8_lossy(&file_name_bytes).to_string();

    let mut extra = vec![0u8; extra_field_length as usize];
    cursor.read_exact(&mut extra)?;

    // Skip over the file comment (we don't use it)
    let comment_end = cursor.position() + file_comment_length as u64;
    if comment_end > cursor.get_ref().len() as u64 {
        return Err(ArchiveError::malformed("file comment past end of central directory"));
    }
    cursor.set_position(comment_end);

    let mut unix_mtime = None;
    let mut extra_cursor = Cursor::new(&extra[..]);
    while extra_cursor.position() + 4 <= extra.len() as u64 {
        let header_id = extra_cursor.read_u16::<LittleEndian>()?;
        let field_size = extra_cursor.read_u16::<LittleEndian>()? as u64;
        let field_start = extra_cursor.position();
        let field_end = (field_start + field_size).min(extra.len() as u64);
        let field = &extra[field_start as usize..field_end as usize];

        match header_id {
            EXTRA_ZIP64 => {
                // Fields are present only if corresponding header field is 0xFFFFFFFF
                let mut zip64 = Cursor::new(field);
                if uncompressed_size == 0xFFFFFFFF {
                    uncompressed_size = zip64.read_u64::<LittleEndian>()?;
                }
                if compressed_size == 0xFFFFFFFF {
                    compressed_size = zip64.read_u64::<LittleEndian>()?;
                }
                if lfh_offset == 0xFFFFFFFF {
                    lfh_offset = zip64.read_u64::<LittleEndian>()?;
                }
            }
            EXTRA_EXTENDED_TIMESTAMP => {
                // flags byte, then mtime when bit 0 is set
                if field.len() >= 5 && field[0] & 1 != 0 {
                    let mtime = i32::from_le_bytes([field[1], field[2], field[3], field[4]]);
                    unix_mtime = Some(mtime as i64);
                }
            }
            EXTRA_UNICODE_PATH => {
                // version, crc32 of the raw name, UTF-8 name
                if field.len() > 5 && field[0] == 1 {
                    let name_crc = u32::from_le_bytes([field[1], field[2], field[3], field[4]]);
                    let mut crc = flate2::Crc::new();
                    crc.update(&file_name_bytes);
                    if crc.sum() == name_crc {
                        if let Ok(name) = std::str::from_utf8(&field[5..]) {
                            file_name = name.to_string();
                        }
                    }
                }
            }
            _ => {}
        }
        extra_cursor.set_position(field_end);
    }

    // Directories end with '/', or carry a DOS/Unix directory attribute
    let host = version_made_by >> 8;
    let is_directory = file_name.ends_with('/')
        || (host == 0 && external_attrs & 0x10 != 0)
        || (host == 3 && (external_attrs >> 16) & 0o170000 == 0o040000);

    Ok(CentralDirectoryRecord {
        file_name,
        flags,
        compression_method: CompressionMethod::from_u16(compression_method),
        compressed_size,
        uncompressed_size,
        crc32,
        lfh_offset,
        last_mod_time,
        last_mod_date,
        unix_mtime,
        is_directory,
        name_and_extra_len: file_name_length as u64 + extra_field_length as u64,
    })
}

/// Offset of the entry data relative to the start of its Local File Header.
pub fn local_data_offset(lfh: &[u8]) -> Result<u64> {
    // Verify LFH signature (PK\x03\x04)
    if lfh.len() < LFH_SIZE || &lfh[0..4] != LFH_SIGNATURE {
        return Err(ArchiveError::malformed("invalid Local File Header"));
    }

    // Read the variable field lengths from fixed positions in LFH
    let mut cursor = Cursor::new(&lfh[26..LFH_SIZE]);
    let file_name_length = cursor.read_u16::<LittleEndian>()? as u64;
    let extra_field_length = cursor.read_u16::<LittleEndian>()? as u64;

    // Data starts after: LFH (30 bytes) + filename + extra field
    Ok(LFH_SIZE as u64 + file_name_length + extra_field_length)
}
