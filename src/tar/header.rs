//! POSIX ustar / GNU header blocks.

use crate::error::{ArchiveError, Result};

/// Each header and data block is 512 bytes.
pub const BLOCK_SIZE: u64 = 512;

const NAME: std::ops::Range<usize> = 0..100;
const SIZE: std::ops::Range<usize> = 124..136;
const MTIME: std::ops::Range<usize> = 136..148;
const CHECKSUM: std::ops::Range<usize> = 148..156;
const TYPEFLAG: usize = 156;
const MAGIC: std::ops::Range<usize> = 257..263;
const PREFIX: std::ops::Range<usize> = 345..500;

/// Typeflags with special meaning to the scanner.
pub const TYPE_DIRECTORY: u8 = b'5';
pub const TYPE_GNU_DUMPDIR: u8 = b'D';
pub const TYPE_GNU_LONGNAME: u8 = b'L';
pub const TYPE_GNU_LONGLINK: u8 = b'K';
pub const TYPE_PAX_LOCAL: u8 = b'x';
pub const TYPE_PAX_GLOBAL: u8 = b'g';
pub const TYPE_GNU_VOLUME: u8 = b'V';

/// Decoded fields of one header block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TarHeader {
    pub name: String,
    pub size: u64,
    pub mtime: i64,
    pub typeflag: u8,
}

impl TarHeader {
    /// Parse a 512-byte block. Returns `None` for an all-zero block.
    pub fn parse(block: &[u8]) -> Result<Option<Self>> {
        if block.len() < BLOCK_SIZE as usize {
            return Err(ArchiveError::malformed("short TAR header block"));
        }
        let block = &block[..BLOCK_SIZE as usize];
        if block.iter().all(|&b| b == 0) {
            return Ok(None);
        }

        verify_checksum(block)?;

        let mut name = field_str(&block[NAME]);
        // ustar splits long paths into prefix + name; the old GNU layout
        // ("ustar  \0") uses those bytes for other fields.
        if &block[MAGIC] == b"ustar\0" {
            let prefix = field_str(&block[PREFIX]);
            if !prefix.is_empty() {
                name = format!("{prefix}/{name}");
            }
        }

        Ok(Some(Self {
            name,
            size: parse_numeric(&block[SIZE])?,
            mtime: parse_numeric(&block[MTIME])? as i64,
            typeflag: block[TYPEFLAG],
        }))
    }

    pub fn is_directory(&self) -> bool {
        matches!(self.typeflag, TYPE_DIRECTORY | TYPE_GNU_DUMPDIR)
    }

    /// Metadata headers describe the next entry rather than being one.
    pub fn is_extension(&self) -> bool {
        matches!(
            self.typeflag,
            TYPE_GNU_LONGNAME | TYPE_GNU_LONGLINK | TYPE_PAX_LOCAL | TYPE_PAX_GLOBAL | TYPE_GNU_VOLUME
        )
    }
}

/// Blocks occupied by `size` bytes of data.
pub fn padded_size(size: u64) -> Result<u64> {
    size.div_ceil(BLOCK_SIZE)
        .checked_mul(BLOCK_SIZE)
        .ok_or_else(|| ArchiveError::malformed(format!("TAR entry size {size} out of range")))
}

fn verify_checksum(block: &[u8]) -> Result<()> {
    let stored = parse_octal(&block[CHECKSUM])?;

    let mut unsigned: u64 = 0;
    let mut signed: i64 = 0;
    for (i, &b) in block.iter().enumerate() {
        let b = if CHECKSUM.contains(&i) { b' ' } else { b };
        unsigned += b as u64;
        signed += b as i8 as i64;
    }

    if stored == unsigned || stored as i64 == signed {
        Ok(())
    } else {
        Err(ArchiveError::malformed(format!(
            "TAR header checksum mismatch (stored {stored}, computed {unsigned})"
        )))
    }
}

fn field_str(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

/// Octal ASCII, or GNU base-256 when the high bit of the first byte is set.
fn parse_numeric(field: &[u8]) -> Result<u64> {
    if field.first().is_some_and(|&b| b & 0x80 != 0) {
        if field[0] & 0x40 != 0 {
            return Err(ArchiveError::malformed("negative TAR numeric field"));
        }
        let mut value: u64 = (field[0] & 0x3F) as u64;
        for &b in &field[1..] {
            value = value
                .checked_mul(256)
                .and_then(|v| v.checked_add(b as u64))
                .ok_or_else(|| ArchiveError::malformed("TAR numeric field overflow"))?;
        }
        return Ok(value);
    }
    parse_octal(field)
}

fn parse_octal(field: &[u8]) -> Result<u64> {
    let text = field
        .iter()
        .take_while(|&&b| b != 0)
        .map(|&b| b as char)
        .collect::<String>();
    let text = text.trim();
    if text.is_empty() {
        return Ok(0);
    }
    u64::from_str_radix(text, 8)
        .map_err(|_| ArchiveError::malformed(format!("invalid octal field {text:?}")))
}
