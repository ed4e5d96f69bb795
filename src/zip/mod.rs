//! ZIP indexing and single-entry extraction.
//!
//! Listing never touches file data. The parser reads a tail window, locates
//! the End of Central Directory record (widening the window once if a long
//! archive comment hides it), follows the Zip64 locator when the classic
//! record is saturated, and decodes the central directory, usually straight
//! out of the window it already holds.
//!
//! - [`structures`]: fixed records, signatures and extra-field ids
//! - [`parser`]: range-driven ([`ZipParser`]) and in-memory ([`index_buffer`]) indexing
//! - [`extractor`]: local header + data fetch, inflate and CRC check
//!
//! Stored and Deflate entries can be extracted; encrypted entries and other
//! methods are listed but not extracted. Multi-disk archives are not
//! supported.

mod extractor;
mod parser;
mod structures;

pub use extractor::ZipExtractor;
pub use parser::{ZipParser, find_eocd, index_buffer, parse_central_directory};
pub use structures::*;
