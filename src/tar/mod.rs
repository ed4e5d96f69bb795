//! TAR archive scanning.
//!
//! TAR has no central index: entries are discovered by walking 512-byte
//! headers in order. Remote archives cost one small range read per entry;
//! file contents are skipped, never fetched.
//!
//! Supported header conventions:
//!
//! - POSIX ustar, including the `prefix` field
//! - PAX extended headers (`x`), with `path`, `size` and `mtime`
//! - GNU long names (`L`) and base-256 numeric fields

mod header;
mod scanner;

pub use header::{BLOCK_SIZE, TarHeader, padded_size};
pub use scanner::{Need, RemoteTarScanner, TarScanner, TarStreamFeeder, scan_buffer};
