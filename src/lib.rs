//! # arcpeek
//!
//! Browse and extract ZIP, TAR and TAR.GZ archives without downloading them.
//!
//! For remote archives the library uses HTTP Range requests to fetch only the
//! bytes needed to list the archive or to extract a single entry. A ZIP
//! listing costs a tail read and a central directory read; a TAR listing
//! costs one header read per entry; a `.tar.gz` is inflated while it
//! streams and entries are reported as soon as their headers decompress.
//!
//! ## Features
//!
//! - Local files, in-memory buffers and HTTP/HTTPS URLs
//! - ZIP64, Unicode path and extended timestamp extra fields
//! - ustar, PAX and GNU long-name TAR headers
//! - Progressive discovery with cancellation
//! - Directory listings and a full file tree over discovered entries
//! - Full-download fallback for servers without range support
//!
//! ## Example
//!
//! ```no_run
//! use arcpeek::{ArchiveSource, DiscoverySession, EngineConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let source = ArchiveSource::Url("https://example.com/archive.zip".to_string());
//!     let mut session = DiscoverySession::open(source, EngineConfig::default())?;
//!
//!     while let Some(batch) = session.next_batch().await? {
//!         for entry in &batch {
//!             println!("{}", entry.filename);
//!         }
//!     }
//!
//!     if let Some(entry) = session.entries().get("README.md").cloned() {
//!         let data = session.extract(&entry).await?;
//!         println!("{}", String::from_utf8_lossy(&data));
//!     }
//!
//!     Ok(())
//! }
//! ```

pub mod cli;
pub mod config;
pub mod entry;
pub mod error;
pub mod format;
pub mod gzip;
pub mod io;
pub mod listing;
pub mod session;
pub mod tar;
pub mod zip;

pub use cli::Cli;
pub use config::EngineConfig;
pub use entry::{ArchiveEntry, EntryList};
pub use error::{ArchiveError, Result};
pub use format::ArchiveFormat;
pub use io::{BufferReader, HttpRangeReader, HttpSource, LocalFileReader, ReadAt, TransferStats};
pub use listing::{FileTreeNode, Listing, build_file_tree, clamp_prefix, list_contents};
pub use session::{ArchiveSource, ArchiveView, DiscoverySession};
