//! Error types shared by every discovery and extraction path.

use std::io;

use thiserror::Error;

/// Failures raised while discovering or extracting archive entries.
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// The archive name does not carry a known suffix. No I/O was attempted.
    #[error("unsupported archive format: {0}")]
    UnsupportedFormat(String),

    /// Signatures, magic bytes or header fields are absent or inconsistent.
    #[error("malformed archive: {0}")]
    MalformedArchive(String),

    /// The server answered a ranged request with the full body.
    #[error("remote server does not honor range requests")]
    RangeUnsupported,

    /// Network or read failure, including non-2xx statuses.
    #[error("transfer failed: {0}")]
    TransferFailure(String),

    /// The caller cancelled the operation.
    #[error("operation cancelled")]
    Cancelled,

    /// An entry uses a feature this engine cannot decode.
    #[error("unsupported entry: {0}")]
    Unsupported(String),

    #[error(transparent)]
    Io(io::Error),
}

impl ArchiveError {
    pub fn malformed(msg: impl Into<String>) -> Self {
        ArchiveError::MalformedArchive(msg.into())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ArchiveError::Cancelled)
    }

    /// Whether a ranged discovery attempt that failed with this error may be
    /// retried as a full download followed by a buffer parse.
    pub fn allows_fallback(&self, retry_transfer_errors: bool) -> bool {
        match self {
            ArchiveError::RangeUnsupported => true,
            ArchiveError::TransferFailure(_) => retry_transfer_errors,
            _ => false,
        }
    }
}

impl From<io::Error> for ArchiveError {
    fn from(err: io::Error) -> Self {
        // Short reads inside a record mean the record is truncated.
        if err.kind() == io::ErrorKind::UnexpectedEof {
            ArchiveError::MalformedArchive("unexpected end of data".to_string())
        } else {
            ArchiveError::Io(err)
        }
    }
}

impl From<reqwest::Error> for ArchiveError {
    fn from(err: reqwest::Error) -> Self {
        ArchiveError::TransferFailure(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ArchiveError>;
