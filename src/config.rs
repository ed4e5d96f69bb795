//! Tunables for discovery and extraction.

use std::time::Duration;

/// Engine configuration shared by every byte source and discovery session.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Bytes read from the end of a ZIP when looking for the EOCD record.
    pub zip_tail_window: u64,
    /// Per-request timeout for HTTP sources.
    pub request_timeout: Duration,
    /// Retries for connect/timeout errors before a read gives up.
    pub max_retries: u32,
    /// Backoff step; the n-th retry waits `n * retry_backoff`.
    pub retry_backoff: Duration,
    /// Retry a failed ranged discovery once as a full download.
    pub fallback_on_transfer_error: bool,
    /// Decompress `.tar.gz` while it downloads instead of after.
    pub stream_gzip: bool,
    pub user_agent: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            zip_tail_window: 16 * 1024,
            request_timeout: Duration::from_secs(30),
            max_retries: 10,
            retry_backoff: Duration::from_millis(500),
            fallback_on_transfer_error: true,
            stream_gzip: true,
            user_agent: concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}
