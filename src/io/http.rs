use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::{BoxStream, StreamExt};
use reqwest::header::{ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, RANGE};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{ByteRange, ReadAt, TransferStats, cancellable};
use crate::config::EngineConfig;
use crate::error::{ArchiveError, Result};

/// A remote archive addressed by URL.
///
/// Hands out a range reader when the server honors `Range`, and otherwise
/// supports a full download or a sequential body stream.
pub struct HttpSource {
    client: Client,
    url: String,
    config: EngineConfig,
    stats: Arc<TransferStats>,
}

impl HttpSource {
    pub fn new(url: impl Into<String>, config: &EngineConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .user_agent(config.user_agent.clone())
            .build()?;

        Ok(Self {
            client,
            url: url.into(),
            config: config.clone(),
            stats: Arc::new(TransferStats::default()),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Shared counters covering every request made through this source.
    pub fn stats(&self) -> Arc<TransferStats> {
        self.stats.clone()
    }

    /// Determine the resource size and return a range reader for it.
    ///
    /// This will send a HEAD request first; servers that omit
    /// `Content-Length` are probed with a one-byte ranged GET.
    pub async fn range_reader(&self, cancel: &CancellationToken) -> Result<HttpRangeReader> {
        let size = match self.send(|c| c.head(&self.url), cancel).await {
            Ok(resp) if resp.status().is_success() => {
                let accept_ranges = header_str(&resp, ACCEPT_RANGES.as_str());
                if accept_ranges.as_deref() == Some("none") {
                    debug!(url = %self.url, "server advertises Accept-Ranges: none");
                    return Err(ArchiveError::RangeUnsupported);
                }
                header_str(&resp, CONTENT_LENGTH.as_str()).and_then(|s| s.parse::<u64>().ok())
            }
            Ok(resp) => {
                debug!(status = %resp.status(), "HEAD rejected, probing with a ranged GET");
                None
            }
            Err(ArchiveError::Cancelled) => return Err(ArchiveError::Cancelled),
            Err(e) => {
                debug!(error = %e, "HEAD failed, probing with a ranged GET");
                None
            }
        };

        let size = match size {
            Some(size) => size,
            None => self.probe_size(cancel).await?,
        };
        debug!(url = %self.url, size, "remote archive supports ranged reads");

        Ok(HttpRangeReader {
            client: self.client.clone(),
            url: self.url.clone(),
            size,
            config: self.config.clone(),
            stats: self.stats.clone(),
        })
    }

    async fn probe_size(&self, cancel: &CancellationToken) -> Result<u64> {
        let resp = self
            .send(|c| c.get(&self.url).header(RANGE, "bytes=0-0"), cancel)
            .await?;

        match resp.status() {
            StatusCode::PARTIAL_CONTENT => {
                // Content-Range: bytes 0-0/1234
                let total = header_str(&resp, CONTENT_RANGE.as_str())
                    .and_then(|v| v.rsplit_once('/').map(|(_, t)| t.to_string()))
                    .and_then(|t| t.trim().parse::<u64>().ok())
                    .ok_or(ArchiveError::RangeUnsupported)?;
                self.stats.add_bytes(1);
                Ok(total)
            }
            s if s.is_success() => Err(ArchiveError::RangeUnsupported),
            s => Err(ArchiveError::TransferFailure(format!(
                "HTTP request failed with status: {s}"
            ))),
        }
    }

    /// Download the whole resource into memory.
    pub async fn download(&self, cancel: &CancellationToken) -> Result<Bytes> {
        debug!(url = %self.url, "downloading full archive");
        let resp = self.get_ok(cancel).await?;
        let body = cancellable(cancel, async { resp.bytes().await.map_err(ArchiveError::from) }).await?;
        self.stats.add_bytes(body.len() as u64);
        Ok(body)
    }

    /// Open a sequential, non-ranged body stream. Dropping the stream
    /// aborts the transfer.
    pub async fn chunks(
        &self,
        cancel: &CancellationToken,
    ) -> Result<BoxStream<'static, Result<Bytes>>> {
        let resp = self.get_ok(cancel).await?;
        let stats = self.stats.clone();
        Ok(resp
            .bytes_stream()
            .map(move |chunk| -> Result<Bytes> {
                let chunk = chunk?;
                stats.add_bytes(chunk.len() as u64);
                Ok(chunk)
            })
            .boxed())
    }

    async fn get_ok(&self, cancel: &CancellationToken) -> Result<Response> {
        let resp = self.send(|c| c.get(&self.url), cancel).await?;
        if !resp.status().is_success() {
            return Err(ArchiveError::TransferFailure(format!(
                "HTTP request failed with status: {}",
                resp.status()
            )));
        }
        Ok(resp)
    }

    async fn send(
        &self,
        build: impl Fn(&Client) -> RequestBuilder,
        cancel: &CancellationToken,
    ) -> Result<Response> {
        send_with_retry(&self.client, &self.config, &self.stats, build, cancel).await
    }
}

/// HTTP Range reader for remote archives
pub struct HttpRangeReader {
    client: Client,
    url: String,
    size: u64,
    config: EngineConfig,
    stats: Arc<TransferStats>,
}

impl HttpRangeReader {
    pub fn stats(&self) -> Arc<TransferStats> {
        self.stats.clone()
    }
}

#[async_trait]
impl ReadAt for HttpRangeReader {
    async fn read_range(&self, range: ByteRange, cancel: &CancellationToken) -> Result<Bytes> {
        let Some((start, end)) = range.clamp(self.size) else {
            return Ok(Bytes::new());
        };

        let expected_size = (end - start + 1) as usize;
        let mut buf = BytesMut::with_capacity(expected_size);

        while buf.len() < expected_size {
            let current_start = start + buf.len() as u64;
            let range = format!("bytes={current_start}-{end}");
            debug!(url = %self.url, %range, "range read");

            let resp = send_with_retry(
                &self.client,
                &self.config,
                &self.stats,
                |c| c.get(&self.url).header(RANGE, range.as_str()),
                cancel,
            )
            .await?;

            let status = resp.status();
            let whole_resource = current_start == 0 && end + 1 == self.size;
            if status == StatusCode::OK && whole_resource {
                // The server ignored the range, but the body is what we asked for.
            } else if status.is_success() && status != StatusCode::PARTIAL_CONTENT {
                // Dropping the response aborts the full-body transfer.
                return Err(ArchiveError::RangeUnsupported);
            } else if !status.is_success() {
                return Err(ArchiveError::TransferFailure(format!(
                    "HTTP request failed with status: {status}"
                )));
            }

            let bytes = cancellable(cancel, async { resp.bytes().await.map_err(ArchiveError::from) }).await?;
            self.stats.add_bytes(bytes.len() as u64);
            if bytes.is_empty() {
                return Err(ArchiveError::TransferFailure(format!(
                    "empty response for {range}"
                )));
            }

            let chunk_len = bytes.len().min(expected_size - buf.len());
            buf.extend_from_slice(&bytes[..chunk_len]);
        }

        Ok(buf.freeze())
    }

    fn size(&self) -> u64 {
        self.size
    }
}

/// Send a request, retrying connect and timeout failures with linear backoff.
async fn send_with_retry(
    client: &Client,
    config: &EngineConfig,
    stats: &TransferStats,
    build: impl Fn(&Client) -> RequestBuilder,
    cancel: &CancellationToken,
) -> Result<Response> {
    let mut retry_count = 0;

    loop {
        stats.add_request();
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ArchiveError::Cancelled),
            res = build(client).send() => res,
        };

        match result {
            Ok(resp) => return Ok(resp),
            Err(e) if e.is_timeout() || e.is_connect() => {
                retry_count += 1;
                if retry_count >= config.max_retries {
                    return Err(ArchiveError::TransferFailure(format!(
                        "max retries exceeded: {e}"
                    )));
                }
                warn!(
                    "Connection error, retry {}/{}: {}",
                    retry_count, config.max_retries, e
                );
                let backoff = config.retry_backoff * retry_count;
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(ArchiveError::Cancelled),
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
}

fn header_str(resp: &Response, name: &str) -> Option<String> {
    resp.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_ascii_lowercase())
}
