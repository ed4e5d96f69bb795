//! Test HTTP server and archive fixtures.
//!
//! `RangeServer` is a tiny HTTP/1.1 server on a raw `TcpListener`. It serves
//! one in-memory file on every path, optionally honours `Range`, can throttle
//! bodies and records every request it sees.

#![allow(dead_code)]

use std::io::{Cursor, Write};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// Server behaviour.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Answer `Range` requests with 206; otherwise always send the full body.
    pub ranges: bool,
    /// Honour only this many ranged GETs, then start ignoring `Range`.
    pub range_limit: Option<usize>,
    /// Advertise `Accept-Ranges: none` on HEAD.
    pub advertise_none: bool,
    /// Body write size.
    pub chunk_size: usize,
    /// Pause between body chunks.
    pub chunk_delay: Option<Duration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ranges: true,
            range_limit: None,
            advertise_none: false,
            chunk_size: 64 * 1024,
            chunk_delay: None,
        }
    }
}

/// One request as seen by the server.
#[derive(Debug, Clone)]
pub struct RequestRecord {
    pub method: String,
    pub range: Option<String>,
}

pub struct RangeServer {
    addr: SocketAddr,
    log: Arc<Mutex<Vec<RequestRecord>>>,
    _handle: JoinHandle<()>,
}

impl RangeServer {
    pub async fn start(content: Vec<u8>) -> Self {
        Self::with_config(content, ServerConfig::default()).await
    }

    pub async fn with_config(content: Vec<u8>, config: ServerConfig) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let content = Arc::new(content);
        let log = Arc::new(Mutex::new(Vec::new()));

        let log_clone = log.clone();
        let handle = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let content = content.clone();
                let config = config.clone();
                let log = log_clone.clone();
                tokio::spawn(async move {
                    let _ = serve(stream, &content, &config, &log).await;
                });
            }
        });

        Self {
            addr,
            log,
            _handle: handle,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}/{}", self.addr, path.trim_start_matches('/'))
    }

    pub fn requests(&self) -> Vec<RequestRecord> {
        self.log.lock().unwrap().clone()
    }

    /// GET requests that asked for a byte range.
    pub fn ranged_gets(&self) -> usize {
        self.requests()
            .iter()
            .filter(|r| r.method == "GET" && r.range.is_some())
            .count()
    }

    /// GET requests for the whole resource.
    pub fn full_gets(&self) -> usize {
        self.requests()
            .iter()
            .filter(|r| r.method == "GET" && r.range.is_none())
            .count()
    }
}

async fn serve(
    mut stream: TcpStream,
    content: &[u8],
    config: &ServerConfig,
    log: &Mutex<Vec<RequestRecord>>,
) -> std::io::Result<()> {
    let mut request = Vec::new();
    let mut buffer = [0u8; 1024];
    while !request.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream.read(&mut buffer).await?;
        if n == 0 {
            return Ok(());
        }
        request.extend_from_slice(&buffer[..n]);
    }

    let request = String::from_utf8_lossy(&request);
    let mut lines = request.lines();
    let method = lines
        .next()
        .and_then(|l| l.split_whitespace().next())
        .unwrap_or_default()
        .to_string();
    let range = lines
        .filter_map(|l| l.split_once(':'))
        .find(|(k, _)| k.trim().eq_ignore_ascii_case("range"))
        .map(|(_, v)| v.trim().to_string());

    let ranged_so_far = {
        let mut log = log.lock().unwrap();
        log.push(RequestRecord {
            method: method.clone(),
            range: range.clone(),
        });
        log.iter()
            .filter(|r| r.method == "GET" && r.range.is_some())
            .count()
    };
    let honour_ranges =
        config.ranges && config.range_limit.is_none_or(|limit| ranged_so_far <= limit);

    let total = content.len();
    let accept = if config.advertise_none { "none" } else { "bytes" };

    if method == "HEAD" {
        let head = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {total}\r\nAccept-Ranges: {accept}\r\nConnection: close\r\n\r\n"
        );
        stream.write_all(head.as_bytes()).await?;
        return stream.shutdown().await;
    }

    let parsed = range.as_deref().filter(|_| honour_ranges).map(|r| parse_range(r, total));
    let (status, body, extra) = match parsed {
        Some(Some((start, end))) => (
            "206 Partial Content",
            &content[start..=end],
            format!("Content-Range: bytes {start}-{end}/{total}\r\n"),
        ),
        Some(None) => {
            let head = format!(
                "HTTP/1.1 416 Range Not Satisfiable\r\nContent-Range: bytes */{total}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
            );
            stream.write_all(head.as_bytes()).await?;
            return stream.shutdown().await;
        }
        None => ("200 OK", content, String::new()),
    };

    let head = format!(
        "HTTP/1.1 {status}\r\nContent-Length: {}\r\n{extra}Connection: close\r\n\r\n",
        body.len()
    );
    stream.write_all(head.as_bytes()).await?;

    for chunk in body.chunks(config.chunk_size.max(1)) {
        stream.write_all(chunk).await?;
        stream.flush().await?;
        if let Some(delay) = config.chunk_delay {
            tokio::time::sleep(delay).await;
        }
    }
    stream.shutdown().await
}

/// `bytes=a-b` / `bytes=a-` clamped to the content; `None` if unsatisfiable.
fn parse_range(header: &str, total: usize) -> Option<(usize, usize)> {
    let value = header.trim().strip_prefix("bytes=")?;
    let (start, end) = value.split_once('-')?;
    let start: usize = start.trim().parse().ok()?;
    let end = match end.trim() {
        "" => total.checked_sub(1)?,
        e => e.parse::<usize>().ok()?.min(total.checked_sub(1)?),
    };
    (start <= end).then_some((start, end))
}

/// Deterministic, incompressible filler.
pub fn noise(len: usize, seed: u64) -> Vec<u8> {
    let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
    (0..len)
        .map(|_| {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            (state >> 33) as u8
        })
        .collect()
}

/// Build a ZIP with the `zip` crate. Names ending in `/` become directories.
pub fn zip_archive<S: AsRef<str>>(
    files: &[(S, Vec<u8>)],
    deflate: bool,
    comment: Option<&str>,
) -> Vec<u8> {
    use zip::CompressionMethod;
    use zip::write::SimpleFileOptions;

    let method = if deflate {
        CompressionMethod::Deflated
    } else {
        CompressionMethod::Stored
    };
    let options = SimpleFileOptions::default().compression_method(method);

    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    for (name, data) in files {
        let name = name.as_ref();
        if name.ends_with('/') {
            writer.add_directory(name, options).unwrap();
        } else {
            writer.start_file(name, options).unwrap();
            writer.write_all(data).unwrap();
        }
    }
    if let Some(comment) = comment {
        writer.set_comment(comment);
    }
    writer.finish().unwrap().into_inner()
}

/// Build a TAR with the `tar` crate.
pub fn tar_archive<S: AsRef<str>>(files: &[(S, Vec<u8>)]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, data) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(1_700_000_000);
        builder
            .append_data(&mut header, name.as_ref(), data.as_slice())
            .unwrap();
    }
    builder.into_inner().unwrap()
}

pub fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}
