//! Discovery sessions: one archive, one cancellation token, one entry list.
//!
//! A session picks the cheapest discovery strategy for the archive's format
//! and location, delivers entries in batches through
//! [`DiscoverySession::next_batch`], and keeps whatever it needs to extract
//! single entries afterwards.
//!
//! | format | URL                                 | file / buffer            |
//! |--------|-------------------------------------|--------------------------|
//! | zip    | tail + central directory ranges     | same, or buffer parse    |
//! | tar    | one header range read per entry     | same, or buffer scan     |
//! | tar.gz | streamed inflate, entries as found  | full inflate, then scan  |
//!
//! Remote strategies fall back once to a full download followed by a
//! buffer parse when the server ignores ranges (or, if configured, when the
//! transfer fails).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::fs;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::entry::{ArchiveEntry, EntryHandle, EntryList};
use crate::error::{ArchiveError, Result};
use crate::format::ArchiveFormat;
use crate::gzip::{GzipTarStream, decompress_all};
use crate::io::{
    BufferReader, ByteRange, HttpSource, LocalFileReader, ReadAt, TransferStats, cancellable,
};
use crate::listing::{FileTreeNode, Listing, build_file_tree, list_contents};
use crate::tar::{RemoteTarScanner, scan_buffer};
use crate::zip::{ZipExtractor, ZipParser, index_buffer};

/// Where an archive comes from.
#[derive(Debug, Clone)]
pub enum ArchiveSource {
    Url(String),
    Buffer { name: String, data: Bytes },
    File(PathBuf),
}

impl ArchiveSource {
    /// Pick `Url` for http(s) locations and `File` otherwise.
    pub fn from_location(location: &str) -> Self {
        if location.starts_with("http://") || location.starts_with("https://") {
            ArchiveSource::Url(location.to_string())
        } else {
            ArchiveSource::File(PathBuf::from(location))
        }
    }

    /// Name used for format detection.
    pub fn name(&self) -> String {
        match self {
            ArchiveSource::Url(url) => reqwest::Url::parse(url)
                .ok()
                .and_then(|u| {
                    u.path_segments()
                        .and_then(|mut s| s.next_back().map(str::to_string))
                })
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| url.clone()),
            ArchiveSource::Buffer { name, .. } => name.clone(),
            ArchiveSource::File(path) => path
                .file_name()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default(),
        }
    }
}

/// Bytes retained for extraction.
enum Backing {
    Empty,
    Ranged(Arc<dyn ReadAt>),
    Buffer(Bytes),
    /// Decompressed TAR bytes received so far from a streamed `.tar.gz`.
    Accumulating(BytesMut),
}

struct GzipPhase {
    chunks: BoxStream<'static, Result<Bytes>>,
    stream: GzipTarStream,
}

/// Resumable discovery cursor.
enum Phase {
    Start,
    RemoteTar(RemoteTarScanner<dyn ReadAt>),
    Gzip(Box<GzipPhase>),
    Done,
}

/// One discovery pass over one archive.
pub struct DiscoverySession {
    source: ArchiveSource,
    format: ArchiveFormat,
    config: EngineConfig,
    cancel: CancellationToken,
    http: Option<HttpSource>,
    entries: EntryList,
    phase: Phase,
    backing: Backing,
    fell_back: bool,
}

impl DiscoverySession {
    /// Prepare a session. Fails with `UnsupportedFormat` before any I/O.
    pub fn open(source: ArchiveSource, config: EngineConfig) -> Result<Self> {
        let name = source.name();
        let format = ArchiveFormat::detect(&name);
        if !format.is_supported() {
            return Err(ArchiveError::UnsupportedFormat(name));
        }

        let http = match &source {
            ArchiveSource::Url(url) => Some(HttpSource::new(url.clone(), &config)?),
            _ => None,
        };

        info!(%name, %format, "opening archive");
        Ok(Self {
            source,
            format,
            config,
            cancel: CancellationToken::new(),
            http,
            entries: EntryList::new(),
            phase: Phase::Start,
            backing: Backing::Empty,
            fell_back: false,
        })
    }

    pub fn format(&self) -> ArchiveFormat {
        self.format
    }

    pub fn source(&self) -> &ArchiveSource {
        &self.source
    }

    pub fn entries(&self) -> &EntryList {
        &self.entries
    }

    pub fn is_done(&self) -> bool {
        matches!(self.phase, Phase::Done)
    }

    /// Network counters for URL sources.
    pub fn transfer_stats(&self) -> Option<Arc<TransferStats>> {
        self.http.as_ref().map(HttpSource::stats)
    }

    /// The token governing this session.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancel discovery and any extraction in flight. Not resumable.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Discover the next batch of entries.
    ///
    /// Returns only entries newly appended to [`entries`](Self::entries),
    /// and `None` once discovery is complete.
    pub async fn next_batch(&mut self) -> Result<Option<Vec<ArchiveEntry>>> {
        loop {
            if self.cancel.is_cancelled() {
                self.abort();
                return Err(ArchiveError::Cancelled);
            }

            match self.advance().await {
                Ok(Some(batch)) => {
                    let added = self.entries.append(batch);
                    if !added.is_empty() {
                        debug!(added = added.len(), total = self.entries.len(), "batch discovered");
                        return Ok(Some(added));
                    }
                }
                Ok(None) => {
                    info!(entries = self.entries.len(), "discovery finished");
                    return Ok(None);
                }
                Err(e) if e.is_cancelled() => {
                    self.abort();
                    return Err(e);
                }
                Err(e) => {
                    warn!(error = %e, "discovery failed");
                    self.phase = Phase::Done;
                    return Err(e);
                }
            }
        }
    }

    /// Run discovery to completion.
    pub async fn discover_all(&mut self) -> Result<&EntryList> {
        while self.next_batch().await?.is_some() {}
        Ok(&self.entries)
    }

    /// Children of `prefix` in the current entry snapshot.
    pub fn list(&self, prefix: &str) -> Listing {
        list_contents(self.entries.as_slice(), prefix)
    }

    /// Full tree of the current entry snapshot.
    pub fn tree(&self) -> FileTreeNode {
        build_file_tree(self.entries.as_slice())
    }

    fn abort(&mut self) {
        debug!("discovery cancelled");
        // Dropping the phase drops any open body stream and aborts it.
        self.phase = Phase::Done;
        if matches!(self.backing, Backing::Accumulating(_)) {
            self.backing = Backing::Empty;
        }
    }

    fn can_fall_back(&self, err: &ArchiveError) -> bool {
        self.http.is_some()
            && !self.fell_back
            && err.allows_fallback(self.config.fallback_on_transfer_error)
    }

    async fn advance(&mut self) -> Result<Option<Vec<ArchiveEntry>>> {
        loop {
            match std::mem::replace(&mut self.phase, Phase::Done) {
                Phase::Start => {
                    if let Some(batch) = self.start().await? {
                        return Ok(Some(batch));
                    }
                }
                Phase::RemoteTar(scanner) => return self.step_remote_tar(scanner).await,
                Phase::Gzip(gzip) => return self.step_gzip(gzip).await,
                Phase::Done => return Ok(None),
            }
        }
    }

    /// Choose the strategy. One-shot strategies return their batch; the
    /// progressive ones install their phase and return `None`.
    async fn start(&mut self) -> Result<Option<Vec<ArchiveEntry>>> {
        let source = self.source.clone();
        match (self.format, source) {
            (ArchiveFormat::Zip, ArchiveSource::Url(_)) => self.start_remote_zip().await.map(Some),
            (ArchiveFormat::Zip, ArchiveSource::File(path)) => {
                let reader: Arc<dyn ReadAt> = Arc::new(LocalFileReader::new(&path)?);
                let entries = ZipParser::new(reader.clone(), self.config.zip_tail_window)
                    .list_entries(&self.cancel)
                    .await?;
                self.backing = Backing::Ranged(reader);
                Ok(Some(entries))
            }
            (ArchiveFormat::Zip, ArchiveSource::Buffer { data, .. }) => {
                let entries = index_buffer(&data)?;
                self.backing = Backing::Buffer(data);
                Ok(Some(entries))
            }

            (ArchiveFormat::Tar, ArchiveSource::Url(_)) => {
                let opened = self.http()?.range_reader(&self.cancel).await;
                match opened {
                    Ok(reader) => {
                        let reader: Arc<dyn ReadAt> = Arc::new(reader);
                        self.start_ranged_tar(reader);
                        Ok(None)
                    }
                    Err(e) if self.can_fall_back(&e) => self.fallback_full(e).await.map(Some),
                    Err(e) => Err(e),
                }
            }
            (ArchiveFormat::Tar, ArchiveSource::File(path)) => {
                self.start_ranged_tar(Arc::new(LocalFileReader::new(&path)?));
                Ok(None)
            }
            (ArchiveFormat::Tar, ArchiveSource::Buffer { data, .. }) => {
                let entries = scan_buffer(&data)?;
                self.backing = Backing::Buffer(data);
                Ok(Some(entries))
            }

            (ArchiveFormat::TarGz, ArchiveSource::Url(_)) => {
                if !self.config.stream_gzip {
                    return self
                        .fallback_full(ArchiveError::Unsupported("gzip streaming disabled".into()))
                        .await
                        .map(Some);
                }
                let opened = self.http()?.chunks(&self.cancel).await;
                match opened {
                    Ok(chunks) => {
                        self.backing = Backing::Accumulating(BytesMut::new());
                        self.phase = Phase::Gzip(Box::new(GzipPhase {
                            chunks,
                            stream: GzipTarStream::new(),
                        }));
                        Ok(None)
                    }
                    Err(e) if self.can_fall_back(&e) => self.fallback_full(e).await.map(Some),
                    Err(e) => Err(e),
                }
            }
            (ArchiveFormat::TarGz, ArchiveSource::File(path)) => {
                let compressed = cancellable(&self.cancel, async {
                    fs::read(&path).await.map_err(ArchiveError::from)
                })
                .await?;
                self.index_tar_gz(&compressed).map(Some)
            }
            (ArchiveFormat::TarGz, ArchiveSource::Buffer { data, .. }) => {
                self.index_tar_gz(&data).map(Some)
            }

            (ArchiveFormat::Unsupported, _) => {
                Err(ArchiveError::UnsupportedFormat(self.source.name()))
            }
        }
    }

    fn http(&self) -> Result<&HttpSource> {
        self.http
            .as_ref()
            .ok_or_else(|| ArchiveError::TransferFailure("no HTTP source".into()))
    }

    async fn start_remote_zip(&mut self) -> Result<Vec<ArchiveEntry>> {
        let http = self.http()?;
        let attempt = async {
            let reader: Arc<dyn ReadAt> = Arc::new(http.range_reader(&self.cancel).await?);
            let entries = ZipParser::new(reader.clone(), self.config.zip_tail_window)
                .list_entries(&self.cancel)
                .await?;
            Ok::<_, ArchiveError>((reader, entries))
        }
        .await;

        match attempt {
            Ok((reader, entries)) => {
                self.backing = Backing::Ranged(reader);
                Ok(entries)
            }
            // A missing or unreadable directory may still parse from the
            // whole file, e.g. when the server mangles ranges.
            Err(e @ ArchiveError::MalformedArchive(_)) if !self.fell_back => self.fallback_full(e).await,
            Err(e) if self.can_fall_back(&e) => self.fallback_full(e).await,
            Err(e) => Err(e),
        }
    }

    fn start_ranged_tar(&mut self, reader: Arc<dyn ReadAt>) {
        self.phase = Phase::RemoteTar(RemoteTarScanner::new(reader.clone()));
        self.backing = Backing::Ranged(reader);
    }

    async fn step_remote_tar(
        &mut self,
        mut scanner: RemoteTarScanner<dyn ReadAt>,
    ) -> Result<Option<Vec<ArchiveEntry>>> {
        let next = scanner.next_entry(&self.cancel).await;
        match next {
            Ok(Some(entry)) => {
                self.phase = Phase::RemoteTar(scanner);
                Ok(Some(vec![entry]))
            }
            Ok(None) => Ok(None),
            Err(e) if self.can_fall_back(&e) => self.fallback_full(e).await.map(Some),
            Err(e) => Err(e),
        }
    }

    async fn step_gzip(&mut self, mut gzip: Box<GzipPhase>) -> Result<Option<Vec<ArchiveEntry>>> {
        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(ArchiveError::Cancelled),
                next = gzip.chunks.next() => next,
            };

            match next {
                Some(Ok(chunk)) => {
                    let progress = gzip.stream.push(&chunk)?;
                    self.accumulate(&progress.decompressed);
                    if !progress.entries.is_empty() {
                        self.phase = Phase::Gzip(gzip);
                        return Ok(Some(progress.entries));
                    }
                }
                Some(Err(e)) => {
                    drop(gzip);
                    if self.can_fall_back(&e) {
                        return self.fallback_full(e).await.map(Some);
                    }
                    return Err(e);
                }
                None => {
                    let progress = gzip.stream.finish()?;
                    self.accumulate(&progress.decompressed);
                    if let Backing::Accumulating(buf) =
                        std::mem::replace(&mut self.backing, Backing::Empty)
                    {
                        debug!(decompressed = buf.len(), "gzip stream complete");
                        self.backing = Backing::Buffer(buf.freeze());
                    }
                    return Ok(Some(progress.entries));
                }
            }
        }
    }

    fn accumulate(&mut self, decompressed: &[u8]) {
        if let Backing::Accumulating(buf) = &mut self.backing {
            buf.extend_from_slice(decompressed);
        }
    }

    fn index_tar_gz(&mut self, compressed: &[u8]) -> Result<Vec<ArchiveEntry>> {
        let tar = Bytes::from(decompress_all(compressed)?);
        let entries = scan_buffer(&tar)?;
        self.backing = Backing::Buffer(tar);
        Ok(entries)
    }

    /// Download the whole archive and parse it from memory.
    async fn fallback_full(&mut self, cause: ArchiveError) -> Result<Vec<ArchiveEntry>> {
        self.fell_back = true;
        self.phase = Phase::Done;
        self.backing = Backing::Empty;
        warn!(cause = %cause, "falling back to full download");

        let data = self.http()?.download(&self.cancel).await?;
        match self.format {
            ArchiveFormat::Zip => {
                let entries = index_buffer(&data)?;
                self.backing = Backing::Buffer(data);
                Ok(entries)
            }
            ArchiveFormat::Tar => {
                let entries = scan_buffer(&data)?;
                self.backing = Backing::Buffer(data);
                Ok(entries)
            }
            ArchiveFormat::TarGz => self.index_tar_gz(&data),
            ArchiveFormat::Unsupported => Err(ArchiveError::UnsupportedFormat(self.source.name())),
        }
    }

    /// Fetch exactly one entry's bytes.
    ///
    /// Failures concern only this entry; the discovered list stays valid.
    pub async fn extract(&self, entry: &ArchiveEntry) -> Result<Bytes> {
        if entry.directory {
            return Err(ArchiveError::Unsupported(format!(
                "{} is a directory",
                entry.filename
            )));
        }

        match (&entry.handle, &self.backing) {
            (EntryHandle::Zip { .. }, Backing::Ranged(reader)) => {
                ZipExtractor::new(reader.clone())
                    .extract_to_memory(entry, &self.cancel)
                    .await
            }
            (EntryHandle::Zip { .. }, Backing::Buffer(data)) => {
                ZipExtractor::new(Arc::new(BufferReader::new(data.clone())))
                    .extract_to_memory(entry, &self.cancel)
                    .await
            }
            (EntryHandle::Tar { data_offset, length }, Backing::Ranged(reader)) => {
                let data = reader
                    .read_range(ByteRange::new(*data_offset, *length), &self.cancel)
                    .await?;
                if (data.len() as u64) < *length {
                    return Err(ArchiveError::malformed(format!(
                        "{} is truncated",
                        entry.filename
                    )));
                }
                Ok(data)
            }
            (EntryHandle::Tar { data_offset, length }, Backing::Buffer(data)) => {
                slice_entry(data, *data_offset, *length, &entry.filename)
            }
            (EntryHandle::Tar { data_offset, length }, Backing::Accumulating(buf)) => {
                let end = data_offset.saturating_add(*length);
                if end > buf.len() as u64 {
                    return Err(ArchiveError::Unsupported(format!(
                        "{} has not been downloaded yet",
                        entry.filename
                    )));
                }
                Ok(Bytes::copy_from_slice(
                    &buf[*data_offset as usize..end as usize],
                ))
            }
            (EntryHandle::Synthetic, _) => Err(ArchiveError::Unsupported(format!(
                "{} is not stored in the archive",
                entry.filename
            ))),
            _ => Err(ArchiveError::Unsupported(format!(
                "{} does not belong to this session",
                entry.filename
            ))),
        }
    }

    /// Extract file to disk
    pub async fn extract_to_file(&self, entry: &ArchiveEntry, output_path: &Path) -> Result<()> {
        // Create parent directories if needed
        if let Some(parent) = output_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let data = self.extract(entry).await?;

        let mut file = fs::File::create(output_path).await?;
        file.write_all(&data).await?;
        file.flush().await?;

        Ok(())
    }

    /// Extract an entry into any async writer, e.g. stdout.
    pub async fn extract_to_writer<W: AsyncWrite + Unpin>(
        &self,
        entry: &ArchiveEntry,
        writer: &mut W,
    ) -> Result<()> {
        let data = self.extract(entry).await?;
        writer.write_all(&data).await?;
        writer.flush().await?;
        Ok(())
    }
}

fn slice_entry(data: &Bytes, offset: u64, length: u64, name: &str) -> Result<Bytes> {
    let end = offset.saturating_add(length);
    if end > data.len() as u64 {
        return Err(ArchiveError::malformed(format!("{name} is truncated")));
    }
    Ok(data.slice(offset as usize..end as usize))
}

/// Holds at most one discovery session; loading a new archive cancels the
/// previous session first.
#[derive(Default)]
pub struct ArchiveView {
    config: EngineConfig,
    session: Option<DiscoverySession>,
}

impl ArchiveView {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            session: None,
        }
    }

    pub fn load(&mut self, source: ArchiveSource) -> Result<&mut DiscoverySession> {
        self.close();
        let session = DiscoverySession::open(source, self.config.clone())?;
        Ok(self.session.insert(session))
    }

    pub fn session(&self) -> Option<&DiscoverySession> {
        self.session.as_ref()
    }

    pub fn session_mut(&mut self) -> Option<&mut DiscoverySession> {
        self.session.as_mut()
    }

    pub fn close(&mut self) {
        if let Some(previous) = self.session.take() {
            previous.cancel();
        }
    }
}
