mod common;

use std::time::Duration;

use arcpeek::{
    ArchiveError, ArchiveSource, ArchiveView, DiscoverySession, EngineConfig, list_contents,
};
use common::{RangeServer, ServerConfig, gzip, noise, tar_archive, zip_archive};
use httpmock::prelude::*;

fn session_for(url: String, config: EngineConfig) -> DiscoverySession {
    DiscoverySession::open(ArchiveSource::Url(url), config).unwrap()
}

fn numbered(prefix: &str, count: usize, size: usize) -> Vec<(String, Vec<u8>)> {
    (0..count)
        .map(|i| (format!("{prefix}{i:02}.bin"), noise(size, i as u64)))
        .collect()
}

#[tokio::test]
async fn zip_listing_reads_only_the_tail() {
    let files = numbered("data/file-", 40, 16 * 1024);
    let archive = zip_archive(&files, false, None);
    let server = RangeServer::start(archive.clone()).await;

    let config = EngineConfig {
        zip_tail_window: 4096,
        ..EngineConfig::default()
    };
    let mut session = session_for(server.url("big.zip"), config);
    let entries = session.discover_all().await.unwrap();

    // "data" is synthesised
    assert_eq!(entries.len(), 41);
    assert!(entries.get("data").unwrap().directory);
    for (name, data) in &files {
        let entry = entries.get(name).unwrap();
        assert_eq!(entry.uncompressed_size, data.len() as u64);
        assert!(!entry.directory);
    }

    assert_eq!(server.ranged_gets(), 1);
    assert_eq!(server.full_gets(), 0);
    let stats = session.transfer_stats().unwrap();
    assert!(stats.bytes() <= 4096, "read {} bytes", stats.bytes());
    assert!((stats.bytes() as usize) < archive.len() / 100);
}

#[tokio::test]
async fn zip_extraction_reads_one_entry() {
    let files = numbered("data/file-", 10, 16 * 1024);
    let server = RangeServer::start(zip_archive(&files, false, None)).await;

    let mut session = session_for(server.url("a.zip"), EngineConfig::default());
    session.discover_all().await.unwrap();
    let before = session.transfer_stats().unwrap().bytes();
    let gets = server.ranged_gets();

    let entry = session.entries().get("data/file-07.bin").unwrap().clone();
    let data = session.extract(&entry).await.unwrap();
    assert_eq!(data, files[7].1);

    assert!(server.ranged_gets() - gets <= 2);
    let read = session.transfer_stats().unwrap().bytes() - before;
    assert!(read < 17 * 1024, "read {read} bytes for a 16 KiB entry");
}

#[tokio::test]
async fn zip_deflate_round_trip() {
    let text = "the quick brown fox jumps over the lazy dog\n".repeat(500);
    let files = vec![
        ("docs/".to_string(), Vec::new()),
        ("docs/fox.txt".to_string(), text.clone().into_bytes()),
        ("empty.txt".to_string(), Vec::new()),
    ];
    let server = RangeServer::start(zip_archive(&files, true, None)).await;

    let mut session = session_for(server.url("docs.zip"), EngineConfig::default());
    session.discover_all().await.unwrap();

    let root = list_contents(session.entries().as_slice(), "");
    assert_eq!(root.directories, ["docs"]);
    assert_eq!(root.files.len(), 1);

    let fox = session.entries().get("docs/fox.txt").unwrap().clone();
    assert!(fox.compressed_size < fox.uncompressed_size);
    assert_eq!(session.extract(&fox).await.unwrap(), text.as_bytes());

    let empty = session.entries().get("empty.txt").unwrap().clone();
    assert!(session.extract(&empty).await.unwrap().is_empty());
}

#[tokio::test]
async fn zip_with_long_comment_is_found() {
    let files = vec![("a.txt", b"alpha".to_vec()), ("b.txt", b"beta".to_vec())];
    let comment = "c".repeat(40_000);
    let server = RangeServer::start(zip_archive(&files, false, Some(&comment))).await;

    let mut session = session_for(server.url("c.zip"), EngineConfig::default());
    let entries = session.discover_all().await.unwrap();

    let names: Vec<_> = entries.iter().map(|e| e.filename.as_str()).collect();
    assert_eq!(names, ["a.txt", "b.txt"]);
    assert_eq!(server.full_gets(), 0);
}

#[tokio::test]
async fn tar_discovery_is_one_header_read_per_entry() {
    let files = numbered("part-", 5, 50_000);
    let archive = tar_archive(&files);
    let server = RangeServer::start(archive.clone()).await;

    let mut session = session_for(server.url("parts.tar"), EngineConfig::default());
    let mut batches = 0;
    while let Some(batch) = session.next_batch().await.unwrap() {
        assert_eq!(batch.len(), 1);
        batches += 1;
    }
    assert_eq!(batches, 5);

    // five headers plus the end-of-archive block
    assert_eq!(server.ranged_gets(), 6);
    assert_eq!(session.transfer_stats().unwrap().bytes(), 6 * 512);

    let entry = session.entries().get("part-03.bin").unwrap().clone();
    assert_eq!(entry.uncompressed_size, 50_000);
    assert!(entry.last_modified.is_some());
    assert_eq!(session.extract(&entry).await.unwrap(), files[3].1);
    assert_eq!(server.ranged_gets(), 7);
}

#[tokio::test]
async fn tar_gz_entries_arrive_before_the_download_ends() {
    let files = numbered("blob-", 200, 8 * 1024);
    let compressed = gzip(&tar_archive(&files));
    let server = RangeServer::with_config(
        compressed.clone(),
        ServerConfig {
            chunk_size: 16 * 1024,
            chunk_delay: Some(Duration::from_millis(10)),
            ..ServerConfig::default()
        },
    )
    .await;

    let mut session = session_for(server.url("blobs.tar.gz"), EngineConfig::default());
    let first = session.next_batch().await.unwrap().unwrap();
    assert_eq!(first[0].filename, "blob-00.bin");

    let received = session.transfer_stats().unwrap().bytes();
    assert!((received as usize) < compressed.len() / 2);

    session.cancel();
    let err = session.next_batch().await.unwrap_err();
    assert!(err.is_cancelled());
    assert!(session.entries().len() < files.len());

    tokio::time::sleep(Duration::from_millis(100)).await;
    let after = session.transfer_stats().unwrap().bytes();
    assert!((after as usize) < compressed.len());
}

#[tokio::test]
async fn tar_gz_stream_matches_buffer_parse() {
    let files = numbered("dir/sub/item-", 12, 3000);
    let compressed = gzip(&tar_archive(&files));
    let server = RangeServer::start(compressed.clone()).await;

    let mut remote = session_for(server.url("x.tgz"), EngineConfig::default());
    remote.discover_all().await.unwrap();

    let mut local = DiscoverySession::open(
        ArchiveSource::Buffer {
            name: "x.tgz".into(),
            data: compressed.into(),
        },
        EngineConfig::default(),
    )
    .unwrap();
    local.discover_all().await.unwrap();

    assert_eq!(remote.entries().as_slice(), local.entries().as_slice());
    assert_eq!(remote.entries().len(), 14);
    assert_eq!(server.full_gets(), 1);

    let entry = remote.entries().get("dir/sub/item-05.bin").unwrap().clone();
    assert_eq!(remote.extract(&entry).await.unwrap(), files[5].1);
    assert_eq!(server.full_gets(), 1);
}

#[tokio::test]
async fn tar_gz_without_streaming_downloads_first() {
    let files = numbered("f", 3, 100);
    let server = RangeServer::start(gzip(&tar_archive(&files))).await;

    let config = EngineConfig {
        stream_gzip: false,
        ..EngineConfig::default()
    };
    let mut session = session_for(server.url("f.tar.gz"), config);
    let batch = session.next_batch().await.unwrap().unwrap();
    assert_eq!(batch.len(), 3);
    assert!(session.next_batch().await.unwrap().is_none());
    assert_eq!(server.full_gets(), 1);
}

#[tokio::test]
async fn ignored_ranges_fall_back_to_full_download() {
    let files = numbered("data/file-", 5, 4096);
    let archive = zip_archive(&files, false, None);
    let server = RangeServer::with_config(
        archive.clone(),
        ServerConfig {
            ranges: false,
            ..ServerConfig::default()
        },
    )
    .await;

    let mut session = session_for(server.url("a.zip"), EngineConfig::default());
    let entries = session.discover_all().await.unwrap();
    assert_eq!(entries.len(), 6);
    assert_eq!(server.full_gets(), 1);

    // extraction is served from the downloaded copy
    let requests = server.requests().len();
    let entry = session.entries().get("data/file-02.bin").unwrap().clone();
    assert_eq!(session.extract(&entry).await.unwrap(), files[2].1);
    assert_eq!(server.requests().len(), requests);
}

#[tokio::test]
async fn advertised_no_ranges_skip_straight_to_download() {
    let files = numbered("t", 4, 1000);
    let server = RangeServer::with_config(
        tar_archive(&files),
        ServerConfig {
            advertise_none: true,
            ..ServerConfig::default()
        },
    )
    .await;

    let mut session = session_for(server.url("t.tar"), EngineConfig::default());
    let first = session.next_batch().await.unwrap().unwrap();
    assert_eq!(first.len(), 4);
    assert_eq!(server.ranged_gets(), 0);
    assert_eq!(server.full_gets(), 1);
}

#[tokio::test]
async fn unsupported_format_makes_no_requests() {
    let server = RangeServer::start(b"Rar!".to_vec()).await;

    let err = DiscoverySession::open(
        ArchiveSource::Url(server.url("file.rar")),
        EngineConfig::default(),
    )
    .err()
    .unwrap();
    assert!(matches!(err, ArchiveError::UnsupportedFormat(_)));
    assert!(server.requests().is_empty());

    let err = DiscoverySession::open(
        ArchiveSource::Url(server.url("notes.gz")),
        EngineConfig::default(),
    )
    .err()
    .unwrap();
    assert!(matches!(err, ArchiveError::UnsupportedFormat(_)));
}

#[tokio::test]
async fn missing_archive_is_a_transfer_failure() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.path("/missing.zip");
            then.status(404);
        })
        .await;

    let mut session = session_for(server.url("/missing.zip"), EngineConfig::default());
    let err = session.next_batch().await.unwrap_err();
    assert!(matches!(err, ArchiveError::TransferFailure(_)), "{err}");
    assert!(mock.hits_async().await >= 2);
    assert!(session.is_done());
}

#[tokio::test]
async fn loading_a_new_archive_cancels_the_old_one() {
    let files = numbered("slow-", 50, 8 * 1024);
    let server = RangeServer::with_config(
        gzip(&tar_archive(&files)),
        ServerConfig {
            chunk_size: 8 * 1024,
            chunk_delay: Some(Duration::from_millis(20)),
            ..ServerConfig::default()
        },
    )
    .await;

    let mut view = ArchiveView::new(EngineConfig::default());
    let session = view.load(ArchiveSource::Url(server.url("slow.tar.gz"))).unwrap();
    session.next_batch().await.unwrap();
    let old = session.cancel_token();

    let session = view
        .load(ArchiveSource::Buffer {
            name: "quick.tar".into(),
            data: tar_archive(&[("q.txt", b"q".to_vec())]).into(),
        })
        .unwrap();
    assert!(old.is_cancelled());
    assert_eq!(session.discover_all().await.unwrap().len(), 1);
}

#[tokio::test]
async fn ranged_fallback_and_buffer_agree_on_ten_entries() {
    let files = numbered("entry-", 10, 2048);
    let archive = zip_archive(&files, false, None);
    let ranged = RangeServer::start(archive.clone()).await;
    let plain = RangeServer::with_config(
        archive.clone(),
        ServerConfig {
            ranges: false,
            ..ServerConfig::default()
        },
    )
    .await;

    let mut via_ranges = session_for(ranged.url("ten.zip"), EngineConfig::default());
    let batch = via_ranges.next_batch().await.unwrap().unwrap();
    assert_eq!(batch.len(), 10);
    assert!(via_ranges.next_batch().await.unwrap().is_none());
    // tail window covers the whole directory: one ranged read, no file data
    assert_eq!(ranged.ranged_gets(), 1);

    let mut via_download = session_for(plain.url("ten.zip"), EngineConfig::default());
    via_download.discover_all().await.unwrap();
    assert_eq!(plain.full_gets(), 1);

    let mut via_buffer = DiscoverySession::open(
        ArchiveSource::Buffer {
            name: "ten.zip".into(),
            data: archive.into(),
        },
        EngineConfig::default(),
    )
    .unwrap();
    via_buffer.discover_all().await.unwrap();

    assert_eq!(via_ranges.entries().as_slice(), via_download.entries().as_slice());
    assert_eq!(via_ranges.entries().as_slice(), via_buffer.entries().as_slice());

    let entry = via_ranges.entries().get("entry-04.bin").unwrap().clone();
    let remote = via_ranges.extract(&entry).await.unwrap();
    let local = via_buffer.extract(&entry).await.unwrap();
    assert_eq!(remote, local);
    assert_eq!(remote, files[4].1);
}

#[tokio::test]
async fn tar_scan_falls_back_midway_without_repeating_entries() {
    let files = numbered("member-", 8, 3000);
    let server = RangeServer::with_config(
        tar_archive(&files),
        ServerConfig {
            range_limit: Some(3),
            ..ServerConfig::default()
        },
    )
    .await;

    let mut session = session_for(server.url("members.tar"), EngineConfig::default());
    let mut seen = Vec::new();
    let mut batches = Vec::new();
    while let Some(batch) = session.next_batch().await.unwrap() {
        batches.push(batch.len());
        seen.extend(batch.into_iter().map(|e| e.filename));
    }

    // three header reads, then the rest from one download
    assert_eq!(batches, [1, 1, 1, 5]);
    let expected: Vec<_> = files.iter().map(|(name, _)| name.clone()).collect();
    assert_eq!(seen, expected);
    assert_eq!(session.entries().len(), 8);
    assert_eq!(server.ranged_gets(), 4);
    assert_eq!(server.full_gets(), 1);

    let requests = server.requests().len();
    for index in [1, 6] {
        let entry = session.entries().get(&files[index].0).unwrap().clone();
        assert_eq!(session.extract(&entry).await.unwrap(), files[index].1);
    }
    assert_eq!(server.requests().len(), requests);
}
