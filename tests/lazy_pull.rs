//! End-to-end reads over the full stack: remote range reader, both chunk
//! caches, archive reader and the node layer, with the registry transport
//! replaced by a recording mock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use stargz_archive::testutil::ArchiveBuilder;
use stargz_archive::{ArchiveReader, ReadAt};
use stargz_cache::MemoryCache;
use stargz_fuse::{LayerState, NodeTable};
use stargz_remote::{BlobReader, RemoteError, RemoteFetcher};
use stargz_tools::byte_pool::BufferPool;

const HTTP_CHUNK_SIZE: u64 = 8192;

struct MockTransport {
    blob: Vec<u8>,
    requests: Mutex<Vec<(u64, u64)>>,
}

impl MockTransport {
    fn new(blob: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            blob,
            requests: Mutex::new(Vec::new()),
        })
    }

    fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

impl RemoteFetcher for MockTransport {
    fn fetch_range(&self, start: u64, len: u64) -> Result<Vec<u8>, RemoteError> {
        self.requests.lock().unwrap().push((start, len));
        let end = ((start + len) as usize).min(self.blob.len());
        Ok(self.blob[start as usize..end].to_vec())
    }

    fn check_reachable(&self) -> Result<(), RemoteError> {
        Ok(())
    }

    fn id(&self) -> String {
        "https://registry.test/v2/layer/blobs/sha256:fixture".to_string()
    }
}

/// Deterministic but incompressible filler, so the blob spans several
/// transport chunks.
fn noise(len: usize) -> Vec<u8> {
    let mut state = 0x2545f491u64;
    (0..len)
        .map(|_| {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (state >> 33) as u8
        })
        .collect()
}

struct Fixture {
    transport: Arc<MockTransport>,
    blob_reader: Arc<BlobReader>,
    archive: Arc<ArchiveReader>,
    fs_cache: Arc<MemoryCache>,
    os_release: Vec<u8>,
    filler: Vec<u8>,
}

fn fixture() -> Fixture {
    let os_release = b"NAME=\"Test Linux\"\nID=test\nVERSION_ID=1.0\n".repeat(7);
    assert!(os_release.len() < 512);
    let filler = noise(64 * 1024);

    let mut builder = ArchiveBuilder::new();
    builder.dir("etc", 0o755);
    builder.file("etc/os-release", &os_release, 0o644);
    builder.file("var-log-noise", &filler, 0o600);
    let blob = builder.build();
    let size = blob.len() as u64;
    assert!(size > 4 * HTTP_CHUNK_SIZE, "fixture blob too small");

    let transport = MockTransport::new(blob);
    let pool = Arc::new(BufferPool::new(16));
    let blob_reader = Arc::new(BlobReader::new(
        transport.clone() as Arc<dyn RemoteFetcher>,
        size,
        HTTP_CHUNK_SIZE,
        Arc::new(MemoryCache::new()),
        Arc::clone(&pool),
        Duration::from_secs(60),
    ));
    let fs_cache = Arc::new(MemoryCache::new());
    let archive = Arc::new(
        ArchiveReader::open(
            Arc::clone(&blob_reader) as Arc<dyn ReadAt>,
            size,
            fs_cache.clone() as Arc<dyn stargz_cache::BlobCache>,
            pool,
            true,
        )
        .unwrap(),
    );

    Fixture {
        transport,
        blob_reader,
        archive,
        fs_cache,
        os_release,
        filler,
    }
}

fn node_table(fx: &Fixture) -> NodeTable {
    let state = Arc::new(LayerState::new("sha256:fixture".into(), fx.blob_reader.size(), {
        let blob = Arc::clone(&fx.blob_reader);
        Box::new(move || blob.fetched_size())
    }));
    NodeTable::build(Arc::clone(&fx.archive), state)
}

#[test]
fn test_cold_then_warm_read() {
    let fx = fixture();

    // nothing decompressed has been cached before the first read
    assert!(fx.fs_cache.is_empty());
    let before = fx.transport.request_count();

    let id = fx.archive.open_file("etc/os-release").unwrap();
    let mut buf = vec![0u8; fx.os_release.len()];
    let n = fx.archive.read_file_at(id, &mut buf, 0).unwrap();
    assert_eq!(n, fx.os_release.len());
    assert_eq!(buf, fx.os_release);

    // the file's compressed span sits inside one transport chunk
    assert_eq!(fx.transport.request_count(), before + 1);
    assert!(fx.fs_cache.len() >= 1);

    // the warm read is identical and issues no further GETs
    let mut again = vec![0u8; fx.os_release.len()];
    assert_eq!(fx.archive.read_file_at(id, &mut again, 0).unwrap(), again.len());
    assert_eq!(again, buf);
    assert_eq!(fx.transport.request_count(), before + 1);
}

#[test]
fn test_large_file_spans_transport_chunks() {
    let fx = fixture();
    let id = fx.archive.open_file("var-log-noise").unwrap();

    let mut buf = vec![0u8; fx.filler.len()];
    assert_eq!(fx.archive.read_file_at(id, &mut buf, 0).unwrap(), buf.len());
    assert_eq!(buf, fx.filler);

    // every transport request was chunk-aligned
    for &(start, len) in fx.transport.requests.lock().unwrap().iter() {
        assert_eq!(start % HTTP_CHUNK_SIZE, 0);
        assert!(len <= HTTP_CHUNK_SIZE);
    }
}

#[test]
fn test_read_through_node_layer() {
    let fx = fixture();
    let table = node_table(&fx);

    let etc = table.lookup(NodeTable::ROOT_INO, "etc").unwrap();
    let file = table.lookup(etc.ino, "os-release").unwrap();
    assert_eq!(file.size, fx.os_release.len() as u64);

    let data = table.read(file.ino, 0, fx.os_release.len() + 100).unwrap();
    assert_eq!(data, fx.os_release);

    // reads in odd windows stitch back to the same bytes
    let mut stitched = Vec::new();
    let mut off = 0u64;
    loop {
        let part = table.read(file.ino, off, 37).unwrap();
        if part.is_empty() {
            break;
        }
        off += part.len() as u64;
        stitched.extend(part);
    }
    assert_eq!(stitched, fx.os_release);
}

#[test]
fn test_state_file_reports_progress() {
    let fx = fixture();
    let table = node_table(&fx);

    let state_dir = table.lookup(NodeTable::ROOT_INO, ".stargz-snapshotter").unwrap();
    let stat = table.lookup(state_dir.ino, "sha256:fixture.json").unwrap();

    let parse = |table: &NodeTable| -> serde_json::Value {
        let data = table.read(stat.ino, 0, 1 << 16).unwrap();
        serde_json::from_slice(&data).unwrap()
    };

    let doc = parse(&table);
    assert_eq!(doc["digest"], "sha256:fixture");
    assert_eq!(doc["size"], fx.blob_reader.size());
    // opening the archive already pulled the footer and TOC, nothing more
    let initial = doc["fetchedSize"].as_u64().unwrap();
    assert!(initial < fx.blob_reader.size());

    // pull a file and watch the ratio move
    let id = fx.archive.open_file("var-log-noise").unwrap();
    let mut buf = vec![0u8; fx.filler.len()];
    fx.archive.read_file_at(id, &mut buf, 0).unwrap();

    let doc = parse(&table);
    let fetched = doc["fetchedSize"].as_u64().unwrap();
    assert!(fetched > initial);
    let percent = doc["fetchedPercent"].as_f64().unwrap();
    assert!(percent > 0.0 && percent <= 100.0);
    let expected = fetched as f64 / fx.blob_reader.size() as f64 * 100.0;
    assert!((percent - expected).abs() < 1e-9);
}

#[test]
fn test_background_walk_hydrates_everything() {
    let fx = fixture();

    let progress = AtomicUsize::new(0);
    let token = stargz_tools::background_task::CancelToken::unbounded();
    assert!(fx
        .archive
        .fetch_all(&*fx.blob_reader, &token, &progress)
        .unwrap());
    assert_eq!(progress.load(Ordering::SeqCst), fx.archive.index().len());

    // all later reads are local
    let before = fx.transport.request_count();
    for (name, content) in [("etc/os-release", &fx.os_release), ("var-log-noise", &fx.filler)] {
        let id = fx.archive.open_file(name).unwrap();
        let mut buf = vec![0u8; content.len()];
        assert_eq!(fx.archive.read_file_at(id, &mut buf, 0).unwrap(), buf.len());
        assert_eq!(&buf, content);
    }
    assert_eq!(fx.transport.request_count(), before);
}

#[test]
fn test_annotate_descriptor() {
    let descriptor = stargz_store::Descriptor {
        digest: "sha256:1234".into(),
        size: 4096,
        annotations: HashMap::from([(
            stargz_store::fs::IMAGE_REF_ANNOTATION.to_string(),
            "registry.example.com/app:v1".to_string(),
        )]),
    };
    let labels = stargz_store::annotate(&descriptor).unwrap();
    assert_eq!(
        labels.get(stargz_store::fs::TARGET_REF_LABEL).unwrap(),
        "registry.example.com/app:v1"
    );
    assert_eq!(
        labels.get(stargz_store::fs::TARGET_DIGEST_LABEL).unwrap(),
        "sha256:1234"
    );
    assert_eq!(labels.get(stargz_store::fs::TARGET_SIZE_LABEL).unwrap(), "4096");

    let bare = stargz_store::Descriptor {
        digest: "sha256:1234".into(),
        size: 4096,
        annotations: HashMap::new(),
    };
    assert!(stargz_store::annotate(&bare).is_err());
}

#[test]
fn test_mount_requires_labels() {
    let root = std::env::temp_dir().join("stargz-store-test-labels");
    let _ = std::fs::remove_dir_all(&root);

    let mut config = stargz_store::Config::default();
    config.http_cache_type = stargz_store::config::CacheType::Memory;
    config.filesystem_cache_type = stargz_store::config::CacheType::Memory;
    let store = stargz_store::StargzStore::new(&root, config).unwrap();

    let err = store
        .mount(&root.join("mnt"), &HashMap::new())
        .unwrap_err();
    assert!(err.to_string().contains("stargz.reference"));

    let labels = HashMap::from([
        (
            stargz_store::fs::TARGET_REF_LABEL.to_string(),
            "registry.example.com/app:v1".to_string(),
        ),
        (
            stargz_store::fs::TARGET_DIGEST_LABEL.to_string(),
            "sha256:1234".to_string(),
        ),
        (
            stargz_store::fs::TARGET_SIZE_LABEL.to_string(),
            "not-a-number".to_string(),
        ),
    ]);
    let err = store.mount(&root.join("mnt"), &labels).unwrap_err();
    assert!(err.to_string().contains("stargz.size"));

    let _ = std::fs::remove_dir_all(&root);
}
