//! Mount orchestration.
//!
//! Wires the remote transport, the caches, the archive reader and the
//! FUSE node layer together: `mount` runs the whole pipeline as
//! prioritized work, dispatches the landmark prefetch and the whole-blob
//! background fetch, and registers the layer record under its mountpoint.
//! `check`, `annotate` and `unregister` are the remaining surface the
//! snapshotter drives.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Error, format_err};

use stargz_archive::reader::read_exact_at;
use stargz_archive::{ArchiveReader, ReadAt};
use stargz_cache::{BlobCache, DirectoryCache, MemoryCache};
use stargz_fuse::{LayerState, NodeTable};
use stargz_remote::{BlobReader, Reference, Resolver};
use stargz_tools::background_task::BackgroundTaskManager;
use stargz_tools::byte_pool::BufferPool;

use crate::config::{CacheType, Config};

/// Labels the snapshotter passes alongside a mount request.
pub const TARGET_REF_LABEL: &str = "containerd.io/snapshot/remote/stargz.reference";
pub const TARGET_DIGEST_LABEL: &str = "containerd.io/snapshot/remote/stargz.digest";
pub const TARGET_SIZE_LABEL: &str = "containerd.io/snapshot/remote/stargz.size";
/// Descriptor annotation seeding the reference label.
pub const IMAGE_REF_ANNOTATION: &str = "containerd.io/unpacker/ref.name";

/// The slice of an OCI descriptor this store consumes.
#[derive(Debug, Clone)]
pub struct Descriptor {
    pub digest: String,
    pub size: u64,
    pub annotations: HashMap<String, String>,
}

/// Translate a descriptor into the labels `mount` consumes.
pub fn annotate(descriptor: &Descriptor) -> Result<HashMap<String, String>, Error> {
    let reference = descriptor
        .annotations
        .get(IMAGE_REF_ANNOTATION)
        .ok_or_else(|| format_err!("descriptor carries no {} annotation", IMAGE_REF_ANNOTATION))?;
    Ok(HashMap::from([
        (TARGET_REF_LABEL.to_string(), reference.clone()),
        (TARGET_DIGEST_LABEL.to_string(), descriptor.digest.clone()),
        (TARGET_SIZE_LABEL.to_string(), descriptor.size.to_string()),
    ]))
}

struct Layer {
    blob: Arc<BlobReader>,
    /// Unmounts on drop.
    _session: fuser::BackgroundSession,
    stop: Arc<AtomicBool>,
}

impl Drop for Layer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

pub struct StargzStore {
    config: Config,
    resolver: Resolver,
    tasks: Arc<BackgroundTaskManager>,
    pool: Arc<BufferPool>,
    http_cache: Arc<dyn BlobCache>,
    fs_cache: Arc<dyn BlobCache>,
    layers: Mutex<HashMap<PathBuf, Layer>>,
}

impl StargzStore {
    /// Open a store keeping its caches under `root`.
    pub fn new(root: &Path, config: Config) -> Result<Arc<Self>, Error> {
        let pool = Arc::new(BufferPool::new(64));
        let http_cache = build_cache(
            config.http_cache_type,
            &root.join("httpcache"),
            &config,
            &pool,
        )?;
        let fs_cache = build_cache(
            config.filesystem_cache_type,
            &root.join("fscache"),
            &config,
            &pool,
        )?;
        let resolver = Resolver::new(&config.insecure)?;
        Ok(Arc::new(Self {
            config,
            resolver,
            tasks: Arc::new(BackgroundTaskManager::default()),
            pool,
            http_cache,
            fs_cache,
            layers: Mutex::new(HashMap::new()),
        }))
    }

    /// Mount the layer described by `labels` at `mountpoint` and return
    /// once the kernel serves it.
    pub fn mount(
        self: &Arc<Self>,
        mountpoint: &Path,
        labels: &HashMap<String, String>,
    ) -> Result<(), Error> {
        let _prio = self.tasks.begin_priority();

        let reference = labels
            .get(TARGET_REF_LABEL)
            .ok_or_else(|| format_err!("missing {} label", TARGET_REF_LABEL))?;
        let digest = labels
            .get(TARGET_DIGEST_LABEL)
            .ok_or_else(|| format_err!("missing {} label", TARGET_DIGEST_LABEL))?;
        let size: u64 = labels
            .get(TARGET_SIZE_LABEL)
            .ok_or_else(|| format_err!("missing {} label", TARGET_SIZE_LABEL))?
            .parse()
            .with_context(|| format!("unparseable {} label", TARGET_SIZE_LABEL))?;

        let reference = Reference::parse(reference)?;
        if self.config.debug {
            log::debug!(
                "mounting {}@{} ({} bytes) on {:?}",
                reference.canonical(),
                digest,
                size,
                mountpoint
            );
        }

        let transport = self.resolver.resolve(&reference, digest)?;
        let blob = Arc::new(BlobReader::new(
            transport,
            size,
            self.config.http_chunk_size,
            Arc::clone(&self.http_cache),
            Arc::clone(&self.pool),
            self.config.layer_valid_interval(),
        ));

        // even archive-index reads during the mount are prioritized work
        let section: Arc<dyn ReadAt> = Arc::new(PrioritySectionReader {
            inner: Arc::clone(&blob) as Arc<dyn ReadAt>,
            tasks: Arc::clone(&self.tasks),
        });
        let archive = Arc::new(
            ArchiveReader::open(
                Arc::clone(&section),
                size,
                Arc::clone(&self.fs_cache),
                Arc::clone(&self.pool),
                self.config.verify_chunks,
            )
            .with_context(|| format!("opening layer {}", digest))?,
        );

        let stop = Arc::new(AtomicBool::new(false));
        if !self.config.noprefetch {
            self.dispatch_prefetch(&archive, &section)?;
            self.spawn_background_fetch(&archive, &blob, &stop);
        }

        let state = Arc::new(LayerState::new(digest.clone(), size, {
            let blob = Arc::clone(&blob);
            Box::new(move || blob.fetched_size())
        }));
        let table = NodeTable::build(Arc::clone(&archive), state);
        let session = stargz_fuse::mount(table, mountpoint)
            .with_context(|| format!("serving FUSE session on {:?}", mountpoint))?;

        self.layers.lock().unwrap().insert(
            mountpoint.to_path_buf(),
            Layer {
                blob,
                _session: session,
                stop,
            },
        );
        Ok(())
    }

    /// Fetch the landmark prefix now (prioritized, we hold a slot) and
    /// commit it to the cache concurrently. The commit uses only the
    /// cache-add path, so it cannot deadlock against the priority gate.
    fn dispatch_prefetch(
        &self,
        archive: &Arc<ArchiveReader>,
        section: &Arc<dyn ReadAt>,
    ) -> Result<(), Error> {
        let Some(range) = archive.prefetch_range() else {
            return Ok(());
        };
        let mut prefix = vec![0u8; (range.end - range.start) as usize];
        read_exact_at(section.as_ref(), &mut prefix, range.start)
            .context("fetching prefetch prefix")?;
        let archive = Arc::clone(archive);
        std::thread::spawn(move || {
            if let Err(err) = archive.cache_prefix(&prefix) {
                log::warn!("prefetch commit failed: {:#}", err);
            }
        });
        Ok(())
    }

    fn spawn_background_fetch(
        &self,
        archive: &Arc<ArchiveReader>,
        blob: &Arc<BlobReader>,
        stop: &Arc<AtomicBool>,
    ) {
        let tasks = Arc::clone(&self.tasks);
        let archive = Arc::clone(archive);
        let blob = Arc::clone(blob);
        let stop = Arc::clone(stop);
        let timeout = self.config.background_fetch_timeout();
        std::thread::spawn(move || {
            let progress = AtomicUsize::new(0);
            loop {
                if stop.load(Ordering::SeqCst) {
                    return;
                }
                let slice =
                    tasks.run_background(timeout, |token| archive.fetch_all(&*blob, token, &progress));
                match slice {
                    Ok(true) => {
                        log::debug!("layer fully hydrated in the background");
                        return;
                    }
                    // preempted or timed out: wait for the next quiet window
                    Ok(false) => continue,
                    Err(err) => {
                        // background failures never propagate
                        log::warn!("background fetch aborted: {:#}", err);
                        return;
                    }
                }
            }
        });
    }

    /// Liveness check of a mounted layer.
    pub fn check(&self, mountpoint: &Path) -> Result<(), Error> {
        let _prio = self.tasks.begin_priority();
        let blob = self
            .layers
            .lock()
            .unwrap()
            .get(mountpoint)
            .map(|layer| Arc::clone(&layer.blob))
            .ok_or_else(|| format_err!("internal: no layer registered on {:?}", mountpoint))?;
        blob.check()?;
        Ok(())
    }

    /// Drop the layer record for `mountpoint`. Unmounts the FUSE session
    /// and stops the background fetch.
    pub fn unregister(&self, mountpoint: &Path) -> bool {
        self.layers.lock().unwrap().remove(mountpoint).is_some()
    }

    pub fn unmount(&self, mountpoint: &Path) -> Result<(), Error> {
        if !self.unregister(mountpoint) {
            return Err(format_err!("no layer mounted on {:?}", mountpoint));
        }
        Ok(())
    }
}

struct PrioritySectionReader {
    inner: Arc<dyn ReadAt>,
    tasks: Arc<BackgroundTaskManager>,
}

impl ReadAt for PrioritySectionReader {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let _guard = self.tasks.begin_priority();
        self.inner.read_at(buf, offset)
    }
}

fn build_cache(
    kind: CacheType,
    dir: &Path,
    config: &Config,
    pool: &Arc<BufferPool>,
) -> Result<Arc<dyn BlobCache>, Error> {
    Ok(match kind {
        CacheType::Memory => Arc::new(MemoryCache::new()),
        CacheType::Directory => Arc::new(
            DirectoryCache::new(dir, config.lru_max_entry, Arc::clone(pool), config.sync_add)
                .with_context(|| format!("opening cache directory {:?}", dir))?,
        ),
    })
}
