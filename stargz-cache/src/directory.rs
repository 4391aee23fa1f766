//! Two-tier directory cache variant.
//!
//! Entries live in a bounded LRU of pooled buffers backed by files at
//! `<root>/<fp[0:2]>/<fp>`. The memory tier is authoritative for the
//! calling operation; the disk tier is best effort — a failed file write is
//! logged and forgotten while the in-memory publication stands.

use std::fs::{self, File};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crossbeam_channel::Sender;

use stargz_tools::byte_pool::BufferPool;
use stargz_tools::lru_cache::LruCache;

use crate::{read_exact_retry, BlobCache, CacheError, CacheKey};

struct Store {
    root: PathBuf,
    /// Serializes file creation so two writers do not collide on one path.
    create_mutex: Mutex<()>,
    pool: Arc<BufferPool>,
}

impl Store {
    fn entry_path(&self, key: &CacheKey) -> PathBuf {
        let name = hex::encode(key);
        self.root.join(&name[..2]).join(&name)
    }

    fn persist(&self, key: &CacheKey, data: &[u8]) -> std::io::Result<()> {
        let path = self.entry_path(key);
        let _guard = self.create_mutex.lock().unwrap();
        if path.exists() {
            // keys are content fingerprints, the existing file already holds
            // the same bytes
            return Ok(());
        }
        let dir = path.parent().unwrap();
        fs::create_dir_all(dir)?;
        let tmp = dir.join(format!(
            "{}.tmp.{}",
            path.file_name().unwrap().to_string_lossy(),
            std::process::id()
        ));
        let mut file = File::create(&tmp)?;
        if let Err(err) = file.write_all(data) {
            drop(file);
            let _ = fs::remove_file(&tmp);
            return Err(err);
        }
        drop(file);
        fs::rename(&tmp, &path)
    }

    fn persist_logged(&self, key: &CacheKey, data: &[u8]) {
        if let Err(err) = self.persist(key, data) {
            log::warn!(
                "failed to persist cache entry {}: {}",
                hex::encode(key),
                err
            );
        }
    }
}

pub struct DirectoryCache {
    store: Arc<Store>,
    lru: Mutex<LruCache<CacheKey, Vec<u8>>>,
    writer: Option<Sender<(CacheKey, Vec<u8>)>>,
    worker: Option<JoinHandle<()>>,
}

impl DirectoryCache {
    /// Open (or create) a directory cache rooted at `root` holding up to
    /// `max_entries` buffers in memory. With `sync_add` the disk copy is
    /// written before `add` returns, otherwise a writer thread drains adds
    /// in the background.
    pub fn new(
        root: impl Into<PathBuf>,
        max_entries: usize,
        pool: Arc<BufferPool>,
        sync_add: bool,
    ) -> std::io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        let store = Arc::new(Store {
            root,
            create_mutex: Mutex::new(()),
            pool,
        });

        let (writer, worker) = if sync_add {
            (None, None)
        } else {
            let (tx, rx) = crossbeam_channel::unbounded::<(CacheKey, Vec<u8>)>();
            let store = Arc::clone(&store);
            let handle = std::thread::spawn(move || {
                for (key, data) in rx {
                    store.persist_logged(&key, &data);
                    store.pool.put(data);
                }
            });
            (Some(tx), Some(handle))
        };

        Ok(Self {
            store,
            lru: Mutex::new(LruCache::new(max_entries)),
            writer,
            worker,
        })
    }

    #[cfg(test)]
    fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.store.entry_path(key)
    }
}

impl BlobCache for DirectoryCache {
    fn fetch(&self, key: &CacheKey, dst: &mut [u8]) -> Result<usize, CacheError> {
        {
            let mut lru = self.lru.lock().unwrap();
            if let Some(buf) = lru.get(*key) {
                if buf.len() != dst.len() {
                    return Err(CacheError::Corrupt {
                        expected: dst.len(),
                        found: buf.len(),
                    });
                }
                dst.copy_from_slice(buf);
                return Ok(dst.len());
            }
        }

        // memory tier missed, try the file. All I/O happens with the LRU
        // lock released.
        let path = self.store.entry_path(key);
        let meta = fs::metadata(&path).map_err(|_| CacheError::Miss)?;
        if meta.len() != dst.len() as u64 {
            return Err(CacheError::Corrupt {
                expected: dst.len(),
                found: meta.len() as usize,
            });
        }
        let mut file = File::open(&path)?;
        let mut buf = self.store.pool.get(dst.len());
        if let Err(err) = read_exact_retry(&mut file, &mut buf) {
            self.store.pool.put(buf);
            return Err(err.into());
        }
        dst.copy_from_slice(&buf);

        // promote to the memory tier
        let evicted = self.lru.lock().unwrap().insert(*key, buf);
        if let Some((_, old)) = evicted {
            self.store.pool.put(old);
        }
        Ok(dst.len())
    }

    fn add(&self, key: &CacheKey, data: &[u8]) {
        let mut mem = self.store.pool.get(data.len());
        mem.copy_from_slice(data);
        let evicted = self.lru.lock().unwrap().insert(*key, mem);
        if let Some((_, old)) = evicted {
            self.store.pool.put(old);
        }

        // The disk tier gets a second, distinct copy: the LRU may evict and
        // recycle its buffer while this one is still queued for writing.
        let mut disk = self.store.pool.get(data.len());
        disk.copy_from_slice(data);
        match &self.writer {
            Some(tx) => {
                if let Err(err) = tx.send((*key, disk)) {
                    let (_, buf) = err.into_inner();
                    self.store.pool.put(buf);
                    log::warn!("cache writer gone, dropping disk copy for {}", hex::encode(key));
                }
            }
            None => {
                self.store.persist_logged(key, &disk);
                self.store.pool.put(disk);
            }
        }
    }
}

impl Drop for DirectoryCache {
    fn drop(&mut self) {
        // closing the channel lets the writer drain remaining adds and exit
        self.writer.take();
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}
