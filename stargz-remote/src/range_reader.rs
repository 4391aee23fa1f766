//! Ranged reads over a remote blob with chunk-level caching.
//!
//! Reads are split along fixed `chunk_size` boundaries of the blob; each
//! piece is served from the cache or fetched with a ranged GET and
//! published under a fingerprint of the blob URL and the range. A
//! monotone counter tracks uniquely fetched bytes for the health surface.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use stargz_cache::{fingerprint, BlobCache, CacheError};
use stargz_tools::byte_pool::BufferPool;

use crate::RemoteError;

/// Transport-level access to one resolved blob. Implemented by the
/// registry transport; tests substitute recording mocks.
pub trait RemoteFetcher: Send + Sync {
    /// Fetch exactly `len` bytes at `start` with a ranged GET.
    fn fetch_range(&self, start: u64, len: u64) -> Result<Vec<u8>, RemoteError>;

    /// Cheap reachability probe (a single-byte ranged GET).
    fn check_reachable(&self) -> Result<(), RemoteError>;

    /// Redo authentication and redirect resolution.
    fn refresh(&self) -> Result<(), RemoteError> {
        Ok(())
    }

    /// Stable identity of the blob, the basis of cache keys.
    fn id(&self) -> String;
}

pub struct BlobReader {
    fetcher: Arc<dyn RemoteFetcher>,
    url_id: String,
    size: u64,
    chunk_size: u64,
    cache: Arc<dyn BlobCache>,
    pool: Arc<BufferPool>,
    valid_interval: Duration,
    valid_until: Mutex<Option<Instant>>,
    fetched: AtomicU64,
}

impl BlobReader {
    pub fn new(
        fetcher: Arc<dyn RemoteFetcher>,
        size: u64,
        chunk_size: u64,
        cache: Arc<dyn BlobCache>,
        pool: Arc<BufferPool>,
        valid_interval: Duration,
    ) -> Self {
        let url_id = fetcher.id();
        Self {
            fetcher,
            url_id,
            size,
            chunk_size: chunk_size.max(1),
            cache,
            pool,
            valid_interval,
            valid_until: Mutex::new(None),
            fetched: AtomicU64::new(0),
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Bytes fetched from the remote so far, counting each range once.
    pub fn fetched_size(&self) -> u64 {
        self.fetched.load(Ordering::Relaxed)
    }

    fn mark_alive(&self) {
        *self.valid_until.lock().unwrap() = Some(Instant::now() + self.valid_interval);
    }

    pub fn read_at(&self, dst: &mut [u8], offset: u64) -> io::Result<usize> {
        if dst.is_empty() || offset >= self.size {
            return Ok(0);
        }
        let want = dst.len().min((self.size - offset) as usize);
        let mut done = 0usize;
        while done < want {
            let cur = offset + done as u64;
            let start = cur / self.chunk_size * self.chunk_size;
            let len = self.chunk_size.min(self.size - start);
            let intra = (cur - start) as usize;
            let take = (len as usize - intra).min(want - done);
            if intra == 0 && take == len as usize {
                self.fill_region(start, len, &mut dst[done..done + take])
                    .map_err(to_io)?;
            } else {
                let mut buf = self.pool.get(len as usize);
                let res = self.fill_region(start, len, &mut buf);
                if res.is_ok() {
                    dst[done..done + take].copy_from_slice(&buf[intra..intra + take]);
                }
                self.pool.put(buf);
                res.map_err(to_io)?;
            }
            done += take;
        }
        Ok(done)
    }

    fn fill_region(&self, start: u64, len: u64, dst: &mut [u8]) -> Result<(), RemoteError> {
        let key = fingerprint(&self.url_id, start, len);
        match self.cache.fetch(&key, dst) {
            Ok(_) => return Ok(()),
            Err(CacheError::Miss) => {}
            Err(err) => log::warn!("blob cache fetch at {} failed: {}", start, err),
        }
        let data = self.fetcher.fetch_range(start, len)?;
        if data.len() != len as usize {
            return Err(RemoteError::Range {
                expected: len as usize,
                got: data.len(),
            });
        }
        dst.copy_from_slice(&data);
        self.cache.add(&key, &data);
        self.fetched.fetch_add(len, Ordering::Relaxed);
        // a served range is proof of liveness
        self.mark_alive();
        Ok(())
    }

    /// Liveness check. Succeeds without network traffic while the validity
    /// window from the last successful contact holds; otherwise probes, and
    /// on failure re-resolves the transport and retries once.
    pub fn check(&self) -> Result<(), RemoteError> {
        if let Some(until) = *self.valid_until.lock().unwrap() {
            if Instant::now() < until {
                return Ok(());
            }
        }
        match self.fetcher.check_reachable() {
            Ok(()) => {
                self.mark_alive();
                Ok(())
            }
            Err(first) => {
                log::warn!("layer check failed, re-resolving: {}", first);
                let retried = self
                    .fetcher
                    .refresh()
                    .and_then(|_| self.fetcher.check_reachable());
                match retried {
                    Ok(()) => {
                        self.mark_alive();
                        Ok(())
                    }
                    Err(second) => Err(RemoteError::Dead(format!(
                        "{} (first failure: {})",
                        second, first
                    ))),
                }
            }
        }
    }
}

impl stargz_archive::ReadAt for BlobReader {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        BlobReader::read_at(self, buf, offset)
    }
}

fn to_io(err: RemoteError) -> io::Error {
    io::Error::new(io::ErrorKind::Other, err)
}
