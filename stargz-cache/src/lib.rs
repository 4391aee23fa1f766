//! Content-addressed caches for blob chunks.
//!
//! Chunks are keyed by a fingerprint derived from the content identity and
//! the chunk geometry, so writes are idempotent and concurrent writers for
//! the same key can race freely. Two variants implement the same capability
//! set: an unbounded in-memory map and a two-tier store combining a bounded
//! LRU with on-disk files.

use std::io::Read;

pub mod directory;
pub mod memory;

pub use directory::DirectoryCache;
pub use memory::MemoryCache;

/// Cache keys are raw SHA-256 fingerprints; they are rendered hex only when
/// a disk path is needed.
pub type CacheKey = [u8; 32];

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// The key has no entry. Not a failure, callers fall back to the remote.
    #[error("cache entry not found")]
    Miss,
    /// The stored entry disagrees with the requested length. Never repaired
    /// silently; the caller treats the entry as unusable.
    #[error("cached entry has unexpected size (expected {expected}, found {found})")]
    Corrupt { expected: usize, found: usize },
    #[error("cache I/O failure: {0}")]
    Io(#[from] std::io::Error),
}

/// Capability set shared by all cache variants.
///
/// `fetch` fills `dst` completely or fails; entries become visible to
/// readers only once fully populated. `add` publishes a copy of `data` and
/// never fails the caller: the disk tier is best effort.
pub trait BlobCache: Send + Sync {
    fn fetch(&self, key: &CacheKey, dst: &mut [u8]) -> Result<usize, CacheError>;
    fn add(&self, key: &CacheKey, data: &[u8]);
}

/// Fingerprint for one chunk of a piece of content.
///
/// `id` is the content identity (the file digest, or the blob URL for raw
/// compressed ranges), combined with the chunk offset and length.
pub fn fingerprint(id: &str, offset: u64, size: u64) -> CacheKey {
    let mut hasher = openssl::sha::Sha256::new();
    hasher.update(id.as_bytes());
    hasher.update(b"-");
    hasher.update(offset.to_string().as_bytes());
    hasher.update(b"-");
    hasher.update(size.to_string().as_bytes());
    hasher.finish()
}

pub(crate) fn read_exact_retry(file: &mut std::fs::File, buf: &mut [u8]) -> std::io::Result<()> {
    let mut done = 0;
    while done < buf.len() {
        match file.read(&mut buf[done..]) {
            Ok(0) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "cache file truncated",
                ))
            }
            Ok(n) => done += n,
            Err(ref err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_fingerprint_matches_joined_digest() {
        // equivalent to sha256("<id>-<offset>-<size>")
        let expected = openssl::sha::sha256(b"sha256:abcd-1024-512");
        assert_eq!(fingerprint("sha256:abcd", 1024, 512), expected);
    }

    #[test]
    fn test_fingerprint_geometry_is_significant() {
        let a = fingerprint("x", 0, 100);
        let b = fingerprint("x", 100, 100);
        let c = fingerprint("x", 0, 200);
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_ne!(b, c);
    }
}
