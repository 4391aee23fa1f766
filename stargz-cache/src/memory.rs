//! Plain in-memory cache variant.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::{BlobCache, CacheError, CacheKey};

/// Unbounded fingerprint map behind a single mutex. Entries are immutable
/// once published; `add` on an existing key replaces the buffer wholesale.
#[derive(Default)]
pub struct MemoryCache {
    map: Mutex<HashMap<CacheKey, Vec<u8>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.map.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.lock().unwrap().is_empty()
    }
}

impl BlobCache for MemoryCache {
    fn fetch(&self, key: &CacheKey, dst: &mut [u8]) -> Result<usize, CacheError> {
        let map = self.map.lock().unwrap();
        let entry = map.get(key).ok_or(CacheError::Miss)?;
        if entry.len() != dst.len() {
            return Err(CacheError::Corrupt {
                expected: dst.len(),
                found: entry.len(),
            });
        }
        dst.copy_from_slice(entry);
        Ok(dst.len())
    }

    fn add(&self, key: &CacheKey, data: &[u8]) {
        self.map.lock().unwrap().insert(*key, data.to_vec());
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fingerprint;

    #[test]
    fn test_fetch_miss() {
        let cache = MemoryCache::new();
        let mut buf = [0u8; 4];
        assert!(matches!(
            cache.fetch(&fingerprint("a", 0, 4), &mut buf),
            Err(CacheError::Miss)
        ));
    }

    #[test]
    fn test_add_then_fetch() {
        let cache = MemoryCache::new();
        let key = fingerprint("a", 0, 4);
        cache.add(&key, b"data");

        let mut buf = [0u8; 4];
        assert_eq!(cache.fetch(&key, &mut buf).unwrap(), 4);
        assert_eq!(&buf, b"data");

        // re-adding the same content is observationally a no-op
        cache.add(&key, b"data");
        let mut buf = [0u8; 4];
        assert_eq!(cache.fetch(&key, &mut buf).unwrap(), 4);
        assert_eq!(&buf, b"data");
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_size_mismatch_is_corrupt() {
        let cache = MemoryCache::new();
        let key = fingerprint("a", 0, 4);
        cache.add(&key, b"data");
        let mut buf = [0u8; 8];
        assert!(matches!(
            cache.fetch(&key, &mut buf),
            Err(CacheError::Corrupt {
                expected: 8,
                found: 4
            })
        ));
    }
}
