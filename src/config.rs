//! Store configuration.

use std::time::Duration;

use serde::Deserialize;

pub const DEFAULT_LRU_MAX_ENTRY: usize = 5000;
pub const DEFAULT_HTTP_CHUNK_SIZE: u64 = 50000;
pub const DEFAULT_VALID_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_BACKGROUND_FETCH_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheType {
    Memory,
    Directory,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// LRU capacity of both chunk caches.
    pub lru_max_entry: usize,
    /// Compressed chunk size used by the remote range reader.
    pub http_chunk_size: u64,
    pub http_cache_type: CacheType,
    pub filesystem_cache_type: CacheType,
    /// Seconds a successful layer check stays valid without re-probing.
    /// Unset means the default; zero probes on every check. "Unset" and
    /// "always check" are deliberately distinct states.
    pub layer_valid_interval: Option<u64>,
    /// Forces the validity window to zero regardless of the setting above.
    pub check_layer_always: bool,
    /// Disables both the landmark prefetch and the whole-blob background
    /// fetch.
    pub noprefetch: bool,
    /// Hosts (regular expressions) reached over plain http with TLS
    /// verification disabled.
    pub insecure: Vec<String>,
    pub debug: bool,
    /// Write the disk tier of directory caches before `add` returns.
    pub sync_add: bool,
    /// Verify whole-file digests during the streaming cache walks.
    pub verify_chunks: bool,
    /// Soft deadline for one background fetch slice, in seconds.
    pub background_fetch_timeout: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            lru_max_entry: DEFAULT_LRU_MAX_ENTRY,
            http_chunk_size: DEFAULT_HTTP_CHUNK_SIZE,
            http_cache_type: CacheType::Directory,
            filesystem_cache_type: CacheType::Directory,
            layer_valid_interval: None,
            check_layer_always: false,
            noprefetch: false,
            insecure: Vec::new(),
            debug: false,
            sync_add: false,
            verify_chunks: true,
            background_fetch_timeout: DEFAULT_BACKGROUND_FETCH_TIMEOUT_SECS,
        }
    }
}

impl Config {
    /// Effective validity window for layer checks.
    pub fn layer_valid_interval(&self) -> Duration {
        if self.check_layer_always {
            return Duration::ZERO;
        }
        Duration::from_secs(
            self.layer_valid_interval
                .unwrap_or(DEFAULT_VALID_INTERVAL_SECS),
        )
    }

    pub fn background_fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.background_fetch_timeout)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.lru_max_entry, 5000);
        assert_eq!(config.http_chunk_size, 50000);
        assert_eq!(config.http_cache_type, CacheType::Directory);
        assert_eq!(config.layer_valid_interval(), Duration::from_secs(60));
        assert!(config.verify_chunks);
        assert!(!config.noprefetch);
    }

    #[test]
    fn test_valid_interval_states() {
        // explicit zero means "always check"
        let config: Config = serde_json::from_str(r#"{"layer_valid_interval": 0}"#).unwrap();
        assert_eq!(config.layer_valid_interval(), Duration::ZERO);

        // the override wins over any configured interval
        let config: Config =
            serde_json::from_str(r#"{"layer_valid_interval": 300, "check_layer_always": true}"#)
                .unwrap();
        assert_eq!(config.layer_valid_interval(), Duration::ZERO);

        let config: Config = serde_json::from_str(r#"{"layer_valid_interval": 300}"#).unwrap();
        assert_eq!(config.layer_valid_interval(), Duration::from_secs(300));
    }

    #[test]
    fn test_cache_type_names() {
        let config: Config =
            serde_json::from_str(r#"{"http_cache_type": "memory", "filesystem_cache_type": "directory"}"#)
                .unwrap();
        assert_eq!(config.http_cache_type, CacheType::Memory);
        assert_eq!(config.filesystem_cache_type, CacheType::Directory);
    }
}
