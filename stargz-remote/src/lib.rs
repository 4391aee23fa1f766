//! Remote layer access.
//!
//! Resolves an image reference into an authenticated, redirect-followed
//! blob URL and serves random-access reads over it with ranged GETs,
//! caching fetched chunks under URL-derived fingerprints.

pub mod http;
pub mod keychain;
pub mod range_reader;
pub mod reference;
pub mod resolver;

pub use range_reader::{BlobReader, RemoteFetcher};
pub use reference::Reference;
pub use resolver::Resolver;

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    /// No usable credentials, or the registry refused to issue a token.
    #[error("authentication failed: {0}")]
    Auth(String),
    /// DNS, connect or transport-level failure.
    #[error("network error: {0}")]
    Net(String),
    /// The server answered with an error status.
    #[error("unexpected status {0}")]
    Status(u16),
    /// The server ignored or mangled the requested range.
    #[error("range mismatch: expected {expected} bytes, got {got}")]
    Range { expected: usize, got: usize },
    /// The layer stayed unreachable through a re-resolve.
    #[error("remote layer is unreachable: {0}")]
    Dead(String),
}

impl RemoteError {
    pub(crate) fn net(err: impl std::fmt::Display) -> Self {
        RemoteError::Net(err.to_string())
    }
}
