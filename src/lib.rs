//! Lazy-pulling read-only filesystem for eStargz container image layers.
//!
//! A layer blob in the indexed (eStargz) format can be mounted before its
//! bytes arrive: the table of contents at the end of the archive maps every
//! file to chunks with known compressed ranges, so reads translate into
//! ranged GETs against the registry. Fetched chunks land in a two-tier
//! content-addressed cache, a landmark-bounded prefix is prefetched
//! eagerly, and the rest of the blob is hydrated in the background whenever
//! no foreground read is in flight.
//!
//! The crates divide the work the same way the runtime drives it:
//!
//! * [`stargz_remote`] resolves references against the registry and serves
//!   ranged reads over the blob,
//! * [`stargz_archive`] parses the TOC and turns file reads into chunk
//!   fetches,
//! * [`stargz_cache`] keeps chunks in memory and on disk,
//! * [`stargz_fuse`] exposes the archive as a kernel-mounted tree,
//! * [`stargz_tools`] arbitrates foreground reads against bulk prefetching.
//!
//! This crate ties those together behind [`StargzStore`], the surface a
//! snapshotter plugin drives: `mount`, `check`, `annotate`, `unregister`.

pub mod config;
pub mod fs;

pub use config::Config;
pub use fs::{annotate, Descriptor, StargzStore};
