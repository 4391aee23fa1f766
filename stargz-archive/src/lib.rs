//! Indexed access to seekable gzip-chunked tar archives.
//!
//! An indexed archive (eStargz) is a tar blob whose per-entry gzip streams
//! restart at chunk boundaries, with a JSON table of contents as its last
//! entry and a footer pointing at it. This crate parses the TOC into an
//! immutable index and serves random-access reads of file contents by
//! fetching, decompressing and caching individual chunks.

pub mod reader;
pub mod toc;

#[doc(hidden)]
pub mod testutil;

pub use reader::{ArchiveReader, ReadAt};
pub use toc::TocIndex;
