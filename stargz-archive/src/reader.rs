//! Random-access reads over an indexed archive.
//!
//! The reader resolves the footer and TOC once at open, then serves
//! `read_file_at` by walking the chunks covering the requested window:
//! cache hits fill the destination directly, misses pull the chunk's
//! compressed range from the underlying blob, decompress, verify the
//! declared length and publish the chunk before copying it out.

use std::io::{self, Read};
use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{bail, format_err, Context, Error};
use flate2::read::{GzDecoder, MultiGzDecoder};

use stargz_cache::{fingerprint, BlobCache, CacheError, CacheKey};
use stargz_tools::background_task::CancelToken;
use stargz_tools::byte_pool::BufferPool;

use crate::toc::{
    clean_entry_name, is_reserved_name, ChunkDesc, IndexEntry, Toc, TocIndex, TOC_NAME,
};

/// Byte length of the archive footer.
pub const FOOTER_SIZE: u64 = 51;
/// Byte length of the footer written by early archive writers.
pub const LEGACY_FOOTER_SIZE: u64 = 47;

/// Random access over a blob, local or remote.
pub trait ReadAt: Send + Sync {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;
}

impl ReadAt for std::fs::File {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        std::os::unix::fs::FileExt::read_at(self, buf, offset)
    }
}

impl ReadAt for Vec<u8> {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let off = offset.min(self.len() as u64) as usize;
        let n = buf.len().min(self.len() - off);
        buf[..n].copy_from_slice(&self[off..off + n]);
        Ok(n)
    }
}

/// Read exactly `buf.len()` bytes at `offset`.
pub fn read_exact_at(reader: &dyn ReadAt, buf: &mut [u8], offset: u64) -> io::Result<()> {
    let mut done = 0;
    while done < buf.len() {
        match reader.read_at(&mut buf[done..], offset + done as u64) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "blob ended before requested range",
                ))
            }
            Ok(n) => done += n,
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<()> {
    let mut done = 0;
    while done < buf.len() {
        match reader.read(&mut buf[done..]) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream ended early",
                ))
            }
            Ok(n) => done += n,
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

fn parse_toc_offset(extra: &[u8]) -> Option<u64> {
    if extra.len() != 22 || &extra[16..] != b"STARGZ" {
        return None;
    }
    u64::from_str_radix(std::str::from_utf8(&extra[..16]).ok()?, 16).ok()
}

/// Decode the 51-byte footer: an empty gzip member whose EXTRA field holds
/// an `SG` subfield with the TOC offset.
fn decode_footer(buf: &[u8]) -> Option<u64> {
    if buf.len() != FOOTER_SIZE as usize
        || buf[0] != 0x1f
        || buf[1] != 0x8b
        || buf[2] != 0x08
        || buf[3] & 0x04 == 0
    {
        return None;
    }
    if u16::from_le_bytes([buf[10], buf[11]]) != 26 {
        return None;
    }
    let extra = &buf[12..38];
    if &extra[..2] != b"SG" || u16::from_le_bytes([extra[2], extra[3]]) != 22 {
        return None;
    }
    parse_toc_offset(&extra[4..])
}

/// Decode the 47-byte legacy footer carrying the offset as the bare EXTRA
/// field.
fn decode_legacy_footer(buf: &[u8]) -> Option<u64> {
    if buf.len() != LEGACY_FOOTER_SIZE as usize
        || buf[0] != 0x1f
        || buf[1] != 0x8b
        || buf[2] != 0x08
        || buf[3] & 0x04 == 0
    {
        return None;
    }
    if u16::from_le_bytes([buf[10], buf[11]]) != 22 {
        return None;
    }
    parse_toc_offset(&buf[12..34])
}

fn parse_footer(reader: &dyn ReadAt, size: u64) -> Result<u64, Error> {
    if size >= FOOTER_SIZE {
        let mut buf = [0u8; FOOTER_SIZE as usize];
        read_exact_at(reader, &mut buf, size - FOOTER_SIZE)?;
        if let Some(off) = decode_footer(&buf) {
            return Ok(off);
        }
        let mut legacy = [0u8; LEGACY_FOOTER_SIZE as usize];
        read_exact_at(reader, &mut legacy, size - LEGACY_FOOTER_SIZE)?;
        if let Some(off) = decode_legacy_footer(&legacy) {
            return Ok(off);
        }
    }
    bail!("blob carries no indexed-archive footer");
}

pub struct ArchiveReader {
    reader: Arc<dyn ReadAt>,
    size: u64,
    index: Arc<TocIndex>,
    cache: Arc<dyn BlobCache>,
    pool: Arc<BufferPool>,
    verify: bool,
}

impl ArchiveReader {
    /// Open an archive: parse the footer, load the TOC and build the index.
    ///
    /// `reader` serves the on-demand read path from here on; the bulk
    /// hydration walk takes its own reader so the caller can gate it
    /// differently.
    pub fn open(
        reader: Arc<dyn ReadAt>,
        size: u64,
        cache: Arc<dyn BlobCache>,
        pool: Arc<BufferPool>,
        verify: bool,
    ) -> Result<Self, Error> {
        let toc_off = parse_footer(reader.as_ref(), size)?;
        if toc_off >= size {
            bail!("TOC offset {} outside blob of {} bytes", toc_off, size);
        }
        let mut compressed = vec![0u8; (size - toc_off) as usize];
        read_exact_at(reader.as_ref(), &mut compressed, toc_off)
            .context("reading archive TOC")?;
        let toc = decode_toc(&compressed)?;
        let index = Arc::new(TocIndex::build(toc, toc_off)?);
        Ok(Self {
            reader,
            size,
            index,
            cache,
            pool,
            verify,
        })
    }

    pub fn index(&self) -> Arc<TocIndex> {
        Arc::clone(&self.index)
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Resolve `path` to a readable regular file entry.
    pub fn open_file(&self, path: &str) -> Result<usize, Error> {
        let id = self
            .index
            .lookup(path)
            .ok_or_else(|| format_err!("no such entry: {:?}", path))?;
        if !self.index.entry(id).is_reg() {
            bail!("not a regular file: {:?}", path);
        }
        Ok(id)
    }

    /// Read from the decompressed contents of entry `id` at `offset`.
    ///
    /// Fills `dst` completely unless the read crosses the end of the file;
    /// short reads happen only at EOF.
    pub fn read_file_at(&self, id: usize, dst: &mut [u8], offset: u64) -> Result<usize, Error> {
        let entry = self.index.entry(id);
        if !entry.is_reg() {
            bail!("not a regular file: {:?}", entry.name);
        }
        if dst.is_empty() || offset >= entry.size {
            return Ok(0);
        }
        let want = dst.len().min((entry.size - offset) as usize);
        let mut done = 0usize;
        while done < want {
            let cur = offset + done as u64;
            let ci = entry
                .chunk_at(cur)
                .ok_or_else(|| format_err!("offset {} beyond chunk map of {:?}", cur, entry.name))?;
            let chunk = &entry.chunks[ci];
            let intra = (cur - chunk.offset) as usize;
            let take = ((chunk.offset + chunk.size - cur) as usize).min(want - done);
            if intra == 0 && take == chunk.size as usize {
                // the chunk lands fully inside the destination
                self.fill_chunk(entry, chunk, &mut dst[done..done + take])?;
            } else {
                let mut buf = self.pool.get(chunk.size as usize);
                let res = self.fill_chunk(entry, chunk, &mut buf);
                if res.is_ok() {
                    dst[done..done + take].copy_from_slice(&buf[intra..intra + take]);
                }
                self.pool.put(buf);
                res?;
            }
            done += take;
        }
        Ok(done)
    }

    /// Obtain one chunk's decompressed bytes, via the cache when possible.
    fn fill_chunk(&self, entry: &IndexEntry, chunk: &ChunkDesc, dst: &mut [u8]) -> Result<(), Error> {
        let key = fingerprint(entry.content_id(), chunk.offset, chunk.size);
        match self.cache.fetch(&key, dst) {
            Ok(_) => return Ok(()),
            Err(CacheError::Miss) => {}
            Err(err) => {
                log::warn!(
                    "cache fetch for {:?}@{} failed: {}",
                    entry.name,
                    chunk.offset,
                    err
                );
            }
        }
        self.fetch_chunk(self.reader.as_ref(), chunk, dst)
            .with_context(|| format!("fetching {:?}@{}", entry.name, chunk.offset))?;
        self.cache.add(&key, dst);
        Ok(())
    }

    /// Fetch and decompress one chunk from the blob into `dst`, which is
    /// sized to exactly the declared chunk length.
    fn fetch_chunk(&self, reader: &dyn ReadAt, chunk: &ChunkDesc, dst: &mut [u8]) -> Result<(), Error> {
        let clen = (chunk.blob_range.end - chunk.blob_range.start) as usize;
        let mut compressed = self.pool.get(clen);
        let res = read_exact_at(reader, &mut compressed, chunk.blob_range.start)
            .map_err(Error::from)
            .and_then(|_| {
                let mut gz = GzDecoder::new(&compressed[..]);
                read_full(&mut gz, dst).map_err(|err| {
                    format_err!(
                        "corrupt chunk: wanted {} decompressed bytes - {}",
                        dst.len(),
                        err
                    )
                })
            });
        self.pool.put(compressed);
        res
    }

    /// The compressed prefix worth fetching eagerly, unless the archive
    /// opts out or declares no landmark.
    pub fn prefetch_range(&self) -> Option<Range<u64>> {
        if self.index.no_prefetch() {
            return None;
        }
        let end = self.index.prefetch_end()?;
        if end == 0 {
            return None;
        }
        Some(0..end.min(self.size))
    }

    pub fn no_prefetch(&self) -> bool {
        self.index.no_prefetch()
    }

    /// Publish every chunk found in the compressed prefix `raw` into the
    /// cache. The prefix usually stops mid-archive; decoding simply ends
    /// there. Uses only the cache-add path, never the blob reader.
    pub fn cache_prefix(&self, raw: &[u8]) -> Result<(), Error> {
        let mut archive = tar::Archive::new(MultiGzDecoder::new(raw));
        let entries = archive.entries()?;
        for entry in entries {
            let mut entry = match entry {
                Ok(entry) => entry,
                // the prefix ends wherever the landmark cut it off
                Err(_) => break,
            };
            let path = match entry.path() {
                Ok(path) => path.to_string_lossy().into_owned(),
                Err(_) => continue,
            };
            let name = clean_entry_name(&path).to_string();
            if is_reserved_name(&name) {
                continue;
            }
            let Some(id) = self.index.lookup(&name) else {
                continue;
            };
            let ie = self.index.entry(id);
            if !ie.is_reg() || ie.size == 0 {
                continue;
            }
            if self.cache_streamed_file(ie, &mut entry).is_err() {
                break;
            }
        }
        Ok(())
    }

    /// Read one file's chunks off a sequential stream and publish the ones
    /// the cache does not hold yet.
    fn cache_streamed_file(&self, entry: &IndexEntry, r: &mut impl Read) -> io::Result<()> {
        let mut hasher = self.file_hasher(entry);
        // with verification on, adds are deferred until the digest checks out
        let mut pending: Vec<(CacheKey, Vec<u8>)> = Vec::new();
        for chunk in &entry.chunks {
            let mut buf = self.pool.get(chunk.size as usize);
            if let Err(err) = read_full(r, &mut buf) {
                self.pool.put(buf);
                self.recycle(pending);
                return Err(err);
            }
            if let Some(hasher) = hasher.as_mut() {
                hasher.update(&buf);
            }
            let key = fingerprint(entry.content_id(), chunk.offset, chunk.size);
            if self.cache_holds(&key, chunk.size as usize) {
                self.pool.put(buf);
            } else if hasher.is_some() {
                pending.push((key, buf));
            } else {
                self.cache.add(&key, &buf);
                self.pool.put(buf);
            }
        }
        if let Some(hasher) = hasher {
            let got = format!("sha256:{}", hex::encode(hasher.finish()));
            if got != entry.digest {
                log::warn!(
                    "digest mismatch for {:?} (declared {}, streamed {}), dropping its chunks",
                    entry.name,
                    entry.digest,
                    got
                );
                self.recycle(pending);
                return Ok(());
            }
        }
        for (key, buf) in pending {
            self.cache.add(&key, &buf);
            self.pool.put(buf);
        }
        Ok(())
    }

    fn file_hasher(&self, entry: &IndexEntry) -> Option<openssl::sha::Sha256> {
        (self.verify && entry.digest.starts_with("sha256:")).then(openssl::sha::Sha256::new)
    }

    fn recycle(&self, pending: Vec<(CacheKey, Vec<u8>)>) {
        for (_, buf) in pending {
            self.pool.put(buf);
        }
    }

    /// Lookup-only probe with a scratch buffer of the exact chunk size.
    fn cache_holds(&self, key: &CacheKey, len: usize) -> bool {
        let mut scratch = self.pool.get(len);
        let hit = self.cache.fetch(key, &mut scratch).is_ok();
        self.pool.put(scratch);
        hit
    }

    /// Hydrate the cache with every chunk of the archive, pulling
    /// compressed ranges through `reader` (typically the background-gated
    /// one).
    ///
    /// Returns `Ok(true)` when the walk reached the end and `Ok(false)`
    /// when the token cancelled it; `progress` records the position so the
    /// next invocation resumes where this one stopped. Terminating early is
    /// harmless, on-demand reads do not depend on this walk.
    pub fn fetch_all(
        &self,
        reader: &dyn ReadAt,
        token: &CancelToken,
        progress: &AtomicUsize,
    ) -> Result<bool, Error> {
        loop {
            let at = progress.load(Ordering::Acquire);
            if at >= self.index.len() {
                return Ok(true);
            }
            if token.is_cancelled() {
                return Ok(false);
            }
            let entry = self.index.entry(at);
            if entry.is_reg() && entry.size > 0 && !is_reserved_name(&entry.name) {
                if !self.hydrate_entry(entry, reader, token)? {
                    return Ok(false);
                }
            }
            progress.store(at + 1, Ordering::Release);
        }
    }

    fn hydrate_entry(
        &self,
        entry: &IndexEntry,
        reader: &dyn ReadAt,
        token: &CancelToken,
    ) -> Result<bool, Error> {
        let mut hasher = self.file_hasher(entry);
        let mut pending: Vec<(CacheKey, Vec<u8>)> = Vec::new();
        for chunk in &entry.chunks {
            if token.is_cancelled() {
                self.recycle(pending);
                return Ok(false);
            }
            let key = fingerprint(entry.content_id(), chunk.offset, chunk.size);
            let mut buf = self.pool.get(chunk.size as usize);
            let hit = self.cache.fetch(&key, &mut buf).is_ok();
            if !hit {
                if let Err(err) = self.fetch_chunk(reader, chunk, &mut buf) {
                    self.pool.put(buf);
                    self.recycle(pending);
                    return Err(err);
                }
            }
            match hasher.as_mut() {
                Some(h) => {
                    h.update(&buf);
                    if hit {
                        self.pool.put(buf);
                    } else {
                        pending.push((key, buf));
                    }
                }
                None => {
                    if !hit {
                        self.cache.add(&key, &buf);
                    }
                    self.pool.put(buf);
                }
            }
        }
        if let Some(hasher) = hasher {
            let got = format!("sha256:{}", hex::encode(hasher.finish()));
            if got != entry.digest {
                log::warn!(
                    "digest mismatch for {:?} (declared {}, fetched {}), dropping its chunks",
                    entry.name,
                    entry.digest,
                    got
                );
                self.recycle(pending);
                return Ok(true);
            }
        }
        for (key, buf) in pending {
            self.cache.add(&key, &buf);
            self.pool.put(buf);
        }
        Ok(true)
    }
}

fn decode_toc(compressed: &[u8]) -> Result<Toc, Error> {
    let mut archive = tar::Archive::new(MultiGzDecoder::new(compressed));
    for entry in archive.entries()? {
        let entry = entry.context("decoding TOC tar stream")?;
        let path = entry.path()?.to_string_lossy().into_owned();
        if clean_entry_name(&path) == TOC_NAME {
            return serde_json::from_reader(entry).context("decoding TOC document");
        }
    }
    bail!("archive has no {} entry", TOC_NAME);
}
