//! Table of contents of an indexed archive.
//!
//! The TOC is the archive's last tar entry, a JSON document describing
//! every entry together with its chunk layout. It is parsed once at mount
//! and turned into an immutable [`TocIndex`]: a vector of entries whose
//! positions double as stable inode numbers, a path lookup map, and
//! per-file chunk descriptors carrying the compressed byte range each
//! chunk occupies within the blob.

use std::collections::{BTreeMap, HashMap};
use std::ops::Range;

use anyhow::{bail, format_err, Error};
use serde::Deserialize;

/// Name of the in-archive TOC entry.
pub const TOC_NAME: &str = "stargz.index.json";
/// Reserved entry marking the end of the eagerly prefetched prefix.
pub const PREFETCH_LANDMARK: &str = ".prefetch.landmark";
/// Reserved entry marking the archive as not worth prefetching.
pub const NO_PREFETCH_LANDMARK: &str = ".no.prefetch.landmark";

/// Returns true for entry names that never surface as filesystem nodes.
pub fn is_reserved_name(name: &str) -> bool {
    name == TOC_NAME || name == PREFETCH_LANDMARK || name == NO_PREFETCH_LANDMARK
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryType {
    Reg,
    Dir,
    Symlink,
    Char,
    Block,
    Fifo,
    Socket,
    Hardlink,
    Chunk,
}

/// One record of the TOC document, field names as they appear in the JSON.
#[derive(Debug, Clone, Deserialize)]
pub struct TocEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub entry_type: EntryType,
    #[serde(default)]
    pub size: u64,
    #[serde(default, rename = "modtime")]
    pub mod_time: Option<String>,
    #[serde(default, rename = "linkName")]
    pub link_name: String,
    #[serde(default)]
    pub mode: u32,
    #[serde(default)]
    pub uid: u32,
    #[serde(default)]
    pub gid: u32,
    #[serde(default, rename = "devMajor")]
    pub dev_major: u32,
    #[serde(default, rename = "devMinor")]
    pub dev_minor: u32,
    #[serde(default, rename = "NumLink")]
    pub num_link: u32,
    /// Extended attributes, values base64 encoded.
    #[serde(default)]
    pub xattrs: HashMap<String, String>,
    /// Digest of the decompressed file contents (`sha256:<hex>`).
    #[serde(default)]
    pub digest: String,
    #[serde(default, rename = "chunkOffset")]
    pub chunk_offset: u64,
    #[serde(default, rename = "chunkSize")]
    pub chunk_size: u64,
    /// Compressed offset of this entry's (or chunk's) gzip member.
    #[serde(default)]
    pub offset: u64,
}

#[derive(Debug, Deserialize)]
pub struct Toc {
    pub version: u32,
    pub entries: Vec<TocEntry>,
}

/// One contiguous piece of a decompressed file.
#[derive(Debug, Clone)]
pub struct ChunkDesc {
    /// Offset of this chunk within the decompressed file.
    pub offset: u64,
    /// Decompressed length, exact.
    pub size: u64,
    /// Compressed byte range within the blob.
    pub blob_range: Range<u64>,
}

/// A resolved archive entry. The position in [`TocIndex::entries`] is the
/// entry's identity; looking the same path up twice yields the same id.
#[derive(Debug)]
pub struct IndexEntry {
    /// Cleaned path; `""` is the root.
    pub name: String,
    pub kind: EntryType,
    pub size: u64,
    /// Permission, setuid/setgid and sticky bits; no file type bits.
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    /// Modification time as (seconds, nanoseconds).
    pub mtime: (i64, u32),
    pub link_name: String,
    pub dev_major: u32,
    pub dev_minor: u32,
    /// Always at least 1.
    pub num_link: u32,
    pub xattrs: BTreeMap<String, Vec<u8>>,
    pub digest: String,
    /// Chunk list, empty except for non-empty regular files.
    pub chunks: Vec<ChunkDesc>,
    /// Child entries by base name, in name order. Raw archive view; layer
    /// semantics like whiteouts are applied by the node layer.
    pub children: BTreeMap<String, usize>,
}

impl IndexEntry {
    pub fn is_dir(&self) -> bool {
        self.kind == EntryType::Dir
    }

    pub fn is_reg(&self) -> bool {
        self.kind == EntryType::Reg
    }

    /// Index of the chunk covering decompressed offset `off`.
    pub fn chunk_at(&self, off: u64) -> Option<usize> {
        if off >= self.size {
            return None;
        }
        let idx = self.chunks.partition_point(|c| c.offset <= off);
        idx.checked_sub(1)
    }

    /// Identity used when fingerprinting this file's chunks.
    pub fn content_id(&self) -> &str {
        if self.digest.is_empty() {
            &self.name
        } else {
            &self.digest
        }
    }

    fn synthetic_dir(name: String) -> Self {
        IndexEntry {
            name,
            kind: EntryType::Dir,
            size: 0,
            mode: 0o755,
            uid: 0,
            gid: 0,
            mtime: (0, 0),
            link_name: String::new(),
            dev_major: 0,
            dev_minor: 0,
            num_link: 1,
            xattrs: BTreeMap::new(),
            digest: String::new(),
            chunks: Vec::new(),
            children: BTreeMap::new(),
        }
    }
}

pub struct TocIndex {
    entries: Vec<IndexEntry>,
    by_name: HashMap<String, usize>,
    toc_offset: u64,
    prefetch_end: Option<u64>,
    no_prefetch: bool,
}

/// Strip the `./` prefix and surrounding slashes tar writers tend to add.
pub fn clean_entry_name(name: &str) -> &str {
    let name = name.strip_prefix("./").unwrap_or(name);
    name.trim_matches('/')
}

fn parse_mod_time(value: &Option<String>) -> Result<(i64, u32), Error> {
    match value {
        None => Ok((0, 0)),
        Some(s) if s.is_empty() => Ok((0, 0)),
        Some(s) => {
            let ts = chrono::DateTime::parse_from_rfc3339(s)
                .map_err(|err| format_err!("invalid modtime {:?} - {}", s, err))?;
            Ok((ts.timestamp(), ts.timestamp_subsec_nanos()))
        }
    }
}

fn decode_xattrs(raw: &HashMap<String, String>) -> Result<BTreeMap<String, Vec<u8>>, Error> {
    let mut out = BTreeMap::new();
    for (name, value) in raw {
        let bytes = base64::decode(value)
            .map_err(|err| format_err!("invalid xattr value for {:?} - {}", name, err))?;
        out.insert(name.clone(), bytes);
    }
    Ok(out)
}

impl TocIndex {
    /// Decode a TOC document into the in-memory index.
    ///
    /// `toc_offset` is the compressed offset of the TOC entry itself; it
    /// bounds the compressed range of the archive's final chunk.
    pub fn build(toc: Toc, toc_offset: u64) -> Result<Self, Error> {
        if toc.version != 1 {
            bail!("unsupported TOC version {}", toc.version);
        }

        let mut index = TocIndex {
            entries: vec![IndexEntry::synthetic_dir(String::new())],
            by_name: HashMap::from([(String::new(), 0)]),
            toc_offset,
            prefetch_end: None,
            no_prefetch: false,
        };

        // (entry id, chunk position, compressed offset); compressed ranges
        // are derived from the offsets of whatever comes next in the blob
        let mut chunk_sites: Vec<(usize, usize, u64)> = Vec::new();
        let mut hardlinks: Vec<(String, String)> = Vec::new();

        for ent in &toc.entries {
            let name = clean_entry_name(&ent.name).to_string();
            match ent.entry_type {
                EntryType::Chunk => {
                    let id = *index.by_name.get(&name).ok_or_else(|| {
                        format_err!("chunk continuation for unknown entry {:?}", name)
                    })?;
                    let file_size = index.entries[id].size;
                    if ent.chunk_offset >= file_size {
                        bail!("chunk offset {} beyond file {:?}", ent.chunk_offset, name);
                    }
                    let size = if ent.chunk_size == 0 {
                        file_size - ent.chunk_offset
                    } else {
                        ent.chunk_size
                    };
                    let chunks = &mut index.entries[id].chunks;
                    chunks.push(ChunkDesc {
                        offset: ent.chunk_offset,
                        size,
                        blob_range: 0..0,
                    });
                    chunk_sites.push((id, chunks.len() - 1, ent.offset));
                }
                EntryType::Hardlink => {
                    hardlinks.push((name, clean_entry_name(&ent.link_name).to_string()));
                }
                _ => {
                    if name == PREFETCH_LANDMARK {
                        index.prefetch_end = Some(ent.offset);
                    } else if name == NO_PREFETCH_LANDMARK {
                        index.no_prefetch = true;
                    }
                    let id = index.add_entry(&name, ent)?;
                    if ent.entry_type == EntryType::Reg && ent.size > 0 {
                        let size = if ent.chunk_size == 0 {
                            ent.size - ent.chunk_offset
                        } else {
                            ent.chunk_size
                        };
                        let chunks = &mut index.entries[id].chunks;
                        chunks.push(ChunkDesc {
                            offset: ent.chunk_offset,
                            size,
                            blob_range: 0..0,
                        });
                        chunk_sites.push((id, chunks.len() - 1, ent.offset));
                    }
                }
            }
        }

        // hardlink names alias the target entry so both share one inode
        for (alias, target) in hardlinks {
            let target_id = *index
                .by_name
                .get(&target)
                .ok_or_else(|| format_err!("hardlink target {:?} not found", target))?;
            index.link_name_to(&alias, target_id)?;
        }

        index.assign_blob_ranges(chunk_sites)?;
        index.verify_chunk_maps()?;
        Ok(index)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, id: usize) -> &IndexEntry {
        &self.entries[id]
    }

    pub fn lookup(&self, name: &str) -> Option<usize> {
        self.by_name.get(clean_entry_name(name)).copied()
    }

    pub fn root(&self) -> usize {
        0
    }

    pub fn toc_offset(&self) -> u64 {
        self.toc_offset
    }

    /// End of the prefetchable prefix, if the archive declares a landmark.
    pub fn prefetch_end(&self) -> Option<u64> {
        self.prefetch_end
    }

    /// True when the archive opts out of prefetching.
    pub fn no_prefetch(&self) -> bool {
        self.no_prefetch
    }

    fn add_entry(&mut self, name: &str, ent: &TocEntry) -> Result<usize, Error> {
        let mtime = parse_mod_time(&ent.mod_time)?;
        let xattrs = decode_xattrs(&ent.xattrs)?;

        if let Some(&id) = self.by_name.get(name) {
            // duplicate tar entries: the later one wins, but a directory
            // keeps the children discovered so far
            let children = std::mem::take(&mut self.entries[id].children);
            let mut replacement = Self::materialize(name, ent, mtime, xattrs);
            if replacement.is_dir() {
                replacement.children = children;
            }
            self.entries[id] = replacement;
            return Ok(id);
        }

        let id = self.entries.len();
        self.entries
            .push(Self::materialize(name, ent, mtime, xattrs));
        self.by_name.insert(name.to_string(), id);
        self.link_name_to(name, id)?;
        Ok(id)
    }

    fn materialize(
        name: &str,
        ent: &TocEntry,
        mtime: (i64, u32),
        xattrs: BTreeMap<String, Vec<u8>>,
    ) -> IndexEntry {
        IndexEntry {
            name: name.to_string(),
            kind: ent.entry_type,
            size: ent.size,
            mode: ent.mode & 0o7777,
            uid: ent.uid,
            gid: ent.gid,
            mtime,
            // symlink targets are kept verbatim; only hardlink targets are
            // archive paths and get cleaned at resolution
            link_name: ent.link_name.clone(),
            dev_major: ent.dev_major,
            dev_minor: ent.dev_minor,
            num_link: ent.num_link.max(1),
            xattrs,
            digest: ent.digest.clone(),
            chunks: Vec::new(),
            children: BTreeMap::new(),
        }
    }

    /// Register `name` as a child of its parent directory, synthesizing
    /// missing intermediate directories, pointing at entry `id`.
    fn link_name_to(&mut self, name: &str, id: usize) -> Result<(), Error> {
        if name.is_empty() {
            return Ok(());
        }
        let (dir, base) = match name.rsplit_once('/') {
            Some((dir, base)) => (dir.to_string(), base.to_string()),
            None => (String::new(), name.to_string()),
        };
        let parent = self.ensure_dir(&dir)?;
        if !self.entries[parent].is_dir() {
            bail!("parent of {:?} is not a directory", name);
        }
        self.entries[parent].children.insert(base, id);
        if self.by_name.get(name).is_none() {
            self.by_name.insert(name.to_string(), id);
        }
        Ok(())
    }

    fn ensure_dir(&mut self, name: &str) -> Result<usize, Error> {
        if let Some(&id) = self.by_name.get(name) {
            return Ok(id);
        }
        let id = self.entries.len();
        self.entries
            .push(IndexEntry::synthetic_dir(name.to_string()));
        self.by_name.insert(name.to_string(), id);
        self.link_name_to(name, id)?;
        Ok(id)
    }

    fn assign_blob_ranges(&mut self, mut sites: Vec<(usize, usize, u64)>) -> Result<(), Error> {
        sites.sort_by_key(|&(_, _, off)| off);
        for i in 0..sites.len() {
            let (id, chunk, start) = sites[i];
            let end = match sites.get(i + 1) {
                Some(&(_, _, next)) => next,
                None => self.toc_offset,
            };
            if start >= end {
                bail!(
                    "invalid compressed layout: chunk at {} not before next member at {}",
                    start,
                    end
                );
            }
            // a duplicate tar entry may have dropped its earlier chunk list
            if let Some(desc) = self.entries[id].chunks.get_mut(chunk) {
                desc.blob_range = start..end;
            }
        }
        Ok(())
    }

    fn verify_chunk_maps(&self) -> Result<(), Error> {
        for entry in &self.entries {
            if !entry.is_reg() {
                continue;
            }
            if entry.size > 0 && entry.chunks.is_empty() {
                bail!("file {:?} has no chunks", entry.name);
            }
            let mut expect = 0u64;
            for chunk in &entry.chunks {
                if chunk.offset != expect {
                    bail!(
                        "file {:?} chunk map not contiguous at offset {}",
                        entry.name,
                        chunk.offset
                    );
                }
                if chunk.size == 0 {
                    bail!("file {:?} has an empty chunk at {}", entry.name, expect);
                }
                expect += chunk.size;
            }
            if expect != entry.size {
                bail!(
                    "file {:?} chunks cover {} of {} bytes",
                    entry.name,
                    expect,
                    entry.size
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn toc_from_json(doc: serde_json::Value) -> Toc {
        serde_json::from_value(doc).unwrap()
    }

    #[test]
    fn test_parse_and_index() {
        let toc = toc_from_json(serde_json::json!({
            "version": 1,
            "entries": [
                {"name": "etc/", "type": "dir", "mode": 0o755, "NumLink": 2,
                 "modtime": "2021-03-04T05:06:07Z"},
                {"name": "etc/os-release", "type": "reg", "size": 10,
                 "digest": "sha256:aaaa", "offset": 512, "mode": 0o644,
                 "uid": 1, "gid": 2},
                {"name": "big", "type": "reg", "size": 8, "chunkSize": 4,
                 "digest": "sha256:bbbb", "offset": 1024},
                {"name": "big", "type": "chunk", "offset": 1100,
                 "chunkOffset": 4, "chunkSize": 4},
            ]
        }));
        let index = TocIndex::build(toc, 2000).unwrap();

        let root = index.entry(index.root());
        assert_eq!(
            root.children.keys().map(|s| s.as_str()).collect::<Vec<_>>(),
            ["big", "etc"]
        );

        let etc = index.entry(index.lookup("etc").unwrap());
        assert!(etc.is_dir());
        assert_eq!(etc.mtime.0, 1614834367);

        let rel = index.entry(index.lookup("etc/os-release").unwrap());
        assert_eq!(rel.size, 10);
        assert_eq!(rel.uid, 1);
        assert_eq!(rel.chunks.len(), 1);
        assert_eq!(rel.chunks[0].blob_range, 512..1024);

        let big = index.entry(index.lookup("big").unwrap());
        assert_eq!(big.chunks.len(), 2);
        assert_eq!(big.chunks[0].blob_range, 1024..1100);
        assert_eq!(big.chunks[1].blob_range, 1100..2000);
        assert_eq!(big.chunk_at(0), Some(0));
        assert_eq!(big.chunk_at(3), Some(0));
        assert_eq!(big.chunk_at(4), Some(1));
        assert_eq!(big.chunk_at(8), None);
    }

    #[test]
    fn test_synthesized_parents_and_hardlinks() {
        let toc = toc_from_json(serde_json::json!({
            "version": 1,
            "entries": [
                {"name": "a/b/c.txt", "type": "reg", "size": 1, "offset": 512,
                 "digest": "sha256:cccc"},
                {"name": "a/b/hard", "type": "hardlink", "linkName": "a/b/c.txt"},
            ]
        }));
        let index = TocIndex::build(toc, 600).unwrap();

        let a = index.lookup("a").unwrap();
        assert!(index.entry(a).is_dir());
        let b = index.lookup("a/b").unwrap();
        assert_eq!(
            index
                .entry(b)
                .children
                .keys()
                .map(|s| s.as_str())
                .collect::<Vec<_>>(),
            ["c.txt", "hard"]
        );
        // the alias resolves to the very same entry
        assert_eq!(index.lookup("a/b/hard"), index.lookup("a/b/c.txt"));
    }

    #[test]
    fn test_landmarks() {
        let toc = toc_from_json(serde_json::json!({
            "version": 1,
            "entries": [
                {"name": ".prefetch.landmark", "type": "reg", "size": 1, "offset": 4096},
            ]
        }));
        let index = TocIndex::build(toc, 8192).unwrap();
        assert_eq!(index.prefetch_end(), Some(4096));
        assert!(!index.no_prefetch());

        let toc = toc_from_json(serde_json::json!({
            "version": 1,
            "entries": [
                {"name": ".no.prefetch.landmark", "type": "reg", "size": 1, "offset": 4096},
            ]
        }));
        let index = TocIndex::build(toc, 8192).unwrap();
        assert_eq!(index.prefetch_end(), None);
        assert!(index.no_prefetch());
    }

    #[test]
    fn test_non_contiguous_chunks_rejected() {
        let toc = toc_from_json(serde_json::json!({
            "version": 1,
            "entries": [
                {"name": "f", "type": "reg", "size": 8, "chunkSize": 4, "offset": 512},
                {"name": "f", "type": "chunk", "offset": 600,
                 "chunkOffset": 6, "chunkSize": 2},
            ]
        }));
        assert!(TocIndex::build(toc, 700).is_err());
    }

    #[test]
    fn test_xattrs_decoded() {
        let toc = toc_from_json(serde_json::json!({
            "version": 1,
            "entries": [
                {"name": "d", "type": "dir",
                 "xattrs": {"user.note": base64::encode(b"hello")}},
            ]
        }));
        let index = TocIndex::build(toc, 100).unwrap();
        let d = index.entry(index.lookup("d").unwrap());
        assert_eq!(d.xattrs.get("user.note").unwrap(), b"hello");
    }

    #[test]
    fn test_unsupported_version() {
        let toc = toc_from_json(serde_json::json!({"version": 2, "entries": []}));
        assert!(TocIndex::build(toc, 0).is_err());
    }
}
