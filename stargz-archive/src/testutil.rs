//! In-memory construction of indexed archives.
//!
//! Builds blobs the reader can mount: per-chunk gzip members, a trailing
//! TOC entry and the footer carrying its offset. Only meant for tests of
//! this workspace, hence hidden from the public API surface.

use std::io::Write;

use flate2::write::GzEncoder;
use flate2::Compression;

use crate::toc::{NO_PREFETCH_LANDMARK, PREFETCH_LANDMARK, TOC_NAME};

/// Byte stored in landmark entries.
pub const LANDMARK_CONTENTS: u8 = 0x0f;

pub struct ArchiveBuilder {
    out: Vec<u8>,
    toc_entries: Vec<serde_json::Value>,
    chunk_size: usize,
}

impl Default for ArchiveBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ArchiveBuilder {
    pub fn new() -> Self {
        Self {
            out: Vec::new(),
            toc_entries: Vec::new(),
            chunk_size: 0,
        }
    }

    /// Split regular files into chunks of `n` decompressed bytes
    /// (0 keeps whole-file chunks).
    pub fn chunk_size(mut self, n: usize) -> Self {
        self.chunk_size = n;
        self
    }

    pub fn dir(&mut self, name: &str, mode: u32) {
        self.dir_full(name, mode, 0, 0, &[]);
    }

    pub fn dir_full(&mut self, name: &str, mode: u32, uid: u32, gid: u32, xattrs: &[(&str, &[u8])]) {
        let tar_name = format!("{}/", name.trim_end_matches('/'));
        let header = tar_header(&tar_name, 0, mode, tar::EntryType::Directory, None);
        self.segment(header.as_bytes());
        let mut entry = serde_json::json!({
            "name": tar_name,
            "type": "dir",
            "mode": mode,
            "uid": uid,
            "gid": gid,
            "modtime": "2021-01-01T00:00:00Z",
            "NumLink": 2,
        });
        attach_xattrs(&mut entry, xattrs);
        self.toc_entries.push(entry);
    }

    pub fn file(&mut self, name: &str, data: &[u8], mode: u32) {
        self.file_full(name, data, mode, 0, 0, &[]);
    }

    pub fn file_full(
        &mut self,
        name: &str,
        data: &[u8],
        mode: u32,
        uid: u32,
        gid: u32,
        xattrs: &[(&str, &[u8])],
    ) {
        let header = tar_header(name, data.len() as u64, mode, tar::EntryType::Regular, None);
        self.segment(header.as_bytes());

        let digest = format!("sha256:{}", hex::encode(openssl::sha::sha256(data)));
        let chunk = if self.chunk_size == 0 {
            data.len().max(1)
        } else {
            self.chunk_size
        };

        let mut first = true;
        let mut off = 0usize;
        loop {
            let end = (off + chunk).min(data.len());
            let blob_off = self.out.len() as u64;
            self.segment(&data[off..end]);
            if first {
                let mut entry = serde_json::json!({
                    "name": name,
                    "type": "reg",
                    "size": data.len() as u64,
                    "mode": mode,
                    "uid": uid,
                    "gid": gid,
                    "modtime": "2021-01-01T00:00:00Z",
                    "digest": digest,
                    "offset": blob_off,
                });
                if end < data.len() {
                    entry["chunkSize"] = serde_json::json!((end - off) as u64);
                }
                attach_xattrs(&mut entry, xattrs);
                self.toc_entries.push(entry);
                first = false;
            } else {
                self.toc_entries.push(serde_json::json!({
                    "name": name,
                    "type": "chunk",
                    "offset": blob_off,
                    "chunkOffset": off as u64,
                    "chunkSize": (end - off) as u64,
                }));
            }
            if end >= data.len() {
                break;
            }
            off = end;
        }

        // block padding rides in its own member so content members stay pure
        let pad = (512 - data.len() % 512) % 512;
        if pad > 0 {
            self.segment(&vec![0u8; pad]);
        }
    }

    pub fn symlink(&mut self, name: &str, target: &str) {
        let header = tar_header(name, 0, 0o777, tar::EntryType::Symlink, Some(target));
        self.segment(header.as_bytes());
        self.toc_entries.push(serde_json::json!({
            "name": name,
            "type": "symlink",
            "linkName": target,
            "mode": 0o777,
            "modtime": "2021-01-01T00:00:00Z",
        }));
    }

    pub fn hardlink(&mut self, name: &str, target: &str) {
        let header = tar_header(name, 0, 0o644, tar::EntryType::Link, Some(target));
        self.segment(header.as_bytes());
        self.toc_entries.push(serde_json::json!({
            "name": name,
            "type": "hardlink",
            "linkName": target,
        }));
    }

    /// Place the prefetch landmark; entries added before it form the
    /// eagerly fetched prefix.
    pub fn landmark(&mut self) {
        self.file(PREFETCH_LANDMARK, &[LANDMARK_CONTENTS], 0o644);
    }

    pub fn no_prefetch_landmark(&mut self) {
        self.file(NO_PREFETCH_LANDMARK, &[LANDMARK_CONTENTS], 0o644);
    }

    /// Finish the archive: append the TOC entry and the footer.
    pub fn build(mut self) -> Vec<u8> {
        let toc = serde_json::json!({
            "version": 1,
            "entries": self.toc_entries,
        });
        let body = serde_json::to_vec(&toc).unwrap();

        let toc_off = self.out.len() as u64;
        let mut member = Vec::new();
        let header = tar_header(
            TOC_NAME,
            body.len() as u64,
            0o444,
            tar::EntryType::Regular,
            None,
        );
        member.extend_from_slice(header.as_bytes());
        member.extend_from_slice(&body);
        let pad = (512 - body.len() % 512) % 512;
        member.extend_from_slice(&vec![0u8; pad]);
        // end-of-archive marker
        member.extend_from_slice(&[0u8; 1024]);
        self.segment(&member);

        self.out.extend_from_slice(&footer_bytes(toc_off));
        self.out
    }

    fn segment(&mut self, data: &[u8]) {
        let mut gz = GzEncoder::new(&mut self.out, Compression::default());
        gz.write_all(data).unwrap();
        gz.finish().unwrap();
    }
}

fn attach_xattrs(entry: &mut serde_json::Value, xattrs: &[(&str, &[u8])]) {
    if xattrs.is_empty() {
        return;
    }
    let map: serde_json::Map<String, serde_json::Value> = xattrs
        .iter()
        .map(|(k, v)| (k.to_string(), serde_json::json!(base64::encode(v))))
        .collect();
    entry["xattrs"] = serde_json::Value::Object(map);
}

fn tar_header(
    name: &str,
    size: u64,
    mode: u32,
    entry_type: tar::EntryType,
    link: Option<&str>,
) -> tar::Header {
    let mut header = tar::Header::new_ustar();
    header.set_path(name).unwrap();
    header.set_size(size);
    header.set_mode(mode);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mtime(1609459200);
    header.set_entry_type(entry_type);
    if let Some(link) = link {
        header.set_link_name(link).unwrap();
    }
    header.set_cksum();
    header
}

/// The 51-byte archive footer pointing at `toc_off`.
pub fn footer_bytes(toc_off: u64) -> [u8; 51] {
    let mut out = [0u8; 51];
    out[0] = 0x1f;
    out[1] = 0x8b;
    out[2] = 0x08; // deflate
    out[3] = 0x04; // FEXTRA
    out[9] = 0xff; // unknown OS
    out[10..12].copy_from_slice(&26u16.to_le_bytes());
    out[12..14].copy_from_slice(b"SG");
    out[14..16].copy_from_slice(&22u16.to_le_bytes());
    out[16..32].copy_from_slice(format!("{:016x}", toc_off).as_bytes());
    out[32..38].copy_from_slice(b"STARGZ");
    // empty stored deflate block, zero CRC32 and ISIZE
    out[38..43].copy_from_slice(&[0x01, 0x00, 0x00, 0xff, 0xff]);
    out
}
