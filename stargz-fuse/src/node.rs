//! The node tree of one mounted layer.
//!
//! One node per archive entry plus the synthetic ones: whiteout devices
//! standing in for deleted lower-layer names, and the state directory with
//! its stat file at the root. Inode numbers are the entry's position in
//! the TOC index plus one (FUSE reserves ino 1 for the root, which is
//! entry 0); synthetic nodes get numbers past the TOC range. The table is
//! immutable after construction, every operation is a lookup.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{FileAttr, FileType};
use libc::c_int;

use stargz_archive::toc::{is_reserved_name, EntryType, TocIndex};
use stargz_archive::ArchiveReader;

use crate::state::LayerState;

pub const BLOCK_SIZE: u32 = 512;
/// Basename prefix marking an overlayfs whiteout.
pub const WHITEOUT_PREFIX: &str = ".wh.";
/// Doubly-prefixed marker declaring its directory opaque.
pub const OPAQUE_MARKER: &str = ".wh..wh..opq";
pub const OPAQUE_XATTR: &str = "trusted.overlay.opaque";
/// Synthetic directory exposing per-layer health at the root.
pub const STATE_DIR_NAME: &str = ".stargz-snapshotter";

enum NodeKind {
    Dir {
        entry: usize,
        opaque: bool,
        children: BTreeMap<String, u64>,
    },
    /// Regular files and the special kinds that only carry attributes.
    File {
        entry: usize,
    },
    Symlink {
        entry: usize,
    },
    Whiteout,
    StateDir {
        children: BTreeMap<String, u64>,
    },
    StatFile,
}

struct Node {
    parent: u64,
    kind: NodeKind,
}

pub struct NodeTable {
    nodes: Vec<Node>,
    index: Arc<TocIndex>,
    reader: Arc<ArchiveReader>,
    state: Arc<LayerState>,
}

impl NodeTable {
    pub const ROOT_INO: u64 = 1;

    pub fn build(reader: Arc<ArchiveReader>, state: Arc<LayerState>) -> Self {
        let index = reader.index();

        let mut nodes: Vec<Node> = (0..index.len())
            .map(|id| {
                let kind = match index.entry(id).kind {
                    EntryType::Dir => NodeKind::Dir {
                        entry: id,
                        opaque: false,
                        children: BTreeMap::new(),
                    },
                    EntryType::Symlink => NodeKind::Symlink { entry: id },
                    _ => NodeKind::File { entry: id },
                };
                Node {
                    parent: Self::ROOT_INO,
                    kind,
                }
            })
            .collect();

        for id in 0..index.len() {
            let entry = index.entry(id);
            if !entry.is_dir() {
                continue;
            }
            let is_root = id == index.root();
            let dir_ino = id as u64 + 1;
            let opaque = entry.children.contains_key(OPAQUE_MARKER);

            let mut children: BTreeMap<String, u64> = BTreeMap::new();
            for (name, &cid) in &entry.children {
                if is_root && is_reserved_name(name) {
                    continue;
                }
                if name.starts_with(WHITEOUT_PREFIX) {
                    continue;
                }
                children.insert(name.clone(), cid as u64 + 1);
            }

            // remaining .wh.<name> entries become whiteout devices, unless
            // a real sibling shadows them
            for name in entry.children.keys() {
                if name == OPAQUE_MARKER || !name.starts_with(WHITEOUT_PREFIX) {
                    continue;
                }
                let real = &name[WHITEOUT_PREFIX.len()..];
                if real.is_empty() || children.contains_key(real) {
                    continue;
                }
                let ino = nodes.len() as u64 + 1;
                nodes.push(Node {
                    parent: dir_ino,
                    kind: NodeKind::Whiteout,
                });
                children.insert(real.to_string(), ino);
            }

            if is_root {
                let stat_ino = nodes.len() as u64 + 2;
                let state_ino = nodes.len() as u64 + 1;
                nodes.push(Node {
                    parent: dir_ino,
                    kind: NodeKind::StateDir {
                        children: BTreeMap::from([(state.stat_file_name(), stat_ino)]),
                    },
                });
                nodes.push(Node {
                    parent: state_ino,
                    kind: NodeKind::StatFile,
                });
                children.insert(STATE_DIR_NAME.to_string(), state_ino);
            }

            for &ino in children.values() {
                if let Some(node) = nodes.get_mut(ino as usize - 1) {
                    node.parent = dir_ino;
                }
            }
            nodes[id].kind = NodeKind::Dir {
                entry: id,
                opaque,
                children,
            };
        }

        Self {
            nodes,
            index,
            reader,
            state,
        }
    }

    fn node(&self, ino: u64) -> Result<&Node, c_int> {
        ino.checked_sub(1)
            .and_then(|idx| self.nodes.get(idx as usize))
            .ok_or(libc::ENOENT)
    }

    fn children_of(&self, ino: u64) -> Result<&BTreeMap<String, u64>, c_int> {
        match &self.node(ino)?.kind {
            NodeKind::Dir { children, .. } => Ok(children),
            NodeKind::StateDir { children } => Ok(children),
            _ => Err(libc::ENOTDIR),
        }
    }

    pub fn getattr(&self, ino: u64) -> Result<FileAttr, c_int> {
        let node = self.node(ino)?;
        Ok(self.attr_of(ino, node))
    }

    pub fn lookup(&self, parent: u64, name: &str) -> Result<FileAttr, c_int> {
        let children = self.children_of(parent)?;
        let ino = *children.get(name).ok_or(libc::ENOENT)?;
        self.getattr(ino)
    }

    /// All entries of a directory, name-sorted, as (ino, type, name).
    pub fn readdir(&self, ino: u64) -> Result<Vec<(u64, FileType, String)>, c_int> {
        let children = self.children_of(ino)?;
        Ok(children
            .iter()
            .map(|(name, &cino)| (cino, self.type_of(cino), name.clone()))
            .collect())
    }

    pub fn parent_of(&self, ino: u64) -> Result<u64, c_int> {
        Ok(self.node(ino)?.parent)
    }

    pub fn readlink(&self, ino: u64) -> Result<Vec<u8>, c_int> {
        match &self.node(ino)?.kind {
            NodeKind::Symlink { entry } => {
                Ok(self.index.entry(*entry).link_name.as_bytes().to_vec())
            }
            _ => Err(libc::EINVAL),
        }
    }

    /// Read file contents. Short only at EOF; failures are mirrored into
    /// the state file and surface as EIO.
    pub fn read(&self, ino: u64, offset: u64, size: usize) -> Result<Vec<u8>, c_int> {
        match &self.node(ino)?.kind {
            NodeKind::File { entry } => {
                let entry = *entry;
                let meta = self.index.entry(entry);
                if !meta.is_reg() {
                    return Err(libc::EINVAL);
                }
                let len = size.min(meta.size.saturating_sub(offset) as usize);
                let mut buf = vec![0u8; len];
                match self.reader.read_file_at(entry, &mut buf, offset) {
                    Ok(n) => {
                        buf.truncate(n);
                        Ok(buf)
                    }
                    Err(err) => {
                        log::warn!("read of {:?} failed: {:#}", meta.name, err);
                        self.state.record_error(&format!("{:#}", err));
                        Err(libc::EIO)
                    }
                }
            }
            NodeKind::StatFile => {
                let data = self.state.render();
                let start = (offset as usize).min(data.len());
                let end = (start + size).min(data.len());
                Ok(data[start..end].to_vec())
            }
            NodeKind::Dir { .. } | NodeKind::StateDir { .. } => Err(libc::EISDIR),
            _ => Err(libc::EINVAL),
        }
    }

    pub fn getxattr(&self, ino: u64, name: &str) -> Result<Vec<u8>, c_int> {
        let node = self.node(ino)?;
        if name == OPAQUE_XATTR {
            if let NodeKind::Dir { opaque: true, .. } = node.kind {
                return Ok(b"y".to_vec());
            }
            return Err(libc::ENODATA);
        }
        match &node.kind {
            NodeKind::Dir { entry, .. } | NodeKind::File { entry } | NodeKind::Symlink { entry } => {
                self.index
                    .entry(*entry)
                    .xattrs
                    .get(name)
                    .cloned()
                    .ok_or(libc::ENODATA)
            }
            _ => Err(libc::ENODATA),
        }
    }

    /// Attribute names as a nul-separated list, the opaque marker included
    /// where it applies.
    pub fn listxattr(&self, ino: u64) -> Result<Vec<u8>, c_int> {
        let node = self.node(ino)?;
        let mut out = Vec::new();
        if let NodeKind::Dir { opaque: true, .. } = node.kind {
            out.extend_from_slice(OPAQUE_XATTR.as_bytes());
            out.push(0);
        }
        if let NodeKind::Dir { entry, .. } | NodeKind::File { entry } | NodeKind::Symlink { entry } =
            &node.kind
        {
            for name in self.index.entry(*entry).xattrs.keys() {
                out.extend_from_slice(name.as_bytes());
                out.push(0);
            }
        }
        Ok(out)
    }

    /// POSIX permission gate: root passes, everyone else needs a non-empty
    /// intersection with their mode slice.
    pub fn access(&self, ino: u64, uid: u32, gid: u32, mask: i32) -> Result<(), c_int> {
        let node = self.node(ino)?;
        if mask == libc::F_OK || uid == 0 {
            return Ok(());
        }
        let (owner, group, mode) = match &node.kind {
            NodeKind::Dir { entry, .. } | NodeKind::File { entry } | NodeKind::Symlink { entry } => {
                let meta = self.index.entry(*entry);
                (meta.uid, meta.gid, meta.mode)
            }
            NodeKind::Whiteout => (0, 0, 0),
            NodeKind::StateDir { .. } => (0, 0, 0o500),
            NodeKind::StatFile => (0, 0, 0o400),
        };
        let perm = mode & 0o777;
        let slice = if uid == owner {
            (perm >> 6) & 0o7
        } else if gid == group {
            (perm >> 3) & 0o7
        } else {
            perm & 0o7
        };
        if mask as u32 & slice != 0 {
            Ok(())
        } else {
            Err(libc::EPERM)
        }
    }

    fn type_of(&self, ino: u64) -> FileType {
        match self.node(ino) {
            Ok(node) => match &node.kind {
                NodeKind::Dir { .. } | NodeKind::StateDir { .. } => FileType::Directory,
                NodeKind::Symlink { .. } => FileType::Symlink,
                NodeKind::Whiteout => FileType::CharDevice,
                NodeKind::StatFile => FileType::RegularFile,
                NodeKind::File { entry } => entry_type(self.index.entry(*entry).kind),
            },
            Err(_) => FileType::RegularFile,
        }
    }

    fn attr_of(&self, ino: u64, node: &Node) -> FileAttr {
        match &node.kind {
            NodeKind::Dir { entry, .. } | NodeKind::File { entry } | NodeKind::Symlink { entry } => {
                let meta = self.index.entry(*entry);
                let mtime = timestamp(meta.mtime);
                file_attr(
                    ino,
                    meta.size,
                    entry_type(meta.kind),
                    meta.mode as u16,
                    meta.num_link,
                    meta.uid,
                    meta.gid,
                    makedev(meta.dev_major, meta.dev_minor),
                    mtime,
                )
            }
            NodeKind::Whiteout => file_attr(ino, 0, FileType::CharDevice, 0, 1, 0, 0, 0, UNIX_EPOCH),
            NodeKind::StateDir { .. } => {
                file_attr(ino, 0, FileType::Directory, 0o500, 1, 0, 0, 0, UNIX_EPOCH)
            }
            NodeKind::StatFile => {
                // the size tracks the current rendering
                let len = self.state.render().len() as u64;
                file_attr(ino, len, FileType::RegularFile, 0o400, 1, 0, 0, 0, UNIX_EPOCH)
            }
        }
    }
}

fn entry_type(kind: EntryType) -> FileType {
    match kind {
        EntryType::Dir => FileType::Directory,
        EntryType::Symlink => FileType::Symlink,
        EntryType::Char => FileType::CharDevice,
        EntryType::Block => FileType::BlockDevice,
        EntryType::Fifo => FileType::NamedPipe,
        EntryType::Socket => FileType::Socket,
        _ => FileType::RegularFile,
    }
}

#[allow(clippy::too_many_arguments)]
fn file_attr(
    ino: u64,
    size: u64,
    kind: FileType,
    perm: u16,
    nlink: u32,
    uid: u32,
    gid: u32,
    rdev: u32,
    mtime: SystemTime,
) -> FileAttr {
    FileAttr {
        ino,
        size,
        blocks: (size + u64::from(BLOCK_SIZE) - 1) / u64::from(BLOCK_SIZE),
        atime: mtime,
        mtime,
        ctime: mtime,
        crtime: mtime,
        kind,
        perm,
        nlink,
        uid,
        gid,
        rdev,
        blksize: BLOCK_SIZE,
        flags: 0,
    }
}

fn timestamp((secs, nanos): (i64, u32)) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::new(secs as u64, nanos)
    } else {
        UNIX_EPOCH - Duration::new(secs.unsigned_abs(), 0)
    }
}

/// Linux dev_t packing, truncated to the 32 bits FUSE carries.
fn makedev(major: u32, minor: u32) -> u32 {
    ((major & 0xfff) << 8) | (minor & 0xff) | ((minor & 0xfff00) << 12)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;

    use stargz_archive::testutil::ArchiveBuilder;
    use stargz_cache::MemoryCache;
    use stargz_tools::byte_pool::BufferPool;

    fn mount_table(builder: ArchiveBuilder) -> NodeTable {
        let blob = builder.build();
        let size = blob.len() as u64;
        let reader = Arc::new(
            ArchiveReader::open(
                Arc::new(blob),
                size,
                Arc::new(MemoryCache::new()),
                Arc::new(BufferPool::new(8)),
                false,
            )
            .unwrap(),
        );
        let state = Arc::new(LayerState::new("sha256:layertest".into(), size, Box::new(|| 0)));
        NodeTable::build(reader, state)
    }

    fn lookup_ino(table: &NodeTable, parent: u64, name: &str) -> u64 {
        table.lookup(parent, name).unwrap().ino
    }

    fn names(table: &NodeTable, ino: u64) -> Vec<String> {
        table
            .readdir(ino)
            .unwrap()
            .into_iter()
            .map(|(_, _, name)| name)
            .collect()
    }

    #[test]
    fn test_tree_and_attrs() {
        let mut builder = ArchiveBuilder::new();
        builder.dir("etc", 0o755);
        builder.file_full("etc/os-release", b"NAME=test\n", 0o640, 12, 34, &[]);
        builder.symlink("etc/alias", "os-release");
        let table = mount_table(builder);

        let root = table.getattr(NodeTable::ROOT_INO).unwrap();
        assert_eq!(root.kind, FileType::Directory);

        let etc = lookup_ino(&table, NodeTable::ROOT_INO, "etc");
        let attr = table.lookup(etc, "os-release").unwrap();
        assert_eq!(attr.kind, FileType::RegularFile);
        assert_eq!(attr.size, 10);
        assert_eq!(attr.perm, 0o640);
        assert_eq!(attr.uid, 12);
        assert_eq!(attr.gid, 34);
        assert_eq!(attr.blksize, 512);
        assert_eq!(attr.blocks, 1);

        // the same entry queried twice resolves to the same inode
        assert_eq!(attr.ino, table.lookup(etc, "os-release").unwrap().ino);

        let link = table.lookup(etc, "alias").unwrap();
        assert_eq!(link.kind, FileType::Symlink);
        assert_eq!(table.readlink(link.ino).unwrap(), b"os-release");

        let mut buf = table.read(attr.ino, 0, 64).unwrap();
        assert_eq!(buf, b"NAME=test\n");
        buf = table.read(attr.ino, 5, 64).unwrap();
        assert_eq!(buf, b"test\n");
    }

    #[test]
    fn test_root_listing_hides_reserved_names() {
        let mut builder = ArchiveBuilder::new();
        builder.file("visible", b"x", 0o644);
        builder.landmark();
        let table = mount_table(builder);

        let listed = names(&table, NodeTable::ROOT_INO);
        assert_eq!(listed, vec![STATE_DIR_NAME.to_string(), "visible".to_string()]);

        // negative form: reserved names do not resolve
        assert_eq!(
            table.lookup(NodeTable::ROOT_INO, ".prefetch.landmark").unwrap_err(),
            libc::ENOENT
        );
        assert_eq!(
            table.lookup(NodeTable::ROOT_INO, "stargz.index.json").unwrap_err(),
            libc::ENOENT
        );
    }

    #[test]
    fn test_whiteout_shadowing() {
        let mut builder = ArchiveBuilder::new();
        builder.dir("a", 0o755);
        builder.file("a/.wh.b", b"", 0o600);
        builder.file("a/present", b"x", 0o644);
        builder.file("a/.wh.present", b"", 0o600);
        let table = mount_table(builder);

        let a = lookup_ino(&table, NodeTable::ROOT_INO, "a");
        assert_eq!(names(&table, a), vec!["b".to_string(), "present".to_string()]);

        // b exists only as its whiteout: a char device with rdev 0
        let b = table.lookup(a, "b").unwrap();
        assert_eq!(b.kind, FileType::CharDevice);
        assert_eq!(b.rdev, 0);
        assert_eq!(b.size, 0);

        // the real sibling wins over its whiteout
        let present = table.lookup(a, "present").unwrap();
        assert_eq!(present.kind, FileType::RegularFile);

        // raw whiteout names never resolve
        assert_eq!(table.lookup(a, ".wh.b").unwrap_err(), libc::ENOENT);
    }

    #[test]
    fn test_opaque_directory() {
        let mut builder = ArchiveBuilder::new();
        builder.dir("opaq", 0o755);
        builder.file("opaq/.wh..wh..opq", b"", 0o600);
        builder.file("opaq/kept", b"x", 0o644);
        builder.dir("plain", 0o755);
        let table = mount_table(builder);

        let opaq = lookup_ino(&table, NodeTable::ROOT_INO, "opaq");
        assert_eq!(names(&table, opaq), vec!["kept".to_string()]);
        assert_eq!(table.getxattr(opaq, OPAQUE_XATTR).unwrap(), b"y");
        let listed = table.listxattr(opaq).unwrap();
        assert_eq!(listed, b"trusted.overlay.opaque\0");

        let plain = lookup_ino(&table, NodeTable::ROOT_INO, "plain");
        assert_eq!(table.getxattr(plain, OPAQUE_XATTR).unwrap_err(), libc::ENODATA);
        assert!(table.listxattr(plain).unwrap().is_empty());
    }

    #[test]
    fn test_entry_xattrs() {
        let mut builder = ArchiveBuilder::new();
        builder.file_full(
            "f",
            b"x",
            0o644,
            0,
            0,
            &[("user.note", "hi".as_bytes()), ("user.more", "yo".as_bytes())],
        );
        let table = mount_table(builder);

        let f = lookup_ino(&table, NodeTable::ROOT_INO, "f");
        assert_eq!(table.getxattr(f, "user.note").unwrap(), b"hi");
        assert_eq!(table.getxattr(f, "user.gone").unwrap_err(), libc::ENODATA);
        assert_eq!(table.listxattr(f).unwrap(), b"user.more\0user.note\0");
    }

    #[test]
    fn test_access_gate() {
        let mut builder = ArchiveBuilder::new();
        builder.file_full("secret", b"x", 0o640, 1000, 2000, &[]);
        let table = mount_table(builder);
        let f = lookup_ino(&table, NodeTable::ROOT_INO, "secret");

        // root passes any mask
        assert!(table.access(f, 0, 0, libc::R_OK | libc::W_OK).is_ok());
        // owner reads, others do not
        assert!(table.access(f, 1000, 2000, libc::R_OK).is_ok());
        assert!(table.access(f, 1000, 0, libc::W_OK).is_ok());
        assert!(table.access(f, 3000, 2000, libc::R_OK).is_ok());
        assert_eq!(table.access(f, 3000, 3000, libc::R_OK).unwrap_err(), libc::EPERM);
        // existence checks always pass
        assert!(table.access(f, 3000, 3000, libc::F_OK).is_ok());
    }

    #[test]
    fn test_state_file() {
        let mut builder = ArchiveBuilder::new();
        builder.file("f", b"x", 0o644);
        let table = mount_table(builder);

        let state_dir = lookup_ino(&table, NodeTable::ROOT_INO, STATE_DIR_NAME);
        let attr = table.getattr(state_dir).unwrap();
        assert_eq!(attr.kind, FileType::Directory);
        assert_eq!(attr.perm, 0o500);
        assert_eq!(attr.uid, 0);

        let listed = names(&table, state_dir);
        assert_eq!(listed, vec!["sha256:layertest.json".to_string()]);

        let stat = table.lookup(state_dir, "sha256:layertest.json").unwrap();
        assert_eq!(stat.perm, 0o400);
        let data = table.read(stat.ino, 0, 4096).unwrap();
        assert_eq!(data.last(), Some(&b'\n'));
        let doc: serde_json::Value = serde_json::from_slice(&data).unwrap();
        assert_eq!(doc["digest"], "sha256:layertest");
        assert!(doc["fetchedPercent"].as_f64().unwrap() >= 0.0);
        assert_eq!(stat.size, data.len() as u64);

        // the stat file keeps its inode across queries
        assert_eq!(
            stat.ino,
            table.lookup(state_dir, "sha256:layertest.json").unwrap().ino
        );
    }

    #[test]
    fn test_hardlinks_share_inode() {
        let mut builder = ArchiveBuilder::new();
        builder.file("orig", b"data", 0o644);
        builder.hardlink("alias", "orig");
        let table = mount_table(builder);

        let orig = table.lookup(NodeTable::ROOT_INO, "orig").unwrap();
        let alias = table.lookup(NodeTable::ROOT_INO, "alias").unwrap();
        assert_eq!(orig.ino, alias.ino);
    }
}
