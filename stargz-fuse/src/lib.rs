//! FUSE surface of a mounted layer.
//!
//! Thin dispatch from fuser callbacks onto the immutable [`NodeTable`];
//! all filesystem semantics (whiteouts, access, the state file) live
//! there, which keeps them testable without a kernel mount.

use std::ffi::OsStr;
use std::io;
use std::path::Path;
use std::time::Duration;

use fuser::{
    Filesystem, MountOption, ReplyAttr, ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry,
    ReplyXattr, Request,
};

pub mod node;
pub mod state;

pub use node::NodeTable;
pub use state::LayerState;

/// Kernel-side attribute and entry cache lifetime. Negative entries are
/// not cached at all (fuser replies to failed lookups without a TTL).
const TTL: Duration = Duration::from_secs(1);

pub struct StargzFs {
    table: NodeTable,
}

impl StargzFs {
    pub fn new(table: NodeTable) -> Self {
        Self { table }
    }
}

impl Filesystem for StargzFs {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(name) = name.to_str() else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.table.lookup(parent, name) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        match self.table.getattr(ino) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(errno) => reply.error(errno),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        match self.table.readlink(ino) {
            Ok(target) => reply.data(&target),
            Err(errno) => reply.error(errno),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }
        match self.table.read(ino, offset as u64, size as usize) {
            Ok(data) => reply.data(&data),
            Err(errno) => reply.error(errno),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let entries = match self.table.readdir(ino) {
            Ok(entries) => entries,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        let parent = self.table.parent_of(ino).unwrap_or(NodeTable::ROOT_INO);

        let mut all = Vec::with_capacity(entries.len() + 2);
        all.push((ino, fuser::FileType::Directory, ".".to_string()));
        all.push((parent, fuser::FileType::Directory, "..".to_string()));
        all.extend(entries);

        for (i, (cino, kind, name)) in all.into_iter().enumerate().skip(offset as usize) {
            if reply.add(cino, (i + 1) as i64, kind, &name) {
                break;
            }
        }
        reply.ok();
    }

    fn getxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        size: u32,
        reply: ReplyXattr,
    ) {
        let Some(name) = name.to_str() else {
            reply.error(libc::ENODATA);
            return;
        };
        match self.table.getxattr(ino, name) {
            Ok(value) => reply_xattr(reply, &value, size),
            Err(errno) => reply.error(errno),
        }
    }

    fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        match self.table.listxattr(ino) {
            Ok(names) => reply_xattr(reply, &names, size),
            Err(errno) => reply.error(errno),
        }
    }

    fn access(&mut self, req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        match self.table.access(ino, req.uid(), req.gid(), mask) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }
}

/// The xattr size negotiation: a zero-sized probe asks for the length,
/// anything smaller than the value is ERANGE.
fn reply_xattr(reply: ReplyXattr, data: &[u8], size: u32) {
    if size == 0 {
        reply.size(data.len() as u32);
    } else if (size as usize) < data.len() {
        reply.error(libc::ERANGE);
    } else {
        reply.data(data);
    }
}

/// Mount the node table and serve it from a dedicated session thread. The
/// returned session unmounts on drop.
pub fn mount(table: NodeTable, mountpoint: &Path) -> io::Result<fuser::BackgroundSession> {
    let options = [
        MountOption::RO,
        MountOption::AllowOther,
        MountOption::FSName("stargz".to_string()),
        MountOption::Subtype("stargz".to_string()),
    ];
    fuser::spawn_mount2(StargzFs::new(table), mountpoint, &options)
}
