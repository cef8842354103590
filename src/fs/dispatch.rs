//! The thin layer between kernel callbacks and the core: resolve the
//! inode to an ordered tag path, route to query/projection or the
//! planner, map errors back to errnos. No semantics live here.

use std::ffi::OsStr;
use std::path::Path;
use std::time::{Duration, SystemTime};

use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request, TimeOrNow,
};
use libc::{EINVAL, EISDIR, ENOENT, ENOTDIR, O_ACCMODE, O_RDONLY, O_TRUNC};
use log::{debug, error, warn};

use crate::error::FsError;
use crate::file::ino::Ino;
use crate::file::{FileHandle, NodeId};
use crate::fs::{Resolved, SetAttr, TagFs};
use crate::path;
use crate::project::ProjectedNode;

const TTL: Duration = Duration::new(0, 0);

macro_rules! err {
    ($reply:expr, $err:expr) => {{
        $reply.error($err);
        return;
    }};
}

impl TagFs {
    fn dir_attr(&self, ino: Ino) -> FileAttr {
        let (uid, gid) = self.owner();
        let mounted = self.mount_time();
        FileAttr {
            ino: ino.0,
            size: 0,
            blocks: 0,
            atime: mounted,
            mtime: mounted,
            ctime: mounted,
            crtime: mounted,
            kind: FileType::Directory,
            perm: 0o755,
            nlink: 2,
            uid,
            gid,
            rdev: 0,
            blksize: 512,
            flags: 0,
        }
    }

    fn file_attr(&self, stat: &crate::fs::FileStat, ino: Ino) -> FileAttr {
        FileAttr {
            ino: ino.0,
            size: stat.size,
            blocks: (stat.size + 511) / 512,
            atime: stat.atime,
            mtime: stat.mtime,
            ctime: stat.ctime,
            crtime: stat.ctime,
            kind: if stat.is_symlink {
                FileType::Symlink
            } else {
                FileType::RegularFile
            },
            perm: stat.mode,
            nlink: 1,
            uid: stat.uid,
            gid: stat.gid,
            rdev: 0,
            blksize: 512,
            flags: 0,
        }
    }

    /// The ordered tag path behind a directory inode, if this session has
    /// handed that inode out.
    fn node_tags(&self, ino: Ino) -> Option<(NodeId, Vec<String>)> {
        let node = ino.node();
        let tree = self.tree.lock();
        tree.contains(node).then(|| (node, tree.tags_of(node)))
    }
}

impl Filesystem for TagFs {
    fn destroy(&mut self) {
        if let Err(e) = self.sync() {
            error!("final snapshot failed: {e}");
        }
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let parent = Ino(parent);
        if parent.is_file() {
            err!(reply, ENOTDIR);
        }
        let Some((node, tags)) = self.node_tags(parent) else {
            err!(reply, ENOENT);
        };
        let Ok(name) = path::presented(name) else {
            err!(reply, ENOENT);
        };
        match self.resolve_leaf(&tags, name) {
            Ok(Resolved::File(id)) => match self.stat_file(id, tags.len()) {
                Ok(stat) => reply.entry(&TTL, &self.file_attr(&stat, Ino::for_file(id, node)), 0),
                Err(e) => reply.error(e.errno()),
            },
            Ok(Resolved::Dir(tag)) => {
                let child = self.tree.lock().intern(node, &tag);
                reply.entry(&TTL, &self.dir_attr(Ino::for_dir(child)), 0);
            }
            Err(e) => {
                // A directory the session has already walked (or mkdir'd
                // inside a tag path) stays resolvable without anything
                // persistent behind it.
                match self.tree.lock().child(node, path::strip_hidden(name)) {
                    Some(child) => reply.entry(&TTL, &self.dir_attr(Ino::for_dir(child)), 0),
                    None => reply.error(e.errno()),
                }
            }
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        let ino = Ino(ino);
        if ino.is_dir() {
            if self.tree.lock().contains(ino.node()) {
                reply.attr(&TTL, &self.dir_attr(ino));
            } else {
                reply.error(ENOENT);
            }
            return;
        }
        let depth = self.tree.lock().depth(ino.node());
        match self.stat_file(ino.file(), depth) {
            Ok(stat) => reply.attr(&TTL, &self.file_attr(&stat, ino)),
            Err(e) => reply.error(e.errno()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let ino = Ino(ino);
        if ino.is_dir() {
            // Synthetic directories accept and discard attribute changes;
            // rejecting them makes archive tools noisy for no benefit.
            if self.tree.lock().contains(ino.node()) {
                reply.attr(&TTL, &self.dir_attr(ino));
            } else {
                reply.error(ENOENT);
            }
            return;
        }
        let now = SystemTime::now();
        let at = |t: Option<TimeOrNow>| {
            t.map(|t| match t {
                TimeOrNow::SpecificTime(t) => t,
                TimeOrNow::Now => now,
            })
        };
        let changes = SetAttr {
            mode,
            uid,
            gid,
            size,
            atime: at(atime),
            mtime: at(mtime),
        };
        if let Err(e) = self.set_attr(ino.file(), changes) {
            err!(reply, e.errno());
        }
        let depth = self.tree.lock().depth(ino.node());
        match self.stat_file(ino.file(), depth) {
            Ok(stat) => reply.attr(&TTL, &self.file_attr(&stat, ino)),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let ino = Ino(ino);
        if ino.is_dir() {
            err!(reply, EINVAL);
        }
        let depth = self.tree.lock().depth(ino.node());
        match self.read_link(ino.file(), depth) {
            Ok(target) => reply.data(target.as_bytes()),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let Some((node, tags)) = self.node_tags(Ino(parent)) else {
            err!(reply, ENOENT);
        };
        let Ok(name) = path::presented(name) else {
            err!(reply, EINVAL);
        };
        match self.make_tag(&tags, name) {
            Ok(outcome) => {
                debug!("mkdir {name:?} under {tags:?}: {outcome:?}");
                let child = self.tree.lock().intern(node, path::strip_hidden(name));
                reply.entry(&TTL, &self.dir_attr(Ino::for_dir(child)), 0);
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some((_, tags)) = self.node_tags(Ino(parent)) else {
            err!(reply, ENOENT);
        };
        let Ok(name) = path::presented(name) else {
            err!(reply, ENOENT);
        };
        match self.unlink(&tags, name) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some((_, tags)) = self.node_tags(Ino(parent)) else {
            err!(reply, ENOENT);
        };
        let Ok(name) = path::presented(name) else {
            err!(reply, ENOENT);
        };
        match self.remove_tag_dir(&tags, name) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn symlink(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        link: &Path,
        reply: ReplyEntry,
    ) {
        let Some((node, tags)) = self.node_tags(Ino(parent)) else {
            err!(reply, ENOENT);
        };
        let (Ok(name), Some(target)) = (path::presented(name), link.to_str()) else {
            err!(reply, EINVAL);
        };
        match self.make_symlink(&tags, name, target, req.uid(), req.gid()) {
            Ok(id) => match self.stat_file(id, tags.len()) {
                Ok(stat) => reply.entry(&TTL, &self.file_attr(&stat, Ino::for_file(id, node)), 0),
                Err(e) => reply.error(e.errno()),
            },
            Err(e) => reply.error(e.errno()),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let (Some((_, src_tags)), Some((_, dst_tags))) =
            (self.node_tags(Ino(parent)), self.node_tags(Ino(newparent)))
        else {
            err!(reply, ENOENT);
        };
        let (Ok(name), Ok(newname)) = (path::presented(name), path::presented(newname)) else {
            err!(reply, EINVAL);
        };
        match self.rename(&src_tags, name, &dst_tags, newname) {
            Ok(()) => reply.ok(),
            Err(e) => {
                warn!("rename {src_tags:?}/{name} -> {dst_tags:?}/{newname} failed: {e}");
                reply.error(e.errno());
            }
        }
    }

    fn create(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let Some((node, tags)) = self.node_tags(Ino(parent)) else {
            err!(reply, ENOENT);
        };
        let Ok(name) = path::presented(name) else {
            err!(reply, EINVAL);
        };
        let mode = (mode & 0o7777) as u16;
        match self.create_file(&tags, name, mode, req.uid(), req.gid()) {
            Ok((id, fh)) => match self.stat_file(id, tags.len()) {
                Ok(stat) => reply.created(
                    &TTL,
                    &self.file_attr(&stat, Ino::for_file(id, node)),
                    0,
                    fh.0,
                    0,
                ),
                Err(e) => reply.error(e.errno()),
            },
            Err(e) => reply.error(e.errno()),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let ino = Ino(ino);
        if ino.is_dir() {
            err!(reply, EISDIR);
        }
        let write = (flags & O_ACCMODE) != O_RDONLY;
        let trunc = flags & O_TRUNC != 0;
        match self.open_file(ino.file(), write, trunc) {
            Ok(fh) => reply.opened(fh.0, 0),
            Err(e) => reply.error(e.errno()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        if offset < 0 {
            err!(reply, EINVAL);
        }
        match self.read(FileHandle(fh), offset as u64, size as u64) {
            Ok(buf) => reply.data(&buf),
            Err(e) => {
                warn!("read on handle {fh} failed: {e}");
                reply.error(e.errno());
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        if offset < 0 {
            err!(reply, EINVAL);
        }
        match self.write(FileHandle(fh), offset as u64, data) {
            Ok(written) => reply.written(written),
            Err(e) => {
                warn!("write on handle {fh} failed: {e}");
                reply.error(e.errno());
            }
        }
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        match self.flush(FileHandle(fh)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        if let Err(e) = self.release(FileHandle(fh)) {
            error!("release of handle {fh} failed: {e}");
        }
        reply.ok();
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let ino = Ino(ino);
        if ino.is_file() {
            err!(reply, ENOTDIR);
        }
        let Some((node, tags)) = self.node_tags(ino) else {
            err!(reply, ENOENT);
        };
        let listing = match self.list_dir(&tags) {
            Ok(listing) => listing,
            Err(e) => err!(reply, e.errno()),
        };

        let parent = self.tree.lock().parent(node);
        let mut entries: Vec<(u64, FileType, String)> = Vec::with_capacity(listing.len() + 2);
        entries.push((ino.0, FileType::Directory, ".".to_owned()));
        entries.push((Ino::for_dir(parent).0, FileType::Directory, "..".to_owned()));
        for entry in listing {
            match entry.node {
                ProjectedNode::Tag(ref tag) => {
                    let child = self.tree.lock().intern(node, tag);
                    entries.push((Ino::for_dir(child).0, FileType::Directory, entry.presented()));
                }
                ProjectedNode::File(id) => {
                    let kind = if entry.symlink {
                        FileType::Symlink
                    } else {
                        FileType::RegularFile
                    };
                    entries.push((Ino::for_file(id, node).0, kind, entry.presented()));
                }
            }
        }

        for (i, (eino, kind, name)) in entries.into_iter().enumerate().skip(offset.max(0) as usize)
        {
            // i + 1: the offset the kernel should resume from after this
            // entry.
            if reply.add(eino, (i + 1) as i64, kind, &name) {
                break;
            }
        }
        reply.ok();
    }

    fn link(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _newparent: u64,
        _newname: &OsStr,
        reply: ReplyEntry,
    ) {
        reply.error(FsError::Unsupported("hard links").errno());
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        reply.statfs(
            1 << 30,
            1 << 29,
            1 << 29,
            self.file_count(),
            u32::MAX as u64,
            512,
            255,
            512,
        );
    }

    fn access(&mut self, _req: &Request<'_>, _ino: u64, _mask: i32, reply: ReplyEmpty) {
        // One fixed mount-wide policy; per-entry checks would be theater.
        reply.ok();
    }
}
