use std::time::SystemTime;

use parking_lot::{Mutex, RwLock};

use crate::error::{FsError, FsResult};
use crate::file::{FileHandle, FileId};
use crate::index::TagIndex;
use crate::path;
use crate::plan::{self, MkdirOutcome, RenameOutcome, RmdirOutcome, UnlinkOutcome};
use crate::project::{self, ProjectedEntry};
use crate::query::Query;
use crate::store::{translate_link, Store};
use crate::fs::tree::DirTree;

pub mod dispatch;
pub mod tree;

/// The mounted instance: store plus derived index behind one
/// readers-writer lock, and the session-local directory-node tree.
///
/// Reads (lookup, getattr, readdir, read, readlink) take the lock shared;
/// everything that mutates takes it exclusive. The store commit inside
/// the exclusive section is the linearization point, so a reader can
/// never observe a file in the index that the tables do not have.
pub struct TagFs {
    core: RwLock<Core>,
    tree: Mutex<DirTree>,
    mount_time: SystemTime,
    owner_uid: u32,
    owner_gid: u32,
}

struct Core {
    store: Store,
    index: TagIndex,
}

/// Plain metadata for one file, sized for the depth it was resolved at
/// (a relative symlink grows by one `../` per tag on the path).
#[derive(Debug, Clone)]
pub struct FileStat {
    pub id: FileId,
    pub size: u64,
    pub mode: u16,
    pub uid: u32,
    pub gid: u32,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    pub is_symlink: bool,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Resolved {
    File(FileId),
    Dir(String),
}

/// Metadata changes carried by `setattr`; unset fields stay put.
#[derive(Debug, Default, Clone, Copy)]
pub struct SetAttr {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime: Option<SystemTime>,
    pub mtime: Option<SystemTime>,
}

impl TagFs {
    pub fn new(store: Store, owner_uid: u32, owner_gid: u32) -> Self {
        let index = TagIndex::rebuild(store.tables().files.iter());
        TagFs {
            core: RwLock::new(Core { store, index }),
            tree: Mutex::new(DirTree::new()),
            mount_time: SystemTime::now(),
            owner_uid,
            owner_gid,
        }
    }

    pub fn mount_time(&self) -> SystemTime {
        self.mount_time
    }

    pub fn owner(&self) -> (u32, u32) {
        (self.owner_uid, self.owner_gid)
    }

    pub fn file_count(&self) -> u64 {
        self.core.read().store.tables().file_count()
    }

    // Read path.

    /// Directory listing for the tag path `T`, dot-hiding applied.
    pub fn list_dir(&self, tags: &[String]) -> FsResult<Vec<ProjectedEntry>> {
        let core = self.core.read();
        let q = Query::new(core.store.tables(), &core.index);
        Ok(project::project(&q, tags))
    }

    /// Resolve one leaf under `T`, de-dotting first. A file beats a tag of
    /// the same name; the delete sentinel never resolves.
    pub fn resolve_leaf(&self, tags: &[String], name: &str) -> FsResult<Resolved> {
        if name == path::DELETE_SENTINEL {
            return Err(FsError::NotFound(name.to_owned()));
        }
        let bare = path::strip_hidden(name);
        let core = self.core.read();
        let q = Query::new(core.store.tables(), &core.index);
        if let Some(id) = q.tables.id_by_name(bare) {
            if q.file_matches(id, tags) {
                return Ok(Resolved::File(id));
            }
        }
        if q.tag_resolves(tags, bare) {
            return Ok(Resolved::Dir(bare.to_owned()));
        }
        Err(FsError::NotFound(name.to_owned()))
    }

    pub fn stat_file(&self, id: FileId, depth: usize) -> FsResult<FileStat> {
        let core = self.core.read();
        let entry = core
            .store
            .tables()
            .entry(id)
            .ok_or_else(|| FsError::NotFound(format!("file #{}", id.0)))?;
        let size = match &entry.symlink_target {
            Some(target) => translate_link(depth, target).len() as u64,
            None => entry.size,
        };
        Ok(FileStat {
            id,
            size,
            mode: entry.mode,
            uid: entry.uid,
            gid: entry.gid,
            atime: entry.atime,
            mtime: entry.mtime,
            ctime: entry.ctime,
            is_symlink: entry.is_symlink(),
        })
    }

    /// The stored target, rewritten for the depth it is read from.
    pub fn read_link(&self, id: FileId, depth: usize) -> FsResult<String> {
        let core = self.core.read();
        let entry = core
            .store
            .tables()
            .entry(id)
            .ok_or_else(|| FsError::NotFound(format!("file #{}", id.0)))?;
        let target = entry
            .symlink_target
            .as_deref()
            .ok_or(FsError::Invalid("readlink of a regular file"))?;
        Ok(translate_link(depth, target))
    }

    // Write path. Each operation stages a transaction, commits, then
    // patches the index from the outcome; an abort leaves both untouched.

    pub fn create_file(
        &self,
        tags: &[String],
        name: &str,
        mode: u16,
        uid: u32,
        gid: u32,
    ) -> FsResult<(FileId, FileHandle)> {
        let name = path::strip_hidden(name);
        let core = &mut *self.core.write();
        let mut txn = core.store.begin();
        let id = plan::create_file(
            &mut txn,
            &core.index,
            tags,
            name,
            mode,
            uid,
            gid,
            SystemTime::now(),
            None,
        )?;
        let fh = core.store.content().create(id)?;
        if let Err(e) = core.store.commit(txn) {
            // Abort: drop the staged bytes again, metadata never landed.
            let _ = core.store.content().release(fh);
            let _ = core.store.content().doom(id);
            return Err(e);
        }
        let tags = txn_tags(core, id);
        core.index.file_added(id, &tags);
        Ok((id, fh))
    }

    pub fn make_symlink(
        &self,
        tags: &[String],
        name: &str,
        target: &str,
        uid: u32,
        gid: u32,
    ) -> FsResult<FileId> {
        let name = path::strip_hidden(name);
        let core = &mut *self.core.write();
        let mut txn = core.store.begin();
        let id = plan::create_file(
            &mut txn,
            &core.index,
            tags,
            name,
            0o777,
            uid,
            gid,
            SystemTime::now(),
            Some(target.to_owned()),
        )?;
        core.store.commit(txn)?;
        let tags = txn_tags(core, id);
        core.index.file_added(id, &tags);
        Ok(id)
    }

    pub fn make_tag(&self, tags: &[String], name: &str) -> FsResult<MkdirOutcome> {
        let name = path::strip_hidden(name);
        let core = &mut *self.core.write();
        let mut txn = core.store.begin();
        let out = plan::make_tag(&mut txn, &core.index, tags, name)?;
        if out == MkdirOutcome::MarkerCreated {
            core.store.commit(txn)?;
        }
        Ok(out)
    }

    pub fn unlink(&self, tags: &[String], name: &str) -> FsResult<()> {
        let name = path::strip_hidden(name);
        let core = &mut *self.core.write();
        let mut txn = core.store.begin();
        let out = plan::unlink(&mut txn, &core.index, tags, name)?;
        core.store.commit(txn)?;
        match out {
            UnlinkOutcome::Deleted {
                id,
                tags,
                had_content,
            } => {
                core.index.file_removed(id, &tags);
                if had_content {
                    core.store.content().doom(id)?;
                }
            }
            UnlinkOutcome::Untagged {
                id,
                old_tags,
                new_tags,
            } => core.index.file_retagged(id, &old_tags, &new_tags),
        }
        Ok(())
    }

    pub fn remove_tag_dir(&self, tags: &[String], name: &str) -> FsResult<()> {
        let name = path::strip_hidden(name);
        let core = &mut *self.core.write();
        let mut txn = core.store.begin();
        let out = plan::remove_tag_dir(&mut txn, &core.index, tags, name)?;
        if out == RmdirOutcome::MarkerRemoved {
            core.store.commit(txn)?;
        }
        Ok(())
    }

    pub fn rename(
        &self,
        src_tags: &[String],
        src_name: &str,
        dst_tags: &[String],
        dst_name: &str,
    ) -> FsResult<()> {
        let core = &mut *self.core.write();
        let mut txn = core.store.begin();
        let out = plan::rename(
            &mut txn,
            &core.index,
            src_tags,
            src_name,
            dst_tags,
            dst_name,
            SystemTime::now(),
        )?;
        if out == RenameOutcome::Ignored {
            return Ok(());
        }
        core.store.commit(txn)?;
        match out {
            RenameOutcome::FileChanged {
                id,
                old_tags,
                new_tags,
            } => core.index.file_retagged(id, &old_tags, &new_tags),
            RenameOutcome::TagRenamed { old, new } => core.index.tag_renamed(&old, &new),
            RenameOutcome::MarkerDeleted(_) | RenameOutcome::Ignored => {}
        }
        Ok(())
    }

    pub fn set_attr(&self, id: FileId, changes: SetAttr) -> FsResult<()> {
        let now = SystemTime::now();
        let core = &mut *self.core.write();
        let mut txn = core.store.begin();
        {
            let entry = txn
                .tables
                .entry_mut(id)
                .ok_or_else(|| FsError::NotFound(format!("file #{}", id.0)))?;
            if let Some(mode) = changes.mode {
                entry.mode = (mode & 0o7777) as u16;
            }
            if let Some(uid) = changes.uid {
                entry.uid = uid;
            }
            if let Some(gid) = changes.gid {
                entry.gid = gid;
            }
            if let Some(atime) = changes.atime {
                entry.atime = atime;
            }
            if let Some(mtime) = changes.mtime {
                entry.mtime = mtime;
            }
            if let Some(size) = changes.size {
                if entry.is_symlink() {
                    return Err(FsError::Invalid("truncate of a symlink"));
                }
                entry.size = size;
                entry.mtime = now;
            }
            entry.ctime = now;
        }
        core.store.commit(txn)?;
        if let Some(size) = changes.size {
            core.store.content().truncate(id, size)?;
        }
        Ok(())
    }

    // Content I/O. Opens and reads bypass the planner entirely.

    pub fn open_file(&self, id: FileId, write: bool, trunc: bool) -> FsResult<FileHandle> {
        if trunc {
            let core = &mut *self.core.write();
            check_openable(core, id)?;
            let fh = core.store.content().open(id, true)?;
            core.store.content().truncate_handle(fh, 0)?;
            if let Some(entry) = core.store.entry_mut(id) {
                entry.size = 0;
                entry.mtime = SystemTime::now();
            }
            Ok(fh)
        } else {
            let core = self.core.read();
            check_openable(&core, id)?;
            core.store.content().open(id, write)
        }
    }

    pub fn read(&self, fh: FileHandle, offset: u64, size: u64) -> FsResult<Vec<u8>> {
        let core = self.core.read();
        core.store.content().read(fh, offset, size)
    }

    pub fn write(&self, fh: FileHandle, offset: u64, data: &[u8]) -> FsResult<u32> {
        let core = &mut *self.core.write();
        let end = core.store.content().write(fh, offset, data)?;
        if let Some(id) = core.store.content().id_of(fh) {
            if let Some(entry) = core.store.entry_mut(id) {
                if end > entry.size {
                    entry.size = end;
                }
                entry.mtime = SystemTime::now();
            }
        }
        Ok(data.len() as u32)
    }

    /// Sizes and times accumulate in memory between snapshots; flush gets
    /// them onto disk.
    pub fn flush(&self, fh: FileHandle) -> FsResult<()> {
        let core = self.core.write();
        if core.store.content().is_dirty(fh) {
            core.store.persist()?;
        }
        Ok(())
    }

    pub fn release(&self, fh: FileHandle) -> FsResult<()> {
        let core = self.core.write();
        let released = core.store.content().release(fh)?;
        if released.was_dirty {
            core.store.persist()?;
        }
        Ok(())
    }

    /// Final snapshot at unmount.
    pub fn sync(&self) -> FsResult<()> {
        self.core.write().store.persist()
    }
}

fn check_openable(core: &Core, id: FileId) -> FsResult<()> {
    let entry = core
        .store
        .tables()
        .entry(id)
        .ok_or_else(|| FsError::NotFound(format!("file #{}", id.0)))?;
    if entry.is_symlink() {
        return Err(FsError::Invalid("open of a symlink"));
    }
    Ok(())
}

fn txn_tags(core: &Core, id: FileId) -> indexmap::IndexSet<String> {
    core.store
        .tables()
        .entry(id)
        .map(|e| e.tags.clone())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mounted() -> (tempfile::TempDir, TagFs) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        (dir, TagFs::new(store, 1000, 1000))
    }

    fn tags(list: &[&str]) -> Vec<String> {
        list.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn write_grows_the_recorded_size() {
        let (_dir, fs) = mounted();
        let (id, fh) = fs.create_file(&[], "notes.txt", 0o644, 0, 0).unwrap();
        fs.write(fh, 0, b"hello").unwrap();
        fs.write(fh, 5, b" world").unwrap();
        fs.release(fh).unwrap();
        assert_eq!(fs.stat_file(id, 0).unwrap().size, 11);
    }

    #[test]
    fn truncate_shrinks_both_sides() {
        let (_dir, fs) = mounted();
        let (id, fh) = fs.create_file(&[], "notes.txt", 0o644, 0, 0).unwrap();
        fs.write(fh, 0, b"long content").unwrap();
        fs.release(fh).unwrap();
        fs.set_attr(
            id,
            SetAttr {
                size: Some(4),
                ..SetAttr::default()
            },
        )
        .unwrap();
        assert_eq!(fs.stat_file(id, 0).unwrap().size, 4);
        let fh = fs.open_file(id, false, false).unwrap();
        assert_eq!(fs.read(fh, 0, 64).unwrap(), b"long");
        fs.release(fh).unwrap();
    }

    #[test]
    fn symlink_stat_size_tracks_depth() {
        let (_dir, fs) = mounted();
        let id = fs.make_symlink(&[], "link", "target", 0, 0).unwrap();
        assert_eq!(fs.stat_file(id, 0).unwrap().size, 6);
        assert_eq!(fs.stat_file(id, 2).unwrap().size, 12);
        assert_eq!(fs.read_link(id, 1).unwrap(), "../target");
    }

    #[test]
    fn unlinked_open_file_still_reads() {
        let (_dir, fs) = mounted();
        let (_id, fh) = fs.create_file(&[], "gone.txt", 0o644, 0, 0).unwrap();
        fs.write(fh, 0, b"still here").unwrap();
        fs.unlink(&[], "gone.txt").unwrap();
        assert_eq!(fs.read(fh, 0, 64).unwrap(), b"still here");
        fs.release(fh).unwrap();
        assert_eq!(fs.file_count(), 0);
    }

    #[test]
    fn state_survives_remount() {
        let dir = tempfile::tempdir().unwrap();
        {
            let fs = TagFs::new(Store::open(dir.path()).unwrap(), 1000, 1000);
            fs.make_tag(&[], "docs").unwrap();
            let (_id, fh) = fs.create_file(&tags(&["docs"]), "a.txt", 0o644, 0, 0).unwrap();
            fs.write(fh, 0, b"abc").unwrap();
            fs.release(fh).unwrap();
        }
        let fs = TagFs::new(Store::open(dir.path()).unwrap(), 1000, 1000);
        assert_eq!(fs.file_count(), 1);
        match fs.resolve_leaf(&tags(&["docs"]), "a.txt").unwrap() {
            Resolved::File(id) => assert_eq!(fs.stat_file(id, 1).unwrap().size, 3),
            other => panic!("expected a file, got {other:?}"),
        }
    }
}
