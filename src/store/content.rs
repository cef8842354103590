use std::cmp::min;
use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use log::debug;
use parking_lot::Mutex;

use crate::error::FsResult;
use crate::file::{FileHandle, FileId};

/// Regular-file bytes, stored one file per [FileId] in a side directory of
/// the datastore. Symlink targets never land here; they live in the
/// metadata tables.
#[derive(Debug)]
pub struct ContentStore {
    root: PathBuf,
    open: Mutex<OpenTable>,
}

#[derive(Debug, Default)]
struct OpenTable {
    next: u64,
    handles: HashMap<FileHandle, OpenFile>,
    /// Files unlinked while still open; bytes go away on last release.
    doomed: HashSet<FileId>,
}

#[derive(Debug)]
struct OpenFile {
    id: FileId,
    file: File,
    dirty: bool,
}

/// What `release` left behind, so the caller can decide whether the
/// metadata snapshot needs another write.
#[derive(Debug, Default)]
pub struct Released {
    pub was_dirty: bool,
}

impl ContentStore {
    pub fn open_dir(datastore: &Path) -> FsResult<Self> {
        let root = datastore.join("content");
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            open: Mutex::new(OpenTable::default()),
        })
    }

    fn path_of(&self, id: FileId) -> PathBuf {
        self.root.join(id.0.to_string())
    }

    fn register(&self, id: FileId, file: File) -> FileHandle {
        let mut table = self.open.lock();
        table.next += 1;
        let handle = FileHandle(table.next);
        table.handles.insert(
            handle,
            OpenFile {
                id,
                file,
                dirty: false,
            },
        );
        handle
    }

    /// Create (or reset, after an unclean shutdown) the content file.
    pub fn create(&self, id: FileId) -> FsResult<FileHandle> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(self.path_of(id))?;
        Ok(self.register(id, file))
    }

    pub fn open(&self, id: FileId, write: bool) -> FsResult<FileHandle> {
        let file = OpenOptions::new()
            .read(true)
            .write(write)
            .open(self.path_of(id))?;
        Ok(self.register(id, file))
    }

    pub fn read(&self, handle: FileHandle, offset: u64, size: u64) -> FsResult<Vec<u8>> {
        let table = self.open.lock();
        let open = table
            .handles
            .get(&handle)
            .ok_or_else(|| stale_handle(handle))?;
        let len = open.file.metadata()?.len();
        let size = min(size, len.saturating_sub(offset));
        let mut buf = vec![0; size as usize];
        open.file.read_exact_at(&mut buf, offset)?;
        Ok(buf)
    }

    /// Returns the new end-of-file position so the caller can grow the
    /// recorded size.
    pub fn write(&self, handle: FileHandle, offset: u64, data: &[u8]) -> FsResult<u64> {
        let mut table = self.open.lock();
        let open = table
            .handles
            .get_mut(&handle)
            .ok_or_else(|| stale_handle(handle))?;
        open.file.write_all_at(data, offset)?;
        open.dirty = true;
        Ok(offset + data.len() as u64)
    }

    pub fn truncate_handle(&self, handle: FileHandle, len: u64) -> FsResult<()> {
        let mut table = self.open.lock();
        let open = table
            .handles
            .get_mut(&handle)
            .ok_or_else(|| stale_handle(handle))?;
        open.file.set_len(len)?;
        open.dirty = true;
        Ok(())
    }

    /// Truncate by id, for `setattr` calls that arrive without a handle.
    pub fn truncate(&self, id: FileId, len: u64) -> FsResult<()> {
        let file = OpenOptions::new().write(true).open(self.path_of(id))?;
        file.set_len(len)?;
        Ok(())
    }

    pub fn id_of(&self, handle: FileHandle) -> Option<FileId> {
        self.open.lock().handles.get(&handle).map(|o| o.id)
    }

    pub fn is_dirty(&self, handle: FileHandle) -> bool {
        self.open
            .lock()
            .handles
            .get(&handle)
            .map(|o| o.dirty)
            .unwrap_or(false)
    }

    /// Remove the bytes for an unlinked file, now if nothing holds it open,
    /// otherwise on its last release.
    pub fn doom(&self, id: FileId) -> FsResult<()> {
        let mut table = self.open.lock();
        if table.handles.values().any(|o| o.id == id) {
            debug!("deferring content removal of {id:?} until last release");
            table.doomed.insert(id);
            return Ok(());
        }
        fs::remove_file(self.path_of(id))?;
        Ok(())
    }

    pub fn release(&self, handle: FileHandle) -> FsResult<Released> {
        let mut table = self.open.lock();
        let Some(open) = table.handles.remove(&handle) else {
            return Ok(Released::default());
        };
        let released = Released {
            was_dirty: open.dirty,
        };
        let id = open.id;
        drop(open);
        if table.doomed.contains(&id) && !table.handles.values().any(|o| o.id == id) {
            table.doomed.remove(&id);
            debug!("removing doomed content of {id:?}");
            fs::remove_file(self.path_of(id))?;
        }
        Ok(released)
    }
}

fn stale_handle(handle: FileHandle) -> crate::error::FsError {
    std::io::Error::new(
        std::io::ErrorKind::NotFound,
        format!("stale file handle {}", handle.0),
    )
    .into()
}

/// Rewrite a relative symlink target for the depth it is being read from.
/// Targets are stored as if the mount root were the link's parent, so a
/// read through `d` tag directories climbs back out first.
pub fn translate_link(depth: usize, target: &str) -> String {
    if target.starts_with('/') {
        return target.to_owned();
    }
    let mut out = String::with_capacity(3 * depth + target.len());
    for _ in 0..depth {
        out.push_str("../");
    }
    out.push_str(target);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_translation_follows_depth() {
        assert_eq!(translate_link(0, "target"), "target");
        assert_eq!(translate_link(1, "target"), "../target");
        assert_eq!(translate_link(2, "a/b"), "../../a/b");
        assert_eq!(translate_link(3, "/abs/path"), "/abs/path");
    }

    #[test]
    fn bytes_survive_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let content = ContentStore::open_dir(dir.path()).unwrap();
        let id = FileId(4);

        let fh = content.create(id).unwrap();
        assert_eq!(content.write(fh, 0, b"PDF").unwrap(), 3);
        assert!(content.is_dirty(fh));
        content.release(fh).unwrap();

        let fh = content.open(id, false).unwrap();
        assert_eq!(content.read(fh, 0, 1024).unwrap(), b"PDF");
        assert_eq!(content.read(fh, 1, 1).unwrap(), b"D");
        assert_eq!(content.read(fh, 10, 4).unwrap(), b"");
        content.release(fh).unwrap();
    }

    #[test]
    fn doomed_bytes_linger_until_last_release() {
        let dir = tempfile::tempdir().unwrap();
        let content = ContentStore::open_dir(dir.path()).unwrap();
        let id = FileId(9);

        let fh = content.create(id).unwrap();
        content.write(fh, 0, b"bytes").unwrap();
        content.doom(id).unwrap();
        // Still readable through the open handle.
        assert_eq!(content.read(fh, 0, 5).unwrap(), b"bytes");
        content.release(fh).unwrap();
        assert!(content.open(id, false).is_err());
    }
}
