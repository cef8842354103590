use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use bimap::BiMap;
use bincode::serde::Compat;
use indexmap::{IndexMap, IndexSet};
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::error::FsResult;
use crate::file::FileId;

pub mod content;

pub use content::{translate_link, ContentStore, Released};

const SNAPSHOT: &str = "meta.bin";
const SNAPSHOT_TMP: &str = "meta.bin.tmp";

/// Everything the mount knows about one file. `tags` keeps user insertion
/// order; matching treats it as a set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    pub tags: IndexSet<String>,
    pub size: u64,
    pub mode: u16,
    pub uid: u32,
    pub gid: u32,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    /// `Some` marks a symlink; the target is stored raw, exactly as given
    /// at creation, and only rewritten at read time.
    pub symlink_target: Option<String>,
}

impl FileEntry {
    pub fn regular(
        name: String,
        tags: IndexSet<String>,
        mode: u16,
        uid: u32,
        gid: u32,
        now: SystemTime,
    ) -> Self {
        Self {
            name,
            tags,
            size: 0,
            mode,
            uid,
            gid,
            atime: now,
            mtime: now,
            ctime: now,
            symlink_target: None,
        }
    }

    pub fn symlink(
        name: String,
        tags: IndexSet<String>,
        target: String,
        uid: u32,
        gid: u32,
        now: SystemTime,
    ) -> Self {
        Self {
            size: target.len() as u64,
            symlink_target: Some(target),
            ..Self::regular(name, tags, 0o777, uid, gid, now)
        }
    }

    pub fn is_symlink(&self) -> bool {
        self.symlink_target.is_some()
    }
}

/// The persistent tables: `files` keyed by id, the unique-name table, and
/// the empty-tag markers. Serialized whole as one snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tables {
    #[serde(with = "indexmap::serde_seq")]
    pub files: IndexMap<FileId, FileEntry>,
    pub names: BiMap<FileId, String>,
    pub empty_tags: IndexSet<String>,
    next_id: u64,
}

impl Tables {
    pub fn new() -> Self {
        Self {
            files: IndexMap::new(),
            names: BiMap::new(),
            empty_tags: IndexSet::new(),
            next_id: 1,
        }
    }

    pub fn entry(&self, id: FileId) -> Option<&FileEntry> {
        self.files.get(&id)
    }

    pub fn entry_mut(&mut self, id: FileId) -> Option<&mut FileEntry> {
        self.files.get_mut(&id)
    }

    pub fn id_by_name(&self, name: &str) -> Option<FileId> {
        self.names.get_by_right(name).copied()
    }

    pub fn file_count(&self) -> u64 {
        self.files.len() as u64
    }

    /// Insert a new entry under a fresh id. The caller has already checked
    /// the name is free; the name table keeps that invariant structurally.
    pub fn insert_file(&mut self, entry: FileEntry) -> FileId {
        self.next_id += 1;
        let id = FileId(self.next_id);
        self.names.insert(id, entry.name.clone());
        self.mark_tags_borne(&entry.tags);
        self.files.insert(id, entry);
        id
    }

    pub fn remove_file(&mut self, id: FileId) -> Option<FileEntry> {
        self.names.remove_by_left(&id);
        self.files.shift_remove(&id)
    }

    pub fn rename_file(&mut self, id: FileId, new_name: &str) {
        if let Some(entry) = self.files.get_mut(&id) {
            entry.name = new_name.to_owned();
            self.names.insert(id, new_name.to_owned());
        }
    }

    pub fn set_tags(&mut self, id: FileId, tags: IndexSet<String>) {
        self.mark_tags_borne(&tags);
        if let Some(entry) = self.files.get_mut(&id) {
            entry.tags = tags;
        }
    }

    /// A tag actually borne by a file is no longer an empty-tag marker.
    fn mark_tags_borne(&mut self, tags: &IndexSet<String>) {
        for tag in tags {
            self.empty_tags.shift_remove(tag);
        }
    }
}

impl Default for Tables {
    fn default() -> Self {
        Self::new()
    }
}

/// Staged copy of the tables. The planner mutates this; nothing is visible
/// until [Store::commit] has the snapshot safely on disk.
#[derive(Debug)]
pub struct Txn {
    pub tables: Tables,
}

/// Owner of all persistent state: the metadata tables, their on-disk
/// snapshot, and the side content directory.
#[derive(Debug)]
pub struct Store {
    tables: Tables,
    snapshot_path: PathBuf,
    tmp_path: PathBuf,
    content: ContentStore,
}

impl Store {
    /// Load the datastore, recovering the last snapshot if one exists.
    pub fn open(datastore: &Path) -> FsResult<Store> {
        let content = ContentStore::open_dir(datastore)?;
        let snapshot_path = datastore.join(SNAPSHOT);
        let tmp_path = datastore.join(SNAPSHOT_TMP);
        let tables = match fs::read(&snapshot_path) {
            Ok(bytes) => {
                let (Compat(tables), _): (Compat<Tables>, usize) =
                    bincode::decode_from_slice(&bytes, bincode::config::standard())?;
                info!(
                    "recovered {} files, {} empty tags from snapshot",
                    tables.files.len(),
                    tables.empty_tags.len()
                );
                tables
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("no snapshot at {}, starting empty", snapshot_path.display());
                Tables::new()
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Store {
            tables,
            snapshot_path,
            tmp_path,
            content,
        })
    }

    pub fn tables(&self) -> &Tables {
        &self.tables
    }

    pub fn content(&self) -> &ContentStore {
        &self.content
    }

    pub fn begin(&self) -> Txn {
        Txn {
            tables: self.tables.clone(),
        }
    }

    /// The linearization point: the staged tables hit disk first, and only
    /// then replace the in-memory state. A failed write changes nothing.
    pub fn commit(&mut self, txn: Txn) -> FsResult<()> {
        self.write_snapshot(&txn.tables)?;
        self.tables = txn.tables;
        debug!("committed snapshot, {} files", self.tables.files.len());
        Ok(())
    }

    /// Re-snapshot the current tables; used to flush metadata-only updates
    /// (sizes, times) accumulated outside a transaction.
    pub fn persist(&self) -> FsResult<()> {
        self.write_snapshot(&self.tables)
    }

    pub fn entry_mut(&mut self, id: FileId) -> Option<&mut FileEntry> {
        self.tables.entry_mut(id)
    }

    fn write_snapshot(&self, tables: &Tables) -> FsResult<()> {
        let bytes = bincode::encode_to_vec(Compat(tables), bincode::config::standard())?;
        fs::write(&self.tmp_path, &bytes)?;
        fs::rename(&self.tmp_path, &self.snapshot_path)?;
        Ok(())
    }
}
