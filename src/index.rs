use indexmap::{IndexMap, IndexSet};

use crate::file::FileId;
use crate::store::FileEntry;

/// In-memory inverted view of the store: tag → ids of the files bearing
/// it. Derived state only; rebuilt at mount and patched in lockstep with
/// every committed mutation. A tag with no files has no entry here, so
/// membership doubles as "does this tag exist".
#[derive(Debug, Default)]
pub struct TagIndex {
    by_tag: IndexMap<String, IndexSet<FileId>>,
}

impl TagIndex {
    pub fn rebuild<'a>(files: impl IntoIterator<Item = (&'a FileId, &'a FileEntry)>) -> Self {
        let mut index = TagIndex::default();
        for (id, entry) in files {
            index.file_added(*id, &entry.tags);
        }
        index
    }

    pub fn contains_tag(&self, tag: &str) -> bool {
        self.by_tag.contains_key(tag)
    }

    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.by_tag.keys().map(String::as_str)
    }

    pub fn files_with(&self, tag: &str) -> Option<&IndexSet<FileId>> {
        self.by_tag.get(tag)
    }

    pub fn file_added(&mut self, id: FileId, tags: &IndexSet<String>) {
        for tag in tags {
            self.by_tag.entry(tag.clone()).or_default().insert(id);
        }
    }

    pub fn file_removed(&mut self, id: FileId, tags: &IndexSet<String>) {
        for tag in tags {
            if let Some(set) = self.by_tag.get_mut(tag) {
                set.shift_remove(&id);
                if set.is_empty() {
                    self.by_tag.shift_remove(tag);
                }
            }
        }
    }

    pub fn file_retagged(&mut self, id: FileId, old: &IndexSet<String>, new: &IndexSet<String>) {
        self.file_removed(id, old);
        self.file_added(id, new);
    }

    pub fn tag_renamed(&mut self, old: &str, new: &str) {
        if let Some(set) = self.by_tag.shift_remove(old) {
            self.by_tag.insert(new.to_owned(), set);
        }
    }
}
