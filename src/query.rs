use indexmap::IndexSet;

use crate::file::FileId;
use crate::index::TagIndex;
use crate::store::Tables;

/// Read-only view answering tag-set queries against one consistent
/// (tables, index) pair. Never blocks, never mutates.
#[derive(Copy, Clone)]
pub struct Query<'a> {
    pub tables: &'a Tables,
    pub index: &'a TagIndex,
}

impl<'a> Query<'a> {
    pub fn new(tables: &'a Tables, index: &'a TagIndex) -> Self {
        Self { tables, index }
    }

    /// Files carrying every tag in `tags`. The empty query matches the
    /// whole store. Order of `tags` is irrelevant here; it only matters to
    /// symlink translation and unlink, which work on the ordered path.
    pub fn matching_files(&self, tags: &[String]) -> IndexSet<FileId> {
        if tags.is_empty() {
            return self.tables.files.keys().copied().collect();
        }
        let mut sets = Vec::with_capacity(tags.len());
        for tag in tags {
            match self.index.files_with(tag) {
                Some(set) => sets.push(set),
                None => return IndexSet::new(),
            }
        }
        // Intersect starting from the rarest tag.
        sets.sort_by_key(|set| set.len());
        let (first, rest) = sets.split_first().expect("tags is non-empty");
        first
            .iter()
            .copied()
            .filter(|id| rest.iter().all(|set| set.contains(id)))
            .collect()
    }

    pub fn file_matches(&self, id: FileId, tags: &[String]) -> bool {
        self.tables
            .entry(id)
            .map(|entry| tags.iter().all(|t| entry.tags.contains(t)))
            .unwrap_or(false)
    }

    /// Would appending `extra` to `tags` still leave at least one file?
    pub fn refines(&self, tags: &[String], extra: &str) -> bool {
        self.index
            .files_with(extra)
            .map(|set| set.iter().any(|id| self.file_matches(*id, tags)))
            .unwrap_or(false)
    }

    /// A tag exists iff some file bears it.
    pub fn is_known_tag(&self, tag: &str) -> bool {
        self.index.contains_tag(tag)
    }

    pub fn is_marker(&self, tag: &str) -> bool {
        self.tables.empty_tags.contains(tag)
    }

    /// Does `tag` name a directory directly under the prefix `T`? Known
    /// tags resolve at any depth (even when the intersection is empty);
    /// markers only at the mount root; a tag never repeats on its path.
    pub fn tag_resolves(&self, prefix: &[String], tag: &str) -> bool {
        if prefix.iter().any(|t| t == tag) {
            return false;
        }
        self.is_known_tag(tag) || (prefix.is_empty() && self.is_marker(tag))
    }

    /// Every component resolves under the components before it.
    pub fn path_resolves(&self, tags: &[String]) -> bool {
        tags.iter()
            .enumerate()
            .all(|(i, t)| self.tag_resolves(&tags[..i], t))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FileEntry;
    use std::time::SystemTime;

    fn fixture() -> (Tables, TagIndex) {
        let mut tables = Tables::new();
        for (name, tags) in [
            ("ticket.pdf", &["peru2018", "paperwork"][..]),
            ("visa.pdf", &["paperwork"][..]),
            ("untagged.txt", &[][..]),
        ] {
            tables.insert_file(FileEntry::regular(
                name.to_owned(),
                tags.iter().map(|t| t.to_string()).collect(),
                0o644,
                0,
                0,
                SystemTime::UNIX_EPOCH,
            ));
        }
        tables.empty_tags.insert("drafts".to_owned());
        let index = TagIndex::rebuild(tables.files.iter());
        (tables, index)
    }

    fn tags(list: &[&str]) -> Vec<String> {
        list.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn empty_query_matches_everything() {
        let (tables, index) = fixture();
        let q = Query::new(&tables, &index);
        assert_eq!(q.matching_files(&[]).len(), 3);
    }

    #[test]
    fn intersection_ignores_order() {
        let (tables, index) = fixture();
        let q = Query::new(&tables, &index);
        let ab = q.matching_files(&tags(&["peru2018", "paperwork"]));
        let ba = q.matching_files(&tags(&["paperwork", "peru2018"]));
        assert_eq!(ab, ba);
        assert_eq!(ab.len(), 1);
    }

    #[test]
    fn unknown_tag_matches_nothing() {
        let (tables, index) = fixture();
        let q = Query::new(&tables, &index);
        assert!(q.matching_files(&tags(&["paperwork", "nope"])).is_empty());
    }

    #[test]
    fn refinement_probes_the_intersection() {
        let (tables, index) = fixture();
        let q = Query::new(&tables, &index);
        assert!(q.refines(&tags(&["paperwork"]), "peru2018"));
        assert!(!q.refines(&tags(&["peru2018"]), "drafts"));
    }

    #[test]
    fn markers_resolve_only_at_root() {
        let (tables, index) = fixture();
        let q = Query::new(&tables, &index);
        assert!(q.tag_resolves(&[], "drafts"));
        assert!(!q.tag_resolves(&tags(&["paperwork"]), "drafts"));
        assert!(q.tag_resolves(&tags(&["paperwork"]), "peru2018"));
        assert!(!q.tag_resolves(&tags(&["peru2018"]), "peru2018"));
        assert!(q.path_resolves(&tags(&["drafts", "paperwork"])));
        assert!(!q.path_resolves(&tags(&["paperwork", "drafts"])));
    }
}
