//! Turns mutation callbacks into staged edits of a store transaction.
//! Every function validates before it touches the staged tables, so a
//! returned error leaves them exactly as handed in. The caller commits
//! the transaction and patches the tag index from the returned outcome.
//!
//! Destination tag paths are *applied*, never resolved: dragging a file
//! into a directory chain the session has seen (or just mkdir'd) tags the
//! file with every component, bringing unborn tags to life. Resolution is
//! the read side's problem.

use std::time::SystemTime;

use indexmap::IndexSet;

use crate::error::{FsError, FsResult};
use crate::file::FileId;
use crate::index::TagIndex;
use crate::path::{self, DELETE_SENTINEL};
use crate::query::Query;
use crate::store::{FileEntry, Txn};

#[derive(Debug, PartialEq, Eq)]
pub enum MkdirOutcome {
    /// A marker was persisted at the root.
    MarkerCreated,
    /// The tag already exists; nothing to do.
    AlreadyTag,
    /// mkdir inside a tag path: reported as success, persists nothing.
    Ignored,
}

#[derive(Debug, PartialEq, Eq)]
pub enum UnlinkOutcome {
    /// Root unlink: the file is gone.
    Deleted {
        id: FileId,
        tags: IndexSet<String>,
        had_content: bool,
    },
    /// Tag-path unlink: only the last path tag was shed.
    Untagged {
        id: FileId,
        old_tags: IndexSet<String>,
        new_tags: IndexSet<String>,
    },
}

#[derive(Debug, PartialEq, Eq)]
pub enum RmdirOutcome {
    MarkerRemoved,
    /// The synthetic directory evaporates on its own; nothing persisted.
    Vacuous,
}

#[derive(Debug, PartialEq, Eq)]
pub enum RenameOutcome {
    FileChanged {
        id: FileId,
        old_tags: IndexSet<String>,
        new_tags: IndexSet<String>,
    },
    TagRenamed {
        old: String,
        new: String,
    },
    MarkerDeleted(String),
    /// Tag moved into a tag path: accepted, meaningless, dropped.
    Ignored,
}

/// A destination leaf is taken if a file already owns the name, or if a
/// tag of that name is listed at the destination depth (any tag or marker
/// at the root, a refining tag deeper down).
fn ensure_leaf_free(
    q: &Query,
    tags: &[String],
    name: &str,
    excluding: Option<FileId>,
) -> FsResult<()> {
    if let Some(id) = q.tables.id_by_name(name) {
        if excluding != Some(id) {
            return Err(FsError::Exists(name.to_owned()));
        }
    }
    let tag_listed = if tags.is_empty() {
        q.is_known_tag(name) || q.is_marker(name)
    } else {
        q.refines(tags, name)
    };
    if tag_listed {
        return Err(FsError::Exists(name.to_owned()));
    }
    Ok(())
}

/// `create` / `symlink`: a new file born with the path's tags.
#[allow(clippy::too_many_arguments)]
pub fn create_file(
    txn: &mut Txn,
    index: &TagIndex,
    tags: &[String],
    name: &str,
    mode: u16,
    uid: u32,
    gid: u32,
    now: SystemTime,
    symlink_target: Option<String>,
) -> FsResult<FileId> {
    path::validate(name)?;
    ensure_leaf_free(&Query::new(&txn.tables, index), tags, name, None)?;
    let tagset: IndexSet<String> = tags.iter().cloned().collect();
    let entry = match symlink_target {
        Some(target) => FileEntry::symlink(name.to_owned(), tagset, target, uid, gid, now),
        None => FileEntry::regular(name.to_owned(), tagset, mode, uid, gid, now),
    };
    Ok(txn.tables.insert_file(entry))
}

/// `mkdir`: a marker at the root, a shrug anywhere deeper.
pub fn make_tag(
    txn: &mut Txn,
    index: &TagIndex,
    tags: &[String],
    name: &str,
) -> FsResult<MkdirOutcome> {
    path::validate(name)?;
    let q = Query::new(&txn.tables, index);
    if !tags.is_empty() {
        return Ok(if q.is_known_tag(name) {
            MkdirOutcome::AlreadyTag
        } else {
            MkdirOutcome::Ignored
        });
    }
    if q.tables.id_by_name(name).is_some() || q.is_known_tag(name) || q.is_marker(name) {
        return Err(FsError::Exists(name.to_owned()));
    }
    txn.tables.empty_tags.insert(name.to_owned());
    Ok(MkdirOutcome::MarkerCreated)
}

/// `unlink`: at the root the file dies; inside a tag path only the last
/// tag of the path (as the user wrote it) is shed.
pub fn unlink(
    txn: &mut Txn,
    index: &TagIndex,
    tags: &[String],
    name: &str,
) -> FsResult<UnlinkOutcome> {
    let id = {
        let q = Query::new(&txn.tables, index);
        let Some(id) = q.tables.id_by_name(name) else {
            if q.tag_resolves(tags, name) {
                return Err(FsError::IsDirectory(name.to_owned()));
            }
            return Err(FsError::NotFound(name.to_owned()));
        };
        if !q.file_matches(id, tags) {
            return Err(FsError::NotFound(name.to_owned()));
        }
        id
    };
    if tags.is_empty() {
        let entry = txn.tables.remove_file(id).expect("resolved above");
        return Ok(UnlinkOutcome::Deleted {
            id,
            had_content: !entry.is_symlink(),
            tags: entry.tags,
        });
    }
    let last = tags.last().expect("tags is non-empty");
    let old_tags = txn.tables.entry(id).expect("resolved above").tags.clone();
    let mut new_tags = old_tags.clone();
    new_tags.shift_remove(last);
    txn.tables.set_tags(id, new_tags.clone());
    Ok(UnlinkOutcome::Untagged {
        id,
        old_tags,
        new_tags,
    })
}

/// `rmdir`: refuses while files still match; removes root markers;
/// otherwise succeeds vacuously (the projection vanishes by itself).
pub fn remove_tag_dir(
    txn: &mut Txn,
    index: &TagIndex,
    tags: &[String],
    name: &str,
) -> FsResult<RmdirOutcome> {
    let q = Query::new(&txn.tables, index);
    if let Some(id) = q.tables.id_by_name(name) {
        // A file shadows any tag of the same name at this depth.
        if q.file_matches(id, tags) && !q.tag_resolves(tags, name) {
            return Err(FsError::NotDirectory);
        }
    }
    if q.refines(tags, name) {
        return Err(FsError::NotEmpty(name.to_owned()));
    }
    if tags.is_empty() && q.is_marker(name) {
        txn.tables.empty_tags.shift_remove(name);
        return Ok(RmdirOutcome::MarkerRemoved);
    }
    Ok(RmdirOutcome::Vacuous)
}

/// `rename`, the overloaded one. In order of precedence:
///
/// 1. destination leaf `..deleteme` deletes an empty source tag;
/// 2. a file source is retagged — additively when the user grabbed a
///    hidden (dotted) entry, replacing otherwise — and possibly renamed;
/// 3. a tag source is renamed in place (same parent path), or silently
///    ignored when dragged into another tag path.
pub fn rename(
    txn: &mut Txn,
    index: &TagIndex,
    src_tags: &[String],
    src_name: &str,
    dst_tags: &[String],
    dst_name: &str,
    now: SystemTime,
) -> FsResult<RenameOutcome> {
    let q = Query::new(&txn.tables, index);
    let src_bare = path::strip_hidden(src_name);

    if dst_name == DELETE_SENTINEL {
        if src_tags.is_empty() && q.is_marker(src_bare) {
            let tag = src_bare.to_owned();
            txn.tables.empty_tags.shift_remove(&tag);
            return Ok(RenameOutcome::MarkerDeleted(tag));
        }
        if q.is_known_tag(src_bare) {
            return Err(FsError::NotEmpty(src_bare.to_owned()));
        }
        if q.tables.id_by_name(src_bare).is_some() {
            return Err(FsError::Invalid("the delete sentinel only applies to tags"));
        }
        return Err(FsError::NotFound(src_bare.to_owned()));
    }

    let dst_bare = path::strip_hidden(dst_name);

    // A file source wins over a tag of the same name, like in listings.
    if let Some(id) = q.tables.id_by_name(src_bare) {
        if q.file_matches(id, src_tags) {
            path::validate(dst_bare)?;
            ensure_leaf_free(&q, dst_tags, dst_bare, Some(id))?;
            let old_tags = q.tables.entry(id).expect("resolved above").tags.clone();
            let src_exact = old_tags.len() == src_tags.len()
                && src_tags.iter().all(|t| old_tags.contains(t));
            // Grabbing a hidden entry adds tags; grabbing a visible one
            // moves the file wholesale.
            let new_tags: IndexSet<String> = if src_exact {
                dst_tags.iter().cloned().collect()
            } else {
                old_tags
                    .iter()
                    .cloned()
                    .chain(dst_tags.iter().cloned())
                    .collect()
            };
            txn.tables.set_tags(id, new_tags.clone());
            if dst_bare != src_bare {
                txn.tables.rename_file(id, dst_bare);
            }
            if let Some(entry) = txn.tables.entry_mut(id) {
                entry.ctime = now;
            }
            return Ok(RenameOutcome::FileChanged {
                id,
                old_tags,
                new_tags,
            });
        }
    }

    if q.tag_resolves(src_tags, src_bare) {
        if src_tags != dst_tags {
            return Ok(RenameOutcome::Ignored);
        }
        path::validate(dst_bare)?;
        if q.is_known_tag(dst_bare)
            || q.is_marker(dst_bare)
            || q.tables.id_by_name(dst_bare).is_some()
        {
            return Err(FsError::Exists(dst_bare.to_owned()));
        }
        let bearers: Vec<FileId> = index
            .files_with(src_bare)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        for id in bearers {
            if let Some(entry) = txn.tables.entry_mut(id) {
                entry.tags = entry
                    .tags
                    .iter()
                    .map(|t| {
                        if t == src_bare {
                            dst_bare.to_owned()
                        } else {
                            t.clone()
                        }
                    })
                    .collect();
            }
        }
        if txn.tables.empty_tags.shift_remove(src_bare) {
            txn.tables.empty_tags.insert(dst_bare.to_owned());
        }
        return Ok(RenameOutcome::TagRenamed {
            old: src_bare.to_owned(),
            new: dst_bare.to_owned(),
        });
    }

    Err(FsError::NotFound(src_bare.to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Tables;

    const NOW: SystemTime = SystemTime::UNIX_EPOCH;

    struct Fixture {
        txn: Txn,
        index: TagIndex,
    }

    impl Fixture {
        fn empty() -> Self {
            Fixture {
                txn: Txn {
                    tables: Tables::new(),
                },
                index: TagIndex::default(),
            }
        }

        /// Mirror what the dispatcher does after a commit.
        fn reindex(&mut self) {
            self.index = TagIndex::rebuild(self.txn.tables.files.iter());
        }

        fn create(&mut self, tags: &[&str], name: &str) -> FileId {
            let tags = owned(tags);
            let id = create_file(&mut self.txn, &self.index, &tags, name, 0o644, 0, 0, NOW, None)
                .unwrap();
            self.reindex();
            id
        }

        fn rename(
            &mut self,
            src_tags: &[&str],
            src: &str,
            dst_tags: &[&str],
            dst: &str,
        ) -> FsResult<RenameOutcome> {
            let out = rename(
                &mut self.txn,
                &self.index,
                &owned(src_tags),
                src,
                &owned(dst_tags),
                dst,
                NOW,
            );
            if out.is_ok() {
                self.reindex();
            }
            out
        }

        fn tags_of(&self, id: FileId) -> Vec<String> {
            self.txn
                .tables
                .entry(id)
                .unwrap()
                .tags
                .iter()
                .cloned()
                .collect()
        }
    }

    fn owned(tags: &[&str]) -> Vec<String> {
        tags.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn create_rejects_collisions() {
        let mut fx = Fixture::empty();
        fx.create(&[], "x");
        let err = create_file(&mut fx.txn, &fx.index, &[], "x", 0o644, 0, 0, NOW, None);
        assert!(matches!(err, Err(FsError::Exists(_))));

        make_tag(&mut fx.txn, &fx.index, &[], "docs").unwrap();
        let err = create_file(&mut fx.txn, &fx.index, &[], "docs", 0o644, 0, 0, NOW, None);
        assert!(matches!(err, Err(FsError::Exists(_))));
    }

    #[test]
    fn create_rejects_dotted_names() {
        let mut fx = Fixture::empty();
        let err = create_file(&mut fx.txn, &fx.index, &[], ".hidden", 0o644, 0, 0, NOW, None);
        assert!(matches!(err, Err(FsError::BadName(_))));
    }

    #[test]
    fn create_in_marker_dir_converts_it() {
        let mut fx = Fixture::empty();
        make_tag(&mut fx.txn, &fx.index, &[], "docs").unwrap();
        assert!(fx.txn.tables.empty_tags.contains("docs"));
        fx.create(&["docs"], "f.txt");
        assert!(!fx.txn.tables.empty_tags.contains("docs"));
    }

    #[test]
    fn mkdir_deeper_is_polite_noise() {
        let mut fx = Fixture::empty();
        fx.create(&["a"], "f");
        assert_eq!(
            make_tag(&mut fx.txn, &fx.index, &owned(&["a"]), "b").unwrap(),
            MkdirOutcome::Ignored
        );
        assert!(!fx.txn.tables.empty_tags.contains("b"));
        assert_eq!(
            make_tag(&mut fx.txn, &fx.index, &owned(&["b"]), "a").unwrap(),
            MkdirOutcome::AlreadyTag
        );
    }

    #[test]
    fn unlink_in_tag_path_sheds_only_last_tag() {
        let mut fx = Fixture::empty();
        let id = fx.create(&["a", "b"], "x");
        let out = unlink(&mut fx.txn, &fx.index, &owned(&["b", "a"]), "x").unwrap();
        match out {
            UnlinkOutcome::Untagged { new_tags, .. } => {
                assert!(new_tags.contains("b"));
                assert!(!new_tags.contains("a"), "last path component shed");
            }
            other => panic!("expected Untagged, got {other:?}"),
        }
        assert_eq!(fx.tags_of(id), vec!["b".to_owned()]);
    }

    #[test]
    fn unlink_at_root_deletes() {
        let mut fx = Fixture::empty();
        let id = fx.create(&[], "x");
        let out = unlink(&mut fx.txn, &fx.index, &[], "x").unwrap();
        assert!(matches!(out, UnlinkOutcome::Deleted { id: did, .. } if did == id));
        assert!(fx.txn.tables.entry(id).is_none());
        assert!(fx.txn.tables.id_by_name("x").is_none());
    }

    #[test]
    fn unlink_of_a_tag_is_a_directory_error() {
        let mut fx = Fixture::empty();
        fx.create(&["a"], "x");
        let err = unlink(&mut fx.txn, &fx.index, &[], "a");
        assert!(matches!(err, Err(FsError::IsDirectory(_))));
    }

    #[test]
    fn rmdir_refuses_populated_tags() {
        let mut fx = Fixture::empty();
        fx.create(&["a"], "x");
        let err = remove_tag_dir(&mut fx.txn, &fx.index, &[], "a");
        assert!(matches!(err, Err(FsError::NotEmpty(_))));
    }

    #[test]
    fn rmdir_removes_markers() {
        let mut fx = Fixture::empty();
        make_tag(&mut fx.txn, &fx.index, &[], "docs").unwrap();
        assert_eq!(
            remove_tag_dir(&mut fx.txn, &fx.index, &[], "docs").unwrap(),
            RmdirOutcome::MarkerRemoved
        );
        assert!(fx.txn.tables.empty_tags.is_empty());
    }

    #[test]
    fn rmdir_elsewhere_empty_is_vacuous() {
        let mut fx = Fixture::empty();
        fx.create(&["a"], "x");
        fx.create(&["b"], "y");
        // `b` exists but nothing matches {a, b}.
        assert_eq!(
            remove_tag_dir(&mut fx.txn, &fx.index, &owned(&["a"]), "b").unwrap(),
            RmdirOutcome::Vacuous
        );
        assert!(fx.index.contains_tag("b"));
    }

    #[test]
    fn hidden_source_rename_is_additive() {
        let mut fx = Fixture::empty();
        // Seen at /peru2018 as .ticket.pdf (paperwork unaccounted for).
        let id = fx.create(&["peru2018", "paperwork"], "ticket.pdf");
        let out = fx
            .rename(
                &["peru2018"],
                ".ticket.pdf",
                &["peru2018", "portraits"],
                "ticket.pdf",
            )
            .unwrap();
        assert!(matches!(out, RenameOutcome::FileChanged { .. }));
        assert_eq!(
            fx.tags_of(id),
            owned(&["peru2018", "paperwork", "portraits"])
        );
    }

    #[test]
    fn visible_source_rename_replaces() {
        let mut fx = Fixture::empty();
        let id = fx.create(&["peru2018", "paperwork"], "ticket.pdf");
        fx.rename(
            &["peru2018", "paperwork"],
            "ticket.pdf",
            &["archive"],
            "ticket.pdf",
        )
        .unwrap();
        assert_eq!(fx.tags_of(id), owned(&["archive"]));
    }

    #[test]
    fn root_rename_untags_entirely() {
        let mut fx = Fixture::empty();
        let id = fx.create(&["a"], "x");
        // Visible at /a, dragged to the root: tags replaced by ∅.
        fx.rename(&["a"], "x", &[], "x").unwrap();
        assert!(fx.tags_of(id).is_empty());
    }

    #[test]
    fn rename_can_change_the_name_too() {
        let mut fx = Fixture::empty();
        let id = fx.create(&["a"], "draft.txt");
        fx.rename(&["a"], "draft.txt", &["a"], "final.txt").unwrap();
        assert_eq!(fx.txn.tables.entry(id).unwrap().name, "final.txt");
        assert_eq!(fx.txn.tables.id_by_name("final.txt"), Some(id));
        assert_eq!(fx.txn.tables.id_by_name("draft.txt"), None);
    }

    #[test]
    fn tag_rename_rewrites_every_bearer() {
        let mut fx = Fixture::empty();
        let a = fx.create(&["trip"], "a");
        let b = fx.create(&["trip", "misc"], "b");
        let out = fx.rename(&[], "trip", &[], "peru2018").unwrap();
        assert!(matches!(out, RenameOutcome::TagRenamed { .. }));
        assert_eq!(fx.tags_of(a), owned(&["peru2018"]));
        assert_eq!(fx.tags_of(b), owned(&["peru2018", "misc"]));
    }

    #[test]
    fn tag_move_into_tag_path_is_ignored() {
        let mut fx = Fixture::empty();
        fx.create(&["a"], "x");
        fx.create(&["b"], "y");
        let out = fx.rename(&[], "a", &["b"], "a").unwrap();
        assert_eq!(out, RenameOutcome::Ignored);
        assert!(fx.index.contains_tag("a"));
    }

    #[test]
    fn sentinel_deletes_marker_not_borne_tag() {
        let mut fx = Fixture::empty();
        make_tag(&mut fx.txn, &fx.index, &[], "empty").unwrap();
        let out = fx.rename(&[], "empty", &[], DELETE_SENTINEL).unwrap();
        assert_eq!(out, RenameOutcome::MarkerDeleted("empty".to_owned()));
        assert!(fx.txn.tables.empty_tags.is_empty());

        fx.create(&["busy"], "x");
        let err = fx.rename(&[], "busy", &[], DELETE_SENTINEL);
        assert!(matches!(err, Err(FsError::NotEmpty(_))));
    }

    #[test]
    fn rename_collision_with_visible_tag_fails() {
        let mut fx = Fixture::empty();
        fx.create(&["shared"], "x");
        fx.create(&[], "y");
        // "shared" is listed at the root, so a file may not take its name.
        let err = fx.rename(&[], "y", &[], "shared");
        assert!(matches!(err, Err(FsError::Exists(_))));
    }

    #[test]
    fn rename_round_trip_restores_state() {
        let mut fx = Fixture::empty();
        let id = fx.create(&["a", "b"], "x");
        let before = fx.tags_of(id);
        fx.rename(&["a", "b"], "x", &["a"], "x").unwrap();
        assert_eq!(fx.tags_of(id), owned(&["a"]));
        // Back where it came from: the replacing retag re-applies {a, b}.
        fx.rename(&["a"], "x", &["a", "b"], "x").unwrap();
        assert_eq!(fx.tags_of(id), before);
    }
}
