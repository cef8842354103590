use crate::file::FileId;
use crate::query::Query;

/// One entry of a projected directory listing. `name` is the stored name;
/// hidden entries are presented with a leading `.` but remain reachable
/// under either spelling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectedEntry {
    pub name: String,
    pub hidden: bool,
    pub symlink: bool,
    pub node: ProjectedNode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProjectedNode {
    File(FileId),
    Tag(String),
}

impl ProjectedEntry {
    pub fn presented(&self) -> String {
        if self.hidden {
            format!(".{}", self.name)
        } else {
            self.name.clone()
        }
    }
}

/// Project the listing for the tag path `T`. Tags come first, then files,
/// both in store order:
///
/// - a matching file is visible iff its tag set is exactly `T`, otherwise
///   it is dot-hidden (matched, but tags remain unaccounted for);
/// - a tag not on the path is visible iff it still refines the selection,
///   otherwise dot-hidden — except at the mount root, where every tag and
///   empty-tag marker is visible;
/// - on a name collision at this depth the file wins and the tag is
///   dropped from the listing.
///
/// The synthetic `.`/`..` entries are the dispatcher's business, not ours.
pub fn project(q: &Query, tags: &[String]) -> Vec<ProjectedEntry> {
    let at_root = tags.is_empty();

    let mut files = Vec::new();
    for id in q.matching_files(tags) {
        let Some(entry) = q.tables.entry(id) else {
            continue;
        };
        let exact = entry.tags.len() == tags.len()
            && tags.iter().all(|t| entry.tags.contains(t));
        files.push(ProjectedEntry {
            name: entry.name.clone(),
            hidden: !exact,
            symlink: entry.is_symlink(),
            node: ProjectedNode::File(id),
        });
    }
    let taken: Vec<String> = files.iter().map(|f| f.presented()).collect();

    let mut out = Vec::new();
    let markers = if at_root {
        Some(q.tables.empty_tags.iter())
    } else {
        None
    };
    let candidates = q
        .index
        .tags()
        .map(str::to_owned)
        .chain(markers.into_iter().flatten().cloned());
    for tag in candidates {
        if tags.iter().any(|t| *t == tag) {
            continue;
        }
        let entry = ProjectedEntry {
            hidden: !at_root && !q.refines(tags, &tag),
            symlink: false,
            node: ProjectedNode::Tag(tag.clone()),
            name: tag,
        };
        if taken.iter().any(|n| *n == entry.presented()) {
            continue;
        }
        out.push(entry);
    }
    out.extend(files);
    out
}
