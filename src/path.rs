//! Name handling. A leading `.` on a presented name is a visibility
//! artifact, never part of the stored name, so lookups strip one before
//! consulting the store. The single exception is the `..deleteme` rename
//! destination, which file managers that cannot delete synthetic
//! directories (SMB shares, mostly) use to drop an empty tag.

use std::ffi::OsStr;

use crate::error::{FsError, FsResult};

/// Rename destination that deletes an empty source tag.
pub const DELETE_SENTINEL: &str = "..deleteme";

/// A kernel-supplied name as UTF-8, or not at all. NUL cannot occur in an
/// `OsStr` coming from FUSE.
pub fn presented(raw: &OsStr) -> FsResult<&str> {
    raw.to_str()
        .ok_or_else(|| FsError::BadName(raw.to_string_lossy().into_owned()))
}

/// Strip the hidden-entry prefix: one leading `.`, sentinel excepted.
pub fn strip_hidden(name: &str) -> &str {
    if name == DELETE_SENTINEL {
        return name;
    }
    name.strip_prefix('.').unwrap_or(name)
}

/// The grammar every created or renamed-to name must satisfy: non-empty
/// UTF-8 without `/` or NUL, not `.` or `..`, no leading or trailing dot.
pub fn validate(name: &str) -> FsResult<()> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.starts_with('.')
        || name.ends_with('.')
        || name.contains('/')
        || name.contains('\0')
    {
        return Err(FsError::BadName(name.to_owned()));
    }
    Ok(())
}

/// Split an absolute path into `(prefix_tags, leaf)`. Empty segments and
/// trailing slashes are discarded; every component is de-dotted except the
/// sentinel, which survives verbatim.
pub fn parse(path: &str) -> (Vec<String>, Option<String>) {
    let mut parts: Vec<String> = path
        .split('/')
        .filter(|s| !s.is_empty())
        .map(|s| strip_hidden(s).to_owned())
        .collect();
    let leaf = parts.pop();
    (parts, leaf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_exactly_one_dot() {
        assert_eq!(strip_hidden(".ticket.pdf"), "ticket.pdf");
        assert_eq!(strip_hidden("ticket.pdf"), "ticket.pdf");
        assert_eq!(strip_hidden("..weird"), ".weird");
    }

    #[test]
    fn sentinel_survives_stripping() {
        assert_eq!(strip_hidden(DELETE_SENTINEL), DELETE_SENTINEL);
    }

    #[test]
    fn grammar_rejects_dot_edges() {
        for bad in ["", ".", "..", ".hidden", "trailing.", "a/b", "nul\0byte"] {
            assert!(validate(bad).is_err(), "{bad:?} should be illegal");
        }
        for good in ["peru2018", "ticket.pdf", "a b c", "üñïçödé"] {
            assert!(validate(good).is_ok(), "{good:?} should be legal");
        }
    }

    #[test]
    fn parse_splits_and_dedots() {
        assert_eq!(parse("/"), (vec![], None));
        assert_eq!(
            parse("/peru2018/paperwork/ticket.pdf"),
            (
                vec!["peru2018".to_owned(), "paperwork".to_owned()],
                Some("ticket.pdf".to_owned())
            )
        );
        assert_eq!(
            parse("/a/.b//c/"),
            (vec!["a".to_owned(), "b".to_owned()], Some("c".to_owned()))
        );
    }
}
