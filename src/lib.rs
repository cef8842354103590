//! A mounted filesystem whose directories are projections of a flat tag
//! store. Files carry tags; a path is an ordered list of tags; a directory
//! listing is the set of files matching that tag intersection plus the tags
//! that could still refine it.

pub mod cli;
pub mod error;
pub mod file;
pub mod fs;
pub mod index;
pub mod path;
pub mod plan;
pub mod project;
pub mod query;
pub mod store;
