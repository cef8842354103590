use serde::{Deserialize, Serialize};

pub mod ino;

/// Stable identity of a file, handed out monotonically by the store.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize, Debug)]
pub struct FileId(pub u64);

/// Identity of an interned directory node (an ordered tag path).
#[derive(Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize, Debug)]
pub struct NodeId(pub u64);

/// Open-file handle as seen by the kernel.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize, Debug)]
pub struct FileHandle(pub u64);
