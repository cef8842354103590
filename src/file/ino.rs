use serde::{Deserialize, Serialize};

use crate::file::{FileId, NodeId};

const SPLIT: u64 = 32;
const ROOT_INO: u64 = 1;

// inode
// 64 bit |00000000000000000000000000000000|00000000000000000000000000000000|
// upper 32 bits: file id (0 means the inode is a directory)
// lower 32 bits: directory node, i.e. the ordered tag path the entry was
// resolved under.
//
// The same file seen under different tag paths gets a distinct inode per
// path, which keeps file managers from conflating entries, and lets a file
// inode remember its resolution depth (relative symlink targets are
// rewritten per depth).

#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Ino(pub u64);

impl Ino {
    pub const ROOT: Ino = Ino(ROOT_INO);

    pub fn is_dir(&self) -> bool {
        self.0 >> SPLIT == 0
    }

    pub fn is_file(&self) -> bool {
        !self.is_dir()
    }

    pub fn file(&self) -> FileId {
        FileId(self.0 >> SPLIT)
    }

    pub fn node(&self) -> NodeId {
        NodeId(self.0 & (!0 >> SPLIT))
    }

    pub fn for_dir(node: NodeId) -> Ino {
        Ino(node.0)
    }

    pub fn for_file(file: FileId, node: NodeId) -> Ino {
        Ino((file.0 << SPLIT) | node.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_is_a_dir() {
        assert!(Ino::ROOT.is_dir());
        assert_eq!(Ino::ROOT.node(), NodeId(1));
    }

    #[test]
    fn file_ino_round_trips() {
        let ino = Ino::for_file(FileId(7), NodeId(42));
        assert!(ino.is_file());
        assert_eq!(ino.file(), FileId(7));
        assert_eq!(ino.node(), NodeId(42));
    }

    #[test]
    fn dir_ino_keeps_node() {
        let ino = Ino::for_dir(NodeId(9));
        assert!(ino.is_dir());
        assert_eq!(ino.node(), NodeId(9));
    }
}
