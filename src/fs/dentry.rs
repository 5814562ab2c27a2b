use super::inode::Inode;
use alloc::string::String;

/// A directory entry: a name bound to an inode.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub inode: Inode,
}
