use super::dentry::DirEntry;
use super::error::FsResult;
use super::inode::Inode;
use alloc::vec::Vec;

/// The narrow interface the core sees of any disk filesystem. All paths
/// are relative to the mount point. The process core only ever calls
/// `lookup` (stat), `read`, `write` and `unlink`; it never parses
/// on-disk structures itself.
pub trait FileSystem: Send + Sync {
    /// Name of this filesystem (e.g. "ramfs", "fat32").
    fn name(&self) -> &str;

    /// Create a new regular file at `path`.
    fn create(&self, path: &str) -> FsResult<Inode>;

    /// Create a new directory at `path`.
    fn mkdir(&self, path: &str) -> FsResult<Inode>;

    /// Look up an inode by path.
    fn lookup(&self, path: &str) -> FsResult<Inode>;

    /// Read up to `buf.len()` bytes from file at `path`, starting at
    /// `offset`. Returns number of bytes read.
    fn read(&self, path: &str, offset: usize, buf: &mut [u8]) -> FsResult<usize>;

    /// Write `data` to file at `path`, starting at `offset`, extending
    /// the file if needed. Returns number of bytes written.
    fn write(&self, path: &str, offset: usize, data: &[u8]) -> FsResult<usize>;

    /// List entries in directory at `path`.
    fn readdir(&self, path: &str) -> FsResult<Vec<DirEntry>>;

    /// Remove a file or empty directory at `path`.
    fn unlink(&self, path: &str) -> FsResult<()>;
}
