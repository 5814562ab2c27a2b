use super::dentry::DirEntry;
use super::error::{FsError, FsResult};
use super::inode::FileType;
use super::pipe::Pipe;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

/// What an open file handle is attached to.
pub enum FileKind {
    Console,
    Regular,
    /// Directories carry their listing, captured at open time.
    Directory(Vec<DirEntry>),
    PipeRead(Arc<Mutex<Pipe>>),
    PipeWrite(Arc<Mutex<Pipe>>),
}

/// A reference-counted open file. Multiple descriptor slots may point
/// at the same handle (dup2, fork); the handle goes away when the last
/// Arc drops.
pub struct File {
    pub kind: FileKind,
    pub path: String,
    pub inode: u64,
    /// Size cached from open-time stat; refreshed on writes.
    pub size: usize,
    pub offset: usize,
    pub readable: bool,
    pub writable: bool,
}

impl File {
    pub fn new_console() -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(File {
            kind: FileKind::Console,
            path: String::from("console"),
            inode: 0,
            size: 0,
            offset: 0,
            readable: true,
            writable: true,
        }))
    }

    /// Open a path through the VFS, optionally creating it. Directories
    /// get their listing captured into the handle.
    pub fn open_path(path: &str, create: bool) -> FsResult<Arc<Mutex<Self>>> {
        let inode = {
            let vfs = super::VFS.lock();
            match vfs.lookup(path) {
                Ok(inode) => inode,
                Err(FsError::NotFound) if create => {
                    drop(vfs);
                    super::VFS.lock().create(path)?
                }
                Err(e) => return Err(e),
            }
        };

        let kind = match inode.file_type {
            FileType::Directory => FileKind::Directory(super::VFS.lock().readdir(path)?),
            FileType::File => FileKind::Regular,
        };

        Ok(Arc::new(Mutex::new(File {
            kind,
            path: String::from(path),
            inode: inode.id,
            size: inode.size,
            offset: 0,
            readable: true,
            writable: true,
        })))
    }

    /// Create a connected pipe and return its (read, write) endpoints.
    pub fn pipe_pair() -> (Arc<Mutex<Self>>, Arc<Mutex<Self>>) {
        let pipe = Pipe::new();
        pipe.lock().add_reader();
        pipe.lock().add_writer();

        let read_end = Arc::new(Mutex::new(File {
            kind: FileKind::PipeRead(pipe.clone()),
            path: String::from("pipe"),
            inode: 0,
            size: 0,
            offset: 0,
            readable: true,
            writable: false,
        }));
        let write_end = Arc::new(Mutex::new(File {
            kind: FileKind::PipeWrite(pipe),
            path: String::from("pipe"),
            inode: 0,
            size: 0,
            offset: 0,
            readable: false,
            writable: true,
        }));
        (read_end, write_end)
    }

    /// Read file content at an absolute offset, bypassing the handle
    /// cursor. Only meaningful for regular files.
    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> FsResult<usize> {
        match self.kind {
            FileKind::Regular => super::VFS.lock().read_file(&self.path, offset, buf),
            _ => Err(FsError::IoError),
        }
    }

    /// Write file content at an absolute offset. Used by fd writes and
    /// by the mapping write-back path (whole dirty pages at their
    /// computed offsets).
    pub fn write_at(&mut self, offset: usize, data: &[u8]) -> FsResult<usize> {
        match self.kind {
            FileKind::Regular => {
                let written = super::VFS.lock().write_file(&self.path, offset, data)?;
                self.size = self.size.max(offset + written);
                Ok(written)
            }
            _ => Err(FsError::IoError),
        }
    }
}

impl Drop for File {
    fn drop(&mut self) {
        // Last handle on a pipe endpoint gone: tell the pipe so the
        // other side can observe EOF / broken pipe.
        match &self.kind {
            FileKind::PipeRead(pipe) => pipe.lock().drop_reader(),
            FileKind::PipeWrite(pipe) => pipe.lock().drop_writer(),
            _ => {}
        }
    }
}

/// Descriptor table with the console preopened on 0/1/2.
pub fn default_fd_table() -> Vec<Option<Arc<Mutex<File>>>> {
    let mut table = Vec::with_capacity(64);
    for _ in 0..64 {
        table.push(None);
    }
    table[0] = Some(File::new_console()); // STDIN
    table[1] = Some(File::new_console()); // STDOUT
    table[2] = Some(File::new_console()); // STDERR
    table
}
