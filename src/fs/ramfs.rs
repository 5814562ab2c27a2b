use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;
use lazy_static::lazy_static;
use spin::Mutex;

use super::dentry::DirEntry;
use super::error::{FsError, FsResult};
use super::inode::{FileType, Inode};
use super::mount::FileSystem;

/// One node of the in-memory filesystem, keyed by its normalized
/// absolute path.
struct RamNode {
    id: u64,
    file_type: FileType,
    data: Vec<u8>,
}

impl RamNode {
    fn to_inode(&self) -> Inode {
        Inode {
            id: self.id,
            file_type: self.file_type,
            size: self.data.len(),
        }
    }
}

struct RamFsInner {
    nodes: BTreeMap<String, RamNode>,
    next_id: u64,
}

impl RamFsInner {
    fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            String::from("/"),
            RamNode {
                id: 0,
                file_type: FileType::Directory,
                data: Vec::new(),
            },
        );
        RamFsInner { nodes, next_id: 1 }
    }

    fn parent_of(path: &str) -> FsResult<String> {
        let trimmed = path.trim_end_matches('/');
        if trimmed.is_empty() {
            return Err(FsError::InvalidPath);
        }
        let last_slash = trimmed.rfind('/').ok_or(FsError::InvalidPath)?;
        Ok(if last_slash == 0 {
            String::from("/")
        } else {
            String::from(&trimmed[..last_slash])
        })
    }

    fn insert(&mut self, path: String, file_type: FileType) -> FsResult<Inode> {
        if self.nodes.contains_key(&path) {
            return Err(FsError::AlreadyExists);
        }
        let parent = Self::parent_of(&path)?;
        match self.nodes.get(&parent) {
            Some(node) if node.file_type == FileType::Directory => {}
            Some(_) => return Err(FsError::NotADirectory),
            None => return Err(FsError::NotFound),
        }

        let id = self.next_id;
        self.next_id += 1;
        let node = RamNode {
            id,
            file_type,
            data: Vec::new(),
        };
        let inode = node.to_inode();
        self.nodes.insert(path, node);
        Ok(inode)
    }

    /// Direct children of `dir` (one path component below it).
    fn children_of(&self, dir: &str) -> Vec<DirEntry> {
        let prefix = if dir == "/" {
            String::from("/")
        } else {
            alloc::format!("{}/", dir)
        };
        self.nodes
            .iter()
            .filter(|(path, _)| {
                path.as_str() != "/"
                    && path.starts_with(prefix.as_str())
                    && !path[prefix.len()..].contains('/')
            })
            .map(|(path, node)| DirEntry {
                name: String::from(&path[prefix.len()..]),
                inode: node.to_inode(),
            })
            .collect()
    }
}

/// Tree-less in-memory filesystem: the whole namespace is a sorted map
/// of normalized absolute paths.
pub struct RamFs {
    label: &'static str,
    inner: Mutex<RamFsInner>,
}

impl RamFs {
    pub fn new(label: &'static str) -> Self {
        RamFs {
            label,
            inner: Mutex::new(RamFsInner::new()),
        }
    }

    /// Normalize: leading /, no trailing / (except the root itself).
    fn normalize(path: &str) -> String {
        let p = if path.starts_with('/') {
            String::from(path)
        } else {
            alloc::format!("/{}", path)
        };
        if p.len() > 1 && p.ends_with('/') {
            String::from(p.trim_end_matches('/'))
        } else {
            p
        }
    }
}

impl FileSystem for RamFs {
    fn name(&self) -> &str {
        self.label
    }

    fn create(&self, path: &str) -> FsResult<Inode> {
        self.inner
            .lock()
            .insert(Self::normalize(path), FileType::File)
    }

    fn mkdir(&self, path: &str) -> FsResult<Inode> {
        self.inner
            .lock()
            .insert(Self::normalize(path), FileType::Directory)
    }

    fn lookup(&self, path: &str) -> FsResult<Inode> {
        let inner = self.inner.lock();
        inner
            .nodes
            .get(&Self::normalize(path))
            .map(|n| n.to_inode())
            .ok_or(FsError::NotFound)
    }

    fn read(&self, path: &str, offset: usize, buf: &mut [u8]) -> FsResult<usize> {
        let inner = self.inner.lock();
        let node = inner
            .nodes
            .get(&Self::normalize(path))
            .ok_or(FsError::NotFound)?;
        if node.file_type == FileType::Directory {
            return Err(FsError::IsADirectory);
        }
        if offset >= node.data.len() {
            return Ok(0);
        }
        let available = &node.data[offset..];
        let to_read = buf.len().min(available.len());
        buf[..to_read].copy_from_slice(&available[..to_read]);
        Ok(to_read)
    }

    fn write(&self, path: &str, offset: usize, data: &[u8]) -> FsResult<usize> {
        let mut inner = self.inner.lock();
        let node = inner
            .nodes
            .get_mut(&Self::normalize(path))
            .ok_or(FsError::NotFound)?;
        if node.file_type == FileType::Directory {
            return Err(FsError::IsADirectory);
        }
        let end = offset + data.len();
        if end > node.data.len() {
            node.data.resize(end, 0);
        }
        node.data[offset..end].copy_from_slice(data);
        Ok(data.len())
    }

    fn readdir(&self, path: &str) -> FsResult<Vec<DirEntry>> {
        let inner = self.inner.lock();
        let path = Self::normalize(path);
        match inner.nodes.get(&path) {
            Some(node) if node.file_type == FileType::Directory => {}
            Some(_) => return Err(FsError::NotADirectory),
            None => return Err(FsError::NotFound),
        }
        Ok(inner.children_of(&path))
    }

    fn unlink(&self, path: &str) -> FsResult<()> {
        let mut inner = self.inner.lock();
        let path = Self::normalize(path);
        if path == "/" {
            return Err(FsError::InvalidPath);
        }
        match inner.nodes.get(&path) {
            Some(node)
                if node.file_type == FileType::Directory
                    && !inner.children_of(&path).is_empty() =>
            {
                return Err(FsError::IsADirectory)
            }
            Some(_) => {}
            None => return Err(FsError::NotFound),
        }
        inner.nodes.remove(&path);
        Ok(())
    }
}

lazy_static! {
    pub static ref RAMFS_INSTANCE: RamFs = RamFs::new("ramfs");
}
