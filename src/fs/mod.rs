pub mod dentry;
pub mod error;
pub mod fd;
pub mod inode;
pub mod mount;
pub mod pipe;
pub mod ramfs;
pub mod vfs;

use lazy_static::lazy_static;
use spin::{Mutex, Once};
use vfs::Vfs;

lazy_static! {
    pub static ref VFS: Mutex<Vfs> = Mutex::new(Vfs::new());
}

static ROOT_MOUNTED: Once<()> = Once::new();

/// Mount the root filesystem exactly once. Host tests call this too, so
/// mounting must be idempotent.
pub fn ensure_root_mounted() {
    ROOT_MOUNTED.call_once(|| {
        let root: &'static ramfs::RamFs = &ramfs::RAMFS_INSTANCE;
        VFS.lock().mount("/", root);
    });
}

pub fn init() {
    ensure_root_mounted();
    seed_default_files();
    crate::log_info!("VFS initialized: ramfs mounted at /.");
}

fn seed_default_files() {
    let mut vfs = VFS.lock();
    let _ = vfs.mkdir("/bin");
    let _ = vfs.mkdir("/etc");
    let _ = vfs.mkdir("/tmp");
    let _ = vfs.create("/etc/hostname");
    let _ = vfs.write_file("/etc/hostname", 0, b"ferrite\n");
}
