use crate::fs::fd::File;
use crate::interrupts::gdt::TlsDescriptor;
use crate::memory::MemoryImage;
use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

/// Size of each process's kernel stack (16 KiB).
pub const KERNEL_STACK_SIZE: usize = 4096 * 4;

/// Unique process identifier. Monotonic, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ProcessId(pub u64);

/// Process state machine. NEW processes have not entered user mode yet;
/// STOPPED processes are reaped by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    New,
    Runnable,
    Waiting,
    Stopped,
}

/// One schedulable unit: identity, address space, kernel stack,
/// resources and scheduling state. Registry linkage (next/prev) lives
/// in the process table's arena, not here.
pub struct Process {
    pub pid: ProcessId,
    pub path: String,
    pub working_dir: String,

    pub image: MemoryImage,

    /// Saved stack pointer. Valid only while the process is not
    /// running; before the first entry it holds the initial user RSP.
    pub saved_rsp: u64,
    /// Owned kernel stack, used whenever this process traps into the
    /// kernel. Kept alive as long as the process exists.
    pub kernel_stack: Box<[u8]>,
    /// User-mode entry point; meaningful only before the first run.
    pub entry: u64,

    pub tls: Vec<TlsDescriptor>,
    pub tls_index: usize,

    pub files: Vec<Option<Arc<Mutex<File>>>>,

    pub state: ProcessState,
    /// Present exactly while state == Waiting.
    pub wait: Option<super::wait::WaitReason>,

    pub argv: Vec<String>,
}

impl Process {
    pub fn kernel_stack_top(&self) -> u64 {
        let top = self.kernel_stack.as_ptr() as u64 + self.kernel_stack.len() as u64;
        top & !0xF // strict 16-byte hardware alignment
    }

    pub fn active_tls(&self) -> TlsDescriptor {
        self.tls.get(self.tls_index).copied().unwrap_or_default()
    }

    pub fn fd(&self, fd: usize) -> Option<Arc<Mutex<File>>> {
        self.files.get(fd).and_then(|slot| slot.clone())
    }

    /// Place `file` in the lowest free descriptor slot at or above 3.
    pub fn alloc_fd(&mut self, file: Arc<Mutex<File>>) -> Option<usize> {
        for (i, slot) in self.files.iter_mut().enumerate().skip(3) {
            if slot.is_none() {
                *slot = Some(file);
                return Some(i);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::tests::bare_process;

    #[test]
    fn kernel_stack_top_is_aligned_and_inside_the_stack() {
        let p = bare_process(1);
        let top = p.kernel_stack_top();
        assert_eq!(top & 0xF, 0);
        let base = p.kernel_stack.as_ptr() as u64;
        assert!(top > base && top <= base + KERNEL_STACK_SIZE as u64);
    }

    #[test]
    fn fd_allocation_skips_the_standard_descriptors() {
        let mut p = bare_process(1);
        let file = crate::fs::fd::File::new_console();
        assert_eq!(p.alloc_fd(file.clone()), Some(3));
        assert_eq!(p.alloc_fd(file), Some(4));
        assert!(p.fd(0).is_some());
        assert!(p.fd(5).is_none());
    }
}
