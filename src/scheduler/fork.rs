use super::context;
use super::process::{Process, ProcessId, ProcessState, KERNEL_STACK_SIZE};
use super::ProcessTable;
use crate::memory::segment::PageRegion;
use crate::memory::{MemoryError, MemoryImage};

/// Duplicate the current process into a child: same virtual layout,
/// freshly allocated physical memory with byte-for-byte copied content
/// (full-copy fork, no copy-on-write), shared open-file handles, and a
/// kernel stack whose saved context resumes at the same point. The
/// child lands in the registry right after the parent, RUNNABLE.
///
/// Return-value convention (parent sees the child pid, child sees 0) is
/// the syscall layer's job for the parent half; the child half is done
/// here by zeroing the copied frame's rax slot.
pub fn fork_current(table: &mut ProcessTable) -> Result<ProcessId, MemoryError> {
    let child_pid = table.assign_pid();

    let child = {
        let parent = table.current();

        // New address space with only the kernel region, then a deep
        // copy of every segment at the same address and permissions.
        let mut image = MemoryImage::new_user();
        for segment in &parent.image.segments {
            image.adopt_segment_copy(segment)?;
        }
        image.brk = parent.image.brk;
        image.actual_brk = parent.image.actual_brk;
        image.lower_brk = parent.image.lower_brk;

        // Mapping records re-point at the same files; resident pages
        // are physically copied.
        image.clone_mappings_from(&parent.image);

        // The kernel stack is cloned wholesale so the child resumes
        // from the identical suspension point.
        let mut kernel_stack = alloc::vec![0u8; KERNEL_STACK_SIZE].into_boxed_slice();
        kernel_stack.copy_from_slice(&parent.kernel_stack);

        let parent_top = parent.kernel_stack_top();
        let child_top = {
            let top = kernel_stack.as_ptr() as u64 + kernel_stack.len() as u64;
            top & !0xF
        };
        // Same offset from the stack top, in the child's own stack.
        let saved_rsp = child_top - (parent_top - parent.saved_rsp);

        unsafe {
            // When the FPU block is in the frame, the first slot of the
            // copied stack is a pointer into the *parent's* stack (the
            // pre-save RSP). Translate it the same way.
            if context::fpu_enabled() {
                let link = saved_rsp as *mut u64;
                *link = child_top - (parent_top - *link);
            }
            // The child's fork() returns 0.
            (*context::saved_frame_ptr(saved_rsp)).rax = 0;
        }

        Process {
            pid: child_pid,
            path: parent.path.clone(),
            working_dir: parent.working_dir.clone(),
            image,
            saved_rsp,
            kernel_stack,
            entry: parent.entry,
            tls: parent.tls.clone(),
            tls_index: parent.tls_index,
            // Cloning the Arcs bumps every handle's reference count,
            // pipes included, exactly like dup of each descriptor.
            files: parent.files.clone(),
            state: ProcessState::Runnable,
            wait: None,
            argv: parent.argv.clone(),
        }
    };

    table.insert_after_current(child);
    Ok(child_pid)
}

impl MemoryImage {
    /// Fork helper: re-create `segment` in this image with a fresh
    /// physical allocation holding an exact copy of its current bytes.
    pub fn adopt_segment_copy(
        &mut self,
        segment: &crate::memory::Segment,
    ) -> Result<(), MemoryError> {
        let mut backing = PageRegion::new_zeroed(segment.alloc_size);
        backing.as_mut_slice().copy_from_slice(segment.backing().as_slice());
        self.insert_segment_with_backing(
            segment.virtual_base,
            segment.size,
            segment.flags,
            backing,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::user;
    use crate::memory::SegmentFlags;
    use crate::scheduler::{spawn_into, LoadSegment};

    fn spawn_test_parent(table: &mut ProcessTable) -> ProcessId {
        let data = [7u8; 64];
        let segments = [LoadSegment {
            vaddr: 0x4004_8000,
            mem_size: 4096,
            data: &data,
            flags: SegmentFlags::READ | SegmentFlags::WRITE,
        }];
        spawn_into(table, "/bin/parent", &["/bin/parent"], &segments, 0x4004_8000, "/").unwrap()
    }

    fn prime_saved_frame(process: &mut Process) {
        // Fabricate a suspension point: a frame of zeros at the top of
        // the kernel stack, as if an interrupt had just saved state.
        let frame_len = 20 * 8;
        let top = process.kernel_stack_top();
        process.saved_rsp = top - frame_len as u64;
    }

    #[test]
    fn fork_copies_segments_and_isolates_writes() {
        let mut table = ProcessTable::new();
        spawn_test_parent(&mut table);
        prime_saved_frame(table.current_mut());

        let child_pid = fork_current(&mut table).unwrap();
        assert_eq!(child_pid.0, 2);

        let parent_slot = table.current_slot().unwrap();
        let child_slot = table
            .occupied_slots()
            .into_iter()
            .find(|&s| s != parent_slot)
            .unwrap();

        // Same content at the same virtual address, different frames.
        let (parent, child) = table.pair_mut(parent_slot, child_slot);
        let pp = parent.image.translate(0x4004_8000).unwrap();
        let cp = child.image.translate(0x4004_8000).unwrap();
        assert_ne!(pp, cp);

        let mut buf = [0u8; 8];
        user::copy_from_user(&mut child.image, 0x4004_8000, &mut buf).unwrap();
        assert_eq!(buf, [7u8; 8]);

        // Writes on either side stay invisible to the other.
        user::copy_to_user(&mut child.image, 0x4004_8000, b"CHILD").unwrap();
        user::copy_from_user(&mut parent.image, 0x4004_8000, &mut buf).unwrap();
        assert_eq!(buf, [7u8; 8]);

        user::copy_to_user(&mut parent.image, 0x4004_8010, b"PARENT").unwrap();
        user::copy_from_user(&mut child.image, 0x4004_8010, &mut buf).unwrap();
        assert_eq!(buf, [7u8; 8]);
    }

    #[test]
    fn fork_child_is_runnable_right_after_the_parent() {
        let mut table = ProcessTable::new();
        spawn_test_parent(&mut table);
        prime_saved_frame(table.current_mut());
        let child_pid = fork_current(&mut table).unwrap();

        // Next in ring order after the parent is the child.
        table.advance();
        assert_eq!(table.current().pid, child_pid);
        assert_eq!(table.current().state, ProcessState::Runnable);
        assert!(table.current().wait.is_none());
    }

    #[test]
    fn fork_translates_the_saved_stack_pointer() {
        let mut table = ProcessTable::new();
        spawn_test_parent(&mut table);
        prime_saved_frame(table.current_mut());
        let parent_offset = {
            let p = table.current();
            p.kernel_stack_top() - p.saved_rsp
        };

        fork_current(&mut table).unwrap();
        table.advance();
        let child = table.current();
        assert_eq!(child.kernel_stack_top() - child.saved_rsp, parent_offset);

        // The copied frame's rax (the child's fork return value) is 0.
        let frame = context::saved_frame_ptr(child.saved_rsp);
        assert_eq!(unsafe { (*frame).rax }, 0);
    }

    #[test]
    fn fork_duplicates_the_fd_table_by_reference() {
        let mut table = ProcessTable::new();
        spawn_test_parent(&mut table);
        prime_saved_frame(table.current_mut());

        let (read_end, _write_end) = crate::fs::fd::File::pipe_pair();
        let fd = table.current_mut().alloc_fd(read_end.clone()).unwrap();

        fork_current(&mut table).unwrap();
        table.advance();
        let child_file = table.current().fd(fd).expect("child inherits the fd");
        assert!(alloc::sync::Arc::ptr_eq(&child_file, &read_end));
    }

    #[test]
    fn fork_copies_resident_mapping_pages() {
        crate::fs::ensure_root_mounted();
        {
            let mut vfs = crate::fs::VFS.lock();
            let _ = vfs.create("/fork_map");
            vfs.write_file("/fork_map", 0, b"file-content").unwrap();
        }
        let file = crate::fs::fd::File::open_path("/fork_map", false).unwrap();

        let mut table = ProcessTable::new();
        spawn_test_parent(&mut table);
        prime_saved_frame(table.current_mut());
        table
            .current_mut()
            .image
            .create_mapping(0x7600_0000, 4096, 0, false, file)
            .unwrap();
        assert!(table.current_mut().image.resolve_fault(0x7600_0000));
        // Dirty the private page so the copy is observable.
        user::copy_to_user(&mut table.current_mut().image, 0x7600_0000, b"DIRTY").unwrap();

        fork_current(&mut table).unwrap();
        table.advance();
        let child = table.current_mut();
        assert_eq!(child.image.mappings.len(), 1);

        let mut buf = [0u8; 5];
        user::copy_from_user(&mut child.image, 0x7600_0000, &mut buf).unwrap();
        assert_eq!(&buf, b"DIRTY");
    }
}
