use crate::fs::fd::{File, FileKind};
use crate::fs::pipe;
use crate::memory::user;
use crate::memory::{paging, SegmentFlags};
use crate::scheduler::{self, context, wait, ProcessState, WaitReason, PROCESS_TABLE};
use crate::time::TimeSpec;
use alloc::string::String;
use alloc::vec::Vec;

/// Syscall numbers (passed in RAX from userland).
pub const SYS_EXIT: u64 = 0;
pub const SYS_FORK: u64 = 1;
pub const SYS_READ: u64 = 2;
pub const SYS_WRITE: u64 = 3;
pub const SYS_OPEN: u64 = 4;
pub const SYS_CLOSE: u64 = 5;
pub const SYS_PIPE: u64 = 6;
pub const SYS_DUP2: u64 = 7;
pub const SYS_GETPID: u64 = 8;
pub const SYS_BRK: u64 = 9;
pub const SYS_MMAP: u64 = 10;
pub const SYS_MUNMAP: u64 = 11;
pub const SYS_MSYNC: u64 = 12;
pub const SYS_NANOSLEEP: u64 = 13;
pub const SYS_READV: u64 = 14;
pub const SYS_WRITEV: u64 = 15;
pub const SYS_EXECVE: u64 = 16;
pub const SYS_SET_THREAD_AREA: u64 = 17;
pub const SYS_GET_THREAD_AREA: u64 = 18;
pub const SYS_UNLINK: u64 = 19;

/// Generic error sentinel returned to user code.
const ERR: u64 = u64::MAX;

const O_CREAT: u64 = 0x200;
const MAP_SHARED: u64 = 0x1;

/// Cap on a single read/write transfer, to bound kernel buffering.
const MAX_IO_SIZE: usize = 1 << 20;

const TLS_ENTRY_OFFSET: i64 = 6;
const MAX_TLS_SEGMENTS: usize = 3;

/// An entry of a readv/writev vector, as user code lays it out.
#[repr(C)]
#[derive(Clone, Copy)]
struct IoVec {
    base: u64,
    len: u64,
}

/// A thread-area descriptor, as user code lays it out.
#[repr(C)]
#[derive(Clone, Copy)]
struct TlsUserDesc {
    entry_number: i64,
    base: u64,
    limit: u64,
}

pub fn init() {
    crate::log_info!("Syscall interface ready on int {:#x}.", crate::interrupts::idt::SYSCALL_VECTOR);
}

/// Syscall ISR body, entered through the context-switch protocol. The
/// saved register image holds number and arguments; the handler's
/// result is written back into the image's RAX slot so the process
/// simply observes a return value, and control falls through to the
/// scheduler rather than straight back to the caller.
pub extern "C" fn syscall_interrupt(_is_userspace: bool) {
    let (number, args, frame_rsp) = {
        let table = PROCESS_TABLE.lock();
        let current = table.current();
        let frame = unsafe { &*context::saved_frame_ptr(current.saved_rsp) };
        (
            frame.rax,
            [frame.rdi, frame.rsi, frame.rdx, frame.r10, frame.r8],
            current.saved_rsp,
        )
    };

    let ret = dispatch(number, args);

    unsafe {
        (*context::saved_frame_ptr(frame_rsp)).rax = ret;
    }
    scheduler::dispatch();
}

/// Central dispatcher. Handlers that end the calling context (exit,
/// successful execve) diverge instead of returning.
pub fn dispatch(number: u64, args: [u64; 5]) -> u64 {
    match number {
        SYS_EXIT => {
            scheduler::exit_current();
        }
        SYS_FORK => sys_fork(),
        SYS_READ => sys_read(args[0], args[1], args[2]),
        SYS_WRITE => sys_write(args[0], args[1], args[2]),
        SYS_OPEN => sys_open(args[0], args[1]),
        SYS_CLOSE => sys_close(args[0]),
        SYS_PIPE => sys_pipe(args[0]),
        SYS_DUP2 => sys_dup2(args[0], args[1]),
        SYS_GETPID => PROCESS_TABLE.lock().current().pid.0,
        SYS_BRK => sys_brk(args[0]),
        SYS_MMAP => sys_mmap(args[0], args[1], args[2], args[3], args[4]),
        SYS_MUNMAP => sys_munmap(args[0], args[1]),
        SYS_MSYNC => sys_msync(args[0], args[1]),
        SYS_NANOSLEEP => sys_nanosleep(args[0]),
        SYS_READV => sys_readv(args[0], args[1], args[2]),
        SYS_WRITEV => sys_writev(args[0], args[1], args[2]),
        SYS_EXECVE => sys_execve(args[0], args[1], args[2]),
        SYS_SET_THREAD_AREA => sys_set_thread_area(args[0]),
        SYS_GET_THREAD_AREA => sys_get_thread_area(args[0]),
        SYS_UNLINK => sys_unlink(args[0]),
        _ => {
            crate::log_warn!("syscall: unknown number {}", number);
            ERR
        }
    }
}

fn sys_fork() -> u64 {
    let mut table = PROCESS_TABLE.lock();
    match scheduler::fork::fork_current(&mut table) {
        // The parent's return value; the duplicator already zeroed the
        // child's copy of the frame.
        Ok(child_pid) => child_pid.0,
        Err(_) => ERR,
    }
}

fn sys_read(fd: u64, buf: u64, len: u64) -> u64 {
    let len = (len as usize).min(MAX_IO_SIZE);
    let mut table = PROCESS_TABLE.lock();
    let Some(file) = table.current().fd(fd as usize) else {
        return ERR;
    };

    // Decide what the descriptor is attached to without holding the
    // file lock across the blocking paths.
    enum Target {
        Console,
        Regular,
        Pipe(alloc::sync::Arc<spin::Mutex<pipe::Pipe>>),
    }
    let target = {
        let f = file.lock();
        if !f.readable {
            return ERR;
        }
        match &f.kind {
            FileKind::Console => Target::Console,
            FileKind::Regular => Target::Regular,
            FileKind::PipeRead(p) => Target::Pipe(p.clone()),
            _ => return ERR,
        }
    };

    match target {
        Target::Console => {
            // Block until the keyboard delivers a line (or the buffer
            // fills); by convention the call reports the full request.
            wait::block_current(
                &mut table,
                WaitReason::Keyboard {
                    buf,
                    len,
                    filled: 0,
                },
            );
            len as u64
        }
        Target::Regular => {
            let mut f = file.lock();
            let offset = f.offset;
            let mut tmp = alloc::vec![0u8; len];
            let Ok(n) = f.read_at(offset, &mut tmp) else {
                return ERR;
            };
            let current = table.current_mut();
            if user::copy_to_user(&mut current.image, buf, &tmp[..n]).is_err() {
                return ERR;
            }
            f.offset += n;
            n as u64
        }
        Target::Pipe(p) => pipe::read_from_pipe(&mut table, &p, buf, len) as u64,
    }
}

fn write_console(table: &mut scheduler::ProcessTable, buf: u64, len: usize) -> u64 {
    let mut tmp = alloc::vec![0u8; len];
    let current = table.current_mut();
    if user::copy_from_user(&mut current.image, buf, &mut tmp).is_err() {
        return ERR;
    }
    if let Ok(s) = core::str::from_utf8(&tmp) {
        crate::print!("{}", s);
    } else {
        for &b in &tmp {
            crate::print!("{}", b as char);
        }
    }
    len as u64
}

fn sys_write(fd: u64, buf: u64, len: u64) -> u64 {
    let len = (len as usize).min(MAX_IO_SIZE);
    let mut table = PROCESS_TABLE.lock();
    let Some(file) = table.current().fd(fd as usize) else {
        return ERR;
    };

    let is_console = matches!(file.lock().kind, FileKind::Console);
    if is_console {
        return write_console(&mut table, buf, len);
    }

    let pipe_end = match &file.lock().kind {
        FileKind::PipeWrite(p) => Some(p.clone()),
        _ => None,
    };
    if let Some(p) = pipe_end {
        if !file.lock().writable {
            return ERR;
        }
        return pipe::write_to_pipe(&mut table, &p, buf, len) as u64;
    }

    // Regular file: pull the bytes out of user space, then push them
    // through the VFS at the handle cursor.
    let mut tmp = alloc::vec![0u8; len];
    {
        let current = table.current_mut();
        if user::copy_from_user(&mut current.image, buf, &mut tmp).is_err() {
            return ERR;
        }
    }
    let mut f = file.lock();
    if !f.writable {
        return ERR;
    }
    let offset = f.offset;
    match f.write_at(offset, &tmp) {
        Ok(n) => {
            f.offset += n;
            n as u64
        }
        Err(_) => ERR,
    }
}

fn read_iovecs(
    table: &mut scheduler::ProcessTable,
    iov_addr: u64,
    count: usize,
) -> Result<Vec<IoVec>, ()> {
    if count > 64 {
        return Err(());
    }
    let current = table.current_mut();
    let mut iovs = Vec::with_capacity(count);
    for i in 0..count {
        let addr = iov_addr + (i * core::mem::size_of::<IoVec>()) as u64;
        let iov: IoVec = user::read_user(&mut current.image, addr).map_err(|_| ())?;
        iovs.push(iov);
    }
    Ok(iovs)
}

fn sys_readv(fd: u64, iov_addr: u64, count: u64) -> u64 {
    let iovs = {
        let mut table = PROCESS_TABLE.lock();
        match read_iovecs(&mut table, iov_addr, count as usize) {
            Ok(v) => v,
            Err(()) => return ERR,
        }
    };
    let mut total = 0u64;
    for iov in iovs {
        let n = sys_read(fd, iov.base, iov.len);
        if n == ERR {
            return ERR;
        }
        total += n;
        // A short read, or a descriptor that blocked the caller,
        // finishes the vector; only one wait may be outstanding.
        let blocked = PROCESS_TABLE.lock().current().state == ProcessState::Waiting;
        if blocked || n < iov.len {
            break;
        }
    }
    total
}

fn sys_writev(fd: u64, iov_addr: u64, count: u64) -> u64 {
    let iovs = {
        let mut table = PROCESS_TABLE.lock();
        match read_iovecs(&mut table, iov_addr, count as usize) {
            Ok(v) => v,
            Err(()) => return ERR,
        }
    };
    let mut total = 0u64;
    for iov in iovs {
        let n = sys_write(fd, iov.base, iov.len);
        if n == ERR {
            return ERR;
        }
        total += n;
        // A pipe write that filled the ring blocked the caller; only
        // one wait may be outstanding at a time.
        if PROCESS_TABLE.lock().current().state == ProcessState::Waiting {
            break;
        }
    }
    total
}

fn absolute_path(current_dir: &str, path: &str) -> String {
    if path.starts_with('/') {
        String::from(path)
    } else if current_dir.ends_with('/') {
        alloc::format!("{}{}", current_dir, path)
    } else {
        alloc::format!("{}/{}", current_dir, path)
    }
}

fn sys_open(path_addr: u64, flags: u64) -> u64 {
    let mut table = PROCESS_TABLE.lock();
    let path = {
        let current = table.current_mut();
        match user::read_user_string(&mut current.image, path_addr) {
            Ok(p) => absolute_path(&current.working_dir, &p),
            Err(_) => return ERR,
        }
    };

    let file = match File::open_path(&path, flags & O_CREAT != 0) {
        Ok(f) => f,
        Err(_) => return ERR,
    };
    match table.current_mut().alloc_fd(file) {
        Some(fd) => fd as u64,
        None => ERR,
    }
}

fn sys_close(fd: u64) -> u64 {
    let mut table = PROCESS_TABLE.lock();
    let current = table.current_mut();
    match current.files.get_mut(fd as usize) {
        Some(slot) if slot.is_some() => {
            // Dropping the Arc releases the handle once mappings and
            // duplicated descriptors are gone too.
            *slot = None;
            0
        }
        _ => ERR,
    }
}

fn sys_pipe(fds_addr: u64) -> u64 {
    let mut table = PROCESS_TABLE.lock();
    let (read_end, write_end) = File::pipe_pair();
    let current = table.current_mut();

    let Some(read_fd) = current.alloc_fd(read_end) else {
        return ERR;
    };
    let Some(write_fd) = current.alloc_fd(write_end) else {
        current.files[read_fd] = None;
        return ERR;
    };

    let pair = [read_fd as u32, write_fd as u32];
    if user::write_user(&mut current.image, fds_addr, pair).is_err() {
        current.files[read_fd] = None;
        current.files[write_fd] = None;
        return ERR;
    }
    0
}

fn sys_dup2(old_fd: u64, new_fd: u64) -> u64 {
    let mut table = PROCESS_TABLE.lock();
    let current = table.current_mut();
    if old_fd == new_fd {
        return 0;
    }
    let Some(file) = current.fd(old_fd as usize) else {
        return ERR;
    };
    let Some(slot) = current.files.get_mut(new_fd as usize) else {
        return ERR;
    };
    // Clobbering an open descriptor closes it first.
    *slot = Some(file);
    0
}

fn sys_brk(new_brk: u64) -> u64 {
    let mut table = PROCESS_TABLE.lock();
    let current = table.current_mut();
    if new_brk != 0 && new_brk < paging::USER_SPACE_START {
        return ERR;
    }
    match current.image.grow_break(new_brk) {
        Ok(brk) => brk,
        Err(_) => ERR,
    }
}

fn sys_mmap(req_addr: u64, len: u64, _prot: u64, flags: u64, fd: u64) -> u64 {
    let len = len as usize;
    if len == 0 {
        return ERR;
    }
    let mut table = PROCESS_TABLE.lock();
    let current = table.current_mut();

    // Address selection: explicit, or carved downward out of the mmap
    // region below the lower break.
    let addr = if req_addr != 0 {
        paging::page_align_down(req_addr)
    } else {
        let addr = paging::page_align_down(current.image.lower_brk - len as u64);
        current.image.lower_brk = addr;
        addr
    };
    if addr < paging::USER_SPACE_START {
        return ERR;
    }

    // Descriptor 0 doubles as the anonymous-mapping marker: plain
    // memory, served by a fresh RW segment.
    if fd == 0 {
        return match current.image.create_segment(
            addr,
            len,
            SegmentFlags::READ | SegmentFlags::WRITE,
            None,
        ) {
            Ok(()) => addr,
            Err(_) => ERR,
        };
    }

    let Some(file) = current.fd(fd as usize) else {
        return ERR;
    };
    if !matches!(file.lock().kind, FileKind::Regular) {
        return ERR;
    }
    let shared = flags & MAP_SHARED != 0;
    match current.image.create_mapping(addr, len, 0, shared, file) {
        Ok(()) => addr,
        Err(_) => ERR,
    }
}

fn sys_munmap(addr: u64, _len: u64) -> u64 {
    let mut table = PROCESS_TABLE.lock();
    let image = &mut table.current_mut().image;
    if image.destroy_mapping(addr).is_ok() {
        return 0;
    }
    match image.destroy_segment(addr) {
        Ok(()) => 0,
        Err(_) => ERR,
    }
}

fn sys_msync(addr: u64, _len: u64) -> u64 {
    let mut table = PROCESS_TABLE.lock();
    match table.current_mut().image.sync_mapping(addr) {
        Ok(()) => 0,
        Err(_) => ERR,
    }
}

fn sys_nanosleep(req_addr: u64) -> u64 {
    let mut table = PROCESS_TABLE.lock();
    let request: TimeSpec = {
        let current = table.current_mut();
        match user::read_user(&mut current.image, req_addr) {
            Ok(ts) => ts,
            Err(_) => return ERR,
        }
    };
    let wake_at = crate::time::now().add(request);
    wait::block_current(&mut table, WaitReason::Sleep { wake_at });
    0
}

fn sys_execve(path_addr: u64, argv_addr: u64, _envp_addr: u64) -> u64 {
    if path_addr == 0 || argv_addr == 0 {
        return ERR;
    }

    let (path, argv) = {
        let mut table = PROCESS_TABLE.lock();
        let current = table.current_mut();
        let raw_path = match user::read_user_string(&mut current.image, path_addr) {
            Ok(p) => p,
            Err(_) => return ERR,
        };
        let path = absolute_path(&current.working_dir, &raw_path);

        // argv is a NULL-terminated vector of string pointers.
        let mut argv = Vec::new();
        let mut cursor = argv_addr;
        loop {
            let ptr: u64 = match user::read_user(&mut current.image, cursor) {
                Ok(p) => p,
                Err(_) => return ERR,
            };
            if ptr == 0 {
                break;
            }
            match user::read_user_string(&mut current.image, ptr) {
                Ok(arg) => argv.push(arg),
                Err(_) => return ERR,
            }
            cursor += 8;
            if argv.len() > 64 {
                return ERR;
            }
        }
        if argv.is_empty() {
            argv.push(path.clone());
        }
        (path, argv)
    };

    // The replacement runs as a fresh process image; the caller's own
    // image is torn down by the reaper.
    let argv_refs: Vec<&str> = argv.iter().map(|s| s.as_str()).collect();
    if crate::loader::elf::spawn_program(&path, &argv_refs).is_err() {
        return ERR;
    }

    {
        let mut table = PROCESS_TABLE.lock();
        table.current_mut().state = ProcessState::Stopped;
    }
    scheduler::dispatch();
}

fn sys_set_thread_area(desc_addr: u64) -> u64 {
    let mut table = PROCESS_TABLE.lock();
    let current = table.current_mut();

    // Read and write the descriptor through the process's own address
    // space, the way the original pokes it in place.
    let _guard = paging::ActiveSpace::enter(&current.image.space);
    let desc_ptr = desc_addr as *mut TlsUserDesc;
    let desc = unsafe { desc_ptr.read() };

    if desc.entry_number == -1 {
        // Allocate a fresh descriptor slot.
        if current.tls.len() >= MAX_TLS_SEGMENTS {
            return ERR;
        }
        current.tls.push(crate::interrupts::gdt::TlsDescriptor {
            base: desc.base,
            limit: desc.limit as u32,
        });
        let index = current.tls.len() - 1;
        current.tls_index = index;
        unsafe {
            (*desc_ptr).entry_number = index as i64 + TLS_ENTRY_OFFSET;
        }
        0
    } else {
        // Select an existing descriptor.
        let index = desc.entry_number - TLS_ENTRY_OFFSET;
        if index >= 0 && (index as usize) < current.tls.len() {
            current.tls_index = index as usize;
            0
        } else {
            ERR
        }
    }
}

fn sys_get_thread_area(desc_addr: u64) -> u64 {
    let mut table = PROCESS_TABLE.lock();
    let current = table.current_mut();
    let tls = current.active_tls();
    let desc = TlsUserDesc {
        entry_number: current.tls_index as i64 + TLS_ENTRY_OFFSET,
        base: tls.base,
        limit: tls.limit as u64,
    };
    match user::write_user(&mut current.image, desc_addr, desc) {
        Ok(()) => 0,
        Err(_) => ERR,
    }
}

fn sys_unlink(path_addr: u64) -> u64 {
    let mut table = PROCESS_TABLE.lock();
    let path = {
        let current = table.current_mut();
        match user::read_user_string(&mut current.image, path_addr) {
            Ok(p) => absolute_path(&current.working_dir, &p),
            Err(_) => return ERR,
        }
    };
    match crate::fs::VFS.lock().unlink(&path) {
        Ok(()) => 0,
        Err(_) => ERR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryImage;
    use crate::scheduler::tests::spawn_bare;
    use crate::scheduler::ProcessTable;

    fn with_user_segment(table: &mut ProcessTable, slot: usize) {
        table
            .get_mut(slot)
            .unwrap()
            .image
            .create_segment(
                0x4004_8000,
                2 * 4096,
                SegmentFlags::READ | SegmentFlags::WRITE,
                None,
            )
            .unwrap();
    }

    // The syscall layer mostly glues validated cores together; these
    // tests pin the pure helpers.

    #[test]
    fn paths_are_resolved_against_the_working_directory() {
        assert_eq!(absolute_path("/home", "file"), "/home/file");
        assert_eq!(absolute_path("/home/", "file"), "/home/file");
        assert_eq!(absolute_path("/home", "/etc/hosts"), "/etc/hosts");
    }

    #[test]
    fn iovec_arrays_are_read_from_user_memory() {
        let mut table = ProcessTable::new();
        let slot = spawn_bare(&mut table);
        with_user_segment(&mut table, slot);
        table.set_current(slot);

        let iovs = [
            IoVec {
                base: 0x4004_8100,
                len: 3,
            },
            IoVec {
                base: 0x4004_8200,
                len: 5,
            },
        ];
        {
            let image = &mut table.current_mut().image;
            user::write_user(image, 0x4004_8000, iovs).unwrap();
        }

        let got = read_iovecs(&mut table, 0x4004_8000, 2).unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].base, 0x4004_8100);
        assert_eq!(got[0].len, 3);
        assert_eq!(got[1].base, 0x4004_8200);
        assert_eq!(got[1].len, 5);

        assert!(read_iovecs(&mut table, 0x4004_8000, 65).is_err());
    }

    #[test]
    fn mmap_address_selection_grows_downward() {
        let mut image = MemoryImage::new_user();
        let before = image.lower_brk;

        // Mirror the sys_mmap carving logic on a bare image.
        let len = 3 * 4096u64;
        let addr = paging::page_align_down(image.lower_brk - len);
        image.lower_brk = addr;
        assert!(addr < before);
        assert_eq!(addr % 4096, 0);

        let next = paging::page_align_down(image.lower_brk - 4096);
        assert!(next < addr);
    }
}
