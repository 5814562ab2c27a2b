pub mod context;
pub mod fork;
pub mod process;
pub mod wait;

use crate::interrupts::gdt;
use crate::memory::paging;
use crate::memory::{MemoryError, SegmentFlags, DEFAULT_STACK_BOTTOM, DEFAULT_STACK_SIZE, MMAP_CEILING};
use alloc::string::String;
use alloc::vec::Vec;
use lazy_static::lazy_static;
use spin::Mutex;

pub use process::{Process, ProcessId, ProcessState, KERNEL_STACK_SIZE};
pub use wait::WaitReason;

const STACK_CANARY: u64 = 0xDEAD_BEEF_DEAD_BEEF;
const AT_RANDOM: u64 = 25;

/// One arena cell: the process plus its circular-list linkage, stored
/// as slot indices rather than pointers so reaping can never leave a
/// dangling edge.
struct Slot {
    process: Process,
    next: usize,
    prev: usize,
}

/// The process registry: an arena of slots, circularly linked, plus the
/// cursor naming the currently executing process.
pub struct ProcessTable {
    slots: Vec<Option<Slot>>,
    current: Option<usize>,
    next_pid: u64,
}

impl ProcessTable {
    pub fn new() -> ProcessTable {
        ProcessTable {
            slots: Vec::new(),
            current: None,
            next_pid: 1,
        }
    }

    /// Monotonic PID assignment; PIDs are never reused even when arena
    /// slots are.
    pub fn assign_pid(&mut self) -> ProcessId {
        let pid = ProcessId(self.next_pid);
        self.next_pid += 1;
        pid
    }

    fn free_slot(&mut self) -> usize {
        match self.slots.iter().position(|s| s.is_none()) {
            Some(index) => index,
            None => {
                self.slots.push(None);
                self.slots.len() - 1
            }
        }
    }

    /// O(1) insertion right behind the cursor.
    pub fn insert_after_current(&mut self, process: Process) -> usize {
        let slot = self.free_slot();
        match self.current {
            None => {
                self.slots[slot] = Some(Slot {
                    process,
                    next: slot,
                    prev: slot,
                });
                self.current = Some(slot);
            }
            Some(current) => {
                let next = self.slots[current].as_ref().unwrap().next;
                self.slots[slot] = Some(Slot {
                    process,
                    next,
                    prev: current,
                });
                self.slots[current].as_mut().unwrap().next = slot;
                self.slots[next].as_mut().unwrap().prev = slot;
            }
        }
        slot
    }

    /// Move the cursor one step around the ring.
    pub fn advance(&mut self) {
        if let Some(current) = self.current {
            self.current = Some(self.slots[current].as_ref().unwrap().next);
        }
    }

    pub fn current_slot(&self) -> Option<usize> {
        self.current
    }

    #[cfg(test)]
    pub fn set_current(&mut self, slot: usize) {
        assert!(self.slots.get(slot).map_or(false, |s| s.is_some()));
        self.current = Some(slot);
    }

    /// The currently executing process. An empty registry here is a
    /// kernel invariant violation, not a recoverable error.
    pub fn current(&self) -> &Process {
        let slot = self.current.expect("no process to dispatch");
        &self.slots[slot].as_ref().unwrap().process
    }

    pub fn current_mut(&mut self) -> &mut Process {
        let slot = self.current.expect("no process to dispatch");
        &mut self.slots[slot].as_mut().unwrap().process
    }

    pub fn get(&self, slot: usize) -> Option<&Process> {
        self.slots.get(slot)?.as_ref().map(|s| &s.process)
    }

    pub fn get_mut(&mut self, slot: usize) -> Option<&mut Process> {
        self.slots.get_mut(slot)?.as_mut().map(|s| &mut s.process)
    }

    /// Mutable access to two distinct processes at once (pipe
    /// transfers between peer address spaces).
    pub fn pair_mut(&mut self, a: usize, b: usize) -> (&mut Process, &mut Process) {
        assert_ne!(a, b, "pair_mut needs two distinct slots");
        let (low, high, swapped) = if a < b { (a, b, false) } else { (b, a, true) };
        let (left, right) = self.slots.split_at_mut(high);
        let first = &mut left[low].as_mut().unwrap().process;
        let second = &mut right[0].as_mut().unwrap().process;
        if swapped {
            (second, first)
        } else {
            (first, second)
        }
    }

    /// Unlink and return the process in `slot`. Removing the sole
    /// member empties the cursor.
    pub fn remove(&mut self, slot: usize) -> Process {
        let cell = self.slots[slot].take().expect("removing an empty slot");
        if cell.next == slot {
            self.current = None;
        } else {
            self.slots[cell.prev].as_mut().unwrap().next = cell.next;
            self.slots[cell.next].as_mut().unwrap().prev = cell.prev;
            if self.current == Some(slot) {
                self.current = Some(cell.next);
            }
        }
        cell.process
    }

    pub fn is_empty(&self) -> bool {
        self.current.is_none()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Indices of every occupied slot, in arena order. Used by scans
    /// (sleep expiry, keyboard delivery) that must visit everyone.
    pub fn occupied_slots(&self) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_some())
            .map(|(i, _)| i)
            .collect()
    }
}

lazy_static! {
    pub static ref PROCESS_TABLE: Mutex<ProcessTable> = Mutex::new(ProcessTable::new());
}

pub fn init() {
    let _ = PROCESS_TABLE.lock();
    crate::log_info!("Process table initialized; cooperative round-robin scheduling.");
}

// ──────────────────────────────────────────────────────────────
//  Spawn — build a fresh process from a loader segment list
// ──────────────────────────────────────────────────────────────

/// A segment as handed over by the executable loader.
pub struct LoadSegment<'a> {
    pub vaddr: u64,
    pub mem_size: usize,
    pub data: &'a [u8],
    pub flags: SegmentFlags,
}

/// Build a complete process image out of `segments`, add a user stack
/// with the classic argc/argv/auxv layout, and enqueue it as NEW.
pub fn spawn_into(
    table: &mut ProcessTable,
    path: &str,
    argv: &[&str],
    segments: &[LoadSegment],
    entry: u64,
    working_dir: &str,
) -> Result<ProcessId, MemoryError> {
    // Refuse anything that would land inside the kernel region.
    for segment in segments {
        if segment.vaddr < paging::USER_SPACE_START {
            return Err(MemoryError::BadAddress);
        }
    }

    let mut image = crate::memory::MemoryImage::new_user();
    for segment in segments {
        let source = if segment.data.is_empty() {
            None
        } else {
            Some(segment.data)
        };
        image.create_segment(segment.vaddr, segment.mem_size, segment.flags, source)?;

        // The writable data/bss segment defines the initial heap break.
        if segment.flags == SegmentFlags::READ | SegmentFlags::WRITE {
            let base = paging::page_align_down(segment.vaddr);
            let top = base + paging::page_round_up(segment.mem_size as u64);
            image.brk = top;
            image.actual_brk = top;
        }
    }
    image.lower_brk = MMAP_CEILING;

    // The user stack sits just below the lowest loaded segment.
    let mut stack_bottom = DEFAULT_STACK_BOTTOM;
    for segment in segments {
        if segment.vaddr < stack_bottom {
            stack_bottom = segment.vaddr;
        }
    }
    stack_bottom = paging::page_align_down(stack_bottom) - DEFAULT_STACK_SIZE as u64;
    if stack_bottom < paging::USER_SPACE_START {
        return Err(MemoryError::BadAddress);
    }
    image.create_segment(
        stack_bottom,
        DEFAULT_STACK_SIZE,
        SegmentFlags::READ | SegmentFlags::WRITE,
        None,
    )?;

    let stack_top = (stack_bottom + DEFAULT_STACK_SIZE as u64) & !0xF;
    let user_rsp = {
        let stack_segment = image
            .segments
            .iter_mut()
            .find(|s| s.virtual_base == stack_bottom)
            .unwrap();
        let backing = stack_segment.backing_mut().as_mut_slice();
        setup_initial_stack(argv, stack_top, stack_bottom, backing)
    };

    let pid = table.assign_pid();
    let process = Process {
        pid,
        path: String::from(path),
        working_dir: String::from(working_dir),
        image,
        saved_rsp: user_rsp,
        kernel_stack: alloc::vec![0u8; KERNEL_STACK_SIZE].into_boxed_slice(),
        entry,
        tls: alloc::vec![gdt::TlsDescriptor {
            base: stack_bottom,
            limit: 0xFF,
        }],
        tls_index: 0,
        files: crate::fs::fd::default_fd_table(),
        state: ProcessState::New,
        wait: None,
        argv: argv.iter().map(|a| String::from(*a)).collect(),
    };
    table.insert_after_current(process);
    Ok(pid)
}

/// Kernel-facing spawn against the global table.
pub fn spawn_new_process(
    path: &str,
    argv: &[&str],
    segments: &[LoadSegment],
    entry: u64,
    working_dir: &str,
) -> Result<ProcessId, MemoryError> {
    x86_64::instructions::interrupts::without_interrupts(|| {
        let mut table = PROCESS_TABLE.lock();
        spawn_into(&mut table, path, argv, segments, entry, working_dir)
    })
}

/// Lay out the initial user stack: argument strings at the top, then a
/// canary, the auxiliary vector (AT_RANDOM pointing at the canary),
/// a null envp, the argv pointer array and finally argc where the
/// entry code expects RSP to point.
fn setup_initial_stack(argv: &[&str], stack_top: u64, stack_base: u64, backing: &mut [u8]) -> u64 {
    let mut sp = stack_top;

    let mut write_bytes = |sp: u64, bytes: &[u8], backing: &mut [u8]| {
        let off = (sp - stack_base) as usize;
        backing[off..off + bytes.len()].copy_from_slice(bytes);
    };

    let mut string_addrs = Vec::with_capacity(argv.len());
    for arg in argv.iter().rev() {
        let len = arg.len() + 1;
        sp -= len as u64;
        write_bytes(sp, arg.as_bytes(), backing);
        write_bytes(sp + arg.len() as u64, &[0], backing);
        string_addrs.push(sp);
    }
    string_addrs.reverse();

    sp &= !0x7;
    sp -= 8;
    write_bytes(sp, &STACK_CANARY.to_le_bytes(), backing);
    let canary_addr = sp;

    // argc + argv pointers + argv null + envp null + 2 auxv pairs.
    let table_len = 8 + (argv.len() + 1 + 1) * 8 + 4 * 8;
    sp -= table_len as u64;
    sp &= !0xF;

    let mut cursor = sp;
    let mut push = |cursor: &mut u64, value: u64, backing: &mut [u8]| {
        write_bytes(*cursor, &value.to_le_bytes(), backing);
        *cursor += 8;
    };
    push(&mut cursor, argv.len() as u64, backing);
    for addr in &string_addrs {
        push(&mut cursor, *addr, backing);
    }
    push(&mut cursor, 0, backing); // argv terminator
    push(&mut cursor, 0, backing); // empty environment
    push(&mut cursor, AT_RANDOM, backing);
    push(&mut cursor, canary_addr, backing);
    push(&mut cursor, 0, backing); // AT_NULL
    push(&mut cursor, 0, backing);

    sp
}

// ──────────────────────────────────────────────────────────────
//  Dispatch — the run-to-block scheduling loop
// ──────────────────────────────────────────────────────────────

/// Enter the dispatch loop on a clean boot stack, abandoning whatever
/// kernel stack the caller was on.
#[unsafe(naked)]
unsafe extern "C" fn dispatch_entry() -> ! {
    core::arch::naked_asm!(
        "lea rsp, [rip + {stack}]",
        "add rsp, {size}",
        "and rsp, -16",
        "call {dispatch}",
        stack = sym crate::interrupts::gdt::BOOT_STACK,
        size = const gdt::BOOT_STACK_SIZE,
        dispatch = sym dispatch_loop,
    );
}

/// Re-enter the scheduler without a process context to resume.
pub fn dispatch() -> ! {
    unsafe { dispatch_entry() }
}

/// Initial entry from `_start` once everything is initialized.
pub fn run() -> ! {
    dispatch()
}

extern "C" fn dispatch_loop() -> ! {
    use x86_64::instructions::interrupts;
    interrupts::disable();

    loop {
        let mut table = PROCESS_TABLE.lock();
        if table.is_empty() {
            drop(table);
            // Nothing will ever run again: idle terminal state.
            loop {
                x86_64::instructions::hlt();
            }
        }

        let slot = table.current_slot().unwrap();
        match table.current().state {
            ProcessState::Stopped => {
                table.advance();
                let dead = table.remove(slot);
                drop(table);
                crate::log_info!("Reaped process {} ({}).", dead.pid.0, dead.path);
                drop(dead);
            }
            ProcessState::Runnable => {
                let current = table.current();
                let saved_rsp = current.saved_rsp;
                let kernel_stack_top = current.kernel_stack_top();
                let tls = current.active_tls();
                let root = current.image.space.root_phys();
                gdt::set_tls(tls);
                paging::set_active_address_space(root);
                drop(table);
                // Leaves kernel code; control only comes back through a
                // future interrupt or syscall on this process's behalf.
                unsafe { context::restore_context(saved_rsp, kernel_stack_top) }
            }
            ProcessState::New => {
                let current = table.current_mut();
                current.state = ProcessState::Runnable;
                let entry = current.entry;
                let user_rsp = current.saved_rsp;
                let kernel_stack_top = current.kernel_stack_top();
                let tls = current.active_tls();
                let root = current.image.space.root_phys();
                gdt::set_tls(tls);
                gdt::set_tss_rsp0(kernel_stack_top);
                paging::set_active_address_space(root);
                drop(table);
                unsafe { context::enter_user_mode(entry, user_rsp) }
            }
            ProcessState::Waiting => {
                // Scan forward for anyone runnable; a full lap means
                // everybody is blocked.
                let start = slot;
                loop {
                    table.advance();
                    let here = table.current_slot().unwrap();
                    if here == start || table.current().state != ProcessState::Waiting {
                        break;
                    }
                }
                if table.current().state == ProcessState::Waiting {
                    gdt::set_tss_rsp0(gdt::boot_stack_top());
                    drop(table);
                    // Halt until the next hardware interrupt, then
                    // re-evaluate the whole picture.
                    interrupts::enable_and_hlt();
                    interrupts::disable();
                }
            }
        }
    }
}

/// Timer callback: advance the clock, wake expired sleeps, and — only
/// when the interrupt took over user code — yield the rest of the
/// slice by advancing the cursor and re-entering dispatch.
pub fn on_tick(step: crate::time::TimeSpec, is_user: bool) {
    crate::time::tick(step);
    let now = crate::time::now();
    {
        let mut table = PROCESS_TABLE.lock();
        wait::wake_expired_sleepers(&mut table, now);
        if is_user {
            table.advance();
        }
    }
    if is_user {
        dispatch();
    }
}

/// Keyboard callback: hand buffered characters to whichever process is
/// blocked on a keyboard read.
pub fn on_key_event() {
    let mut table = PROCESS_TABLE.lock();
    wait::deliver_key(&mut table, crate::drivers::keyboard::pop_ascii);
}

/// Terminate the current process: mark it STOPPED and fall back into
/// the scheduler, which reaps it on the next pass. Transition to
/// STOPPED never happens implicitly.
pub fn exit_current() -> ! {
    x86_64::instructions::interrupts::disable();
    {
        let mut table = PROCESS_TABLE.lock();
        table.current_mut().state = ProcessState::Stopped;
    }
    dispatch()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::fs::fd::default_fd_table;
    use crate::memory::MemoryImage;

    pub(crate) fn bare_process(pid: u64) -> Process {
        Process {
            pid: ProcessId(pid),
            path: String::from("/bin/test"),
            working_dir: String::from("/"),
            image: MemoryImage::new_user(),
            saved_rsp: 0,
            kernel_stack: alloc::vec![0u8; KERNEL_STACK_SIZE].into_boxed_slice(),
            entry: 0,
            tls: alloc::vec![Default::default()],
            tls_index: 0,
            files: default_fd_table(),
            state: ProcessState::New,
            wait: None,
            argv: Vec::new(),
        }
    }

    pub(crate) fn spawn_bare(table: &mut ProcessTable) -> usize {
        let pid = table.assign_pid();
        table.insert_after_current(bare_process(pid.0))
    }

    fn visit_order(table: &mut ProcessTable, steps: usize) -> Vec<u64> {
        let mut order = Vec::new();
        for _ in 0..steps {
            order.push(table.current().pid.0);
            table.advance();
        }
        order
    }

    #[test]
    fn round_robin_visits_every_process_in_fixed_cyclic_order() {
        let mut table = ProcessTable::new();
        let a = spawn_bare(&mut table);
        spawn_bare(&mut table);
        spawn_bare(&mut table);
        table.set_current(a);
        for slot in table.occupied_slots() {
            table.get_mut(slot).unwrap().state = ProcessState::Runnable;
        }

        let order = visit_order(&mut table, 9);
        let first_lap = &order[0..3];
        assert_eq!(&order[3..6], first_lap);
        assert_eq!(&order[6..9], first_lap);
        // All three are visited.
        let mut sorted = first_lap.to_vec();
        sorted.sort_unstable();
        assert_eq!(sorted, alloc::vec![1, 2, 3]);
    }

    #[test]
    fn insert_goes_immediately_after_the_cursor() {
        let mut table = ProcessTable::new();
        spawn_bare(&mut table); // pid 1, becomes current
        spawn_bare(&mut table); // pid 2, after 1
        spawn_bare(&mut table); // pid 3, after 1 (before 2)

        assert_eq!(visit_order(&mut table, 3), alloc::vec![1, 3, 2]);
    }

    #[test]
    fn remove_relinks_the_ring() {
        let mut table = ProcessTable::new();
        spawn_bare(&mut table);
        let b = spawn_bare(&mut table);
        spawn_bare(&mut table);

        let removed = table.remove(b);
        assert_eq!(removed.pid.0, 2);
        assert_eq!(table.len(), 2);
        assert_eq!(visit_order(&mut table, 4), alloc::vec![1, 3, 1, 3]);
    }

    #[test]
    fn removing_the_sole_member_empties_the_registry() {
        let mut table = ProcessTable::new();
        let a = spawn_bare(&mut table);
        table.remove(a);
        assert!(table.is_empty());
        assert_eq!(table.current_slot(), None);
    }

    #[test]
    fn slots_are_reused_but_pids_are_not() {
        let mut table = ProcessTable::new();
        let a = spawn_bare(&mut table);
        spawn_bare(&mut table);
        table.advance();
        let removed = table.remove(a);
        assert_eq!(removed.pid.0, 1);

        let again = spawn_bare(&mut table);
        assert_eq!(again, a, "freed arena slot is reused");
        assert_eq!(table.get(again).unwrap().pid.0, 3, "pid is fresh");
    }

    #[test]
    #[should_panic(expected = "no process to dispatch")]
    fn current_on_an_empty_registry_is_fatal() {
        let table = ProcessTable::new();
        let _ = table.current();
    }

    #[test]
    fn spawn_builds_segments_stack_and_initial_state() {
        use crate::memory::user;

        let mut table = ProcessTable::new();
        let code = [0x90u8; 32];
        let segments = [
            LoadSegment {
                vaddr: 0x4004_8000,
                mem_size: 64,
                data: &code,
                flags: SegmentFlags::READ | SegmentFlags::EXEC,
            },
            LoadSegment {
                vaddr: 0x4005_0000,
                mem_size: 4096,
                data: &[],
                flags: SegmentFlags::READ | SegmentFlags::WRITE,
            },
        ];
        let pid = spawn_into(
            &mut table,
            "/bin/init",
            &["/bin/init", "-s"],
            &segments,
            0x4004_8000,
            "/",
        )
        .unwrap();
        assert_eq!(pid.0, 1);

        let process = table.current_mut();
        assert_eq!(process.state, ProcessState::New);
        assert_eq!(process.entry, 0x4004_8000);
        assert_eq!(process.image.brk, 0x4005_1000);
        assert_eq!(process.image.lower_brk, MMAP_CEILING);
        // Code, data and the synthesized stack segment.
        assert_eq!(process.image.segments.len(), 3);

        // The initial stack: rsp points at argc, then the argv
        // pointers, each referencing a NUL-terminated string.
        let rsp = process.saved_rsp;
        assert_eq!(rsp & 0xF, 0);
        let argc: u64 = user::read_user(&mut process.image, rsp).unwrap();
        assert_eq!(argc, 2);
        let argv0_ptr: u64 = user::read_user(&mut process.image, rsp + 8).unwrap();
        assert_eq!(
            user::read_user_string(&mut process.image, argv0_ptr).unwrap(),
            "/bin/init"
        );
        let argv1_ptr: u64 = user::read_user(&mut process.image, rsp + 16).unwrap();
        assert_eq!(
            user::read_user_string(&mut process.image, argv1_ptr).unwrap(),
            "-s"
        );
        let null_ptr: u64 = user::read_user(&mut process.image, rsp + 24).unwrap();
        assert_eq!(null_ptr, 0);

        // The AT_RANDOM auxv entry points at the canary.
        let aux_type: u64 = user::read_user(&mut process.image, rsp + 40).unwrap();
        let aux_val: u64 = user::read_user(&mut process.image, rsp + 48).unwrap();
        assert_eq!(aux_type, AT_RANDOM);
        let canary: u64 = user::read_user(&mut process.image, aux_val).unwrap();
        assert_eq!(canary, STACK_CANARY);
    }

    #[test]
    fn spawn_rejects_segments_inside_the_kernel_region() {
        let mut table = ProcessTable::new();
        let segments = [LoadSegment {
            vaddr: 0x10_0000,
            mem_size: 4096,
            data: &[],
            flags: SegmentFlags::READ | SegmentFlags::WRITE,
        }];
        assert_eq!(
            spawn_into(&mut table, "/bin/bad", &[], &segments, 0x10_0000, "/"),
            Err(MemoryError::BadAddress)
        );
    }
}
