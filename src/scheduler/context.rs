use core::sync::atomic::{AtomicU8, Ordering};

/// Whether the CPU has SSE + FXSAVE, probed once at boot. Read from
/// naked interrupt stubs, hence a plain byte.
pub static FPU_STATE: AtomicU8 = AtomicU8::new(0);

pub fn fpu_enabled() -> bool {
    FPU_STATE.load(Ordering::Relaxed) != 0
}

/// Probe for SSE/FXSAVE and turn the relevant CR0/CR4 bits on. Must run
/// before the first context switch so that every saved frame has a
/// consistent shape.
pub fn init_fpu() {
    let features = unsafe { core::arch::x86_64::__cpuid(1) };
    let has_sse = features.edx & (1 << 25) != 0;
    let has_fxsr = features.edx & (1 << 24) != 0;
    if !(has_sse && has_fxsr) {
        crate::log_warn!("CPU lacks SSE/FXSAVE; FPU state will not be preserved.");
        return;
    }

    use x86_64::registers::control::{Cr0, Cr0Flags, Cr4, Cr4Flags};
    unsafe {
        let mut cr0 = Cr0::read();
        cr0.remove(Cr0Flags::EMULATE_COPROCESSOR);
        cr0.insert(Cr0Flags::MONITOR_COPROCESSOR);
        Cr0::write(cr0);

        let mut cr4 = Cr4::read();
        cr4.insert(Cr4Flags::OSFXSR | Cr4Flags::OSXMMEXCPT_ENABLE);
        Cr4::write(cr4);
    }

    FPU_STATE.store(1, Ordering::SeqCst);
    crate::log_info!("SSE enabled; FPU state saved across context switches.");
}

/// The general-purpose register image an interrupt entry pushes, laid
/// out exactly as the stub leaves it on the kernel stack, followed by
/// the CPU's own interrupt frame.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SavedRegisters {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rax: u64,
    // Pushed by the CPU on interrupt entry:
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

/// Resolve the register image behind a saved stack pointer. When the
/// FPU block is in the frame, the first slot is the pre-save stack
/// pointer and the registers sit behind it.
pub fn saved_frame_ptr(saved_rsp: u64) -> *mut SavedRegisters {
    let mut rsp = saved_rsp;
    if fpu_enabled() {
        rsp = unsafe { *(rsp as *const u64) };
    }
    rsp as *mut SavedRegisters
}

/// Generate the naked ISR stub for one interrupt vector: push the GPR
/// image, conditionally save the FPU block (pushing the pre-save stack
/// pointer so restore is symmetric), then hand the saved stack pointer
/// and the type-specific handler to `on_interrupt_entry`.
macro_rules! interrupt_entry {
    ($asm_name:ident, $handler:path) => {
        #[unsafe(naked)]
        pub extern "C" fn $asm_name() {
            core::arch::naked_asm!(
                "push rax",
                "push rcx",
                "push rdx",
                "push rbx",
                "push rbp",
                "push rsi",
                "push rdi",
                "push r8",
                "push r9",
                "push r10",
                "push r11",
                "push r12",
                "push r13",
                "push r14",
                "push r15",
                "mov al, byte ptr [rip + {fpu}]",
                "test al, al",
                "jz 2f",
                "mov rcx, rsp",
                "and rsp, -16",
                "sub rsp, 512",
                "fxsave64 [rsp]",
                "push rcx",
                "2:",
                "mov rdi, rsp",
                "lea rsi, [rip + {handler}]",
                "and rsp, -16",
                "call {entry}",
                fpu = sym $crate::scheduler::context::FPU_STATE,
                handler = sym $handler,
                entry = sym $crate::scheduler::context::on_interrupt_entry,
            );
        }
    };
}
pub(crate) use interrupt_entry;

/// Common entry half of the context-switch protocol. Classifies the
/// interrupted code as user or kernel by where the saved stack pointer
/// lives, switches to the kernel's own page table before reading any
/// state (the interrupted process's tables may legally be torn down
/// while the handler runs), records the suspension point in the PCB,
/// and runs the type-specific handler. If the handler comes back, the
/// interrupted context is resumed exactly where it left off.
pub extern "C" fn on_interrupt_entry(saved_rsp: u64, handler: extern "C" fn(bool)) -> ! {
    use crate::interrupts::gdt;
    use crate::memory::paging;

    let is_user = !gdt::is_kernel_stack(saved_rsp);
    let (restore_root, kernel_stack_top) = if is_user {
        paging::activate_kernel_space();
        let mut table = super::PROCESS_TABLE.lock();
        let current = table.current_mut();
        current.saved_rsp = saved_rsp;
        let root = current.image.space.root_phys();
        let top = current.kernel_stack_top();
        (root, top)
    } else {
        (0, gdt::boot_stack_top())
    };

    handler(is_user);

    if restore_root != 0 {
        paging::set_active_address_space(restore_root);
    }
    unsafe { restore_context(saved_rsp, kernel_stack_top) }
}

/// Exit half of the protocol: install the target kernel stack in the
/// TSS, then unwind the saved frame. The iretq re-enables interrupts
/// atomically through the restored RFLAGS, never earlier.
///
/// # Safety
/// `saved_rsp` must point at a frame produced by an `interrupt_entry!`
/// stub (or fabricated to the same layout), on a stack that stays alive.
pub unsafe fn restore_context(saved_rsp: u64, kernel_stack_top: u64) -> ! {
    crate::interrupts::gdt::set_tss_rsp0(kernel_stack_top);
    restore_registers(saved_rsp)
}

#[unsafe(naked)]
unsafe extern "C" fn restore_registers(saved_rsp: u64) -> ! {
    core::arch::naked_asm!(
        "mov rsp, rdi",
        "mov al, byte ptr [rip + {fpu}]",
        "test al, al",
        "jz 2f",
        "pop rcx",
        "fxrstor64 [rsp]",
        "mov rsp, rcx",
        "2:",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop r11",
        "pop r10",
        "pop r9",
        "pop r8",
        "pop rdi",
        "pop rsi",
        "pop rbp",
        "pop rbx",
        "pop rdx",
        "pop rcx",
        "pop rax",
        "iretq",
        fpu = sym FPU_STATE,
    );
}

/// First-entry transfer into Ring 3: build an iretq frame for the user
/// code/stack segments and jump. RFLAGS carries IF so interrupts come
/// back on as part of the iretq itself.
///
/// # Safety
/// `entry` and `user_stack_top` must be valid in the active address
/// space; the TSS and TLS must already be set for the target process.
pub unsafe fn enter_user_mode(entry: u64, user_stack_top: u64) -> ! {
    use crate::interrupts::gdt;
    let cs = gdt::user_code_selector().0 as u64;
    let ss = gdt::user_data_selector().0 as u64;
    core::arch::asm!(
        "mov ds, dx",
        "mov es, dx",
        "push rdx",      // SS
        "push rcx",      // user RSP
        "push 0x202",    // RFLAGS (IF set)
        "push rax",      // CS
        "push rdi",      // RIP
        "iretq",
        in("rdi") entry,
        in("rcx") user_stack_top,
        in("rdx") ss,
        in("rax") cs,
        options(noreturn),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn saved_register_layout_matches_the_stub_push_order() {
        assert_eq!(core::mem::size_of::<SavedRegisters>(), 20 * 8);
        assert_eq!(core::mem::offset_of!(SavedRegisters, r15), 0);
        assert_eq!(core::mem::offset_of!(SavedRegisters, rax), 14 * 8);
        assert_eq!(core::mem::offset_of!(SavedRegisters, rip), 15 * 8);
        assert_eq!(core::mem::offset_of!(SavedRegisters, ss), 19 * 8);
    }

    #[test]
    fn saved_frame_ptr_is_identity_without_fpu() {
        // Host tests never enable the FPU flag, so the frame pointer is
        // the saved stack pointer itself.
        assert!(!fpu_enabled());
        let frame = [0u64; 20];
        let rsp = frame.as_ptr() as u64;
        assert_eq!(saved_frame_ptr(rsp) as u64, rsp);
    }
}
