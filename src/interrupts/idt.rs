use super::gdt;
use crate::scheduler::context::interrupt_entry;
use crate::{log_error, println};
use lazy_static::lazy_static;
use pic8259::ChainedPics;
use spin::Mutex;
use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode};
use x86_64::VirtAddr;

pub const PIC_1_OFFSET: u8 = 32;
pub const PIC_2_OFFSET: u8 = PIC_1_OFFSET + 8;

pub const SYSCALL_VECTOR: u8 = 0x80;

pub static PICS: Mutex<ChainedPics> =
    Mutex::new(unsafe { ChainedPics::new(PIC_1_OFFSET, PIC_2_OFFSET) });

#[derive(Debug, Clone, Copy)]
#[repr(u8)]
pub enum InterruptIndex {
    Timer = PIC_1_OFFSET,
    Keyboard = PIC_1_OFFSET + 1,
}

impl InterruptIndex {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    fn as_usize(self) -> usize {
        usize::from(self.as_u8())
    }
}

// ISR stubs that run the full context-switch protocol: save the
// register image (plus FPU block), classify user/kernel, then run the
// handler named here.
interrupt_entry!(timer_interrupt_entry, crate::drivers::pit::timer_interrupt);
interrupt_entry!(
    keyboard_interrupt_entry,
    crate::drivers::keyboard::keyboard_interrupt
);
interrupt_entry!(syscall_interrupt_entry, crate::syscalls::syscall_interrupt);

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();
        idt.breakpoint.set_handler_fn(breakpoint_handler);
        unsafe {
            idt.double_fault
                .set_handler_fn(double_fault_handler)
                .set_stack_index(gdt::DOUBLE_FAULT_IST_INDEX);
        }
        idt.page_fault.set_handler_fn(page_fault_handler);
        idt.general_protection_fault
            .set_handler_fn(general_protection_fault_handler);
        unsafe {
            idt[InterruptIndex::Timer.as_usize()]
                .set_handler_addr(VirtAddr::new(timer_interrupt_entry as *const () as u64));
            idt[InterruptIndex::Keyboard.as_usize()]
                .set_handler_addr(VirtAddr::new(keyboard_interrupt_entry as *const () as u64));
            idt[SYSCALL_VECTOR as usize]
                .set_handler_addr(VirtAddr::new(syscall_interrupt_entry as *const () as u64))
                .set_privilege_level(x86_64::PrivilegeLevel::Ring3);
        }
        idt
    };
}

pub fn init() {
    IDT.load();
}

extern "x86-interrupt" fn breakpoint_handler(stack_frame: InterruptStackFrame) {
    println!("EXCEPTION: BREAKPOINT\n{:#?}", stack_frame);
}

extern "x86-interrupt" fn double_fault_handler(
    stack_frame: InterruptStackFrame,
    _error_code: u64,
) -> ! {
    panic!("EXCEPTION: DOUBLE FAULT\n{:#?}", stack_frame);
}

/// Page faults are first offered to the Mapping Manager: a fault inside
/// one of the current process's file mappings is demand paging, not an
/// error. Anything else is an access violation — fatal for the kernel,
/// fatal only to the faulting process for user code.
extern "x86-interrupt" fn page_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: PageFaultErrorCode,
) {
    use x86_64::registers::control::Cr2;
    let fault_addr = Cr2::read().as_u64();
    let from_user = error_code.contains(PageFaultErrorCode::USER_MODE);

    let resolved = {
        let mut table = crate::scheduler::PROCESS_TABLE.lock();
        if table.current_slot().is_some() {
            table.current_mut().image.resolve_fault(fault_addr)
        } else {
            false
        }
    };
    if resolved {
        return;
    }

    if from_user {
        let pid = crate::scheduler::PROCESS_TABLE.lock().current().pid;
        log_error!(
            "Segmentation fault: PID {} at {:#x} ({:?})",
            pid.0,
            fault_addr,
            error_code
        );
        crate::scheduler::exit_current();
    }

    panic!(
        "KERNEL PAGE FAULT at {:#x}\nError Code: {:?}\n{:#?}",
        fault_addr, error_code, stack_frame
    );
}

extern "x86-interrupt" fn general_protection_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: u64,
) {
    // A ring-3 protection violation takes down the process, not the
    // kernel.
    let from_user = stack_frame.code_segment & 0x3 == 3;
    if from_user {
        let pid = crate::scheduler::PROCESS_TABLE.lock().current().pid;
        log_error!("General protection fault: PID {} (error {:#x})", pid.0, error_code);
        crate::scheduler::exit_current();
    }
    panic!(
        "EXCEPTION: GENERAL PROTECTION FAULT\nError Code: {error_code}\n{:#?}",
        stack_frame
    );
}
