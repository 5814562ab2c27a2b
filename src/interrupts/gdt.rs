use lazy_static::lazy_static;
use x86_64::structures::gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector};
use x86_64::structures::tss::TaskStateSegment;
use x86_64::VirtAddr;

pub const DOUBLE_FAULT_IST_INDEX: u16 = 0;

/// The boot stack. The kernel runs on it from `_start` until the first
/// process is dispatched, the dispatch loop resets onto it, and it is
/// what an interrupt lands on when the kernel itself (idle halt,
/// dispatch loop) is interrupted. The context-switch entry classifies
/// "was the interrupted code user or kernel" by asking whether the
/// saved stack pointer lies inside this region.
pub const BOOT_STACK_SIZE: usize = 4096 * 5;
pub static mut BOOT_STACK: [u8; BOOT_STACK_SIZE] = [0; BOOT_STACK_SIZE];

/// Double-fault handler stack (IST), so a corrupt RSP can't take down
/// the fault path too.
const DF_STACK_SIZE: usize = 4096 * 5;
static mut DF_STACK: [u8; DF_STACK_SIZE] = [0; DF_STACK_SIZE];

lazy_static! {
    static ref TSS: TaskStateSegment = {
        let mut tss = TaskStateSegment::new();

        tss.interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize] = {
            let stack_start = VirtAddr::from_ptr(unsafe { &raw const DF_STACK });
            stack_start + DF_STACK_SIZE as u64
        };

        // RSP0 starts out as the boot stack; the scheduler installs the
        // current process's kernel stack here on every dispatch.
        tss.privilege_stack_table[0] = VirtAddr::new(boot_stack_top());

        tss
    };
}

lazy_static! {
    pub static ref GDT: (GlobalDescriptorTable, Selectors) = {
        let mut gdt = GlobalDescriptorTable::new();
        let kernel_code = gdt.add_entry(Descriptor::kernel_code_segment());
        let kernel_data = gdt.add_entry(Descriptor::kernel_data_segment());
        let user_data   = gdt.add_entry(Descriptor::user_data_segment());
        let user_code   = gdt.add_entry(Descriptor::user_code_segment());
        let tss         = gdt.add_entry(Descriptor::tss_segment(&TSS));
        (gdt, Selectors {
            kernel_code,
            kernel_data,
            user_code,
            user_data,
            tss,
        })
    };
}

pub struct Selectors {
    pub kernel_code: SegmentSelector,
    pub kernel_data: SegmentSelector,
    pub user_code: SegmentSelector,
    pub user_data: SegmentSelector,
    pub tss: SegmentSelector,
}

pub fn init() {
    use x86_64::instructions::segmentation::{Segment, CS, DS, SS};
    use x86_64::instructions::tables::load_tss;

    GDT.0.load();
    unsafe {
        CS::set_reg(GDT.1.kernel_code);
        DS::set_reg(GDT.1.kernel_data);
        SS::set_reg(GDT.1.kernel_data);
        load_tss(GDT.1.tss);
    }
}

/// User code segment selector with RPL=3, for iretq frames.
pub fn user_code_selector() -> SegmentSelector {
    SegmentSelector::new(GDT.1.user_code.index(), x86_64::PrivilegeLevel::Ring3)
}

/// User data segment selector with RPL=3.
pub fn user_data_selector() -> SegmentSelector {
    SegmentSelector::new(GDT.1.user_data.index(), x86_64::PrivilegeLevel::Ring3)
}

/// Install a process's kernel stack into TSS.RSP0 so the CPU switches
/// onto it when an interrupt arrives from Ring 3.
pub fn set_tss_rsp0(kernel_stack_top: u64) {
    unsafe {
        // Cast away the const-ness of the lazy_static TSS reference.
        // Only called with interrupts disabled during dispatch, and the
        // CPU reads this structure asynchronously.
        let tss_ptr = &*TSS as *const TaskStateSegment as *mut TaskStateSegment;
        (*tss_ptr).privilege_stack_table[0] = VirtAddr::new(kernel_stack_top);
    }
}

pub fn boot_stack_top() -> u64 {
    let base = unsafe { &raw const BOOT_STACK } as *const u8 as u64;
    (base + BOOT_STACK_SIZE as u64) & !0xF
}

/// Whether a saved stack pointer belongs to the kernel's own (boot)
/// stack region, i.e. the interrupt arrived while kernel code ran.
pub fn is_kernel_stack(rsp: u64) -> bool {
    let base = unsafe { &raw const BOOT_STACK } as *const u8 as u64;
    rsp > base && rsp <= base + BOOT_STACK_SIZE as u64
}

/// One per-process thread-local-storage descriptor. The original i386
/// design kept these as GDT data segments; on x86_64 the active
/// descriptor is realized through the FS segment base.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TlsDescriptor {
    pub base: u64,
    pub limit: u32,
}

/// Make `descriptor` the live TLS by pointing the FS base at it.
pub fn set_tls(descriptor: TlsDescriptor) {
    use x86_64::registers::model_specific::FsBase;
    FsBase::write(VirtAddr::new(descriptor.base));
}
