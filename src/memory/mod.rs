pub mod allocator;
pub mod frame_allocator;
pub mod mapping;
pub mod paging;
pub mod segment;
pub mod user;

use alloc::vec::Vec;

pub use mapping::FileMapping;
pub use paging::{AddressSpace, PAGE_SIZE, USER_SPACE_START};
pub use segment::{Segment, SegmentFlags};

/// Default user stack placement, matching the classic layout the
/// original userland is linked against.
pub const DEFAULT_STACK_BOTTOM: u64 = 0xC000_0000;
pub const DEFAULT_STACK_SIZE: usize = 0x10000;

/// Top of the mmap region; anonymous and file mappings grow downward
/// from here toward the heap.
pub const MMAP_CEILING: u64 = 0xB000_0000;

/// Errors the memory managers report up to the syscall layer. Anything
/// not representable here (out of physical memory, corrupt tables) is a
/// kernel panic instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryError {
    Overlap,
    NoSuchSegment,
    NoSuchMapping,
    BadAddress,
}

/// One process's memory: the owned address space plus the segment and
/// mapping tables describing what backs it. The segment and mapping
/// managers are implemented as impl blocks in their own modules.
pub struct MemoryImage {
    pub space: AddressSpace,
    pub segments: Vec<Segment>,
    pub mappings: Vec<FileMapping>,
    /// Heap top as user code sees it.
    pub brk: u64,
    /// Page-rounded top of what is actually backed.
    pub actual_brk: u64,
    /// Floor of the mmap region (grows downward).
    pub lower_brk: u64,
}

impl MemoryImage {
    pub fn new_user() -> MemoryImage {
        MemoryImage {
            space: AddressSpace::new_user(),
            segments: Vec::new(),
            mappings: Vec::new(),
            brk: 0,
            actual_brk: 0,
            lower_brk: MMAP_CEILING,
        }
    }

    pub fn translate(&self, vaddr: u64) -> Option<u64> {
        self.space.translate(vaddr)
    }
}

/// Boot-time memory bring-up: physical frame accounting from the
/// multiboot2 map, then the kernel heap, then the paging globals.
pub fn init(multiboot_info_addr: usize) {
    let boot_info = unsafe {
        multiboot2::BootInformation::load(multiboot_info_addr as *const _)
            .expect("Failed to load Multiboot2 info!")
    };
    let memory_map_tag = boot_info.memory_map_tag().expect("Memory map tag required");

    let mut allocator = frame_allocator::FRAME_ALLOCATOR.lock();
    unsafe { allocator.init(memory_map_tag.memory_areas()) };
    crate::log_info!("Physical memory frame allocator initialized from Multiboot2 map.");

    // The bootloader identity-maps low RAM, so the heap frames are
    // directly addressable once reserved.
    let heap_start = allocator
        .allocate_contiguous(allocator::HEAP_SIZE / PAGE_SIZE)
        .expect("not enough physical memory for the kernel heap");
    unsafe { allocator::init_heap(heap_start.start_address().as_u64(), allocator::HEAP_SIZE) };
    crate::log_info!("Heap allocator initialized ({} KiB).", allocator::HEAP_SIZE / 1024);

    unsafe { paging::init() };
    crate::log_info!("Virtual memory paging subsystem initialized.");
}
