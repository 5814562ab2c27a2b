use lazy_static::lazy_static;
use multiboot2::{MemoryArea, MemoryAreaType};
use spin::Mutex;
use x86_64::{
    structures::paging::{FrameAllocator, PhysFrame, Size4KiB},
    PhysAddr,
};

/// Frames below this are left to the kernel image and legacy regions.
const LOW_MEMORY_CUTOFF: u64 = 0x100_0000;

/// A simple bump allocator over the largest usable physical region.
pub struct BumpFrameAllocator {
    next_free_frame: PhysFrame,
    current_limit: PhysFrame,
}

impl BumpFrameAllocator {
    pub fn new() -> Self {
        BumpFrameAllocator {
            next_free_frame: PhysFrame::containing_address(PhysAddr::new(0)),
            current_limit: PhysFrame::containing_address(PhysAddr::new(0)),
        }
    }

    /// Point the allocator at the largest available area of the boot
    /// memory map, skipping low memory.
    pub unsafe fn init(&mut self, areas: &[MemoryArea]) {
        let mut best: Option<(u64, u64)> = None;
        for area in areas {
            if MemoryAreaType::from(area.typ()) != MemoryAreaType::Available {
                continue;
            }
            let start = area.start_address().max(LOW_MEMORY_CUTOFF);
            let end = area.end_address();
            if end <= start {
                continue;
            }
            if best.map_or(true, |(s, e)| end - start > e - s) {
                best = Some((start, end));
            }
        }

        let (start, end) = best.expect("no usable physical memory area");
        self.next_free_frame = PhysFrame::containing_address(PhysAddr::new(start));
        self.current_limit = PhysFrame::containing_address(PhysAddr::new(end - 1));
    }

    /// Reserve `count` consecutive frames; only possible while the
    /// allocator is still contiguous (used once, for the heap).
    pub fn allocate_contiguous(&mut self, count: usize) -> Option<PhysFrame> {
        let first = self.next_free_frame;
        let last = first + count as u64 - 1;
        if last > self.current_limit {
            return None;
        }
        self.next_free_frame = last + 1;
        Some(first)
    }
}

unsafe impl FrameAllocator<Size4KiB> for BumpFrameAllocator {
    fn allocate_frame(&mut self) -> Option<PhysFrame> {
        if self.next_free_frame <= self.current_limit {
            let frame = self.next_free_frame;
            self.next_free_frame += 1;
            Some(frame)
        } else {
            None
        }
    }
}

lazy_static! {
    pub static ref FRAME_ALLOCATOR: Mutex<BumpFrameAllocator> =
        Mutex::new(BumpFrameAllocator::new());
}
