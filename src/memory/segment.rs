use super::paging::{page_align_down, page_round_up, PAGE_SIZE};
use super::{MemoryError, MemoryImage};
use bitflags::bitflags;
use core::ptr::NonNull;
use x86_64::structures::paging::PageTableFlags;

bitflags! {
    /// Segment permissions, numerically identical to ELF p_flags so the
    /// loader can pass them straight through.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SegmentFlags: u32 {
        const EXEC  = 0x1;
        const WRITE = 0x2;
        const READ  = 0x4;
    }
}

/// Owned, page-aligned, zero-initialized physical backing for one
/// segment. Dropping it returns the pages to the heap.
pub struct PageRegion {
    ptr: NonNull<u8>,
    len: usize,
}

impl PageRegion {
    /// Allocate `len` (page-multiple) zeroed bytes. Exhausting physical
    /// memory here is fatal; there is no recoverable OOM path.
    pub fn new_zeroed(len: usize) -> PageRegion {
        let layout = core::alloc::Layout::from_size_align(len, PAGE_SIZE)
            .expect("invalid segment layout");
        let ptr = unsafe { alloc::alloc::alloc_zeroed(layout) };
        let Some(ptr) = NonNull::new(ptr) else {
            panic!("out of physical memory");
        };
        PageRegion { ptr, len }
    }

    pub fn addr(&self) -> u64 {
        self.ptr.as_ptr() as u64
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { core::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for PageRegion {
    fn drop(&mut self) {
        let layout = core::alloc::Layout::from_size_align(self.len, PAGE_SIZE)
            .expect("invalid segment layout");
        unsafe { alloc::alloc::dealloc(self.ptr.as_ptr(), layout) };
    }
}

// The backing is exclusively owned and only reached through the owning
// process (or the kernel on its behalf).
unsafe impl Send for PageRegion {}

/// One contiguous virtual range with uniform permissions and its own
/// physical backing.
pub struct Segment {
    pub virtual_base: u64,
    pub size: usize,
    pub alloc_size: usize,
    pub flags: SegmentFlags,
    backing: PageRegion,
}

impl Segment {
    /// Page-aligned start of the mapped range.
    pub fn page_base(&self) -> u64 {
        page_align_down(self.virtual_base)
    }

    pub fn backing(&self) -> &PageRegion {
        &self.backing
    }

    pub fn backing_mut(&mut self) -> &mut PageRegion {
        &mut self.backing
    }

    pub fn contains(&self, vaddr: u64) -> bool {
        vaddr >= self.page_base() && vaddr < self.page_base() + self.alloc_size as u64
    }

    fn overlaps(&self, page_base: u64, alloc_size: usize) -> bool {
        let a0 = self.page_base();
        let a1 = a0 + self.alloc_size as u64;
        let b0 = page_base;
        let b1 = page_base + alloc_size as u64;
        a0 < b1 && b0 < a1
    }
}

fn pte_flags(flags: SegmentFlags) -> PageTableFlags {
    let mut pte = PageTableFlags::PRESENT | PageTableFlags::USER_ACCESSIBLE;
    if flags.contains(SegmentFlags::WRITE) {
        pte |= PageTableFlags::WRITABLE;
    }
    pte
}

impl MemoryImage {
    /// Create a segment covering `[virtual_base, virtual_base+size)`.
    /// The backing is rounded out to whole pages, zero-filled, seeded
    /// from `source` if given, and mapped with the requested
    /// permissions. Overlapping an existing segment is refused.
    pub fn create_segment(
        &mut self,
        virtual_base: u64,
        size: usize,
        flags: SegmentFlags,
        source: Option<&[u8]>,
    ) -> Result<(), MemoryError> {
        let page_offset = (virtual_base & (PAGE_SIZE as u64 - 1)) as usize;
        let alloc_size = page_round_up((size + page_offset) as u64) as usize;
        let page_base = page_align_down(virtual_base);

        if self.segments.iter().any(|s| s.overlaps(page_base, alloc_size)) {
            return Err(MemoryError::Overlap);
        }

        let mut backing = PageRegion::new_zeroed(alloc_size);
        if let Some(bytes) = source {
            let len = bytes.len().min(size);
            backing.as_mut_slice()[page_offset..page_offset + len].copy_from_slice(&bytes[..len]);
        }

        self.space
            .map_range(backing.addr(), page_base, alloc_size, pte_flags(flags));

        self.segments.push(Segment {
            virtual_base,
            size,
            alloc_size,
            flags,
            backing,
        });
        Ok(())
    }

    /// Install an already-populated, correctly sized backing as a
    /// segment (the fork deep-copy path). Same overlap rules as
    /// `create_segment`.
    pub(crate) fn insert_segment_with_backing(
        &mut self,
        virtual_base: u64,
        size: usize,
        flags: SegmentFlags,
        backing: PageRegion,
    ) -> Result<(), MemoryError> {
        let page_base = page_align_down(virtual_base);
        let alloc_size = backing.len();
        if self.segments.iter().any(|s| s.overlaps(page_base, alloc_size)) {
            return Err(MemoryError::Overlap);
        }
        self.space
            .map_range(backing.addr(), page_base, alloc_size, pte_flags(flags));
        self.segments.push(Segment {
            virtual_base,
            size,
            alloc_size,
            flags,
            backing,
        });
        Ok(())
    }

    /// Tear down the segment whose virtual base equals `virtual_base`:
    /// clear its page-table entries and free the physical backing.
    pub fn destroy_segment(&mut self, virtual_base: u64) -> Result<(), MemoryError> {
        let index = self
            .segments
            .iter()
            .position(|s| s.virtual_base == virtual_base)
            .ok_or(MemoryError::NoSuchSegment)?;
        let segment = self.segments.remove(index);
        self.space
            .unmap_range(segment.page_base(), segment.alloc_size);
        Ok(())
    }

    /// Move the heap break. Growing synthesizes a fresh RW segment over
    /// exactly the grown range; shrinking is not supported and leaves
    /// the backing in place.
    pub fn grow_break(&mut self, new_brk: u64) -> Result<u64, MemoryError> {
        if new_brk == 0 {
            return Ok(self.brk);
        }

        // A break can only exist above the kernel region; an image that
        // never had a writable segment has nothing to grow from.
        if self.actual_brk < super::USER_SPACE_START {
            return Err(MemoryError::BadAddress);
        }

        self.brk = new_brk;
        if new_brk > self.actual_brk {
            let grow = (new_brk - self.actual_brk) as usize;
            let base = self.actual_brk;
            self.create_segment(base, grow, SegmentFlags::READ | SegmentFlags::WRITE, None)?;
            // create_segment page-rounds; account the same way.
            self.actual_brk += page_round_up(grow as u64);
        }
        Ok(new_brk)
    }

    pub fn find_segment(&self, vaddr: u64) -> Option<&Segment> {
        self.segments.iter().find(|s| s.contains(vaddr))
    }
}

#[cfg(test)]
mod tests {
    use super::super::MemoryImage;
    use super::*;

    fn rw() -> SegmentFlags {
        SegmentFlags::READ | SegmentFlags::WRITE
    }

    #[test]
    fn create_maps_and_seeds_content() {
        let mut image = MemoryImage::new_user();
        image
            .create_segment(0x4004_8000, 8192, rw(), Some(b"hello"))
            .unwrap();

        let phys = image.translate(0x4004_8000).expect("mapped");
        let bytes = unsafe { core::slice::from_raw_parts(phys as *const u8, 5) };
        assert_eq!(bytes, b"hello");
        // Tail is zero-filled.
        assert_eq!(image.translate(0x4004_9000).is_some(), true);
    }

    #[test]
    fn overlapping_segments_are_refused() {
        let mut image = MemoryImage::new_user();
        image.create_segment(0x4004_8000, 8192, rw(), None).unwrap();
        assert_eq!(
            image.create_segment(0x4004_9000, 4096, rw(), None),
            Err(MemoryError::Overlap)
        );
        // Adjacent is fine.
        image.create_segment(0x4004_A000, 4096, rw(), None).unwrap();
    }

    #[test]
    fn no_two_segments_intersect_after_mixed_operations() {
        let mut image = MemoryImage::new_user();
        image.create_segment(0x4004_8000, 0x3000, rw(), None).unwrap();
        image.create_segment(0x4010_0000, 0x1000, rw(), None).unwrap();
        image.actual_brk = 0x4004_B000;
        image.brk = 0x4004_B000;
        image.grow_break(0x4004_D800).unwrap();
        image.destroy_segment(0x4010_0000).unwrap();
        image.create_segment(0x4010_0000, 0x2000, rw(), None).unwrap();

        for (i, a) in image.segments.iter().enumerate() {
            for b in image.segments.iter().skip(i + 1) {
                assert!(
                    !a.overlaps(b.page_base(), b.alloc_size),
                    "segments {:#x} and {:#x} intersect",
                    a.virtual_base,
                    b.virtual_base
                );
            }
        }
    }

    #[test]
    fn destroy_clears_translations() {
        let mut image = MemoryImage::new_user();
        image.create_segment(0x4004_8000, 4096, rw(), None).unwrap();
        assert!(image.translate(0x4004_8000).is_some());
        image.destroy_segment(0x4004_8000).unwrap();
        assert!(image.translate(0x4004_8000).is_none());
        assert_eq!(
            image.destroy_segment(0x4004_8000),
            Err(MemoryError::NoSuchSegment)
        );
    }

    #[test]
    fn grow_break_is_grow_only() {
        let mut image = MemoryImage::new_user();
        image.create_segment(0x4004_8000, 4096, rw(), None).unwrap();
        image.brk = 0x4004_9000;
        image.actual_brk = 0x4004_9000;

        assert_eq!(image.grow_break(0x4004_9800).unwrap(), 0x4004_9800);
        assert_eq!(image.actual_brk, 0x4004_A000);
        assert!(image.translate(0x4004_9800).is_some());

        // Shrinking reports the new break but releases nothing.
        assert_eq!(image.grow_break(0x4004_9000).unwrap(), 0x4004_9000);
        assert!(image.translate(0x4004_9800).is_some());
    }
}
