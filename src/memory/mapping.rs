use super::paging::{self, page_align_down, FILE_BACKED, PAGE_SIZE};
use super::{MemoryError, MemoryImage};
use crate::fs::fd::File;
use alloc::sync::Arc;
use spin::Mutex;
use x86_64::structures::paging::PageTableFlags;

/// A file-backed virtual window. Pages inside it are not eagerly
/// backed; the fault path populates them one at a time.
pub struct FileMapping {
    pub base: u64,
    pub len: usize,
    /// Byte offset into the backing file of the window's first byte.
    pub offset: u64,
    /// Shared mappings write dirty pages back; private ones never do.
    pub shared: bool,
    pub file: Arc<Mutex<File>>,
}

impl FileMapping {
    pub fn contains(&self, vaddr: u64) -> bool {
        vaddr >= self.base && vaddr < self.base + self.len as u64
    }
}

fn resident_flags() -> PageTableFlags {
    PageTableFlags::PRESENT
        | PageTableFlags::WRITABLE
        | PageTableFlags::USER_ACCESSIBLE
        | FILE_BACKED
}

impl MemoryImage {
    /// Record a mapping over `[base, base+len)`. The range is reserved
    /// (page tables exist, nothing is present) so later faults inside
    /// it are distinguishable from wild accesses.
    pub fn create_mapping(
        &mut self,
        base: u64,
        len: usize,
        offset: u64,
        shared: bool,
        file: Arc<Mutex<File>>,
    ) -> Result<(), MemoryError> {
        if base & (PAGE_SIZE as u64 - 1) != 0 || len == 0 {
            return Err(MemoryError::BadAddress);
        }
        if self.mappings.iter().any(|m| {
            m.base < base + len as u64 && base < m.base + m.len as u64
        }) {
            return Err(MemoryError::Overlap);
        }
        self.space.reserve_range(
            base,
            len,
            PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE,
        );
        self.mappings.push(FileMapping {
            base,
            len,
            offset,
            shared,
            file,
        });
        Ok(())
    }

    pub fn find_mapping(&self, vaddr: u64) -> Option<usize> {
        self.mappings.iter().position(|m| m.contains(vaddr))
    }

    /// Resolve a page fault at `fault_addr`. Returns true when the
    /// address fell inside a mapping and a page was brought in; false
    /// means a genuine access violation the caller must escalate.
    pub fn resolve_fault(&mut self, fault_addr: u64) -> bool {
        let Some(index) = self.find_mapping(fault_addr) else {
            return false;
        };
        let page = page_align_down(fault_addr);
        let frame = paging::alloc_page_frame();

        let (read_len, file_offset, file) = {
            let mapping = &self.mappings[index];
            let window_offset = page - mapping.base;
            let read_len = (mapping.len as u64 - window_offset).min(PAGE_SIZE as u64) as usize;
            (read_len, mapping.offset + window_offset, mapping.file.clone())
        };

        self.space.map_range(frame, page, PAGE_SIZE, resident_flags());

        // Seed the page from the file; anything past EOF (or past the
        // window) stays zero from the fresh frame.
        let buf = unsafe { core::slice::from_raw_parts_mut(frame as *mut u8, read_len) };
        let _ = file.lock().read_at(file_offset as usize, buf);
        true
    }

    /// Write back and evict every resident page of the mapping at
    /// `base`. Dirty pages of shared mappings go to the file first;
    /// private pages are discarded. The mapping record survives, so the
    /// pages fault back in on the next touch.
    pub fn sync_mapping(&mut self, base: u64) -> Result<(), MemoryError> {
        let index = self
            .mappings
            .iter()
            .position(|m| m.base == base)
            .ok_or(MemoryError::NoSuchMapping)?;
        self.sync_mapping_index(index);
        Ok(())
    }

    fn sync_mapping_index(&mut self, index: usize) {
        let (base, len, offset, shared, file) = {
            let m = &self.mappings[index];
            (m.base, m.len, m.offset, m.shared, m.file.clone())
        };

        let mut page = base;
        while page < base + len as u64 {
            let Some(pte) = self.space.pte(page) else {
                page += PAGE_SIZE as u64;
                continue;
            };
            let flags = pte.flags();
            if !flags.contains(PageTableFlags::PRESENT) || !flags.contains(FILE_BACKED) {
                page += PAGE_SIZE as u64;
                continue;
            }

            let frame = pte.addr().as_u64();
            if shared && flags.contains(PageTableFlags::DIRTY) {
                let window_offset = page - base;
                let write_len = (len as u64 - window_offset).min(PAGE_SIZE as u64) as usize;
                let bytes = unsafe { core::slice::from_raw_parts(frame as *const u8, write_len) };
                let _ = file.lock().write_at((offset + window_offset) as usize, bytes);
            }

            pte.set_flags(flags - PageTableFlags::PRESENT - PageTableFlags::DIRTY);
            paging::free_page_frame(frame);
            page += PAGE_SIZE as u64;
        }
    }

    /// Sync, then delete the mapping record. Dropping the file Arc is
    /// what lets the underlying handle close once nothing references it.
    pub fn destroy_mapping(&mut self, base: u64) -> Result<(), MemoryError> {
        let index = self
            .mappings
            .iter()
            .position(|m| m.base == base)
            .ok_or(MemoryError::NoSuchMapping)?;
        self.sync_mapping_index(index);
        self.space.unmap_range(base, self.mappings[index].len);
        self.mappings.remove(index);
        Ok(())
    }

    /// Fork support: recreate `other`'s mapping records in this image
    /// and physically copy every currently resident page.
    pub fn clone_mappings_from(&mut self, other: &MemoryImage) {
        for mapping in &other.mappings {
            self.space.reserve_range(
                mapping.base,
                mapping.len,
                PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE,
            );
            let mut page = mapping.base;
            while page < mapping.base + mapping.len as u64 {
                if let Some(src_frame) = other.space.translate(page) {
                    let frame = paging::alloc_page_frame();
                    unsafe {
                        core::ptr::copy_nonoverlapping(
                            page_align_down(src_frame) as *const u8,
                            frame as *mut u8,
                            PAGE_SIZE,
                        );
                    }
                    self.space.map_range(frame, page, PAGE_SIZE, resident_flags());
                }
                page += PAGE_SIZE as u64;
            }
            self.mappings.push(FileMapping {
                base: mapping.base,
                len: mapping.len,
                offset: mapping.offset,
                shared: mapping.shared,
                file: mapping.file.clone(),
            });
        }
    }
}

impl Drop for MemoryImage {
    fn drop(&mut self) {
        // Flush and release every resident mapped page; the segment
        // backings free themselves through PageRegion.
        for index in 0..self.mappings.len() {
            self.sync_mapping_index(index);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::{MemoryImage, PAGE_SIZE};
    use super::*;
    use crate::fs::fd::File;
    use x86_64::structures::paging::PageTableFlags;

    fn file_with_content(path: &str, content: &[u8]) -> Arc<Mutex<File>> {
        crate::fs::ensure_root_mounted();
        {
            let mut vfs = crate::fs::VFS.lock();
            let _ = vfs.create(path);
            vfs.write_file(path, 0, content).unwrap();
        }
        File::open_path(path, false).unwrap()
    }

    fn read_back(path: &str, offset: usize, len: usize) -> alloc::vec::Vec<u8> {
        let mut buf = alloc::vec![0u8; len];
        crate::fs::VFS.lock().read_file(path, offset, &mut buf).unwrap();
        buf
    }

    #[test]
    fn fault_populates_page_from_file() {
        let file = file_with_content("/map_fault", b"mapped-content");
        let mut image = MemoryImage::new_user();
        image
            .create_mapping(0x7000_0000, 2 * PAGE_SIZE, 0, true, file)
            .unwrap();

        assert_eq!(image.translate(0x7000_0004), None);
        assert!(image.resolve_fault(0x7000_0004));

        let phys = image.translate(0x7000_0000).unwrap();
        let bytes = unsafe { core::slice::from_raw_parts(phys as *const u8, 14) };
        assert_eq!(bytes, b"mapped-content");
        // Short file: the rest of the page was zero-filled.
        let tail = unsafe { core::slice::from_raw_parts((phys + 14) as *const u8, 16) };
        assert!(tail.iter().all(|&b| b == 0));
    }

    #[test]
    fn fault_outside_any_mapping_is_a_violation() {
        let mut image = MemoryImage::new_user();
        assert!(!image.resolve_fault(0x7100_0000));
    }

    #[test]
    fn shared_dirty_pages_write_back_on_sync() {
        let file = file_with_content("/map_sync", &[0u8; 2 * PAGE_SIZE]);
        let mut image = MemoryImage::new_user();
        image
            .create_mapping(0x7200_0000, 2 * PAGE_SIZE, 0, true, file)
            .unwrap();

        // The §8 scenario: "AB" at offset 0, "CD" at 4096, then sync.
        crate::memory::user::copy_to_user(&mut image, 0x7200_0000, b"AB").unwrap();
        crate::memory::user::copy_to_user(&mut image, 0x7200_1000, b"CD").unwrap();
        image.sync_mapping(0x7200_0000).unwrap();

        assert_eq!(read_back("/map_sync", 0, 2), b"AB");
        assert_eq!(read_back("/map_sync", 4096, 2), b"CD");
        // Sync evicted: the pages are gone until the next fault.
        assert_eq!(image.translate(0x7200_0000), None);
        // And fault back in with the written content.
        assert!(image.resolve_fault(0x7200_0000));
        let phys = image.translate(0x7200_0000).unwrap();
        let bytes = unsafe { core::slice::from_raw_parts(phys as *const u8, 2) };
        assert_eq!(bytes, b"AB");
    }

    #[test]
    fn private_mapping_never_reaches_the_file() {
        let file = file_with_content("/map_private", b"original");
        let mut image = MemoryImage::new_user();
        image
            .create_mapping(0x7300_0000, PAGE_SIZE, 0, false, file)
            .unwrap();

        crate::memory::user::copy_to_user(&mut image, 0x7300_0000, b"CHANGED!").unwrap();
        image.sync_mapping(0x7300_0000).unwrap();

        assert_eq!(read_back("/map_private", 0, 8), b"original");
    }

    #[test]
    fn clean_pages_are_evicted_without_write() {
        let file = file_with_content("/map_clean", b"stable");
        let mut image = MemoryImage::new_user();
        image
            .create_mapping(0x7400_0000, PAGE_SIZE, 0, true, file)
            .unwrap();

        assert!(image.resolve_fault(0x7400_0000));
        let pte_flags = {
            let pte = image.space.pte(0x7400_0000).unwrap();
            pte.flags()
        };
        assert!(!pte_flags.contains(PageTableFlags::DIRTY));

        image.sync_mapping(0x7400_0000).unwrap();
        assert_eq!(read_back("/map_clean", 0, 6), b"stable");
    }

    #[test]
    fn destroy_mapping_removes_the_record() {
        let file = file_with_content("/map_destroy", b"x");
        let mut image = MemoryImage::new_user();
        image
            .create_mapping(0x7500_0000, PAGE_SIZE, 0, true, file)
            .unwrap();
        assert!(image.resolve_fault(0x7500_0000));
        image.destroy_mapping(0x7500_0000).unwrap();
        assert!(image.mappings.is_empty());
        assert!(!image.resolve_fault(0x7500_0000));
    }
}
