use alloc::boxed::Box;
use alloc::vec::Vec;
use bit_field::BitField;
use core::sync::atomic::{AtomicU64, Ordering};
use x86_64::registers::control::{Cr3, Cr3Flags};
use x86_64::structures::paging::page_table::PageTableEntry;
use x86_64::structures::paging::{PageTable, PageTableFlags, PhysFrame};
use x86_64::{PhysAddr, VirtAddr};

pub const PAGE_SIZE: usize = 4096;

/// First virtual address user mappings may occupy. Everything below is
/// the kernel identity region shared into every address space.
pub const USER_SPACE_START: u64 = 0x4000_0000;

/// PTE available-bit marking a demand-paged, file-backed page. Consulted
/// together with DIRTY by the mapping write-back path.
pub const FILE_BACKED: PageTableFlags = PageTableFlags::BIT_9;

/// Round `value` up to the next page boundary.
pub const fn page_round_up(value: u64) -> u64 {
    (value + PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1)
}

/// Round `value` down to its page boundary.
pub const fn page_align_down(value: u64) -> u64 {
    value & !(PAGE_SIZE as u64 - 1)
}

/// Physical address of the boot page table whose entries carry the
/// kernel identity region. Zero until `init` runs (host tests leave it
/// zero and build address spaces with no kernel region).
static KERNEL_ROOT: AtomicU64 = AtomicU64::new(0);

/// Physical address of the root table the MMU currently uses. Tracked
/// in software so the rest of the kernel never has to read CR3 back.
static ACTIVE_ROOT: AtomicU64 = AtomicU64::new(0);

/// Record the boot page table. The bootloader identity-maps all usable
/// RAM, so physical addresses double as kernel-virtual addresses
/// everywhere below.
pub unsafe fn init() {
    let (frame, _) = Cr3::read();
    KERNEL_ROOT.store(frame.start_address().as_u64(), Ordering::SeqCst);
    ACTIVE_ROOT.store(frame.start_address().as_u64(), Ordering::SeqCst);
}

/// Load `root_phys` into the MMU and remember it as the active root.
pub fn set_active_address_space(root_phys: u64) {
    ACTIVE_ROOT.store(root_phys, Ordering::SeqCst);
    unsafe {
        let frame = PhysFrame::containing_address(PhysAddr::new(root_phys));
        Cr3::write(frame, Cr3Flags::empty());
    }
}

pub fn kernel_root() -> u64 {
    KERNEL_ROOT.load(Ordering::SeqCst)
}

/// Switch back to the kernel's own page table.
pub fn activate_kernel_space() {
    let root = kernel_root();
    if root != 0 {
        set_active_address_space(root);
    }
}

/// Scoped address-space switch: enters `space` on construction and
/// restores the previously active root on drop. Used by the few paths
/// that must actually run the MMU over another process's tables
/// (first-entry dispatch aside, e.g. TLS pokes during execve).
pub struct ActiveSpace {
    previous: u64,
}

impl ActiveSpace {
    pub fn enter(space: &AddressSpace) -> ActiveSpace {
        let previous = ACTIVE_ROOT.load(Ordering::SeqCst);
        set_active_address_space(space.root_phys());
        ActiveSpace { previous }
    }
}

impl Drop for ActiveSpace {
    fn drop(&mut self) {
        if self.previous != 0 {
            set_active_address_space(self.previous);
        }
    }
}

// ──────────────────────────────────────────────────────────────
//  Address translator — pure walks over a 4-level table graph
// ──────────────────────────────────────────────────────────────

fn table_index(vaddr: u64, level: usize) -> usize {
    let low = 12 + 9 * level;
    vaddr.get_bits(low..low + 9) as usize
}

unsafe fn table_at(addr: PhysAddr) -> *mut PageTable {
    // Identity mapping: a table's physical address is dereferencable.
    addr.as_u64() as *mut PageTable
}

/// Locate the level-1 entry translating `vaddr`, or None if an
/// intermediate table is missing.
pub fn pte_for(root: &PageTable, vaddr: u64) -> Option<*mut PageTableEntry> {
    let mut table = root as *const PageTable as *mut PageTable;
    for level in (1..4).rev() {
        let entry = unsafe { &(*table)[table_index(vaddr, level)] };
        if entry.is_unused() || !entry.flags().contains(PageTableFlags::PRESENT) {
            return None;
        }
        table = unsafe { table_at(entry.addr()) };
    }
    let entry = unsafe { &mut (*table)[table_index(vaddr, 0)] };
    Some(entry as *mut PageTableEntry)
}

/// Translate a virtual address to its physical address, or None when no
/// present page covers it.
pub fn translate(root: &PageTable, vaddr: u64) -> Option<u64> {
    let pte = pte_for(root, vaddr)?;
    let entry = unsafe { &*pte };
    if !entry.flags().contains(PageTableFlags::PRESENT) {
        return None;
    }
    Some(entry.addr().as_u64() + (vaddr & (PAGE_SIZE as u64 - 1)))
}

// ──────────────────────────────────────────────────────────────
//  Page-frame allocation out of the kernel heap
// ──────────────────────────────────────────────────────────────

fn page_layout(len: usize) -> core::alloc::Layout {
    core::alloc::Layout::from_size_align(len, PAGE_SIZE)
        .expect("invalid page allocation layout")
}

/// Allocate one zeroed, page-aligned frame. Running out of physical
/// memory is fatal: this kernel keeps no overcommit accounting.
pub fn alloc_page_frame() -> u64 {
    let ptr = unsafe { alloc::alloc::alloc_zeroed(page_layout(PAGE_SIZE)) };
    if ptr.is_null() {
        panic!("out of physical memory");
    }
    ptr as u64
}

/// Free a frame previously produced by `alloc_page_frame`.
pub fn free_page_frame(frame: u64) {
    unsafe { alloc::alloc::dealloc(frame as *mut u8, page_layout(PAGE_SIZE)) };
}

// ──────────────────────────────────────────────────────────────
//  AddressSpace — one process's owned translation structures
// ──────────────────────────────────────────────────────────────

/// Owning handle to a root page table plus every intermediate table this
/// space allocated. Tables the root merely references (the shared kernel
/// region) are not owned and survive the drop.
pub struct AddressSpace {
    root: Box<PageTable>,
    tables: Vec<Box<PageTable>>,
}

impl AddressSpace {
    /// Fresh user address space pre-populated only with the kernel
    /// identity region. The upper P4 entries are shared by reference;
    /// the lowest P4 entry gets its own P3 table that re-references the
    /// kernel's GiB-granular entries, so user mappings above
    /// USER_SPACE_START never touch a table the kernel owns.
    pub fn new_user() -> AddressSpace {
        let mut root = Box::new(PageTable::new());
        let mut tables = Vec::new();
        let kernel = KERNEL_ROOT.load(Ordering::SeqCst);
        if kernel != 0 {
            let kernel_table = unsafe { &*table_at(PhysAddr::new(kernel)) };
            for (i, entry) in kernel_table.iter().enumerate() {
                if entry.is_unused() {
                    continue;
                }
                if i == 0 {
                    let kernel_p3 = unsafe { &*table_at(entry.addr()) };
                    let mut own_p3 = Box::new(PageTable::new());
                    for (j, p3e) in kernel_p3.iter().enumerate() {
                        if !p3e.is_unused() {
                            own_p3[j].set_addr(p3e.addr(), p3e.flags());
                        }
                    }
                    let phys = PhysAddr::new(&*own_p3 as *const PageTable as u64);
                    tables.push(own_p3);
                    root[0].set_addr(phys, entry.flags());
                } else {
                    root[i].set_addr(entry.addr(), entry.flags());
                }
            }
        }
        AddressSpace { root, tables }
    }

    pub fn root_phys(&self) -> u64 {
        &*self.root as *const PageTable as u64
    }

    pub fn root(&self) -> &PageTable {
        &self.root
    }

    pub fn is_active(&self) -> bool {
        ACTIVE_ROOT.load(Ordering::SeqCst) == self.root_phys()
    }

    /// Walk to the level-1 table covering `vaddr`, allocating missing
    /// intermediate tables into this space.
    fn leaf_table(&mut self, vaddr: u64, flags: PageTableFlags) -> *mut PageTable {
        let mut table = &mut *self.root as *mut PageTable;
        for level in (1..4).rev() {
            let entry = unsafe { &mut (*table)[table_index(vaddr, level)] };
            if entry.is_unused() {
                let fresh = Box::new(PageTable::new());
                let phys = PhysAddr::new(&*fresh as *const PageTable as u64);
                self.tables.push(fresh);
                entry.set_addr(phys, flags | PageTableFlags::PRESENT);
            }
            table = unsafe { table_at(entry.addr()) };
        }
        table
    }

    /// Install present translations for `[virt, virt+len)` onto the
    /// physically contiguous range starting at `phys`.
    pub fn map_range(&mut self, phys: u64, virt: u64, len: usize, flags: PageTableFlags) {
        if phys & (PAGE_SIZE as u64 - 1) != 0 || virt & (PAGE_SIZE as u64 - 1) != 0 {
            panic!("page mappings must be 4KiB aligned");
        }
        let table_flags = PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE;
        let mut offset = 0u64;
        while offset < len as u64 {
            let vaddr = virt + offset;
            let leaf = self.leaf_table(vaddr, table_flags);
            let entry = unsafe { &mut (*leaf)[table_index(vaddr, 0)] };
            entry.set_addr(
                PhysAddr::new(phys + offset),
                flags | PageTableFlags::PRESENT,
            );
            self.flush(vaddr);
            offset += PAGE_SIZE as u64;
        }
    }

    /// Reserve `[virt, virt+len)` without backing it: the leaf entries
    /// exist (so fault resolution finds them) but stay non-present.
    pub fn reserve_range(&mut self, virt: u64, len: usize, flags: PageTableFlags) {
        let table_flags = PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE;
        let mut vaddr = page_align_down(virt);
        let end = page_round_up(virt + len as u64);
        while vaddr < end {
            let leaf = self.leaf_table(vaddr, table_flags);
            let entry = unsafe { &mut (*leaf)[table_index(vaddr, 0)] };
            entry.set_flags(flags);
            vaddr += PAGE_SIZE as u64;
        }
    }

    /// Drop every leaf translation over `[virt, virt+len)`.
    pub fn unmap_range(&mut self, virt: u64, len: usize) {
        let mut vaddr = page_align_down(virt);
        let end = page_round_up(virt + len as u64);
        while vaddr < end {
            if let Some(pte) = pte_for(&self.root, vaddr) {
                unsafe { (*pte).set_unused() };
                self.flush(vaddr);
            }
            vaddr += PAGE_SIZE as u64;
        }
    }

    /// Mutable access to the leaf entry for `vaddr`, if its table exists.
    pub fn pte(&mut self, vaddr: u64) -> Option<&mut PageTableEntry> {
        pte_for(&self.root, vaddr).map(|p| unsafe { &mut *p })
    }

    pub fn translate(&self, vaddr: u64) -> Option<u64> {
        translate(&self.root, vaddr)
    }

    fn flush(&self, vaddr: u64) {
        // Only the live tables are cached by the TLB.
        if self.is_active() {
            x86_64::instructions::tlb::flush(VirtAddr::new(vaddr));
        }
    }
}
