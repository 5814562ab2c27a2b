use linked_list_allocator::LockedHeap;

/// All dynamic kernel memory, including page tables, segment backing
/// and per-process kernel stacks, comes out of this heap.
pub const HEAP_SIZE: usize = 16 * 1024 * 1024;

#[cfg_attr(not(test), global_allocator)]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

/// Hand the heap its backing region. The region must be identity
/// mapped and unused by anything else.
pub unsafe fn init_heap(start: u64, size: usize) {
    ALLOCATOR.lock().init(start as *mut u8, size);
}
