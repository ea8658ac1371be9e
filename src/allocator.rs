use std::{
    alloc::{GlobalAlloc, Layout},
    ptr::{self, NonNull},
    sync::Mutex,
};

use crate::{
    alignment::{align_up, ALIGNMENT},
    block::{Block, BlockHeader, BlockStatus, META},
    list::LinkedList,
    platform::{MemorySource, Platform},
    Pointer,
};

/// Requests at least this big (header included) are served from their own
/// anonymous mapping instead of the heap. Mapped blocks can be returned to
/// the kernel individually the moment they are freed, which matters for big
/// buffers; everything below the threshold benefits more from the cheap
/// reuse machinery of the heap.
pub(crate) const MMAP_THRESHOLD: usize = 128 * 1024;

/// Whether a request for `aligned` payload bytes belongs on the heap under
/// the given threshold, which is [`MMAP_THRESHOLD`] for plain allocations
/// and the page size for zeroed ones.
pub(crate) fn is_heap_request(aligned: usize, threshold: usize) -> bool {
    match aligned.checked_add(META) {
        Some(total) => total < threshold,
        None => false,
    }
}

/// The allocation engine. It owns one list with every block it has created,
/// a flag remembering whether the initial break extension happened, and the
/// memory source the blocks are built on:
///
/// ```text
///               Heap (one contiguous stretch of the break)                  Own mappings
///  +--------------------------------------------------------+      +--------+  +--------+
///  | +--------+-------+  +--------+-------+  +--------+----+ |      | +----+ |  | +----+ |
///  | | Header | Alloc |->| Header | Free  |->| Header | .. |-|----->| | .. |-|->| | .. | |
///  | +--------+-------+  +--------+-------+  +--------+----+ |      | +----+ |  | +----+ |
///  +--------------------------------------------------------+      +--------+  +--------+
/// ```
///
/// Heap blocks appear in the list in the same order they sit in memory, so
/// walking the list is walking the heap; that's what makes merging and
/// splitting work with nothing but size arithmetic. Mapped blocks are linked
/// wherever their creation happened to fall but their addresses are
/// unrelated to everything else.
///
/// The four operations take `&mut self` and are not thread safe; see
/// [`Bralloc`] for the lock-serialized wrapper. Generic in its
/// [`MemorySource`] so tests (and anybody who wants an allocator inside a
/// buffer) can run it over an [`crate::ArenaSource`] instead of the real
/// program break. The engine itself is spread over three modules: regime
/// dispatch and the operations here, heap placement in `heap`, resizing in
/// `realloc`.
///
/// # Examples
///
/// ```rust
/// use bralloc::{ArenaSource, BreakAllocator};
///
/// let mut allocator = BreakAllocator::with_source(ArenaSource::with_capacity(1024 * 1024));
///
/// unsafe {
///     let address = allocator.allocate(48).unwrap();
///     address.as_ptr().write_bytes(7, 48);
///
///     let bigger = allocator.reallocate(address.as_ptr(), 96).unwrap();
///     assert_eq!(*bigger.as_ptr(), 7);
///
///     allocator.free(bigger.as_ptr());
/// }
/// ```
///
/// # Drop
///
/// Dropping the allocator unmaps every mapped block that is still alive.
/// Heap memory stays with the source: the break is never shrunk.
pub struct BreakAllocator<S: MemorySource = Platform> {
    /// Every block, heap and mapped, in creation order.
    pub(crate) blocks: LinkedList<Block>,
    /// Set by the first heap request, never reset. Even if every heap block
    /// is freed afterwards the heap itself stays with us.
    pub(crate) heap_preallocated: bool,
    /// Where the bytes come from.
    pub(crate) source: S,
}

impl BreakAllocator<Platform> {
    /// An allocator over the memory of the running process. There should be
    /// at most one of these per process, since two would fight over the
    /// program break.
    pub const fn new() -> Self {
        Self::with_source(Platform)
    }
}

impl Default for BreakAllocator<Platform> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: MemorySource> BreakAllocator<S> {
    /// Builds an allocator on top of the given memory source. Nothing is
    /// requested from the source until the first allocation.
    pub const fn with_source(source: S) -> Self {
        Self {
            blocks: LinkedList::new(),
            heap_preallocated: false,
            source,
        }
    }

    /// Allocates `size` bytes and returns the address of the first one, or
    /// `None` when `size` is zero or memory cannot be obtained. The returned
    /// address is always 8-aligned and stays valid until it is passed to
    /// [`BreakAllocator::free`] or [`BreakAllocator::reallocate`].
    ///
    /// # Safety
    ///
    /// The returned memory is uninitialized. Caller must not read it before
    /// writing, and must not write more than `size` bytes.
    pub unsafe fn allocate(&mut self, size: usize) -> Pointer<u8> {
        if size == 0 {
            return None;
        }

        let aligned = align_up(size)?;

        if is_heap_request(aligned, MMAP_THRESHOLD) {
            self.request_heap_block(aligned)
        } else {
            self.request_mapped_block(aligned)
        }
    }

    /// Releases the allocation at `address`. Null pointers, addresses we
    /// never handed out and blocks that are already free are all ignored.
    /// A mapped block goes straight back to the kernel; a heap block is only
    /// marked free, merging with its neighbors is deferred until the next
    /// time the placement machinery runs.
    ///
    /// # Safety
    ///
    /// `address` must not be used again after this call (unless it is handed
    /// out once more by a later allocation).
    pub unsafe fn free(&mut self, address: *mut u8) {
        let Some(address) = NonNull::new(address) else {
            return;
        };

        let Some(mut block) = self.find_owning_block(address) else {
            return;
        };

        match block.as_ref().status() {
            BlockStatus::Free => {}
            BlockStatus::Allocated => block.as_mut().data.status = BlockStatus::Free,
            BlockStatus::Mapped => self.release_mapped_block(block),
        }
    }

    /// Allocates room for `count` elements of `size` bytes each and fills it
    /// with zeros. Returns `None` when either operand is zero or the total
    /// size overflows.
    ///
    /// Unlike [`BreakAllocator::allocate`], the regime decision compares
    /// against the page size rather than [`MMAP_THRESHOLD`]: zeroed
    /// allocations are typically large buffers, and pushing anything of a
    /// page or more into its own mapping gets the zero-filling from the
    /// kernel for free. The payload is still zeroed unconditionally, because
    /// it may also come from a recycled heap block.
    ///
    /// # Safety
    ///
    /// Same contract as [`BreakAllocator::allocate`], except the memory is
    /// initialized to zero.
    pub unsafe fn zero_allocate(&mut self, count: usize, size: usize) -> Pointer<u8> {
        if count == 0 || size == 0 {
            return None;
        }

        let aligned = align_up(count.checked_mul(size)?)?;

        let page_size = self.source.page_size();
        let address = if is_heap_request(aligned, page_size) {
            self.request_heap_block(aligned)?
        } else {
            self.request_mapped_block(aligned)?
        };

        address.as_ptr().write_bytes(0, aligned);

        Some(address)
    }

    /// Resizes the allocation at `address` to `size` bytes, preserving the
    /// first `min(old, new)` bytes of payload. The block grows in place when
    /// it can; otherwise the contents move and the returned address differs
    /// from the given one, which must then no longer be used.
    ///
    /// Following the C tradition: a null `address` behaves like a plain
    /// allocation, a zero `size` behaves like a free and yields `None`, and
    /// `None` is also the answer for addresses we don't own or that were
    /// already freed. On failure (`None`) the original allocation is left
    /// untouched and still valid.
    ///
    /// # Safety
    ///
    /// `address` must be null or an address previously returned by one of
    /// the allocation operations of this allocator.
    pub unsafe fn reallocate(&mut self, address: *mut u8, size: usize) -> Pointer<u8> {
        let Some(address) = NonNull::new(address) else {
            return self.allocate(size);
        };

        if size == 0 {
            self.free(address.as_ptr());
            return None;
        }

        let block = self.find_owning_block(address)?;

        if block.as_ref().is_free() {
            return None;
        }

        let aligned = align_up(size)?;

        // Same rounded size, same block, nothing to do.
        if aligned == block.as_ref().size() {
            return Some(address);
        }

        if aligned < block.as_ref().size() {
            self.shrink_block(block, address, aligned)
        } else {
            self.grow_block(block, address, aligned)
        }
    }

    /// Finds the block whose payload starts at `address` by scanning the
    /// list. Returns `None` for addresses we never handed out, which the
    /// operations treat as an invalid argument.
    pub(crate) unsafe fn find_owning_block(&self, address: NonNull<u8>) -> Pointer<BlockHeader> {
        let mut cursor = self.blocks.first();

        while let Some(block) = cursor {
            if BlockHeader::payload_of(block) == address {
                return Some(block);
            }
            cursor = block.as_ref().next;
        }

        None
    }

    /// Creates a block with its own anonymous mapping of exactly header plus
    /// `aligned` payload bytes and returns the payload address.
    pub(crate) unsafe fn request_mapped_block(&mut self, aligned: usize) -> Pointer<u8> {
        let length = META.checked_add(aligned)?;

        let address = self.source.map_anon(length)?;

        let block = self.blocks.append(
            Block {
                size: aligned,
                status: BlockStatus::Mapped,
            },
            address,
        );

        Some(BlockHeader::payload_of(block))
    }

    /// Unlinks a mapped block and returns its whole region to the kernel.
    /// The header lives inside the region, so the order matters: first
    /// unlink, then unmap.
    pub(crate) unsafe fn release_mapped_block(&mut self, block: NonNull<BlockHeader>) {
        let length = block.as_ref().total_size();
        self.blocks.remove(block);
        self.source.unmap(block.cast(), length);
    }
}

impl<S: MemorySource> Drop for BreakAllocator<S> {
    fn drop(&mut self) {
        unsafe {
            let mut cursor = self.blocks.first();

            while let Some(block) = cursor {
                cursor = block.as_ref().next;

                if block.as_ref().status() == BlockStatus::Mapped {
                    self.release_mapped_block(block);
                }
            }
        }
    }
}

/// The public face of the crate: a [`BreakAllocator`] over the real process
/// memory, serialized with a global [`Mutex`] held for the whole call, which
/// is what makes implementing [`GlobalAlloc`] possible.
///
/// Payloads are exactly 8-aligned, so layouts requesting a stricter
/// alignment are reported as allocation failure rather than silently handed
/// misaligned memory.
///
/// # Examples
///
/// ```no_run
/// use bralloc::Bralloc;
///
/// #[global_allocator]
/// static ALLOCATOR: Bralloc = Bralloc::new();
///
/// fn main() {
///     let mut numbers = vec![1, 2, 3];
///     numbers.push(4);
///     assert_eq!(numbers.len(), 4);
/// }
/// ```
pub struct Bralloc {
    allocator: Mutex<BreakAllocator<Platform>>,
}

impl Bralloc {
    pub const fn new() -> Self {
        Self {
            allocator: Mutex::new(BreakAllocator::new()),
        }
    }
}

impl Default for Bralloc {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl Sync for Bralloc {}

unsafe impl GlobalAlloc for Bralloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return ptr::null_mut();
        }

        match self.allocator.lock() {
            Ok(mut allocator) => match allocator.allocate(layout.size()) {
                Some(address) => address.as_ptr(),
                None => ptr::null_mut(),
            },
            Err(_) => ptr::null_mut(),
        }
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return ptr::null_mut();
        }

        match self.allocator.lock() {
            Ok(mut allocator) => match allocator.zero_allocate(1, layout.size()) {
                Some(address) => address.as_ptr(),
                None => ptr::null_mut(),
            },
            Err(_) => ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, address: *mut u8, _layout: Layout) {
        if let Ok(mut allocator) = self.allocator.lock() {
            allocator.free(address);
        }
    }

    unsafe fn realloc(&self, address: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return ptr::null_mut();
        }

        match self.allocator.lock() {
            Ok(mut allocator) => match allocator.reallocate(address, new_size) {
                Some(new_address) => new_address.as_ptr(),
                None => ptr::null_mut(),
            },
            Err(_) => ptr::null_mut(),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::platform::ArenaSource;

    /// Every test runs over its own little simulated process, so tests are
    /// isolated from each other and the state resets by dropping.
    pub(crate) fn test_allocator() -> BreakAllocator<ArenaSource> {
        BreakAllocator::with_source(ArenaSource::with_capacity(4 * 1024 * 1024))
    }

    pub(crate) unsafe fn collect_blocks<S: MemorySource>(
        allocator: &BreakAllocator<S>,
    ) -> Vec<NonNull<BlockHeader>> {
        let mut blocks = Vec::new();
        let mut cursor = allocator.blocks.first();

        while let Some(block) = cursor {
            blocks.push(block);
            cursor = block.as_ref().next;
        }

        blocks
    }

    /// Structural health check: aligned sizes and payloads, heap blocks
    /// physically back to back in list order, and no two live payloads
    /// overlapping.
    pub(crate) unsafe fn assert_block_invariants<S: MemorySource>(
        allocator: &BreakAllocator<S>,
    ) {
        let mut previous_heap: Pointer<BlockHeader> = None;
        let mut payloads = Vec::new();

        for block in collect_blocks(allocator) {
            assert_eq!(block.as_ref().size() % ALIGNMENT, 0);

            let payload = BlockHeader::payload_of(block);
            assert_eq!(payload.as_ptr() as usize % ALIGNMENT, 0);
            payloads.push((payload.as_ptr() as usize, block.as_ref().size()));

            if block.as_ref().status() != BlockStatus::Mapped {
                if let Some(prev) = previous_heap {
                    assert_eq!(BlockHeader::end_of(prev), block.cast());
                }
                previous_heap = Some(block);
            }
        }

        payloads.sort_unstable();
        for pair in payloads.windows(2) {
            assert!(pair[0].0 + pair[0].1 <= pair[1].0, "payloads overlap");
        }
    }

    /// No two list-adjacent heap blocks both free. Holds after operations
    /// that run the placement machinery; plain frees deliberately leave the
    /// merging for later.
    pub(crate) unsafe fn assert_no_adjacent_free<S: MemorySource>(
        allocator: &BreakAllocator<S>,
    ) {
        let mut previous_free = false;

        for block in collect_blocks(allocator) {
            match block.as_ref().status() {
                BlockStatus::Mapped => {}
                BlockStatus::Free => {
                    assert!(!previous_free, "two adjacent free heap blocks");
                    previous_free = true;
                }
                BlockStatus::Allocated => previous_free = false,
            }
        }
    }

    #[test]
    fn rejects_degenerate_arguments() {
        let mut allocator = test_allocator();

        unsafe {
            assert_eq!(allocator.allocate(0), None);
            assert_eq!(allocator.zero_allocate(0, 16), None);
            assert_eq!(allocator.zero_allocate(16, 0), None);

            // Nothing was touched by any of the above.
            assert_eq!(allocator.blocks.len, 0);
            assert!(!allocator.heap_preallocated);
            assert_eq!(allocator.source.break_position(), 0);
        }
    }

    #[test]
    fn overflowing_element_count_fails_without_state_change() {
        let mut allocator = test_allocator();

        unsafe {
            assert_eq!(allocator.zero_allocate(usize::MAX / 2, 4), None);

            assert_eq!(allocator.blocks.len, 0);
            assert!(!allocator.heap_preallocated);
            assert_eq!(allocator.source.break_position(), 0);
        }
    }

    #[test]
    fn returned_pointers_are_aligned() {
        let mut allocator = test_allocator();

        unsafe {
            for size in [1, 7, 8, 9, 24, 100, 4096, 200 * 1024] {
                let address = allocator.allocate(size).unwrap();
                assert_eq!(address.as_ptr() as usize % ALIGNMENT, 0);
                assert_block_invariants(&allocator);
                allocator.free(address.as_ptr());
            }

            let zeroed = allocator.zero_allocate(3, 33).unwrap();
            assert_eq!(zeroed.as_ptr() as usize % ALIGNMENT, 0);
            allocator.free(zeroed.as_ptr());
        }
    }

    #[test]
    fn payload_round_trips_bytes() {
        let mut allocator = test_allocator();

        unsafe {
            for size in [1usize, 13, 64, 1000, 150 * 1024] {
                let address = allocator.allocate(size).unwrap();

                for i in 0..size {
                    *address.as_ptr().add(i) = (i % 251) as u8;
                }
                for i in 0..size {
                    assert_eq!(*address.as_ptr().add(i), (i % 251) as u8);
                }

                allocator.free(address.as_ptr());
            }
        }
    }

    #[test]
    fn zeroed_allocation_clears_recycled_heap_memory() {
        let mut allocator = test_allocator();

        unsafe {
            // Dirty a heap block, free it, then ask for a zeroed block that
            // best-fits into the same spot.
            let dirty = allocator.allocate(64).unwrap();
            dirty.as_ptr().write_bytes(0xFF, 64);
            allocator.free(dirty.as_ptr());

            let zeroed = allocator.zero_allocate(8, 8).unwrap();
            for i in 0..64 {
                assert_eq!(*zeroed.as_ptr().add(i), 0);
            }

            allocator.free(zeroed.as_ptr());
        }
    }

    #[test]
    fn freeing_is_idempotent_and_tolerant() {
        let mut allocator = test_allocator();

        unsafe {
            // Null and foreign pointers are ignored.
            allocator.free(ptr::null_mut());
            let mut foreign = 0u64;
            allocator.free((&mut foreign as *mut u64).cast());

            let address = allocator.allocate(32).unwrap();
            allocator.free(address.as_ptr());

            let block = BlockHeader::from_payload(address);
            assert!(block.as_ref().is_free());
            let size_after_first = block.as_ref().size();
            let len_after_first = allocator.blocks.len;

            // Freeing again must change nothing.
            allocator.free(address.as_ptr());
            assert!(block.as_ref().is_free());
            assert_eq!(block.as_ref().size(), size_after_first);
            assert_eq!(allocator.blocks.len, len_after_first);
        }
    }

    #[test]
    fn split_and_coalesce_reuse_the_heap() {
        let mut allocator = test_allocator();

        unsafe {
            let a = allocator.allocate(32).unwrap();
            let b = allocator.allocate(32).unwrap();
            let c = allocator.allocate(32).unwrap();
            assert_block_invariants(&allocator);

            allocator.free(a.as_ptr());
            allocator.free(c.as_ptr());

            // The hole at `a` is the snuggest fit, and no fresh break memory
            // is needed.
            let break_before = allocator.source.break_position();
            let reused = allocator.allocate(32).unwrap();
            assert_eq!(reused, a);
            assert_eq!(allocator.source.break_position(), break_before);
            assert_no_adjacent_free(&allocator);

            allocator.free(b.as_ptr());

            // b, c and everything after them coalesce into one run that can
            // hold 96 bytes, again without touching the break.
            let bigger = allocator.allocate(96).unwrap();
            assert_eq!(bigger, b);
            assert_eq!(allocator.source.break_position(), break_before);
            assert_block_invariants(&allocator);
            assert_no_adjacent_free(&allocator);
        }
    }

    #[test]
    fn large_requests_bypass_the_break_entirely() {
        let mut allocator = test_allocator();

        unsafe {
            let first = allocator.allocate(200 * 1024).unwrap();
            assert_eq!(allocator.source.break_position(), 0);

            let block = BlockHeader::from_payload(first);
            assert_eq!(block.as_ref().status(), BlockStatus::Mapped);
            assert_eq!(block.as_ref().size(), 200 * 1024);

            allocator.free(first.as_ptr());
            assert_eq!(allocator.blocks.len, 0);

            // Same story after the mapping came and went.
            let second = allocator.allocate(200 * 1024).unwrap();
            assert_eq!(allocator.source.break_position(), 0);
            allocator.free(second.as_ptr());
        }
    }

    #[test]
    fn threshold_boundary_picks_the_regime() {
        let mut allocator = test_allocator();

        unsafe {
            // Largest size that still lands on the heap: header + payload
            // one alignment unit below the threshold.
            let largest_heap = MMAP_THRESHOLD - META - ALIGNMENT;
            let on_heap = allocator.allocate(largest_heap).unwrap();
            let block = BlockHeader::from_payload(on_heap);
            assert_ne!(block.as_ref().status(), BlockStatus::Mapped);

            // One unit more and header + payload reaches the threshold.
            let mapped = allocator.allocate(largest_heap + 1).unwrap();
            let block = BlockHeader::from_payload(mapped);
            assert_eq!(block.as_ref().status(), BlockStatus::Mapped);

            allocator.free(on_heap.as_ptr());
            allocator.free(mapped.as_ptr());
        }
    }

    #[test]
    fn reallocate_covers_the_c_tradition_cases() {
        let mut allocator = test_allocator();

        unsafe {
            // Null address behaves like a plain allocation.
            let address = allocator.reallocate(ptr::null_mut(), 64).unwrap();
            let block = BlockHeader::from_payload(address);
            assert_eq!(block.as_ref().status(), BlockStatus::Allocated);
            assert_eq!(block.as_ref().size(), 64);

            // Zero size behaves like a free.
            assert_eq!(allocator.reallocate(address.as_ptr(), 0), None);
            assert!(block.as_ref().is_free());

            // Freed and foreign addresses are rejected.
            assert_eq!(allocator.reallocate(address.as_ptr(), 32), None);
            let mut foreign = 0u64;
            assert_eq!(
                allocator.reallocate((&mut foreign as *mut u64).cast(), 32),
                None
            );
        }
    }

    #[test]
    fn mapped_blocks_are_reclaimed_on_drop() {
        let mut allocator = test_allocator();

        unsafe {
            allocator.allocate(200 * 1024).unwrap();
            allocator.allocate(300 * 1024).unwrap();
            assert_eq!(allocator.blocks.len, 2);
        }

        // Dropping must unmap both blocks; Miri would report the leak
        // otherwise.
        drop(allocator);
    }

    #[test]
    fn global_allocator_face_serves_mapped_requests() {
        let allocator = Bralloc::new();
        let layout = Layout::from_size_align(256 * 1024, 8).unwrap();

        unsafe {
            let address = allocator.alloc(layout);
            assert!(!address.is_null());

            address.write_bytes(0x5A, 64);

            let grown = allocator.realloc(address, layout, 384 * 1024);
            assert!(!grown.is_null());
            for i in 0..64 {
                assert_eq!(*grown.add(i), 0x5A);
            }

            allocator.dealloc(grown, Layout::from_size_align(384 * 1024, 8).unwrap());

            // Stricter alignments than the granularity are refused.
            let overaligned = Layout::from_size_align(64, 32).unwrap();
            assert!(allocator.alloc(overaligned).is_null());
        }
    }
}
