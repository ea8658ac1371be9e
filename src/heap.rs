//! Placement engine for the heap regime. Acquiring a heap block goes through
//! four stages, each one only reached if the previous didn't produce a block:
//! pre-allocate the heap on first use, reuse a free block found by best-fit
//! search (splitting off the surplus), stretch the last block over freshly
//! extended break space, or append a brand new block at the break.

use std::ptr::NonNull;

use crate::{
    alignment::ALIGNMENT,
    allocator::BreakAllocator,
    block::{Block, BlockHeader, BlockStatus, META},
    platform::MemorySource,
    Pointer,
};

/// Size of the break extension performed the first time a heap block is
/// requested. Serving small allocations out of one big extension amortizes
/// the syscall cost; 128 KiB holds thousands of typical small blocks.
pub(crate) const HEAP_PREALLOC: usize = 128 * 1024;

impl<S: MemorySource> BreakAllocator<S> {
    /// Produces an [`BlockStatus::Allocated`] heap block of exactly `aligned`
    /// payload bytes and returns its payload address. `aligned` must already
    /// be a multiple of the alignment granularity and small enough for the
    /// heap regime.
    pub(crate) unsafe fn request_heap_block(&mut self, aligned: usize) -> Pointer<u8> {
        self.prealloc_heap()?;

        // Merging adjacent free blocks before searching lets one big request
        // succeed where several fragmented holes would have failed.
        self.coalesce_free_blocks();

        if let Some(mut block) = self.find_best_fit(aligned) {
            self.split_if_possible(block, aligned);
            block.as_mut().data.status = BlockStatus::Allocated;
            return Some(BlockHeader::payload_of(block));
        }

        // No block can hold the request. If the heap ends in a free block we
        // only need the break to cover the difference.
        if let Some(mut last) = self.last_heap_block() {
            if last.as_ref().is_free() {
                self.source.extend_break(aligned - last.as_ref().size())?;
                last.as_mut().data.size = aligned;
                last.as_mut().data.status = BlockStatus::Allocated;
                return Some(BlockHeader::payload_of(last));
            }
        }

        let base = self.source.extend_break(META + aligned)?;
        let block = self.blocks.append(
            Block {
                size: aligned,
                status: BlockStatus::Allocated,
            },
            base,
        );

        Some(BlockHeader::payload_of(block))
    }

    /// Performs the initial break extension, installing one free block that
    /// spans the whole extension. Happens at most once per allocator: the
    /// flag is never reset, even if every heap block is freed later, because
    /// the break is never given back anyway.
    unsafe fn prealloc_heap(&mut self) -> Option<()> {
        if self.heap_preallocated {
            return Some(());
        }

        let base = self.source.extend_break(HEAP_PREALLOC)?;

        self.blocks.append(
            Block {
                size: HEAP_PREALLOC - META,
                status: BlockStatus::Free,
            },
            base,
        );

        self.heap_preallocated = true;

        Some(())
    }

    /// Merges every run of list-adjacent free heap blocks into its first
    /// block. Mapped blocks are stepped over without breaking up a run: they
    /// live at unrelated addresses, so two heap blocks with only mapped
    /// blocks between them in the list are still physically back to back.
    /// An allocated block on the other hand is a real physical barrier.
    pub(crate) unsafe fn coalesce_free_blocks(&mut self) {
        let mut run: Pointer<BlockHeader> = None;
        let mut cursor = self.blocks.first();

        while let Some(block) = cursor {
            cursor = block.as_ref().next;

            match block.as_ref().status() {
                BlockStatus::Mapped => {}
                BlockStatus::Allocated => run = None,
                BlockStatus::Free => match run {
                    None => run = Some(block),
                    Some(mut first) => {
                        debug_assert_eq!(BlockHeader::end_of(first), block.cast());
                        first.as_mut().data.size += block.as_ref().total_size();
                        self.blocks.remove(block);
                    }
                },
            }
        }
    }

    /// Scans the whole list for the smallest free block that can hold
    /// `aligned` bytes. An exact fit can't be beaten, so the scan stops
    /// there; among equally small candidates the earliest one wins.
    unsafe fn find_best_fit(&self, aligned: usize) -> Pointer<BlockHeader> {
        let mut best: Pointer<BlockHeader> = None;

        for block in self.blocks.iter() {
            if !block.as_ref().is_free() || block.as_ref().size() < aligned {
                continue;
            }

            if block.as_ref().size() == aligned {
                return Some(block);
            }

            match best {
                Some(current) if block.as_ref().size() >= current.as_ref().size() => {}
                _ => best = Some(block),
            }
        }

        best
    }

    /// Block splitting algorithm implementation. When a selected block is
    /// bigger than the request, the surplus is carved off into a new free
    /// block, as long as the surplus can hold a header plus at least one
    /// aligned payload unit:
    ///
    /// **Before**:
    ///
    /// ```text
    ///         +-->  +-----------+
    ///         |     |   Header  |
    /// Block   |     +-----------+
    ///         |     |  Payload  | <- 64 bytes.
    ///         +-->  +-----------+
    /// ```
    /// **After** (requesting 8 bytes):
    ///
    /// ```text
    ///         +-->  +-----------+
    ///         |     |   Header  |
    /// Block 1 |     +-----------+
    ///         |     |  Payload  | <- 8 bytes.
    ///         +-->  +-----------+
    ///         |     |   Header  |
    /// Block 2 |     +-----------+
    ///         |     |  Payload  | <- 64 - 8 - header bytes, free.
    ///         +-->  +-----------+
    /// ```
    ///
    /// The address of the given block never changes, so callers can keep
    /// using it afterwards.
    pub(crate) unsafe fn split_if_possible(&mut self, mut block: NonNull<BlockHeader>, aligned: usize) {
        // If there's not enough surplus we hand out the whole block.
        if block.as_ref().size() < aligned + META + ALIGNMENT {
            return;
        }

        let address = NonNull::new_unchecked(BlockHeader::payload_of(block).as_ptr().add(aligned));

        self.blocks.insert_after(
            block,
            Block {
                size: block.as_ref().size() - aligned - META,
                status: BlockStatus::Free,
            },
            address,
        );

        // The given block can only hold `aligned` bytes from now on.
        block.as_mut().data.size = aligned;
    }

    /// The heap block that physically ends at the program break: the list
    /// tail, stepping backwards over any trailing mapped blocks.
    pub(crate) unsafe fn last_heap_block(&self) -> Pointer<BlockHeader> {
        let mut cursor = self.blocks.last();

        while let Some(block) = cursor {
            if block.as_ref().status() != BlockStatus::Mapped {
                return Some(block);
            }
            cursor = block.as_ref().prev;
        }

        None
    }
}
