//! Reallocation engine. The public entry point is
//! [`BreakAllocator::reallocate`]; once the argument checks are done and the
//! owning block is found, the work lands here. The decision table, in order:
//!
//! ```text
//!               |  shrink                       |  grow
//! --------------+-------------------------------+--------------------------------
//! mapped block  |  new mapping (or heap block   |  new mapping, copy, unmap old
//!               |  if now small), copy, unmap   |  (mappings can't be resized)
//! --------------+-------------------------------+--------------------------------
//! heap block    |  split in place, same pointer |  1. past the threshold: migrate
//!               |                               |     to a mapping, old goes free
//!               |                               |  2. last block: stretch over a
//!               |                               |     break extension, in place
//!               |                               |  3. swallow free neighbors, in
//!               |                               |     place if they cover it
//!               |                               |  4. fresh heap block, copy
//! ```
//!
//! Whatever the path, the first `min(old, new)` payload bytes survive, and
//! nothing is unmapped or marked free until the replacement block is secured,
//! so a failed reallocation leaves the original allocation untouched.

use std::ptr::{self, NonNull};

use crate::{
    allocator::{is_heap_request, BreakAllocator, MMAP_THRESHOLD},
    block::{BlockHeader, BlockStatus},
    platform::MemorySource,
    Pointer,
};

impl<S: MemorySource> BreakAllocator<S> {
    /// Shrinks the allocation at `address` to `aligned` bytes, which is
    /// strictly smaller than the current payload.
    pub(crate) unsafe fn shrink_block(
        &mut self,
        block: NonNull<BlockHeader>,
        address: NonNull<u8>,
        aligned: usize,
    ) -> Pointer<u8> {
        if block.as_ref().status() == BlockStatus::Mapped {
            // A mapping is released as one piece, so even shrinking means
            // moving. Where to depends on whether the smaller size still
            // deserves its own mapping.
            let new_address = if is_heap_request(aligned, MMAP_THRESHOLD) {
                self.request_heap_block(aligned)?
            } else {
                self.request_mapped_block(aligned)?
            };

            ptr::copy_nonoverlapping(address.as_ptr(), new_address.as_ptr(), aligned);
            self.release_mapped_block(block);

            return Some(new_address);
        }

        // Heap blocks shrink in place. The surplus becomes a free block when
        // it is big enough to stand on its own; the next placement run will
        // merge it with whatever free space follows.
        self.split_if_possible(block, aligned);

        Some(address)
    }

    /// Grows the allocation at `address` to `aligned` bytes, which is
    /// strictly larger than the current payload.
    pub(crate) unsafe fn grow_block(
        &mut self,
        mut block: NonNull<BlockHeader>,
        address: NonNull<u8>,
        aligned: usize,
    ) -> Pointer<u8> {
        if block.as_ref().status() == BlockStatus::Mapped {
            let new_address = self.request_mapped_block(aligned)?;

            ptr::copy_nonoverlapping(address.as_ptr(), new_address.as_ptr(), block.as_ref().size());
            self.release_mapped_block(block);

            return Some(new_address);
        }

        // The request outgrew the heap regime: move it to its own mapping.
        // The heap block stays behind as free space for future requests; no
        // point merging it right now, the next placement run will.
        if !is_heap_request(aligned, MMAP_THRESHOLD) {
            let new_address = self.request_mapped_block(aligned)?;

            ptr::copy_nonoverlapping(address.as_ptr(), new_address.as_ptr(), block.as_ref().size());
            block.as_mut().data.status = BlockStatus::Free;

            return Some(new_address);
        }

        // The block that ends at the program break can simply stretch over
        // fresh break memory.
        if self.last_heap_block() == Some(block) {
            self.source.extend_break(aligned - block.as_ref().size())?;
            block.as_mut().data.size = aligned;

            return Some(address);
        }

        // Try swallowing the free blocks that physically follow this one.
        // The payload size has to be captured first: if the absorbed space
        // still isn't enough we fall back to moving, and what must be copied
        // is the payload as it was before it grew over its neighbors.
        let previous_size = block.as_ref().size();
        self.absorb_following_free_blocks(block, aligned);

        if block.as_ref().size() >= aligned {
            self.split_if_possible(block, aligned);
            return Some(address);
        }

        let new_address = self.request_heap_block(aligned)?;

        // Source and destination live on the same heap, so play it safe with
        // overlap.
        ptr::copy(address.as_ptr(), new_address.as_ptr(), previous_size);
        block.as_mut().data.status = BlockStatus::Free;

        Some(new_address)
    }

    /// Extends `block` over the free blocks that follow it in the list,
    /// stopping at the first allocated block or once `aligned` bytes are
    /// covered. Mapped blocks are stepped over: they don't occupy heap
    /// space, so the heap block after one in the list is still physically
    /// adjacent.
    unsafe fn absorb_following_free_blocks(
        &mut self,
        mut block: NonNull<BlockHeader>,
        aligned: usize,
    ) {
        let mut cursor = block.as_ref().next;

        while let Some(node) = cursor {
            if block.as_ref().size() >= aligned {
                break;
            }

            cursor = node.as_ref().next;

            match node.as_ref().status() {
                BlockStatus::Mapped => {}
                BlockStatus::Allocated => break,
                BlockStatus::Free => {
                    block.as_mut().data.size += node.as_ref().total_size();
                    self.blocks.remove(node);
                }
            }
        }
    }
}
