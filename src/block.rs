use std::{mem, ptr::NonNull};

use crate::{alignment::ALIGNMENT, list::Node};

/// A complete block header: the list links plus the block bookkeeping,
/// written directly in front of the payload they describe.
pub(crate) type BlockHeader = Node<Block>;

/// Distance in bytes from the start of a block to the start of its payload,
/// rounded up to the alignment granularity so payloads start aligned.
pub(crate) const META: usize =
    (mem::size_of::<BlockHeader>() + ALIGNMENT - 1) & !(ALIGNMENT - 1);

// The conversions below step over the header by exactly `META` bytes, so the
// rounded constant has to match the struct size. If a future field pushes the
// struct past a multiple of 8 this trips and the offset math must grow
// explicit padding.
const _: () = assert!(META == mem::size_of::<BlockHeader>());

/// What a block is currently used for. Heap blocks flip between `Free` and
/// `Allocated` over their lifetime; a mapped block is born `Mapped` and keeps
/// that status until its whole region is returned to the kernel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum BlockStatus {
    /// Heap block available for reuse.
    Free,
    /// Heap block currently owned by the caller.
    Allocated,
    /// Block with its own anonymous mapping, currently owned by the caller.
    Mapped,
}

/// Block bookkeeping. Together with the list links of [`Node`] this forms
/// the [`BlockHeader`] that precedes every payload in memory:
///
/// ```text
/// +----------------------------+   <--+
/// | pointer to next block      |      |
/// +----------------------------+      |
/// | pointer to prev block      |      | BlockHeader, META bytes
/// +----------------------------+      |
/// | payload size               |      |
/// +----------------------------+      |
/// | status (+ padding)         |   <--+
/// +----------------------------+
/// |       Block payload        |   <--+
/// |            ...             |      | What the caller gets. Always
/// |            ...             |      | 8-aligned, `size` bytes long.
/// |            ...             |   <--+
/// +----------------------------+
/// ```
///
/// Heap blocks are physically back to back: the header of the next heap
/// block starts exactly where the previous payload ends. That is what makes
/// coalescing and splitting pure size arithmetic. Mapped blocks live in
/// their own mappings at unrelated addresses and never participate in any
/// of that.
pub(crate) struct Block {
    /// Payload size in bytes, excluding [`META`]. Always a multiple of the
    /// alignment granularity.
    pub size: usize,
    /// Current use of this block.
    pub status: BlockStatus,
}

impl BlockHeader {
    /// Where the caller's bytes start: `META` bytes into the block. Headers
    /// are only ever written at 8-aligned addresses and `META` is a multiple
    /// of 8, which is how the operations keep their aligned-pointer promise.
    ///
    /// These conversions take the header as an argument instead of `&self`
    /// on purpose: the blocks they point into are also reachable through
    /// pointers the caller holds, and materializing references here would
    /// hand Miri an aliasing complaint.
    #[inline]
    pub unsafe fn payload_of(header: NonNull<Self>) -> NonNull<u8> {
        NonNull::new_unchecked(header.as_ptr().cast::<u8>().add(META))
    }

    /// Recovers the header in front of a payload, stepping the same `META`
    /// bytes back. Only meaningful for payload addresses this allocator
    /// produced; the operations guarantee that by looking caller pointers up
    /// in the block list rather than trusting them blindly.
    #[inline]
    pub unsafe fn from_payload(payload: NonNull<u8>) -> NonNull<Self> {
        NonNull::new_unchecked(payload.as_ptr().sub(META)).cast()
    }

    /// Helper function to reduce boilerplate. Since the complete block header
    /// is a [`Node`] all [`Block`] fields have to be accessed through `data`.
    #[inline]
    pub fn status(&self) -> BlockStatus {
        self.data.status
    }

    #[inline]
    pub fn is_free(&self) -> bool {
        self.data.status == BlockStatus::Free
    }

    /// Payload size excluding [`META`].
    #[inline]
    pub fn size(&self) -> usize {
        self.data.size
    }

    /// Total block size including [`META`].
    #[inline]
    pub fn total_size(&self) -> usize {
        META + self.data.size
    }

    /// First byte past this block. For a heap block this is where the next
    /// heap block starts, or the program break itself if the block is the
    /// last one.
    ///
    /// # Safety
    ///
    /// `header` must point to a live block header.
    #[inline]
    pub unsafe fn end_of(header: NonNull<Self>) -> NonNull<u8> {
        let total = header.as_ref().total_size();
        NonNull::new_unchecked(header.cast::<u8>().as_ptr().add(total))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_size_is_aligned() {
        assert_eq!(META % ALIGNMENT, 0);
        assert!(META >= mem::size_of::<BlockHeader>());
    }

    #[test]
    fn payload_sits_meta_bytes_into_the_block() {
        let mut storage = std::mem::MaybeUninit::<[BlockHeader; 2]>::uninit();
        let header = NonNull::new(storage.as_mut_ptr().cast::<BlockHeader>()).unwrap();

        unsafe {
            let payload = BlockHeader::payload_of(header);
            assert_eq!(payload.as_ptr() as usize, header.as_ptr() as usize + META);

            // And the way back lands on the same header.
            assert_eq!(BlockHeader::from_payload(payload), header);
        }
    }

    #[test]
    fn end_address_matches_size_arithmetic() {
        // Three header slots: one for the header itself, two standing in for
        // a 64 byte payload.
        let mut storage = std::mem::MaybeUninit::<[BlockHeader; 3]>::uninit();
        let header = NonNull::new(storage.as_mut_ptr().cast::<BlockHeader>()).unwrap();

        unsafe {
            header.as_ptr().write(BlockHeader {
                next: None,
                prev: None,
                data: Block {
                    size: 64,
                    status: BlockStatus::Allocated,
                },
            });

            let end = BlockHeader::end_of(header);
            assert_eq!(
                end.as_ptr() as usize,
                header.as_ptr() as usize + META + 64
            );
        }
    }
}
