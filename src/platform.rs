use std::ptr::NonNull;

use crate::Pointer;

/// Abstraction over the two OS memory primitives the allocator is built on.
/// The placement and reallocation engines don't care whether the bytes come
/// from a real kernel or from a simulated one, they only need these four
/// operations.
pub trait MemorySource {
    /// Extends the program break by `delta` bytes and returns the previous
    /// break, which is the base address of the freshly usable memory. Returns
    /// `None` if the break cannot be moved. Successive extensions return
    /// contiguous memory; the allocator assumes it owns the break exclusively
    /// for the lifetime of the process. The break is never shrunk and `delta`
    /// is never negative.
    fn extend_break(&mut self, delta: usize) -> Pointer<u8>;

    /// Obtains a private anonymous mapping of at least `length` bytes,
    /// zero-filled, or `None` if the kernel refuses.
    fn map_anon(&mut self, length: usize) -> Pointer<u8>;

    /// Releases `length` bytes starting at `address`, previously returned by
    /// [`MemorySource::map_anon`] with the same `length`.
    ///
    /// # Panics
    ///
    /// Unmap failure means a block descriptor was corrupted or somebody else
    /// touched our mappings, so it is treated as fatal.
    ///
    /// # Safety
    ///
    /// `address` must be a mapping base obtained from this source and not
    /// released before.
    unsafe fn unmap(&mut self, address: NonNull<u8>, length: usize);

    /// Virtual memory page size in bytes.
    fn page_size(&mut self) -> usize;
}

/// The memory of the running process. This is the source behind the global
/// allocator use case; it carries no state of its own because the program
/// break and the mapping table belong to the process. Only one allocator
/// should drive it, since two of them would fight over the break.
pub struct Platform;

#[cfg(unix)]
#[cfg(not(miri))]
mod unix {
    use std::ptr::{self, NonNull};

    use super::{MemorySource, Platform};
    use crate::Pointer;

    /// Virtual memory page size. 4096 bytes on most computers. This should be
    /// a constant but we don't know the value at compile time.
    static mut PAGE_SIZE: usize = 0;

    impl MemorySource for Platform {
        fn extend_break(&mut self, delta: usize) -> Pointer<u8> {
            if delta > libc::intptr_t::MAX as usize {
                return None;
            }

            // For the details of `sbrk` see
            // https://man7.org/linux/man-pages/man2/brk.2.html
            let previous = unsafe { libc::sbrk(delta as libc::intptr_t) };

            if previous as isize == -1 {
                None
            } else {
                NonNull::new(previous.cast())
            }
        }

        fn map_anon(&mut self, length: usize) -> Pointer<u8> {
            // Memory protection. Read-Write only.
            let protection = libc::PROT_READ | libc::PROT_WRITE;

            // Memory should be private to our process and not mapped to any
            // file. For all the configuration options that `mmap` accepts see
            // https://man7.org/linux/man-pages/man2/mmap.2.html
            let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;

            match unsafe { libc::mmap(ptr::null_mut(), length, protection, flags, -1, 0) } {
                libc::MAP_FAILED => None,
                address => NonNull::new(address.cast()),
            }
        }

        unsafe fn unmap(&mut self, address: NonNull<u8>, length: usize) {
            if libc::munmap(address.cast().as_ptr(), length) != 0 {
                panic!("failed to unmap {length} bytes at {address:?}");
            }
        }

        fn page_size(&mut self) -> usize {
            unsafe {
                if PAGE_SIZE == 0 {
                    PAGE_SIZE = libc::sysconf(libc::_SC_PAGE_SIZE) as usize;
                }

                PAGE_SIZE
            }
        }
    }
}

#[cfg(miri)]
mod miri {
    //! When using Miri, we can't rely on system calls such as `sbrk` because
    //! there's no FFI support, so instead we'll simulate the program break
    //! inside a fixed chunk obtained from the global allocator, and delegate
    //! mappings to the global allocator directly. This is also useful for
    //! detecting memory leaks in our own allocator (mapped blocks that are
    //! never returned back to the kernel).

    use std::{alloc, ptr::NonNull};

    use super::{MemorySource, Platform};
    use crate::Pointer;

    const SIMULATED_PAGE_SIZE: usize = 4096;
    const BREAK_CAPACITY: usize = 4 * 1024 * 1024;

    static mut BREAK_BASE: *mut u8 = std::ptr::null_mut();
    static mut BREAK_OFFSET: usize = 0;

    fn map_layout(length: usize) -> alloc::Layout {
        alloc::Layout::from_size_align(length, SIMULATED_PAGE_SIZE).unwrap()
    }

    impl MemorySource for Platform {
        fn extend_break(&mut self, delta: usize) -> Pointer<u8> {
            unsafe {
                if BREAK_BASE.is_null() {
                    BREAK_BASE = alloc::alloc(map_layout(BREAK_CAPACITY));
                    if BREAK_BASE.is_null() {
                        return None;
                    }
                }

                if delta > BREAK_CAPACITY - BREAK_OFFSET {
                    return None;
                }

                let previous = BREAK_BASE.add(BREAK_OFFSET);
                BREAK_OFFSET += delta;

                NonNull::new(previous)
            }
        }

        fn map_anon(&mut self, length: usize) -> Pointer<u8> {
            NonNull::new(unsafe { alloc::alloc_zeroed(map_layout(length)) })
        }

        unsafe fn unmap(&mut self, address: NonNull<u8>, length: usize) {
            alloc::dealloc(address.as_ptr(), map_layout(length));
        }

        fn page_size(&mut self) -> usize {
            SIMULATED_PAGE_SIZE
        }
    }
}

/// A memory source that simulates a private program break inside one big
/// allocation and serves mappings from the global allocator. Every instance
/// is a little isolated process: tests build an allocator on top of a fresh
/// arena, poke at it, inspect how far the simulated break moved, and drop
/// the whole thing without disturbing any other test running in parallel.
///
/// # Examples
///
/// ```rust
/// use bralloc::{ArenaSource, BreakAllocator};
///
/// let mut allocator = BreakAllocator::with_source(ArenaSource::with_capacity(1024 * 1024));
///
/// unsafe {
///     let address = allocator.allocate(96).unwrap();
///     address.as_ptr().write_bytes(0xAB, 96);
///     allocator.free(address.as_ptr());
/// }
/// ```
pub struct ArenaSource {
    base: NonNull<u8>,
    capacity: usize,
    offset: usize,
}

/// Arenas and their mappings come from the global allocator, and mapped
/// chunks are page-aligned like the real thing.
const ARENA_PAGE_SIZE: usize = 4096;

impl ArenaSource {
    /// Creates an arena whose simulated break can move `capacity` bytes in
    /// total before extensions start failing.
    pub fn with_capacity(capacity: usize) -> Self {
        let layout = std::alloc::Layout::from_size_align(capacity, ARENA_PAGE_SIZE).unwrap();

        let Some(base) = NonNull::new(unsafe { std::alloc::alloc(layout) }) else {
            std::alloc::handle_alloc_error(layout);
        };

        Self {
            base,
            capacity,
            offset: 0,
        }
    }

    /// How far the simulated program break has moved, in bytes. Useful for
    /// asserting that an operation did or did not touch the break.
    pub fn break_position(&self) -> usize {
        self.offset
    }
}

impl MemorySource for ArenaSource {
    fn extend_break(&mut self, delta: usize) -> Pointer<u8> {
        if delta > self.capacity - self.offset {
            return None;
        }

        let previous = unsafe { self.base.as_ptr().add(self.offset) };
        self.offset += delta;

        NonNull::new(previous)
    }

    fn map_anon(&mut self, length: usize) -> Pointer<u8> {
        let layout = std::alloc::Layout::from_size_align(length, ARENA_PAGE_SIZE).unwrap();
        NonNull::new(unsafe { std::alloc::alloc_zeroed(layout) })
    }

    unsafe fn unmap(&mut self, address: NonNull<u8>, length: usize) {
        let layout = std::alloc::Layout::from_size_align(length, ARENA_PAGE_SIZE).unwrap();
        std::alloc::dealloc(address.as_ptr(), layout);
    }

    fn page_size(&mut self) -> usize {
        ARENA_PAGE_SIZE
    }
}

impl Drop for ArenaSource {
    fn drop(&mut self) {
        let layout = std::alloc::Layout::from_size_align(self.capacity, ARENA_PAGE_SIZE).unwrap();
        unsafe { std::alloc::dealloc(self.base.as_ptr(), layout) };
    }
}
