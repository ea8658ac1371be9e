use bralloc::{ArenaSource, BreakAllocator};

fn print_alloc(addr: *mut u8, size: usize) {
    println!("Requested {size} bytes of memory");
    println!("Received this address: {addr:?}");
}

fn main() {
    // A full allocator running inside a 1 MiB arena instead of the real
    // program break. Handy for poking at the machinery without owning the
    // process memory.
    let mut allocator = BreakAllocator::with_source(ArenaSource::with_capacity(1024 * 1024));

    unsafe {
        let addr1 = allocator.allocate(1).unwrap().as_ptr();
        print_alloc(addr1, 1);

        let addr2 = allocator.allocate(1024).unwrap().as_ptr();
        print_alloc(addr2, 1024);

        let addr3 = allocator.zero_allocate(512, 8).unwrap().as_ptr();
        print_alloc(addr3, 512 * 8);

        println!("\nLet's try some reallocs");

        addr2.write_bytes(0xAB, 1024);
        let bigger = allocator.reallocate(addr2, 64 * 1024).unwrap().as_ptr();
        println!("1024 bytes moved from {addr2:?} to {bigger:?}");
        println!("First byte still intact: {:#04x}", *bigger);

        println!("\nDeallocating everything...");
        allocator.free(addr1);
        allocator.free(bigger);
        allocator.free(addr3);
    }
}
