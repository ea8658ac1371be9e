use bralloc::Bralloc;

// NOTE: Bralloc serves 8-aligned payloads only, which covers everything the
// standard collections in this program ask for. A program that allocates with
// stricter alignments would see those allocations fail.

#[global_allocator]
static ALLOCATOR: Bralloc = Bralloc::new();

// Requests whose header plus payload reach 128 KiB skip the heap and get
// their own anonymous mapping.
const THRESHOLD: usize = 128 * 1024;

fn main() {
    // Small buffers are carved out of the allocator's heap, the region it
    // grows by moving the program break.
    let mut buffer = vec![0xAB_u8; 512];
    let on_heap = buffer.as_ptr();
    println!("512 byte buffer on the heap at {on_heap:?}");

    // Growing the vector past the threshold reallocates its buffer across
    // the regime boundary: the payload is copied into a fresh mapping and
    // the old heap block is left behind for reuse.
    buffer.reserve(2 * THRESHOLD);
    let in_mapping = buffer.as_ptr();
    println!("after reserve({}) it moved to a mapping at {in_mapping:?}", 2 * THRESHOLD);
    assert_ne!(on_heap, in_mapping);
    assert!(buffer.iter().all(|&byte| byte == 0xAB));

    // Shrinking it back below the threshold crosses the boundary the other
    // way: the payload returns to the heap and the mapping goes straight
    // back to the kernel.
    buffer.shrink_to_fit();
    let back_on_heap = buffer.as_ptr();
    println!("after shrink_to_fit it is back on the heap at {back_on_heap:?}");
    assert_ne!(in_mapping, back_on_heap);
    assert!(buffer.iter().all(|&byte| byte == 0xAB));

    // Drop the dirtied buffer and ask for zeroed memory of a similar size.
    // The allocator reuses the freed heap space, and the zeroed allocation
    // path wipes it even though the kernel never saw these bytes again.
    drop(buffer);
    let zeroed = vec![0_u8; 1024];
    assert!(zeroed.iter().all(|&byte| byte == 0));
    println!(
        "recycled heap memory handed back zeroed: {} bytes at {:?}",
        zeroed.len(),
        zeroed.as_ptr()
    );
}
