//! Demonstrates the large-block path: payloads above the mapping threshold
//! bypass the heap and get whole anonymous mappings of their own.

use std::alloc::Layout;

use segalloc::SegAlloc;

fn log_alloc(addr: *mut u8, layout: Layout) {
    println!("Requested {} bytes of memory", layout.size());
    println!("Received this address: {addr:?}");
}

fn main() {
    let allocator = SegAlloc::new();

    unsafe {
        // Small enough for the heap.
        let layout1 = Layout::array::<u8>(1024).unwrap();
        let addr1 = allocator.allocate(layout1);
        log_alloc(addr1, layout1);

        // Far past the threshold: served by an anonymous mapping.
        let layout2 = Layout::array::<u8>(256 * 1024).unwrap();
        let addr2 = allocator.allocate(layout2);
        log_alloc(addr2, layout2);

        addr2.write(0xAA);
        addr2.add(layout2.size() - 1).write(0xBB);
        println!(
            "First byte: {:#x}, last byte: {:#x}",
            *addr2,
            *addr2.add(layout2.size() - 1)
        );

        println!("Deallocating everything...");
        allocator.deallocate(addr1, layout1);
        allocator.deallocate(addr2, layout2);
    }
}
