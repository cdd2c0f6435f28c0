//! Walks through allocation, splitting and coalescing on a small heap and
//! prints the free list after every step.

use memheap::{GRANULE, HeapConfig, InterruptFlag, MemHeap};

fn dump(heap: &MemHeap<InterruptFlag>, step: &str) {
    println!("== {step}");
    match heap.stats() {
        Ok(stats) => print!("{stats}"),
        Err(err) => println!("cannot walk free list: {err}"),
    }
}

fn main() -> memheap::Result<()> {
    let heap = MemHeap::map(HeapConfig::new(8 * GRANULE), InterruptFlag::new())?;
    dump(&heap, "initial");

    let a = heap.allocate(GRANULE)?;
    let b = heap.allocate(3 * GRANULE - 5)?;
    let c = heap.allocate(2 * GRANULE)?;
    println!("a = {a:p}, b = {b:p}, c = {c:p}");
    dump(&heap, "after three allocations");

    unsafe {
        heap.release(b, 3 * GRANULE - 5)?;
        dump(&heap, "released b (isolated hole)");

        heap.release(a, GRANULE)?;
        dump(&heap, "released a (merged with b)");

        heap.release(c, 2 * GRANULE)?;
        dump(&heap, "released c (whole arena again)");
    }

    let below = std::ptr::NonNull::new(heap.base().as_ptr().wrapping_sub(1)).expect("non-null");
    match unsafe { heap.release(below, GRANULE) } {
        Ok(()) => println!("release below the arena unexpectedly succeeded"),
        Err(err) => println!("release below the arena: {err}"),
    }

    Ok(())
}
