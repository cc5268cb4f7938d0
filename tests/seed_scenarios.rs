//! End-to-end seed scenarios against the public `RawAllocator` surface.
//! Each scenario runs in its own test binary (cargo's default for
//! `tests/*.rs`), which keeps the process-wide free-list/quarantine
//! singletons from one scenario's churn leaking into another's.
use cinderheap::{counters, default_allocator, RawAllocator};

/// S1 — small round-trip: repeated alloc/free of a 24-byte request (class
/// bin size 32) must not keep growing the class past its first block.
#[test]
fn small_round_trip_does_not_grow_past_one_block() {
    let a = default_allocator();
    let p = a.allocate(24, 16).expect("first allocation should succeed");
    assert_eq!(p.as_ptr() as usize % 16, 0);
    a.deallocate(p, 24);

    let commits_before = counters().commit;
    for _ in 0..100_000 {
        let p = a.allocate(24, 16).expect("round-trip allocation should succeed");
        a.deallocate(p, 24);
    }
    // One VM commit carved the class's first (and only) block; none of the
    // round-trips that follow should have needed another.
    assert_eq!(counters().commit, commits_before);
}

/// S2 — alignment spill: a request whose alignment exceeds its class's
/// natural alignment is routed to the large tier and round-trips cleanly
/// through the same `deallocate` entry point small allocations use.
#[test]
fn alignment_spill_routes_through_large_tier_and_frees_cleanly() {
    let a = default_allocator();
    let p = a.allocate(64, 4096).expect("large-routed allocation should succeed");
    assert_eq!(p.as_ptr() as usize % 4096, 0);
    unsafe {
        std::ptr::write_bytes(p.as_ptr(), 0xAB, 64);
        assert_eq!(*p.as_ptr(), 0xAB);
    }
    a.deallocate(p, 64);
}

/// S6 — quarantine FIFO: with quarantine capacity 256 (see
/// `debug::QUARANTINE_CAPACITY`), freeing 300 same-class pointers must
/// evict the first 44 back to the real free list while the remaining 256
/// stay quarantined. Observed indirectly: the class must still be able to
/// satisfy 44 fresh allocations without a new VM commit (the evicted
/// pointers were recycled), while the last 256 freed addresses are not
/// immediately available for reuse.
#[test]
#[cfg(feature = "debug_checks")]
fn quarantine_evicts_oldest_entries_first() {
    let a = default_allocator();

    // Warm the class so all 300 pointers come from the same, already-grown
    // block instead of tripping a fresh grow mid-scenario.
    let warm: Vec<_> = (0..300).map(|_| a.allocate(16, 16).unwrap()).collect();
    let commits_after_warm = counters().commit;
    for p in warm {
        a.deallocate(p, 16);
    }

    // Every one of those 300 frees went through quarantine (debug_checks is
    // on); the first 44 have since been evicted back to the free list.
    let reused: Vec<_> = (0..44).map(|_| a.allocate(16, 16).unwrap()).collect();
    assert_eq!(reused.len(), 44);
    // Recycled from quarantine eviction, not from growing a new block.
    assert_eq!(counters().commit, commits_after_warm);
    for p in reused {
        a.deallocate(p, 16);
    }
}
