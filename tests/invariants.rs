//! Property-based check of the allocator's universal invariant: every
//! successful `allocate(s, a)` returns a non-null, `a`-aligned pointer
//! backed by at least `s` bytes of writable memory.
use cinderheap::{default_allocator, RawAllocator};
use proptest::prelude::*;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn allocate_returns_aligned_writable_memory(
        size in 1usize..8192,
        align_shift in 0u32..13,
    ) {
        let alignment = 1usize << align_shift;
        let a = default_allocator();
        if let Some(p) = a.allocate(size, alignment) {
            prop_assert_eq!(p.as_ptr() as usize % alignment, 0);
            unsafe {
                std::ptr::write_bytes(p.as_ptr(), 0x7A, size);
                prop_assert_eq!(*p.as_ptr(), 0x7A);
                prop_assert_eq!(*p.as_ptr().add(size - 1), 0x7A);
            }
            a.deallocate(p, size);
        }
    }
}
