//! The public allocator surface (C7): a minimal `RawAllocator` capability,
//! a process-wide default handle dispatching across the binned and large
//! tiers, and a typed owning buffer bound to an allocator at construction.
use std::marker::PhantomData;
use std::ptr::NonNull;

use crate::binned::{self, AllocOutcome};
use crate::large;

/// A raw, untyped allocation capability: allocate and deallocate by size
/// and alignment, nothing else. `allocate` returns `None` for any transient
/// failure (OOM or backoff gating); it never panics or unwinds.
pub trait RawAllocator {
    fn allocate(&self, size: usize, alignment: usize) -> Option<NonNull<u8>>;
    fn deallocate(&self, p: NonNull<u8>, size: usize);
}

impl<T: RawAllocator + ?Sized> RawAllocator for &T {
    fn allocate(&self, size: usize, alignment: usize) -> Option<NonNull<u8>> {
        (**self).allocate(size, alignment)
    }

    fn deallocate(&self, p: NonNull<u8>, size: usize) {
        (**self).deallocate(p, size)
    }
}

/// The tiered default allocator: small requests go through the binned
/// allocator, everything else (oversize, or alignment beyond a class's
/// natural alignment) goes through the large tier.
pub struct DefaultAllocator;

impl RawAllocator for DefaultAllocator {
    fn allocate(&self, size: usize, alignment: usize) -> Option<NonNull<u8>> {
        match binned::allocate(size, alignment) {
            AllocOutcome::Allocated(p) => Some(p),
            AllocOutcome::RouteToLarge => large::allocate(size, alignment, large::guards_default()),
            AllocOutcome::OutOfMemory => None,
        }
    }

    fn deallocate(&self, p: NonNull<u8>, size: usize) {
        if large::maybe_deallocate(p) {
            return;
        }
        binned::deallocate(p, size);
    }
}

/// Drives only the binned tier; used where a caller already knows a request
/// is small (tests, the seed-scenario harness).
pub struct SmallAllocator;

impl RawAllocator for SmallAllocator {
    fn allocate(&self, size: usize, alignment: usize) -> Option<NonNull<u8>> {
        match binned::allocate(size, alignment) {
            AllocOutcome::Allocated(p) => Some(p),
            _ => None,
        }
    }

    fn deallocate(&self, p: NonNull<u8>, size: usize) {
        binned::deallocate(p, size);
    }
}

/// Drives only the large tier.
pub struct LargeAllocatorHandle;

impl RawAllocator for LargeAllocatorHandle {
    fn allocate(&self, size: usize, alignment: usize) -> Option<NonNull<u8>> {
        large::allocate(size, alignment, large::guards_default())
    }

    fn deallocate(&self, p: NonNull<u8>, _size: usize) {
        large::deallocate(p, _size);
    }
}

/// Returns the process-wide default allocator handle.
pub fn default_allocator() -> &'static DefaultAllocator {
    &DefaultAllocator
}

/// Drains the calling thread's magazines into the global free lists.
pub fn flush_tls() {
    binned::flush_tls();
}

/// Installs a hook invoked whenever a binned class fails to grow.
pub fn set_memory_pressure_handler(handler: impl Fn() + Send + Sync + 'static) {
    binned::set_memory_pressure_handler(handler);
}

/// A byte buffer owning memory from a `RawAllocator`, released on drop.
/// Must not outlive the allocator it was constructed with.
pub struct RawBuffer<'a, A: RawAllocator> {
    ptr: NonNull<u8>,
    size: usize,
    allocator: &'a A,
    _marker: PhantomData<&'a A>,
}

impl<'a, A: RawAllocator> RawBuffer<'a, A> {
    pub fn new(allocator: &'a A, size: usize, alignment: usize) -> Option<Self> {
        let ptr = allocator.allocate(size, alignment)?;
        Some(RawBuffer { ptr, size, allocator, _marker: PhantomData })
    }

    pub fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
}

impl<'a, A: RawAllocator> Drop for RawBuffer<'a, A> {
    fn drop(&mut self) {
        self.allocator.deallocate(self.ptr, self.size);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_allocator_round_trips_small_and_large() {
        let a = default_allocator();
        let small = a.allocate(24, 16).expect("small alloc should succeed");
        assert_eq!(small.as_ptr() as usize % 16, 0);
        a.deallocate(small, 24);

        let large = a.allocate(64, 4096).expect("large-routed alloc should succeed");
        assert_eq!(large.as_ptr() as usize % 4096, 0);
        a.deallocate(large, 64);
    }

    #[test]
    fn raw_buffer_releases_on_drop() {
        let a = SmallAllocator;
        let buf = RawBuffer::new(&a, 32, 16).expect("allocate should succeed");
        assert_eq!(buf.len(), 32);
    }
}
