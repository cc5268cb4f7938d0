//! Debug instrumentation (C6): poison fill, quarantine, double-free
//! detection, leak tagging, and allocation counters.
//!
//! Everything here is gated behind the `debug_checks` feature (on by
//! default). With the feature off, every function in this module is a
//! zero-cost no-op so release builds pay nothing for it.

/// Byte pattern written across a freed or freshly carved bin.
pub const POISON_BYTE: u8 = 0xFE;
/// Sentinel a test harness can stamp into freed memory to simulate a
/// detectable use-after-free; ordinary poisoned memory never carries it, so
/// seeing it on allocation is the anomalous case, not the common one.
pub const UAF_SENTINEL: u8 = 0xDD;

/// A leaked allocation surviving at `dump_leaks` time.
#[derive(Debug, Clone)]
pub struct LeakRecord {
    pub address: usize,
    pub size: usize,
    pub origin: &'static str,
}

#[cfg(feature = "debug_checks")]
mod imp {
    use super::{LeakRecord, POISON_BYTE, UAF_SENTINEL};
    use std::collections::{HashMap, HashSet, VecDeque};
    use std::ptr::NonNull;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    pub const QUARANTINE_CAPACITY: usize = 256;

    struct QuarantineEntry {
        ptr: usize,
        bin_size: u32,
    }

    lazy_static::lazy_static! {
        static ref QUARANTINE: Mutex<VecDeque<QuarantineEntry>> = Mutex::new(VecDeque::new());
        static ref LIVE_SET: Mutex<HashSet<usize>> = Mutex::new(HashSet::new());
        static ref LEAK_MAP: Mutex<HashMap<usize, LeakRecord>> = Mutex::new(HashMap::new());
    }

    static ALLOC_COUNT: AtomicU64 = AtomicU64::new(0);
    static FREE_COUNT: AtomicU64 = AtomicU64::new(0);
    static COMMIT_COUNT: AtomicU64 = AtomicU64::new(0);
    static DECOMMIT_COUNT: AtomicU64 = AtomicU64::new(0);

    pub fn poison_fill(ptr: NonNull<u8>, len: usize) {
        if len == 0 {
            return;
        }
        unsafe { std::ptr::write_bytes(ptr.as_ptr(), POISON_BYTE, len) };
    }

    /// Checks the leading byte against the UAF sentinel. A match means this
    /// memory was deliberately marked corrupted since it was last freed;
    /// logs a warning but never aborts the process (debug, not a panic).
    pub fn check_canary_on_alloc(ptr: NonNull<u8>) {
        let byte = unsafe { *ptr.as_ptr() };
        if byte == UAF_SENTINEL {
            log::warn!(
                "allocation at {:p} carries the use-after-free sentinel",
                ptr.as_ptr()
            );
        }
    }

    /// Records `ptr` as live. Call once per successful allocation.
    pub fn tag_alloc(ptr: NonNull<u8>, size: usize, origin: &'static str) {
        let addr = ptr.as_ptr() as usize;
        LIVE_SET.lock().unwrap().insert(addr);
        LEAK_MAP
            .lock()
            .unwrap()
            .insert(addr, LeakRecord { address: addr, size, origin });
        ALLOC_COUNT.fetch_add(1, Ordering::Relaxed);
    }

    /// Asserts `ptr` was live and marks it freed. Panics on double free.
    pub fn check_double_free(ptr: NonNull<u8>) {
        let addr = ptr.as_ptr() as usize;
        let was_live = LIVE_SET.lock().unwrap().remove(&addr);
        assert!(was_live, "double free detected at {:p}", ptr.as_ptr());
    }

    pub fn tag_free(ptr: NonNull<u8>) {
        let addr = ptr.as_ptr() as usize;
        LEAK_MAP.lock().unwrap().remove(&addr);
        FREE_COUNT.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns every allocation still live; call at shutdown.
    pub fn dump_leaks() -> Vec<LeakRecord> {
        LEAK_MAP.lock().unwrap().values().cloned().collect()
    }

    /// Offers `(ptr, bin_size)` to the quarantine. Returns `true` if the
    /// caller should skip the normal free path (the quarantine now owns the
    /// pointer). The evicted entry, if any, is freed through
    /// `evict` *after* the quarantine lock is released, to avoid a lock
    /// inversion with the owning class's grow lock.
    pub fn quarantine_push(ptr: NonNull<u8>, bin_size: u32) -> bool {
        let evicted = {
            let mut q = QUARANTINE.lock().unwrap();
            q.push_back(QuarantineEntry {
                ptr: ptr.as_ptr() as usize,
                bin_size,
            });
            if q.len() > QUARANTINE_CAPACITY {
                q.pop_front()
            } else {
                None
            }
        };

        if let Some(entry) = evicted {
            crate::binned::free_from_quarantine(entry.ptr, entry.bin_size);
        }

        true
    }

    pub fn count_commit() {
        COMMIT_COUNT.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count_decommit() {
        DECOMMIT_COUNT.fetch_add(1, Ordering::Relaxed);
    }

    pub struct Counters {
        pub alloc: u64,
        pub free: u64,
        pub commit: u64,
        pub decommit: u64,
    }

    pub fn counters() -> Counters {
        Counters {
            alloc: ALLOC_COUNT.load(Ordering::Relaxed),
            free: FREE_COUNT.load(Ordering::Relaxed),
            commit: COMMIT_COUNT.load(Ordering::Relaxed),
            decommit: DECOMMIT_COUNT.load(Ordering::Relaxed),
        }
    }
}

#[cfg(not(feature = "debug_checks"))]
mod imp {
    use super::LeakRecord;
    use std::ptr::NonNull;

    #[inline(always)]
    pub fn poison_fill(_ptr: NonNull<u8>, _len: usize) {}
    #[inline(always)]
    pub fn check_canary_on_alloc(_ptr: NonNull<u8>) {}
    #[inline(always)]
    pub fn tag_alloc(_ptr: NonNull<u8>, _size: usize, _origin: &'static str) {}
    #[inline(always)]
    pub fn check_double_free(_ptr: NonNull<u8>) {}
    #[inline(always)]
    pub fn tag_free(_ptr: NonNull<u8>) {}
    pub fn dump_leaks() -> Vec<LeakRecord> {
        Vec::new()
    }
    #[inline(always)]
    pub fn quarantine_push(_ptr: NonNull<u8>, _bin_size: u32) -> bool {
        false
    }
    #[inline(always)]
    pub fn count_commit() {}
    #[inline(always)]
    pub fn count_decommit() {}

    pub struct Counters {
        pub alloc: u64,
        pub free: u64,
        pub commit: u64,
        pub decommit: u64,
    }

    pub fn counters() -> Counters {
        Counters { alloc: 0, free: 0, commit: 0, decommit: 0 }
    }
}

pub use imp::*;

#[cfg(all(test, feature = "debug_checks"))]
mod test {
    use super::*;
    use std::ptr::NonNull;

    #[test]
    fn double_free_is_detected() {
        let mut byte = 0u8;
        let ptr = NonNull::new(&mut byte as *mut u8).unwrap();
        tag_alloc(ptr, 1, "test");
        check_double_free(ptr);

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            check_double_free(ptr);
        }));
        assert!(result.is_err());
    }

    #[test]
    fn quarantine_evicts_oldest_over_capacity() {
        // Leaked (not stack-local) so these addresses stay valid for the
        // rest of the process: an evicted entry is freed through the real
        // binned allocator, which would otherwise dereference a dangling
        // stack slot once this test returns. A bin size no real class uses
        // keeps the eviction a no-op against the shared allocator state.
        let storage: &'static mut [u8] = Box::leak(vec![0u8; QUARANTINE_CAPACITY + 1].into_boxed_slice());
        for i in 0..QUARANTINE_CAPACITY + 1 {
            let p = NonNull::new(unsafe { storage.as_mut_ptr().add(i) }).unwrap();
            quarantine_push(p, u32::MAX);
        }
    }

    #[test]
    fn leaks_are_tracked_until_freed() {
        let mut byte = 0u8;
        let ptr = NonNull::new(&mut byte as *mut u8).unwrap();
        tag_alloc(ptr, 1, "leak_test_origin");
        assert!(dump_leaks().iter().any(|r| r.address == ptr.as_ptr() as usize));
        tag_free(ptr);
        assert!(!dump_leaks().iter().any(|r| r.address == ptr.as_ptr() as usize));
    }
}
