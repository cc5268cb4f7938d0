//! The binned small-object allocator (C5): per-class free lists, growth
//! with backoff, and the allocate/deallocate hot paths.
#[cfg(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
))]
use contracts::*;
#[cfg(not(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
)))]
use disabled_contracts::*;

use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use crate::class::{ClassIndex, CLASSES};
use crate::vm::VmRegion;

const MIN_BLOCK_SIZE: usize = 256 * 1024;
const MIN_BLOCK_BINS: usize = 64;
const MAX_BACKOFF_EXP: u32 = 16;
const MAX_BACKOFF_MS: u64 = 50;

/// Outcome of a small-tier allocation attempt: either it was handled here,
/// it must be retried against the large tier, or the class is genuinely out
/// of memory right now.
pub enum AllocOutcome {
    Allocated(NonNull<u8>),
    RouteToLarge,
    OutOfMemory,
}

struct Block {
    #[allow(dead_code)]
    region: VmRegion,
}

/// Per-class state: free list, grow/list lock, and backoff bookkeeping.
struct ClassState {
    bin_size: u32,
    /// CAS-guarded spinlock serializing both growth and free-list mutation;
    /// grow uses a non-blocking try-acquire (losers assume someone else grew),
    /// push/pop use a blocking acquire.
    lock: AtomicBool,
    free_head: AtomicUsize,
    free_count: AtomicUsize,
    exhausted: AtomicBool,
    backoff_exp: AtomicU32,
    next_grow_deadline_ns: AtomicU64,
    blocks: Mutex<Vec<Block>>,
}

impl ClassState {
    fn new(bin_size: u32) -> Self {
        ClassState {
            bin_size,
            lock: AtomicBool::new(false),
            free_head: AtomicUsize::new(0),
            free_count: AtomicUsize::new(0),
            exhausted: AtomicBool::new(false),
            backoff_exp: AtomicU32::new(0),
            next_grow_deadline_ns: AtomicU64::new(0),
            blocks: Mutex::new(Vec::new()),
        }
    }

    fn lock_acquire_blocking(&self) {
        while self
            .lock
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
            std::thread::yield_now();
        }
    }

    fn lock_release(&self) {
        self.lock.store(false, Ordering::Release);
    }

    fn push_free_locked(&self, ptr: NonNull<u8>) {
        let prev = self.free_head.load(Ordering::Relaxed);
        unsafe { (ptr.as_ptr() as *mut usize).write(prev) };
        self.free_head.store(ptr.as_ptr() as usize, Ordering::Relaxed);
        self.free_count.fetch_add(1, Ordering::Relaxed);
    }

    fn push_free(&self, ptr: NonNull<u8>) {
        self.lock_acquire_blocking();
        self.push_free_locked(ptr);
        self.lock_release();
    }

    fn pop_free(&self) -> Option<NonNull<u8>> {
        self.lock_acquire_blocking();
        let head = self.free_head.load(Ordering::Relaxed);
        let result = if head == 0 {
            None
        } else {
            let next = unsafe { *(head as *const usize) };
            self.free_head.store(next, Ordering::Relaxed);
            self.free_count.fetch_sub(1, Ordering::Relaxed);
            NonNull::new(head as *mut u8)
        };
        self.lock_release();
        result
    }

    fn should_attempt_grow(&self) -> bool {
        !self.exhausted.load(Ordering::Relaxed) || now_ns() >= self.next_grow_deadline_ns.load(Ordering::Relaxed)
    }

    fn record_growth_failure(&self) {
        self.exhausted.store(true, Ordering::Relaxed);
        let exp = (self.backoff_exp.fetch_add(1, Ordering::Relaxed) + 1).min(MAX_BACKOFF_EXP);
        self.backoff_exp.store(exp, Ordering::Relaxed);
        let delay_ms = 2u64.saturating_pow(exp).min(MAX_BACKOFF_MS);
        let deadline = now_ns() + delay_ms * 1_000_000;
        self.next_grow_deadline_ns.store(deadline, Ordering::Relaxed);
        log::warn!(
            "class bin_size={} failed to grow; backing off {}ms",
            self.bin_size,
            delay_ms
        );
        fire_memory_pressure_handler();
    }

    fn clear_backoff(&self) {
        self.exhausted.store(false, Ordering::Relaxed);
        self.backoff_exp.store(0, Ordering::Relaxed);
        self.next_grow_deadline_ns.store(0, Ordering::Relaxed);
    }

    /// Attempts to grow the class. Returns `true` if the class gained new
    /// free bins, either because this call grew it or because another
    /// thread already holds the lock and is presumed to be growing it.
    fn try_grow(&self) -> bool {
        if self
            .lock
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return true;
        }

        let grown = self.grow_locked();
        self.lock_release();
        grown
    }

    fn grow_locked(&self) -> bool {
        let bin_size = self.bin_size as usize;
        let usable_size = MIN_BLOCK_SIZE.max(bin_size * MIN_BLOCK_BINS);
        // One leading page of slack, never carved into bins: it guarantees
        // every bin pointer has a full page of this block's own committed
        // memory behind it, so the large tier's `maybe_deallocate` probe can
        // always read a header's worth of bytes before any small-tier
        // pointer without risking a read into an unrelated mapping.
        let prefix = crate::vm::page_size();
        let reserve_size = usable_size + prefix;

        let region = match VmRegion::reserve(reserve_size, crate::vm::allocation_granularity()) {
            Ok(r) => r,
            Err(e) => {
                log::warn!("grow: reserve failed for bin_size={bin_size}: {e}");
                self.record_growth_failure();
                return false;
            }
        };

        if let Err(e) = region.commit(0, reserve_size) {
            log::warn!("grow: commit failed for bin_size={bin_size}: {e}");
            self.record_growth_failure();
            return false;
        }
        crate::debug::count_commit();

        let base = region.base().expect("just-reserved region has a base");
        let bin_count = usable_size / bin_size;
        for i in 0..bin_count {
            let ptr = unsafe { NonNull::new_unchecked(base.as_ptr().add(prefix + i * bin_size)) };
            crate::debug::poison_fill(ptr, bin_size);
            self.push_free_locked(ptr);
        }

        self.blocks.lock().unwrap().push(Block { region });
        self.clear_backoff();
        true
    }
}

lazy_static::lazy_static! {
    static ref START: Instant = Instant::now();
    static ref STATE: Vec<ClassState> = {
        let table = &*CLASSES;
        let states: Vec<ClassState> = (0..table.count())
            .map(|c| ClassState::new(table.bin_size(c)))
            .collect();
        crate::magazine::configure(states.len(), crate::magazine::DEFAULT_CAP);
        states
    };
    static ref MEMORY_PRESSURE_HANDLER: Mutex<Option<Box<dyn Fn() + Send + Sync>>> = Mutex::new(None);
}

fn now_ns() -> u64 {
    START.elapsed().as_nanos() as u64
}

fn fire_memory_pressure_handler() {
    if let Some(handler) = MEMORY_PRESSURE_HANDLER.lock().unwrap().as_ref() {
        handler();
    }
}

/// Installs a hook invoked whenever a class's growth attempt fails.
pub fn set_memory_pressure_handler(handler: impl Fn() + Send + Sync + 'static) {
    *MEMORY_PRESSURE_HANDLER.lock().unwrap() = Some(Box::new(handler));
}

fn state(class: ClassIndex) -> &'static ClassState {
    &STATE[class]
}

/// Allocates `size` bytes with at least `alignment`. Returns
/// `AllocOutcome::RouteToLarge` if this size/alignment combination cannot be
/// satisfied by any small class (oversize, or alignment beyond the class's
/// natural alignment), in which case the caller must fall through to the
/// large tier.
pub fn allocate(size: usize, alignment: usize) -> AllocOutcome {
    let class = match CLASSES.class_for_size(size) {
        Some(c) => c,
        None => return AllocOutcome::RouteToLarge,
    };

    if alignment > CLASSES.natural_alignment(class) {
        return AllocOutcome::RouteToLarge;
    }

    allocate_in_class(class)
}

fn allocate_in_class(class: ClassIndex) -> AllocOutcome {
    if let Some(p) = crate::magazine::pop(class) {
        return accept(class, p);
    }

    let st = state(class);
    if let Some(p) = st.pop_free() {
        return accept(class, p);
    }

    if st.should_attempt_grow() && st.try_grow() {
        if let Some(p) = st.pop_free() {
            return accept(class, p);
        }
    }

    AllocOutcome::OutOfMemory
}

fn accept(class: ClassIndex, p: NonNull<u8>) -> AllocOutcome {
    crate::debug::check_canary_on_alloc(p);
    crate::debug::tag_alloc(p, CLASSES.bin_size(class) as usize, "binned::allocate");
    AllocOutcome::Allocated(p)
}

/// Frees a pointer previously returned for `size`. Callers must pass the
/// exact size used at allocation time; class routing depends on it.
#[requires(CLASSES.class_for_size(size).is_some(), "size must belong to a small class")]
pub fn deallocate(p: NonNull<u8>, size: usize) {
    crate::debug::check_double_free(p);

    let class = match CLASSES.class_for_size(size) {
        Some(c) => c,
        None => {
            debug_assert!(false, "binned::deallocate called with an oversize length");
            return;
        }
    };

    let bin_size = CLASSES.bin_size(class);
    crate::debug::poison_fill(p, bin_size as usize);

    if crate::debug::quarantine_push(p, bin_size) {
        crate::debug::tag_free(p);
        return;
    }

    let overflow = crate::magazine::push(class, p);
    for q in overflow {
        state(class).push_free(q);
    }

    crate::debug::tag_free(p);
}

/// Cross-thread entry point used by magazines (thread exit, explicit flush)
/// and by quarantine eviction; pushes straight to the class's global free
/// list, bypassing the double-free/quarantine checks in `deallocate`.
pub fn tls_flush_hook(class: ClassIndex, pointers: Vec<NonNull<u8>>) {
    let st = state(class);
    for p in pointers {
        st.push_free(p);
    }
}

/// Frees a pointer evicted from the debug quarantine, recovering its class
/// from the bin size stored alongside it.
pub fn free_from_quarantine(ptr: usize, bin_size: u32) {
    let class = match STATE.iter().position(|s| s.bin_size == bin_size) {
        Some(c) => c,
        None => {
            log::warn!("quarantine eviction: no class for bin_size={bin_size}");
            return;
        }
    };
    if let Some(p) = NonNull::new(ptr as *mut u8) {
        state(class).push_free(p);
    }
}

/// Drains the calling thread's magazines back to the global free lists.
pub fn flush_tls() {
    crate::magazine::flush_all_to_global();
}
