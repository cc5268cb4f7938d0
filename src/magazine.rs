//! Per-thread magazine cache (C4): a fixed-capacity stack of free pointers
//! per size class, scoped to the calling thread.
//!
//! A magazine is created lazily the first time a thread touches the
//! allocator and torn down by `thread_local!`'s built-in destructor when the
//! thread exits, which is also when its non-empty stacks are flushed back to
//! the owning class's global free list. No other thread ever touches it.
use std::cell::RefCell;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Default per-class stack capacity; widened process-wide by `configure`.
pub const DEFAULT_CAP: usize = 32;

static CONFIGURED_CLASSES: AtomicUsize = AtomicUsize::new(0);
static CONFIGURED_CAP: AtomicUsize = AtomicUsize::new(DEFAULT_CAP);

/// Widens the per-thread stack array to at least `max_classes` entries and
/// sets the per-stack capacity. Called once by the binned allocator at
/// startup; safe to call again (e.g. from tests) since per-thread storage
/// grows lazily on next access regardless.
pub fn configure(max_classes: usize, cap: usize) {
    CONFIGURED_CLASSES.fetch_max(max_classes, Ordering::Relaxed);
    CONFIGURED_CAP.store(cap.max(2), Ordering::Relaxed);
}

fn configured_cap() -> usize {
    CONFIGURED_CAP.load(Ordering::Relaxed)
}

struct PerThreadMagazine {
    stacks: RefCell<Vec<Vec<NonNull<u8>>>>,
}

impl PerThreadMagazine {
    fn new() -> Self {
        let classes = CONFIGURED_CLASSES.load(Ordering::Relaxed).max(1);
        PerThreadMagazine {
            stacks: RefCell::new((0..classes).map(|_| Vec::new()).collect()),
        }
    }

    fn ensure_class(stacks: &mut Vec<Vec<NonNull<u8>>>, class: usize) {
        if class >= stacks.len() {
            stacks.resize_with(class + 1, Vec::new);
        }
    }

    fn pop(&self, class: usize) -> Option<NonNull<u8>> {
        let mut stacks = self.stacks.borrow_mut();
        Self::ensure_class(&mut stacks, class);
        stacks[class].pop()
    }

    /// Pushes `p` onto the class's stack. Returns the oldest half of the
    /// stack as an overflow batch if the push spills past capacity; the
    /// batch is ordered oldest-first, matching the FIFO eviction policy.
    fn push(&self, class: usize, p: NonNull<u8>) -> Vec<NonNull<u8>> {
        let mut stacks = self.stacks.borrow_mut();
        Self::ensure_class(&mut stacks, class);
        stacks[class].push(p);

        let cap = configured_cap();
        if stacks[class].len() > cap {
            let overflow = cap / 2;
            stacks[class].drain(0..overflow).collect()
        } else {
            Vec::new()
        }
    }

    fn flush_all(&self) {
        let mut stacks = self.stacks.borrow_mut();
        for (class, stack) in stacks.iter_mut().enumerate() {
            if stack.is_empty() {
                continue;
            }
            let drained = std::mem::take(stack);
            crate::binned::tls_flush_hook(class, drained);
        }
    }
}

impl Drop for PerThreadMagazine {
    fn drop(&mut self) {
        self.flush_all();
    }
}

thread_local! {
    static MAGAZINE: PerThreadMagazine = PerThreadMagazine::new();
}

/// Pops a cached pointer for `class`, or `None` if the thread's magazine is
/// empty for that class.
pub fn pop(class: usize) -> Option<NonNull<u8>> {
    MAGAZINE.with(|m| m.pop(class))
}

/// Pushes `p` into the thread's magazine for `class`. Any returned pointers
/// are the overflow batch the caller must return to the global free list.
pub fn push(class: usize, p: NonNull<u8>) -> Vec<NonNull<u8>> {
    MAGAZINE.with(|m| m.push(class, p))
}

/// Drains every non-empty stack in the calling thread's magazine back to the
/// global free lists. Safe to call at frame boundaries as well as at thread
/// exit.
pub fn flush_all_to_global() {
    MAGAZINE.with(|m| m.flush_all());
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn push_then_pop_round_trips() {
        configure(8, 4);
        let mut buf = [0u8; 8];
        let p = NonNull::new(buf.as_mut_ptr()).unwrap();
        let overflow = push(0, p);
        assert!(overflow.is_empty());
        assert_eq!(pop(0), Some(p));
        assert_eq!(pop(0), None);
    }

    #[test]
    fn push_past_capacity_overflows_oldest_first() {
        configure(8, 4);
        let mut storage = [0u8; 8];
        let base = storage.as_mut_ptr();
        let ptrs: Vec<_> = (0..5)
            .map(|i| NonNull::new(unsafe { base.add(i) }).unwrap())
            .collect();

        let mut overflow = Vec::new();
        for p in &ptrs {
            overflow = push(1, *p);
        }
        // cap=4, fifth push spills the oldest cap/2=2 entries.
        assert_eq!(overflow, ptrs[0..2]);

        // Drain what's left so this thread's magazine is empty before it
        // exits: class 1 is a real size class, and the thread-exit flush
        // would otherwise hand these stack-local addresses to the real
        // global free list.
        while pop(1).is_some() {}
    }
}
