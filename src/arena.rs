//! The frame/monotonic arena (C2): a bump-pointer allocator over a single
//! VM region, reset wholesale at frame boundaries instead of per-object.
use std::cell::Cell;
use std::ptr::NonNull;

use crate::vm::{self, VmRegion};

pub struct Arena {
    region: VmRegion,
    committed: Cell<usize>,
    offset: Cell<usize>,
}

impl Arena {
    pub fn new(reserve_size: usize) -> Option<Arena> {
        let region = VmRegion::reserve(reserve_size, vm::allocation_granularity()).ok()?;
        Some(Arena {
            region,
            committed: Cell::new(0),
            offset: Cell::new(0),
        })
    }

    /// Bumps the offset forward by `bytes`, aligned to `align`, committing
    /// fresh pages on demand. Returns `None` if the region is exhausted or a
    /// commit fails; callers must not retain a returned pointer past the
    /// next `reset`.
    pub fn alloc(&self, bytes: usize, align: usize) -> Option<NonNull<u8>> {
        let aligned_offset = align_up(self.offset.get(), align);
        let end = aligned_offset.checked_add(bytes)?;
        if end > self.region.size() {
            return None;
        }

        if end > self.committed.get() {
            let commit_end = align_up(end, vm::page_size());
            if self.region.commit(self.committed.get(), commit_end - self.committed.get()).is_err() {
                return None;
            }
            crate::debug::count_commit();
            self.committed.set(commit_end);
        }

        self.offset.set(end);
        let base = self.region.base()?;
        NonNull::new(unsafe { base.as_ptr().add(aligned_offset) })
    }

    /// Decommits everything allocated so far and rewinds the offset to
    /// zero. Every pointer handed out since the arena (or its last reset)
    /// was created is now invalid.
    pub fn reset(&self) {
        self.region.decommit(0, self.committed.get());
        crate::debug::count_decommit();
        self.committed.set(0);
        self.offset.set(0);
    }
}

/// A frame-scoped view over an `Arena`; `end_frame` is an alias for `reset`
/// so call sites read naturally at the point a frame ends.
pub struct FrameArena {
    arena: Arena,
}

impl FrameArena {
    pub fn alloc(&self, bytes: usize, align: usize) -> Option<NonNull<u8>> {
        self.arena.alloc(bytes, align)
    }

    pub fn end_frame(&self) {
        self.arena.reset();
    }
}

/// Reserves a fresh arena of `reserve_size` bytes, runs `body` with it, and
/// resets the arena before returning. Returns `None` if the arena could not
/// be reserved.
pub fn with_frame_arena<R>(reserve_size: usize, body: impl FnOnce(&FrameArena) -> R) -> Option<R> {
    let arena = Arena::new(reserve_size)?;
    let frame = FrameArena { arena };
    let result = body(&frame);
    frame.end_frame();
    Some(result)
}

fn align_up(x: usize, align: usize) -> usize {
    (x + align - 1) & !(align - 1)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn allocations_within_one_frame_strictly_increase() {
        with_frame_arena(64 * 1024, |frame| {
            let a = frame.alloc(16, 8).unwrap();
            let b = frame.alloc(16, 8).unwrap();
            assert!((b.as_ptr() as usize) > (a.as_ptr() as usize));
        });
    }

    #[test]
    fn reset_restarts_at_offset_zero() {
        with_frame_arena(64 * 1024, |frame| {
            let first = frame.alloc(16, 8).unwrap();
            frame.end_frame();
            let after_reset = frame.alloc(16, 8).unwrap();
            assert_eq!(first.as_ptr(), after_reset.as_ptr());
        });
    }

    #[test]
    fn exceeding_reserved_size_returns_none() {
        let arena = Arena::new(4096).unwrap();
        assert!(arena.alloc(8192, 8).is_none());
    }
}
