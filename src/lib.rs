//! A three-tier byte allocator for a game engine's hot path: a virtual
//! memory substrate, a binned small-object allocator with thread-local
//! magazines, a large-object page allocator, and a frame/monotonic arena.
//!
//! The entry points most callers want are [`default_allocator`],
//! [`RawAllocator`], and [`with_frame_arena`].
mod arena;
mod binned;
mod class;
mod debug;
mod error;
mod large;
mod magazine;
mod raw;
mod vm;

pub use arena::{with_frame_arena, Arena, FrameArena};
pub use class::ClassIndex;
pub use debug::{counters, Counters, LeakRecord};
pub use error::{VmError, VmResult};
pub use raw::{
    default_allocator, flush_tls, set_memory_pressure_handler, DefaultAllocator,
    LargeAllocatorHandle, RawAllocator, RawBuffer, SmallAllocator,
};
pub use vm::{allocation_granularity, page_size, touch, Protection, VmRegion};

/// Enumerates every allocation the debug leak tracker still considers live.
/// Returns an empty vector when the `debug_checks` feature is off.
pub fn dump_leaks() -> Vec<LeakRecord> {
    debug::dump_leaks()
}
