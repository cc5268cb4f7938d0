//! Error kinds for the virtual-memory substrate and the tiers built on it.
//!
//! Nothing here unwinds through allocator code: the public surface
//! (`RawAllocator`, `Class::allocate`, ...) collapses every variant to a
//! `None` return, exactly as spec.md §7 requires. These types exist so the
//! internal plumbing between `vm`, `large`, and `binned` can propagate a
//! reason with `?` instead of threading bare `i32` errno values, and so log
//! lines have something to print.
use thiserror::Error;

/// Failures raised by the virtual-memory substrate (C1).
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    #[error("failed to reserve address space (errno={0})")]
    ReserveFailed(i32),
    #[error("failed to commit pages (errno={0})")]
    CommitFailed(i32),
    #[error("failed to change page protection (errno={0})")]
    ProtectFailed(i32),
    #[error("failed to release address space (errno={0})")]
    ReleaseFailed(i32),
    #[error("invalid parameters passed to the VM substrate")]
    InvalidParameters,
}

pub type VmResult<T> = Result<T, VmError>;
