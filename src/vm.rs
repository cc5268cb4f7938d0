//! The virtual-memory substrate (C1): reserve/commit/decommit/protect/release
//! over page-aligned address-space regions.
//!
//! All byte ranges handed to the OS are aligned down (offsets) or up (sizes)
//! to the page size first, exactly as spec.md §4.1 requires. Everything in
//! this module is a thin, safe wrapper around the platform's raw virtual
//! memory primitives: `mmap`/`mprotect`/`madvise`/`munmap` on Unix, the
//! `VirtualAlloc` family on Windows.
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
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{VmError, VmResult};

/// Memory protection levels a region's pages can be placed under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    NoAccess,
    Read,
    ReadWrite,
}

/// A reserved range of address space. `base` is `None` once the region has
/// been released; release is idempotent.
#[derive(Debug)]
pub struct VmRegion {
    base: Option<NonNull<u8>>,
    size: usize,
    reserved: bool,
}

// A `VmRegion` owns raw address space, not thread-confined data; the tiers
// built on it (Block, Arena) already serialize access with their own locks.
unsafe impl Send for VmRegion {}
unsafe impl Sync for VmRegion {}

pub(crate) fn align_down(x: usize, align: usize) -> usize {
    x & !(align - 1)
}

pub(crate) fn align_up(x: usize, align: usize) -> usize {
    align_down(x.wrapping_add(align - 1), align)
}

/// Returns the system page size, queried once and cached for the process.
#[inline]
pub fn page_size() -> usize {
    *PAGE_SIZE
}

/// Returns the platform's allocation granularity: the alignment `reserve`
/// can hand out without over-reserving. On Unix this is the page size,
/// since `mmap` can place a mapping at any page-aligned address. On Windows
/// it is `SYSTEM_INFO::dwAllocationGranularity` (typically 64 KiB), which is
/// coarser than the page size and distinct from it — `VirtualAlloc` only
/// ever places a fresh reservation on an allocation-granularity boundary, so
/// a reservation's base can't be trimmed to an arbitrary page inside it the
/// way `reserve`'s head/tail-slack trim does on Unix.
#[inline]
pub fn allocation_granularity() -> usize {
    *ALLOCATION_GRANULARITY
}

lazy_static::lazy_static! {
    static ref PAGE_SIZE: usize = query_page_size();
    static ref ALLOCATION_GRANULARITY: usize = query_allocation_granularity();
}

#[cfg(not(windows))]
fn query_page_size() -> usize {
    let ret = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    assert!(ret > 0, "sysconf(_SC_PAGESIZE) failed");
    ret as usize
}

#[cfg(not(windows))]
fn query_allocation_granularity() -> usize {
    page_size()
}

#[cfg(windows)]
fn query_page_size() -> usize {
    system_info().dwPageSize as usize
}

#[cfg(windows)]
fn query_allocation_granularity() -> usize {
    system_info().dwAllocationGranularity as usize
}

#[cfg(windows)]
fn system_info() -> winapi::um::sysinfoapi::SYSTEM_INFO {
    use std::mem::MaybeUninit;
    use winapi::um::sysinfoapi::{GetSystemInfo, LPSYSTEM_INFO, SYSTEM_INFO};

    let mut info: MaybeUninit<SYSTEM_INFO> = MaybeUninit::uninit();
    unsafe {
        GetSystemInfo(info.as_mut_ptr() as LPSYSTEM_INFO);
        info.assume_init()
    }
}

#[cfg(not(windows))]
fn raw_reserve(size: usize) -> VmResult<NonNull<u8>> {
    let addr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANON,
            -1,
            0,
        )
    };

    if addr == libc::MAP_FAILED {
        return Err(VmError::ReserveFailed(errno()));
    }

    Ok(NonNull::new(addr as *mut u8).expect("mmap never returns NULL on success"))
}

#[cfg(not(windows))]
fn raw_release(base: NonNull<u8>, size: usize) -> VmResult<()> {
    let ret = unsafe { libc::munmap(base.as_ptr() as *mut libc::c_void, size) };
    if ret == 0 {
        Ok(())
    } else {
        Err(VmError::ReleaseFailed(errno()))
    }
}

#[cfg(not(windows))]
fn raw_commit(base: NonNull<u8>, size: usize) -> VmResult<()> {
    let ret = unsafe {
        libc::mprotect(
            base.as_ptr() as *mut libc::c_void,
            size,
            libc::PROT_READ | libc::PROT_WRITE,
        )
    };
    if ret == 0 {
        Ok(())
    } else {
        Err(VmError::CommitFailed(errno()))
    }
}

#[cfg(not(windows))]
fn raw_decommit(base: NonNull<u8>, size: usize) {
    unsafe {
        // Drop the backing pages; best-effort only, never fatal.
        let advised = libc::madvise(
            base.as_ptr() as *mut libc::c_void,
            size,
            libc::MADV_DONTNEED,
        );
        if advised != 0 {
            log::warn!(
                "madvise(MADV_DONTNEED) failed on decommit: errno={}",
                errno()
            );
        }

        // Pages become inaccessible regardless of whether the OS reclaimed them.
        let protected = libc::mprotect(
            base.as_ptr() as *mut libc::c_void,
            size,
            libc::PROT_NONE,
        );
        if protected != 0 {
            log::warn!("mprotect(PROT_NONE) failed on decommit: errno={}", errno());
        }
    }
}

#[cfg(not(windows))]
fn raw_protect(base: NonNull<u8>, size: usize, prot: Protection) -> VmResult<()> {
    let flags = match prot {
        Protection::NoAccess => libc::PROT_NONE,
        Protection::Read => libc::PROT_READ,
        Protection::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
    };

    let ret = unsafe { libc::mprotect(base.as_ptr() as *mut libc::c_void, size, flags) };
    if ret == 0 {
        Ok(())
    } else {
        Err(VmError::ProtectFailed(errno()))
    }
}

#[cfg(not(windows))]
fn errno() -> i32 {
    std::io::Error::last_os_error()
        .raw_os_error()
        .unwrap_or(0)
}

#[cfg(windows)]
fn raw_reserve(size: usize) -> VmResult<NonNull<u8>> {
    use winapi::um::memoryapi::VirtualAlloc;
    use winapi::um::winnt::{MEM_RESERVE, PAGE_NOACCESS};

    let addr = unsafe {
        VirtualAlloc(std::ptr::null_mut(), size, MEM_RESERVE, PAGE_NOACCESS)
    };
    NonNull::new(addr as *mut u8).ok_or_else(|| VmError::ReserveFailed(win_errno()))
}

#[cfg(windows)]
fn raw_release(base: NonNull<u8>, _size: usize) -> VmResult<()> {
    use winapi::um::memoryapi::VirtualFree;
    use winapi::um::winnt::MEM_RELEASE;

    let ret = unsafe { VirtualFree(base.as_ptr() as *mut _, 0, MEM_RELEASE) };
    if ret != 0 {
        Ok(())
    } else {
        Err(VmError::ReleaseFailed(win_errno()))
    }
}

#[cfg(windows)]
fn raw_commit(base: NonNull<u8>, size: usize) -> VmResult<()> {
    use winapi::um::memoryapi::VirtualAlloc;
    use winapi::um::winnt::{MEM_COMMIT, PAGE_READWRITE};

    let ret = unsafe { VirtualAlloc(base.as_ptr() as *mut _, size, MEM_COMMIT, PAGE_READWRITE) };
    if !ret.is_null() {
        Ok(())
    } else {
        Err(VmError::CommitFailed(win_errno()))
    }
}

#[cfg(windows)]
fn raw_decommit(base: NonNull<u8>, size: usize) {
    use winapi::um::memoryapi::VirtualFree;
    use winapi::um::winnt::MEM_DECOMMIT;

    let ret = unsafe { VirtualFree(base.as_ptr() as *mut _, size, MEM_DECOMMIT) };
    if ret == 0 {
        log::warn!("VirtualFree(MEM_DECOMMIT) failed: {}", win_errno());
    }
}

#[cfg(windows)]
fn raw_protect(base: NonNull<u8>, size: usize, prot: Protection) -> VmResult<()> {
    use winapi::um::memoryapi::VirtualProtect;
    use winapi::um::winnt::{PAGE_NOACCESS, PAGE_READONLY, PAGE_READWRITE};

    let flags = match prot {
        Protection::NoAccess => PAGE_NOACCESS,
        Protection::Read => PAGE_READONLY,
        Protection::ReadWrite => PAGE_READWRITE,
    };

    let mut old = 0u32;
    let ret = unsafe { VirtualProtect(base.as_ptr() as *mut _, size, flags, &mut old) };
    if ret != 0 {
        Ok(())
    } else {
        Err(VmError::ProtectFailed(win_errno()))
    }
}

#[cfg(windows)]
fn win_errno() -> i32 {
    unsafe { winapi::um::errhandlingapi::GetLastError() as i32 }
}

impl VmRegion {
    /// Reserves at least `ceil(size, page_size)` bytes of address space with
    /// no access. If `alignment` exceeds the allocation granularity, the
    /// implementation over-reserves by `alignment` bytes, aligns the base
    /// upward, and releases the head and tail slack.
    #[requires(size > 0, "cannot reserve an empty region")]
    #[requires(alignment.is_power_of_two(), "alignment must be a power of two")]
    #[ensures(ret.is_ok() -> ret.as_ref().unwrap().size % page_size() == 0)]
    #[ensures(ret.is_ok() -> (ret.as_ref().unwrap().base.unwrap().as_ptr() as usize) % alignment == 0)]
    pub fn reserve(size: usize, alignment: usize) -> VmResult<VmRegion> {
        if size == 0 || !alignment.is_power_of_two() {
            return Err(VmError::InvalidParameters);
        }

        let page = page_size();
        let rounded = align_up(size, page);

        if alignment <= allocation_granularity() {
            let base = raw_reserve(rounded)?;
            return Ok(VmRegion {
                base: Some(base),
                size: rounded,
                reserved: true,
            });
        }

        // Over-reserve, then trim the head and tail slack around the
        // aligned base, the way `mimalloc`'s `os_mem_alloc_aligned` does on
        // platforms without a native aligned-reserve call.
        let over_size = rounded
            .checked_add(alignment)
            .ok_or(VmError::InvalidParameters)?;
        let over_base = raw_reserve(over_size)?;

        let aligned_addr = align_up(over_base.as_ptr() as usize, alignment);
        let head_slack = aligned_addr - (over_base.as_ptr() as usize);
        let tail_slack = over_size - head_slack - rounded;

        if head_slack > 0 {
            if let Err(e) = raw_release(over_base, head_slack) {
                log::warn!("failed to release head slack while aligning a reservation: {e}");
            }
        }
        if tail_slack > 0 {
            let tail_base =
                NonNull::new((aligned_addr + rounded) as *mut u8).expect("non-null by construction");
            if let Err(e) = raw_release(tail_base, tail_slack) {
                log::warn!("failed to release tail slack while aligning a reservation: {e}");
            }
        }

        let aligned_base = NonNull::new(aligned_addr as *mut u8).expect("non-null by construction");
        Ok(VmRegion {
            base: Some(aligned_base),
            size: rounded,
            reserved: true,
        })
    }

    /// Rebuilds a `VmRegion` handle over a range this process already owns,
    /// for tiers (the large allocator) that must outlive a single `reserve`
    /// call's stack frame: they `mem::forget` the handle they got from
    /// `reserve` and rebuild one from the header they stashed, just to drive
    /// `release` at deallocate time.
    pub(crate) fn from_raw(base: NonNull<u8>, size: usize) -> VmRegion {
        VmRegion {
            base: Some(base),
            size,
            reserved: true,
        }
    }

    #[inline]
    pub fn base(&self) -> Option<NonNull<u8>> {
        self.base
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    fn in_bounds(&self, offset: usize, size: usize) -> bool {
        match offset.checked_add(size) {
            Some(end) => end <= self.size,
            None => false,
        }
    }

    fn range_base(&self, aligned_offset: usize) -> Option<NonNull<u8>> {
        self.base
            .map(|base| unsafe { NonNull::new_unchecked(base.as_ptr().add(aligned_offset)) })
    }

    /// Commits `[offset, offset + size)`, rounding the offset down and the
    /// size up to the page size, and makes the range read-write.
    #[requires(self.reserved, "cannot commit a released region")]
    pub fn commit(&self, offset: usize, size: usize) -> VmResult<()> {
        let page = page_size();
        let aligned_offset = align_down(offset, page);
        let aligned_end = align_up(offset + size, page);
        let aligned_size = aligned_end - aligned_offset;

        if !self.in_bounds(aligned_offset, aligned_size) {
            return Err(VmError::InvalidParameters);
        }

        let base = self
            .range_base(aligned_offset)
            .ok_or(VmError::InvalidParameters)?;
        raw_commit(base, aligned_size)
    }

    /// Decommits `[offset, offset + size)`. Silently does nothing for
    /// out-of-bounds input, per spec.md §4.1.
    pub fn decommit(&self, offset: usize, size: usize) {
        if !self.reserved {
            return;
        }

        let page = page_size();
        let aligned_offset = align_down(offset, page);
        let aligned_end = align_up(offset + size, page);
        if aligned_end < aligned_offset {
            return;
        }
        let aligned_size = aligned_end - aligned_offset;

        if aligned_size == 0 || !self.in_bounds(aligned_offset, aligned_size) {
            return;
        }

        if let Some(base) = self.range_base(aligned_offset) {
            raw_decommit(base, aligned_size);
        }
    }

    /// Changes protection on `[offset, offset + size)`.
    #[requires(self.reserved, "cannot protect a released region")]
    pub fn protect(&self, offset: usize, size: usize, prot: Protection) -> VmResult<()> {
        let page = page_size();
        let aligned_offset = align_down(offset, page);
        let aligned_end = align_up(offset + size, page);
        let aligned_size = aligned_end - aligned_offset;

        if !self.in_bounds(aligned_offset, aligned_size) {
            return Err(VmError::InvalidParameters);
        }

        let base = self
            .range_base(aligned_offset)
            .ok_or(VmError::InvalidParameters)?;
        raw_protect(base, aligned_size, prot)
    }

    /// Releases the entire region. Idempotent once released.
    pub fn release(&mut self) {
        if let Some(base) = self.base.take() {
            self.reserved = false;
            if let Err(e) = raw_release(base, self.size) {
                log::warn!("failed to release VM region: {e}");
            }
        }
    }
}

impl Drop for VmRegion {
    fn drop(&mut self) {
        self.release();
    }
}

/// Guards the page-size-query lazy_static's first touch; exists only so
/// `page_size()` documents that it is safe to call from any thread before
/// any other part of the allocator has run.
static PAGE_SIZE_TOUCHED: AtomicBool = AtomicBool::new(false);

/// Forces the page size (and, transitively, every lazily-initialised global
/// in this crate that depends on it) to be resolved exactly once.
pub fn touch() {
    if !PAGE_SIZE_TOUCHED.swap(true, Ordering::Relaxed) {
        let _ = page_size();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn page_size_is_sane() {
        let ps = page_size();
        assert!(ps > 0);
        assert!(ps.is_power_of_two());
    }

    #[test]
    fn reserve_commit_decommit_release() {
        let page = page_size();
        let region = VmRegion::reserve(4 * page, page).expect("reserve should succeed");
        assert_eq!(region.size() % page, 0);

        region.commit(0, page).expect("commit should succeed");

        unsafe {
            let ptr = region.base().unwrap().as_ptr();
            std::ptr::write_bytes(ptr, 0x42, page);
            assert_eq!(*ptr, 0x42);
        }

        region.decommit(0, page);
    }

    #[test]
    fn over_aligned_reserve_is_aligned() {
        let page = page_size();
        let alignment = allocation_granularity() * 4;
        let region = VmRegion::reserve(page, alignment).expect("reserve should succeed");
        assert_eq!(region.base().unwrap().as_ptr() as usize % alignment, 0);
    }

    #[test]
    fn decommit_out_of_bounds_is_silent() {
        let page = page_size();
        let region = VmRegion::reserve(page, page).expect("reserve should succeed");
        region.decommit(10 * page, page);
    }

    #[test]
    fn protect_changes_access() {
        let page = page_size();
        let region = VmRegion::reserve(page, page).expect("reserve should succeed");
        region.commit(0, page).expect("commit should succeed");
        region
            .protect(0, page, Protection::Read)
            .expect("protect should succeed");
        region
            .protect(0, page, Protection::ReadWrite)
            .expect("protect should succeed");
    }

    #[test]
    fn release_is_idempotent() {
        let page = page_size();
        let mut region = VmRegion::reserve(page, page).expect("reserve should succeed");
        region.release();
        region.release();
    }
}
