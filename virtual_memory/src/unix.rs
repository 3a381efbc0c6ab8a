//! Unix backend.
//!
//! A reservation is a `PROT_NONE` private anonymous mapping: it claims the
//! address range without committing memory. Committing flips a sub-range
//! to read-write; decommitting tells the kernel to drop the backing pages
//! (`MADV_DONTNEED`) and flips the range back to `PROT_NONE` so stray
//! touches fault instead of silently re-committing.

use crate::{PageProtection, VmError};
use core::ptr;
use core::sync::atomic::{AtomicUsize, Ordering};

static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

#[cfg(target_os = "linux")]
const RESERVE_FLAGS: libc::c_int =
    libc::MAP_PRIVATE | libc::MAP_ANON | libc::MAP_NORESERVE;
#[cfg(not(target_os = "linux"))]
const RESERVE_FLAGS: libc::c_int = libc::MAP_PRIVATE | libc::MAP_ANON;

pub fn page_size() -> usize {
    let cached = PAGE_SIZE.load(Ordering::Relaxed);
    if cached != 0 {
        return cached;
    }
    // SAFETY: sysconf with a valid name has no preconditions.
    let queried = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    let size = if queried > 0 && (queried as usize).is_power_of_two() {
        queried as usize
    } else {
        warn!("virtual_memory: sysconf(_SC_PAGESIZE) returned {}, using fallback", queried);
        mem_config::FALLBACK_OS_PAGE_SIZE
    };
    PAGE_SIZE.store(size, Ordering::Relaxed);
    size
}

pub fn reserve(addr_hint: Option<*mut u8>, size: usize) -> Result<*mut u8, VmError> {
    let hint = addr_hint.unwrap_or(ptr::null_mut());
    // SAFETY: creates a new mapping; MAP_FIXED is never passed, so no
    // existing mapping can be clobbered by a bad hint.
    let mapped = unsafe {
        libc::mmap(
            hint as *mut libc::c_void,
            size,
            libc::PROT_NONE,
            RESERVE_FLAGS,
            -1,
            0,
        )
    };
    if mapped == libc::MAP_FAILED {
        error!("virtual_memory: mmap failed to reserve {} bytes", size);
        return Err(VmError::OutOfAddressSpace);
    }
    Ok(mapped as *mut u8)
}

/// Reserves `size` bytes at an `align`-aligned base by over-reserving
/// `size + align` and unmapping the head and tail slack.
pub fn reserve_trimmed(size: usize, align: usize) -> Result<*mut u8, VmError> {
    let over_size = size.checked_add(align).ok_or(VmError::OutOfAddressSpace)?;
    let raw = reserve(None, over_size)?;
    let aligned = mem_utils::align_up(raw as usize, align) as *mut u8;
    let head = aligned as usize - raw as usize;
    let tail = over_size - head - size;
    // SAFETY: both ranges are page-aligned slices of the mapping that was
    // just created, and the retained middle [aligned, aligned+size) is
    // untouched.
    unsafe {
        if head > 0 {
            libc::munmap(raw as *mut libc::c_void, head);
        }
        if tail > 0 {
            libc::munmap(aligned.add(size) as *mut libc::c_void, tail);
        }
    }
    Ok(aligned)
}

pub fn commit(addr: *mut u8, size: usize) -> Result<(), VmError> {
    // SAFETY: the caller verified [addr, addr+size) lies inside its own
    // reservation and is page-aligned.
    let rc = unsafe {
        libc::mprotect(
            addr as *mut libc::c_void,
            size,
            libc::PROT_READ | libc::PROT_WRITE,
        )
    };
    if rc != 0 {
        error!("virtual_memory: commit of {} bytes at {:p} failed", size, addr);
        return Err(VmError::CommitFailed);
    }
    Ok(())
}

pub fn decommit(addr: *mut u8, size: usize) -> Result<(), VmError> {
    // SAFETY: range checked by the caller; MADV_DONTNEED on a private
    // anonymous mapping drops the backing pages, and the PROT_NONE flip
    // keeps the address range reserved but inaccessible.
    let rc = unsafe {
        let advised = libc::madvise(addr as *mut libc::c_void, size, libc::MADV_DONTNEED);
        let protected = libc::mprotect(addr as *mut libc::c_void, size, libc::PROT_NONE);
        advised | protected
    };
    if rc != 0 {
        error!("virtual_memory: decommit of {} bytes at {:p} failed", size, addr);
        return Err(VmError::CommitFailed);
    }
    Ok(())
}

pub fn protect(addr: *mut u8, size: usize, protection: PageProtection) -> Result<(), VmError> {
    let flags = match protection {
        PageProtection::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
        PageProtection::ReadOnly => libc::PROT_READ,
    };
    // SAFETY: range checked by the caller.
    let rc = unsafe { libc::mprotect(addr as *mut libc::c_void, size, flags) };
    if rc != 0 {
        return Err(VmError::CommitFailed);
    }
    Ok(())
}

pub fn release(base: *mut u8, size: usize) -> Result<(), VmError> {
    // SAFETY: [base, base+size) is exactly the range this handle mapped.
    let rc = unsafe { libc::munmap(base as *mut libc::c_void, size) };
    if rc != 0 {
        return Err(VmError::CommitFailed);
    }
    Ok(())
}
