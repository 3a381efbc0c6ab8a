//! A reference-counted handle to one allocation, shareable across
//! threads and freed through its originating manager on last drop.

use core::ptr;
use core::sync::atomic::{fence, AtomicI64, Ordering};

use crate::MemoryManager;

/// A share-by-refcount view of a single block of manager memory.
///
/// Cloning bumps an atomic counter that itself lives in manager memory;
/// the clone that drops the count to zero frees both the block and the
/// counter through the manager that produced them. All control-pointer
/// paths guard against an empty handle, so a default-constructed or
/// already-moved-out arena is inert.
pub struct MemoryArena {
    ref_counter: *mut AtomicI64,
    manager: *const MemoryManager,
    base_address: *mut u8,
    size_in_bytes: usize,
}

// The arena's shared state is the atomic counter; the block itself is
// plain memory whose accesses the users coordinate.
unsafe impl Send for MemoryArena {}
unsafe impl Sync for MemoryArena {}

impl MemoryArena {
    pub(crate) fn new(
        ref_counter: *mut AtomicI64,
        manager: &'static MemoryManager,
        base_address: *mut u8,
        size_in_bytes: usize,
    ) -> MemoryArena {
        MemoryArena {
            ref_counter,
            manager: manager as *const MemoryManager,
            base_address,
            size_in_bytes,
        }
    }

    pub fn base_address(&self) -> *mut u8 {
        self.base_address
    }

    pub fn end_address(&self) -> *mut u8 {
        mem_utils::offset_ptr(self.base_address, self.size_in_bytes as isize)
    }

    pub fn size_in_bytes(&self) -> usize {
        self.size_in_bytes
    }

    pub fn owns_address(&self, ptr: *const u8) -> bool {
        mem_utils::ptr_in_range(ptr, self.base_address, self.end_address())
    }

    /// Current share count; mainly useful for diagnostics and tests.
    pub fn reference_count(&self) -> i64 {
        if self.ref_counter.is_null() {
            return 0;
        }
        // SAFETY: a non-null counter is kept alive until the last drop.
        unsafe { (*self.ref_counter).load(Ordering::Relaxed) }
    }
}

impl Clone for MemoryArena {
    fn clone(&self) -> MemoryArena {
        if !self.ref_counter.is_null() {
            // SAFETY: the counter outlives every clone by construction.
            unsafe { (*self.ref_counter).fetch_add(1, Ordering::Relaxed) };
        }
        MemoryArena {
            ref_counter: self.ref_counter,
            manager: self.manager,
            base_address: self.base_address,
            size_in_bytes: self.size_in_bytes,
        }
    }
}

impl Drop for MemoryArena {
    fn drop(&mut self) {
        if self.ref_counter.is_null() {
            return;
        }
        // SAFETY: the counter is live until the count hits zero, and the
        // release/acquire pair orders all uses of the block before the
        // frees below.
        unsafe {
            if (*self.ref_counter).fetch_sub(1, Ordering::Release) == 1 {
                fence(Ordering::Acquire);
                (*self.manager).free(self.base_address);
                (*self.manager).free(self.ref_counter as *mut u8);
            }
        }
        self.ref_counter = ptr::null_mut();
    }
}
