//! The process-wide memory manager: one front-end over the two
//! specialized back-ends and the system heap.
//!
//! Requests route by size class: anything a slab page can hold goes to
//! the small-size allocator, anything up to the TLSF maximum goes to the
//! medium-size allocator, and the rest falls back to the platform heap.
//! Frees route by ownership, i.e. by asking each back-end whether the
//! address lies in its reservations. Every public operation serializes
//! under one mutex, which is what makes the route-then-operate and
//! owns-then-free pairs atomic for concurrent callers.
//!
//! The manager is usable both as owned instances (each with its own
//! reservations) and through [`global()`], the lazily-constructed
//! process-wide instance that [`Heap`] exposes as a `#[global_allocator]`
//! implementation.

#![no_std]

#[macro_use] extern crate log;

mod arena;
mod system_heap;
#[cfg(test)]
mod test;

pub use arena::MemoryArena;
pub use virtual_memory::MemoryUsage;

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{self, NonNull};
use core::sync::atomic::AtomicI64;
use medium_size_allocator::MediumSizeAllocator;
use mem_config::DEFAULT_ALIGNMENT;
use small_size_allocator::SmallSizeAllocator;
use spin::{Mutex, Once};
use system_heap::SystemHeap;

struct Inner {
    small: SmallSizeAllocator,
    medium: MediumSizeAllocator,
    heap: SystemHeap,
}

/// The allocation facade. See the crate docs for the routing rules.
pub struct MemoryManager {
    inner: Mutex<Inner>,
}

impl MemoryManager {
    /// Creates a manager with its own reservations. Fails only if the
    /// small allocator's address-space window cannot be reserved.
    pub fn new() -> Result<MemoryManager, &'static str> {
        Ok(MemoryManager {
            inner: Mutex::new(Inner {
                small: SmallSizeAllocator::new()?,
                medium: MediumSizeAllocator::new(),
                heap: SystemHeap::new(),
            }),
        })
    }

    /// Allocates `size` bytes aligned to `align` (0 means natural
    /// alignment). Returns `None` for zero sizes, non-power-of-two
    /// alignments, and out-of-memory.
    pub fn allocate(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
        let align = effective_alignment(align)?;
        if size == 0 {
            return None;
        }
        let mut inner = self.inner.lock();
        if inner.small.can_allocate(size, align) {
            inner.small.allocate(size, align)
        } else if inner.medium.can_allocate(size, align) {
            inner.medium.allocate(size, align)
        } else {
            inner.heap.allocate(size, align)
        }
    }

    /// Grows or shrinks an allocation, preserving `min(old, new)` bytes.
    /// A null `ptr` allocates; a zero `size` frees and returns `None`; a
    /// shrink smaller than one minimal slab block keeps the pointer.
    pub fn reallocate(&self, ptr: *mut u8, size: usize, align: usize) -> Option<NonNull<u8>> {
        if ptr.is_null() {
            return self.allocate(size, align);
        }
        if size == 0 {
            self.free(ptr);
            return None;
        }
        let current_size = self.size_of(ptr);
        if current_size == 0 {
            error!("memory_manager: reallocate of unknown pointer {:p}", ptr);
            return None;
        }
        if size <= current_size
            && current_size - size < mem_config::small_alloc::MIN_ALLOCATION_SIZE
        {
            return NonNull::new(ptr);
        }
        let new_block = self.allocate(size, align)?;
        // SAFETY: both blocks are live, sized by the checks above, and a
        // fresh allocation cannot overlap a live one.
        unsafe {
            ptr::copy_nonoverlapping(ptr, new_block.as_ptr(), current_size.min(size));
        }
        self.free(ptr);
        Some(new_block)
    }

    /// Returns the allocation to whichever back-end owns the address.
    /// Null and unknown pointers are ignored.
    pub fn free(&self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        let mut inner = self.inner.lock();
        if inner.small.owns_allocation(ptr) {
            inner.small.free(ptr);
        } else if inner.medium.owns_allocation(ptr) {
            inner.medium.free(ptr);
        } else {
            inner.heap.free(ptr);
        }
    }

    /// Usable size of the allocation holding `ptr`, as reported by its
    /// owning back-end; 0 for pointers nobody owns.
    pub fn size_of(&self, ptr: *const u8) -> usize {
        if ptr.is_null() {
            return 0;
        }
        let inner = self.inner.lock();
        if inner.small.owns_allocation(ptr) {
            inner.small.size_of(ptr)
        } else if inner.medium.owns_allocation(ptr) {
            inner.medium.size_of(ptr)
        } else {
            inner.heap.size_of(ptr)
        }
    }

    /// Returns true if some back-end (or the heap fallback) would accept
    /// the request.
    pub fn can_allocate(&self, size: usize, align: usize) -> bool {
        let align = match effective_alignment(align) {
            Some(align) => align,
            None => return false,
        };
        if size == 0 {
            return false;
        }
        let inner = self.inner.lock();
        inner.small.can_allocate(size, align)
            || inner.medium.can_allocate(size, align)
            || inner.heap.can_allocate(size, align)
    }

    /// Returns true if `ptr` belongs to a live allocation region of any
    /// back-end: the reservations of the small and medium allocators, or
    /// a tracked heap-fallback block.
    pub fn owns_allocation(&self, ptr: *const u8) -> bool {
        let inner = self.inner.lock();
        inner.small.owns_allocation(ptr)
            || inner.medium.owns_allocation(ptr)
            || inner.heap.owns_allocation(ptr)
    }

    /// Releases fully-empty physical backing from both back-ends and
    /// returns the total bytes handed back to the OS.
    pub fn compact(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.small.compact() + inner.medium.compact()
    }

    /// Aggregated usage across both back-ends and the heap fallback.
    pub fn memory_usage(&self) -> MemoryUsage {
        let inner = self.inner.lock();
        inner
            .small
            .memory_usage()
            .combined_with(inner.medium.memory_usage())
            .combined_with(inner.heap.memory_usage())
    }

    /// Allocates a block and wraps it in a refcounted [`MemoryArena`]
    /// whose last clone frees the block back through this manager.
    pub fn allocate_arena(&'static self, size: usize, align: usize) -> Option<MemoryArena> {
        let base = self.allocate(size, align)?;
        let counter = match self.allocate(
            core::mem::size_of::<AtomicI64>(),
            core::mem::align_of::<AtomicI64>(),
        ) {
            Some(counter) => counter.as_ptr() as *mut AtomicI64,
            None => {
                self.free(base.as_ptr());
                return None;
            }
        };
        // SAFETY: `counter` is a fresh, aligned manager allocation.
        unsafe { ptr::write(counter, AtomicI64::new(1)) };
        Some(MemoryArena::new(counter, self, base.as_ptr(), size))
    }

    /// Test/debug hook: asserts the medium back-end's directory and
    /// physical-chain invariants, and that an idle allocator has exactly
    /// one free block per pool.
    #[doc(hidden)]
    pub fn check_integrity(&self) {
        let inner = self.inner.lock();
        inner.medium.check_directory_invariants();
        let mut free_blocks = 0;
        inner.medium.for_each_block(|_, is_free| {
            if is_free {
                free_blocks += 1;
            }
        });
        if inner.medium.memory_usage().allocated == 0 {
            assert_eq!(
                free_blocks,
                inner.medium.pool_count(),
                "idle pools must have coalesced into one free block each"
            );
        }
    }
}

/// 0 means "natural"; everything else must be a power of two.
fn effective_alignment(align: usize) -> Option<usize> {
    if align == 0 {
        return Some(DEFAULT_ALIGNMENT);
    }
    if !align.is_power_of_two() {
        error!("memory_manager: alignment {} is not a power of two", align);
        return None;
    }
    Some(align)
}

/// The lazily-constructed process-wide manager. `spin::Once` keeps the
/// instance in static storage, so construction performs no allocation
/// through the allocator being constructed.
static GLOBAL_MANAGER: Once<MemoryManager> = Once::new();

/// Returns the process-wide manager, constructing it on first use. The
/// instance lives until process exit; the OS reclaims its reservations.
pub fn global() -> &'static MemoryManager {
    GLOBAL_MANAGER.call_once(|| match MemoryManager::new() {
        Ok(manager) => manager,
        Err(e) => panic!("failed to construct the global memory manager: {}", e),
    })
}

/// Allocates from the global manager.
pub fn allocate(size: usize, align: usize) -> Option<NonNull<u8>> {
    global().allocate(size, align)
}

/// Reallocates through the global manager.
pub fn reallocate(ptr: *mut u8, size: usize, align: usize) -> Option<NonNull<u8>> {
    global().reallocate(ptr, size, align)
}

/// Frees through the global manager.
pub fn free(ptr: *mut u8) {
    global().free(ptr)
}

/// Usable size of a global-manager allocation.
pub fn size_of(ptr: *const u8) -> usize {
    global().size_of(ptr)
}

/// Compacts the global manager.
pub fn compact() -> usize {
    global().compact()
}

/// Usage snapshot of the global manager.
pub fn memory_usage() -> MemoryUsage {
    global().memory_usage()
}

/// Allocates a refcounted arena from the global manager.
pub fn allocate_arena(size: usize, align: usize) -> Option<MemoryArena> {
    global().allocate_arena(size, align)
}

/// `GlobalAlloc` front-end over the global manager, so a binary can make
/// it the process's default allocator:
///
/// ```ignore
/// #[global_allocator]
/// static ALLOCATOR: memory_manager::Heap = memory_manager::Heap;
/// ```
pub struct Heap;

unsafe impl GlobalAlloc for Heap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        global()
            .allocate(layout.size(), layout.align())
            .map_or(ptr::null_mut(), |p| p.as_ptr())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        global().free(ptr);
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        global()
            .reallocate(ptr, new_size, layout.align())
            .map_or(ptr::null_mut(), |p| p.as_ptr())
    }
}
