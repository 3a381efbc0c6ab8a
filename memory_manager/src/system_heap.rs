//! Fallback to the platform heap for requests outside both back-ends'
//! ranges (in practice, anything above the medium allocator's maximum).
//!
//! Every fallback allocation carries a tracking node in the bytes just
//! before its payload, and the nodes form a doubly-linked registry. That
//! gives the manager exact `owns`/`size_of` answers for heap pointers
//! without consulting the (platform-specific) heap introspection APIs,
//! and it means a stray pointer that belongs to no allocator is rejected
//! instead of being handed to `free(3)`.

use core::mem::size_of;
use core::ptr::{self, NonNull};
use mem_utils::align_up;
use virtual_memory::MemoryUsage;

/// Tracking node stored immediately before each fallback payload.
#[repr(C)]
struct HeapNode {
    raw: *mut u8,
    size: usize,
    prev: *mut HeapNode,
    next: *mut HeapNode,
}

/// Registry of live system-heap allocations.
pub struct SystemHeap {
    list: *mut HeapNode,
    allocated_bytes: usize,
}

// The registry only points into allocations this heap made itself; the
// owning manager serializes all access.
unsafe impl Send for SystemHeap {}

impl SystemHeap {
    pub const fn new() -> SystemHeap {
        SystemHeap {
            list: ptr::null_mut(),
            allocated_bytes: 0,
        }
    }

    /// Any non-zero size can be attempted; the platform heap is the court
    /// of last resort.
    pub fn can_allocate(&self, size: usize, _align: usize) -> bool {
        size > 0
    }

    pub fn allocate(&mut self, size: usize, align: usize) -> Option<NonNull<u8>> {
        let align = align.max(core::mem::align_of::<HeapNode>());
        // Room for the node, plus slack to place the payload at `align`.
        let total = size.checked_add(align)?.checked_add(size_of::<HeapNode>())?;
        // SAFETY: plain malloc; the layout arithmetic above guarantees
        // the node + aligned payload + size fit inside it.
        let raw = unsafe { libc::malloc(total) } as *mut u8;
        if raw.is_null() {
            error!("system_heap: malloc of {} bytes failed", total);
            return None;
        }
        let payload = align_up(raw as usize + size_of::<HeapNode>(), align) as *mut u8;
        let node = (payload as usize - size_of::<HeapNode>()) as *mut HeapNode;
        // SAFETY: `node` lies inside the fresh allocation, before the
        // payload, and is aligned because `align` and the node size are
        // both multiples of the node alignment.
        unsafe {
            ptr::write(
                node,
                HeapNode {
                    raw,
                    size,
                    prev: ptr::null_mut(),
                    next: self.list,
                },
            );
            if !self.list.is_null() {
                (*self.list).prev = node;
            }
        }
        self.list = node;
        self.allocated_bytes += size;
        NonNull::new(payload)
    }

    pub fn owns_allocation(&self, ptr: *const u8) -> bool {
        !self.find_node(ptr).is_null()
    }

    /// Frees a tracked allocation. Unknown pointers are reported and left
    /// alone rather than being passed to the platform `free`.
    pub fn free(&mut self, ptr: *mut u8) {
        let node = self.find_node(ptr);
        if node.is_null() {
            warn!("system_heap: ignoring free of untracked pointer {:p}", ptr);
            return;
        }
        // SAFETY: `node` came from the registry, so its links and `raw`
        // are intact.
        unsafe {
            let prev = (*node).prev;
            let next = (*node).next;
            if prev.is_null() {
                self.list = next;
            } else {
                (*prev).next = next;
            }
            if !next.is_null() {
                (*next).prev = prev;
            }
            self.allocated_bytes -= (*node).size;
            libc::free((*node).raw as *mut libc::c_void);
        }
    }

    pub fn size_of(&self, ptr: *const u8) -> usize {
        let node = self.find_node(ptr);
        if node.is_null() {
            return 0;
        }
        // SAFETY: registry nodes are live.
        unsafe { (*node).size }
    }

    pub fn memory_usage(&self) -> MemoryUsage {
        MemoryUsage {
            allocated: self.allocated_bytes,
            committed: self.allocated_bytes,
            reserved: self.allocated_bytes,
        }
    }

    fn find_node(&self, ptr: *const u8) -> *mut HeapNode {
        if ptr.is_null() {
            return ptr::null_mut();
        }
        let mut node = self.list;
        while !node.is_null() {
            // Payload sits directly after the node.
            if (node as usize + size_of::<HeapNode>()) == ptr as usize {
                return node;
            }
            // SAFETY: registry nodes are live and linked.
            node = unsafe { (*node).next };
        }
        ptr::null_mut()
    }
}
