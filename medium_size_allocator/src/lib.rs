//! The Two-Level Segregated Fit allocator for medium allocations,
//! from 32 KiB (where the slab allocator tops out) up to 10 MiB.
//!
//! Free blocks are indexed by a two-level directory: a first-level bitmap
//! with one bit per power-of-two size class, and per-class second-level
//! bitmaps that subdivide each class into 32 linear buckets. A bit is set
//! exactly when the corresponding free list is non-empty, so finding a
//! just-large-enough block is two bit scans with no list walking.
//!
//! Blocks live in pools. Each pool is one fully-committed reservation
//! framed by two sentinels: the pool header at the base (whose embedded
//! block header is the `prev_physical` of the first real block) and a
//! zero-size block after the last payload byte. Walking `next_physical`
//! from the first sentinel to the last reproduces the pool interior with
//! no gaps; freed blocks coalesce with free physical neighbors in O(1)
//! through the `prev_physical` back-links.
//!
//! Fully-freed pools are not returned to the OS by `free` itself: the
//! coalesced interior goes back on the free lists so the pool can absorb
//! new traffic, and [`MediumSizeAllocator::compact`] releases any pool
//! whose interior is a single free block.
//!
//! No locking here; the owning manager serializes access (`&mut self`).

#![no_std]

#[macro_use] extern crate log;
#[macro_use] extern crate static_assertions;

mod block;
#[cfg(test)]
mod test;

use core::mem::size_of;
use core::ptr::{self, NonNull};
pub use block::{BLOCK_ALIGN, HEADER_SIZE};
use block::{BlockHeader, FreeBlockHeader, PoolHeader};
use mem_config::medium_alloc::{
    DEFAULT_POOL_SIZE, MAX_ALLOCATION_SIZE, MIN_ALLOCATION_SIZE, POOL_GRANULARITY_IN_PAGES, SLI,
    SL_COUNT,
};
use mem_utils::{
    align_ptr_up, align_up, bit_scan_forward, bit_scan_reverse, is_aligned, log2, offset_ptr,
    pow2, ptr_diff, round_up_to,
};
use virtual_memory::{MemoryUsage, VirtualAddressSpace};

/// Shift that maps a first-level bit index back to `log2` of block size:
/// class 0 holds blocks of `[MIN_ALLOCATION_SIZE, 2 * MIN_ALLOCATION_SIZE)`.
const COUNT_OFFSET: usize = log2(MIN_ALLOCATION_SIZE) + 1;

/// First-level class count, with one class of headroom past
/// `MAX_ALLOCATION_SIZE`: a fully-coalesced pool interior exceeds the
/// maximum request by the pool framing slack and must still be mappable.
const FL_COUNT: usize = log2(MAX_ALLOCATION_SIZE) - log2(MIN_ALLOCATION_SIZE) + 2;

/// Exclusive upper bound on any size the directory can hold.
const MAX_MAPPABLE_SIZE: usize = 1 << (COUNT_OFFSET - 1 + FL_COUNT);

// Free-list links of a free block live in its payload.
const_assert!(MIN_ALLOCATION_SIZE >= size_of::<FreeBlockHeader>() - HEADER_SIZE);
const_assert!(MIN_ALLOCATION_SIZE.is_power_of_two());
// The second-level shift must stay below the smallest class's log2.
const_assert!(SLI < COUNT_OFFSET - 1);
// Both bitmaps are held in u64 words.
const_assert!(FL_COUNT <= 64);
const_assert!(SL_COUNT <= 64);

/// A position in the free-list directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BlockMap {
    fl: usize,
    sl: usize,
}

/// The medium-size back-end. See the crate docs for the overall scheme.
pub struct MediumSizeAllocator {
    fl_bitmap: u64,
    sl_bitmap: [u64; FL_COUNT],
    free_blocks: [[*mut FreeBlockHeader; SL_COUNT]; FL_COUNT],
    pool_list: *mut PoolHeader,
    pool_count: usize,
    used_bytes: usize,
}

// Every raw pointer in here refers into one of the allocator's own pool
// reservations; the owning manager serializes all access.
unsafe impl Send for MediumSizeAllocator {}

impl MediumSizeAllocator {
    /// Creates an empty allocator. Pools are reserved lazily, on the
    /// first allocation that cannot be served.
    pub fn new() -> MediumSizeAllocator {
        MediumSizeAllocator {
            fl_bitmap: 0,
            sl_bitmap: [0; FL_COUNT],
            free_blocks: [[ptr::null_mut(); SL_COUNT]; FL_COUNT],
            pool_list: ptr::null_mut(),
            pool_count: 0,
            used_bytes: 0,
        }
    }

    /// Returns true if a request of `size` bytes at `align` alignment is
    /// in this allocator's range. `align` must be a power of two.
    pub fn can_allocate(&self, size: usize, align: usize) -> bool {
        let aligned_size = align_up(size, align.max(BLOCK_ALIGN));
        (MIN_ALLOCATION_SIZE..=MAX_ALLOCATION_SIZE).contains(&aligned_size)
    }

    /// Returns true if `ptr` falls in any pool of this allocator.
    pub fn owns_allocation(&self, ptr: *const u8) -> bool {
        let mut pool = self.pool_list;
        while !pool.is_null() {
            // SAFETY: the pool list links through live pool headers.
            unsafe {
                if (*pool).memory.owns_address(ptr) {
                    return true;
                }
                pool = (*pool).next_pool;
            }
        }
        false
    }

    /// Allocates `size` bytes aligned to `max(align, BLOCK_ALIGN)`.
    /// Grows by one pool if the directory has nothing suitable; returns
    /// `None` once growth fails too.
    pub fn allocate(&mut self, size: usize, align: usize) -> Option<NonNull<u8>> {
        let adjusted_size = align_up(size.max(MIN_ALLOCATION_SIZE), BLOCK_ALIGN);
        if adjusted_size > MAX_ALLOCATION_SIZE {
            return None;
        }
        if align > BLOCK_ALIGN {
            return self.allocate_aligned(adjusted_size, align);
        }
        let block = self.take_suitable_block(adjusted_size)?;
        // SAFETY: `block` was just removed from the directory and is a
        // valid in-pool block of at least `adjusted_size` bytes.
        unsafe {
            self.trim_tail(block, adjusted_size);
            self.used_bytes += (*block).base.size();
            #[cfg(debug_assertions)]
            fill_payload(block, 0xAA);
            NonNull::new(payload_of(block))
        }
    }

    /// Reallocation per the shrink-in-place rule: a shrink that stays
    /// within one minimum block of the current size keeps the block.
    pub fn reallocate(&mut self, ptr: *mut u8, size: usize, align: usize) -> Option<NonNull<u8>> {
        if ptr.is_null() {
            return self.allocate(size, align);
        }
        if size == 0 {
            self.free(ptr);
            return None;
        }
        let current_size = self.size_of(ptr);
        if size <= current_size && current_size - size < MIN_ALLOCATION_SIZE {
            return NonNull::new(ptr);
        }
        let new_block = self.allocate(size, align)?;
        // SAFETY: both blocks are live and at least `min(current, size)`
        // bytes long; a fresh allocation cannot overlap a live block.
        unsafe {
            ptr::copy_nonoverlapping(ptr, new_block.as_ptr(), current_size.min(size));
        }
        self.free(ptr);
        Some(new_block)
    }

    /// Returns a block to the directory, coalescing it with any free
    /// physical neighbors first. Null is ignored; a block that is
    /// already free is reported and ignored (best-effort double-free
    /// detection). The caller must own `ptr` (the manager checks).
    pub fn free(&mut self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        // SAFETY: per the contract, `ptr` is a payload address previously
        // returned by this allocator, so a block header precedes it.
        unsafe {
            let block = header_from_pointer(ptr);
            if (*block).base.is_free() {
                error!("medium_size_allocator: BUG: double free of block at {:p}", ptr);
                return;
            }
            let size = (*block).base.size();
            assert!(
                size >= MIN_ALLOCATION_SIZE && size < MAX_MAPPABLE_SIZE && is_aligned(size, BLOCK_ALIGN),
                "corrupt block header at {:p}: size word {:#x}, prev_physical {:p}",
                block,
                size,
                (*block).base.prev_physical,
            );
            self.used_bytes -= size;
            #[cfg(debug_assertions)]
            fill_payload(block, 0xDD);
            let merged = self.merge_neighbors(block);
            let merged_size = (*merged).base.size();
            self.insert_block(merged, Self::mapping(merged_size));
        }
    }

    /// Payload size of the block holding `ptr`, straight from its header.
    pub fn size_of(&self, ptr: *const u8) -> usize {
        if ptr.is_null() {
            return 0;
        }
        // SAFETY: per the contract, a block header precedes `ptr`.
        unsafe { (*header_from_pointer(ptr as *mut u8)).base.size() }
    }

    /// Releases every pool whose interior is a single free block and
    /// returns the total committed bytes handed back to the OS.
    pub fn compact(&mut self) -> usize {
        let mut total_released = 0;
        let mut pool = self.pool_list;
        while !pool.is_null() {
            // SAFETY: walking the live pool list; `next_pool` is read
            // before the pool is (possibly) released.
            unsafe {
                let next = (*pool).next_pool;
                if self.is_pool_releasable(pool) {
                    self.remove_pool_free_blocks(pool);
                    total_released += (*pool).memory.committed_size();
                    self.release_pool(pool);
                }
                pool = next;
            }
        }
        if total_released > 0 {
            trace!("medium_size_allocator: compaction released {} bytes", total_released);
        }
        total_released
    }

    pub fn memory_usage(&self) -> MemoryUsage {
        let mut usage = MemoryUsage {
            allocated: self.used_bytes,
            committed: 0,
            reserved: 0,
        };
        let mut pool = self.pool_list;
        while !pool.is_null() {
            // SAFETY: walking the live pool list.
            unsafe {
                usage.committed += (*pool).memory.committed_size();
                usage.reserved += (*pool).memory.reserved_size();
                pool = (*pool).next_pool;
            }
        }
        usage
    }

    /// Maps a block size to its directory position: the first level is
    /// the size's power of two, the second level the next `SLI` bits
    /// below the most significant one.
    fn mapping(size: usize) -> BlockMap {
        debug_assert!(size >= MIN_ALLOCATION_SIZE && size < MAX_MAPPABLE_SIZE);
        let fl = bit_scan_reverse(size as u64);
        let sl = (size >> (fl - SLI)) ^ SL_COUNT;
        BlockMap { fl: fl - (COUNT_OFFSET - 1), sl }
    }

    /// Rounds a request up to the top of its directory bucket. Searching
    /// from the resulting position only yields blocks at least `size`
    /// bytes big; searching from `mapping(size)` directly could return a
    /// smaller block from the same bucket.
    fn bucket_ceiling(size: usize) -> usize {
        size + (pow2(bit_scan_reverse(size as u64) - SLI) - 1)
    }

    /// Two bit scans locate the lowest non-empty bucket at or above
    /// `map`; `map` is updated to the bucket actually found.
    fn find_suitable_block(&mut self, map: &mut BlockMap) -> Option<*mut FreeBlockHeader> {
        let mut fl = map.fl;
        let mut sl_mapping = self.sl_bitmap[fl] & (!0u64 << map.sl);
        if sl_mapping == 0 {
            let fl_mapping = self.fl_bitmap & (!0u64 << (fl + 1));
            if fl_mapping == 0 {
                // Nothing big enough anywhere; the caller grows a pool.
                return None;
            }
            fl = bit_scan_forward(fl_mapping);
            sl_mapping = self.sl_bitmap[fl];
        }
        let sl = bit_scan_forward(sl_mapping);
        let block = self.free_blocks[fl][sl];
        debug_assert!(!block.is_null());
        map.fl = fl;
        map.sl = sl;
        Some(block)
    }

    /// Finds a block of at least `search_size` bytes and removes it from
    /// the directory, growing by one pool if the first search misses.
    fn take_suitable_block(&mut self, search_size: usize) -> Option<*mut FreeBlockHeader> {
        let ceiling = Self::bucket_ceiling(search_size);
        let mut map = Self::mapping(ceiling);
        let mut block = self.find_suitable_block(&mut map);
        if block.is_none() {
            if let Err(e) = self.add_pool(ceiling) {
                error!(
                    "medium_size_allocator: pool growth for {} bytes failed: {}",
                    search_size, e
                );
                return None;
            }
            map = Self::mapping(ceiling);
            block = self.find_suitable_block(&mut map);
        }
        let block = block?;
        // SAFETY: blocks in the directory are valid free in-pool blocks.
        unsafe {
            debug_assert!(!(*block).base.is_last_physical());
            debug_assert!((*block).base.size() >= search_size);
        }
        self.remove_block(block, map);
        Some(block)
    }

    /// The alignment-aware allocation path (§ aligned split): carve the
    /// first suitably-aligned cut out of a block with enough slack, give
    /// the misaligned prefix back to the directory, then trim the tail.
    fn allocate_aligned(&mut self, size: usize, align: usize) -> Option<NonNull<u8>> {
        debug_assert!(align.is_power_of_two() && align > BLOCK_ALIGN);
        // Enough room to place an aligned cut whose prefix is itself a
        // valid free block, whatever the found block's misalignment.
        let search_size = size + align + HEADER_SIZE + MIN_ALLOCATION_SIZE;
        let mut block = self.take_suitable_block(search_size)?;
        // SAFETY: `block` is removed from the directory, large enough by
        // the search bound, and all derived pointers stay inside it.
        unsafe {
            let payload = payload_of(block) as usize;
            if !is_aligned(payload, align) {
                let mut aligned_payload = align_up(payload, align);
                // The prefix must be able to carry its own free block.
                while aligned_payload - payload < HEADER_SIZE + MIN_ALLOCATION_SIZE {
                    aligned_payload += align;
                }
                let block_end = payload + (*block).base.size();
                debug_assert!(aligned_payload + size <= block_end);

                let next = next_block(block);
                let cut = (aligned_payload - HEADER_SIZE) as *mut FreeBlockHeader;
                (*cut).base.reset(block_end - aligned_payload);
                (*cut).base.prev_physical = block as *mut BlockHeader;
                (*next).base.prev_physical = cut as *mut BlockHeader;

                let prefix_size = aligned_payload - HEADER_SIZE - payload;
                (*block).base.set_size(prefix_size);
                self.insert_block(block, Self::mapping(prefix_size));
                block = cut;
            }
            self.trim_tail(block, size);
            debug_assert!(is_aligned(payload_of(block) as usize, align));
            self.used_bytes += (*block).base.size();
            #[cfg(debug_assertions)]
            fill_payload(block, 0xAA);
            NonNull::new(payload_of(block))
        }
    }

    /// Splits `block`'s tail off and reinserts it, when the leftover is
    /// worth tracking as its own block.
    ///
    /// # Safety
    /// `block` must be a valid in-pool block owned by the caller (not on
    /// any free list).
    unsafe fn trim_tail(&mut self, block: *mut FreeBlockHeader, size: usize) {
        let block_size = (*block).base.size();
        if block_size > size && block_size - size > MIN_ALLOCATION_SIZE {
            let remaining = self.split(block, size);
            if remaining != block {
                let remaining_size = (*remaining).base.size();
                self.insert_block(remaining, Self::mapping(remaining_size));
            }
        }
    }

    /// Splits `block` so it keeps exactly `size` payload bytes; the high
    /// remainder becomes a new (not yet inserted) block. Returns `block`
    /// unchanged when either side would drop below the minimum size.
    ///
    /// # Safety
    /// Same contract as [`Self::trim_tail`].
    unsafe fn split(&mut self, block: *mut FreeBlockHeader, size: usize) -> *mut FreeBlockHeader {
        let block_size = (*block).base.size();
        let size_with_header = size + HEADER_SIZE;
        if size >= MIN_ALLOCATION_SIZE && block_size - size_with_header >= MIN_ALLOCATION_SIZE {
            let remaining = offset_ptr(block, size_with_header as isize) as *mut FreeBlockHeader;
            (*remaining).base.reset(block_size - size_with_header);
            (*remaining).base.set_used();
            (*remaining).base.prev_physical = block as *mut BlockHeader;
            let next = next_block(remaining);
            (*next).base.prev_physical = remaining as *mut BlockHeader;
            (*block).base.set_size(size);
            debug_assert_eq!(
                block_size + HEADER_SIZE,
                (*block).base.full_size() + (*remaining).base.full_size()
            );
            remaining
        } else {
            block
        }
    }

    /// Absorbs every free physical neighbor of `block`, in both
    /// directions, and returns the merged block (not yet inserted).
    ///
    /// # Safety
    /// `block` must be a valid in-pool block owned by the caller.
    unsafe fn merge_neighbors(&mut self, block: *mut FreeBlockHeader) -> *mut FreeBlockHeader {
        let mut block = block;
        loop {
            let next = next_block(block);
            if !(*next).base.is_last_physical() && (*next).base.is_free() {
                let next_size = (*next).base.size();
                self.remove_block(next, Self::mapping(next_size));
                merge_blocks(block, next);
                continue;
            }
            let prev = (*block).base.prev_physical as *mut FreeBlockHeader;
            // The pool head sentinel carries the last-physical flag, so
            // this also terminates at the front of the pool.
            if !(*prev).base.is_last_physical() && (*prev).base.is_free() {
                let prev_size = (*prev).base.size();
                self.remove_block(prev, Self::mapping(prev_size));
                merge_blocks(prev, block);
                block = prev;
                continue;
            }
            break;
        }
        block
    }

    /// Pushes `block` onto `FREE[fl][sl]` and sets both bitmap bits.
    fn insert_block(&mut self, block: *mut FreeBlockHeader, map: BlockMap) {
        debug_assert!(map.fl < FL_COUNT && map.sl < SL_COUNT);
        // SAFETY: `block` is a valid block owned by the caller; list
        // heads are valid free blocks or null.
        unsafe {
            debug_assert!(!(*block).base.is_last_physical());
            let head = self.free_blocks[map.fl][map.sl];
            (*block).next_free = head;
            (*block).prev_free = ptr::null_mut();
            (*block).base.set_free();
            if !head.is_null() {
                (*head).prev_free = block;
            }
            self.free_blocks[map.fl][map.sl] = block;
            self.fl_bitmap |= 1 << map.fl;
            self.sl_bitmap[map.fl] |= 1 << map.sl;
        }
    }

    /// Unlinks `block` from `FREE[fl][sl]`, clearing the bitmap bits when
    /// the list empties, and marks the block used.
    fn remove_block(&mut self, block: *mut FreeBlockHeader, map: BlockMap) {
        debug_assert!(map.fl < FL_COUNT && map.sl < SL_COUNT);
        // SAFETY: `block` is on this free list, so its links are valid.
        unsafe {
            (*block).base.set_used();
            let prev = (*block).prev_free;
            let next = (*block).next_free;
            if !prev.is_null() {
                (*prev).next_free = next;
            }
            if !next.is_null() {
                (*next).prev_free = prev;
            }
            (*block).prev_free = ptr::null_mut();
            (*block).next_free = ptr::null_mut();
            if self.free_blocks[map.fl][map.sl] == block {
                self.free_blocks[map.fl][map.sl] = next;
                if next.is_null() {
                    self.sl_bitmap[map.fl] &= !(1u64 << map.sl);
                    if self.sl_bitmap[map.fl] == 0 {
                        self.fl_bitmap &= !(1u64 << map.fl);
                    }
                }
            }
        }
    }

    /// Reserves, commits and frames a new pool big enough for a `size`-
    /// byte block, and inserts its interior as one free block.
    fn add_pool(&mut self, size: usize) -> Result<(), &'static str> {
        let overhead = size_of::<PoolHeader>() + size_of::<FreeBlockHeader>() + HEADER_SIZE;
        let granularity = POOL_GRANULARITY_IN_PAGES * virtual_memory::os_page_size();
        let needed = align_up(size + overhead, BLOCK_ALIGN);
        let pool_bytes = round_up_to(needed.max(DEFAULT_POOL_SIZE), granularity);
        let mut memory =
            VirtualAddressSpace::reserve(None, pool_bytes).map_err(<&'static str>::from)?;
        let base = memory.commit_all().map_err(<&'static str>::from)?;
        let reserved = memory.reserved_size();

        // SAFETY: the pool's memory was just committed; every write below
        // lands inside it, and the interior/sentinel arithmetic is
        // checked by the debug assertions.
        unsafe {
            let pool = base as *mut PoolHeader;
            let first_block = align_ptr_up(
                offset_ptr(pool, size_of::<PoolHeader>() as isize),
                BLOCK_ALIGN,
            );
            let pool_size = reserved - ptr_diff(base, first_block);
            ptr::write(
                pool,
                PoolHeader {
                    head_sentinel: BlockHeader::new(),
                    prev_pool: ptr::null_mut(),
                    next_pool: self.pool_list,
                    base_address: first_block,
                    pool_size,
                    memory,
                },
            );
            (*pool).head_sentinel.set_last_physical();
            if !self.pool_list.is_null() {
                (*self.pool_list).prev_pool = pool;
            }
            self.pool_list = pool;
            self.pool_count += 1;

            let block = first_block as *mut FreeBlockHeader;
            let interior = pool_size - 2 * HEADER_SIZE;
            debug_assert!(interior >= size);
            debug_assert!(interior < MAX_MAPPABLE_SIZE);
            (*block).base.reset(interior);
            (*block).base.prev_physical = ptr::addr_of_mut!((*pool).head_sentinel);

            let end_sentinel = next_block(block);
            (*end_sentinel).base.reset(0);
            (*end_sentinel).base.set_last_physical();
            (*end_sentinel).base.prev_physical = block as *mut BlockHeader;

            self.insert_block(block, Self::mapping(interior));
            debug!(
                "medium_size_allocator: added pool of {} bytes at {:p} ({} pools live)",
                reserved, base, self.pool_count
            );
        }
        Ok(())
    }

    /// True when every non-sentinel block of the pool is free. The walk
    /// ends at the zero-size last-physical sentinel that frames the pool.
    ///
    /// # Safety
    /// `pool` must be on the live pool list.
    unsafe fn is_pool_releasable(&self, pool: *mut PoolHeader) -> bool {
        let mut block = (*pool).base_address as *mut FreeBlockHeader;
        loop {
            let header = &(*block).base;
            if !header.is_last_physical() && !header.is_free() {
                return false;
            }
            if header.size() == 0 && header.is_last_physical() {
                return true;
            }
            block = next_block(block);
        }
    }

    /// Unlinks all of the pool's (free) blocks from the directory, in
    /// preparation for releasing the pool.
    ///
    /// # Safety
    /// `pool` must be on the live pool list and releasable.
    unsafe fn remove_pool_free_blocks(&mut self, pool: *mut PoolHeader) {
        let mut block = (*pool).base_address as *mut FreeBlockHeader;
        while !(*block).base.is_last_physical() {
            debug_assert!((*block).base.is_free());
            let size = (*block).base.size();
            self.remove_block(block, Self::mapping(size));
            block = next_block(block);
        }
    }

    /// Unlinks the pool from the pool list and releases its reservation.
    ///
    /// # Safety
    /// `pool` must be on the live pool list with no blocks of it left in
    /// the directory; the pool memory is gone when this returns.
    unsafe fn release_pool(&mut self, pool: *mut PoolHeader) {
        let prev = (*pool).prev_pool;
        let next = (*pool).next_pool;
        if !prev.is_null() {
            (*prev).next_pool = next;
        } else {
            self.pool_list = next;
        }
        if !next.is_null() {
            (*next).prev_pool = prev;
        }
        self.pool_count -= 1;
        // Move the reservation handle out of the pool's own memory, then
        // let it drop: that unmaps the pool, header included.
        let memory = ptr::read(ptr::addr_of!((*pool).memory));
        drop(memory);
    }

    /// Internal-state accessors for tests and debugging.
    #[doc(hidden)]
    pub fn pool_count(&self) -> usize {
        self.pool_count
    }

    /// Walks every pool's physical block chain in address order, calling
    /// `f(payload_size, is_free)` for each non-sentinel block, and
    /// asserts that every `prev_physical` back-link matches the walk.
    #[doc(hidden)]
    pub fn for_each_block(&self, mut f: impl FnMut(usize, bool)) {
        let mut pool = self.pool_list;
        while !pool.is_null() {
            // SAFETY: walking live pools and their framed block chains.
            unsafe {
                let mut prev = ptr::addr_of_mut!((*pool).head_sentinel);
                let mut block = (*pool).base_address as *mut FreeBlockHeader;
                loop {
                    assert_eq!(
                        (*block).base.prev_physical, prev,
                        "physical back-link mismatch at {:p}",
                        block
                    );
                    if (*block).base.is_last_physical() {
                        assert_eq!((*block).base.size(), 0);
                        // The chain must tile the interior exactly: the
                        // sentinel's end is the end of the pool.
                        assert_eq!(
                            ptr_diff((*pool).base_address, block as *const u8) + HEADER_SIZE,
                            (*pool).pool_size,
                            "pool blocks do not tile the pool interior"
                        );
                        break;
                    }
                    f((*block).base.size(), (*block).base.is_free());
                    prev = block as *mut BlockHeader;
                    block = next_block(block);
                }
                pool = (*pool).next_pool;
            }
        }
    }

    /// Asserts the directory invariants: a first-level bit is set iff its
    /// second-level word is non-zero, a second-level bit is set iff its
    /// list is non-empty, and every listed block maps back to its list.
    #[doc(hidden)]
    pub fn check_directory_invariants(&self) {
        for fl in 0..FL_COUNT {
            assert_eq!(
                self.fl_bitmap & (1 << fl) != 0,
                self.sl_bitmap[fl] != 0,
                "first-level bit {} disagrees with second-level word",
                fl
            );
            for sl in 0..SL_COUNT {
                let head = self.free_blocks[fl][sl];
                assert_eq!(
                    self.sl_bitmap[fl] & (1 << sl) != 0,
                    !head.is_null(),
                    "second-level bit ({}, {}) disagrees with list head",
                    fl,
                    sl
                );
                let mut block = head;
                while !block.is_null() {
                    // SAFETY: free lists link through valid free blocks.
                    unsafe {
                        assert!((*block).base.is_free());
                        let map = Self::mapping((*block).base.size());
                        assert_eq!((map.fl, map.sl), (fl, sl), "block on the wrong free list");
                        block = (*block).next_free;
                    }
                }
            }
        }
    }
}

impl Default for MediumSizeAllocator {
    fn default() -> MediumSizeAllocator {
        MediumSizeAllocator::new()
    }
}

fn payload_of(block: *mut FreeBlockHeader) -> *mut u8 {
    offset_ptr(block, HEADER_SIZE as isize)
}

fn header_from_pointer(ptr: *mut u8) -> *mut FreeBlockHeader {
    offset_ptr(ptr, -(HEADER_SIZE as isize)) as *mut FreeBlockHeader
}

/// The physically next block: this block's payload end.
///
/// # Safety
/// `block` must point at a valid block header that is not the trailing
/// sentinel of its pool.
unsafe fn next_block(block: *mut FreeBlockHeader) -> *mut FreeBlockHeader {
    offset_ptr(block, ((*block).base.size() + HEADER_SIZE) as isize) as *mut FreeBlockHeader
}

/// Absorbs `right` (physically adjacent, already unlinked) into `left`.
///
/// # Safety
/// `right` must be the block physically following `left`.
unsafe fn merge_blocks(left: *mut FreeBlockHeader, right: *mut FreeBlockHeader) {
    (*left).base.set_size((*left).base.size() + (*right).base.full_size());
    let next = next_block(left);
    (*next).base.prev_physical = left as *mut BlockHeader;
    // The absorbed header is payload now; scrub it so a stale free flag
    // can never be mistaken for a live header.
    (*right).base.reset(0);
}

#[cfg(debug_assertions)]
unsafe fn fill_payload(block: *mut FreeBlockHeader, value: u8) {
    ptr::write_bytes(payload_of(block), value, (*block).base.size());
}
