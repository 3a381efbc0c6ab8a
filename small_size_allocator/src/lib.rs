//! The slab allocator for small allocations, from 16 bytes up to 32 KiB.
//!
//! One large address-space reservation is carved into 64 KiB pages. Each
//! committed page is pinned to a single size class and split into
//! `PAGE_SIZE / class_size` equal blocks; every block of every page of a
//! class hangs off that class's doubly-linked free list, with the links
//! stored inside the freed blocks themselves. Page-granular bookkeeping
//! lives in a metadata table indexed by `(addr - base) / PAGE_SIZE`.
//!
//! Empty pages are not returned to the OS immediately: they first go to a
//! committed free-page list for cheap reuse by any class, and only once
//! that list holds [`MIN_DECOMMIT_SIZE`] bytes is the whole list
//! decommitted in one batch. Decommitted pages keep their address slot
//! (on the decommit list) and can be recommitted later.
//!
//! There is no locking here: the allocator expects to be called with
//! exclusive access (`&mut self`), which its owning manager provides by
//! serializing under its own mutex.

#![no_std]

#[macro_use] extern crate log;
#[macro_use] extern crate static_assertions;


use core::mem::size_of;
use core::ptr::{self, NonNull};
use mem_config::small_alloc::{
    ADDRESS_SPACE_SIZE, MAX_ALLOCATION_SIZE, MIN_ALLOCATION_SIZE, MIN_DECOMMIT_SIZE, NUM_OF_PAGES,
    NUM_OF_SIZES, PAGE_SIZE,
};
use mem_utils::{align_down, align_up, is_aligned, offset_ptr};
use virtual_memory::{MemoryUsage, VirtualAddressSpace};

/// The free-list node a freed block carries in its own payload.
#[repr(C)]
struct FreeBlockLink {
    prev: *mut FreeBlockLink,
    next: *mut FreeBlockLink,
}

/// The link a fully-empty (but still committed) page carries in its own
/// first bytes while it sits on the free-page list.
#[repr(C)]
struct FreePageLink {
    next: *mut FreePageLink,
}

// The minimal size class must be able to hold the in-payload free link.
const_assert!(MIN_ALLOCATION_SIZE >= size_of::<FreeBlockLink>());
const_assert!(PAGE_SIZE >= size_of::<FreePageLink>());
const_assert_eq!(MAX_ALLOCATION_SIZE % MIN_ALLOCATION_SIZE, 0);

/// Per-size-class state: the free-list head and how many bytes of this
/// class are currently handed out.
struct BlockClass {
    allocated_bytes: i64,
    free_list: *mut FreeBlockLink,
}

/// Bookkeeping for one 64 KiB page of the reservation.
///
/// `allocated_bytes` stays non-negative; it reaching zero is what sends
/// the page back to the free-page list. `assigned_size` is the size class
/// currently pinned to the page, 0 while unassigned.
struct PageMetadata {
    page_index: usize,
    allocated_bytes: i64,
    assigned_size: usize,
    next_free_page: *mut PageMetadata,
}

const EMPTY_CLASS: BlockClass = BlockClass {
    allocated_bytes: 0,
    free_list: ptr::null_mut(),
};

const EMPTY_PAGE: PageMetadata = PageMetadata {
    page_index: 0,
    allocated_bytes: 0,
    assigned_size: 0,
    next_free_page: ptr::null_mut(),
};

/// The small-size back-end. See the crate docs for the overall scheme.
pub struct SmallSizeAllocator {
    classes: [BlockClass; NUM_OF_SIZES],
    pages: [PageMetadata; NUM_OF_PAGES],
    memory: VirtualAddressSpace,
    /// Pages whose backing has been released but whose address slot is
    /// still reserved, linked through their metadata entries.
    page_decommit_list: *mut PageMetadata,
    /// Committed, fully-empty pages awaiting reuse, linked through the
    /// pages themselves.
    page_free_list: *mut FreePageLink,
    /// High-water mark: offset of the first never-committed page.
    base_offset: usize,
    /// Bytes currently sitting on the free-page list.
    page_free_list_bytes: usize,
    allocated_bytes: i64,
}

// Every raw pointer in here refers into the allocator's own reservation
// (or its own metadata table); the owning manager serializes all access.
unsafe impl Send for SmallSizeAllocator {}

impl SmallSizeAllocator {
    /// Reserves the 512 MiB window. The base must be `PAGE_SIZE`-aligned
    /// because block-to-page lookup masks addresses by the page size, so
    /// the reservation is made with explicit alignment.
    pub fn new() -> Result<SmallSizeAllocator, &'static str> {
        let memory = VirtualAddressSpace::reserve_aligned(ADDRESS_SPACE_SIZE, PAGE_SIZE)
            .map_err(<&'static str>::from)?;
        debug_assert!(is_aligned(memory.base_address() as usize, PAGE_SIZE));
        let mut pages = [EMPTY_PAGE; NUM_OF_PAGES];
        for (index, page) in pages.iter_mut().enumerate() {
            page.page_index = index;
        }
        debug!(
            "small_size_allocator: reserved {} bytes at {:p}",
            ADDRESS_SPACE_SIZE,
            memory.base_address()
        );
        Ok(SmallSizeAllocator {
            classes: [EMPTY_CLASS; NUM_OF_SIZES],
            pages,
            memory,
            page_decommit_list: ptr::null_mut(),
            page_free_list: ptr::null_mut(),
            base_offset: 0,
            page_free_list_bytes: 0,
            allocated_bytes: 0,
        })
    }

    /// Returns true if a request of `size` bytes at `align` alignment fits
    /// a slab size class. `align` must be a power of two.
    pub fn can_allocate(&self, size: usize, align: usize) -> bool {
        align_up(size, align.max(MIN_ALLOCATION_SIZE)) <= MAX_ALLOCATION_SIZE
    }

    /// Returns true if `ptr` lies inside this allocator's reservation.
    pub fn owns_allocation(&self, ptr: *const u8) -> bool {
        self.memory.owns_address(ptr)
    }

    /// Hands out one block of the size class covering `size` and `align`.
    ///
    /// The returned address is a block boundary inside a class-pinned
    /// page, which makes it a multiple of the class size and therefore of
    /// `align`. Returns `None` when the reservation is exhausted or the
    /// OS refuses to commit a page.
    pub fn allocate(&mut self, size: usize, align: usize) -> Option<NonNull<u8>> {
        let aligned_size = align_up(size, align.max(MIN_ALLOCATION_SIZE));
        debug_assert!(aligned_size <= MAX_ALLOCATION_SIZE);
        let class_index = Self::class_index(aligned_size);
        let block = match self.pop_free_block(class_index) {
            Some(block) => block,
            None => self.refill_class_from_page(class_index)?,
        };
        debug_assert!(self.owns_allocation(block as *const u8));
        let page_index = self.page_index_of(block as *const u8);
        self.note_alloc(class_index, page_index);
        NonNull::new(block as *mut u8)
    }

    /// Returns a block to its class. Not-owned (and null) pointers are
    /// ignored. When this empties the block's page, the page moves to the
    /// free-page list, and crossing [`MIN_DECOMMIT_SIZE`] flushes that
    /// list back to the OS.
    pub fn free(&mut self, ptr: *mut u8) {
        if !self.owns_allocation(ptr) {
            return;
        }
        let page_index = self.page_index_of(ptr);
        let assigned_size = self.pages[page_index].assigned_size;
        debug_assert!(assigned_size != 0, "free of a block on an unassigned page");
        let class_index = Self::class_index(assigned_size);
        self.push_free_block(class_index, ptr as *mut FreeBlockLink);
        self.note_free(class_index, page_index);
    }

    /// The size class of the page holding `ptr`, i.e. the usable size of
    /// the block `ptr` points at.
    pub fn size_of(&self, ptr: *const u8) -> usize {
        if ptr.is_null() {
            return 0;
        }
        self.pages[self.page_index_of(ptr)].assigned_size
    }

    /// Decommits every page on the free-page list, regardless of the
    /// batching threshold. Returns the number of bytes released.
    pub fn compact(&mut self) -> usize {
        self.decommit_free_pages()
    }

    pub fn memory_usage(&self) -> MemoryUsage {
        MemoryUsage {
            allocated: self.allocated_bytes as usize,
            committed: self.memory.committed_size(),
            reserved: self.memory.reserved_size(),
        }
    }

    /// Block size of size class `index`.
    fn class_block_size(index: usize) -> usize {
        (index + 1) * MIN_ALLOCATION_SIZE
    }

    /// Size class covering `size` bytes: sizes round up to the next
    /// multiple of the granularity.
    fn class_index(size: usize) -> usize {
        if size <= MIN_ALLOCATION_SIZE {
            return 0;
        }
        align_up(size, MIN_ALLOCATION_SIZE) / MIN_ALLOCATION_SIZE - 1
    }

    fn page_base(&self, page_index: usize) -> *mut u8 {
        self.memory.address_at(page_index * PAGE_SIZE)
    }

    /// Page-table index of the page containing `ptr`. Sound because the
    /// reservation base is `PAGE_SIZE`-aligned.
    fn page_index_of(&self, ptr: *const u8) -> usize {
        let page_base = align_down(ptr as usize, PAGE_SIZE);
        (page_base - self.memory.base_address() as usize) / PAGE_SIZE
    }

    fn push_free_block(&mut self, class_index: usize, block: *mut FreeBlockLink) {
        let head = self.classes[class_index].free_list;
        // SAFETY: `block` points at a free block inside a committed page;
        // its payload is ours to use as a list node until it is handed
        // out again.
        unsafe {
            (*block).prev = ptr::null_mut();
            (*block).next = head;
            if !head.is_null() {
                (*head).prev = block;
            }
        }
        self.classes[class_index].free_list = block;
    }

    fn unlink_free_block(&mut self, class_index: usize, block: *mut FreeBlockLink) {
        // SAFETY: `block` is on the class free list, so its links are
        // valid nodes in committed pages.
        unsafe {
            let prev = (*block).prev;
            let next = (*block).next;
            if prev.is_null() {
                self.classes[class_index].free_list = next;
            } else {
                (*prev).next = next;
            }
            if !next.is_null() {
                (*next).prev = prev;
            }
            (*block).prev = ptr::null_mut();
            (*block).next = ptr::null_mut();
        }
    }

    fn pop_free_block(&mut self, class_index: usize) -> Option<*mut FreeBlockLink> {
        let head = self.classes[class_index].free_list;
        if head.is_null() {
            return None;
        }
        self.unlink_free_block(class_index, head);
        Some(head)
    }

    /// Pins a fresh page to `class_index`, carves it into blocks, links
    /// them all, and pops one.
    fn refill_class_from_page(&mut self, class_index: usize) -> Option<*mut FreeBlockLink> {
        let page = self.get_free_page()?;
        let page_index = self.page_index_of(page as *const u8);
        let block_size = Self::class_block_size(class_index);
        let block_count = PAGE_SIZE / block_size;
        for block in 0..block_count {
            let link = offset_ptr(page, (block * block_size) as isize) as *mut FreeBlockLink;
            self.push_free_block(class_index, link);
        }
        self.pages[page_index].assigned_size = block_size;
        self.pop_free_block(class_index)
    }

    /// Produces a committed, empty, unassigned page. Priority: the
    /// free-page list, then recommitting a decommitted page, then
    /// bump-committing a brand-new page from the reservation.
    fn get_free_page(&mut self) -> Option<*mut u8> {
        if !self.page_free_list.is_null() {
            let page = self.page_free_list;
            // SAFETY: pages on the free list are committed and hold a
            // valid link in their first bytes.
            self.page_free_list = unsafe { (*page).next };
            self.page_free_list_bytes -= PAGE_SIZE;
            return Some(page as *mut u8);
        }

        if !self.page_decommit_list.is_null() {
            let metadata = self.page_decommit_list;
            // SAFETY: the decommit list links through the metadata table,
            // which lives in `self`.
            let (page_index, next) = unsafe { ((*metadata).page_index, (*metadata).next_free_page) };
            let page = self.page_base(page_index);
            if let Err(e) = self.memory.commit_by_address(page, PAGE_SIZE) {
                error!(
                    "small_size_allocator: failed to recommit page {}: {}",
                    page_index,
                    <&'static str>::from(e)
                );
                return None;
            }
            self.page_decommit_list = next;
            unsafe { (*metadata).next_free_page = ptr::null_mut() };
            return Some(page);
        }

        self.commit_new_page()
    }

    fn commit_new_page(&mut self) -> Option<*mut u8> {
        if self.base_offset + PAGE_SIZE > ADDRESS_SPACE_SIZE {
            warn!("small_size_allocator: reservation exhausted");
            return None;
        }
        let page_index = self.base_offset / PAGE_SIZE;
        let page = match self.memory.commit_by_offset(self.base_offset, PAGE_SIZE) {
            Ok(page) => page,
            Err(e) => {
                error!(
                    "small_size_allocator: failed to commit page {}: {}",
                    page_index,
                    <&'static str>::from(e)
                );
                return None;
            }
        };
        self.base_offset += PAGE_SIZE;
        self.pages[page_index].allocated_bytes = 0;
        self.pages[page_index].assigned_size = 0;
        Some(page)
    }

    fn note_alloc(&mut self, class_index: usize, page_index: usize) {
        let block_size = Self::class_block_size(class_index) as i64;
        self.classes[class_index].allocated_bytes += block_size;
        self.pages[page_index].allocated_bytes += block_size;
        self.allocated_bytes += block_size;
    }

    fn note_free(&mut self, class_index: usize, page_index: usize) {
        let block_size = Self::class_block_size(class_index) as i64;
        self.classes[class_index].allocated_bytes -= block_size;
        self.pages[page_index].allocated_bytes -= block_size;
        self.allocated_bytes -= block_size;
        debug_assert!(self.pages[page_index].allocated_bytes >= 0);
        debug_assert!(self.classes[class_index].allocated_bytes >= 0);
        if self.pages[page_index].allocated_bytes == 0 {
            self.release_empty_page(page_index);
        }
    }

    /// Pulls every block of the now-empty page out of its class free list
    /// and parks the page on the free-page list.
    fn release_empty_page(&mut self, page_index: usize) {
        let assigned_size = self.pages[page_index].assigned_size;
        let class_index = Self::class_index(assigned_size);
        let block_count = PAGE_SIZE / assigned_size;
        let page = self.page_base(page_index);
        for block in 0..block_count {
            let link = offset_ptr(page, (block * assigned_size) as isize) as *mut FreeBlockLink;
            self.unlink_free_block(class_index, link);
        }

        let link = page as *mut FreePageLink;
        // SAFETY: the page is committed and empty; its first bytes become
        // the free-page link.
        unsafe { (*link).next = self.page_free_list };
        self.page_free_list = link;
        self.page_free_list_bytes += PAGE_SIZE;

        if self.page_free_list_bytes >= MIN_DECOMMIT_SIZE {
            self.decommit_free_pages();
        }
    }

    /// Decommits the whole free-page list, moving each page to the
    /// decommit list. Returns the number of bytes released to the OS.
    fn decommit_free_pages(&mut self) -> usize {
        let mut total_decommitted = 0;
        let mut page = self.page_free_list;
        while !page.is_null() {
            // SAFETY: read the link out before the page's backing is
            // dropped; after the decommit the page must not be touched.
            let next = unsafe { (*page).next };
            let page_index = self.page_index_of(page as *const u8);
            if let Err(e) = self.memory.decommit_by_address(page as *mut u8, PAGE_SIZE) {
                // Keep this page and the rest of the list; they are still
                // committed and usable.
                error!(
                    "small_size_allocator: failed to decommit page {}: {}",
                    page_index,
                    <&'static str>::from(e)
                );
                break;
            }
            let metadata = &mut self.pages[page_index];
            metadata.next_free_page = self.page_decommit_list;
            self.page_decommit_list = metadata as *mut PageMetadata;
            total_decommitted += PAGE_SIZE;
            page = next;
        }
        self.page_free_list = page;
        self.page_free_list_bytes -= total_decommitted;
        if total_decommitted > 0 {
            trace!("small_size_allocator: decommitted {} bytes of empty pages", total_decommitted);
        }
        total_decommitted
    }

    /// Internal-state accessors for tests and debugging.
    #[doc(hidden)]
    pub fn page_state_of(&self, ptr: *const u8) -> (usize, i64) {
        let page = &self.pages[self.page_index_of(ptr)];
        (page.assigned_size, page.allocated_bytes)
    }

    #[doc(hidden)]
    pub fn free_page_list_bytes(&self) -> usize {
        self.page_free_list_bytes
    }

    #[doc(hidden)]
    pub fn is_on_free_page_list(&self, ptr: *const u8) -> bool {
        let page_base = align_down(ptr as usize, PAGE_SIZE);
        let mut page = self.page_free_list;
        while !page.is_null() {
            if page as usize == page_base {
                return true;
            }
            // SAFETY: free-page list nodes live in committed pages.
            page = unsafe { (*page).next };
        }
        false
    }

    #[doc(hidden)]
    pub fn decommit_list_len(&self) -> usize {
        let mut count = 0;
        let mut metadata = self.page_decommit_list;
        while !metadata.is_null() {
            count += 1;
            // SAFETY: the decommit list links through `self.pages`.
            metadata = unsafe { (*metadata).next_free_page };
        }
        count
    }
}
