//! Provides [`VirtualAddressSpace`], a typed handle over one OS reservation
//! of virtual address space.
//!
//! A reservation is address-stable for its whole life: the range is claimed
//! from the OS up front and individual sub-ranges are committed (backed by
//! memory) and decommitted on demand. The handle tracks how many bytes are
//! currently committed so its owner can report usage without asking the OS.
//!
//! Ownership is strict: the handle is move-only, and dropping it decommits
//! and releases the entire reservation.

#![no_std]

#[macro_use] extern crate log;
#[macro_use] extern crate static_assertions;


use core::fmt;
use mem_utils::{is_aligned, ptr_in_range};

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod unix;
        use unix as os;
    } else {
        compile_error!("virtual_memory only supports unix-like platforms");
    }
}

/// A point-in-time usage snapshot reported by an allocator: how many bytes
/// its callers currently hold, how many bytes of its reservations are
/// backed by memory, and how much address space it has reserved in total.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MemoryUsage {
    pub allocated: usize,
    pub committed: usize,
    pub reserved: usize,
}

impl MemoryUsage {
    /// Component-wise sum, used by owners that aggregate several
    /// allocators into one report.
    pub fn combined_with(self, other: MemoryUsage) -> MemoryUsage {
        MemoryUsage {
            allocated: self.allocated + other.allocated,
            committed: self.committed + other.committed,
            reserved: self.reserved + other.reserved,
        }
    }
}

/// Protection applied to committed pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageProtection {
    ReadWrite,
    ReadOnly,
}

/// Failure modes of the reservation operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// The OS could not find (or refused) a range of address space.
    OutOfAddressSpace,
    /// The OS refused a commit, decommit or protection change.
    CommitFailed,
    /// The requested sub-range is outside the reservation or not
    /// page-aligned.
    InvalidRange,
}

impl From<VmError> for &'static str {
    fn from(e: VmError) -> &'static str {
        match e {
            VmError::OutOfAddressSpace => "out of virtual address space",
            VmError::CommitFailed => "the OS refused to commit/decommit/protect pages",
            VmError::InvalidRange => "address range is outside the reservation or misaligned",
        }
    }
}

/// Returns the OS page size, queried once and cached.
pub fn os_page_size() -> usize {
    os::page_size()
}

/// Returns the granularity at which reservations are placed by the OS.
/// On unix-like systems this is the page size.
pub fn os_allocation_granularity() -> usize {
    os::page_size()
}

/// A reserved, address-stable range of virtual address space.
///
/// The committed-byte counter equals the sum of the sizes passed to
/// successful commit calls minus those passed to successful decommit
/// calls. Callers must not overlap commit ranges: the counter (not the
/// OS) is what would double-count.
pub struct VirtualAddressSpace {
    base: *mut u8,
    reserved: usize,
    committed: usize,
}

// A reservation handle names memory, it does not alias anyone else's;
// moving it across threads is sound as long as access to the committed
// memory itself is synchronized by the owner.
unsafe impl Send for VirtualAddressSpace {}

// The reservation is owned uniquely. Copying the handle would let two
// owners release the same range.
assert_not_impl_any!(VirtualAddressSpace: Clone);

impl VirtualAddressSpace {
    /// Reserves at least `size` bytes of address space, optionally near
    /// `addr_hint`. The hint is best-effort; the OS may place the range
    /// anywhere. No memory is committed.
    pub fn reserve(addr_hint: Option<*mut u8>, size: usize) -> Result<VirtualAddressSpace, VmError> {
        if size == 0 {
            return Err(VmError::InvalidRange);
        }
        let size = mem_utils::align_up(size, os::page_size());
        let base = os::reserve(addr_hint, size)?;
        trace!("virtual_memory: reserved {} bytes at {:p}", size, base);
        Ok(VirtualAddressSpace { base, reserved: size, committed: 0 })
    }

    /// Reserves `size` bytes whose base address is a multiple of `align`.
    ///
    /// The OS only guarantees page-granular placement, so this over-reserves
    /// by `align` bytes and trims the misaligned head and tail back off.
    pub fn reserve_aligned(size: usize, align: usize) -> Result<VirtualAddressSpace, VmError> {
        if size == 0 || !align.is_power_of_two() {
            return Err(VmError::InvalidRange);
        }
        let page_size = os::page_size();
        let size = mem_utils::align_up(size, page_size);
        if align <= page_size {
            return Self::reserve(None, size);
        }
        let base = os::reserve_trimmed(size, align)?;
        trace!("virtual_memory: reserved {} bytes at {:p} (aligned to {})", size, base, align);
        Ok(VirtualAddressSpace { base, reserved: size, committed: 0 })
    }

    /// Commits the entire reserved range, read-write.
    pub fn commit_all(&mut self) -> Result<*mut u8, VmError> {
        os::commit(self.base, self.reserved)?;
        self.committed = self.reserved;
        Ok(self.base)
    }

    /// Commits `size` bytes starting at `addr`, read-write. `addr` and
    /// `size` must be page-aligned and the range must lie inside the
    /// reservation.
    pub fn commit_by_address(&mut self, addr: *mut u8, size: usize) -> Result<*mut u8, VmError> {
        self.check_range(addr, size)?;
        os::commit(addr, size)?;
        self.committed += size;
        Ok(addr)
    }

    /// Commits `size` bytes starting `offset` bytes into the reservation.
    pub fn commit_by_offset(&mut self, offset: usize, size: usize) -> Result<*mut u8, VmError> {
        let addr = self.address_at(offset);
        self.commit_by_address(addr, size)
    }

    /// Returns a committed sub-range to the "reserved but unbacked" state.
    /// The address range stays owned by this reservation.
    pub fn decommit_by_address(&mut self, addr: *mut u8, size: usize) -> Result<(), VmError> {
        self.check_range(addr, size)?;
        os::decommit(addr, size)?;
        debug_assert!(self.committed >= size);
        self.committed -= size;
        Ok(())
    }

    /// Decommits `size` bytes starting `offset` bytes into the reservation.
    pub fn decommit_by_offset(&mut self, offset: usize, size: usize) -> Result<(), VmError> {
        let addr = self.address_at(offset);
        self.decommit_by_address(addr, size)
    }

    /// Decommits everything, keeping the reservation itself.
    pub fn decommit_all(&mut self) -> Result<(), VmError> {
        os::decommit(self.base, self.reserved)?;
        self.committed = 0;
        Ok(())
    }

    /// Changes the protection of a committed sub-range.
    pub fn protect_by_address(
        &mut self,
        addr: *mut u8,
        size: usize,
        protection: PageProtection,
    ) -> Result<(), VmError> {
        self.check_range(addr, size)?;
        os::protect(addr, size, protection)
    }

    /// Changes the protection of a committed sub-range given by offset.
    pub fn protect_by_offset(
        &mut self,
        offset: usize,
        size: usize,
        protection: PageProtection,
    ) -> Result<(), VmError> {
        let addr = self.address_at(offset);
        self.protect_by_address(addr, size, protection)
    }

    /// Decommits the remainder and releases the reservation.
    /// Dropping the handle does the same; this spelling just makes the
    /// intent explicit at call sites.
    pub fn release(self) {}

    /// The first address of the reservation.
    pub fn base_address(&self) -> *mut u8 {
        self.base
    }

    /// One past the last address of the reservation.
    pub fn end_address(&self) -> *mut u8 {
        mem_utils::offset_ptr(self.base, self.reserved as isize)
    }

    /// The address `offset` bytes into the reservation.
    pub fn address_at(&self, offset: usize) -> *mut u8 {
        mem_utils::offset_ptr(self.base, offset as isize)
    }

    pub fn reserved_size(&self) -> usize {
        self.reserved
    }

    pub fn committed_size(&self) -> usize {
        self.committed
    }

    /// How many OS pages the reservation spans.
    pub fn page_count(&self) -> usize {
        self.reserved / os::page_size()
    }

    /// Returns true if `ptr` falls inside `[base, base + reserved)`.
    pub fn owns_address(&self, ptr: *const u8) -> bool {
        ptr_in_range(ptr, self.base, self.end_address())
    }

    fn check_range(&self, addr: *mut u8, size: usize) -> Result<(), VmError> {
        let page_size = os::page_size();
        let in_range = self.owns_address(addr)
            && size <= self.reserved
            && mem_utils::ptr_diff(self.base, addr) + size <= self.reserved;
        if !in_range || !is_aligned(addr as usize, page_size) || !is_aligned(size, page_size) {
            return Err(VmError::InvalidRange);
        }
        Ok(())
    }
}

impl Drop for VirtualAddressSpace {
    fn drop(&mut self) {
        if let Err(e) = os::release(self.base, self.reserved) {
            // Nothing sane to do about it beyond reporting.
            error!(
                "virtual_memory: failed to release reservation at {:p} ({} bytes): {}",
                self.base,
                self.reserved,
                <&'static str>::from(e)
            );
        }
    }
}

impl fmt::Debug for VirtualAddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "VirtualAddressSpace(base: {:p}, reserved: {}, committed: {})",
            self.base, self.reserved, self.committed
        )
    }
}
