//! Tuning constants for the memory management subsystem.
//!
//! Every size here is in bytes unless the name says otherwise. The values
//! are grouped by the component that consumes them; derived values that
//! depend on type layouts (e.g. the TLSF first-level class count) live in
//! the crates that define those types.

#![no_std]

/// 64-bit architecture results in 8 bytes per address.
pub const BYTES_PER_ADDR: usize = core::mem::size_of::<usize>();

/// Alignment used when a caller passes `0` ("natural") for the alignment
/// argument of an allocation operation.
pub const DEFAULT_ALIGNMENT: usize = 8;

/// Page size assumed when the OS cannot be queried. All mainstream
/// platforms this subsystem targets use 4 KiB base pages.
pub const FALLBACK_OS_PAGE_SIZE: usize = 4096;

pub mod small_alloc {
    //! Constants for the small-size (slab) allocator.

    /// The slab page size. Each page is pinned to a single size class and
    /// carved into `PAGE_SIZE / class_size` equal blocks.
    pub const PAGE_SIZE: usize = 64 * 1024;

    /// Total reserved window for small allocations. Pages are committed
    /// from this reservation on demand; it is never grown.
    pub const ADDRESS_SPACE_SIZE: usize = 512 * 1024 * 1024;

    /// Value: 8192.
    pub const NUM_OF_PAGES: usize = ADDRESS_SPACE_SIZE / PAGE_SIZE;

    /// The smallest block handed out, and the size-class granularity.
    /// A freed block stores a doubly-linked free-list node in its own
    /// payload, so this must hold two pointers.
    pub const MIN_ALLOCATION_SIZE: usize = 2 * super::BYTES_PER_ADDR;

    /// The largest request served from slab pages; anything bigger is the
    /// medium allocator's problem.
    pub const MAX_ALLOCATION_SIZE: usize = 32 * 1024;

    /// Value: 2048.
    pub const NUM_OF_SIZES: usize = MAX_ALLOCATION_SIZE / MIN_ALLOCATION_SIZE;

    /// Once this many bytes of fully-empty pages accumulate on the
    /// free-page list, the whole list is decommitted in one batch.
    pub const MIN_DECOMMIT_SIZE: usize = 2 * 1024 * 1024;
}

pub mod medium_alloc {
    //! Constants for the medium-size (TLSF) allocator.

    /// The smallest block the TLSF directory tracks. Must be a power of
    /// two and large enough for the in-payload free-list links.
    pub const MIN_ALLOCATION_SIZE: usize = 512;

    /// The largest single request served by the TLSF engine: 10 MiB.
    pub const MAX_ALLOCATION_SIZE: usize = 10 * 1024 * 1024;

    /// How many bits of second-level subdivision each power-of-two class
    /// gets: each first-level class splits into `2^SLI` linear buckets.
    pub const SLI: usize = 5;

    /// Value: 32.
    pub const SL_COUNT: usize = 1 << SLI;

    /// New pools are rounded up to a multiple of this many OS pages.
    pub const POOL_GRANULARITY_IN_PAGES: usize = 4;

    /// Floor on the size of a new pool. Growing by whole pools of at
    /// least this size lets many medium blocks share one reservation
    /// instead of paying a reserve-and-commit round trip each.
    pub const DEFAULT_POOL_SIZE: usize = 4 * 1024 * 1024;
}
