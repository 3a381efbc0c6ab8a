//! Tests for routing, the public allocation contract and the arena.

extern crate std;

use super::*;
use std::boxed::Box;

fn new_manager() -> MemoryManager {
    MemoryManager::new().expect("failed to construct a manager")
}

fn leaked_manager() -> &'static MemoryManager {
    Box::leak(Box::new(new_manager()))
}

#[test]
fn small_allocations_round_trip() {
    let manager = new_manager();
    let p1 = manager.allocate(16, 8).unwrap();
    let p2 = manager.allocate(64, 64).unwrap();
    assert_eq!(p2.as_ptr() as usize % 64, 0);
    assert_eq!(manager.size_of(p1.as_ptr()), 16);
    assert_eq!(manager.size_of(p2.as_ptr()), 64);
    assert!(manager.owns_allocation(p1.as_ptr()));

    // The freed slot is the next thing handed out for its class.
    manager.free(p1.as_ptr());
    let p3 = manager.allocate(16, 8).unwrap();
    assert_eq!(p1, p3);

    manager.free(p2.as_ptr());
    manager.free(p3.as_ptr());
    assert_eq!(manager.memory_usage().allocated, 0);
}

#[test]
fn zero_size_allocations_return_none() {
    let manager = new_manager();
    let before = manager.memory_usage();
    assert!(manager.allocate(0, 8).is_none());
    assert!(manager.allocate(0, 0).is_none());
    assert!(!manager.can_allocate(0, 8));
    assert_eq!(manager.memory_usage(), before);
}

#[test]
fn non_power_of_two_alignments_are_rejected() {
    let manager = new_manager();
    assert!(manager.allocate(100, 3).is_none());
    assert!(manager.allocate(100, 48).is_none());
    assert!(!manager.can_allocate(100, 3));
}

#[test]
fn zero_alignment_means_natural() {
    let manager = new_manager();
    let p = manager.allocate(100, 0).unwrap();
    assert_eq!(p.as_ptr() as usize % mem_config::DEFAULT_ALIGNMENT, 0);
    manager.free(p.as_ptr());
}

#[test]
fn requests_route_by_size_class() {
    let manager = new_manager();

    // Slab range.
    let small = manager.allocate(1024, 8).unwrap();
    assert_eq!(manager.size_of(small.as_ptr()), 1024);

    // TLSF range.
    let medium = manager.allocate(100 * 1024, 8).unwrap();
    assert!(manager.size_of(medium.as_ptr()) >= 100 * 1024);

    // Past the TLSF maximum: the system heap takes it.
    let large = manager.allocate(64 * 1024 * 1024, 8).unwrap();
    assert!(manager.owns_allocation(large.as_ptr()));
    assert_eq!(manager.size_of(large.as_ptr()), 64 * 1024 * 1024);

    let expected = 1024 + manager.size_of(medium.as_ptr()) + 64 * 1024 * 1024;
    assert_eq!(manager.memory_usage().allocated, expected);

    manager.free(small.as_ptr());
    manager.free(medium.as_ptr());
    manager.free(large.as_ptr());
    assert_eq!(manager.memory_usage().allocated, 0);
}

#[test]
fn huge_alignments_fall_through_to_the_heap() {
    let manager = new_manager();
    // 16 MiB alignment exceeds what either back-end accepts.
    let p = manager.allocate(1024, 16 * 1024 * 1024).unwrap();
    assert_eq!(p.as_ptr() as usize % (16 * 1024 * 1024), 0);
    assert!(manager.owns_allocation(p.as_ptr()));
    manager.free(p.as_ptr());
    assert_eq!(manager.memory_usage().allocated, 0);
}

#[test]
fn foreign_pointers_are_not_owned_and_freeing_them_is_inert() {
    let manager = new_manager();
    let mut foreign = 0u64;
    let foreign = &mut foreign as *mut u64 as *mut u8;
    assert!(!manager.owns_allocation(foreign));
    let before = manager.memory_usage();
    manager.free(foreign);
    assert_eq!(manager.memory_usage(), before);
    assert_eq!(manager.size_of(foreign), 0);
}

#[test]
fn reallocate_moves_across_back_ends() {
    let manager = new_manager();
    let p = manager.allocate(16 * 1024, 8).unwrap();
    unsafe {
        for offset in 0..(16 * 1024) {
            *p.as_ptr().add(offset) = (offset % 247) as u8;
        }
    }

    // Slab block grows into a TLSF block; the prefix survives.
    let q = manager.reallocate(p.as_ptr(), 100 * 1024, 8).unwrap();
    unsafe {
        for offset in (0..(16 * 1024)).step_by(241) {
            assert_eq!(*q.as_ptr().add(offset), (offset % 247) as u8);
        }
    }

    // Shrinks inside the keep-window return the same pointer.
    let current = manager.size_of(q.as_ptr());
    let r = manager.reallocate(q.as_ptr(), current - 7, 8).unwrap();
    assert_eq!(q, r);

    // Zero size frees.
    assert!(manager.reallocate(r.as_ptr(), 0, 8).is_none());
    assert_eq!(manager.memory_usage().allocated, 0);

    // Null pointer allocates.
    let s = manager.reallocate(core::ptr::null_mut(), 256, 8).unwrap();
    assert_eq!(manager.size_of(s.as_ptr()), 256);
    manager.free(s.as_ptr());
}

#[test]
fn compact_reclaims_idle_backing_from_both_back_ends() {
    let manager = new_manager();
    let small = manager.allocate(512, 8).unwrap();
    let medium = manager.allocate(1024 * 1024, 4096).unwrap();
    assert_eq!(medium.as_ptr() as usize % 4096, 0);
    manager.free(small.as_ptr());
    manager.free(medium.as_ptr());

    let released = manager.compact();
    assert!(released >= 1024 * 1024, "compact released only {} bytes", released);
    assert_eq!(manager.memory_usage().committed, 0);
    manager.check_integrity();
}

#[test]
fn usage_equals_the_sum_of_live_sizes() {
    let manager = new_manager();
    let sizes = [16usize, 700, 9000, 64 * 1024, 3 * 1024 * 1024];
    let blocks: std::vec::Vec<_> = sizes.iter().map(|&s| manager.allocate(s, 8).unwrap()).collect();
    let expected: usize = blocks.iter().map(|p| manager.size_of(p.as_ptr())).sum();
    assert_eq!(manager.memory_usage().allocated, expected);
    for p in blocks {
        manager.free(p.as_ptr());
    }
    assert_eq!(manager.memory_usage().allocated, 0);
    manager.check_integrity();
}

#[test]
fn arena_frees_its_block_on_last_drop() {
    let manager = leaked_manager();
    let arena = manager.allocate_arena(1024, 0).unwrap();
    assert_eq!(arena.reference_count(), 1);
    assert_eq!(arena.size_in_bytes(), 1024);
    assert_eq!(manager.size_of(arena.base_address()), 1024);
    assert!(arena.owns_address(arena.base_address()));
    assert!(!arena.owns_address(arena.end_address()));

    let clone = arena.clone();
    assert_eq!(arena.reference_count(), 2);
    drop(arena);
    assert_eq!(clone.reference_count(), 1);
    assert!(manager.memory_usage().allocated > 0);

    drop(clone);
    assert_eq!(manager.memory_usage().allocated, 0);
}

#[test]
fn arena_is_shareable_across_threads() {
    let manager = leaked_manager();
    let arena = manager.allocate_arena(4096, 64).unwrap();
    let clones: std::vec::Vec<_> = (0..4).map(|_| arena.clone()).collect();
    let handles: std::vec::Vec<_> = clones
        .into_iter()
        .map(|clone| {
            std::thread::spawn(move || {
                assert!(clone.owns_address(clone.base_address()));
                drop(clone);
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(arena.reference_count(), 1);
    drop(arena);
    assert_eq!(manager.memory_usage().allocated, 0);
}
