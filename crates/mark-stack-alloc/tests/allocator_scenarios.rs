//! Integration tests for `MarkStackAllocator`.
//!
//! Covers priming, magazine packing, exhaustion of the configured limit and
//! concurrent pool misses racing for the last increment.

use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Barrier;
use std::thread;

use mark_stack_alloc::{MarkStackAllocator, MarkStackConfig};

const K: usize = 1024;

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    payload
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| payload.downcast_ref::<&str>().copied())
        .unwrap_or_default()
}

/// 16 KiB stacks, one 256 KiB magazine per expansion, room for one expansion.
fn single_chunk_config() -> MarkStackConfig {
    MarkStackConfig::default()
        .with_stack_size(16 * K)
        .with_magazine_size(256 * K)
        .with_expand_size(256 * K)
        .with_space_limit(256 * K)
}

#[test]
fn test_priming_packs_fifteen_stacks() {
    let allocator = MarkStackAllocator::new(single_chunk_config());
    assert!(allocator.is_initialized());
    assert_eq!(allocator.pooled_magazines(), 1);

    let metrics = allocator.metrics();
    assert_eq!(metrics.magazines_created, 1);
    assert_eq!(metrics.expansions, 1);
    assert_eq!(metrics.committed_bytes, 256 * K);

    let mut magazine = allocator.alloc_magazine().unwrap();
    assert_eq!(magazine.capacity(), 15);
    assert_eq!(magazine.len(), 15);
    assert_eq!(magazine.addr(), allocator.space_start());

    // Slot 0 is the magazine itself; stacks occupy slots 1..16.
    let mut stacks = HashSet::new();
    while let Some(stack) = magazine.pop() {
        let offset = stack.addr() - magazine.addr();
        assert_eq!(offset % (16 * K), 0);
        assert!(offset >= 16 * K && offset < 256 * K);
        assert!(stacks.insert(stack.addr()));
    }
    assert_eq!(stacks.len(), 15);
}

#[test]
fn test_second_magazine_exhausts_single_chunk_space() {
    let allocator = MarkStackAllocator::new(single_chunk_config());
    let first = allocator.alloc_magazine().unwrap();
    assert_eq!(allocator.metrics().pool_hits, 1);

    let result = catch_unwind(AssertUnwindSafe(|| {
        allocator.alloc_magazine().map(|magazine| magazine.addr())
    }));
    let payload = result.expect_err("a second chunk does not fit in the limit");
    let message = panic_message(payload.as_ref());
    assert!(message.contains("Mark stack space exhausted"), "{message}");
    assert!(message.contains("Current limit is 0M (262144 bytes)"), "{message}");

    // Exactly one expansion attempt: the one made while priming succeeded,
    // the failing one committed nothing.
    let metrics = allocator.metrics();
    assert_eq!(metrics.pool_misses, 1);
    assert_eq!(metrics.expansions, 1);
    assert_eq!(metrics.committed_bytes, 256 * K);
    assert_eq!(metrics.magazines_created, 1);

    allocator.free_magazine(first);
    assert!(allocator.alloc_magazine().is_some());
}

#[test]
#[should_panic(expected = "Mark stack space exhausted")]
fn test_exhaustion_is_fatal() {
    let allocator = MarkStackAllocator::new(single_chunk_config());
    let _first = allocator.alloc_magazine();
    let _second = allocator.alloc_magazine();
}

#[test]
fn test_limit_allows_exactly_its_expansions() {
    let config = MarkStackConfig::default()
        .with_stack_size(4 * K)
        .with_magazine_size(64 * K)
        .with_expand_size(64 * K)
        .with_space_limit(256 * K);
    let allocator = MarkStackAllocator::new(config);

    let held: Vec<_> = (0..4).map(|_| allocator.alloc_magazine().unwrap()).collect();
    assert_eq!(allocator.metrics().expansions, 4);
    assert_eq!(allocator.metrics().used_bytes, 256 * K);

    let result = catch_unwind(AssertUnwindSafe(|| allocator.alloc_magazine().is_some()));
    assert!(result.is_err());
    assert_eq!(allocator.metrics().expansions, 4);
    drop(held);
}

#[test]
fn test_concurrent_misses_share_one_expansion() {
    // Two magazines per expansion, room for two expansions. Priming uses
    // the first; the second is left for the racing threads.
    let config = MarkStackConfig::default()
        .with_stack_size(4 * K)
        .with_magazine_size(64 * K)
        .with_expand_size(128 * K)
        .with_space_limit(256 * K);
    let allocator = MarkStackAllocator::new(config);

    let primed: Vec<_> = (0..2).map(|_| allocator.alloc_magazine().unwrap()).collect();
    assert_eq!(allocator.pooled_magazines(), 0);
    assert_eq!(allocator.metrics().expansions, 1);

    let barrier = Barrier::new(2);
    let addrs: Vec<usize> = thread::scope(|s| {
        let handles: Vec<_> = (0..2)
            .map(|_| {
                s.spawn(|| {
                    barrier.wait();
                    let magazine = allocator.alloc_magazine().unwrap();
                    assert_eq!(magazine.len(), 15);
                    magazine.addr()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_ne!(addrs[0], addrs[1]);
    for addr in &addrs {
        assert!(allocator.space().contains(*addr));
        assert!(primed.iter().all(|m| m.addr() != *addr));
    }

    let metrics = allocator.metrics();
    assert_eq!(metrics.expansions, 2);
    assert_eq!(metrics.committed_bytes, 256 * K);
    assert_eq!(metrics.pool_misses, 2);
}

#[test]
fn test_pool_hits_never_touch_the_space() {
    let config = MarkStackConfig::default()
        .with_stack_size(4 * K)
        .with_magazine_size(64 * K)
        .with_expand_size(256 * K)
        .with_space_limit(256 * K);
    let allocator = MarkStackAllocator::new(config);
    let used = allocator.metrics().used_bytes;

    for _ in 0..1_000 {
        let magazine = allocator.alloc_magazine().unwrap();
        allocator.free_magazine(magazine);
    }

    let metrics = allocator.metrics();
    assert_eq!(metrics.used_bytes, used);
    assert_eq!(metrics.expansions, 1);
    assert_eq!(metrics.pool_hits, 1_000);
    assert_eq!(metrics.pool_misses, 0);
}

#[test]
fn test_magazine_cannot_be_freed_into_another_allocator() {
    let config = MarkStackConfig::default()
        .with_stack_size(4 * K)
        .with_magazine_size(64 * K)
        .with_expand_size(64 * K)
        .with_space_limit(256 * K);
    let keeper = MarkStackAllocator::new(config);
    let stranger = MarkStackAllocator::new(config);

    let foreign = stranger.alloc_magazine().unwrap();
    let foreign_addr = foreign.addr();
    let result = catch_unwind(AssertUnwindSafe(|| keeper.free_magazine(foreign)));
    let payload = result.expect_err("a foreign magazine must be rejected");
    assert!(
        panic_message(payload.as_ref()).contains("Magazine does not belong to this allocator")
    );
    drop(stranger);

    // The keeper's pool never saw the foreign magazine.
    let mut magazine = keeper.alloc_magazine().unwrap();
    assert_ne!(magazine.addr(), foreign_addr);
    assert!(keeper.space().contains(magazine.addr()));
    let stack = magazine.pop().unwrap();
    assert!(keeper.space().contains(stack.addr()));
}

#[test]
#[cfg(target_pointer_width = "64")]
fn test_unreservable_space_leaves_allocator_uninitialized() {
    // 1 GiB stacks in a 2^61 byte space: a valid configuration no OS can reserve.
    let config = MarkStackConfig::default()
        .with_stack_size(1 << 30)
        .with_magazine_size(1 << 31)
        .with_expand_size(1 << 31)
        .with_space_limit(1 << 61);
    assert_eq!(config.validate(), Ok(()));

    let allocator = MarkStackAllocator::new(config);
    assert!(!allocator.is_initialized());
    assert_eq!(allocator.space_start(), 0);
    assert_eq!(allocator.pooled_magazines(), 0);
    assert!(allocator.alloc_magazine().is_none());
    assert_eq!(allocator.metrics().magazines_created, 0);
}
