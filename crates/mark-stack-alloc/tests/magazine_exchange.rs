//! Integration tests for magazine exchange between marking threads.
//!
//! Threads take magazines, move stacks between them and hand them back.
//! Afterwards every magazine and every stack must be accounted for exactly
//! once.

use std::collections::HashSet;
use std::sync::Barrier;
use std::thread;

use mark_stack_alloc::{MarkStackAllocator, MarkStackConfig};

const K: usize = 1024;

fn config() -> MarkStackConfig {
    MarkStackConfig::default()
        .with_stack_size(4 * K)
        .with_magazine_size(64 * K)
        .with_expand_size(256 * K)
        .with_space_limit(4 * 1024 * K)
}

#[test]
fn test_concurrent_exchange_conserves_magazines_and_stacks() {
    const THREADS: usize = 8;
    const ROUNDS: usize = 500;

    let allocator = MarkStackAllocator::new(config());
    let capacity = allocator.config().magazine_capacity();
    let barrier = Barrier::new(THREADS);

    thread::scope(|s| {
        for _ in 0..THREADS {
            s.spawn(|| {
                barrier.wait();
                for round in 0..ROUNDS {
                    let mut from = allocator.alloc_magazine().unwrap();
                    let mut to = allocator.alloc_magazine().unwrap();

                    // Shuffle stacks across the pair like a marking thread
                    // trading an empty magazine for a full one.
                    for _ in 0..(round % capacity) {
                        match from.pop() {
                            Some(stack) => {
                                if let Err(stack) = to.push(stack) {
                                    from.push(stack).unwrap();
                                    break;
                                }
                            }
                            None => break,
                        }
                    }

                    allocator.free_magazine(from);
                    allocator.free_magazine(to);
                }
            });
        }
    });

    let metrics = allocator.metrics();
    assert_eq!(metrics.pool_hits + metrics.pool_misses, THREADS * ROUNDS * 2);
    assert_eq!(metrics.magazines_freed, THREADS * ROUNDS * 2);
    assert!(metrics.magazines_created <= 4 + THREADS * 2);

    let mut magazines = HashSet::new();
    let mut stacks = HashSet::new();
    let mut drained = Vec::new();
    for _ in 0..allocator.pooled_magazines() {
        let mut magazine = allocator.alloc_magazine().unwrap();
        assert!(magazines.insert(magazine.addr()), "magazine pooled twice");
        while let Some(stack) = magazine.pop() {
            assert!(stacks.insert(stack.addr()), "stack held twice");
        }
        drained.push(magazine);
    }

    assert_eq!(allocator.metrics().pool_misses, metrics.pool_misses);
    assert_eq!(magazines.len(), metrics.magazines_created);
    assert_eq!(stacks.len(), metrics.magazines_created * capacity);
    assert!(stacks.is_disjoint(&magazines));
}

#[test]
fn test_magazines_move_between_threads() {
    let allocator = MarkStackAllocator::new(config());

    let magazine = allocator.alloc_magazine().unwrap();
    let addr = magazine.addr();

    let returned = thread::scope(|s| {
        s.spawn(move || {
            let mut magazine = magazine;
            let stack = magazine.pop().unwrap();
            magazine.push(stack).unwrap();
            magazine
        })
        .join()
        .unwrap()
    });

    assert_eq!(returned.addr(), addr);
    allocator.free_magazine(returned);
}
