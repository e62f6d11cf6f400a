//! Magazine allocator for garbage collector mark stacks.
//!
//! `mark-stack-alloc` supplies fixed-size mark stacks to parallel marking
//! threads. Stacks are handed out in batches called **magazines** so that a
//! marking thread synchronizes once per batch instead of once per stack.
//!
//! # Layout
//!
//! - [`AddressSpaceArena`] reserves the whole mark stack space up front and
//!   commits it in fixed increments. Chunks are claimed with a lock-free bump
//!   of `top`; only growing the committed region takes a lock.
//! - [`MagazineFactory`] turns one chunk into a [`Magazine`]: the header takes
//!   the first stack slot, every other slot becomes a [`MarkStack`].
//! - Returned magazines are recycled through a lock-free LIFO pool.
//! - [`MarkStackAllocator`] ties them together and primes the pool with one
//!   expansion worth of magazines at construction.
//!
//! # Failure
//!
//! A failed address space reservation leaves the allocator uninitialized
//! (see [`MarkStackAllocator::is_initialized`]). Running out of space or
//! failing to commit memory while marking is fatal: the allocator panics
//! with a message naming the limit to raise.
//!
//! # Quick Start
//!
//! ```
//! use mark_stack_alloc::{MarkStackAllocator, MarkStackConfig};
//!
//! let allocator = MarkStackAllocator::new(
//!     MarkStackConfig::default().with_space_limit(64 * 1024 * 1024),
//! );
//! assert!(allocator.is_initialized());
//!
//! let mut magazine = allocator.alloc_magazine().expect("space reserved");
//! let stack = magazine.pop().expect("fresh magazines are full");
//! // ... push mark entries into the memory at `stack.as_ptr()` ...
//! magazine.push(stack).expect("room for the stack we took");
//! allocator.free_magazine(magazine);
//! ```

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod allocator;
mod config;
mod magazine;
mod metrics;
mod pool;
mod space;
mod tracing;

pub use allocator::MarkStackAllocator;
pub use config::{
    ConfigError, MarkStackConfig, DEFAULT_EXPAND_SIZE, DEFAULT_MAGAZINE_SIZE, DEFAULT_SPACE_LIMIT,
    DEFAULT_STACK_SIZE,
};
pub use magazine::{Magazine, MagazineFactory, MarkStack};
pub use metrics::{AllocatorStats, MarkStackMetrics};
pub use space::{AddressSpaceArena, SpaceError};
