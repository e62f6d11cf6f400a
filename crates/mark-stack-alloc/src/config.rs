//! Sizing configuration for the mark stack allocator.

use thiserror::Error;

use crate::magazine::Magazine;

/// One mebibyte, used for human readable limits in diagnostics.
pub const M: usize = 1024 * 1024;

/// Default size of a single mark stack (2 KiB).
pub const DEFAULT_STACK_SIZE: usize = 1 << 11;

/// Default size of the chunk carved into one magazine (32 KiB).
pub const DEFAULT_MAGAZINE_SIZE: usize = 1 << 15;

/// Default amount of memory committed per expansion (32 MiB).
pub const DEFAULT_EXPAND_SIZE: usize = 1 << 25;

/// Default upper bound on reserved mark stack address space (8 GiB).
#[cfg(target_pointer_width = "64")]
pub const DEFAULT_SPACE_LIMIT: usize = 8 * 1024 * M;

/// Default upper bound on reserved mark stack address space (512 MiB).
#[cfg(not(target_pointer_width = "64"))]
pub const DEFAULT_SPACE_LIMIT: usize = 512 * M;

/// Configuration of the mark stack space.
///
/// All sizes are in bytes and are fixed for the lifetime of an allocator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MarkStackConfig {
    /// Size of one mark stack block.
    pub stack_size: usize,
    /// Size of the chunk turned into one magazine. Slot 0 holds the
    /// magazine header, the remaining slots are stacks.
    pub magazine_size: usize,
    /// Bytes committed each time the space grows.
    pub expand_size: usize,
    /// Maximum bytes of address space reserved for mark stacks.
    pub space_limit: usize,
}

impl Default for MarkStackConfig {
    fn default() -> Self {
        Self {
            stack_size: DEFAULT_STACK_SIZE,
            magazine_size: DEFAULT_MAGAZINE_SIZE,
            expand_size: DEFAULT_EXPAND_SIZE,
            space_limit: DEFAULT_SPACE_LIMIT,
        }
    }
}

impl MarkStackConfig {
    /// Set the size of one mark stack.
    #[must_use]
    pub const fn with_stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = stack_size;
        self
    }

    /// Set the size of the chunk backing one magazine.
    #[must_use]
    pub const fn with_magazine_size(mut self, magazine_size: usize) -> Self {
        self.magazine_size = magazine_size;
        self
    }

    /// Set the expansion increment.
    #[must_use]
    pub const fn with_expand_size(mut self, expand_size: usize) -> Self {
        self.expand_size = expand_size;
        self
    }

    /// Set the maximum reserved address space.
    #[must_use]
    pub const fn with_space_limit(mut self, space_limit: usize) -> Self {
        self.space_limit = space_limit;
        self
    }

    /// Number of stacks one magazine holds: every slot of its chunk except
    /// the one occupied by the magazine header.
    #[must_use]
    pub const fn magazine_capacity(&self) -> usize {
        self.magazine_size / self.stack_size - 1
    }

    /// Number of magazines carved out of one expansion increment.
    #[must_use]
    pub const fn magazines_per_expansion(&self) -> usize {
        self.expand_size / self.magazine_size
    }

    /// Check every sizing constraint the allocator relies on.
    ///
    /// # Errors
    ///
    /// Returns the first violated constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let Self {
            stack_size,
            magazine_size,
            expand_size,
            space_limit,
        } = *self;

        if stack_size == 0 || !stack_size.is_power_of_two() {
            return Err(ConfigError::StackSizeNotPowerOfTwo { stack_size });
        }
        if magazine_size == 0 || magazine_size % stack_size != 0 {
            return Err(ConfigError::MagazineSizeMisaligned {
                magazine_size,
                stack_size,
            });
        }
        if expand_size == 0 || expand_size % magazine_size != 0 {
            return Err(ConfigError::ExpandSizeMisaligned {
                expand_size,
                magazine_size,
            });
        }
        let page_size = sys_alloc::page_size();
        if expand_size % page_size != 0 {
            return Err(ConfigError::ExpandSizeNotPageAligned {
                expand_size,
                page_size,
            });
        }
        if space_limit < expand_size {
            return Err(ConfigError::SpaceLimitTooSmall {
                space_limit,
                expand_size,
            });
        }

        let header_size = Magazine::footprint(self.magazine_capacity());
        if header_size > stack_size {
            return Err(ConfigError::MagazineHeaderTooLarge {
                header_size,
                stack_size,
            });
        }

        let slots = space_limit / stack_size;
        if u32::try_from(slots).is_err() {
            return Err(ConfigError::TooManySlots { slots });
        }

        Ok(())
    }
}

/// A sizing constraint violated by a [`MarkStackConfig`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Stacks must be a non-zero power of two so every slot stays aligned.
    #[error("mark stack size {stack_size} is not a power of two")]
    StackSizeNotPowerOfTwo {
        /// Configured stack size.
        stack_size: usize,
    },
    /// Magazine chunks are split into whole stacks.
    #[error("magazine size {magazine_size} is not a multiple of the mark stack size {stack_size}")]
    MagazineSizeMisaligned {
        /// Configured magazine size.
        magazine_size: usize,
        /// Configured stack size.
        stack_size: usize,
    },
    /// Expansions are split into whole magazines.
    #[error("expand size {expand_size} is not a multiple of the magazine size {magazine_size}")]
    ExpandSizeMisaligned {
        /// Configured expansion increment.
        expand_size: usize,
        /// Configured magazine size.
        magazine_size: usize,
    },
    /// Expansions are committed in whole pages.
    #[error("expand size {expand_size} is not a multiple of the page size {page_size}")]
    ExpandSizeNotPageAligned {
        /// Configured expansion increment.
        expand_size: usize,
        /// OS page size.
        page_size: usize,
    },
    /// The space must fit at least one expansion.
    #[error("mark stack space limit {space_limit} is smaller than the expand size {expand_size}")]
    SpaceLimitTooSmall {
        /// Configured space limit.
        space_limit: usize,
        /// Configured expansion increment.
        expand_size: usize,
    },
    /// The magazine header and its entries must fit in slot 0.
    #[error("magazine header ({header_size} bytes) does not fit in a mark stack ({stack_size} bytes)")]
    MagazineHeaderTooLarge {
        /// Bytes needed by the header and its entries.
        header_size: usize,
        /// Configured stack size.
        stack_size: usize,
    },
    /// Pool links address stacks with a 32-bit slot index.
    #[error("mark stack space holds {slots} stacks, more than a 32-bit slot index can address")]
    TooManySlots {
        /// Number of stack slots in the space limit.
        slots: usize,
    },
}
