//! Mark stack allocator tracing support.
//!
//! When the `tracing` feature is enabled, this module emits structured
//! events for expansions, priming and fatal conditions. Without the feature
//! every helper compiles to nothing.

#[cfg(feature = "tracing")]
pub mod internal {
    use crate::config::M;

    /// Log a failed address space reservation.
    pub fn log_reserve_failed(size: usize, error: &std::io::Error) {
        tracing::error!(
            size_mib = size / M,
            %error,
            "Failed to reserve address space for mark stacks"
        );
    }

    /// Log a successful address space reservation.
    pub fn log_reserved(start: usize, size: usize) {
        tracing::debug!(
            start = format_args!("{start:#x}"),
            size_mib = size / M,
            "mark_stack_space_reserved"
        );
    }

    /// Log an expansion of the committed region.
    pub fn log_expansion(old_size: usize, new_size: usize) {
        tracing::debug!(
            old_mib = old_size / M,
            new_mib = new_size / M,
            "Expanding mark stack space: {}M->{}M",
            old_size / M,
            new_size / M
        );
    }

    /// Log the result of priming the magazine pool.
    pub fn log_primed(magazines: usize, stacks: usize) {
        tracing::debug!(magazines, stacks, "mark_stack_pool_primed");
    }

    /// Log a pool miss that had to carve a new magazine out of the space.
    pub fn log_pool_miss(addr: usize) {
        tracing::trace!(addr = format_args!("{addr:#x}"), "magazine_from_space");
    }

    /// Log a fatal condition right before the process goes down.
    pub fn log_fatal(message: &str) {
        tracing::error!("{message}");
    }
}

#[cfg(not(feature = "tracing"))]
#[allow(clippy::missing_const_for_fn)]
pub mod internal {
    /// Stub function when tracing is disabled.
    pub fn log_reserve_failed(_size: usize, _error: &std::io::Error) {}

    /// Stub function when tracing is disabled.
    pub fn log_reserved(_start: usize, _size: usize) {}

    /// Stub function when tracing is disabled.
    pub fn log_expansion(_old_size: usize, _new_size: usize) {}

    /// Stub function when tracing is disabled.
    pub fn log_primed(_magazines: usize, _stacks: usize) {}

    /// Stub function when tracing is disabled.
    pub fn log_pool_miss(_addr: usize) {}

    /// Stub function when tracing is disabled.
    pub fn log_fatal(_message: &str) {}
}

/// Report an unrecoverable condition and stop.
///
/// Marking cannot continue without stack space, so these conditions are
/// never returned as errors.
#[cold]
#[inline(never)]
#[track_caller]
pub fn fatal(message: &str) -> ! {
    internal::log_fatal(message);
    panic!("{message}");
}
