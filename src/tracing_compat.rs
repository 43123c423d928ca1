//! Tracing compatibility layer.
//!
//! With the `tracing-integration` feature the kernel logs dispatch steps,
//! state transitions, and baton passes through the `tracing` crate. Without
//! it, the same macro invocations compile to nothing.

#[cfg(feature = "tracing-integration")]
pub use tracing::{debug, error, info, trace, warn};

#[cfg(not(feature = "tracing-integration"))]
mod noop {
    //! No-op macro bodies when tracing is disabled.

    /// No-op trace-level logging macro.
    #[macro_export]
    macro_rules! trace {
        ($($arg:tt)*) => {};
    }

    /// No-op debug-level logging macro.
    #[macro_export]
    macro_rules! debug {
        ($($arg:tt)*) => {};
    }

    /// No-op info-level logging macro.
    #[macro_export]
    macro_rules! info {
        ($($arg:tt)*) => {};
    }

    /// No-op warn-level logging macro.
    #[macro_export]
    macro_rules! warn_ {
        ($($arg:tt)*) => {};
    }

    /// No-op error-level logging macro.
    #[macro_export]
    macro_rules! error {
        ($($arg:tt)*) => {};
    }
}

#[cfg(not(feature = "tracing-integration"))]
pub use crate::{debug, error, info, trace, warn_ as warn};
