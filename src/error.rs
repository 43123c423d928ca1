//! Error types and failure taxonomy.
//!
//! Two classes of failure flow through the kernel:
//!
//! - **Programming errors**: misuse of the API (server-rule violation,
//!   collecting another coroutine's result, a typed return with the wrong
//!   type). These panic immediately at the offending call site; when the
//!   offender is a secondary coroutine the kernel stops the test and
//!   re-raises that exact payload from the end-of-test join point, so the
//!   failure never degrades into the aggregated report.
//! - **Expectation failures**: cardinality and matching problems (unmatched
//!   call, oversaturated or unsatisfied coroutine, uncollected launch,
//!   deadlock). These are recorded in the kernel's failure sink so the test
//!   can wind down, and are reported together when the test finishes.
//!
//! Both classes share the same structured [`Error`] type.

use core::fmt;
use std::sync::Arc;

/// The kind of failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    // === Dispatch ===
    /// A mock call walked the whole handler chain without being consumed.
    UnmatchedCall,
    /// A call matched a watch of a coroutine that had already exited
    /// without retiring.
    Oversaturation,

    // === Cardinality ===
    /// A coroutine never became satisfied before the test ended.
    UnsatisfiedCoroutine,
    /// A host expectation's minimum call count was not reached.
    UnsatisfiedExpectation,
    /// A launch session completed but was never collected.
    UncollectedLaunch,

    // === Scheduling ===
    /// No coroutine was runnable while at least one was still waiting.
    Deadlock,

    // === API misuse (programming errors) ===
    /// An operation was issued while a call handle was still undisposed.
    ServerRule,
    /// A result was collected by a coroutine that does not own the launch.
    WrongCollector,
    /// A typed return value did not match the method's return type.
    TypeMismatch,
    /// A handle operation was applied to a record in the wrong state.
    InvalidHandle,
    /// A mock method was invoked outside any launched CUT invocation.
    CallOutsideLaunch,

    // === Coroutine bodies ===
    /// A test coroutine body panicked.
    CoroutinePanicked,

    // === Configuration ===
    /// Invalid kernel configuration.
    Config,
}

impl ErrorKind {
    /// True for kinds that indicate API misuse rather than a failed
    /// expectation.
    #[must_use]
    pub const fn is_programming_error(self) -> bool {
        matches!(
            self,
            Self::ServerRule
                | Self::WrongCollector
                | Self::TypeMismatch
                | Self::InvalidHandle
                | Self::CallOutsideLaunch
        )
    }
}

/// Structured error carried through the failure sink and panics.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    context: Option<String>,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Creates an error of the given kind with no context.
    #[must_use]
    pub const fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            context: None,
            source: None,
        }
    }

    /// Returns the kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Attaches context text.
    #[must_use]
    pub fn with_context(mut self, ctx: impl Into<String>) -> Self {
        self.context = Some(ctx.into());
        self
    }

    /// Attaches a source error.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    /// True for API-misuse errors.
    #[must_use]
    pub const fn is_programming_error(&self) -> bool {
        self.kind.is_programming_error()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(ctx) = &self.context {
            write!(f, ": {ctx}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as _)
    }
}

/// Extension trait for attaching context to results.
pub trait ResultExt<T> {
    /// Attach a context string on error.
    fn context(self, ctx: impl Into<String>) -> Result<T>;
    /// Attach context computed lazily on error.
    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T>;
}

impl<T, E: Into<Error>> ResultExt<T> for core::result::Result<T, E> {
    fn context(self, ctx: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.into().with_context(ctx))
    }

    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T> {
        self.map_err(|e| e.into().with_context(f()))
    }
}

/// Specialized result type.
pub type Result<T> = core::result::Result<T, Error>;
