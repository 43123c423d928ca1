//! Cotest: coroutine-style expectation testing.
//!
//! Cotest lets a test drive mock-based code as a **linear coroutine**: the
//! test body launches the code-under-test, waits for *events* (mock calls
//! the CUT issues, or completions of launched invocations), and answers each
//! event with a return value or an argument check. Matching stays
//! declarative (watch patterns and expectations on a priority-ordered
//! handler chain); *what to return, and in what order events must occur*, is
//! ordinary imperative code in the test coroutine.
//!
//! # Core Guarantees
//!
//! - **Single active coroutine**: even though coroutines run on threads,
//!   exactly one executes at a time; switches are explicit and memory
//!   ordering across them is acquire/release.
//! - **Deterministic dispatch**: a mock call walks the handler chain
//!   last-declared-first; declining a call resumes the walk strictly below
//!   the declining watch.
//! - **Homing**: a launch completion is only ever observable to the
//!   coroutine that issued the launch.
//! - **Accounted cardinality**: per-coroutine satisfied/retired flags plus
//!   host-expectation counts; unmatched calls, oversaturation, unsatisfied
//!   coroutines, uncollected launches, and deadlocks are all reported at the
//!   natural join point.
//!
//! # Module Structure
//!
//! - [`api`]: `run_cotest` and the per-coroutine [`CoroCx`] surface
//! - [`mock`]: the in-tree mock layer (objects, methods, patterns,
//!   expectations)
//! - [`handles`]: launch/result/call/signature/event handles
//! - [`kernel`]: dispatch, scheduling, and verification
//! - [`coro`], [`bus`], [`registry`], [`call`]: records the kernel schedules
//! - [`substrate`]: pass-the-baton thread contexts
//! - [`config`], [`error`], [`tracing_compat`], [`test_utils`]: ambient
//!   concerns

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]

pub mod api;
pub mod bus;
pub mod call;
pub mod config;
pub mod coro;
pub mod error;
pub mod handles;
pub mod kernel;
pub mod mock;
pub mod registry;
pub mod substrate;
pub mod test_utils;
pub mod tracing_compat;
pub mod types;
pub mod util;

pub use api::{run_cotest, run_cotest_with, CoroCx, CoroutineHandle};
pub use config::{ConfigError, KernelConfig};
pub use error::{Error, ErrorKind, Result, ResultExt};
pub use handles::{EventHandle, LaunchHandle, MockCallHandle, ResultHandle, SignatureHandle};
pub use mock::{CallPattern, CallView, ExpectationBuilder, Mock, MockMethod};
pub use types::{CallId, CoroId, LaunchId, MethodId, MockId};
