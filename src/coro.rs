//! Coroutine records: lifecycle state machine and cardinality flags.
//!
//! A coroutine is either a *test coroutine* (user-written body that consumes
//! events) or a *launch coroutine* (one invocation of the CUT). Records never
//! leave the kernel arena during a test; handles refer to them by id.

use crate::bus::EventFilter;
use crate::substrate::ContextId;
use crate::types::{CallId, CoroId, LaunchId};
use core::fmt;

/// What kind of body a coroutine runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoroRole {
    /// A user-written test coroutine.
    Test,
    /// A coroutine running one launched CUT invocation.
    Launch,
}

/// Lifecycle state.
///
/// `Ready` exists only between record creation and the coroutine's initial
/// run; `Exited` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoroState {
    /// Created, not yet run.
    Ready,
    /// Currently holding the baton.
    Running,
    /// Suspended on a wait predicate.
    Blocked,
    /// Body returned, exited early, or unwound. Terminal.
    Exited,
}

/// What a blocked coroutine is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitPredicate {
    /// An event matching the filter, targeted at this coroutine.
    Event(EventFilter),
    /// The named child coroutine to block or exit (launch / coroutine
    /// creation runs the child first).
    ChildParked(CoroId),
    /// The return slot of the named call to be filled.
    CallReturned(CallId),
}

impl fmt::Display for WaitPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Event(EventFilter::Any) => write!(f, "waiting for any event"),
            Self::Event(EventFilter::CallsOnly) => write!(f, "waiting for a mock call"),
            Self::Event(EventFilter::ResultsOnly { from: None }) => {
                write!(f, "waiting for a launch result")
            }
            Self::Event(EventFilter::ResultsOnly { from: Some(l) }) => {
                write!(f, "waiting for the result of {l}")
            }
            Self::ChildParked(child) => write!(f, "waiting for {child} to block or exit"),
            Self::CallReturned(call) => write!(f, "waiting for {call} to be returned"),
        }
    }
}

/// One coroutine.
#[derive(Debug)]
pub struct CoroRecord {
    /// Stable id.
    pub id: CoroId,
    /// Display name used in diagnostics.
    pub name: String,
    /// Test or launch.
    pub role: CoroRole,
    /// Execution context the coroutine runs on.
    pub ctx: ContextId,
    /// Lifecycle state.
    pub state: CoroState,
    /// Present exactly while `state == Blocked`.
    pub waiting: Option<WaitPredicate>,
    /// Creator, for launch coroutines and secondary test coroutines.
    pub parent: Option<CoroId>,
    /// The session a launch coroutine runs; `None` for test coroutines.
    pub launch: Option<LaunchId>,
    /// Cardinality: the test fails if a coroutine ends unsatisfied.
    pub satisfied: bool,
    /// Cardinality: a retired coroutine is invisible to dispatch.
    pub retired: bool,
    /// Oversaturation is reported at most once per coroutine.
    pub oversaturation_reported: bool,
    /// Call taken via `next_event` and not yet accepted, declined, or
    /// returned. While set, the server-style rule forbids further waits and
    /// launches.
    pub undisposed: Option<CallId>,
}

impl CoroRecord {
    /// Creates a record in the `Ready` state.
    #[must_use]
    pub fn new(
        id: CoroId,
        name: String,
        role: CoroRole,
        ctx: ContextId,
        parent: Option<CoroId>,
        launch: Option<LaunchId>,
    ) -> Self {
        Self {
            id,
            name,
            role,
            ctx,
            state: CoroState::Ready,
            waiting: None,
            parent,
            launch,
            satisfied: false,
            retired: false,
            oversaturation_reported: false,
            undisposed: None,
        }
    }

    /// Marks the coroutine running; clears any wait predicate.
    pub fn mark_running(&mut self) {
        debug_assert_ne!(self.state, CoroState::Exited, "exited coroutine resumed");
        self.state = CoroState::Running;
        self.waiting = None;
    }

    /// Marks the coroutine blocked on `pred`.
    pub fn mark_blocked(&mut self, pred: WaitPredicate) {
        debug_assert_eq!(self.state, CoroState::Running, "only the running coroutine blocks");
        self.state = CoroState::Blocked;
        self.waiting = Some(pred);
    }

    /// Marks the coroutine exited. Terminal.
    pub fn mark_exited(&mut self) {
        self.state = CoroState::Exited;
        self.waiting = None;
    }

    /// True if dispatch may still offer calls to this coroutine's watches.
    ///
    /// Exited-but-not-retired coroutines remain "eligible" so that a late
    /// matching call can be flagged as oversaturation.
    #[must_use]
    pub const fn visible_to_dispatch(&self) -> bool {
        !self.retired
    }
}
