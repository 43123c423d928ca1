//! Event bus: pending mock calls and launch completions.
//!
//! Events sit here between the moment they occur and the moment a coroutine
//! pulls them with `next_event`. The bus keeps two collections, an inbox of
//! offered calls and a queue of uncollected completions, with a shared
//! sequence counter so a filter spanning both kinds still observes events in
//! occurrence order.

use crate::types::{CallId, CoroId, LaunchId};
use std::collections::VecDeque;

/// An event a coroutine can wait for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// A mock call offered to the target coroutine.
    Call(CallId),
    /// A launch session owned by the target coroutine completed.
    LaunchDone(LaunchId),
}

/// Filter applied both to the blocking predicate and the take itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventFilter {
    /// Any event targeted at the coroutine.
    Any,
    /// Mock calls only.
    CallsOnly,
    /// Launch completions only, optionally from one specific launch.
    ///
    /// Completions of other launches stay queued; they are never observable
    /// to a coroutine that does not own them, and an owner waiting on a
    /// specific launch skips past the rest.
    ResultsOnly {
        /// Restrict to this launch when set.
        from: Option<LaunchId>,
    },
}

#[derive(Debug)]
struct PendingCall {
    seq: u64,
    call: CallId,
    target: CoroId,
}

#[derive(Debug)]
struct PendingCompletion {
    seq: u64,
    launch: LaunchId,
    home: CoroId,
}

/// The per-kernel event bus.
#[derive(Debug, Default)]
pub struct EventBus {
    inbox: VecDeque<PendingCall>,
    completions: VecDeque<PendingCompletion>,
    next_seq: u64,
}

impl EventBus {
    /// Creates an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a mock call offered to `target`.
    pub fn offer_call(&mut self, call: CallId, target: CoroId) {
        let seq = self.bump();
        self.inbox.push_back(PendingCall { seq, call, target });
    }

    /// Queues a completion homed at `home`.
    pub fn offer_completion(&mut self, launch: LaunchId, home: CoroId) {
        let seq = self.bump();
        self.completions.push_back(PendingCompletion { seq, launch, home });
    }

    /// Removes and returns the first event for `coro` matching `filter`.
    pub fn take(&mut self, coro: CoroId, filter: EventFilter) -> Option<Event> {
        match self.first_match(coro, filter)? {
            Event::Call(_) => {
                let pos = self
                    .inbox
                    .iter()
                    .position(|p| p.target == coro)
                    .expect("matched call vanished");
                let pending = self.inbox.remove(pos).expect("position in range");
                Some(Event::Call(pending.call))
            }
            Event::LaunchDone(launch) => {
                let pos = self
                    .completions
                    .iter()
                    .position(|p| p.home == coro && p.launch == launch)
                    .expect("matched completion vanished");
                let pending = self.completions.remove(pos).expect("position in range");
                Some(Event::LaunchDone(pending.launch))
            }
        }
    }

    /// Non-destructive form of [`take`](Self::take).
    #[must_use]
    pub fn peek(&self, coro: CoroId, filter: EventFilter) -> Option<Event> {
        self.first_match(coro, filter)
    }

    /// Number of queued events of both kinds.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inbox.len() + self.completions.len()
    }

    /// True when nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inbox.is_empty() && self.completions.is_empty()
    }

    fn bump(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn first_match(&self, coro: CoroId, filter: EventFilter) -> Option<Event> {
        let want_calls = matches!(filter, EventFilter::Any | EventFilter::CallsOnly);
        let want_results = !matches!(filter, EventFilter::CallsOnly);
        let from = match filter {
            EventFilter::ResultsOnly { from } => from,
            _ => None,
        };

        let call = if want_calls {
            self.inbox.iter().find(|p| p.target == coro)
        } else {
            None
        };
        let done = if want_results {
            self.completions
                .iter()
                .find(|p| p.home == coro && from.map_or(true, |l| p.launch == l))
        } else {
            None
        };

        match (call, done) {
            (Some(c), Some(d)) if c.seq < d.seq => Some(Event::Call(c.call)),
            (Some(_), Some(d)) => Some(Event::LaunchDone(d.launch)),
            (Some(c), None) => Some(Event::Call(c.call)),
            (None, Some(d)) => Some(Event::LaunchDone(d.launch)),
            (None, None) => None,
        }
    }
}
