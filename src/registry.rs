//! The handler chain: watches and host expectations in priority order.
//!
//! Every test kernel keeps one insertion-ordered chain. Dispatch walks it
//! from the newest entry to the oldest (last-declared-first-served), so a
//! watch or expectation declared later shadows earlier ones for the calls it
//! matches. Entries are never removed during a test; a watch whose owner
//! exits stays in place so oversaturation can be detected, and retirement
//! hides it from the walk without disturbing positions that in-flight calls
//! refer to.

use crate::call::CallRecord;
use crate::error::{Error, ErrorKind};
use crate::mock::CallPattern;
use crate::types::{CoroId, MethodId};
use core::any::Any;
use core::fmt;

/// A coroutine-owned watch.
#[derive(Debug)]
pub struct WatchEntry {
    /// The coroutine calls are steered to.
    pub owner: CoroId,
    /// Exterior filter: what this watch can see.
    pub pattern: CallPattern,
    /// Monotone declaration number within the test.
    pub seq: usize,
}

/// A host-library expectation entry.
///
/// The kernel re-enters the mock layer through the two stored callbacks: a
/// match test and a fire action producing the boxed return value.
pub struct HostEntry {
    /// Method this expectation is attached to.
    pub method: MethodId,
    /// Minimum number of calls for the expectation to be satisfied.
    pub min_calls: u64,
    /// Maximum number of calls; `None` means unbounded.
    pub max_calls: Option<u64>,
    /// Calls consumed so far.
    pub count: u64,
    /// Human-readable description for verification reports.
    pub desc: String,
    matcher: Box<dyn Fn(&CallRecord) -> bool + Send>,
    action: Box<dyn FnMut(&CallRecord) -> Box<dyn Any + Send> + Send>,
}

impl HostEntry {
    /// Creates an expectation entry.
    pub fn new(
        method: MethodId,
        min_calls: u64,
        max_calls: Option<u64>,
        desc: String,
        matcher: Box<dyn Fn(&CallRecord) -> bool + Send>,
        action: Box<dyn FnMut(&CallRecord) -> Box<dyn Any + Send> + Send>,
    ) -> Self {
        Self {
            method,
            min_calls,
            max_calls,
            count: 0,
            desc,
            matcher,
            action,
        }
    }

    /// True once the upper bound is reached; saturated entries stop matching.
    #[must_use]
    pub fn saturated(&self) -> bool {
        self.max_calls.map_or(false, |max| self.count >= max)
    }

    /// Whether this entry consumes `record`.
    #[must_use]
    pub fn matches(&self, record: &CallRecord) -> bool {
        record.sig.method == self.method && !self.saturated() && (self.matcher)(record)
    }

    /// Consumes the call: bumps the count and produces the return value.
    pub fn fire(&mut self, record: &CallRecord) -> Box<dyn Any + Send> {
        self.count += 1;
        (self.action)(record)
    }

    /// End-of-test cardinality check.
    #[must_use]
    pub fn verify(&self) -> Option<Error> {
        if self.count < self.min_calls {
            Some(
                Error::new(ErrorKind::UnsatisfiedExpectation).with_context(format!(
                    "{}: expected at least {} call(s), saw {}",
                    self.desc, self.min_calls, self.count
                )),
            )
        } else {
            None
        }
    }
}

impl fmt::Debug for HostEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostEntry")
            .field("method", &self.method)
            .field("min_calls", &self.min_calls)
            .field("max_calls", &self.max_calls)
            .field("count", &self.count)
            .field("desc", &self.desc)
            .finish_non_exhaustive()
    }
}

/// One chain slot.
#[derive(Debug)]
pub enum ChainEntry {
    /// Coroutine-owned watch.
    Watch(WatchEntry),
    /// Host-library expectation.
    Host(HostEntry),
}

/// The ordered chain itself.
#[derive(Debug, Default)]
pub struct HandlerChain {
    /// Entries in insertion order; dispatch walks back to front.
    pub entries: Vec<ChainEntry>,
    next_watch_seq: usize,
}

impl HandlerChain {
    /// Creates an empty chain.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when the chain has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Appends a watch; newest entries are consulted first.
    pub fn push_watch(&mut self, owner: CoroId, pattern: CallPattern) -> usize {
        let seq = self.next_watch_seq;
        self.next_watch_seq += 1;
        self.entries.push(ChainEntry::Watch(WatchEntry {
            owner,
            pattern,
            seq,
        }));
        seq
    }

    /// Appends a host expectation.
    pub fn push_host(&mut self, entry: HostEntry) {
        self.entries.push(ChainEntry::Host(entry));
    }

    /// Verifies every host entry, yielding one error per unsatisfied
    /// expectation.
    pub fn verify_hosts(&self) -> Vec<Error> {
        self.entries
            .iter()
            .filter_map(|entry| match entry {
                ChainEntry::Host(host) => host.verify(),
                ChainEntry::Watch(_) => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::{ArgBundle, CallState, SignatureDesc};
    use crate::types::{CallId, LaunchId, MockId};
    use core::any::TypeId;

    fn record(method: MethodId) -> CallRecord {
        CallRecord {
            id: CallId::new_for_test(0, 0),
            sig: SignatureDesc {
                mock: MockId::new(0),
                method,
                mock_name: "Turtle",
                method_name: "forward",
                ret_type: TypeId::of::<()>(),
                ret_type_name: "()",
                arity: 1,
            },
            args: Box::new((5_i32,)) as Box<dyn ArgBundle>,
            origin_launch: LaunchId::new_for_test(0, 0),
            origin_coro: CoroId::new_for_test(0, 0),
            state: CallState::Offered,
            ret: None,
            chain_snapshot: 0,
            offered_at: 0,
        }
    }

    fn entry(method: MethodId, min: u64, max: Option<u64>) -> HostEntry {
        HostEntry::new(
            method,
            min,
            max,
            String::from("Turtle::forward"),
            Box::new(|_| true),
            Box::new(|_| Box::new(())),
        )
    }

    #[test]
    fn host_entry_saturates_at_max() {
        let mut host = entry(MethodId::new(0), 0, Some(2));
        let rec = record(MethodId::new(0));
        assert!(host.matches(&rec));
        host.fire(&rec);
        host.fire(&rec);
        assert!(host.saturated());
        assert!(!host.matches(&rec));
    }

    #[test]
    fn host_entry_ignores_other_methods() {
        let host = entry(MethodId::new(0), 0, None);
        assert!(!host.matches(&record(MethodId::new(1))));
    }

    #[test]
    fn verify_flags_unmet_minimum() {
        let host = entry(MethodId::new(0), 2, None);
        let err = host.verify().expect("unsatisfied");
        assert_eq!(err.kind(), ErrorKind::UnsatisfiedExpectation);

        let mut host = entry(MethodId::new(0), 1, None);
        host.fire(&record(MethodId::new(0)));
        assert!(host.verify().is_none());
    }

    #[test]
    fn watch_seq_is_monotone() {
        let mut chain = HandlerChain::new();
        let a = chain.push_watch(CoroId::new_for_test(0, 0), CallPattern::any());
        let b = chain.push_watch(CoroId::new_for_test(1, 0), CallPattern::any());
        assert!(a < b);
        assert_eq!(chain.len(), 2);
    }
}
