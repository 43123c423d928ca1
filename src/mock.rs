//! The in-tree mock layer.
//!
//! The kernel only needs four things from a mock library: a way to insert
//! entries into a priority-ordered handler chain, a per-entry callback during
//! the dispatch walk, consume-or-continue semantics from that callback, and
//! end-of-test cardinality verification. This module provides a deliberately
//! small layer with exactly that surface: [`Mock`] objects expose typed
//! [`MockMethod`]s whose stubs hand calls to the kernel, and
//! [`MockMethod::expect`] registers classic expectations
//! (`times`/`returning`) as host entries on the same chain that coroutine
//! watches live on.
//!
//! [`CallPattern`] is the shared matcher language: watches use it as the
//! exterior filter, waits as the interior filter, and handle checks
//! (`is_call`) reuse it for introspection.

use crate::call::{ArgBundle, ArgSpec, CallRecord, SignatureDesc};
use crate::kernel::Kernel;
use crate::registry::HostEntry;
use crate::types::{MethodId, MockId};
use core::any::{type_name, Any, TypeId};
use core::fmt;
use core::marker::PhantomData;
use std::sync::Arc;

type ArgsPredicate = Arc<dyn Fn(&dyn ArgBundle) -> bool + Send + Sync>;
type WithPredicate = Arc<dyn for<'a> Fn(&CallView<'a>) -> bool + Send + Sync>;

/// Read-only view of a call, handed to `with` predicates.
pub struct CallView<'a> {
    record: &'a CallRecord,
}

impl CallView<'_> {
    /// Mock object display name.
    #[must_use]
    pub fn mock_name(&self) -> &'static str {
        self.record.sig.mock_name
    }

    /// Method display name.
    #[must_use]
    pub fn method_name(&self) -> &'static str {
        self.record.sig.method_name
    }

    /// Number of arguments.
    #[must_use]
    pub fn arity(&self) -> usize {
        self.record.args.arity()
    }

    /// Borrow of the `index`-th argument as `T`, or `None` on index or type
    /// mismatch.
    #[must_use]
    pub fn arg<T: 'static>(&self, index: usize) -> Option<&T> {
        self.record.args.arg(index)?.downcast_ref()
    }
}

/// Matcher for mock calls.
///
/// Used as the exterior filter on watches and the interior filter on waits.
/// An empty pattern matches every call; each added constraint narrows it.
#[derive(Clone, Default)]
pub struct CallPattern {
    mock: Option<MockId>,
    method: Option<MethodId>,
    args: Option<ArgsPredicate>,
    with: Option<WithPredicate>,
}

impl CallPattern {
    /// Matches every mock call.
    #[must_use]
    pub fn any() -> Self {
        Self::default()
    }

    /// Adds a predicate over the whole call.
    #[must_use]
    pub fn with(mut self, pred: impl for<'a> Fn(&CallView<'a>) -> bool + Send + Sync + 'static) -> Self {
        self.with = Some(Arc::new(pred));
        self
    }

    /// Whether this pattern matches `record`.
    #[must_use]
    pub fn matches(&self, record: &CallRecord) -> bool {
        if let Some(mock) = self.mock {
            if record.sig.mock != mock {
                return false;
            }
        }
        if let Some(method) = self.method {
            if record.sig.method != method {
                return false;
            }
        }
        if let Some(args) = &self.args {
            if !args(record.args.as_ref()) {
                return false;
            }
        }
        if let Some(with) = &self.with {
            if !with(&CallView { record }) {
                return false;
            }
        }
        true
    }
}

impl fmt::Debug for CallPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallPattern")
            .field("mock", &self.mock)
            .field("method", &self.method)
            .field("has_args", &self.args.is_some())
            .field("has_with", &self.with.is_some())
            .finish()
    }
}

impl From<&Mock> for CallPattern {
    fn from(mock: &Mock) -> Self {
        Self {
            mock: Some(mock.id),
            ..Self::default()
        }
    }
}

impl<A: ArgSpec, R: Send + 'static> From<&MockMethod<A, R>> for CallPattern {
    fn from(method: &MockMethod<A, R>) -> Self {
        method.pattern()
    }
}

/// A mock object registered with a test kernel.
///
/// A `Mock` is only an identity; behavior lives in the [`MockMethod`]s
/// created from it. Test fixtures typically bundle the methods into a struct
/// and implement the CUT-facing trait by forwarding to the stubs.
pub struct Mock {
    kernel: Arc<Kernel>,
    id: MockId,
    name: &'static str,
}

impl Mock {
    /// Registers a mock object with the calling coroutine's kernel.
    #[must_use]
    pub fn new(cx: &crate::api::CoroCx, name: &'static str) -> Self {
        let kernel = Arc::clone(cx.kernel());
        let id = kernel.register_mock(name);
        Self { kernel, id, name }
    }

    /// Display name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Creates a method with argument tuple `A` and return type `R`.
    #[must_use]
    pub fn method<A: ArgSpec, R: Send + 'static>(
        &self,
        name: &'static str,
    ) -> MockMethod<A, R> {
        let method = self.kernel.register_method(
            self.id,
            self.name,
            name,
            TypeId::of::<R>(),
            type_name::<R>(),
            A::ARITY,
        );
        let sig = self.kernel.method_sig(method);
        MockMethod {
            kernel: Arc::clone(&self.kernel),
            sig,
            _marker: PhantomData,
        }
    }
}

impl fmt::Debug for Mock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mock")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

/// One mock method: the stub the CUT calls, plus matcher and expectation
/// builders.
pub struct MockMethod<A, R> {
    kernel: Arc<Kernel>,
    sig: SignatureDesc,
    _marker: PhantomData<fn(A) -> R>,
}

impl<A: ArgSpec, R: Send + 'static> MockMethod<A, R> {
    /// The stub. The CUT calls this; the calling launch coroutine blocks
    /// until a coroutine or expectation supplies the return value.
    pub fn call(&self, args: A) -> R {
        let value = self.kernel.dispatch_call(self.sig.method, Box::new(args));
        *value
            .downcast::<R>()
            .expect("kernel verified the return type")
    }

    /// Pattern matching any call of this method.
    #[must_use]
    pub fn pattern(&self) -> CallPattern {
        CallPattern {
            mock: Some(self.sig.mock),
            method: Some(self.sig.method),
            ..CallPattern::default()
        }
    }

    /// Pattern matching calls of this method with exactly these arguments.
    #[must_use]
    pub fn with_args(&self, args: A) -> CallPattern
    where
        A: PartialEq + Sync,
    {
        let mut pattern = self.pattern();
        pattern.args = Some(Arc::new(move |bundle: &dyn ArgBundle| {
            bundle.as_any().downcast_ref::<A>() == Some(&args)
        }));
        pattern
    }

    /// Pattern matching calls of this method whose arguments satisfy `pred`.
    #[must_use]
    pub fn where_args(&self, pred: impl Fn(&A) -> bool + Send + Sync + 'static) -> CallPattern {
        let mut pattern = self.pattern();
        pattern.args = Some(Arc::new(move |bundle: &dyn ArgBundle| {
            bundle.as_any().downcast_ref::<A>().map_or(false, &pred)
        }));
        pattern
    }

    /// Starts a classic host-side expectation on this method.
    ///
    /// The expectation joins the same handler chain as coroutine watches, at
    /// its declaration priority; it consumes matching calls without any
    /// coroutine involvement. Defaults to exactly one expected call.
    #[must_use]
    pub fn expect(&self) -> ExpectationBuilder<A, R> {
        ExpectationBuilder {
            kernel: Arc::clone(&self.kernel),
            method: self.sig.method,
            desc: format!("{}::{}", self.sig.mock_name, self.sig.method_name),
            matcher: None,
            min_calls: 1,
            max_calls: Some(1),
            _marker: PhantomData,
        }
    }
}

impl<A, R> fmt::Debug for MockMethod<A, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MockMethod({}::{})", self.sig.mock_name, self.sig.method_name)
    }
}

/// Builder for a host-side expectation; registered by
/// [`returning`](Self::returning).
pub struct ExpectationBuilder<A, R> {
    kernel: Arc<Kernel>,
    method: MethodId,
    desc: String,
    matcher: Option<Box<dyn Fn(&A) -> bool + Send>>,
    min_calls: u64,
    max_calls: Option<u64>,
    _marker: PhantomData<fn(A) -> R>,
}

impl<A: ArgSpec, R: Send + 'static> ExpectationBuilder<A, R> {
    /// Restricts the expectation to exactly these arguments.
    #[must_use]
    pub fn with_args(mut self, args: A) -> Self
    where
        A: PartialEq,
    {
        self.matcher = Some(Box::new(move |candidate: &A| *candidate == args));
        self
    }

    /// Restricts the expectation to arguments satisfying `pred`.
    #[must_use]
    pub fn where_args(mut self, pred: impl Fn(&A) -> bool + Send + 'static) -> Self {
        self.matcher = Some(Box::new(pred));
        self
    }

    /// Expects exactly `n` calls.
    #[must_use]
    pub fn times(mut self, n: u64) -> Self {
        self.min_calls = n;
        self.max_calls = Some(n);
        self
    }

    /// Expects at least `n` calls, with no upper bound.
    #[must_use]
    pub fn at_least(mut self, n: u64) -> Self {
        self.min_calls = n;
        self.max_calls = None;
        self
    }

    /// Allows any number of calls, including none.
    #[must_use]
    pub fn any_times(mut self) -> Self {
        self.min_calls = 0;
        self.max_calls = None;
        self
    }

    /// Registers the expectation with `action` producing each return value.
    pub fn returning(self, action: impl FnMut(&A) -> R + Send + 'static) {
        let matcher = self.matcher;
        let matches: Box<dyn Fn(&CallRecord) -> bool + Send> = Box::new(move |record| {
            record
                .args
                .as_any()
                .downcast_ref::<A>()
                .map_or(false, |args| matcher.as_ref().map_or(true, |m| m(args)))
        });
        let mut action = action;
        let fire: Box<dyn FnMut(&CallRecord) -> Box<dyn Any + Send> + Send> =
            Box::new(move |record| {
                let args = record
                    .args
                    .as_any()
                    .downcast_ref::<A>()
                    .expect("matcher admitted the method's own signature");
                Box::new(action(args))
            });
        self.kernel.add_host_entry(HostEntry::new(
            self.method,
            self.min_calls,
            self.max_calls,
            self.desc,
            matches,
            fire,
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::CallState;
    use crate::types::{CallId, CoroId, LaunchId};

    fn record(mock: u32, method: u32, args: Box<dyn ArgBundle>) -> CallRecord {
        let arity = args.arity();
        CallRecord {
            id: CallId::new_for_test(0, 0),
            sig: SignatureDesc {
                mock: MockId::new(mock),
                method: MethodId::new(method),
                mock_name: "Turtle",
                method_name: "go_to",
                ret_type: TypeId::of::<()>(),
                ret_type_name: "()",
                arity,
            },
            args,
            origin_launch: LaunchId::new_for_test(0, 0),
            origin_coro: CoroId::new_for_test(0, 0),
            state: CallState::Offered,
            ret: None,
            chain_snapshot: 0,
            offered_at: 0,
        }
    }

    #[test]
    fn empty_pattern_matches_everything() {
        let pattern = CallPattern::any();
        assert!(pattern.matches(&record(0, 0, Box::new(()))));
        assert!(pattern.matches(&record(3, 7, Box::new((1_i32,)))));
    }

    #[test]
    fn mock_and_method_constraints() {
        let pattern = CallPattern {
            mock: Some(MockId::new(1)),
            method: Some(MethodId::new(2)),
            ..CallPattern::default()
        };
        assert!(pattern.matches(&record(1, 2, Box::new(()))));
        assert!(!pattern.matches(&record(1, 3, Box::new(()))));
        assert!(!pattern.matches(&record(0, 2, Box::new(()))));
    }

    #[test]
    fn args_predicate_downcasts_the_tuple() {
        let mut pattern = CallPattern::any();
        pattern.args = Some(Arc::new(|bundle: &dyn ArgBundle| {
            bundle
                .as_any()
                .downcast_ref::<(i32, i32)>()
                .map_or(false, |&(_, y)| y == 1)
        }));
        assert!(pattern.matches(&record(0, 0, Box::new((-1_i32, 1_i32)))));
        assert!(!pattern.matches(&record(0, 0, Box::new((-1_i32, 2_i32)))));
        // A different tuple shape never matches.
        assert!(!pattern.matches(&record(0, 0, Box::new(()))));
    }

    #[test]
    fn with_predicate_sees_the_call_view() {
        let pattern = CallPattern::any().with(|view| {
            view.method_name() == "go_to" && view.arg::<i32>(0).is_some_and(|&x| x < 0)
        });
        assert!(pattern.matches(&record(0, 0, Box::new((-5_i32, 0_i32)))));
        assert!(!pattern.matches(&record(0, 0, Box::new((5_i32, 0_i32)))));
    }
}
