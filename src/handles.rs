//! User-facing handle types.
//!
//! Handles are cheap values carrying a kernel back-reference and a record id;
//! they never hold borrows into kernel state. Checker methods (`is_call`,
//! `is_result`, `from`) return *null* handles on mismatch instead of
//! panicking, so a chain of checks behaves as a logical AND: once one link
//! fails, the rest stay null and `is_some` reports the combined verdict.
//! Acting on a null handle (returning, accepting, reading a value) is a
//! programming error.

use crate::bus::Event;
use crate::call::ArgSpec;
use crate::error::{Error, ErrorKind};
use crate::kernel::Kernel;
use crate::mock::CallPattern;
use crate::types::{CallId, LaunchId};
use core::any::{type_name, TypeId};
use core::fmt;
use core::marker::PhantomData;
use std::sync::Arc;

/// Handle to a launch session with result type `T`.
///
/// Returned by `launch`; consumed (by reference) when collecting and reading
/// the result.
pub struct LaunchHandle<T> {
    kernel: Arc<Kernel>,
    launch: LaunchId,
    _marker: PhantomData<fn() -> T>,
}

impl<T> LaunchHandle<T> {
    pub(crate) fn new(kernel: Arc<Kernel>, launch: LaunchId) -> Self {
        Self {
            kernel,
            launch,
            _marker: PhantomData,
        }
    }

    /// The session's id.
    #[must_use]
    pub fn id(&self) -> LaunchId {
        self.launch
    }
}

impl<T> Clone for LaunchHandle<T> {
    fn clone(&self) -> Self {
        Self {
            kernel: Arc::clone(&self.kernel),
            launch: self.launch,
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for LaunchHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LaunchHandle({})", self.launch)
    }
}

/// Handle to a collected launch completion.
///
/// Null when collection yielded nothing (the launch was aborted, or a
/// checker chain failed).
#[derive(Debug, Clone, Copy)]
pub struct ResultHandle {
    launch: Option<LaunchId>,
}

impl ResultHandle {
    pub(crate) const fn new(launch: LaunchId) -> Self {
        Self {
            launch: Some(launch),
        }
    }

    pub(crate) const fn null() -> Self {
        Self { launch: None }
    }

    /// True unless this handle is null.
    #[must_use]
    pub const fn is_some(&self) -> bool {
        self.launch.is_some()
    }

    /// Null-propagating check that this result came from `launch`.
    #[must_use]
    pub fn from<T>(&self, launch: &LaunchHandle<T>) -> Self {
        match self.launch {
            Some(l) if l == launch.launch => *self,
            _ => Self::null(),
        }
    }

    /// Moves the result value out of the launch this handle collected.
    ///
    /// The launch handle supplies the static result type; it must refer to
    /// the same session this handle was collected from.
    ///
    /// # Panics
    ///
    /// Panics (programming error) on a null handle, a mismatched launch, or
    /// a value that was already taken.
    #[must_use]
    pub fn value<T: 'static>(&self, launch: &LaunchHandle<T>) -> T {
        let Some(l) = self.launch else {
            let err = Error::new(ErrorKind::InvalidHandle)
                .with_context("value() on a null result handle");
            panic!("{err}");
        };
        if l != launch.launch {
            let err = Error::new(ErrorKind::InvalidHandle).with_context(format!(
                "result handle collected {l}, not {}",
                launch.launch
            ));
            launch.kernel.raise_usage(err);
        }
        let boxed = launch
            .kernel
            .take_result_value(l, TypeId::of::<T>(), type_name::<T>());
        *boxed
            .downcast::<T>()
            .expect("kernel verified the declared result type")
    }
}

/// Type-erased handle to a mock call.
#[derive(Clone)]
pub struct MockCallHandle {
    inner: Option<(Arc<Kernel>, CallId)>,
}

impl MockCallHandle {
    pub(crate) fn new(kernel: Arc<Kernel>, call: CallId) -> Self {
        Self {
            inner: Some((kernel, call)),
        }
    }

    pub(crate) const fn null() -> Self {
        Self { inner: None }
    }

    /// True unless this handle is null.
    #[must_use]
    pub fn is_some(&self) -> bool {
        self.inner.is_some()
    }

    /// Null-propagating check against a call pattern.
    #[must_use]
    pub fn is_call(&self, pattern: impl Into<CallPattern>) -> Self {
        let Some((kernel, call)) = &self.inner else {
            return Self::null();
        };
        let pattern = pattern.into();
        if kernel.with_call(*call, |rec| pattern.matches(rec)) {
            self.clone()
        } else {
            Self::null()
        }
    }

    /// Null-propagating check that the call originated from `launch`.
    #[must_use]
    pub fn from<T>(&self, launch: &LaunchHandle<T>) -> Self {
        let Some((kernel, call)) = &self.inner else {
            return Self::null();
        };
        if kernel.with_call(*call, |rec| rec.origin_launch) == launch.launch {
            self.clone()
        } else {
            Self::null()
        }
    }

    /// Clone of the `index`-th argument as `T`; `None` on a null handle, an
    /// out-of-range index, or a type mismatch.
    #[must_use]
    pub fn arg<T: Clone + 'static>(&self, index: usize) -> Option<T> {
        let (kernel, call) = self.inner.as_ref()?;
        kernel
            .with_call(*call, |rec| rec.args.arg_cloned(index))?
            .downcast::<T>()
            .ok()
            .map(|b| *b)
    }

    /// The method's display name, or `None` on a null handle.
    #[must_use]
    pub fn method_name(&self) -> Option<&'static str> {
        let (kernel, call) = self.inner.as_ref()?;
        Some(kernel.with_call(*call, |rec| rec.sig.method_name))
    }

    /// Accepts the call: dispatch ends, a return is still owed.
    pub fn accept(&self) {
        let (kernel, call) = self.expect_live("accept");
        kernel.accept_call(kernel.current_coro(), call);
    }

    /// Declines the call back into dispatch, which resumes below the watch
    /// that offered it.
    pub fn decline(&self) {
        let (kernel, call) = self.expect_live("decline");
        kernel.decline_call(kernel.current_coro(), call);
    }

    /// Supplies the call's return value (accepting it first if undisposed).
    ///
    /// The value's type is checked against the method signature.
    pub fn return_with<T: Send + 'static>(&self, value: T) {
        let (kernel, call) = self.expect_live("return_with");
        kernel.return_call(
            kernel.current_coro(),
            call,
            Box::new(value),
            TypeId::of::<T>(),
            type_name::<T>(),
        );
    }

    /// Returns from a void method.
    pub fn return_void(&self) {
        self.return_with(());
    }

    fn expect_live(&self, op: &str) -> (&Arc<Kernel>, CallId) {
        match &self.inner {
            Some((kernel, call)) => (kernel, *call),
            None => {
                let err = Error::new(ErrorKind::InvalidHandle)
                    .with_context(format!("{op} on a null call handle"));
                panic!("{err}");
            }
        }
    }
}

impl fmt::Debug for MockCallHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            Some((_, call)) => write!(f, "MockCallHandle({call})"),
            None => write!(f, "MockCallHandle(null)"),
        }
    }
}

/// Handle to a mock call witnessed at a known signature.
///
/// Produced by the signature form of waiting (`wait_for` on a typed method),
/// which makes the argument tuple and return type available statically:
/// [`args`](Self::args) yields the concrete tuple and [`ret`](Self::ret)
/// takes the method's actual return type.
pub struct SignatureHandle<A, R> {
    inner: Option<(Arc<Kernel>, CallId)>,
    _marker: PhantomData<fn(A) -> R>,
}

impl<A: ArgSpec + Clone, R: Send + 'static> SignatureHandle<A, R> {
    pub(crate) fn new(kernel: Arc<Kernel>, call: CallId) -> Self {
        Self {
            inner: Some((kernel, call)),
            _marker: PhantomData,
        }
    }

    /// True unless this handle is null.
    #[must_use]
    pub fn is_some(&self) -> bool {
        self.inner.is_some()
    }

    /// Clone of the full argument tuple.
    ///
    /// # Panics
    ///
    /// Panics (programming error) on a null handle.
    #[must_use]
    pub fn args(&self) -> A {
        let (kernel, call) = self.expect_live("args");
        kernel
            .with_call(call, |rec| rec.args.as_any().downcast_ref::<A>().cloned())
            .expect("signature handle matches its method's tuple")
    }

    /// Supplies the typed return value (accepting the call if undisposed).
    pub fn ret(&self, value: R) {
        let (kernel, call) = self.expect_live("ret");
        kernel.return_call(
            kernel.current_coro(),
            call,
            Box::new(value),
            TypeId::of::<R>(),
            type_name::<R>(),
        );
    }

    /// Erases the signature.
    #[must_use]
    pub fn erased(&self) -> MockCallHandle {
        match &self.inner {
            Some((kernel, call)) => MockCallHandle::new(Arc::clone(kernel), *call),
            None => MockCallHandle::null(),
        }
    }

    fn expect_live(&self, op: &str) -> (&Arc<Kernel>, CallId) {
        match &self.inner {
            Some((kernel, call)) => (kernel, *call),
            None => {
                let err = Error::new(ErrorKind::InvalidHandle)
                    .with_context(format!("{op} on a null signature handle"));
                panic!("{err}");
            }
        }
    }
}

impl<A, R> Clone for SignatureHandle<A, R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            _marker: PhantomData,
        }
    }
}

impl<A, R> fmt::Debug for SignatureHandle<A, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            Some((_, call)) => write!(f, "SignatureHandle({call})"),
            None => write!(f, "SignatureHandle(null)"),
        }
    }
}

/// Handle to an undisposed event from `next_event`.
///
/// A call event must be accepted, declined, or returned before the coroutine
/// waits again (the server-style rule); a completion event is collected with
/// [`collect`](Self::collect).
#[derive(Clone)]
pub struct EventHandle {
    inner: Option<(Arc<Kernel>, Event)>,
}

impl EventHandle {
    pub(crate) fn new(kernel: Arc<Kernel>, event: Event) -> Self {
        Self {
            inner: Some((kernel, event)),
        }
    }

    const fn null() -> Self {
        Self { inner: None }
    }

    /// True unless this handle is null.
    #[must_use]
    pub fn is_some(&self) -> bool {
        self.inner.is_some()
    }

    /// Null-propagating projection to a call handle matching `pattern`.
    #[must_use]
    pub fn is_call(&self, pattern: impl Into<CallPattern>) -> MockCallHandle {
        match &self.inner {
            Some((kernel, Event::Call(call))) => {
                MockCallHandle::new(Arc::clone(kernel), *call).is_call(pattern)
            }
            _ => MockCallHandle::null(),
        }
    }

    /// Null-propagating check that this event is a launch completion.
    #[must_use]
    pub fn is_result(&self) -> Self {
        match &self.inner {
            Some((_, Event::LaunchDone(_))) => self.clone(),
            _ => Self::null(),
        }
    }

    /// Null-propagating check of the event's originating launch: the issuing
    /// session for a call, the completed session for a result.
    #[must_use]
    pub fn from<T>(&self, launch: &LaunchHandle<T>) -> Self {
        match &self.inner {
            Some((kernel, Event::Call(call))) => {
                if kernel.with_call(*call, |rec| rec.origin_launch) == launch.launch {
                    self.clone()
                } else {
                    Self::null()
                }
            }
            Some((_, Event::LaunchDone(l))) => {
                if *l == launch.launch {
                    self.clone()
                } else {
                    Self::null()
                }
            }
            None => Self::null(),
        }
    }

    /// Accepts a call event. Programming error on completions and null
    /// handles.
    pub fn accept(&self) {
        match &self.inner {
            Some((kernel, Event::Call(call))) => {
                kernel.accept_call(kernel.current_coro(), *call);
            }
            Some((kernel, Event::LaunchDone(_))) => {
                let err = Error::new(ErrorKind::InvalidHandle)
                    .with_context("accept on a completion event; use collect()");
                kernel.raise_usage(err);
            }
            None => {
                let err = Error::new(ErrorKind::InvalidHandle)
                    .with_context("accept on a null event handle");
                panic!("{err}");
            }
        }
    }

    /// Declines a call event back into dispatch. Completions are not
    /// droppable; declining one is a programming error.
    pub fn decline(&self) {
        match &self.inner {
            Some((kernel, Event::Call(call))) => {
                kernel.decline_call(kernel.current_coro(), *call);
            }
            Some((kernel, Event::LaunchDone(_))) => {
                let err = Error::new(ErrorKind::InvalidHandle)
                    .with_context("launch completions cannot be declined");
                kernel.raise_usage(err);
            }
            None => {
                let err = Error::new(ErrorKind::InvalidHandle)
                    .with_context("decline on a null event handle");
                panic!("{err}");
            }
        }
    }

    /// Collects a completion event, yielding a result handle.
    ///
    /// Re-raises the CUT's panic if the launch panicked; yields a null
    /// handle if the launch was aborted.
    #[must_use]
    pub fn collect(&self) -> ResultHandle {
        match &self.inner {
            Some((kernel, Event::LaunchDone(launch))) => match kernel.finish_collect(*launch) {
                Some(l) => ResultHandle::new(l),
                None => ResultHandle::null(),
            },
            Some((kernel, Event::Call(_))) => {
                let err = Error::new(ErrorKind::InvalidHandle)
                    .with_context("collect on a call event; accept, decline, or return it");
                kernel.raise_usage(err);
            }
            None => {
                let err = Error::new(ErrorKind::InvalidHandle)
                    .with_context("collect on a null event handle");
                panic!("{err}");
            }
        }
    }
}

impl fmt::Debug for EventHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            Some((_, event)) => write!(f, "EventHandle({event:?})"),
            None => write!(f, "EventHandle(null)"),
        }
    }
}
