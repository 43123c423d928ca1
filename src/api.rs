//! The authoring surface: test entry points and the per-coroutine context.
//!
//! A test is a closure over a [`CoroCx`]; the closure body *is* the top-level
//! test coroutine. From it the author launches CUT invocations, declares
//! watches, spawns further coroutines, and waits for events:
//!
//! ```ignore
//! run_cotest("square", |cx| {
//!     let turtle = MockTurtle::new(cx);
//!     let painter = Painter::new(turtle.clone());
//!     cx.watch_call(CallPattern::any());
//!
//!     let l = cx.launch(move || painter.draw_square(5));
//!     cx.wait_for(&turtle.pen_down).ret(());
//!     for _ in 0..4 {
//!         cx.wait_for_call(turtle.forward.with_args((5,))).return_void();
//!         cx.wait_for_call(turtle.turn.with_args((90,))).return_void();
//!     }
//!     cx.wait_for(&turtle.pen_up).ret(());
//!     let r = cx.wait_for_result();
//!     assert!(r.is_some());
//! });
//! ```

use crate::bus::{Event, EventFilter};
use crate::config::KernelConfig;
use crate::handles::{EventHandle, LaunchHandle, MockCallHandle, ResultHandle, SignatureHandle};
use crate::kernel::{ExitSignal, Kernel};
use crate::mock::{CallPattern, MockMethod};
use crate::substrate::{ContextId, MAIN_CONTEXT};
use crate::types::{CoroId, LaunchId};
use core::any::{type_name, Any, TypeId};
use std::panic::{catch_unwind, panic_any, AssertUnwindSafe};
use std::sync::Arc;

/// Runs a coroutine test with the default configuration (plus `COTEST_*`
/// environment overrides).
///
/// The closure body is the test's main coroutine. The call returns normally
/// only if the body ran to completion and end-of-test verification found no
/// failures; otherwise it panics with the accumulated report.
pub fn run_cotest(name: &str, body: impl FnOnce(&mut CoroCx)) {
    let config = match KernelConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            let err = crate::error::Error::new(crate::error::ErrorKind::Config)
                .with_context(e.to_string());
            panic!("{err}");
        }
    };
    run_cotest_with(config, name, body);
}

/// [`run_cotest`] with an explicit configuration.
pub fn run_cotest_with(config: KernelConfig, name: &str, body: impl FnOnce(&mut CoroCx)) {
    let (kernel, main) = Kernel::new(name, config);
    let mut cx = CoroCx::new(Arc::clone(&kernel), main, MAIN_CONTEXT);
    let result = catch_unwind(AssertUnwindSafe(|| body(&mut cx)));
    kernel.finish(main, result);
}

/// Handle to a secondary test coroutine.
#[derive(Debug, Clone, Copy)]
pub struct CoroutineHandle {
    id: CoroId,
}

impl CoroutineHandle {
    /// The coroutine's id.
    #[must_use]
    pub fn id(&self) -> CoroId {
        self.id
    }
}

/// The per-coroutine context: every kernel operation a test body can perform
/// goes through it.
pub struct CoroCx {
    kernel: Arc<Kernel>,
    id: CoroId,
    ctx: ContextId,
}

impl CoroCx {
    pub(crate) fn new(kernel: Arc<Kernel>, id: CoroId, ctx: ContextId) -> Self {
        Self { kernel, id, ctx }
    }

    pub(crate) fn kernel(&self) -> &Arc<Kernel> {
        &self.kernel
    }

    /// This coroutine's id.
    #[must_use]
    pub fn coroutine_id(&self) -> CoroId {
        self.id
    }

    // === Launch sessions ===

    /// Launches one CUT invocation on a fresh launch coroutine.
    ///
    /// The callee runs immediately, up to its first mock call (or to
    /// completion); `launch` then returns a typed handle to the session. The
    /// session's completion must be collected with a `wait_for_result`
    /// variant before the test ends.
    pub fn launch<T, F>(&mut self, f: F) -> LaunchHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let entry: Box<dyn FnOnce() -> Box<dyn Any + Send> + Send> =
            Box::new(move || Box::new(f()) as Box<dyn Any + Send>);
        let launch = self.kernel.launch(
            self.id,
            self.ctx,
            TypeId::of::<T>(),
            type_name::<T>(),
            entry,
        );
        LaunchHandle::new(Arc::clone(&self.kernel), launch)
    }

    /// Waits for and collects the next completion of any launch owned by
    /// this coroutine.
    ///
    /// Re-raises the CUT's panic if the launch panicked. Yields a null
    /// handle if the launch was aborted.
    pub fn wait_for_result(&mut self) -> ResultHandle {
        match self.kernel.collect_result(self.id, self.ctx, None) {
            Some(launch) => ResultHandle::new(launch),
            None => ResultHandle::null(),
        }
    }

    /// Waits for and collects the completion of one specific launch.
    ///
    /// Completions of other launches stay queued. Collecting a launch owned
    /// by another coroutine is a programming error.
    pub fn wait_for_result_from<T>(&mut self, launch: &LaunchHandle<T>) -> ResultHandle {
        match self
            .kernel
            .collect_result(self.id, self.ctx, Some(launch.id()))
        {
            Some(l) => ResultHandle::new(l),
            None => ResultHandle::null(),
        }
    }

    // === Coroutines ===

    /// Creates a further test coroutine.
    ///
    /// The new coroutine runs immediately until it first blocks or exits, so
    /// watches it declares on entry take effect before this coroutine
    /// continues.
    pub fn coroutine(
        &mut self,
        name: &str,
        body: impl FnOnce(&mut CoroCx) + Send + 'static,
    ) -> CoroutineHandle {
        let id = self.kernel.spawn_test_coroutine(
            self.id,
            self.ctx,
            name.to_owned(),
            Box::new(body),
        );
        CoroutineHandle { id }
    }

    // === Watches ===

    /// Registers a watch owned by this coroutine.
    ///
    /// Matching calls are steered here: they show up as events for
    /// `wait_for_call` / `next_event`. Later-declared watches take priority.
    pub fn watch_call(&mut self, pattern: impl Into<CallPattern>) {
        self.kernel.add_watch(self.id, pattern.into());
    }

    /// Registers a watch owned by another coroutine.
    pub fn watch_call_owned(&mut self, owner: &CoroutineHandle, pattern: impl Into<CallPattern>) {
        self.kernel.add_watch(owner.id(), pattern.into());
    }

    // === Waiting for calls ===

    /// Waits for a mock call matching `pattern` (the interior filter).
    ///
    /// Calls seen by this coroutine's watches that do *not* match the
    /// pattern are declined back into dispatch, where lower-priority watches
    /// and expectations can pick them up. The returned handle is accepted; a
    /// return is owed on it.
    pub fn wait_for_call(&mut self, pattern: impl Into<CallPattern>) -> MockCallHandle {
        let call = self.wait_call_impl(pattern.into(), None);
        MockCallHandle::new(Arc::clone(&self.kernel), call)
    }

    /// [`wait_for_call`](Self::wait_for_call) restricted to calls issued by
    /// one launch session.
    pub fn wait_for_call_from<T>(
        &mut self,
        pattern: impl Into<CallPattern>,
        launch: &LaunchHandle<T>,
    ) -> MockCallHandle {
        let call = self.wait_call_impl(pattern.into(), Some(launch.id()));
        MockCallHandle::new(Arc::clone(&self.kernel), call)
    }

    /// Signature form of waiting: matches any call of `method` and returns a
    /// typed handle with `args()` and `ret(value)`.
    pub fn wait_for<A, R>(&mut self, method: &MockMethod<A, R>) -> SignatureHandle<A, R>
    where
        A: crate::call::ArgSpec + Clone,
        R: Send + 'static,
    {
        let call = self.wait_call_impl(method.pattern(), None);
        SignatureHandle::new(Arc::clone(&self.kernel), call)
    }

    /// [`wait_for`](Self::wait_for) restricted to one launch session.
    pub fn wait_for_from<A, R, T>(
        &mut self,
        method: &MockMethod<A, R>,
        launch: &LaunchHandle<T>,
    ) -> SignatureHandle<A, R>
    where
        A: crate::call::ArgSpec + Clone,
        R: Send + 'static,
    {
        let call = self.wait_call_impl(method.pattern(), Some(launch.id()));
        SignatureHandle::new(Arc::clone(&self.kernel), call)
    }

    fn wait_call_impl(&mut self, pattern: CallPattern, from: Option<LaunchId>) -> crate::types::CallId {
        loop {
            let event = self
                .kernel
                .next_event(self.id, self.ctx, EventFilter::CallsOnly);
            let Event::Call(call) = event else {
                unreachable!("calls-only filter yielded a completion")
            };
            let matched = self.kernel.with_call(call, |rec| {
                pattern.matches(rec) && from.map_or(true, |l| rec.origin_launch == l)
            });
            if matched {
                self.kernel.accept_call(self.id, call);
                return call;
            }
            self.kernel.decline_call(self.id, call);
        }
    }

    // === Server style ===

    /// Waits for the next event of any kind targeted at this coroutine.
    ///
    /// A call event is returned *undisposed*: until it is accepted,
    /// declined, or returned, launching and waiting again are programming
    /// errors.
    pub fn next_event(&mut self) -> EventHandle {
        let event = self.kernel.next_event(self.id, self.ctx, EventFilter::Any);
        EventHandle::new(Arc::clone(&self.kernel), event)
    }

    // === Cardinality controls ===

    /// Marks this coroutine satisfied ahead of its exit.
    ///
    /// Useful for coroutines that are deliberately still waiting when the
    /// test ends; without it they are reported as unsatisfied.
    pub fn satisfy(&mut self) {
        self.kernel.satisfy(self.id);
    }

    /// Retires this coroutine: its watches stop matching, and no
    /// oversaturation can be raised against it after exit.
    pub fn retire(&mut self) {
        self.kernel.retire(self.id);
    }

    /// Exits the coroutine body early. Equivalent to returning from the
    /// closure: the coroutine exits satisfied.
    pub fn exit_coroutine(&mut self) -> ! {
        panic_any(ExitSignal::Exit)
    }
}

impl core::fmt::Debug for CoroCx {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CoroCx")
            .field("coroutine", &self.id)
            .field("ctx", &self.ctx)
            .finish()
    }
}
