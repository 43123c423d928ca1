//! The per-test kernel: dispatch, scheduling, and verification.
//!
//! One [`Kernel`] exists per running test. It owns the coroutine, launch, and
//! call arenas, the handler chain, the event bus, and the failure sink, all
//! behind a single lock. Because the baton admits exactly one running
//! context, the lock is uncontended; it exists to make the state `Sync`
//! across coroutine threads.
//!
//! # Scheduling
//!
//! There is no scheduler context. The running coroutine performs scheduling
//! inline: at every suspension point it scans for a runnable peer (a
//! coroutine whose wait predicate is satisfied, or one that has not had its
//! initial run) and hands the baton over directly. Dispatch and completion
//! posting leave a preference hint so the coroutine an event was just aimed
//! at is resumed first; otherwise creation order breaks ties.
//!
//! If no peer is runnable the kernel records a deadlock with every waiting
//! predicate and winds the test down.

use crate::bus::{Event, EventBus, EventFilter};
use crate::call::{ArgBundle, CallRecord, CallState, SignatureDesc};
use crate::config::KernelConfig;
use crate::coro::{CoroRecord, CoroRole, CoroState, WaitPredicate};
use crate::error::{Error, ErrorKind};
use crate::mock::CallPattern;
use crate::registry::{ChainEntry, HandlerChain, HostEntry};
use crate::substrate::{Baton, ContextId, MAIN_CONTEXT};
use crate::tracing_compat::{debug, trace};
use crate::types::{CallId, CoroId, LaunchId, MethodId, MockId};
use parking_lot::{Mutex, MutexGuard};
use std::any::{Any, TypeId};
use std::panic::{catch_unwind, panic_any, resume_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Control-flow signal unwound through coroutine bodies.
///
/// Not a failure by itself: `Exit` is the user's early-exit request,
/// `Shutdown` is the kernel winding the test down, and `Abandon` aborts a
/// launch whose call found no handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExitSignal {
    /// User requested an early coroutine exit.
    Exit,
    /// The kernel is winding the test down.
    Shutdown,
    /// The launch is aborted after an unmatched call.
    Abandon,
}

/// State of a launch session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchState {
    /// The CUT invocation is still executing (or blocked on a mock call).
    Running,
    /// The invocation finished; a completion event awaits collection.
    Completed,
    /// The completion was collected by the owning coroutine.
    Collected,
}

/// How a launch session ended.
#[derive(Debug)]
pub enum LaunchOutcome {
    /// Normal return; the box is taken when the result value is read.
    Value(Option<Box<dyn Any + Send>>),
    /// The CUT panicked; the payload is re-raised at the collection site.
    Panicked(Option<Box<dyn Any + Send>>),
    /// The launch was aborted (unmatched call or shutdown).
    Aborted,
}

/// One launch session.
#[derive(Debug)]
pub struct LaunchRecord {
    /// Stable id.
    pub id: LaunchId,
    /// The test coroutine that issued the launch and may collect it.
    pub owner: CoroId,
    /// The coroutine running the CUT invocation.
    pub coro: CoroId,
    /// Declared result type.
    pub ret_type: TypeId,
    /// Display name of the result type.
    pub ret_type_name: &'static str,
    /// Session state.
    pub state: LaunchState,
    /// Set when the session completes.
    pub outcome: Option<LaunchOutcome>,
}

/// The entry a coroutine thread runs.
pub(crate) enum CoroEntry {
    /// A user test-coroutine body.
    Test(Box<dyn FnOnce(&mut crate::api::CoroCx) + Send>),
    /// One CUT invocation producing a boxed result.
    Launch(Box<dyn FnOnce() -> Box<dyn Any + Send> + Send>),
}

pub(crate) struct KernelState {
    pub(crate) coros: crate::util::Arena<CoroRecord>,
    pub(crate) launches: crate::util::Arena<LaunchRecord>,
    pub(crate) calls: crate::util::Arena<CallRecord>,
    pub(crate) chain: HandlerChain,
    pub(crate) bus: EventBus,
    pub(crate) methods: Vec<SignatureDesc>,
    pub(crate) next_mock: u32,
    pub(crate) failures: Vec<Error>,
    /// Set just before a programming-error panic unwinds its coroutine;
    /// `on_coro_exit` uses it to recognize the unwind as fatal.
    pub(crate) pending_programming_error: Option<Error>,
    /// The exact payload of a programming-error panic raised on a secondary
    /// coroutine; `finish` re-raises it instead of the aggregated report.
    pub(crate) fatal_payload: Option<Box<dyn Any + Send>>,
    pub(crate) shutting_down: bool,
    pub(crate) prefer: Option<CoroId>,
    pub(crate) next_ctx: ContextId,
    pub(crate) current: CoroId,
    pub(crate) threads: Vec<JoinHandle<()>>,
}

impl KernelState {
    fn coro(&self, id: CoroId) -> &CoroRecord {
        self.coros.get(id.arena_index()).expect("stale coroutine id")
    }

    fn coro_mut(&mut self, id: CoroId) -> &mut CoroRecord {
        self.coros
            .get_mut(id.arena_index())
            .expect("stale coroutine id")
    }

    fn launch(&self, id: LaunchId) -> &LaunchRecord {
        self.launches.get(id.arena_index()).expect("stale launch id")
    }

    fn launch_mut(&mut self, id: LaunchId) -> &mut LaunchRecord {
        self.launches
            .get_mut(id.arena_index())
            .expect("stale launch id")
    }

    fn call(&self, id: CallId) -> &CallRecord {
        self.calls.get(id.arena_index()).expect("stale call id")
    }

    fn call_mut(&mut self, id: CallId) -> &mut CallRecord {
        self.calls.get_mut(id.arena_index()).expect("stale call id")
    }

    fn alloc_ctx(&mut self) -> ContextId {
        let ctx = self.next_ctx;
        self.next_ctx += 1;
        ctx
    }
}

/// The per-test kernel. Handles keep an `Arc` back-reference to it.
pub struct Kernel {
    name: String,
    config: KernelConfig,
    baton: Baton,
    pub(crate) state: Mutex<KernelState>,
}

impl Kernel {
    /// Creates a kernel whose main coroutine is the calling thread.
    ///
    /// Returns the kernel and the main coroutine's id.
    pub(crate) fn new(name: impl Into<String>, config: KernelConfig) -> (Arc<Self>, CoroId) {
        install_panic_hook();
        let mut coros = crate::util::Arena::new();
        let main = CoroId::from_arena(coros.insert_with(|idx| {
            let mut rec = CoroRecord::new(
                CoroId::from_arena(idx),
                String::from("main"),
                CoroRole::Test,
                MAIN_CONTEXT,
                None,
                None,
            );
            rec.mark_running();
            rec
        }));
        let kernel = Arc::new(Self {
            name: name.into(),
            config,
            baton: Baton::new(),
            state: Mutex::new(KernelState {
                coros,
                launches: crate::util::Arena::new(),
                calls: crate::util::Arena::new(),
                chain: HandlerChain::new(),
                bus: EventBus::new(),
                methods: Vec::new(),
                next_mock: 0,
                failures: Vec::new(),
                pending_programming_error: None,
                fatal_payload: None,
                shutting_down: false,
                prefer: None,
                next_ctx: MAIN_CONTEXT + 1,
                current: main,
                threads: Vec::new(),
            }),
        });
        (kernel, main)
    }

    /// Test name, for reports.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    // === Mock layer registration ===

    #[cfg_attr(not(feature = "tracing-integration"), allow(unused_variables))]
    pub(crate) fn register_mock(&self, name: &'static str) -> MockId {
        let mut st = self.state.lock();
        let id = MockId::new(st.next_mock);
        st.next_mock += 1;
        debug!(mock = %id, name, "mock registered");
        id
    }

    pub(crate) fn register_method(
        &self,
        mock: MockId,
        mock_name: &'static str,
        method_name: &'static str,
        ret_type: TypeId,
        ret_type_name: &'static str,
        arity: usize,
    ) -> MethodId {
        let mut st = self.state.lock();
        let id = MethodId::new(u32::try_from(st.methods.len()).expect("method count overflow"));
        st.methods.push(SignatureDesc {
            mock,
            method: id,
            mock_name,
            method_name,
            ret_type,
            ret_type_name,
            arity,
        });
        id
    }

    pub(crate) fn method_sig(&self, method: MethodId) -> SignatureDesc {
        self.state.lock().methods[method.index()]
    }

    pub(crate) fn add_watch(&self, owner: CoroId, pattern: CallPattern) {
        let mut st = self.state.lock();
        let _seq = st.chain.push_watch(owner, pattern);
        debug!(coro = %owner, seq = _seq, "watch registered");
    }

    pub(crate) fn add_host_entry(&self, entry: HostEntry) {
        let mut st = self.state.lock();
        debug!(desc = %entry.desc, "host expectation registered");
        st.chain.push_host(entry);
    }

    // === Introspection used by handles ===

    pub(crate) fn with_call<R>(&self, call: CallId, f: impl FnOnce(&CallRecord) -> R) -> R {
        let st = self.state.lock();
        f(st.call(call))
    }

    pub(crate) fn current_coro(&self) -> CoroId {
        self.state.lock().current
    }

    // === Programming errors ===

    /// Records `err` and panics at the offending call site.
    ///
    /// The panic unwinds the calling coroutine. When that coroutine is the
    /// main one, the payload reaches `finish` directly and is re-raised
    /// there; when it is a secondary coroutine, `on_coro_exit` recognizes
    /// the recorded error, stops the test, and hands the exact payload to
    /// `finish` for the same re-raise. Either way the failure surfaces with
    /// its precise site instead of being folded into the aggregated report.
    fn raise(&self, mut st: MutexGuard<'_, KernelState>, err: Error) -> ! {
        debug_assert!(
            err.is_programming_error(),
            "raise is reserved for programming errors"
        );
        st.pending_programming_error = Some(err.clone());
        drop(st);
        panic!("{err}");
    }

    /// [`raise`](Self::raise) for callers that do not hold the state lock
    /// (handle methods).
    pub(crate) fn raise_usage(&self, err: Error) -> ! {
        let st = self.state.lock();
        self.raise(st, err)
    }

    // === Cardinality controls ===

    pub(crate) fn satisfy(&self, me: CoroId) {
        let mut st = self.state.lock();
        st.coro_mut(me).satisfied = true;
        debug!(coro = %me, "marked satisfied");
    }

    pub(crate) fn retire(&self, me: CoroId) {
        let mut st = self.state.lock();
        st.coro_mut(me).retired = true;
        debug!(coro = %me, "retired");
    }

    // === Coroutine and launch creation ===

    pub(crate) fn spawn_test_coroutine(
        self: &Arc<Self>,
        parent: CoroId,
        parent_ctx: ContextId,
        name: String,
        body: Box<dyn FnOnce(&mut crate::api::CoroCx) + Send>,
    ) -> CoroId {
        let child = self.spawn_coro(name, CoroRole::Test, Some(parent), CoroEntry::Test(body));
        // Initial activity: the new coroutine runs until it first blocks or
        // exits, making its watches effective before the creator continues.
        self.wait_child_parked(parent, parent_ctx, child);
        child
    }

    pub(crate) fn launch(
        self: &Arc<Self>,
        parent: CoroId,
        parent_ctx: ContextId,
        ret_type: TypeId,
        ret_type_name: &'static str,
        entry: Box<dyn FnOnce() -> Box<dyn Any + Send> + Send>,
    ) -> LaunchId {
        {
            let st = self.state.lock();
            if let Some(call) = st.coro(parent).undisposed {
                let err = Error::new(ErrorKind::ServerRule).with_context(format!(
                    "launch while call {call} is undisposed; accept, decline, or return it first"
                ));
                self.raise(st, err);
            }
        }
        let name = {
            let st = self.state.lock();
            format!("launch-{}", st.launches.len())
        };
        let child = self.spawn_coro(name, CoroRole::Launch, Some(parent), CoroEntry::Launch(entry));
        let launch_id = {
            let mut st = self.state.lock();
            let launch_id = LaunchId::from_arena(st.launches.insert_with(|idx| LaunchRecord {
                id: LaunchId::from_arena(idx),
                owner: parent,
                coro: child,
                ret_type,
                ret_type_name,
                state: LaunchState::Running,
                outcome: None,
            }));
            st.coro_mut(child).launch = Some(launch_id);
            debug!(launch = %launch_id, coro = %child, "launch session created");
            launch_id
        };
        // Run the CUT until its first mock call blocks it, or it finishes.
        self.wait_child_parked(parent, parent_ctx, child);
        launch_id
    }

    fn spawn_coro(
        self: &Arc<Self>,
        name: String,
        role: CoroRole,
        parent: Option<CoroId>,
        entry: CoroEntry,
    ) -> CoroId {
        let mut st = self.state.lock();
        if st.shutting_down {
            drop(st);
            panic_any(ExitSignal::Shutdown);
        }
        let ctx = st.alloc_ctx();
        let child = CoroId::from_arena(st.coros.insert_with(|idx| {
            CoroRecord::new(CoroId::from_arena(idx), name, role, ctx, parent, None)
        }));
        let kernel = Arc::clone(self);
        let thread_name = format!(
            "{}-{}",
            self.config.thread_name_prefix,
            st.coro(child).name
        );
        let handle = std::thread::Builder::new()
            .name(thread_name)
            .stack_size(self.config.stack_size)
            .spawn(move || kernel.coro_main(child, ctx, entry))
            .unwrap_or_else(|e| panic!("failed to spawn coroutine thread: {e}"));
        st.threads.push(handle);
        st.prefer = Some(child);
        debug!(coro = %child, name = %st.coro(child).name, "coroutine created");
        child
    }

    fn wait_child_parked(&self, me: CoroId, ctx: ContextId, child: CoroId) {
        loop {
            let mut st = self.state.lock();
            if st.shutting_down {
                drop(st);
                panic_any(ExitSignal::Shutdown);
            }
            let rec = st.coro_mut(me);
            if rec.state == CoroState::Blocked {
                rec.mark_running();
            }
            if matches!(
                st.coro(child).state,
                CoroState::Blocked | CoroState::Exited
            ) {
                return;
            }
            self.suspend(st, me, ctx, WaitPredicate::ChildParked(child));
        }
    }

    fn coro_main(self: Arc<Self>, me: CoroId, ctx: ContextId, entry: CoroEntry) {
        self.baton.acquire(ctx);
        {
            let mut st = self.state.lock();
            if st.shutting_down {
                drop(st);
                self.on_coro_exit(me, ctx, Err(Box::new(ExitSignal::Shutdown)));
                return;
            }
            st.coro_mut(me).mark_running();
        }
        let outcome = match entry {
            CoroEntry::Test(body) => {
                let mut cx = crate::api::CoroCx::new(Arc::clone(&self), me, ctx);
                catch_unwind(AssertUnwindSafe(|| body(&mut cx))).map(|()| None)
            }
            CoroEntry::Launch(f) => catch_unwind(AssertUnwindSafe(f)).map(Some),
        };
        self.on_coro_exit(me, ctx, outcome);
    }

    #[allow(clippy::too_many_lines)]
    fn on_coro_exit(
        &self,
        me: CoroId,
        ctx: ContextId,
        outcome: Result<Option<Box<dyn Any + Send>>, Box<dyn Any + Send>>,
    ) {
        enum ExitClass {
            Normal(Option<Box<dyn Any + Send>>),
            Shutdown,
            Abandon,
            Panic(Box<dyn Any + Send>),
        }

        let class = match outcome {
            Ok(value) => ExitClass::Normal(value),
            Err(payload) => match payload.downcast::<ExitSignal>() {
                Ok(signal) => match *signal {
                    ExitSignal::Exit => ExitClass::Normal(None),
                    ExitSignal::Shutdown => ExitClass::Shutdown,
                    ExitSignal::Abandon => ExitClass::Abandon,
                },
                Err(payload) => ExitClass::Panic(payload),
            },
        };

        let mut st = self.state.lock();
        let role = st.coro(me).role;
        let launch = st.coro(me).launch;
        st.coro_mut(me).mark_exited();
        trace!(coro = %me, "coroutine exited");

        match class {
            ExitClass::Normal(value) => {
                st.coro_mut(me).satisfied = true;
                if let Some(l) = launch {
                    let owner = st.launch(l).owner;
                    let record = st.launch_mut(l);
                    record.state = LaunchState::Completed;
                    record.outcome = Some(LaunchOutcome::Value(value));
                    st.bus.offer_completion(l, owner);
                    st.prefer = Some(owner);
                    debug!(launch = %l, "launch completed");
                }
            }
            ExitClass::Abandon => {
                st.coro_mut(me).satisfied = true;
                if let Some(l) = launch {
                    let owner = st.launch(l).owner;
                    let record = st.launch_mut(l);
                    record.state = LaunchState::Completed;
                    record.outcome = Some(LaunchOutcome::Aborted);
                    st.bus.offer_completion(l, owner);
                    st.prefer = Some(owner);
                    debug!(launch = %l, "launch aborted");
                }
            }
            ExitClass::Shutdown => {
                if let Some(l) = launch {
                    let record = st.launch_mut(l);
                    if record.state == LaunchState::Running {
                        record.state = LaunchState::Completed;
                        record.outcome = Some(LaunchOutcome::Aborted);
                    }
                }
            }
            ExitClass::Panic(payload) => {
                st.coro_mut(me).satisfied = true;
                if role == CoroRole::Launch {
                    // A programming error raised inside the CUT reaches the
                    // collection site through the panicked outcome; clear
                    // the marker so it cannot be misattributed later.
                    st.pending_programming_error = None;
                    let l = launch.expect("launch coroutine has a session");
                    let owner = st.launch(l).owner;
                    let record = st.launch_mut(l);
                    record.state = LaunchState::Completed;
                    record.outcome = Some(LaunchOutcome::Panicked(Some(payload)));
                    st.bus.offer_completion(l, owner);
                    st.prefer = Some(owner);
                    debug!(launch = %l, "launch panicked");
                } else if let Some(_err) = st.pending_programming_error.take() {
                    // A programming error unwound a secondary test
                    // coroutine: stop the test now and keep the exact
                    // payload for `finish` to re-raise.
                    debug!(coro = %me, error = %_err, "programming error; stopping the test");
                    st.fatal_payload = Some(payload);
                    st.shutting_down = true;
                } else {
                    let name = st.coro(me).name.clone();
                    let message = panic_message(payload.as_ref());
                    st.failures.push(
                        Error::new(ErrorKind::CoroutinePanicked)
                            .with_context(format!("coroutine '{name}' panicked: {message}")),
                    );
                }
            }
        }

        if st.shutting_down {
            let next = st
                .coros
                .iter()
                .find(|(_, r)| r.state != CoroState::Exited)
                .map(|(_, r)| (r.id, r.ctx));
            let next_ctx = match next {
                Some((id, next_ctx)) => {
                    st.current = id;
                    next_ctx
                }
                None => MAIN_CONTEXT,
            };
            drop(st);
            self.baton.release(ctx, next_ctx);
        } else {
            match Self::pick_runnable(&mut st) {
                Some((next, next_ctx)) => {
                    st.current = next;
                    drop(st);
                    self.baton.release(ctx, next_ctx);
                }
                None => {
                    self.report_deadlock(&mut st);
                    st.shutting_down = true;
                    let next = st
                        .coros
                        .iter()
                        .find(|(_, r)| r.state != CoroState::Exited)
                        .map(|(_, r)| (r.id, r.ctx));
                    let next_ctx = match next {
                        Some((id, next_ctx)) => {
                            st.current = id;
                            next_ctx
                        }
                        None => MAIN_CONTEXT,
                    };
                    drop(st);
                    self.baton.release(ctx, next_ctx);
                }
            }
        }
    }

    // === Scheduling ===

    fn runnable(st: &KernelState, rec: &CoroRecord) -> bool {
        match rec.state {
            CoroState::Ready => true,
            CoroState::Blocked => rec
                .waiting
                .map_or(false, |pred| Self::predicate_satisfied(st, rec.id, pred)),
            CoroState::Running | CoroState::Exited => false,
        }
    }

    fn predicate_satisfied(st: &KernelState, me: CoroId, pred: WaitPredicate) -> bool {
        match pred {
            WaitPredicate::Event(filter) => st.bus.peek(me, filter).is_some(),
            WaitPredicate::ChildParked(child) => matches!(
                st.coro(child).state,
                CoroState::Blocked | CoroState::Exited
            ),
            WaitPredicate::CallReturned(call) => matches!(
                st.call(call).state,
                CallState::Returned | CallState::Failed
            ),
        }
    }

    fn pick_runnable(st: &mut KernelState) -> Option<(CoroId, ContextId)> {
        if let Some(preferred) = st.prefer.take() {
            if let Some(rec) = st.coros.get(preferred.arena_index()) {
                if Self::runnable(st, rec) {
                    return Some((preferred, rec.ctx));
                }
            }
        }
        st.coros
            .iter()
            .find(|(_, rec)| Self::runnable(st, rec))
            .map(|(_, rec)| (rec.id, rec.ctx))
    }

    /// Blocks the running coroutine on `pred` and hands the baton to the next
    /// runnable coroutine. Returns once this coroutine is resumed.
    ///
    /// With no runnable peer the kernel records a deadlock and unwinds.
    fn suspend(
        &self,
        mut st: MutexGuard<'_, KernelState>,
        me: CoroId,
        ctx: ContextId,
        pred: WaitPredicate,
    ) {
        st.coro_mut(me).mark_blocked(pred);
        trace!(coro = %me, wait = %pred, "suspending");
        match Self::pick_runnable(&mut st) {
            Some((next, next_ctx)) => {
                st.current = next;
                drop(st);
                self.baton.pass(ctx, next_ctx);
            }
            None => {
                self.report_deadlock(&mut st);
                st.shutting_down = true;
                drop(st);
                panic_any(ExitSignal::Shutdown);
            }
        }
    }

    fn report_deadlock(&self, st: &mut KernelState) {
        let waiters: Vec<String> = st
            .coros
            .iter()
            .filter(|(_, rec)| rec.state == CoroState::Blocked)
            .map(|(_, rec)| match rec.waiting {
                Some(pred) => format!("'{}' is {pred}", rec.name),
                None => format!("'{}' is blocked", rec.name),
            })
            .collect();
        let context = if self.config.deadlock_verbose {
            format!("no coroutine is runnable: {}", waiters.join("; "))
        } else {
            format!("no coroutine is runnable ({} waiting)", waiters.len())
        };
        debug!(%context, "deadlock detected");
        st.failures.push(Error::new(ErrorKind::Deadlock).with_context(context));
    }

    // === Dispatch ===

    /// Entry point for mock method stubs: carries a call through the handler
    /// chain and blocks the issuing launch coroutine until some consumer
    /// fills the return slot.
    pub(crate) fn dispatch_call(
        &self,
        method: MethodId,
        args: Box<dyn ArgBundle>,
    ) -> Box<dyn Any + Send> {
        let (me, ctx, call_id) = {
            let mut st = self.state.lock();
            if st.shutting_down {
                drop(st);
                panic_any(ExitSignal::Shutdown);
            }
            let me = st.current;
            let rec = st.coro(me);
            let ctx = rec.ctx;
            let sig = st.methods[method.index()];
            let Some(origin_launch) = rec.launch else {
                let err = Error::new(ErrorKind::CallOutsideLaunch).with_context(format!(
                    "{}::{} called outside a launched invocation",
                    sig.mock_name, sig.method_name
                ));
                self.raise(st, err);
            };
            debug_assert_eq!(sig.arity, args.arity(), "stub arity mismatch");
            let chain_len = st.chain.len();
            let call_id = CallId::from_arena(st.calls.insert_with(|idx| CallRecord {
                id: CallId::from_arena(idx),
                sig,
                args,
                origin_launch,
                origin_coro: me,
                state: CallState::Offered,
                ret: None,
                chain_snapshot: chain_len,
                offered_at: chain_len,
            }));
            debug!(call = %st.call(call_id).describe(), launch = %origin_launch, "mock call issued");
            self.dispatch_from(&mut st, call_id, chain_len);
            (me, ctx, call_id)
        };

        loop {
            let mut st = self.state.lock();
            if st.shutting_down {
                drop(st);
                panic_any(ExitSignal::Shutdown);
            }
            let rec = st.coro_mut(me);
            if rec.state == CoroState::Blocked {
                rec.mark_running();
            }
            match st.call(call_id).state {
                CallState::Returned => {
                    let value = st
                        .call_mut(call_id)
                        .ret
                        .take()
                        .expect("returned call carries a value");
                    trace!(call = %call_id, "stub resumed with return value");
                    return value;
                }
                CallState::Failed => {
                    drop(st);
                    panic_any(ExitSignal::Abandon);
                }
                _ => self.suspend(st, me, ctx, WaitPredicate::CallReturned(call_id)),
            }
        }
    }

    /// Walks the chain from just below `below`, offering `call` to the first
    /// eligible entry. Decline re-enters here with the declining watch's
    /// position.
    fn dispatch_from(&self, st: &mut KernelState, call: CallId, below: usize) {
        enum Verdict {
            Skip,
            Offer(CoroId),
            Fired(Box<dyn Any + Send>),
            Oversaturated(CoroId),
        }

        let top = below
            .min(st.call(call).chain_snapshot)
            .min(st.chain.len());
        let mut idx = top;
        while idx > 0 {
            idx -= 1;
            let verdict = {
                let KernelState {
                    chain,
                    calls,
                    coros,
                    ..
                } = st;
                let rec = calls.get(call.arena_index()).expect("stale call id");
                match &mut chain.entries[idx] {
                    ChainEntry::Watch(watch) => {
                        let owner = coros
                            .get(watch.owner.arena_index())
                            .expect("stale coroutine id");
                        if !owner.visible_to_dispatch() || !watch.pattern.matches(rec) {
                            Verdict::Skip
                        } else if owner.state == CoroState::Exited {
                            Verdict::Oversaturated(watch.owner)
                        } else {
                            Verdict::Offer(watch.owner)
                        }
                    }
                    ChainEntry::Host(host) => {
                        if host.matches(rec) {
                            Verdict::Fired(host.fire(rec))
                        } else {
                            Verdict::Skip
                        }
                    }
                }
            };
            match verdict {
                Verdict::Skip => {}
                Verdict::Oversaturated(owner) => {
                    let desc = st.call(call).describe();
                    let rec = st.coro_mut(owner);
                    if !rec.oversaturation_reported {
                        rec.oversaturation_reported = true;
                        let name = rec.name.clone();
                        st.failures.push(Error::new(ErrorKind::Oversaturation).with_context(
                            format!("coroutine '{name}' already exited but {desc} matched its watch"),
                        ));
                    }
                }
                Verdict::Offer(owner) => {
                    {
                        let record = st.call_mut(call);
                        record.state = CallState::Offered;
                        record.offered_at = idx;
                    }
                    st.bus.offer_call(call, owner);
                    st.prefer = Some(owner);
                    trace!(call = %call, coro = %owner, position = idx, "call offered");
                    return;
                }
                Verdict::Fired(value) => {
                    let origin = st.call(call).origin_coro;
                    {
                        let record = st.call_mut(call);
                        record.ret = Some(value);
                        record.state = CallState::Returned;
                    }
                    st.prefer = Some(origin);
                    trace!(call = %call, position = idx, "call consumed by host expectation");
                    return;
                }
            }
        }

        let desc = st.call(call).describe();
        let origin = st.call(call).origin_coro;
        st.failures
            .push(Error::new(ErrorKind::UnmatchedCall).with_context(format!(
                "no watch or expectation consumed {desc}"
            )));
        st.call_mut(call).state = CallState::Failed;
        st.prefer = Some(origin);
        debug!(call = %call, "unmatched call; aborting its launch");
    }

    // === Event protocol ===

    /// The `next_event` primitive: takes the first matching event targeted at
    /// `me`, suspending until one arrives.
    pub(crate) fn next_event(&self, me: CoroId, ctx: ContextId, filter: EventFilter) -> Event {
        loop {
            let mut st = self.state.lock();
            if st.shutting_down {
                drop(st);
                panic_any(ExitSignal::Shutdown);
            }
            let rec = st.coro_mut(me);
            if rec.state == CoroState::Blocked {
                rec.mark_running();
            }
            if let Some(call) = st.coro(me).undisposed {
                let err = Error::new(ErrorKind::ServerRule).with_context(format!(
                    "next_event while call {call} is undisposed; accept, decline, or return it first"
                ));
                self.raise(st, err);
            }
            if let Some(event) = st.bus.take(me, filter) {
                if let Event::Call(call) = event {
                    st.call_mut(call).state = CallState::Taken;
                    st.coro_mut(me).undisposed = Some(call);
                }
                trace!(coro = %me, ?event, "event delivered");
                return event;
            }
            self.suspend(st, me, ctx, WaitPredicate::Event(filter));
        }
    }

    /// Accepts an undisposed call: dispatch ends, the consumer will return it
    /// later.
    pub(crate) fn accept_call(&self, me: CoroId, call: CallId) {
        let mut st = self.state.lock();
        if st.call(call).state != CallState::Taken {
            let err = self.bad_disposition(&st, call, "accept");
            self.raise(st, err);
        }
        debug_assert_eq!(st.coro(me).undisposed, Some(call));
        st.coro_mut(me).undisposed = None;
        st.call_mut(call).state = CallState::Accepted;
        trace!(call = %call, coro = %me, "call accepted");
    }

    /// Declines an undisposed call: dispatch resumes strictly below the watch
    /// that offered it.
    pub(crate) fn decline_call(&self, me: CoroId, call: CallId) {
        let mut st = self.state.lock();
        if st.shutting_down {
            drop(st);
            panic_any(ExitSignal::Shutdown);
        }
        if st.call(call).state != CallState::Taken {
            let err = self.bad_disposition(&st, call, "decline");
            self.raise(st, err);
        }
        debug_assert_eq!(st.coro(me).undisposed, Some(call));
        st.coro_mut(me).undisposed = None;
        let below = st.call(call).offered_at;
        trace!(call = %call, coro = %me, "call declined");
        self.dispatch_from(&mut st, call, below);
    }

    /// Fills the return slot of a call. Valid on the coroutine's undisposed
    /// call (implying accept) or on a previously accepted call.
    pub(crate) fn return_call(
        &self,
        me: CoroId,
        call: CallId,
        value: Box<dyn Any + Send>,
        value_type: TypeId,
        value_type_name: &'static str,
    ) {
        let mut st = self.state.lock();
        match st.call(call).state {
            CallState::Taken => {
                if st.coro(me).undisposed == Some(call) {
                    st.coro_mut(me).undisposed = None;
                } else {
                    let err = Error::new(ErrorKind::ServerRule).with_context(format!(
                        "call {call} is undisposed by another coroutine"
                    ));
                    self.raise(st, err);
                }
            }
            CallState::Accepted => {
                if let Some(other) = st.coro(me).undisposed {
                    let err = Error::new(ErrorKind::ServerRule).with_context(format!(
                        "returning call {call} while call {other} is undisposed"
                    ));
                    self.raise(st, err);
                }
            }
            _ => {
                let err = self.bad_disposition(&st, call, "return");
                self.raise(st, err);
            }
        }
        let sig = st.call(call).sig;
        if value_type != sig.ret_type {
            let err = Error::new(ErrorKind::TypeMismatch).with_context(format!(
                "{}::{} returns {}, got {value_type_name}",
                sig.mock_name, sig.method_name, sig.ret_type_name
            ));
            self.raise(st, err);
        }
        let origin = st.call(call).origin_coro;
        {
            let record = st.call_mut(call);
            record.ret = Some(value);
            record.state = CallState::Returned;
        }
        st.prefer = Some(origin);
        trace!(call = %call, "return slot filled");
    }

    fn bad_disposition(&self, st: &KernelState, call: CallId, op: &str) -> Error {
        Error::new(ErrorKind::InvalidHandle).with_context(format!(
            "{op} on call {call} in state {:?}",
            st.call(call).state
        ))
    }

    // === Results ===

    /// Waits for and collects a completion. `from` restricts collection to a
    /// single launch, which must be owned by `me`.
    ///
    /// Returns `Some(launch)` for a value-bearing completion, `None` for an
    /// aborted launch. A panicked CUT is re-raised here.
    pub(crate) fn collect_result(
        &self,
        me: CoroId,
        ctx: ContextId,
        from: Option<LaunchId>,
    ) -> Option<LaunchId> {
        if let Some(launch) = from {
            let st = self.state.lock();
            let owner = st.launch(launch).owner;
            if owner != me {
                let err = Error::new(ErrorKind::WrongCollector).with_context(format!(
                    "launch {launch} belongs to coroutine '{}'",
                    st.coro(owner).name
                ));
                self.raise(st, err);
            }
            if st.launch(launch).state == LaunchState::Collected {
                let err = Error::new(ErrorKind::InvalidHandle)
                    .with_context(format!("launch {launch} was already collected"));
                self.raise(st, err);
            }
        }
        let event = self.next_event(me, ctx, EventFilter::ResultsOnly { from });
        let Event::LaunchDone(launch) = event else {
            unreachable!("results-only filter yielded a call")
        };
        self.finish_collect(launch)
    }

    /// Marks a completion collected and surfaces its outcome.
    pub(crate) fn finish_collect(&self, launch: LaunchId) -> Option<LaunchId> {
        let mut st = self.state.lock();
        st.launch_mut(launch).state = LaunchState::Collected;
        debug!(launch = %launch, "result collected");
        match st.launch_mut(launch).outcome {
            Some(LaunchOutcome::Panicked(ref mut payload)) => {
                let payload = payload.take().expect("panic payload re-raised once");
                drop(st);
                resume_unwind(payload);
            }
            Some(LaunchOutcome::Aborted) => None,
            Some(LaunchOutcome::Value(_)) => Some(launch),
            None => unreachable!("completed launch carries an outcome"),
        }
    }

    /// Moves the result value out of a collected launch, checking the
    /// requested type against the session's declared result type.
    pub(crate) fn take_result_value(
        &self,
        launch: LaunchId,
        want_type: TypeId,
        want_type_name: &'static str,
    ) -> Box<dyn Any + Send> {
        let mut st = self.state.lock();
        if st.launch(launch).ret_type != want_type {
            let err = Error::new(ErrorKind::TypeMismatch).with_context(format!(
                "launch {launch} produces {}, asked for {want_type_name}",
                st.launch(launch).ret_type_name
            ));
            self.raise(st, err);
        }
        let record = st.launch_mut(launch);
        let taken = match record.outcome {
            Some(LaunchOutcome::Value(ref mut value)) => value.take(),
            _ => None,
        };
        match taken {
            Some(value) => value,
            None => {
                let err = Error::new(ErrorKind::InvalidHandle).with_context(format!(
                    "no result value available for launch {launch} (missing, aborted, or already taken)"
                ));
                self.raise(st, err);
            }
        }
    }

    // === End of test ===

    /// Winds the test down, joins coroutine threads, runs verification, and
    /// reports accumulated failures.
    ///
    /// Called exactly once, on the main thread, after the test body returned
    /// or unwound.
    pub(crate) fn finish(
        &self,
        main: CoroId,
        body_result: Result<(), Box<dyn Any + Send>>,
    ) {
        let mut user_panic: Option<Box<dyn Any + Send>> = None;
        {
            let mut st = self.state.lock();
            match body_result {
                Ok(()) => st.coro_mut(main).satisfied = true,
                Err(payload) => match payload.downcast::<ExitSignal>() {
                    Ok(signal) => {
                        if *signal == ExitSignal::Exit {
                            st.coro_mut(main).satisfied = true;
                        }
                        // Shutdown: the failure that caused it is already in
                        // the sink.
                    }
                    Err(payload) => {
                        st.coro_mut(main).satisfied = true;
                        user_panic = Some(payload);
                    }
                },
            }
            st.coro_mut(main).mark_exited();
            st.shutting_down = true;
        }

        // Resume every still-live coroutine so it can unwind; each hands the
        // baton onward through the shutdown rule and back to the main thread.
        loop {
            let target = {
                let mut st = self.state.lock();
                let found = st
                    .coros
                    .iter()
                    .find(|(_, rec)| rec.state != CoroState::Exited)
                    .map(|(_, rec)| (rec.id, rec.ctx));
                if let Some((id, _)) = found {
                    st.current = id;
                }
                found
            };
            match target {
                Some((_, ctx)) => self.baton.pass(MAIN_CONTEXT, ctx),
                None => break,
            }
        }

        let threads = {
            let mut st = self.state.lock();
            std::mem::take(&mut st.threads)
        };
        for handle in threads {
            let _ = handle.join();
        }

        let (failures, fatal_payload) = {
            let mut st = self.state.lock();
            let fatal_payload = st.fatal_payload.take();
            if fatal_payload.is_some() {
                // Main was interrupted by another coroutine's programming
                // error; its forced unwind is not a cardinality failure.
                st.coro_mut(main).satisfied = true;
            }
            let mut failures = std::mem::take(&mut st.failures);
            for (_, rec) in st.coros.iter() {
                if !rec.satisfied {
                    failures.push(Error::new(ErrorKind::UnsatisfiedCoroutine).with_context(
                        format!("coroutine '{}' ended without being satisfied", rec.name),
                    ));
                }
            }
            for (_, record) in st.launches.iter() {
                if record.state != LaunchState::Collected {
                    failures.push(Error::new(ErrorKind::UncollectedLaunch).with_context(
                        format!(
                            "launch {} (result type {}) was never collected",
                            record.id, record.ret_type_name
                        ),
                    ));
                }
            }
            failures.extend(st.chain.verify_hosts());
            (failures, fatal_payload)
        };

        // A programming error raised on a secondary coroutine fails the test
        // with its own payload, exactly as one raised in the main body does.
        if let Some(payload) = fatal_payload {
            if !failures.is_empty() {
                eprintln!(
                    "cotest: additional failures in '{}':\n{}",
                    self.name,
                    render_failures(&failures)
                );
            }
            resume_unwind(payload);
        }
        if let Some(payload) = user_panic {
            if !failures.is_empty() {
                eprintln!(
                    "cotest: additional failures in '{}':\n{}",
                    self.name,
                    render_failures(&failures)
                );
            }
            resume_unwind(payload);
        }
        if !failures.is_empty() {
            panic!(
                "cotest: test '{}' failed:\n{}",
                self.name,
                render_failures(&failures)
            );
        }
    }
}

/// Silences the default panic printout for [`ExitSignal`] unwinds, which are
/// control flow rather than failures. Installed once per process; all other
/// panics go to the previously installed hook.
fn install_panic_hook() {
    use std::sync::Once;
    static HOOK: Once = Once::new();
    HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            if info.payload().downcast_ref::<ExitSignal>().is_none() {
                previous(info);
            }
        }));
    });
}

fn render_failures(failures: &[Error]) -> String {
    failures
        .iter()
        .map(|e| format!("  - {e}"))
        .collect::<Vec<_>>()
        .join("\n")
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        String::from("non-string panic payload")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelConfig;

    #[test]
    fn new_kernel_has_running_main() {
        let (kernel, main) = Kernel::new("t", KernelConfig::default());
        let st = kernel.state.lock();
        assert_eq!(st.current, main);
        assert_eq!(st.coro(main).state, CoroState::Running);
        assert_eq!(st.coro(main).role, CoroRole::Test);
    }

    #[test]
    fn registration_hands_out_sequential_ids() {
        let (kernel, _) = Kernel::new("t", KernelConfig::default());
        let mock = kernel.register_mock("Turtle");
        let a = kernel.register_method(
            mock,
            "Turtle",
            "pen_up",
            TypeId::of::<()>(),
            "()",
            0,
        );
        let b = kernel.register_method(
            mock,
            "Turtle",
            "forward",
            TypeId::of::<()>(),
            "()",
            1,
        );
        assert_ne!(a, b);
        assert_eq!(kernel.method_sig(a).method_name, "pen_up");
        assert_eq!(kernel.method_sig(b).arity, 1);
    }

    #[test]
    fn raise_records_the_programming_error() {
        let (kernel, _) = Kernel::new("t", KernelConfig::default());
        let unwound = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            kernel.raise_usage(Error::new(ErrorKind::ServerRule).with_context("site"));
        }));
        assert!(unwound.is_err());
        let st = kernel.state.lock();
        let pending = st.pending_programming_error.as_ref().expect("recorded");
        assert_eq!(pending.kind(), ErrorKind::ServerRule);
        assert!(pending.is_programming_error());
    }

    #[test]
    fn deadlock_report_lists_waiters() {
        let (kernel, main) = Kernel::new("t", KernelConfig::default());
        {
            let mut st = kernel.state.lock();
            st.coro_mut(main)
                .mark_blocked(WaitPredicate::Event(EventFilter::Any));
        }
        let mut st = kernel.state.lock();
        kernel.report_deadlock(&mut st);
        assert_eq!(st.failures.len(), 1);
        assert_eq!(st.failures[0].kind(), ErrorKind::Deadlock);
        assert!(st.failures[0].to_string().contains("'main'"));
    }
}
