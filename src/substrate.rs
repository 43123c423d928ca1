//! Coroutine substrate: pass-the-baton execution contexts on OS threads.
//!
//! Every coroutine runs on its own thread, but the [`Baton`] guarantees that
//! exactly one context executes at a time: a context runs only while it holds
//! the baton, and suspends by naming the next holder. The mutex protecting
//! the holder provides the acquire/release edge across every switch, so a
//! resumed context sees all writes made by the context that resumed it.
//!
//! FIFO fairness is not provided and not needed; the kernel always names the
//! next holder explicitly.

use parking_lot::{Condvar, Mutex};

/// Identifier of an execution context within one kernel.
///
/// Context 0 is the thread that entered the test body.
pub type ContextId = usize;

/// The context of the thread driving the test.
pub const MAIN_CONTEXT: ContextId = 0;

#[derive(Debug)]
struct Holder {
    current: ContextId,
}

/// The single-active-context token.
#[derive(Debug)]
pub struct Baton {
    holder: Mutex<Holder>,
    changed: Condvar,
}

impl Default for Baton {
    fn default() -> Self {
        Self::new()
    }
}

impl Baton {
    /// Creates a baton initially held by [`MAIN_CONTEXT`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            holder: Mutex::new(Holder {
                current: MAIN_CONTEXT,
            }),
            changed: Condvar::new(),
        }
    }

    /// Blocks until the baton names `me` for the first time.
    ///
    /// Called by a freshly spawned context before running its entry.
    pub fn acquire(&self, me: ContextId) {
        let mut holder = self.holder.lock();
        while holder.current != me {
            self.changed.wait(&mut holder);
        }
    }

    /// Hands the baton from `me` to `to` and blocks until it comes back.
    ///
    /// This is the symmetric transfer: the caller suspends, `to` resumes.
    pub fn pass(&self, me: ContextId, to: ContextId) {
        let mut holder = self.holder.lock();
        debug_assert_eq!(
            holder.current, me,
            "baton passed by a context that does not hold it"
        );
        holder.current = to;
        self.changed.notify_all();
        while holder.current != me {
            self.changed.wait(&mut holder);
        }
    }

    /// Hands the baton from `me` to `to` without waiting for it back.
    ///
    /// Used on the exit path: the releasing context's thread returns
    /// immediately afterwards.
    pub fn release(&self, me: ContextId, to: ContextId) {
        let mut holder = self.holder.lock();
        debug_assert_eq!(
            holder.current, me,
            "baton released by a context that does not hold it"
        );
        holder.current = to;
        self.changed.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn pass_round_trip_orders_writes() {
        let baton = Arc::new(Baton::new());
        let step = Arc::new(AtomicUsize::new(0));

        let b = baton.clone();
        let s = step.clone();
        let child = std::thread::spawn(move || {
            b.acquire(1);
            assert_eq!(s.load(Ordering::Relaxed), 1);
            s.store(2, Ordering::Relaxed);
            b.release(1, MAIN_CONTEXT);
        });

        step.store(1, Ordering::Relaxed);
        baton.pass(MAIN_CONTEXT, 1);
        assert_eq!(step.load(Ordering::Relaxed), 2);
        child.join().expect("child thread");
    }

    #[test]
    fn three_way_chain() {
        let baton = Arc::new(Baton::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut children = Vec::new();
        for ctx in [1_usize, 2] {
            let b = baton.clone();
            let o = order.clone();
            children.push(std::thread::spawn(move || {
                b.acquire(ctx);
                o.lock().push(ctx);
                // 1 forwards to 2; 2 hands back to main.
                let next = if ctx == 1 { 2 } else { MAIN_CONTEXT };
                b.release(ctx, next);
            }));
        }

        baton.pass(MAIN_CONTEXT, 1);
        assert_eq!(*order.lock(), vec![1, 2]);
        for child in children {
            child.join().expect("child thread");
        }
    }
}
