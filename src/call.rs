//! Mock-call records and the dynamic argument model.
//!
//! A mock method stub packages its argument tuple as a [`Box<dyn ArgBundle>`]
//! and hands it to the kernel together with the method's
//! [`SignatureDesc`]. The record then carries the call through dispatch:
//! offered to a coroutine, taken by `next_event`, accepted or declined, and
//! finally returned (the return slot filled) or failed (no consumer).

use crate::types::{CallId, CoroId, LaunchId, MethodId, MockId};
use core::any::{Any, TypeId};
use core::fmt;

/// An argument tuple, seen dynamically.
///
/// Implemented for tuples of up to six elements where every element is
/// `Clone + Debug + Send + 'static`. Cloning per element supports the erased
/// `arg` accessor on call handles; `Debug` feeds diagnostics such as
/// unmatched-call reports.
pub trait ArgBundle: Any + Send {
    /// Number of arguments.
    fn arity(&self) -> usize;

    /// Borrow of the `index`-th argument, or `None` out of range.
    fn arg(&self, index: usize) -> Option<&dyn Any>;

    /// Clone of the `index`-th argument, or `None` out of range.
    fn arg_cloned(&self, index: usize) -> Option<Box<dyn Any + Send>>;

    /// Debug rendering of the `index`-th argument.
    fn arg_debug(&self, index: usize) -> Option<String>;

    /// Upcast for downcasting to the concrete tuple.
    fn as_any(&self) -> &dyn Any;
}

/// Compile-time side of [`ArgBundle`], for code generic over the tuple type.
///
/// Separate from `ArgBundle` so the latter stays object-safe.
pub trait ArgSpec: ArgBundle + Sized {
    /// Number of arguments in the tuple.
    const ARITY: usize;
}

macro_rules! impl_arg_bundle {
    ($len:expr $(, $name:ident : $idx:tt)*) => {
        impl<$($name,)*> ArgSpec for ($($name,)*)
        where
            $($name: Clone + fmt::Debug + Send + 'static,)*
        {
            const ARITY: usize = $len;
        }

        impl<$($name,)*> ArgBundle for ($($name,)*)
        where
            $($name: Clone + fmt::Debug + Send + 'static,)*
        {
            fn arity(&self) -> usize {
                $len
            }

            #[allow(unused_variables)]
            fn arg(&self, index: usize) -> Option<&dyn Any> {
                match index {
                    $($idx => Some(&self.$idx),)*
                    _ => None,
                }
            }

            #[allow(unused_variables)]
            fn arg_cloned(&self, index: usize) -> Option<Box<dyn Any + Send>> {
                match index {
                    $($idx => Some(Box::new(self.$idx.clone())),)*
                    _ => None,
                }
            }

            #[allow(unused_variables)]
            fn arg_debug(&self, index: usize) -> Option<String> {
                match index {
                    $($idx => Some(format!("{:?}", self.$idx)),)*
                    _ => None,
                }
            }

            fn as_any(&self) -> &dyn Any {
                self
            }
        }
    };
}

impl_arg_bundle!(0);
impl_arg_bundle!(1, A0: 0);
impl_arg_bundle!(2, A0: 0, A1: 1);
impl_arg_bundle!(3, A0: 0, A1: 1, A2: 2);
impl_arg_bundle!(4, A0: 0, A1: 1, A2: 2, A3: 3);
impl_arg_bundle!(5, A0: 0, A1: 1, A2: 2, A3: 3, A4: 4);
impl_arg_bundle!(6, A0: 0, A1: 1, A2: 2, A3: 3, A4: 4, A5: 5);

/// Static description of one mock method's signature.
///
/// Registered when the method is created; copied into every call record so
/// diagnostics and typed-return checks need no table lookup.
#[derive(Debug, Clone, Copy)]
pub struct SignatureDesc {
    /// Owning mock object.
    pub mock: MockId,
    /// The method.
    pub method: MethodId,
    /// Mock object display name.
    pub mock_name: &'static str,
    /// Method display name.
    pub method_name: &'static str,
    /// Type of the method's return value.
    pub ret_type: TypeId,
    /// Display name of the return type.
    pub ret_type_name: &'static str,
    /// Number of arguments.
    pub arity: usize,
}

/// Where a call record stands in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    /// Sitting in some coroutine's inbox after a watch matched.
    Offered,
    /// Pulled by `next_event`; awaiting accept, decline, or return.
    Taken,
    /// Accepted; the consumer will fill the return slot later.
    Accepted,
    /// Return slot filled; the issuing launch may resume.
    Returned,
    /// No consumer; the issuing launch is aborted.
    Failed,
}

/// One in-flight mock call.
pub struct CallRecord {
    /// Stable id of this record.
    pub id: CallId,
    /// The method's signature.
    pub sig: SignatureDesc,
    /// Captured argument tuple.
    pub args: Box<dyn ArgBundle>,
    /// Launch session the call was issued from.
    pub origin_launch: LaunchId,
    /// Launch coroutine the call was issued from.
    pub origin_coro: CoroId,
    /// Lifecycle state.
    pub state: CallState,
    /// Filled by `ret`/host fire; consumed by the blocked stub.
    pub ret: Option<Box<dyn Any + Send>>,
    /// Handler-chain length at dispatch start. Entries added later are
    /// invisible to this call.
    pub chain_snapshot: usize,
    /// Chain index of the watch that last offered this call; a decline
    /// resumes the walk strictly below it.
    pub offered_at: usize,
}

impl CallRecord {
    /// Renders the call as `Mock::method(args...)` for diagnostics.
    #[must_use]
    pub fn describe(&self) -> String {
        let mut out = format!("{}::{}(", self.sig.mock_name, self.sig.method_name);
        for index in 0..self.args.arity() {
            if index > 0 {
                out.push_str(", ");
            }
            match self.args.arg_debug(index) {
                Some(text) => out.push_str(&text),
                None => out.push('?'),
            }
        }
        out.push(')');
        out
    }
}

impl fmt::Debug for CallRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallRecord")
            .field("id", &self.id)
            .field("call", &self.describe())
            .field("origin", &self.origin_launch)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}
