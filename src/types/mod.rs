//! Core identifier types.

mod id;

pub use id::{CallId, CoroId, LaunchId, MethodId, MockId};
