//! Identifier types for kernel entities.
//!
//! Handles and internal tables refer to coroutines, launch sessions, mock
//! calls, mock objects, and mock methods by typed ids. Record ids wrap arena
//! indices; mock-layer ids are plain per-kernel counters.

use crate::util::ArenaIndex;
use core::fmt;

/// Identifier of a coroutine record.
///
/// Both test coroutines and launch coroutines carry a `CoroId`; the role is
/// part of the record, not the id.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CoroId(pub(crate) ArenaIndex);

impl CoroId {
    pub(crate) const fn from_arena(index: ArenaIndex) -> Self {
        Self(index)
    }

    pub(crate) const fn arena_index(self) -> ArenaIndex {
        self.0
    }

    /// Builds an id for unit tests that only need a distinct value.
    #[doc(hidden)]
    #[must_use]
    pub const fn new_for_test(slot: u32, generation: u32) -> Self {
        Self(ArenaIndex::new(slot, generation))
    }
}

impl fmt::Debug for CoroId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CoroId({}:{})", self.0.slot(), self.0.generation())
    }
}

impl fmt::Display for CoroId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "C{}", self.0.slot())
    }
}

/// Identifier of a launch session.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LaunchId(pub(crate) ArenaIndex);

impl LaunchId {
    pub(crate) const fn from_arena(index: ArenaIndex) -> Self {
        Self(index)
    }

    pub(crate) const fn arena_index(self) -> ArenaIndex {
        self.0
    }

    /// Builds an id for unit tests that only need a distinct value.
    #[doc(hidden)]
    #[must_use]
    pub const fn new_for_test(slot: u32, generation: u32) -> Self {
        Self(ArenaIndex::new(slot, generation))
    }
}

impl fmt::Debug for LaunchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LaunchId({}:{})", self.0.slot(), self.0.generation())
    }
}

impl fmt::Display for LaunchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0.slot())
    }
}

/// Identifier of a mock-call record.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CallId(pub(crate) ArenaIndex);

impl CallId {
    pub(crate) const fn from_arena(index: ArenaIndex) -> Self {
        Self(index)
    }

    pub(crate) const fn arena_index(self) -> ArenaIndex {
        self.0
    }

    /// Builds an id for unit tests that only need a distinct value.
    #[doc(hidden)]
    #[must_use]
    pub const fn new_for_test(slot: u32, generation: u32) -> Self {
        Self(ArenaIndex::new(slot, generation))
    }
}

impl fmt::Debug for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CallId({}:{})", self.0.slot(), self.0.generation())
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "K{}", self.0.slot())
    }
}

/// Identifier of a mock object within one kernel.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MockId(pub(crate) u32);

impl MockId {
    pub(crate) const fn new(raw: u32) -> Self {
        Self(raw)
    }
}

impl fmt::Debug for MockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MockId({})", self.0)
    }
}

impl fmt::Display for MockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "M{}", self.0)
    }
}

/// Identifier of a mock method within one kernel.
///
/// Method ids are global across mock objects; the owning [`MockId`] lives in
/// the method's signature descriptor.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MethodId(pub(crate) u32);

impl MethodId {
    pub(crate) const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub(crate) const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for MethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MethodId({})", self.0)
    }
}

impl fmt::Display for MethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "F{}", self.0)
    }
}
