//! Arena of kernel records with generation-checked indices.
//!
//! Coroutines, launch sessions, and mock calls are tracked as records in a
//! per-test kernel. Handles refer to records by [`ArenaIndex`] rather than by
//! pointer; the generation counter makes a stale handle observable instead of
//! silently aliasing a reused slot.

use core::fmt;
use core::hash::{Hash, Hasher};

/// An index into an [`Arena`], tagged with the slot's generation.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ArenaIndex {
    slot: u32,
    generation: u32,
}

impl ArenaIndex {
    /// Builds an index from raw parts (used by tests and id constructors).
    #[must_use]
    pub const fn new(slot: u32, generation: u32) -> Self {
        Self { slot, generation }
    }

    /// Raw slot number.
    #[must_use]
    pub const fn slot(self) -> u32 {
        self.slot
    }

    /// Generation the index was minted at.
    #[must_use]
    pub const fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Debug for ArenaIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ArenaIndex({}:{})", self.slot, self.generation)
    }
}

impl Hash for ArenaIndex {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64((u64::from(self.slot) << 32) | u64::from(self.generation));
    }
}

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    payload: Payload<T>,
}

#[derive(Debug)]
enum Payload<T> {
    Full(T),
    Free { next: Option<u32> },
}

/// Generational arena.
///
/// Insertion returns a stable [`ArenaIndex`]; removal bumps the slot's
/// generation so indices minted earlier stop resolving. Iteration visits live
/// records in slot order, which for a kernel that never removes records during
/// a test equals creation order.
#[derive(Debug)]
pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    free_head: Option<u32>,
    len: usize,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Arena<T> {
    /// Creates an empty arena.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_head: None,
            len: 0,
        }
    }

    /// Number of live records.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// True when no record is live.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Inserts a record and returns its index.
    pub fn insert(&mut self, value: T) -> ArenaIndex {
        self.insert_with(|_| value)
    }

    /// Inserts a record built from the index it will occupy.
    ///
    /// Useful for records that carry their own id.
    pub fn insert_with(&mut self, build: impl FnOnce(ArenaIndex) -> T) -> ArenaIndex {
        self.len += 1;
        if let Some(slot) = self.free_head {
            let entry = &mut self.slots[slot as usize];
            let Payload::Free { next } = entry.payload else {
                unreachable!("free head points at a live slot");
            };
            self.free_head = next;
            let index = ArenaIndex::new(slot, entry.generation);
            entry.payload = Payload::Full(build(index));
            index
        } else {
            let slot = u32::try_from(self.slots.len()).expect("arena slot count overflow");
            let index = ArenaIndex::new(slot, 0);
            self.slots.push(Slot {
                generation: 0,
                payload: Payload::Full(build(index)),
            });
            index
        }
    }

    /// Resolves an index to a shared reference, or `None` if stale.
    #[must_use]
    pub fn get(&self, index: ArenaIndex) -> Option<&T> {
        match self.slots.get(index.slot as usize) {
            Some(Slot {
                generation,
                payload: Payload::Full(value),
            }) if *generation == index.generation => Some(value),
            _ => None,
        }
    }

    /// Resolves an index to an exclusive reference, or `None` if stale.
    #[must_use]
    pub fn get_mut(&mut self, index: ArenaIndex) -> Option<&mut T> {
        match self.slots.get_mut(index.slot as usize) {
            Some(Slot {
                generation,
                payload: Payload::Full(value),
            }) if *generation == index.generation => Some(value),
            _ => None,
        }
    }

    /// Removes a record, returning it if the index was live.
    pub fn remove(&mut self, index: ArenaIndex) -> Option<T> {
        let entry = self.slots.get_mut(index.slot as usize)?;
        if entry.generation != index.generation || matches!(entry.payload, Payload::Free { .. }) {
            return None;
        }
        entry.generation = entry.generation.wrapping_add(1);
        let payload = core::mem::replace(
            &mut entry.payload,
            Payload::Free {
                next: self.free_head,
            },
        );
        self.free_head = Some(index.slot);
        self.len -= 1;
        match payload {
            Payload::Full(value) => Some(value),
            Payload::Free { .. } => unreachable!("checked live above"),
        }
    }

    /// Iterates live records in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (ArenaIndex, &T)> {
        self.slots.iter().enumerate().filter_map(|(slot, entry)| {
            let Payload::Full(value) = &entry.payload else {
                return None;
            };
            #[allow(clippy::cast_possible_truncation)]
            Some((ArenaIndex::new(slot as u32, entry.generation), value))
        })
    }

    /// Iterates live records mutably in slot order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (ArenaIndex, &mut T)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(slot, entry)| {
                let generation = entry.generation;
                let Payload::Full(value) = &mut entry.payload else {
                    return None;
                };
                #[allow(clippy::cast_possible_truncation)]
                Some((ArenaIndex::new(slot as u32, generation), value))
            })
    }
}
