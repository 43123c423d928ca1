//! Property tests for the kernel's record stores: the generational arena and
//! the event bus's per-target ordering.

use cotest::bus::{Event, EventBus, EventFilter};
use cotest::util::{Arena, ArenaIndex};
use cotest::{CallId, CoroId};
use proptest::prelude::*;
use std::collections::HashMap;

#[derive(Debug, Clone)]
enum ArenaOp {
    Insert(u32),
    Remove(usize),
    Get(usize),
}

fn arena_op() -> impl Strategy<Value = ArenaOp> {
    prop_oneof![
        any::<u32>().prop_map(ArenaOp::Insert),
        any::<usize>().prop_map(ArenaOp::Remove),
        any::<usize>().prop_map(ArenaOp::Get),
    ]
}

proptest! {
    #[test]
    fn arena_agrees_with_a_map_model(ops in proptest::collection::vec(arena_op(), 1..64)) {
        let mut arena: Arena<u32> = Arena::new();
        let mut model: HashMap<ArenaIndex, u32> = HashMap::new();
        let mut live: Vec<ArenaIndex> = Vec::new();
        let mut dead: Vec<ArenaIndex> = Vec::new();

        for op in ops {
            match op {
                ArenaOp::Insert(value) => {
                    let index = arena.insert(value);
                    prop_assert!(!model.contains_key(&index));
                    model.insert(index, value);
                    live.push(index);
                }
                ArenaOp::Remove(selector) => {
                    if live.is_empty() {
                        continue;
                    }
                    let index = live.swap_remove(selector % live.len());
                    let expected = model.remove(&index);
                    prop_assert_eq!(arena.remove(index), expected);
                    dead.push(index);
                }
                ArenaOp::Get(selector) => {
                    if let Some(index) = live.get(selector % live.len().max(1)) {
                        prop_assert_eq!(arena.get(*index), model.get(index));
                    }
                }
            }
        }

        prop_assert_eq!(arena.len(), model.len());
        // Every removed index stays stale forever.
        for index in dead {
            prop_assert_eq!(arena.get(index), None);
        }
    }

    #[test]
    fn bus_preserves_offer_order_per_target(targets in proptest::collection::vec(0_u32..3, 1..32)) {
        let mut bus = EventBus::new();
        for (n, target) in targets.iter().enumerate() {
            bus.offer_call(
                CallId::new_for_test(u32::try_from(n).expect("small"), 0),
                CoroId::new_for_test(*target, 0),
            );
        }

        for wanted in 0_u32..3 {
            let coro = CoroId::new_for_test(wanted, 0);
            let expected: Vec<u32> = targets
                .iter()
                .enumerate()
                .filter(|(_, t)| **t == wanted)
                .map(|(n, _)| u32::try_from(n).expect("small"))
                .collect();
            let mut taken = Vec::new();
            while let Some(Event::Call(call)) = bus.take(coro, EventFilter::CallsOnly) {
                taken.push(call);
            }
            let expected: Vec<CallId> = expected
                .into_iter()
                .map(|n| CallId::new_for_test(n, 0))
                .collect();
            prop_assert_eq!(taken, expected);
        }
    }
}
