use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use proptest::prelude::*;
use solcon_monitor::aggregator::MasterLockSet;
use solcon_monitor::registry::{FieldDefs, LockTable};
use solcon_monitor::tracker::ThreadTracker;
use solcon_monitor::ThreadInfo;

const FIELD: u64 = 1;
const RECEIVER: u64 = 42;

fn locks_of(mask: u8) -> Vec<u64> {
    (0..8u64).filter(|bit| mask & (1 << bit) != 0).collect()
}

fn trackers(n: u64) -> Vec<ThreadTracker> {
    let table = Arc::new(LockTable::new());
    (1..=n).map(|id| ThreadTracker::new(ThreadInfo::new(id, None), Arc::clone(&table))).collect()
}

#[derive(Clone, Debug)]
enum Op {
    Acquire(u64),
    Release(u64),
    Access(Option<u64>),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..4u64).prop_map(Op::Acquire),
        (0..4u64).prop_map(Op::Release),
        proptest::option::of(0..3u64).prop_map(Op::Access),
    ]
}

fn apply(tracker: &mut ThreadTracker, op: &Op) {
    match op {
        Op::Acquire(lock) => tracker.enter_lock(*lock),
        Op::Release(lock) => tracker.leave_lock(*lock),
        Op::Access(receiver) => tracker.field_access(FIELD, *receiver, false),
    }
}

proptest! {
    #[test]
    fn lock_sets_only_shrink(ticks in prop::collection::vec(prop::collection::vec((0..3usize, any::<u8>()), 1..6), 1..6)) {
        let mut threads = trackers(3);
        let mut master = MasterLockSet::new();
        let mut expected: Option<BTreeSet<u64>> = None;
        let mut previous: Option<BTreeSet<u64>> = None;

        for accesses in &ticks {
            for (thread, mask) in accesses {
                let tracker = &mut threads[*thread];
                let held = locks_of(*mask);
                for lock in &held {
                    tracker.enter_lock(*lock);
                }
                tracker.field_access(FIELD, Some(RECEIVER), false);
                for lock in held.iter().rev() {
                    tracker.leave_lock(*lock);
                }
                let now: BTreeSet<u64> = locks_of(*mask).into_iter().collect();
                expected = Some(match expected {
                    Some(e) => e.intersection(&now).copied().collect(),
                    None => now,
                });
            }
            for tracker in &mut threads {
                master.merge(tracker.drain());
            }

            let current: BTreeSet<u64> = master.lock_set(RECEIVER, FIELD).unwrap().iter().copied().collect();
            prop_assert_eq!(Some(&current), expected.as_ref());
            if let Some(prev) = &previous {
                prop_assert!(current.is_subset(prev));
            }
            previous = Some(current);
        }
    }

    #[test]
    fn second_drain_is_empty(ops in prop::collection::vec(op(), 0..40)) {
        let mut tracker = trackers(1).remove(0);
        for op in &ops {
            apply(&mut tracker, op);
        }
        let held = tracker.held_locks();
        let stack = tracker.stack().clone();
        tracker.drain();
        let second = tracker.drain();
        prop_assert!(second.is_empty());
        prop_assert_eq!(tracker.held_locks(), held);
        prop_assert_eq!(tracker.stack(), &stack);
    }

    #[test]
    fn purged_receivers_stay_gone(
        accesses in prop::collection::vec((0..2usize, 0..6u64, any::<bool>()), 1..30),
        split in 0..30usize,
        collected in prop::collection::btree_set(0..6u64, 0..6),
    ) {
        let mut threads = trackers(2);
        let mut master = MasterLockSet::new();
        let mut touched_by: BTreeMap<u64, BTreeSet<usize>> = BTreeMap::new();
        let mut unlocked: BTreeSet<u64> = BTreeSet::new();
        for (i, (thread, receiver, locked)) in accesses.iter().enumerate() {
            // some accesses land in the period before the collection
            if i == split {
                for tracker in &mut threads {
                    master.merge(tracker.drain());
                }
            }
            let tracker = &mut threads[*thread];
            if *locked {
                tracker.enter_lock(1);
            }
            tracker.field_access(FIELD, Some(*receiver), false);
            if *locked {
                tracker.leave_lock(1);
            } else {
                unlocked.insert(*receiver);
            }
            touched_by.entry(*receiver).or_default().insert(*thread);
        }
        for tracker in &mut threads {
            master.merge(tracker.drain());
        }
        for id in &collected {
            master.purge(*id);
        }

        for id in &collected {
            prop_assert!(!master.tracks_receiver(*id));
        }
        for id in touched_by.keys().filter(|r| !collected.contains(r)) {
            prop_assert!(master.tracks_receiver(*id));
        }

        let defs = Arc::new(FieldDefs::new());
        let shared: Vec<u64> = touched_by.iter().filter(|(_, t)| t.len() > 1).map(|(r, _)| *r).collect();
        prop_assert_eq!(master.shared_field_info(&defs).is_shared(FIELD), !shared.is_empty());
        let lacks = shared.iter().any(|r| unlocked.contains(r));
        prop_assert_eq!(master.lock_set_info(&defs).lacks_lock_set(FIELD), lacks);
    }
}
