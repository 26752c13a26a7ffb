//! Run-wide merge of everything the thread trackers drained.
//!
//! Lock sets only ever shrink here; touch sets only ever grow. The one way to
//! forget an entry is [`MasterLockSet::purge`], which drops a collected object
//! and folds what it showed into per-field summaries.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use hashbrown::hash_map::Entry;
use hashbrown::{HashMap, HashSet};
use log::{debug, trace};

use crate::info::{DeadlockInfo, LockSetInfo, SharedFieldInfo};
use crate::locktree::LockOrderGraph;
use crate::registry::{FieldDefs, FieldId, LockTable, ObjectId};
use crate::tracker::{Drained, LockSet};
use crate::utils::{ThreadId, ThreadInfo};

type ThreadSet = HashSet<ThreadId>;

#[derive(Debug, Default)]
pub struct MasterLockSet {
    static_lock_sets: HashMap<FieldId, LockSet>,
    lock_sets: HashMap<ObjectId, HashMap<FieldId, LockSet>>,
    static_touch: HashMap<FieldId, ThreadSet>,
    touch: HashMap<ObjectId, HashMap<FieldId, ThreadSet>>,
    graph: LockOrderGraph,
    threads: HashMap<ThreadId, ThreadInfo>,
    ui_threads: HashSet<ThreadId>,

    // what collected objects left behind, per field
    lock_set_fields: HashSet<FieldId>,
    no_lock_set_fields: HashSet<FieldId>,
    retired_shared: HashSet<FieldId>,
    retired_touch: HashMap<FieldId, ThreadSet>,

    purged_total: u64,
}

impl MasterLockSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn merge(&mut self, drained: Drained) {
        let tid = drained.thread.id;
        trace!("merging batch from {}", drained.thread);
        if drained.is_ui_thread {
            self.ui_threads.insert(tid);
        } else {
            self.ui_threads.remove(&tid);
        }
        self.threads.entry(tid).or_insert(drained.thread);

        for field in drained.static_touched {
            self.static_touch.entry(field).or_default().insert(tid);
        }
        for (receiver, fields) in drained.touched {
            let touch = self.touch.entry(receiver).or_default();
            for field in fields {
                touch.entry(field).or_default().insert(tid);
            }
        }

        intersect_all(&mut self.static_lock_sets, drained.static_lock_sets);
        for (receiver, fields) in drained.lock_sets {
            intersect_all(self.lock_sets.entry(receiver).or_default(), fields);
        }

        for stack in drained.stacks {
            self.graph.add(stack);
        }
    }

    /// Forgets `object`, keeping only what its fields showed. Call it after
    /// every batch drained alongside the collection has been merged.
    pub fn purge(&mut self, object: ObjectId) -> bool {
        let touch = self.touch.remove(&object);
        let locks = self.lock_sets.remove(&object);
        let as_lock = self.graph.purge(object);
        if touch.is_none() && locks.is_none() && !as_lock {
            return false;
        }
        self.purged_total += 1;
        for (field, threads) in touch.into_iter().flatten() {
            if threads.len() > 1 {
                self.retired_shared.insert(field);
                match locks.as_ref().and_then(|l| l.get(&field)) {
                    Some(set) if set.is_empty() => {
                        self.no_lock_set_fields.insert(field);
                    }
                    Some(_) => {
                        self.lock_set_fields.insert(field);
                    }
                    None => {}
                }
            }
            self.retired_touch.entry(field).or_default().extend(threads);
        }
        debug!("purged object {object}");
        true
    }

    pub fn purged_total(&self) -> u64 {
        self.purged_total
    }

    /// Number of live objects with per-receiver entries.
    pub fn receiver_count(&self) -> usize {
        let mut ids: HashSet<ObjectId> = self.touch.keys().copied().collect();
        ids.extend(self.lock_sets.keys().copied());
        ids.len()
    }

    pub fn tracks_receiver(&self, object: ObjectId) -> bool {
        self.touch.contains_key(&object) || self.lock_sets.contains_key(&object)
    }

    pub fn graph(&self) -> &LockOrderGraph {
        &self.graph
    }

    pub fn static_lock_set(&self, field: FieldId) -> Option<&LockSet> {
        self.static_lock_sets.get(&field)
    }

    pub fn lock_set(&self, receiver: ObjectId, field: FieldId) -> Option<&LockSet> {
        self.lock_sets.get(&receiver)?.get(&field)
    }

    pub fn lock_set_info(&self, defs: &Arc<FieldDefs>) -> LockSetInfo {
        let mut statics = BTreeMap::new();
        for (field, locks) in &self.static_lock_sets {
            if is_shared(self.static_touch.get(field)) {
                statics.insert(*field, sorted(locks));
            }
        }
        let mut instances: BTreeMap<FieldId, BTreeMap<ObjectId, BTreeSet<_>>> = BTreeMap::new();
        for (receiver, fields) in &self.lock_sets {
            let touch = self.touch.get(receiver);
            for (field, locks) in fields {
                if is_shared(touch.and_then(|t| t.get(field))) {
                    instances.entry(*field).or_default().insert(*receiver, sorted(locks));
                }
            }
        }
        LockSetInfo {
            defs: Arc::clone(defs),
            statics,
            instances,
            lock_set_fields: sorted(&self.lock_set_fields),
            no_lock_set_fields: sorted(&self.no_lock_set_fields),
        }
    }

    pub fn shared_field_info(&self, defs: &Arc<FieldDefs>) -> SharedFieldInfo {
        let mut field_threads: BTreeMap<FieldId, BTreeSet<ThreadId>> = BTreeMap::new();
        let mut shared_fields: BTreeSet<FieldId> = sorted(&self.retired_shared);
        let mut statics = BTreeMap::new();
        let mut instances: BTreeMap<FieldId, BTreeMap<ObjectId, BTreeSet<ThreadId>>> = BTreeMap::new();

        for (field, threads) in &self.retired_touch {
            field_threads.entry(*field).or_default().extend(threads.iter().copied());
        }
        for (field, threads) in &self.static_touch {
            field_threads.entry(*field).or_default().extend(threads.iter().copied());
            if threads.len() > 1 {
                shared_fields.insert(*field);
                statics.insert(*field, sorted(threads));
            }
        }
        for (receiver, fields) in &self.touch {
            for (field, threads) in fields {
                field_threads.entry(*field).or_default().extend(threads.iter().copied());
                if threads.len() > 1 {
                    shared_fields.insert(*field);
                    instances.entry(*field).or_default().insert(*receiver, sorted(threads));
                }
            }
        }

        SharedFieldInfo {
            defs: Arc::clone(defs),
            statics,
            instances,
            shared_fields,
            field_threads,
            ui_threads: sorted(&self.ui_threads),
            threads: self.threads.iter().map(|(id, info)| (*id, info.clone())).collect(),
        }
    }

    pub fn deadlock_info(&self, locks: &LockTable) -> DeadlockInfo {
        let lock_order_edges = self.graph.edges();
        let cycles = self.graph.cycles();
        let cycle_lock_ids = self.graph.cycle_locks();

        // a chain that is a prefix of a longer recorded chain adds nothing;
        // in sorted order its extensions come right after it
        let chains: BTreeSet<Vec<_>> = self.graph.stacks().map(|s| s.locks()).collect();
        let mut lock_orders: Vec<Vec<_>> = Vec::new();
        let mut iter = chains.iter().peekable();
        while let Some(chain) = iter.next() {
            let extended = iter.peek().is_some_and(|next| next.starts_with(chain));
            if chain.len() > 1 && !extended {
                lock_orders.push(chain.clone());
            }
        }

        DeadlockInfo {
            lock_names: locks.names_for(self.graph.locks()),
            lock_order_edges,
            cycles,
            cycle_lock_ids,
            lock_orders,
        }
    }
}

fn intersect_all(into: &mut HashMap<FieldId, LockSet>, from: HashMap<FieldId, LockSet>) {
    for (field, locks) in from {
        match into.entry(field) {
            Entry::Occupied(mut e) => e.get_mut().retain(|l| locks.contains(l)),
            Entry::Vacant(e) => {
                e.insert(locks);
            }
        }
    }
}

fn is_shared(threads: Option<&ThreadSet>) -> bool {
    threads.is_some_and(|t| t.len() > 1)
}

fn sorted<T: Ord + Copy>(set: &HashSet<T>) -> BTreeSet<T> {
    set.iter().copied().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::ThreadTracker;

    fn tracker(id: ThreadId) -> ThreadTracker {
        ThreadTracker::new(ThreadInfo::new(id, None), Arc::new(LockTable::new()))
    }

    fn defs() -> Arc<FieldDefs> {
        Arc::new(FieldDefs::new())
    }

    #[test]
    fn different_locks_from_two_threads_empty_the_set() {
        let mut master = MasterLockSet::new();
        let mut t1 = tracker(1);
        let mut t2 = tracker(2);
        t1.enter_lock(10);
        t1.field_access(5, Some(100), false);
        t2.enter_lock(20);
        t2.field_access(5, Some(100), false);
        master.merge(t1.drain());
        assert_eq!(master.lock_set(100, 5).unwrap().len(), 1);
        master.merge(t2.drain());
        assert!(master.lock_set(100, 5).unwrap().is_empty());

        let info = master.lock_set_info(&defs());
        assert!(!info.has_lock_set(5));
        assert!(master.shared_field_info(&defs()).is_shared(5));
    }

    #[test]
    fn unshared_fields_stay_out_of_lock_set_report() {
        let mut master = MasterLockSet::new();
        let mut t1 = tracker(1);
        t1.field_access(5, None, false);
        master.merge(t1.drain());
        let info = master.lock_set_info(&defs());
        assert!(!info.is_observed(5));
        assert!(!master.shared_field_info(&defs()).is_shared(5));
    }

    #[test]
    fn purge_removes_receiver_and_keeps_summary() {
        let mut master = MasterLockSet::new();
        let mut t1 = tracker(1);
        let mut t2 = tracker(2);
        t1.field_access(5, Some(100), false);
        t2.field_access(5, Some(100), false);
        t1.field_access(5, Some(200), false);
        master.merge(t1.drain());
        master.merge(t2.drain());

        assert!(master.purge(100));
        assert!(!master.tracks_receiver(100));
        assert!(master.tracks_receiver(200));
        assert!(!master.purge(100));
        assert_eq!(master.purged_total(), 1);

        let locks = master.lock_set_info(&defs());
        assert!(locks.instances().get(&5).is_none());
        assert!(locks.lacks_lock_set(5));
        let shared = master.shared_field_info(&defs());
        assert!(shared.is_shared(5));
        assert_eq!(shared.touching_threads(5).unwrap().len(), 2);
    }

    #[test]
    fn purge_sees_batches_from_both_periods() {
        let mut master = MasterLockSet::new();
        let mut t1 = tracker(1);
        let mut t2 = tracker(2);
        t1.enter_lock(10);
        t1.field_access(5, Some(100), false);
        master.merge(t1.drain());
        t2.enter_lock(20);
        t2.field_access(5, Some(100), false);
        master.merge(t2.drain());
        assert!(master.purge(100));

        assert!(master.lock_set_info(&defs()).lacks_lock_set(5));
        assert!(master.shared_field_info(&defs()).is_shared(5));
    }

    #[test]
    fn purging_a_lock_object_drops_its_orderings() {
        let mut master = MasterLockSet::new();
        let mut t1 = tracker(1);
        t1.enter_lock(1);
        t1.enter_lock(2);
        let mut t2 = tracker(2);
        t2.enter_lock(2);
        t2.enter_lock(1);
        master.merge(t1.drain());
        master.merge(t2.drain());
        assert!(master.purge(1));
        let info = master.deadlock_info(&LockTable::new());
        assert!(!info.has_deadlocks());
        assert!(info.lock_order_edges.is_empty());
        assert_eq!(master.purged_total(), 1);
    }

    #[test]
    fn lock_orders_over_a_long_chain() {
        const N: u64 = 50_000;
        let mut master = MasterLockSet::new();
        let mut t1 = tracker(1);
        t1.enter_lock(0);
        for i in 1..N {
            t1.enter_lock(i);
            t1.leave_lock(i - 1);
        }
        master.merge(t1.drain());
        let info = master.deadlock_info(&LockTable::new());
        assert_eq!(info.lock_orders.len(), (N - 1) as usize);
        assert!(!info.has_deadlocks());
        assert_eq!(info.lock_order_edges.len(), (N - 1) as usize);
    }

    #[test]
    fn prefix_chains_are_folded_into_longer_ones() {
        let mut master = MasterLockSet::new();
        let mut t1 = tracker(1);
        t1.enter_lock(1);
        t1.enter_lock(2);
        t1.enter_lock(3);
        t1.leave_lock(3);
        t1.leave_lock(2);
        t1.enter_lock(4);
        master.merge(t1.drain());
        let info = master.deadlock_info(&LockTable::new());
        assert_eq!(info.lock_orders, vec![vec![1, 2, 3], vec![1, 4]]);
    }

    #[test]
    fn opposite_nesting_is_a_cycle() {
        let mut master = MasterLockSet::new();
        let mut t1 = tracker(1);
        let mut t2 = tracker(2);
        t1.enter_lock(1);
        t1.enter_lock(2);
        t2.enter_lock(2);
        t2.enter_lock(1);
        master.merge(t1.drain());
        master.merge(t2.drain());
        let table = LockTable::new();
        table.name_lock(1, "A");
        let info = master.deadlock_info(&table);
        assert!(info.lock_order_edges.contains(&(1, 2)));
        assert!(info.lock_order_edges.contains(&(2, 1)));
        assert_eq!(info.cycle_lock_ids, [1, 2].into_iter().collect());
        assert_eq!(info.cycles, vec![vec![1, 2]]);
        assert_eq!(info.lock_orders, vec![vec![1, 2], vec![2, 1]]);
        assert_eq!(info.lock_name(1), "A");
    }

    #[test]
    fn ui_threads_are_remembered() {
        let mut master = MasterLockSet::new();
        let mut ui = tracker(1);
        ui.set_ui_thread(true);
        ui.field_access(9, Some(1), false);
        let mut worker = tracker(2);
        worker.field_access(8, Some(1), false);
        master.merge(ui.drain());
        master.merge(worker.drain());
        let shared = master.shared_field_info(&defs());
        assert!(!shared.escapes_ui_thread(9));
        assert!(shared.escapes_ui_thread(8));

        ui.set_ui_thread(false);
        master.merge(ui.drain());
        assert!(master.shared_field_info(&defs()).escapes_ui_thread(9));
    }
}
