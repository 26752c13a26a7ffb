//! Per-thread accumulation of lock-set and touch information.
//!
//! Each monitored thread owns one [`ThreadTracker`]. Only that thread feeds it;
//! the analysis thread periodically [drains](ThreadTracker::drain) it.

use std::sync::Arc;

use hashbrown::{HashMap, HashSet};
use log::{debug, trace};

use crate::locktree::LockStack;
use crate::registry::{FieldId, LockId, LockTable, ObjectId};
use crate::utils::ThreadInfo;

pub type LockSet = HashSet<LockId>;

/// What a thread observed since the previous drain.
#[derive(Debug)]
pub struct Drained {
    pub thread: ThreadInfo,
    pub is_ui_thread: bool,
    pub static_lock_sets: HashMap<FieldId, LockSet>,
    pub lock_sets: HashMap<ObjectId, HashMap<FieldId, LockSet>>,
    pub static_touched: HashSet<FieldId>,
    pub touched: HashMap<ObjectId, HashSet<FieldId>>,
    pub stacks: HashSet<LockStack>,
}

impl Drained {
    pub fn is_empty(&self) -> bool {
        self.static_lock_sets.is_empty()
            && self.lock_sets.is_empty()
            && self.static_touched.is_empty()
            && self.touched.is_empty()
            && self.stacks.is_empty()
    }
}

pub struct ThreadTracker {
    thread: ThreadInfo,
    is_ui_thread: bool,
    lock_table: Arc<LockTable>,
    // acquisition count per canonical lock, for reentrant locking
    held: HashMap<LockId, usize>,
    stack: LockStack,
    stacks: HashSet<LockStack>,
    static_lock_sets: HashMap<FieldId, LockSet>,
    lock_sets: HashMap<ObjectId, HashMap<FieldId, LockSet>>,
    static_touched: HashSet<FieldId>,
    touched: HashMap<ObjectId, HashSet<FieldId>>,
    problems: u64,
}

impl ThreadTracker {
    pub fn new(thread: ThreadInfo, lock_table: Arc<LockTable>) -> Self {
        debug!("new tracker for {thread}");
        ThreadTracker {
            thread,
            is_ui_thread: false,
            lock_table,
            held: HashMap::new(),
            stack: LockStack::head(),
            stacks: HashSet::new(),
            static_lock_sets: HashMap::new(),
            lock_sets: HashMap::new(),
            static_touched: HashSet::new(),
            touched: HashMap::new(),
            problems: 0,
        }
    }

    pub fn thread(&self) -> &ThreadInfo {
        &self.thread
    }

    pub fn is_ui_thread(&self) -> bool {
        self.is_ui_thread
    }

    pub fn set_ui_thread(&mut self, is_ui: bool) {
        self.is_ui_thread = is_ui;
    }

    pub fn enter_lock(&mut self, lock: LockId) {
        let lock = self.lock_table.canonical(lock);
        let count = self.held.entry(lock).or_insert(0);
        *count += 1;
        if *count == 1 {
            self.stack = self.stack.acquire(lock);
            self.stacks.insert(self.stack.clone());
        }
        trace!("{} enter lock {lock}, stack {:?}", self.thread, self.stack);
    }

    /// Releasing a lock this thread does not hold is counted and ignored.
    pub fn leave_lock(&mut self, lock: LockId) {
        let lock = self.lock_table.canonical(lock);
        let Some(count) = self.held.get_mut(&lock) else {
            self.problems += 1;
            debug!("{} released lock {lock} it does not hold", self.thread);
            return;
        };
        *count -= 1;
        if *count == 0 {
            self.held.remove(&lock);
            self.stack = self.stack.release(lock);
            if !self.stack.is_head() {
                self.stacks.insert(self.stack.clone());
            }
        }
        trace!("{} leave lock {lock}, stack {:?}", self.thread, self.stack);
    }

    /// Records an access to `field` on `receiver`, or to a static field when
    /// there is no receiver. Accesses made while the receiver (or class) is
    /// still being constructed count as touches but leave the lock set alone.
    pub fn field_access(&mut self, field: FieldId, receiver: Option<ObjectId>, under_construction: bool) {
        match receiver {
            None => {
                self.static_touched.insert(field);
                if !under_construction {
                    intersect_into(&mut self.static_lock_sets, field, &self.held);
                }
            }
            Some(receiver) => {
                self.touched.entry(receiver).or_default().insert(field);
                if !under_construction {
                    let fields = self.lock_sets.entry(receiver).or_default();
                    intersect_into(fields, field, &self.held);
                }
            }
        }
    }

    /// Hands over everything accumulated since the previous drain. The locks
    /// currently held are physical state and stay put.
    pub fn drain(&mut self) -> Drained {
        Drained {
            thread: self.thread.clone(),
            is_ui_thread: self.is_ui_thread,
            static_lock_sets: std::mem::take(&mut self.static_lock_sets),
            lock_sets: std::mem::take(&mut self.lock_sets),
            static_touched: std::mem::take(&mut self.static_touched),
            touched: std::mem::take(&mut self.touched),
            stacks: std::mem::take(&mut self.stacks),
        }
    }

    pub fn held_locks(&self) -> LockSet {
        self.held.keys().copied().collect()
    }

    pub fn stack(&self) -> &LockStack {
        &self.stack
    }

    pub fn take_problems(&mut self) -> u64 {
        std::mem::take(&mut self.problems)
    }
}

fn intersect_into(sets: &mut HashMap<FieldId, LockSet>, field: FieldId, held: &HashMap<LockId, usize>) {
    match sets.get_mut(&field) {
        Some(set) => set.retain(|lock| held.contains_key(lock)),
        None => {
            sets.insert(field, held.keys().copied().collect());
        }
    }
}
