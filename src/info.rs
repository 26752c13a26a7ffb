//! Immutable results of one analysis cycle.
//!
//! Every type here is rebuilt from scratch on each tick and published behind an
//! `Arc`, so readers never lock anything to look at them.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use crate::interest::AlertSpec;
use crate::registry::{FieldDef, FieldDefs, FieldId, LockId, ObjectId};
use crate::utils::{ThreadId, ThreadInfo};

/// Lock sets of fields touched by more than one thread.
#[derive(Clone, Debug, Default)]
pub struct LockSetInfo {
    pub(crate) defs: Arc<FieldDefs>,
    pub(crate) statics: BTreeMap<FieldId, BTreeSet<LockId>>,
    pub(crate) instances: BTreeMap<FieldId, BTreeMap<ObjectId, BTreeSet<LockId>>>,
    // summaries of shared fields on objects that have since been collected
    pub(crate) lock_set_fields: BTreeSet<FieldId>,
    pub(crate) no_lock_set_fields: BTreeSet<FieldId>,
}

impl LockSetInfo {
    pub fn statics(&self) -> &BTreeMap<FieldId, BTreeSet<LockId>> {
        &self.statics
    }

    pub fn instances(&self) -> &BTreeMap<FieldId, BTreeMap<ObjectId, BTreeSet<LockId>>> {
        &self.instances
    }

    pub fn lock_set(&self, field: FieldId, receiver: Option<ObjectId>) -> Option<&BTreeSet<LockId>> {
        match receiver {
            None => self.statics.get(&field),
            Some(receiver) => self.instances.get(&field)?.get(&receiver),
        }
    }

    /// Whether some shared occurrence of `field`, live or collected, ended up
    /// with no lock common to all of its accesses.
    pub fn lacks_lock_set(&self, field: FieldId) -> bool {
        self.statics.get(&field).is_some_and(BTreeSet::is_empty)
            || self
                .instances
                .get(&field)
                .is_some_and(|receivers| receivers.values().any(BTreeSet::is_empty))
            || self.no_lock_set_fields.contains(&field)
    }

    /// True unless a violation has been seen. A field that was never observed
    /// shared has, as far as anyone knows, a lock set.
    pub fn has_lock_set(&self, field: FieldId) -> bool {
        !self.lacks_lock_set(field)
    }

    pub fn is_observed(&self, field: FieldId) -> bool {
        self.statics.contains_key(&field)
            || self.instances.contains_key(&field)
            || self.lock_set_fields.contains(&field)
            || self.no_lock_set_fields.contains(&field)
    }

    /// One line per receiver (or one for a static field) listing its locks.
    pub fn lock_set_report(&self, field: FieldId) -> String {
        let mut out = String::new();
        if let Some(locks) = self.statics.get(&field) {
            out.push_str(&format!("static: {}\n", fmt_ids(locks)));
        }
        if let Some(receivers) = self.instances.get(&field) {
            for (receiver, locks) in receivers {
                out.push_str(&format!("object {receiver}: {}\n", fmt_ids(locks)));
            }
        }
        if self.lock_set_fields.contains(&field) {
            out.push_str("collected objects: locked\n");
        }
        if self.no_lock_set_fields.contains(&field) {
            out.push_str("collected objects: unlocked\n");
        }
        out
    }

    /// Every observed field id, in a stable order.
    pub fn fields(&self) -> BTreeSet<FieldId> {
        self.statics
            .keys()
            .chain(self.instances.keys())
            .chain(self.lock_set_fields.iter())
            .chain(self.no_lock_set_fields.iter())
            .copied()
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.fields().is_empty()
    }
}

impl fmt::Display for LockSetInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for field in self.fields() {
            let status = if self.has_lock_set(field) { "locked" } else { "NO LOCK" };
            writeln!(f, "{} [{status}]", field_label(&self.defs, field))?;
            for line in self.lock_set_report(field).lines() {
                writeln!(f, "    {line}")?;
            }
        }
        Ok(())
    }
}

/// Which threads touched which fields, and which fields are shared.
#[derive(Clone, Debug, Default)]
pub struct SharedFieldInfo {
    pub(crate) defs: Arc<FieldDefs>,
    pub(crate) statics: BTreeMap<FieldId, BTreeSet<ThreadId>>,
    pub(crate) instances: BTreeMap<FieldId, BTreeMap<ObjectId, BTreeSet<ThreadId>>>,
    pub(crate) shared_fields: BTreeSet<FieldId>,
    pub(crate) field_threads: BTreeMap<FieldId, BTreeSet<ThreadId>>,
    pub(crate) ui_threads: BTreeSet<ThreadId>,
    pub(crate) threads: BTreeMap<ThreadId, ThreadInfo>,
}

impl SharedFieldInfo {
    /// Shared static fields and the threads that touched them.
    pub fn statics(&self) -> &BTreeMap<FieldId, BTreeSet<ThreadId>> {
        &self.statics
    }

    /// Shared (field, receiver) pairs of live objects.
    pub fn instances(&self) -> &BTreeMap<FieldId, BTreeMap<ObjectId, BTreeSet<ThreadId>>> {
        &self.instances
    }

    pub fn shared_fields(&self) -> &BTreeSet<FieldId> {
        &self.shared_fields
    }

    pub fn is_shared(&self, field: FieldId) -> bool {
        self.shared_fields.contains(&field)
    }

    pub fn is_shared_on(&self, field: FieldId, receiver: ObjectId) -> bool {
        self.instances.get(&field).is_some_and(|r| r.contains_key(&receiver))
    }

    /// Every thread that has touched `field` on any receiver.
    pub fn touching_threads(&self, field: FieldId) -> Option<&BTreeSet<ThreadId>> {
        self.field_threads.get(&field)
    }

    pub fn ui_threads(&self) -> &BTreeSet<ThreadId> {
        &self.ui_threads
    }

    pub fn thread(&self, id: ThreadId) -> Option<&ThreadInfo> {
        self.threads.get(&id)
    }

    /// Whether a thread other than a UI thread has touched `field`.
    pub fn escapes_ui_thread(&self, field: FieldId) -> bool {
        self.field_threads
            .get(&field)
            .is_some_and(|threads| threads.iter().any(|t| !self.ui_threads.contains(t)))
    }
}

impl fmt::Display for SharedFieldInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for field in &self.shared_fields {
            write!(f, "{}:", field_label(&self.defs, *field))?;
            for tid in self.field_threads.get(field).into_iter().flatten() {
                match self.threads.get(tid) {
                    Some(info) => write!(f, " {info}")?,
                    None => write!(f, " thread#{tid}")?,
                }
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

/// Lock nesting observed so far and the ordering cycles in it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeadlockInfo {
    pub lock_order_edges: BTreeSet<(LockId, LockId)>,
    /// Minimal cycles, each starting at its smallest lock id.
    pub cycles: Vec<Vec<LockId>>,
    pub cycle_lock_ids: BTreeSet<LockId>,
    /// Distinct nesting chains, outermost lock first.
    pub lock_orders: Vec<Vec<LockId>>,
    pub lock_names: BTreeMap<LockId, String>,
}

impl DeadlockInfo {
    pub fn has_deadlocks(&self) -> bool {
        !self.cycle_lock_ids.is_empty()
    }

    pub fn lock_name(&self, id: LockId) -> String {
        self.lock_names.get(&id).cloned().unwrap_or_else(|| format!("lock#{id}"))
    }

    /// `a -> b -> c` using display names.
    pub fn render_chain(&self, chain: &[LockId]) -> String {
        chain.iter().map(|id| self.lock_name(*id)).collect::<Vec<_>>().join(" -> ")
    }
}

impl fmt::Display for DeadlockInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Lock Orderings:")?;
        for chain in &self.lock_orders {
            writeln!(f, "    {}", self.render_chain(chain))?;
        }
        writeln!(f, "Potential Deadlocks:")?;
        if self.cycles.is_empty() {
            writeln!(f, "    none")?;
        }
        for cycle in &self.cycles {
            let mut closed = cycle.clone();
            closed.extend(cycle.first().copied());
            writeln!(f, "    {}", self.render_chain(&closed))?;
        }
        Ok(())
    }
}

/// Fields in violation of the active alert selection.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AlertInfo {
    pub edt_violations: BTreeSet<Arc<FieldDef>>,
    pub shared_violations: BTreeSet<Arc<FieldDef>>,
    pub lockset_violations: BTreeSet<Arc<FieldDef>>,
}

impl AlertInfo {
    pub fn evaluate(spec: &AlertSpec, defs: &FieldDefs, shared: &SharedFieldInfo, lock_sets: &LockSetInfo) -> Self {
        let pick = |fields: &hashbrown::HashSet<FieldId>, violated: &dyn Fn(FieldId) -> bool| {
            fields
                .iter()
                .filter(|f| violated(**f))
                .filter_map(|f| defs.get(*f).cloned())
                .collect::<BTreeSet<_>>()
        };
        AlertInfo {
            edt_violations: pick(spec.edt_fields(), &|f| shared.escapes_ui_thread(f)),
            shared_violations: pick(spec.shared_fields(), &|f| shared.is_shared(f)),
            lockset_violations: pick(spec.lock_set_fields(), &|f| lock_sets.lacks_lock_set(f)),
        }
    }

    /// Alerts present here but not in `prev`.
    pub fn alerts_since(&self, prev: &AlertInfo) -> AlertInfo {
        AlertInfo {
            edt_violations: self.edt_violations.difference(&prev.edt_violations).cloned().collect(),
            shared_violations: self.shared_violations.difference(&prev.shared_violations).cloned().collect(),
            lockset_violations: self.lockset_violations.difference(&prev.lockset_violations).cloned().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.edt_violations.is_empty() && self.shared_violations.is_empty() && self.lockset_violations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.edt_violations.len() + self.shared_violations.len() + self.lockset_violations.len()
    }
}

impl fmt::Display for AlertInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sections = [
            ("Non-UI thread accessed UI-confined field", &self.edt_violations),
            ("Shared field expected to be thread-confined", &self.shared_violations),
            ("Shared field without a consistent lock", &self.lockset_violations),
        ];
        for (title, fields) in sections {
            if fields.is_empty() {
                continue;
            }
            writeln!(f, "{title}:")?;
            for def in fields {
                writeln!(f, "    {def}")?;
            }
        }
        Ok(())
    }
}

fn field_label(defs: &FieldDefs, field: FieldId) -> String {
    match defs.get(field) {
        Some(def) => def.to_string(),
        None => format!("field#{field}"),
    }
}

fn fmt_ids(ids: &BTreeSet<LockId>) -> String {
    if ids.is_empty() {
        return "{}".to_owned();
    }
    let parts: Vec<String> = ids.iter().map(u64::to_string).collect();
    format!("{{{}}}", parts.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn def(id: FieldId, name: &str) -> Arc<FieldDef> {
        Arc::new(FieldDef::new(id, "app.Model", name, false))
    }

    #[test]
    fn alerts_since_keeps_only_new_entries() {
        let old = AlertInfo {
            shared_violations: [def(1, "a")].into_iter().collect(),
            ..Default::default()
        };
        let new = AlertInfo {
            shared_violations: [def(1, "a"), def(2, "b")].into_iter().collect(),
            lockset_violations: [def(1, "a")].into_iter().collect(),
            ..Default::default()
        };
        let delta = new.alerts_since(&old);
        assert_eq!(delta.shared_violations.len(), 1);
        assert_eq!(delta.shared_violations.iter().next().unwrap().id, 2);
        assert_eq!(delta.lockset_violations.len(), 1);
        assert!(old.alerts_since(&new).is_empty());
    }

    #[test]
    fn lock_set_classification() {
        let mut info = LockSetInfo::default();
        info.statics.insert(1, [7].into_iter().collect());
        info.instances.entry(2).or_default().insert(100, BTreeSet::new());
        info.instances.entry(3).or_default().insert(100, [7].into_iter().collect());
        info.no_lock_set_fields.insert(4);
        assert!(info.has_lock_set(1));
        assert!(!info.has_lock_set(2));
        assert!(info.has_lock_set(3));
        assert!(!info.has_lock_set(4));
        assert!(info.has_lock_set(99));
        assert!(!info.is_observed(99));
        assert_eq!(info.lock_set_report(3), "object 100: {7}\n");
    }

    #[test]
    fn deadlock_rendering_uses_names() {
        let info = DeadlockInfo {
            lock_order_edges: [(1, 2), (2, 1)].into_iter().collect(),
            cycles: vec![vec![1, 2]],
            cycle_lock_ids: [1, 2].into_iter().collect(),
            lock_orders: vec![vec![1, 2], vec![2, 1]],
            lock_names: [(1, "accounts".to_owned())].into_iter().collect(),
        };
        let text = info.to_string();
        assert!(text.contains("accounts -> lock#2\n"));
        assert!(text.contains("accounts -> lock#2 -> accounts"));
        assert!(info.has_deadlocks());
    }

    #[test]
    fn confinement_escape() {
        let mut info = SharedFieldInfo::default();
        info.ui_threads.insert(1);
        info.field_threads.insert(5, [1].into_iter().collect());
        info.field_threads.insert(6, [1, 2].into_iter().collect());
        assert!(!info.escapes_ui_thread(5));
        assert!(info.escapes_ui_thread(6));
        assert!(!info.escapes_ui_thread(7));
    }
}
