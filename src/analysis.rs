//! The analysis thread: drains every tracker once per period, merges the
//! batches and publishes fresh snapshots.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use hashbrown::{HashMap, HashSet};
use log::{debug, info, warn};

use crate::aggregator::MasterLockSet;
use crate::error::{MonitorError, Result};
use crate::info::{AlertInfo, DeadlockInfo, LockSetInfo, SharedFieldInfo};
use crate::interest::AlertSpec;
use crate::registry::{ObjectId, Registry};
use crate::tracker::ThreadTracker;
use crate::utils::{mark_monitor_thread, ThreadId, ThreadInfo};

/// Everything one tick produced. Never mutated after publication.
#[derive(Debug)]
pub struct Snapshots {
    /// Number of ticks completed when this was taken; zero before the first.
    pub tick: u64,
    pub taken_at: DateTime<Local>,
    pub alerts: Arc<AlertInfo>,
    pub lock_sets: Arc<LockSetInfo>,
    pub shared_fields: Arc<SharedFieldInfo>,
    pub deadlocks: Arc<DeadlockInfo>,
}

impl Snapshots {
    fn empty(registry: &Registry) -> Self {
        Snapshots {
            tick: 0,
            taken_at: Local::now(),
            alerts: Arc::new(AlertInfo::default()),
            lock_sets: Arc::new(LockSetInfo { defs: Arc::clone(&registry.fields), ..Default::default() }),
            shared_fields: Arc::new(SharedFieldInfo { defs: Arc::clone(&registry.fields), ..Default::default() }),
            deadlocks: Arc::new(DeadlockInfo::default()),
        }
    }
}

struct Master {
    aggregator: MasterLockSet,
    alert_spec: AlertSpec,
    ticks: u64,
}

/// State shared by the callbacks, the analysis thread and the GC thread.
pub(crate) struct Core {
    pub registry: Arc<Registry>,
    trackers: RwLock<HashMap<ThreadId, Arc<Mutex<ThreadTracker>>>>,
    master: Mutex<Master>,
    published: RwLock<Arc<Snapshots>>,
    // collected objects waiting for the next tick
    pending_purges: Mutex<HashSet<ObjectId>>,
    problems: AtomicU64,
}

impl Core {
    pub fn new(registry: Arc<Registry>, alert_spec: AlertSpec) -> Self {
        let published = RwLock::new(Arc::new(Snapshots::empty(&registry)));
        Core {
            registry,
            trackers: RwLock::new(HashMap::new()),
            master: Mutex::new(Master { aggregator: MasterLockSet::new(), alert_spec, ticks: 0 }),
            published,
            pending_purges: Mutex::new(HashSet::new()),
            problems: AtomicU64::new(0),
        }
    }

    /// The tracker of `thread`, created on first use.
    pub fn tracker(&self, thread: ThreadId) -> Arc<Mutex<ThreadTracker>> {
        self.tracker_with(thread, || ThreadInfo::new(thread, None))
    }

    pub fn tracker_with(&self, thread: ThreadId, info: impl FnOnce() -> ThreadInfo) -> Arc<Mutex<ThreadTracker>> {
        if let Some(tracker) = self.trackers.read().unwrap_or_else(PoisonError::into_inner).get(&thread) {
            return Arc::clone(tracker);
        }
        let mut trackers = self.trackers.write().unwrap_or_else(PoisonError::into_inner);
        let tracker = trackers.entry(thread).or_insert_with(|| {
            Arc::new(Mutex::new(ThreadTracker::new(info(), Arc::clone(&self.registry.locks))))
        });
        Arc::clone(tracker)
    }

    pub fn thread_count(&self) -> usize {
        self.trackers.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn count_problem(&self) {
        self.problems.fetch_add(1, Ordering::Relaxed);
    }

    pub fn problems(&self) -> u64 {
        self.problems.load(Ordering::Relaxed)
    }

    pub fn snapshots(&self) -> Arc<Snapshots> {
        Arc::clone(&*self.published.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn lock_master(&self) -> std::sync::MutexGuard<'_, Master> {
        self.master.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn all_trackers(&self) -> Vec<Arc<Mutex<ThreadTracker>>> {
        self.trackers.read().unwrap_or_else(PoisonError::into_inner).values().cloned().collect()
    }

    /// One analysis cycle. Drained batches, recomputation and publication all
    /// happen under the master lock, so readers see either the previous
    /// snapshots or these.
    ///
    /// Collections queued before the tick starts are applied after every
    /// tracker has been drained, so each purge sees all accesses made before
    /// its object died.
    pub fn tick(&self) -> Arc<Snapshots> {
        let start = Instant::now();
        let collected = std::mem::take(&mut *self.pending_purges.lock().unwrap_or_else(PoisonError::into_inner));
        let trackers = self.all_trackers();
        let mut master = self.lock_master();
        let mut busy = 0;
        for tracker in trackers {
            let batch = {
                let mut tracker = tracker.lock().unwrap_or_else(PoisonError::into_inner);
                self.problems.fetch_add(tracker.take_problems(), Ordering::Relaxed);
                tracker.drain()
            };
            if !batch.is_empty() {
                busy += 1;
            }
            master.aggregator.merge(batch);
        }
        let purged = collected.into_iter().filter(|id| master.aggregator.purge(*id)).count();
        let merged = start.elapsed();

        master.ticks += 1;
        let defs = &self.registry.fields;
        let lock_sets = master.aggregator.lock_set_info(defs);
        let shared_fields = master.aggregator.shared_field_info(defs);
        let deadlocks = master.aggregator.deadlock_info(&self.registry.locks);
        let alerts = AlertInfo::evaluate(&master.alert_spec, defs, &shared_fields, &lock_sets);
        let snapshots = Arc::new(Snapshots {
            tick: master.ticks,
            taken_at: Local::now(),
            alerts: Arc::new(alerts),
            lock_sets: Arc::new(lock_sets),
            shared_fields: Arc::new(shared_fields),
            deadlocks: Arc::new(deadlocks),
        });
        *self.published.write().unwrap_or_else(PoisonError::into_inner) = Arc::clone(&snapshots);
        debug!(
            "tick {}: merged {busy} busy threads and purged {purged} objects in {merged:?}, total {:?}, {} alerts",
            snapshots.tick,
            start.elapsed(),
            snapshots.alerts.len()
        );
        snapshots
    }

    /// Queues a collected object for the next tick. Returns false if it was
    /// already queued.
    pub fn purge(&self, object: ObjectId) -> bool {
        self.pending_purges.lock().unwrap_or_else(PoisonError::into_inner).insert(object)
    }

    /// Replaces the alert selection. Takes effect on the next tick.
    pub fn set_alert_spec(&self, revise: impl FnOnce(&AlertSpec) -> Result<AlertSpec>) -> Result<()> {
        let mut master = self.lock_master();
        let next = revise(&master.alert_spec)?;
        info!(
            "alert spec revised: edt {:?}, shared {:?}, lock set {:?}",
            next.edt_pattern(),
            next.shared_pattern(),
            next.lock_set_pattern()
        );
        master.alert_spec = next;
        Ok(())
    }

    /// Throws away everything merged or accumulated so far. Locks currently
    /// held by threads stay held.
    pub fn reset(&self) {
        let trackers = self.all_trackers();
        let mut master = self.lock_master();
        for tracker in trackers {
            tracker.lock().unwrap_or_else(PoisonError::into_inner).drain();
        }
        master.aggregator = MasterLockSet::new();
        master.ticks = 0;
        self.pending_purges.lock().unwrap_or_else(PoisonError::into_inner).clear();
        *self.published.write().unwrap_or_else(PoisonError::into_inner) =
            Arc::new(Snapshots::empty(&self.registry));
        info!("analysis state reset");
    }
}

struct Worker {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

/// Owns the analysis thread.
pub(crate) struct Analysis {
    core: Arc<Core>,
    period: Duration,
    worker: Mutex<Option<Worker>>,
    stopped: AtomicBool,
}

impl Analysis {
    pub fn start(core: Arc<Core>, period: Duration) -> Result<Self> {
        let worker = spawn_worker(Arc::clone(&core), period)?;
        Ok(Analysis { core, period, worker: Mutex::new(Some(worker)), stopped: AtomicBool::new(false) })
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Stops the thread, runs `between` with no tick in flight, and starts a
    /// fresh thread.
    pub fn restart(&self, between: impl FnOnce()) -> Result<()> {
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_stopped() {
            return Err(MonitorError::SchedulerStopped);
        }
        if let Some(old) = worker.take() {
            join_worker(old);
        }
        between();
        *worker = Some(spawn_worker(Arc::clone(&self.core), self.period)?);
        info!("analysis restarted");
        Ok(())
    }

    /// Lets the in-flight tick finish, stops the thread and runs one last
    /// tick. Later calls just return the final snapshots.
    pub fn wrap_up(&self) -> Arc<Snapshots> {
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if self.stopped.swap(true, Ordering::AcqRel) {
            return self.core.snapshots();
        }
        if let Some(old) = worker.take() {
            join_worker(old);
        }
        let last = self.core.tick();
        info!("analysis wrapped up after {} ticks", last.tick);
        last
    }
}

fn spawn_worker(core: Arc<Core>, period: Duration) -> Result<Worker> {
    let (stop, stopped) = mpsc::channel::<()>();
    let handle = thread::Builder::new().name("solcon-analysis".to_owned()).spawn(move || {
        mark_monitor_thread();
        info!("analysis started, period {period:?}");
        let mut next = Instant::now() + period;
        loop {
            let wait = next.saturating_duration_since(Instant::now());
            match stopped.recv_timeout(wait) {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
            core.tick();
            // an overrun tick is followed by the next one right away
            next = (next + period).max(Instant::now());
        }
        info!("analysis stopped");
    })?;
    Ok(Worker { stop, handle })
}

fn join_worker(worker: Worker) {
    // the thread may already be gone if a tick panicked
    let _ = worker.stop.send(());
    if worker.handle.join().is_err() {
        warn!("analysis thread panicked; last published snapshots remain");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{FieldDef, FieldDefs};

    fn core() -> Arc<Core> {
        let defs: FieldDefs = [FieldDef::new(1, "app.Account", "balance", false)].into_iter().collect();
        let registry = Arc::new(Registry::new(defs));
        let spec = AlertSpec::new("", ".*", ".*", &registry.fields).unwrap();
        Arc::new(Core::new(registry, spec))
    }

    #[test]
    fn tick_publishes_new_snapshots() {
        let core = core();
        assert_eq!(core.snapshots().tick, 0);
        core.tracker(1).lock().unwrap().field_access(1, Some(7), false);
        core.tracker(2).lock().unwrap().field_access(1, Some(7), false);
        let snap = core.tick();
        assert_eq!(snap.tick, 1);
        assert_eq!(core.snapshots().tick, 1);
        assert_eq!(snap.alerts.shared_violations.len(), 1);
        assert_eq!(snap.alerts.lockset_violations.len(), 1);
    }

    #[test]
    fn alert_revision_applies_on_next_tick() {
        let core = core();
        core.tracker(1).lock().unwrap().field_access(1, None, false);
        core.tracker(2).lock().unwrap().field_access(1, None, false);
        let before = core.tick();
        core.set_alert_spec(|spec| spec.merge(None, Some(""), Some(""), &core.registry.fields)).unwrap();
        assert_eq!(core.snapshots().alerts.len(), before.alerts.len());
        assert!(core.tick().alerts.is_empty());
    }

    #[test]
    fn reset_forgets_merged_state() {
        let core = core();
        core.tracker(1).lock().unwrap().field_access(1, None, false);
        core.tracker(2).lock().unwrap().field_access(1, None, false);
        core.tick();
        core.reset();
        assert_eq!(core.snapshots().tick, 0);
        assert!(core.tick().alerts.is_empty());
    }

    #[test]
    fn collection_between_ticks_keeps_alerts() {
        let core = core();
        {
            let t1 = core.tracker(1);
            let mut t1 = t1.lock().unwrap();
            t1.enter_lock(100);
            t1.field_access(1, Some(7), false);
        }
        assert!(core.tick().alerts.is_empty());
        {
            let t2 = core.tracker(2);
            let mut t2 = t2.lock().unwrap();
            t2.enter_lock(200);
            t2.field_access(1, Some(7), false);
        }
        assert!(core.purge(7));
        assert!(!core.purge(7));

        let snap = core.tick();
        assert_eq!(snap.alerts.shared_violations.len(), 1);
        assert_eq!(snap.alerts.lockset_violations.len(), 1);
        assert!(snap.lock_sets.instances().is_empty());
        assert_eq!(core.tick().alerts.shared_violations.len(), 1);
    }

    #[test]
    fn wrap_up_runs_a_final_tick_once() {
        let core = core();
        let analysis = Analysis::start(Arc::clone(&core), Duration::from_secs(3600)).unwrap();
        core.tracker(1).lock().unwrap().field_access(1, None, false);
        let last = analysis.wrap_up();
        assert_eq!(last.tick, 1);
        assert!(analysis.is_stopped());
        assert_eq!(analysis.wrap_up().tick, 1);
        assert!(matches!(analysis.restart(|| {}), Err(MonitorError::SchedulerStopped)));
    }
}
