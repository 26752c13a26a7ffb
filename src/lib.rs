//! Online lock-set, shared-field and lock-order analysis.
//!
//! Instrumented code reports lock acquisitions, lock releases and field
//! accesses to a [`Monitor`]. Each report lands in the calling thread's own
//! tracker; a background thread periodically merges all trackers and publishes
//! [`Snapshots`] that readers can hold on to without locking anything.
//!
//! ```no_run
//! use solcon_monitor::{FieldDef, FieldDefs, Monitor, MonitorConfig};
//!
//! let defs: FieldDefs = [FieldDef::new(1, "bank.Account", "balance", false)].into_iter().collect();
//! let config = MonitorConfig::default()
//!     .with_tracked_fields(".*")
//!     .with_alerts("", "", "bank\\..*");
//! let monitor = Monitor::new(config, defs).unwrap();
//! let me = monitor.current_thread();
//! monitor.on_lock_acquired(me, 10);
//! monitor.on_field_access(me, 1, Some(100), false);
//! monitor.on_lock_released(me, 10);
//! println!("{}", monitor.wrap_up().alerts);
//! ```

use std::any::Any;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use log::{debug, info};

pub mod aggregator;
pub mod analysis;
pub mod config;
pub mod error;
pub mod info;
pub mod interest;
pub mod locktree;
pub mod phantom;
pub mod registry;
pub mod tracker;
pub mod utils;

pub use analysis::Snapshots;
pub use config::MonitorConfig;
pub use error::{MonitorError, Result};
pub use info::{AlertInfo, DeadlockInfo, LockSetInfo, SharedFieldInfo};
pub use interest::{AlertSpec, MonitorSpec};
pub use registry::{FieldDef, FieldDefs, FieldId, LockId, ObjectId, Registry};
pub use utils::{ThreadId, ThreadInfo};

use analysis::{Analysis, Core};
use phantom::{Phantoms, Reaper};
use utils::MonitorGuard;

/// Ids handed out by [`Monitor::track_object`] start here, well clear of
/// receiver ids assigned by instrumentation.
pub const TRACKED_OBJECT_ID_BASE: ObjectId = 1 << 48;

pub struct Monitor {
    core: Arc<Core>,
    analysis: Analysis,
    monitor_spec: RwLock<Arc<MonitorSpec>>,
    phantoms: Arc<Phantoms>,
    reaper: Mutex<Option<Reaper>>,
    started: DateTime<Local>,
    started_at: Instant,
}

impl Monitor {
    /// Builds a monitor over `fields` and starts its analysis and GC threads.
    pub fn new(config: MonitorConfig, fields: FieldDefs) -> Result<Self> {
        let registry = Arc::new(Registry::new(fields));
        let alert_spec = AlertSpec::new(
            &config.edt_fields,
            &config.shared_fields,
            &config.lock_set_fields,
            &registry.fields,
        )?;
        let monitor_spec = MonitorSpec::new(&config.tracked_fields, &registry.fields)?;
        info!(
            "monitoring {} of {} fields, period {:?}",
            monitor_spec.tracked_count(),
            registry.fields.len(),
            config.period
        );

        let core = Arc::new(Core::new(registry, alert_spec));
        let analysis = Analysis::start(Arc::clone(&core), config.period)?;
        let phantoms = Arc::new(Phantoms::new(TRACKED_OBJECT_ID_BASE));
        let purge_core = Arc::clone(&core);
        let reaper = Reaper::spawn(Arc::clone(&phantoms), config.gc_poll, move |id| {
            purge_core.purge(id);
        })?;

        Ok(Monitor {
            core,
            analysis,
            monitor_spec: RwLock::new(Arc::new(monitor_spec)),
            phantoms,
            reaper: Mutex::new(Some(reaper)),
            started: Local::now(),
            started_at: Instant::now(),
        })
    }

    /// Configuration from `SOLCON_*` variables, field definitions from the
    /// fields file they name (none if unset).
    pub fn from_env() -> Result<Self> {
        let config = MonitorConfig::from_env()?;
        let fields = match &config.fields_file {
            Some(path) => FieldDefs::load(path)?,
            None => FieldDefs::new(),
        };
        Self::new(config, fields)
    }

    pub fn registry(&self) -> &Registry {
        &self.core.registry
    }

    /// Id of the calling thread, registering it under its std name.
    pub fn current_thread(&self) -> ThreadId {
        let info = utils::get_current_thread_info();
        let id = info.id;
        self.core.tracker_with(id, || info);
        id
    }

    pub fn register_thread(&self, info: ThreadInfo) {
        let id = info.id;
        self.core.tracker_with(id, || info);
    }

    /// Flags `thread` as a UI thread, the only kind allowed to touch
    /// UI-confined fields.
    pub fn mark_ui_thread(&self, thread: ThreadId, is_ui: bool) {
        let tracker = self.core.tracker(thread);
        tracker.lock().unwrap_or_else(PoisonError::into_inner).set_ui_thread(is_ui);
    }

    pub fn on_lock_acquired(&self, thread: ThreadId, lock: LockId) {
        let Some(_guard) = MonitorGuard::enter() else { return };
        let tracker = self.core.tracker(thread);
        tracker.lock().unwrap_or_else(PoisonError::into_inner).enter_lock(lock);
    }

    pub fn on_lock_released(&self, thread: ThreadId, lock: LockId) {
        let Some(_guard) = MonitorGuard::enter() else { return };
        let tracker = self.core.tracker(thread);
        tracker.lock().unwrap_or_else(PoisonError::into_inner).leave_lock(lock);
    }

    /// Records an access to `field`. `receiver` is `None` for static fields.
    pub fn on_field_access(&self, thread: ThreadId, field: FieldId, receiver: Option<ObjectId>, under_construction: bool) {
        let Some(_guard) = MonitorGuard::enter() else { return };
        if !self.core.registry.fields.contains(field) {
            self.core.count_problem();
            debug!("access to unregistered field {field} from thread#{thread}");
            return;
        }
        if !self.monitor_spec.read().unwrap_or_else(PoisonError::into_inner).is_monitoring(field) {
            return;
        }
        let tracker = self.core.tracker(thread);
        tracker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .field_access(field, receiver, under_construction);
    }

    /// Drops everything known about a collected object at the next tick, once
    /// the accesses made before collection have been merged. Repeated calls
    /// for the same id do nothing.
    pub fn on_object_collected(&self, object: ObjectId) {
        self.phantoms.forget(object);
        self.core.purge(object);
    }

    /// Id for `object`, stable while it lives. The monitor keeps only a weak
    /// reference and purges the id once the object is dropped.
    pub fn track_object<T: Any + Send + Sync>(&self, object: &Arc<T>) -> ObjectId {
        self.phantoms.track(object)
    }

    /// Queues every tracked object dropped since the GC thread last looked
    /// for purging at the next tick.
    pub fn reap_now(&self) -> usize {
        let dead = self.phantoms.collect_dead();
        for id in &dead {
            self.core.purge(*id);
        }
        dead.len()
    }

    pub fn define_rw_lock(&self, lock: LockId, read: LockId, write: LockId) {
        self.core.registry.locks.define_rw_lock(lock, read, write);
    }

    pub fn name_lock(&self, lock: LockId, name: impl Into<String>) {
        self.core.registry.locks.name_lock(lock, name);
    }

    pub fn snapshots(&self) -> Arc<Snapshots> {
        self.core.snapshots()
    }

    pub fn get_alerts(&self) -> Arc<AlertInfo> {
        Arc::clone(&self.snapshots().alerts)
    }

    pub fn get_lock_sets(&self) -> Arc<LockSetInfo> {
        Arc::clone(&self.snapshots().lock_sets)
    }

    pub fn get_deadlocks(&self) -> Arc<DeadlockInfo> {
        Arc::clone(&self.snapshots().deadlocks)
    }

    pub fn get_shared_fields(&self) -> Arc<SharedFieldInfo> {
        Arc::clone(&self.snapshots().shared_fields)
    }

    /// Revises the alert patterns; `None` keeps a pattern as it is. Applies
    /// from the next tick. On error nothing changes.
    pub fn revise_alert_spec(&self, edt: Option<&str>, shared: Option<&str>, lock_set: Option<&str>) -> Result<()> {
        if self.analysis.is_stopped() {
            return Err(MonitorError::SchedulerStopped);
        }
        let defs = &self.core.registry.fields;
        self.core.set_alert_spec(|current| current.merge(edt, shared, lock_set, defs))
    }

    /// Changes which fields are tracked. Everything merged so far is dropped
    /// and analysis starts over. On error nothing changes.
    pub fn revise_monitor_spec(&self, pattern: &str) -> Result<()> {
        let spec = Arc::new(MonitorSpec::new(pattern, &self.core.registry.fields)?);
        info!("monitor spec revised to {pattern:?}, tracking {} fields", spec.tracked_count());
        self.analysis.restart(|| {
            *self.monitor_spec.write().unwrap_or_else(PoisonError::into_inner) = spec;
            self.core.reset();
        })
    }

    pub fn monitor_spec(&self) -> Arc<MonitorSpec> {
        Arc::clone(&*self.monitor_spec.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Runs an analysis cycle on the calling thread and returns its result.
    pub fn tick_now(&self) -> Result<Arc<Snapshots>> {
        if self.analysis.is_stopped() {
            return Err(MonitorError::SchedulerStopped);
        }
        Ok(self.core.tick())
    }

    /// Stops both background threads after a final GC sweep and a final
    /// tick. Safe to call more than once.
    pub fn wrap_up(&self) -> Arc<Snapshots> {
        if let Some(mut reaper) = self.reaper.lock().unwrap_or_else(PoisonError::into_inner).take() {
            reaper.stop();
        }
        self.analysis.wrap_up()
    }

    pub fn problem_count(&self) -> u64 {
        self.core.problems()
    }

    pub fn thread_count(&self) -> usize {
        self.core.thread_count()
    }

    pub fn started(&self) -> DateTime<Local> {
        self.started
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Human readable report of the latest snapshots.
    pub fn summary(&self) -> String {
        let snap = self.snapshots();
        let defs = &self.core.registry.fields;
        let mut out = String::new();
        let _ = writeln!(
            out,
            "solcon monitor started {}, up {}, tick {}, {} threads, {} problems",
            self.started.format("%Y-%m-%d_%H-%M-%S%.6f"),
            utils::format_duration(self.uptime()),
            snap.tick,
            self.thread_count(),
            self.problem_count()
        );

        let (locked, unlocked): (Vec<FieldId>, Vec<FieldId>) =
            snap.lock_sets.fields().into_iter().partition(|f| snap.lock_sets.has_lock_set(*f));
        for (title, fields) in [("Fields that ALWAYS have a lock set", locked), ("Fields with no lock set", unlocked)] {
            let _ = writeln!(out, "{title}:");
            let mut lines: Vec<String> = fields
                .into_iter()
                .map(|f| match defs.get(f) {
                    Some(def) => format!("\t{def} - {f}"),
                    None => format!("\tfield#{f}"),
                })
                .collect();
            lines.sort();
            for line in lines {
                let _ = writeln!(out, "{line}");
            }
        }
        if !snap.alerts.is_empty() {
            let _ = write!(out, "{}", snap.alerts);
        }
        let _ = write!(out, "{}", snap.deadlocks);
        out
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.wrap_up();
    }
}
