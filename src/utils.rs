use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

pub type ThreadId = u64;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ThreadInfo {
    pub id: ThreadId,
    pub name: ThreadName,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ThreadName(Option<String>);

impl std::fmt::Display for ThreadName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        match &self.0 {
            Some(name) => write!(f, "\"{}\"", name),
            None => write!(f, "None-name"),
        }
    }
}

impl std::fmt::Display for ThreadInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "thread#{}({})", self.id, self.name)
    }
}

impl ThreadInfo {
    pub fn new(id: ThreadId, name: Option<String>) -> Self {
        ThreadInfo { id, name: ThreadName(name) }
    }
}

// std's ThreadId::as_u64 is unstable, so monitored threads get their own
// dense numbering. Zero is never handed out.
static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT_THREAD_ID: Cell<ThreadId> = const { Cell::new(0) };
    static IN_MONITOR: Cell<bool> = const { Cell::new(false) };
}

pub fn current_thread_id() -> ThreadId {
    CURRENT_THREAD_ID.with(|id| {
        if id.get() == 0 {
            id.set(NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed));
        }
        id.get()
    })
}

pub fn get_current_thread_info() -> ThreadInfo {
    let c = thread::current();
    let name = c.name().map(str::to_owned);
    ThreadInfo::new(current_thread_id(), name)
}

/// Held while the current thread runs monitor code. Callbacks arriving on a
/// thread that already holds one are dropped.
pub struct MonitorGuard {
    _not_send: std::marker::PhantomData<*const ()>,
}

impl MonitorGuard {
    pub fn enter() -> Option<Self> {
        IN_MONITOR.with(|flag| {
            if flag.replace(true) {
                None
            } else {
                Some(MonitorGuard { _not_send: std::marker::PhantomData })
            }
        })
    }
}

impl Drop for MonitorGuard {
    fn drop(&mut self) {
        IN_MONITOR.with(|flag| flag.set(false));
    }
}

/// Marks the current thread as one of the monitor's own for its lifetime.
pub fn mark_monitor_thread() {
    IN_MONITOR.with(|flag| flag.set(true));
}

/// Formats as `h:mm:ss.fff`.
pub fn format_duration(d: Duration) -> String {
    let total = d.as_secs();
    let hours = total / 3600;
    let mins = (total % 3600) / 60;
    let secs = (total % 60) as f64 + f64::from(d.subsec_millis()) / 1000.0;
    format!("{hours}:{mins:02}:{secs:06.3}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_ids_are_stable_and_distinct() {
        let here = current_thread_id();
        assert_eq!(here, current_thread_id());
        let there = thread::spawn(current_thread_id).join().unwrap();
        assert_ne!(here, there);
        assert_ne!(there, 0);
    }

    #[test]
    fn thread_name_display() {
        let t = ThreadInfo::new(7, Some("worker".into()));
        assert_eq!(t.to_string(), "thread#7(\"worker\")");
        assert_eq!(ThreadInfo::new(1, None).to_string(), "thread#1(None-name)");
    }

    #[test]
    fn guard_rejects_nested_entry() {
        let outer = MonitorGuard::enter();
        assert!(outer.is_some());
        assert!(MonitorGuard::enter().is_none());
        drop(outer);
        assert!(MonitorGuard::enter().is_some());
    }

    #[test]
    fn duration_formatting() {
        assert_eq!(format_duration(Duration::from_millis(3_723_500)), "1:02:03.500");
        assert_eq!(format_duration(Duration::ZERO), "0:00:00.000");
    }
}
