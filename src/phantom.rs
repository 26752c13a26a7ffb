//! Weak tracking of monitored objects and the thread that notices collection.
//!
//! The monitor never owns a tracked object: it keeps a `Weak` and reports the
//! object's id once, after the last strong reference is gone.

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use hashbrown::HashMap;
use log::{debug, info, warn};

use crate::registry::ObjectId;

type Handle = Weak<dyn Any + Send + Sync>;

#[derive(Default)]
struct Tracked {
    // allocation address -> id, to hand out the same id for the same object
    by_addr: HashMap<usize, ObjectId>,
    live: HashMap<ObjectId, (usize, Handle)>,
}

pub struct Phantoms {
    next_id: AtomicU64,
    tracked: Mutex<Tracked>,
}

impl Phantoms {
    /// Ids start at `first_id` so they can be kept apart from ids the
    /// instrumentation assigns itself.
    pub fn new(first_id: ObjectId) -> Self {
        Phantoms { next_id: AtomicU64::new(first_id), tracked: Mutex::new(Tracked::default()) }
    }

    /// Returns the id of `object`, allocating one on first sight.
    pub fn track<T: Any + Send + Sync>(&self, object: &Arc<T>) -> ObjectId {
        let addr = Arc::as_ptr(object) as *const () as usize;
        let mut tracked = self.tracked.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(&id) = tracked.by_addr.get(&addr) {
            // the address may belong to a dead object whose memory was reused
            if tracked.live.get(&id).is_some_and(|(_, weak)| weak.strong_count() > 0) {
                return id;
            }
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let weak: Weak<T> = Arc::downgrade(object);
        let weak: Handle = weak;
        tracked.by_addr.insert(addr, id);
        tracked.live.insert(id, (addr, weak));
        id
    }

    /// Removes and returns every tracked object that has been dropped. Each
    /// id is returned by exactly one call.
    pub fn collect_dead(&self) -> Vec<ObjectId> {
        let mut tracked = self.tracked.lock().unwrap_or_else(PoisonError::into_inner);
        let dead: Vec<(ObjectId, usize)> = tracked
            .live
            .iter()
            .filter(|(_, (_, weak))| weak.strong_count() == 0)
            .map(|(id, (addr, _))| (*id, *addr))
            .collect();
        for (id, addr) in &dead {
            tracked.live.remove(id);
            if tracked.by_addr.get(addr) == Some(id) {
                tracked.by_addr.remove(addr);
            }
        }
        dead.into_iter().map(|(id, _)| id).collect()
    }

    /// Stops tracking `id`. Returns false if it was not tracked.
    pub fn forget(&self, id: ObjectId) -> bool {
        let mut tracked = self.tracked.lock().unwrap_or_else(PoisonError::into_inner);
        match tracked.live.remove(&id) {
            Some((addr, _)) => {
                if tracked.by_addr.get(&addr) == Some(&id) {
                    tracked.by_addr.remove(&addr);
                }
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.tracked.lock().unwrap_or_else(PoisonError::into_inner).live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The GC notification thread. Every `poll` it hands the ids of collected
/// objects to `on_collected`.
pub struct Reaper {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Reaper {
    pub fn spawn<F>(phantoms: Arc<Phantoms>, poll: Duration, on_collected: F) -> std::io::Result<Self>
    where
        F: Fn(ObjectId) + Send + 'static,
    {
        let (stop, stopped) = mpsc::channel::<()>();
        let handle = thread::Builder::new().name("solcon-gc".to_owned()).spawn(move || {
            crate::utils::mark_monitor_thread();
            info!("gc reaper started, polling every {poll:?}");
            loop {
                let last = match stopped.recv_timeout(poll) {
                    Err(RecvTimeoutError::Timeout) => false,
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
                };
                let dead = phantoms.collect_dead();
                if !dead.is_empty() {
                    debug!("{} tracked objects collected", dead.len());
                }
                for id in dead {
                    on_collected(id);
                }
                if last {
                    break;
                }
            }
            info!("gc reaper stopped");
        })?;
        Ok(Reaper { stop: Some(stop), handle: Some(handle) })
    }

    pub fn stop(&mut self) {
        drop(self.stop.take());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("gc reaper panicked");
            }
        }
    }
}

impl Drop for Reaper {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn same_object_same_id() {
        let phantoms = Phantoms::new(1);
        let a = Arc::new(5u32);
        let b = Arc::new(6u32);
        let id = phantoms.track(&a);
        assert_eq!(phantoms.track(&Arc::clone(&a)), id);
        assert_ne!(phantoms.track(&b), id);
        assert_eq!(phantoms.len(), 2);
    }

    #[derive(Debug)]
    struct Account {
        balance: u64,
    }

    #[test]
    fn tracks_concrete_types() {
        let phantoms = Phantoms::new(1 << 48);
        let account = Arc::new(Account { balance: 3 });
        let id = phantoms.track(&account);
        assert_eq!(id, 1 << 48);
        assert_eq!(account.balance, 3);
        drop(account);
        assert_eq!(phantoms.collect_dead(), vec![id]);
    }

    #[test]
    fn tracking_does_not_keep_objects_alive() {
        let phantoms = Phantoms::new(1);
        let a = Arc::new(String::from("x"));
        let id = phantoms.track(&a);
        assert!(phantoms.collect_dead().is_empty());
        drop(a);
        assert_eq!(phantoms.collect_dead(), vec![id]);
        assert!(phantoms.collect_dead().is_empty());
        assert!(phantoms.is_empty());
    }

    #[test]
    fn forgotten_ids_are_not_reported() {
        let phantoms = Phantoms::new(1);
        let a = Arc::new(1u8);
        let id = phantoms.track(&a);
        assert!(phantoms.forget(id));
        assert!(!phantoms.forget(id));
        drop(a);
        assert!(phantoms.collect_dead().is_empty());
    }

    #[test]
    fn reaper_reports_each_collection_once() {
        let phantoms = Arc::new(Phantoms::new(1));
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let mut reaper = Reaper::spawn(Arc::clone(&phantoms), Duration::from_millis(1), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        let a = Arc::new(vec![1, 2, 3]);
        phantoms.track(&a);
        drop(a);
        reaper.stop();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
