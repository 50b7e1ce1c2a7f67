//! Cooperative procedure watchdog.
//!
//! A dedicated thread scans a registry of in-flight procedures every
//! `deadlock_check_interval` and flips an `AtomicBool` interrupt flag for
//! anything that has run past `procedure_timeout` (or past the shorter
//! `procedure_deadlock_timeout` once it's also been flagged as the likely
//! victim of a lock cycle). Procedure bodies are expected to poll
//! [`WatchdogHandle::should_interrupt`] at safe points and return
//! `Error::Interrupted`; nothing here preempts a thread mid-instruction.
//!
//! Grounded in the worker-thread-plus-handle shape the teacher uses for its
//! WAL writer: a background `std::thread`, a shared `Arc` of atomics for
//! communication, and a handle the rest of the runtime holds to register,
//! deregister, and eventually shut the thread down.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::config::Config;

/// Per-procedure interruption flag, shared between the watchdog thread and
/// the procedure it's watching.
#[derive(Default)]
pub struct InterruptFlag {
    flagged: AtomicBool,
}

impl InterruptFlag {
    pub fn should_interrupt(&self) -> bool {
        self.flagged.load(Ordering::Relaxed)
    }

    fn set(&self) {
        self.flagged.store(true, Ordering::Relaxed);
    }
}

struct Entry {
    started_at: Instant,
    suspected_deadlock: bool,
    flag: Arc<InterruptFlag>,
}

/// Registry of running procedures, scanned periodically by the watchdog
/// thread. Cloneable handle: every worker thread gets one to register and
/// deregister the procedure it's about to run.
#[derive(Clone)]
pub struct WatchdogHandle {
    entries: Arc<Mutex<HashMap<u64, Entry>>>,
    next_id: Arc<AtomicU64>,
}

/// An RAII registration. Dropping it deregisters the procedure; holding it
/// for the procedure's duration is what lets the watchdog find it.
pub struct Registration {
    handle: WatchdogHandle,
    id: u64,
    flag: Arc<InterruptFlag>,
}

impl Registration {
    pub fn should_interrupt(&self) -> bool {
        self.flag.should_interrupt()
    }

    /// Mark this procedure as a likely deadlock victim (e.g. the watchdog's
    /// own cycle detector, or a `try_lock` failure streak reported by the
    /// caller), subjecting it to the shorter `procedure_deadlock_timeout`.
    pub fn mark_suspected_deadlock(&self) {
        if let Some(entry) = self.handle.entries.lock().unwrap().get_mut(&self.id) {
            entry.suspected_deadlock = true;
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.handle.entries.lock().unwrap().remove(&self.id);
    }
}

impl WatchdogHandle {
    pub fn new() -> Self {
        Self { entries: Arc::new(Mutex::new(HashMap::new())), next_id: Arc::new(AtomicU64::new(1)) }
    }

    /// Register a procedure about to start running. Returns a guard; drop
    /// it (or let it fall out of scope) when the procedure finishes.
    pub fn register(&self) -> Registration {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let flag = Arc::new(InterruptFlag::default());
        self.entries.lock().unwrap().insert(
            id,
            Entry { started_at: Instant::now(), suspected_deadlock: false, flag: Arc::clone(&flag) },
        );
        Registration { handle: self.clone(), id, flag }
    }

    /// One scan pass: flags every entry that has overstayed its timeout.
    /// Exposed directly (rather than only via `spawn`) so it can be driven
    /// from tests without a real thread and sleep.
    pub fn scan_once(&self, config: &Config) {
        let now = Instant::now();
        let entries = self.entries.lock().unwrap();
        for entry in entries.values() {
            let elapsed = now.duration_since(entry.started_at);
            let limit = if entry.suspected_deadlock { config.procedure_deadlock_timeout } else { config.procedure_timeout };
            if elapsed > limit {
                log::warn!(
                    "watchdog: interrupting procedure after {:?} (suspected_deadlock={})",
                    elapsed,
                    entry.suspected_deadlock
                );
                entry.flag.set();
            }
        }
    }

    pub fn active_count(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

impl Default for WatchdogHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// A running watchdog thread. Dropping this handle signals the thread to
/// stop at its next wakeup and joins it.
pub struct Watchdog {
    stop: Arc<AtomicBool>,
    join: Option<std::thread::JoinHandle<()>>,
}

impl Watchdog {
    pub fn spawn(handle: WatchdogHandle, config: Config) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_clone = Arc::clone(&stop);
        let join = std::thread::spawn(move || {
            while !stop_clone.load(Ordering::Relaxed) {
                handle.scan_once(&config);
                std::thread::sleep(config.deadlock_check_interval.min(Duration::from_millis(250)));
            }
        });
        Self { stop, join: Some(join) }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}
