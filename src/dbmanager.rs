//! `DBManager`: the process-wide runtime coordinating the table cache,
//! procedure worker pool, watchdog, and checkpoint pipeline.
//!
//! Procedures are submitted per session id (`sid`); within one `sid` they
//! run strictly in submission order (FIFO), but procedures from different
//! sessions interleave freely across the fixed worker pool — the same
//! per-connection-serial, cross-connection-parallel shape as the teacher's
//! command pipeline, generalized from one socket per session to one `sid`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::checkpoint::{CheckpointPipeline, CheckpointThread, Checkpointable, CommitGate};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::procedure::{self, Procedure};
use crate::storage::Storage;
use crate::table::lock_pool::LockPool;
use crate::watchdog::{Watchdog, WatchdogHandle};

type Job = Box<dyn FnOnce() + Send>;

struct SessionQueues {
    pending: HashMap<u64, VecDeque<Job>>,
    in_flight: HashSet<u64>,
}

struct Dispatcher {
    queues: Mutex<SessionQueues>,
    sender: mpsc::Sender<(u64, Job)>,
}

impl Dispatcher {
    fn new(sender: mpsc::Sender<(u64, Job)>) -> Self {
        Self { queues: Mutex::new(SessionQueues { pending: HashMap::new(), in_flight: HashSet::new() }), sender }
    }

    /// Enqueue `job` for `sid`. Dispatches immediately if `sid` has nothing
    /// in flight; otherwise the job waits behind whatever `sid` is already
    /// running.
    fn submit(&self, sid: u64, max_session_procedure: usize, job: Job) -> Result<()> {
        let mut queues = self.queues.lock().unwrap();
        if queues.in_flight.contains(&sid) {
            let queue = queues.pending.entry(sid).or_default();
            if queue.len() >= max_session_procedure {
                log::warn!("dbmanager: session {} queue is full ({} pending)", sid, queue.len());
                return Err(Error::QueueFull);
            }
            queue.push_back(job);
            Ok(())
        } else {
            queues.in_flight.insert(sid);
            drop(queues);
            self.sender.send((sid, job)).map_err(|_| Error::Internal("dispatcher channel closed".into()))
        }
    }

    /// Pop the next queued job for `sid` without touching `in_flight`, for a
    /// worker to run inline as part of the same drain batch. `None` means
    /// the session's backlog is (for now) empty.
    fn pop_next(&self, sid: u64) -> Option<Job> {
        let mut queues = self.queues.lock().unwrap();
        queues.pending.get_mut(&sid).and_then(|q| q.pop_front())
    }

    /// Called by a worker once its drain batch for `sid` is exhausted:
    /// dispatches the next queued job for that session, if any (continuing
    /// the drain on whichever worker picks it up), otherwise clears the
    /// in-flight marker so a future `submit` dispatches immediately again.
    fn advance(&self, sid: u64) {
        let mut queues = self.queues.lock().unwrap();
        match queues.pending.get_mut(&sid).and_then(|q| q.pop_front()) {
            Some(next) => {
                drop(queues);
                let _ = self.sender.send((sid, next));
            }
            None => {
                queues.pending.remove(&sid);
                queues.in_flight.remove(&sid);
            }
        }
    }
}

pub struct DBManager {
    config: Config,
    locks: Arc<LockPool>,
    dispatcher: Arc<Dispatcher>,
    accepting: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
    workers: Vec<std::thread::JoinHandle<()>>,
    watchdog_handle: WatchdogHandle,
    gate: Arc<CommitGate>,
    checkpoint: Arc<CheckpointPipeline>,
    _watchdog: Watchdog,
    _checkpoint_thread: CheckpointThread,
}

impl DBManager {
    /// Start the worker pool plus the watchdog and checkpoint background
    /// threads. `checkpoint_tables` should list every open table the
    /// checkpoint pipeline must flush.
    pub fn start(config: Config, locks: Arc<LockPool>, checkpoint_tables: Vec<Arc<dyn Checkpointable>>, storage: Arc<dyn Storage>) -> Self {
        let (tx, rx) = mpsc::channel::<(u64, Job)>();
        let dispatcher = Arc::new(Dispatcher::new(tx));
        let receiver = Arc::new(Mutex::new(rx));
        let stop = Arc::new(AtomicBool::new(false));
        let watchdog_handle = WatchdogHandle::new();
        let gate = Arc::new(CommitGate::new());
        let checkpoint = Arc::new(CheckpointPipeline::new(config.clone(), checkpoint_tables, Arc::clone(&gate), storage));

        let mut workers = Vec::with_capacity(config.db_thread_count.max(1));
        for _ in 0..config.db_thread_count.max(1) {
            let receiver = Arc::clone(&receiver);
            let dispatcher = Arc::clone(&dispatcher);
            let stop = Arc::clone(&stop);
            let gate = Arc::clone(&gate);
            let max_batch_procedure = config.max_batch_procedure.max(1);
            workers.push(std::thread::spawn(move || loop {
                if stop.load(Ordering::Relaxed) {
                    break;
                }
                let next = receiver.lock().unwrap().recv_timeout(Duration::from_millis(200));
                match next {
                    Ok((sid, job)) => {
                        let shared = gate.enter_procedure();
                        job();
                        // Drain up to `max_batch_procedure` queued jobs for this
                        // session inline, instead of bouncing each one back
                        // through the shared channel.
                        let mut ran_in_batch = 1usize;
                        while ran_in_batch < max_batch_procedure {
                            match dispatcher.pop_next(sid) {
                                Some(next_job) => {
                                    next_job();
                                    ran_in_batch += 1;
                                }
                                None => break,
                            }
                        }
                        drop(shared);
                        dispatcher.advance(sid);
                    }
                    Err(mpsc::RecvTimeoutError::Timeout) => continue,
                    Err(mpsc::RecvTimeoutError::Disconnected) => break,
                }
            }));
        }

        let watchdog = Watchdog::spawn(watchdog_handle.clone(), config.clone());
        let checkpoint_thread = CheckpointThread::spawn(Arc::clone(&checkpoint));
        log::info!("dbmanager: started {} worker threads", workers.len());

        Self {
            config,
            locks,
            dispatcher,
            accepting: Arc::new(AtomicBool::new(true)),
            stop,
            workers,
            watchdog_handle,
            gate,
            checkpoint,
            _watchdog: watchdog,
            _checkpoint_thread: checkpoint_thread,
        }
    }

    /// Stop accepting new procedure submissions (`stopQueue`-style): calls
    /// to `submit_sync`/`submit_async` after this return `Error::QueueFull`.
    /// Work already dispatched or queued continues to drain normally.
    pub fn stop_accepting(&self) {
        log::info!("dbmanager: no longer accepting new submissions");
        self.accepting.store(false, Ordering::Relaxed);
    }

    pub fn locks(&self) -> &Arc<LockPool> {
        &self.locks
    }

    pub fn gate(&self) -> &Arc<CommitGate> {
        &self.gate
    }

    pub fn checkpoint(&self) -> &Arc<CheckpointPipeline> {
        &self.checkpoint
    }

    pub fn watchdog(&self) -> &WatchdogHandle {
        &self.watchdog_handle
    }

    fn dispatch(&self, sid: u64, job: Job) -> Result<()> {
        if !self.accepting.load(Ordering::Relaxed) {
            return Err(Error::QueueFull);
        }
        self.dispatcher.submit(sid, self.config.max_session_procedure, job)
    }

    /// Fire-and-forget: run `procedure` for `sid`, discarding the result.
    /// Use [`DBManager::submit_sync`] when the caller needs the outcome.
    pub fn submit_async(&self, sid: u64, procedure: Box<dyn Procedure>) -> Result<()> {
        let config = self.config.clone();
        let locks = Arc::clone(&self.locks);
        let watchdog = self.watchdog_handle.clone();
        let job: Job = Box::new(move || {
            let _ = procedure::execute(&config, &locks, &watchdog, procedure);
        });
        self.dispatch(sid, job)
    }

    /// Run `procedure` for `sid` and block the calling thread for the
    /// result, preserving the session's FIFO order against its other
    /// queued work.
    pub fn submit_sync(&self, sid: u64, procedure: Box<dyn Procedure>) -> Result<()> {
        let (tx, rx) = mpsc::channel();
        let config = self.config.clone();
        let locks = Arc::clone(&self.locks);
        let watchdog = self.watchdog_handle.clone();
        let job: Job = Box::new(move || {
            let result = procedure::execute(&config, &locks, &watchdog, procedure);
            let _ = tx.send(result);
        });
        self.dispatch(sid, job)?;
        rx.recv().map_err(|_| Error::Internal("worker dropped without a result".into()))?
    }

    /// Stop accepting new dispatch and block until every in-flight worker
    /// drains. Equivalent to dropping the manager; documents the intent at
    /// the call site.
    pub fn shutdown(self) {}
}

impl Drop for DBManager {
    fn drop(&mut self) {
        log::info!("dbmanager: shutting down");
        self.stop.store(true, Ordering::Relaxed);
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::octets::Octets;
    use crate::codec::record::{read_fields, read_int_value, write_int_field, write_terminator, Bean};
    use crate::config::StorageOptions;
    use crate::sctx::SContext;
    use crate::storage::memlsm::MemLsmStorage;
    use crate::table::Table;
    use std::sync::atomic::AtomicUsize;
    use tempfile::tempdir;

    #[derive(Debug, Clone, PartialEq)]
    struct Counter(i64);

    impl Bean for Counter {
        fn marshal(&self, out: &mut Octets) {
            write_int_field(out, 1, self.0);
            write_terminator(out);
        }
        fn unmarshal(inp: &mut Octets) -> Result<Self> {
            let mut v = 0;
            read_fields(inp, |inp, tag, _k| {
                if tag == 1 {
                    v = read_int_value(inp)?;
                    Ok(true)
                } else {
                    Ok(false)
                }
            })?;
            Ok(Counter(v))
        }
    }

    struct Increment {
        table: Arc<Table<Counter>>,
        key: Vec<u8>,
        order: Arc<Mutex<Vec<i64>>>,
    }

    impl Procedure for Increment {
        fn lock_ids(&self) -> Vec<u64> {
            vec![self.table.lock_id(&self.key)]
        }

        fn run(&mut self, sctx: &mut SContext) -> Result<()> {
            let current = self.table.get(&self.key)?.map(|c| c.0).unwrap_or(0);
            let next = current + 1;
            sctx.put(&self.table, &self.key, Counter(next))?;
            self.order.lock().unwrap().push(next);
            Ok(())
        }
    }

    fn setup(db_thread_count: usize) -> (tempfile::TempDir, Arc<Table<Counter>>, DBManager) {
        let dir = tempdir().unwrap();
        let storage: Arc<dyn Storage> = Arc::new(MemLsmStorage::open(dir.path(), &StorageOptions::default()).unwrap());
        let locks = Arc::new(LockPool::new(16));
        let table = Arc::new(Table::open(1, "counters", Arc::clone(&storage), Arc::clone(&locks), 4));
        let mut config = Config::low_latency();
        config.db_thread_count = db_thread_count;
        let manager = DBManager::start(config, locks, vec![table.clone() as Arc<dyn Checkpointable>], storage);
        (dir, table, manager)
    }

    #[test]
    fn submit_sync_returns_after_the_procedure_commits() {
        let (_dir, table, manager) = setup(2);
        let order = Arc::new(Mutex::new(Vec::new()));
        let key = b"k".to_vec();
        manager.submit_sync(1, Box::new(Increment { table: table.clone(), key: key.clone(), order })).unwrap();
        assert_eq!(table.get_no_lock(&key).unwrap(), Some(Counter(1)));
    }

    #[test]
    fn same_sid_procedures_run_in_submission_order() {
        let (_dir, table, manager) = setup(4);
        let order = Arc::new(Mutex::new(Vec::new()));
        let key = b"k".to_vec();
        for _ in 0..20 {
            manager
                .submit_sync(7, Box::new(Increment { table: table.clone(), key: key.clone(), order: Arc::clone(&order) }))
                .unwrap();
        }
        let recorded = order.lock().unwrap().clone();
        let expected: Vec<i64> = (1..=20).collect();
        assert_eq!(recorded, expected);
        assert_eq!(table.get_no_lock(&key).unwrap(), Some(Counter(20)));
    }

    #[test]
    fn different_sids_do_not_serialize_against_each_other() {
        let (_dir, _table, manager) = setup(4);
        let started = Arc::new(AtomicUsize::new(0));

        struct Block {
            started: Arc<AtomicUsize>,
        }
        impl Procedure for Block {
            fn lock_ids(&self) -> Vec<u64> {
                vec![]
            }
            fn run(&mut self, _sctx: &mut SContext) -> Result<()> {
                self.started.fetch_add(1, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(50));
                Ok(())
            }
        }

        manager.submit_async(100, Box::new(Block { started: Arc::clone(&started) })).unwrap();
        manager.submit_async(200, Box::new(Block { started: Arc::clone(&started) })).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(started.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn queue_full_is_reported_once_the_session_backlog_is_exhausted() {
        let (_dir, table, manager) = setup(1);
        let order = Arc::new(Mutex::new(Vec::new()));
        let key = b"k".to_vec();
        let mut last = Ok(());
        for _ in 0..200 {
            last = manager.submit_async(9, Box::new(Increment { table: table.clone(), key: key.clone(), order: Arc::clone(&order) }));
            if last.is_err() {
                break;
            }
        }
        assert!(matches!(last, Err(Error::QueueFull)));
    }

    #[test]
    fn dispatcher_pop_next_drains_pending_jobs_inline() {
        let (tx, _rx) = mpsc::channel();
        let dispatcher = Dispatcher::new(tx);
        let ran = Arc::new(Mutex::new(Vec::new()));

        for i in 0..5 {
            let ran = Arc::clone(&ran);
            dispatcher.submit(1, 100, Box::new(move || ran.lock().unwrap().push(i))).unwrap();
        }
        // The first submission dispatched straight to the channel (never run
        // here); the rest sit behind it in the pending queue.
        assert_eq!(dispatcher.queues.lock().unwrap().pending.get(&1).map(|q| q.len()), Some(4));

        // A worker draining a batch of up to `max_batch_procedure` pops the
        // rest inline, same as `DBManager`'s worker loop does after the
        // channel-dispatched job returns.
        dispatcher.pop_next(1).unwrap()();
        dispatcher.pop_next(1).unwrap()();
        assert_eq!(*ran.lock().unwrap(), vec![1, 2]);
        assert_eq!(dispatcher.queues.lock().unwrap().pending.get(&1).map(|q| q.len()), Some(2));
    }
}
