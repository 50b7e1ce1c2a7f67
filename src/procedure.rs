//! Procedure execution: the unit of work against the table cache.
//!
//! A `Procedure` runs with a private [`SContext`](crate::sctx::SContext),
//! declares up front which lock-pool slots it needs, and is retried up to a
//! bounded number of times if its body asks for a redo. Locks are always
//! acquired in ascending index order — the only discipline this runtime
//! relies on to keep two procedures that each touch several keys from
//! deadlocking against each other.
//!
//! Mirrors Granite's BEGIN / INSERT-UPDATE-DELETE / COMMIT / ROLLBACK
//! lifecycle, but against the in-memory table cache instead of a WAL:
//! commit is `SContext::commit` (drop the undo log), rollback is
//! `SContext::rollback` (replay it in reverse).

use std::sync::atomic::{AtomicU8, Ordering};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::sctx::SContext;
use crate::table::lock_pool::{LockGuard, LockPool};
use crate::watchdog::WatchdogHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProcedureState {
    Init = 0,
    Executing = 1,
    Committed = 2,
    RolledBack = 3,
}

impl ProcedureState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ProcedureState::Init,
            1 => ProcedureState::Executing,
            2 => ProcedureState::Committed,
            _ => ProcedureState::RolledBack,
        }
    }
}

/// A unit of work. Implementations read/write tables through the
/// `SContext` passed to `run`, after the runtime has locked every id in
/// `lock_ids()`.
pub trait Procedure: Send {
    /// Lock-pool indices this procedure needs. Order and duplicates don't
    /// matter — the runner sorts and dedups before acquiring.
    fn lock_ids(&self) -> Vec<u64>;

    /// The procedure body. Returning `Err(Error::Redo)` rolls back and
    /// retries (up to `Config::max_procedure_redo`); `Err(Error::Undo)` or
    /// any other error rolls back and does not retry.
    fn run(&mut self, sctx: &mut SContext) -> Result<()>;
}

struct LockGuards<'a> {
    _guards: Vec<LockGuard<'a>>,
}

fn acquire_ascending(pool: &LockPool, mut ids: Vec<u64>) -> LockGuards<'_> {
    ids.sort_unstable();
    ids.dedup();
    let guards = ids.into_iter().map(|id| pool.lock(id)).collect();
    LockGuards { _guards: guards }
}

/// Tracks whether a single `Procedure` value has already been run. A
/// procedure instance is not reentrant: `execute` uses one of these to
/// guard against a caller accidentally driving the same instance from two
/// threads at once.
pub struct ExecutionSlot {
    state: AtomicU8,
}

impl Default for ExecutionSlot {
    fn default() -> Self {
        Self { state: AtomicU8::new(ProcedureState::Init as u8) }
    }
}

impl ExecutionSlot {
    fn start(&self) -> bool {
        self.state
            .compare_exchange(ProcedureState::Init as u8, ProcedureState::Executing as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn finish(&self, state: ProcedureState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn state(&self) -> ProcedureState {
        ProcedureState::from_u8(self.state.load(Ordering::Acquire))
    }
}

/// Run `procedure` to completion: acquire its locks in ascending order, run
/// its body, commit or roll back, retrying on `Error::Redo` up to
/// `config.max_procedure_redo` times. Locks are released and reacquired
/// between retries so other procedures get a chance to make progress
/// instead of the same contender spinning against itself.
///
/// Registers with `watchdog` for the lifetime of each attempt. The watchdog
/// thread flips the registration's interrupt flag if this attempt overstays
/// `procedure_timeout`/`procedure_deadlock_timeout`; since nothing here can
/// preempt the procedure body mid-instruction, the flag is only observed at
/// the two points execute() itself blocks — after lock acquisition and
/// right after the body returns — and turned into `Error::Interrupted`.
pub fn execute(config: &Config, locks: &LockPool, watchdog: &WatchdogHandle, mut procedure: impl Procedure) -> Result<()> {
    let slot = ExecutionSlot::default();
    if !slot.start() {
        return Err(Error::Internal("procedure slot already executing".into()));
    }

    let lock_ids = procedure.lock_ids();
    if lock_ids.len() > config.max_lock_per_procedure {
        slot.finish(ProcedureState::RolledBack);
        return Err(Error::LockViolation(format!(
            "procedure requested {} locks, limit is {}",
            lock_ids.len(),
            config.max_lock_per_procedure
        )));
    }

    let mut attempts = 0usize;
    loop {
        let registration = watchdog.register();
        let _guards = acquire_ascending(locks, lock_ids.clone());
        if registration.should_interrupt() {
            drop(_guards);
            slot.finish(ProcedureState::RolledBack);
            return Err(Error::Interrupted);
        }

        let mut sctx = SContext::new();
        match procedure.run(&mut sctx) {
            Ok(()) if registration.should_interrupt() => {
                sctx.rollback();
                slot.finish(ProcedureState::RolledBack);
                return Err(Error::Interrupted);
            }
            Ok(()) => {
                sctx.commit();
                slot.finish(ProcedureState::Committed);
                return Ok(());
            }
            Err(Error::Redo) => {
                sctx.rollback();
                drop(_guards);
                drop(registration);
                attempts += 1;
                if attempts > config.max_procedure_redo {
                    slot.finish(ProcedureState::RolledBack);
                    return Err(Error::RedoExhausted);
                }
            }
            Err(e) => {
                sctx.rollback();
                slot.finish(ProcedureState::RolledBack);
                return Err(e);
            }
        }
    }
}

impl Procedure for Box<dyn Procedure> {
    fn lock_ids(&self) -> Vec<u64> {
        (**self).lock_ids()
    }

    fn run(&mut self, sctx: &mut SContext) -> Result<()> {
        (**self).run(sctx)
    }
}

/// Bail out of a procedure body and ask the runner to roll back and retry.
pub fn redo<T>() -> Result<T> {
    Err(Error::Redo)
}

/// Bail out of a procedure body and ask the runner to roll back without
/// retrying.
pub fn undo<T>() -> Result<T> {
    Err(Error::Undo)
}

/// Optimistic-precondition helper: compare a value observed before a
/// procedure acquired its locks against the value observed after, and ask
/// for a redo if they differ, since something else changed the record in
/// between.
pub fn check<T: PartialEq>(before: T, after: T) -> Result<()> {
    if before == after {
        Ok(())
    } else {
        redo()
    }
}
