//! Diagnostics for lock implementations: validate a lock before trusting it, dump it and terminate the
//! process once it is found corrupted, and track which threads hold a reader-writer lock so "fully
//! unlocked" can be verified cheaply.
//!
//! * [`LockHeader`] is embedded in every lock and validated against the [`Signature`] of its kind.
//! * [`report_fatal`] (or [`lock_fatal!`]) logs every header field, formats a message and aborts.
//! * [`RwLockState`] keeps one [`SlotState`] per thread; [`RwLockState::all_unlocked`] scans it.
//! * [`current_thread_id`] answers [`ThreadId::INVALID`] until start-up code calls
//!   [`activate_real_resolver`].
//!
//! [`RwLock`] wraps [`std::sync::RwLock`] and puts all of the above to use.

mod header;
mod report;
mod rw_state;
mod rwlock;
mod thread_id;

use std::sync::{LockResult, PoisonError};

pub use header::{HeaderSnapshot, LockError, LockHeader, Rank, Signature};
pub use report::{
    report_fatal, report_fatal_with, Abort, DumpField, FatalError, LockDump, Terminator, Unwind,
    DUMP_TARGET,
};
pub use rw_state::{RwLockState, Slot, SlotState, MAX_THREADS};
pub use rwlock::{RwLock, RwLockReadGuard, RwLockWriteGuard};
pub use thread_id::{
    activate_real_resolver, current_thread_id, dense_thread_id, resolver, ThreadId,
    ThreadIdResolver,
};

pub(crate) fn map_guard<G, F>(result: LockResult<G>, f: impl FnOnce(G) -> F) -> LockResult<F> {
    match result {
        Ok(guard) => Ok(f(guard)),
        Err(err) => Err(PoisonError::new(f(err.into_inner()))),
    }
}
