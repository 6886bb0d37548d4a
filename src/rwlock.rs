use std::{
    fmt::{Debug, Formatter},
    ops::{Deref, DerefMut},
    sync::LockResult,
};

use crate::{
    header::{LockError, LockHeader, Rank, Signature},
    map_guard,
    report::{report_fatal_with, Abort, Terminator},
    rw_state::{RwLockState, Slot, SlotState, MAX_THREADS},
    thread_id::{current_thread_id, ThreadId},
};

/// Wrapper around a [`std::sync::RwLock`] which keeps a [`LockHeader`] and a per-thread hold table
/// next to the data.
///
/// Threads get a slot in the table once the thread id resolver is active (see
/// [`crate::activate_real_resolver`]); before that they are not tracked. Detected misuse is reported
/// through [`crate::report_fatal`] and ends the process: a thread acquiring a lock it already holds,
/// or the lock being dropped while held.
///
/// See the [crate level documentation](crate) for more general information.
///
/// ```
/// use lock_diagnostics::{Rank, RwLock};
///
/// lock_diagnostics::activate_real_resolver();
///
/// let lock = RwLock::with_rank(42, "answer", Rank(1));
/// {
///     let guard = lock.read().unwrap();
///     assert_eq!(42, *guard);
///     assert!(!lock.is_quiescent());
/// }
/// assert!(lock.is_quiescent());
/// ```
#[derive(Debug)]
pub struct RwLock<T> {
    inner: std::sync::RwLock<T>,
    tracking: Tracking,
}

/// Everything the lock knows about itself besides the data. Checks for quiescence when dropped.
#[derive(Debug)]
struct Tracking {
    header: LockHeader,
    state: RwLockState,
    terminator: &'static dyn Terminator,
}

impl<T> RwLock<T> {
    /// Creates an unnamed lock with rank 0.
    #[track_caller]
    pub fn new(t: T) -> Self {
        Self::with_rank(t, "", Rank::default())
    }

    /// Creates a lock with a name and a rank. Both only show up in diagnostics.
    #[track_caller]
    pub fn with_rank(t: T, name: impl Into<String>, rank: Rank) -> Self {
        RwLock {
            inner: std::sync::RwLock::new(t),
            tracking: Tracking {
                header: LockHeader::new(Signature::RW_LOCK, name, rank),
                state: RwLockState::new(),
                terminator: &Abort,
            },
        }
    }

    /// Replaces how fatal errors of this lock end the process. Intended for test harnesses.
    pub fn with_terminator(mut self, terminator: &'static dyn Terminator) -> Self {
        self.tracking.terminator = terminator;
        self
    }

    pub fn header(&self) -> &LockHeader {
        &self.tracking.header
    }

    /// `true` if no tracked thread holds the lock.
    pub fn is_quiescent(&self) -> bool {
        self.tracking.state.all_unlocked()
    }

    /// See [std::sync::RwLock::read]
    pub fn read(&self) -> LockResult<RwLockReadGuard<'_, T>> {
        let (_, slot) = self.tracking.enter();
        let result = self.inner.read();
        if let Some(slot) = slot {
            self.tracking.state.set(slot, SlotState::ReadHeld);
        }
        self.tracking.header.acquire_count();
        map_guard(result, |guard| RwLockReadGuard {
            inner: guard,
            tracking: &self.tracking,
            slot,
        })
    }

    /// See [std::sync::RwLock::write]
    pub fn write(&self) -> LockResult<RwLockWriteGuard<'_, T>> {
        let (thread, slot) = self.tracking.enter();
        let result = self.inner.write();
        if let Some(slot) = slot {
            self.tracking.state.set(slot, SlotState::WriteHeld);
        }
        self.tracking.header.set_thread(thread);
        self.tracking.header.set_count(1);
        map_guard(result, |guard| RwLockWriteGuard {
            inner: guard,
            tracking: &self.tracking,
            slot,
        })
    }

    /// See [std::sync::RwLock::get_mut]
    pub fn get_mut(&mut self) -> LockResult<&mut T> {
        // No need to track, this does not lock
        self.inner.get_mut()
    }

    /// See [std::sync::RwLock::into_inner]
    pub fn into_inner(self) -> LockResult<T> {
        let RwLock { inner, tracking } = self;
        // Reports a lock which is still held
        drop(tracking);
        inner.into_inner()
    }

    #[cfg(test)]
    fn header_mut(&mut self) -> &mut LockHeader {
        &mut self.tracking.header
    }
}

impl<T> From<T> for RwLock<T> {
    /// Creates a new lock in an unlocked state ready for use.
    /// This is equivalent to [`RwLock::new`].
    #[track_caller]
    fn from(value: T) -> Self {
        RwLock::new(value)
    }
}

impl Tracking {
    /// Validates the header and returns the calling thread together with its slot, if it has one.
    fn enter(&self) -> (ThreadId, Option<Slot<MAX_THREADS>>) {
        #[cfg(debug_assertions)]
        if let Err(err) = self.header.validate(Signature::RW_LOCK) {
            self.fatal(err);
        }
        let thread = current_thread_id();
        let slot = thread.slot::<MAX_THREADS>();
        if let Some(slot) = slot {
            if self.state.get(slot) != SlotState::Unlocked {
                self.fatal(LockError::RecursiveAcquisition(thread));
            }
        }
        (thread, slot)
    }

    fn fatal(&self, err: LockError) -> ! {
        report_fatal_with(&self.header, format_args!("{err}"), self.terminator)
    }
}

impl Drop for Tracking {
    fn drop(&mut self) {
        if !self.state.all_unlocked() {
            self.fatal(LockError::NotQuiescent);
        }
    }
}

pub struct RwLockReadGuard<'a, T> {
    inner: std::sync::RwLockReadGuard<'a, T>,
    tracking: &'a Tracking,
    slot: Option<Slot<MAX_THREADS>>,
}

impl<T> Drop for RwLockReadGuard<'_, T> {
    fn drop(&mut self) {
        // Runs before `inner` releases the std lock
        if let Some(slot) = self.slot {
            self.tracking.state.set(slot, SlotState::Unlocked);
        }
        self.tracking.header.release_count();
    }
}

impl<T: Debug> Debug for RwLockReadGuard<'_, T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(&self.inner, f)
    }
}

impl<T> Deref for RwLockReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.inner.deref()
    }
}

pub struct RwLockWriteGuard<'a, T> {
    inner: std::sync::RwLockWriteGuard<'a, T>,
    tracking: &'a Tracking,
    slot: Option<Slot<MAX_THREADS>>,
}

impl<T> Drop for RwLockWriteGuard<'_, T> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot {
            self.tracking.state.set(slot, SlotState::Unlocked);
        }
        self.tracking.header.set_thread(ThreadId::INVALID);
        self.tracking.header.set_count(0);
    }
}

impl<T: Debug> Debug for RwLockWriteGuard<'_, T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(&self.inner, f)
    }
}

impl<T> Deref for RwLockWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.inner.deref()
    }
}

impl<T> DerefMut for RwLockWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.inner.deref_mut()
    }
}

#[cfg(test)]
mod tests {
    use std::{hint::black_box, mem, panic::AssertUnwindSafe, sync::Arc, thread};

    use super::*;
    use crate::{report::Unwind, thread_id::activate_real_resolver};

    #[test]
    fn acquire_resource() {
        let lock = RwLock::new(42);
        let guard = lock.read().unwrap();

        assert_eq!(42, *guard)
    }

    #[test]
    fn allow_mutation() {
        let lock = RwLock::new(42);
        let mut guard = lock.write().unwrap();

        *guard = 43;

        assert_eq!(43, *guard)
    }

    #[test]
    fn multithreaded() {
        activate_real_resolver();
        let lock = Arc::new(RwLock::new(()));
        let thread = thread::spawn({
            let lock = lock.clone();
            move || {
                black_box(lock.write().unwrap());
            }
        });
        black_box(lock.read().unwrap());
        thread.join().unwrap();
        assert!(lock.is_quiescent());
    }

    #[test]
    fn guards_are_tracked() {
        activate_real_resolver();
        let lock = RwLock::new(());
        let slot = current_thread_id().slot::<MAX_THREADS>().unwrap();
        {
            let _guard = lock.read().unwrap();
            assert_eq!(SlotState::ReadHeld, lock.tracking.state.get(slot));
            assert_eq!(1, lock.header().count());
        }
        {
            let _guard = lock.write().unwrap();
            assert_eq!(SlotState::WriteHeld, lock.tracking.state.get(slot));
            assert_eq!(current_thread_id(), lock.header().thread());
        }
        assert!(lock.is_quiescent());
        assert_eq!(0, lock.header().count());
        assert_eq!(ThreadId::INVALID, lock.header().thread());
    }

    #[test]
    fn readers_on_different_threads_are_counted() {
        activate_real_resolver();
        let lock = Arc::new(RwLock::new(()));
        let guard = lock.read().unwrap();
        thread::spawn({
            let lock = lock.clone();
            move || {
                let _guard = lock.read().unwrap();
                assert_eq!(2, lock.header().count());
            }
        })
        .join()
        .unwrap();
        assert_eq!(1, lock.header().count());
        drop(guard);
        assert!(lock.is_quiescent());
    }

    #[test]
    fn header_names_construction_site() {
        let line = line!() + 1;
        let lock = RwLock::with_rank((), "config", Rank(3));
        assert_eq!(file!(), lock.header().caller().file());
        assert_eq!(line, lock.header().caller().line());
        assert_eq!("config", lock.header().name());
        assert_eq!(Rank(3), lock.header().rank());
    }

    #[test]
    #[should_panic(expected = "recursive acquisition by thread")]
    fn recursive_read_is_fatal() {
        activate_real_resolver();
        let lock = RwLock::with_rank((), "TestLock", Rank(3)).with_terminator(&Unwind);
        let _guard_a = lock.read().unwrap();
        // This must report
        let _guard_b = lock.read().unwrap();
    }

    #[test]
    #[should_panic(expected = "name TestLock")]
    fn write_while_reading_is_fatal() {
        activate_real_resolver();
        let lock = RwLock::with_rank((), "TestLock", Rank(3)).with_terminator(&Unwind);
        let _guard_a = lock.read().unwrap();
        // Would deadlock without the check
        let _guard_b = lock.write().unwrap();
    }

    #[test]
    #[should_panic(expected = "lock destroyed while still held")]
    fn dropping_a_held_lock_is_fatal() {
        activate_real_resolver();
        let lock = RwLock::new(()).with_terminator(&Unwind);
        mem::forget(lock.read().unwrap());
        drop(lock);
    }

    #[test]
    #[should_panic(expected = "lock destroyed while still held")]
    fn into_inner_of_a_held_lock_is_fatal() {
        activate_real_resolver();
        let lock = RwLock::new(5).with_terminator(&Unwind);
        mem::forget(lock.write().unwrap());
        let _ = lock.into_inner();
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "bad signature: expected 52574C4B, found DEADBEEF")]
    fn corrupted_header_is_fatal() {
        let mut lock = RwLock::new(()).with_terminator(&Unwind);
        lock.header_mut()
            .corrupt_signature(Signature::from_tag([0xDE, 0xAD, 0xBE, 0xEF]));
        let _guard = lock.read();
    }

    #[test]
    #[cfg(not(debug_assertions))]
    fn should_not_validate_header_in_release_build() {
        let mut lock = RwLock::new(5).with_terminator(&Unwind);
        lock.header_mut()
            .corrupt_signature(Signature::from_tag([0xDE, 0xAD, 0xBE, 0xEF]));
        // Corrupted, but we do not report, since debug assertions are not active
        assert_eq!(5, *lock.read().unwrap());
    }

    #[test]
    fn poisoned_lock_stays_tracked() {
        activate_real_resolver();
        let lock = RwLock::new(());
        std::panic::catch_unwind(AssertUnwindSafe(|| {
            let _guard = lock.write();
            panic!("lock is poisoned now");
        }))
        .unwrap_err();

        assert!(lock.is_quiescent());
        let guard = lock.read().unwrap_err().into_inner();
        assert!(!lock.is_quiescent());
        drop(guard);
        assert!(lock.is_quiescent());
    }

    #[test]
    fn into_inner_returns_data() {
        let lock: RwLock<u8> = 42.into();
        assert_eq!(42, lock.into_inner().unwrap());
    }

    #[test]
    fn get_mut_does_not_track() {
        let mut lock = RwLock::new(1);
        *lock.get_mut().unwrap() = 2;
        assert!(lock.is_quiescent());
        assert_eq!(2, *lock.read().unwrap());
    }
}
