use std::{
    fmt::{self, Display, Formatter},
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Mutex, PoisonError,
    },
};

use crate::rw_state::Slot;

/// Identity of a thread as seen by the lock library.
///
/// Identities handed out by the real resolver are dense, starting at zero, so they double as an index
/// into the per-thread slot table of a reader-writer lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadId(u32);

impl ThreadId {
    /// Reserved identity answered while the thread identity subsystem is not yet available.
    pub const INVALID: ThreadId = ThreadId(u32::MAX);

    pub const fn new(raw: u32) -> Self {
        ThreadId(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub const fn is_valid(self) -> bool {
        self.0 != Self::INVALID.0
    }

    /// Slot of this thread in a table with `N` entries. `None` for the invalid identity and for
    /// identities the table cannot hold.
    pub fn slot<const N: usize>(self) -> Option<Slot<N>> {
        if !self.is_valid() {
            return None;
        }
        usize::try_from(self.0).ok().and_then(Slot::new)
    }
}

impl Display for ThreadId {
    /// Rendered as a signed integer, so [`ThreadId::INVALID`] shows up as `-1`.
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0 as i32)
    }
}

/// Ids of exited threads, handed out again before new ones are minted.
static FREE_IDS: Mutex<Vec<u32>> = Mutex::new(Vec::new());
static NEXT_ID: AtomicU32 = AtomicU32::new(0);

/// Holds the dense id of a thread and returns it to [`FREE_IDS`] when the thread exits.
struct DenseId(ThreadId);

impl DenseId {
    fn allocate() -> Self {
        let recycled = FREE_IDS
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        let raw = recycled.unwrap_or_else(|| NEXT_ID.fetch_add(1, Ordering::Relaxed));
        DenseId(ThreadId::new(raw))
    }
}

impl Drop for DenseId {
    fn drop(&mut self) {
        FREE_IDS
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(self.0.raw());
    }
}

thread_local! {
    /// Allocated on first use. Ids never exceed the number of threads alive at the same time, so
    /// they stay within the slot table of a reader-writer lock as long as the process does.
    static DENSE_ID: DenseId = DenseId::allocate();
}

/// Dense thread identities, assigned on first use in each thread and recycled once the thread exits.
///
/// Answers [`ThreadId::INVALID`] while the thread local is being torn down.
pub fn dense_thread_id() -> ThreadId {
    DENSE_ID
        .try_with(|id| id.0)
        .unwrap_or(ThreadId::INVALID)
}

/// Answers "which thread is touching this lock" for lock headers.
///
/// Starts out inactive and answers [`ThreadId::INVALID`] to everyone. [`Self::activate`] switches it,
/// once and for good, to the real resolver it was constructed with. The switch is published with
/// release/acquire ordering, so a thread that observes the activation also observes everything the
/// activating thread did before it.
#[derive(Debug)]
pub struct ThreadIdResolver {
    real: fn() -> ThreadId,
    active: AtomicBool,
}

impl ThreadIdResolver {
    pub const fn new(real: fn() -> ThreadId) -> Self {
        Self {
            real,
            active: AtomicBool::new(false),
        }
    }

    pub fn current(&self) -> ThreadId {
        if self.active.load(Ordering::Acquire) {
            (self.real)()
        } else {
            ThreadId::INVALID
        }
    }

    /// Starts delegating to the real resolver. Meant to be called exactly once during start-up;
    /// later calls are harmless.
    pub fn activate(&self) {
        if self.active.swap(true, Ordering::AcqRel) {
            tracing::debug!("thread id resolver activated more than once");
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

static RESOLVER: ThreadIdResolver = ThreadIdResolver::new(dense_thread_id);

/// The process wide resolver used by the locks of this crate.
pub fn resolver() -> &'static ThreadIdResolver {
    &RESOLVER
}

/// Identity of the calling thread, or [`ThreadId::INVALID`] until [`activate_real_resolver`] ran.
pub fn current_thread_id() -> ThreadId {
    RESOLVER.current()
}

/// Called by start-up code once the thread identity subsystem is ready.
pub fn activate_real_resolver() {
    RESOLVER.activate()
}
