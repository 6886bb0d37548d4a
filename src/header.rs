use std::{
    fmt::{self, Display, Formatter},
    panic::Location,
    sync::atomic::{AtomicU32, Ordering},
};

use thiserror::Error;

use crate::thread_id::ThreadId;

/// Tag identifying the kind of a lock. A header carrying anything else than the tag its lock expects is
/// considered corrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signature(u32);

impl Signature {
    /// Signature of [`crate::RwLock`].
    pub const RW_LOCK: Signature = Signature::from_tag(*b"RWLK");

    pub const fn from_tag(tag: [u8; 4]) -> Self {
        Signature(u32::from_be_bytes(tag))
    }

    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl Display for Signature {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}", self.0)
    }
}

/// Position of a lock in the deadlock avoidance ordering. Only carried here for diagnostics.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Rank(pub u32);

impl Display for Rank {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LockError {
    #[error("bad signature: expected {expected}, found {found}")]
    BadSignature {
        expected: Signature,
        found: Signature,
    },
    #[error("recursive acquisition by thread {0}")]
    RecursiveAcquisition(ThreadId),
    #[error("lock destroyed while still held")]
    NotQuiescent,
}

/// Metadata embedded in every lock of this crate, validated before the lock is trusted and dumped when
/// it is not.
#[derive(Debug)]
pub struct LockHeader {
    signature: Signature,
    name: String,
    caller: &'static Location<'static>,
    rank: Rank,
    count: AtomicU32,
    thread: AtomicU32,
}

impl LockHeader {
    /// The code location calling this constructor is recorded as the caller of the lock.
    #[track_caller]
    pub fn new(signature: Signature, name: impl Into<String>, rank: Rank) -> Self {
        Self {
            signature,
            name: name.into(),
            caller: Location::caller(),
            rank,
            count: AtomicU32::new(0),
            thread: AtomicU32::new(ThreadId::INVALID.raw()),
        }
    }

    pub fn validate(&self, expected: Signature) -> Result<(), LockError> {
        if self.signature == expected {
            Ok(())
        } else {
            Err(LockError::BadSignature {
                expected,
                found: self.signature,
            })
        }
    }

    pub fn signature(&self) -> Signature {
        self.signature
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn caller(&self) -> &'static Location<'static> {
        self.caller
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn count(&self) -> u32 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn thread(&self) -> ThreadId {
        ThreadId::new(self.thread.load(Ordering::Relaxed))
    }

    pub(crate) fn set_count(&self, count: u32) {
        self.count.store(count, Ordering::Relaxed);
    }

    pub(crate) fn acquire_count(&self) {
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn release_count(&self) {
        self.count.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn set_thread(&self, thread: ThreadId) {
        self.thread.store(thread.raw(), Ordering::Relaxed);
    }

    #[cfg(test)]
    pub(crate) fn corrupt_signature(&mut self, signature: Signature) {
        self.signature = signature;
    }

    /// Copy of all fields. Count and thread are read independently of each other.
    pub fn snapshot(&self) -> HeaderSnapshot {
        HeaderSnapshot {
            signature: self.signature,
            name: self.name.clone(),
            caller: self.caller,
            rank: self.rank,
            count: self.count(),
            thread: self.thread(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderSnapshot {
    pub signature: Signature,
    pub name: String,
    pub caller: &'static Location<'static>,
    pub rank: Rank,
    pub count: u32,
    pub thread: ThreadId,
}
