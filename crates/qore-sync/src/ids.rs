//! Identity types shared by every primitive that participates in deadlock
//! detection.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_LOCK_ID: AtomicU64 = AtomicU64::new(1);

/// A process-wide unique id assigned to every [`crate::mutex::QoreMutex`]
/// and [`crate::rwlock::RwLock`] at construction time, used as the node
/// identity in the [`crate::deadlock::DeadlockGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LockId(u64);

impl LockId {
    pub(crate) fn next() -> Self {
        Self(NEXT_LOCK_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Deterministic id for scripting lock topologies in tests.
    #[cfg(test)]
    pub(crate) fn test_new(n: u64) -> Self {
        Self(n)
    }
}

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lock#{}", self.0)
    }
}

/// The kind of primitive a [`LockId`] identifies, used only to produce
/// readable `THREAD-DEADLOCK` messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    Mutex,
    RwLockRead,
    RwLockWrite,
}

impl fmt::Display for LockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockKind::Mutex => write!(f, "mutex"),
            LockKind::RwLockRead => write!(f, "read-lock"),
            LockKind::RwLockWrite => write!(f, "write-lock"),
        }
    }
}

/// A host-thread identifier stable for the lifetime of the thread. We
/// don't use `std::thread::ThreadId` directly as the externally visible
/// type because it has no stable numeric rendering; this wraps one
/// assigned the first time the thread touches the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tid(u64);

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tid#{}", self.0)
    }
}

static NEXT_TID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn allocate_tid() -> Tid {
    Tid(NEXT_TID.fetch_add(1, Ordering::Relaxed))
}

impl Tid {
    /// Deterministic id for scripting lock topologies in tests.
    #[cfg(test)]
    pub(crate) fn test_new(n: u64) -> Self {
        Self(n)
    }
}
