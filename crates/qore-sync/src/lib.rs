//! Primitive locks, per-thread context and process-wide deadlock detection
//! for the Qore runtime core.
//!
//! This crate is deliberately value-agnostic: it raises exceptions through
//! the generic [`qore_sink::RaiseSink`] trait rather than depending on the
//! runtime's value model, so that `qore-value` can depend on `qore-sync`
//! (and not the other way around).

mod condvar;
mod deadlock;
mod ids;
mod mutex;
mod rwlock;
mod thread_context;

pub use condvar::{QoreCondvar, WaitResult};
pub use deadlock::{DeadlockGraph, DeadlockInfo};
pub use ids::{LockId, LockKind, Tid};
pub use mutex::{AcquireResult, QoreMutex};
pub use rwlock::{RwLock, RwPolicy};
pub use thread_context::{ResourceHandle, ThreadContext};

pub use qore_sink::SourceLocation;
