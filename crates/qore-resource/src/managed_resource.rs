//! A thread-affine wrapper over a raw, thread-unsafe resource (component
//! I), prototype: a database connection.
//!
//! Grounded on spec.md §3's ManagedResource field list and §4.I's state
//! machine. The object mutex guarding open/close/active bookkeeping is a
//! plain `parking_lot::Mutex` (uncontended, short critical sections, no
//! deadlock-graph participation needed); the transaction gate is a
//! [`qore_sync::QoreMutex`] because it is held across many actions, can be
//! contended for a long time, and must participate in deadlock detection
//! like any other user-visible blocking primitive.

use parking_lot::{Condvar, Mutex};
use qore_sink::{tags, ExceptionKind, RaiseSink};
use qore_sync::{AcquireResult, QoreMutex, ResourceHandle, ThreadContext, Tid};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Default timeout for acquiring the transaction gate, per spec.md §4.I.
pub const DEFAULT_TRANSACTION_TIMEOUT: Duration = Duration::from_secs(120);

static NEXT_RESOURCE_ID: AtomicU64 = AtomicU64::new(1);

/// Failure surfaced by an embedder's [`RawResource`] implementation. This is
/// the non-exception failure mode spec.md §7 carves out for the embedding
/// API (the underlying connection has no `ExceptionSink` of its own to
/// raise onto); [`ManagedResource`] converts every variant into an
/// `ExceptionSink` raise at the point it crosses back into the core.
#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("open failed: {0}")]
    Open(String),
    #[error("commit failed: {0}")]
    Commit(String),
    #[error("rollback failed: {0}")]
    Rollback(String),
}

/// The raw, thread-unsafe resource a [`ManagedResource`] wraps. Opening,
/// closing, committing and rolling back are the only operations the core
/// needs to know about; everything else (queries, the wire protocol) is an
/// external collaborator per spec.md §1.
pub trait RawResource: Send {
    fn open(&mut self, config: &HashMap<String, String>) -> Result<(), ResourceError>;
    fn close(&mut self);
    fn commit(&mut self) -> Result<(), ResourceError> {
        Ok(())
    }
    fn rollback(&mut self) -> Result<(), ResourceError> {
        Ok(())
    }
    /// Whether the underlying connection reported itself aborted during a
    /// recent action, per spec.md §4.J ("a resource reporting 'connection
    /// aborted' ... is torn down and replaced").
    fn is_aborted(&self) -> bool {
        false
    }
}

/// A coarse view of where a [`ManagedResource`] sits in its state machine
/// (spec.md §4.I), for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceState {
    Closed,
    Idle,
    InAction,
    IdleInTransaction,
    InActionInTransaction,
}

struct Inner<R> {
    raw: Option<R>,
    open: bool,
    active: u32,
    config: HashMap<String, String>,
    pending_config: HashMap<String, String>,
}

/// A reference-counted, thread-affine resource with a transaction-lock
/// gate. Always used behind an `Arc` (the transaction-commit thread
/// resource cleanup needs to hand a clone of the `Arc` to
/// [`qore_sync::ThreadContext::register_thread_resource`]), so every
/// method that participates in the transaction protocol takes `self:
/// &Arc<Self>`.
pub struct ManagedResource<R: RawResource> {
    id: u64,
    inner: Mutex<Inner<R>>,
    status_cv: Condvar,
    txn_gate: QoreMutex,
    txn_owner: Mutex<Option<Tid>>,
    auto_commit: bool,
    txn_timeout: Duration,
}

impl<R: RawResource + 'static> ManagedResource<R> {
    pub fn new(raw: R, auto_commit: bool, txn_timeout: Duration) -> Self {
        Self {
            id: NEXT_RESOURCE_ID.fetch_add(1, Ordering::Relaxed),
            inner: Mutex::new(Inner {
                raw: Some(raw),
                open: false,
                active: 0,
                config: HashMap::new(),
                pending_config: HashMap::new(),
            }),
            status_cv: Condvar::new(),
            txn_gate: QoreMutex::new(),
            txn_owner: Mutex::new(None),
            auto_commit,
            txn_timeout,
        }
    }

    fn resource_handle(&self) -> ResourceHandle {
        ResourceHandle(self.id)
    }

    fn do_open(&self, inner: &mut Inner<R>) -> Result<(), ResourceError> {
        inner.config.extend(inner.pending_config.drain());
        if let Some(raw) = inner.raw.as_mut() {
            raw.open(&inner.config)?;
        }
        inner.open = true;
        Ok(())
    }

    /// `open()`: applies any pending configuration and opens the
    /// underlying resource if it is not already open.
    pub fn open(&self, sink: &mut dyn RaiseSink) -> bool {
        let mut inner = self.inner.lock();
        if inner.open {
            return true;
        }
        if let Err(e) = self.do_open(&mut inner) {
            sink.raise_tagged(ExceptionKind::System, "DATASOURCE-OPEN-ERROR", e.to_string());
            return false;
        }
        true
    }

    /// `startAction(sink)`: opens the resource if closed, increments the
    /// in-flight action counter. Returns `false` with an exception on
    /// `sink` iff the open failed.
    pub fn start_action(&self, sink: &mut dyn RaiseSink) -> bool {
        let mut inner = self.inner.lock();
        if !inner.open {
            if let Err(e) = self.do_open(&mut inner) {
                sink.raise_tagged(ExceptionKind::System, "DATASOURCE-OPEN-ERROR", e.to_string());
                return false;
            }
        }
        inner.active += 1;
        true
    }

    /// `endAction()`: decrements the in-flight action counter, signalling
    /// the status condition when it reaches zero.
    pub fn end_action(&self) {
        let mut inner = self.inner.lock();
        debug_assert!(inner.active > 0, "endAction without a matching startAction");
        inner.active = inner.active.saturating_sub(1);
        if inner.active == 0 {
            self.status_cv.notify_all();
        }
    }

    pub fn in_transaction(&self) -> bool {
        self.txn_owner.lock().is_some()
    }

    pub fn is_aborted(&self) -> bool {
        self.inner
            .lock()
            .raw
            .as_ref()
            .is_some_and(RawResource::is_aborted)
    }

    pub fn state(&self) -> ResourceState {
        let inner = self.inner.lock();
        let in_txn = self.in_transaction();
        match (inner.open, inner.active > 0, in_txn) {
            (false, _, _) => ResourceState::Closed,
            (true, false, false) => ResourceState::Idle,
            (true, true, false) => ResourceState::InAction,
            (true, false, true) => ResourceState::IdleInTransaction,
            (true, true, true) => ResourceState::InActionInTransaction,
        }
    }

    /// `beginTransaction()`: acquires the transaction gate (default 120s
    /// timeout), pinning it to the calling thread until `commit`/
    /// `rollback`. A no-op returning `true` when auto-commit is enabled
    /// (spec.md §4.I: "If auto-commit is enabled ... the gate is not
    /// used"). Registers a thread-resource cleanup so that a thread
    /// exiting without committing or rolling back gets an implicit
    /// rollback (spec.md §4.C, §4.I).
    pub fn begin_transaction(self: &Arc<Self>, sink: &mut dyn RaiseSink) -> bool {
        self.begin_transaction_timeout(Some(self.txn_timeout), sink)
    }

    pub fn begin_transaction_timeout(
        self: &Arc<Self>,
        timeout: Option<Duration>,
        sink: &mut dyn RaiseSink,
    ) -> bool {
        if self.auto_commit {
            return true;
        }
        match self.txn_gate.lock_timeout(timeout, sink) {
            AcquireResult::Acquired => {
                *self.txn_owner.lock() = Some(ThreadContext::current_tid());
                let cleanup_target = self.clone();
                ThreadContext::register_thread_resource(self.resource_handle(), move |sink| {
                    log::warn!(
                        "resource {} left its transaction open at thread exit; rolling back",
                        cleanup_target.id
                    );
                    cleanup_target.end_transaction_internal(sink, true);
                });
                true
            }
            AcquireResult::TimedOut => {
                // The timeout exception may name a thread id that has
                // already released the gate by the time this message is
                // read (spec.md §9's accepted cosmetic race); we report
                // the last known holder on a best-effort basis.
                let holder = self
                    .txn_owner
                    .lock()
                    .map(|t| t.to_string())
                    .unwrap_or_else(|| "<unknown>".to_string());
                sink.raise_tagged(
                    ExceptionKind::System,
                    tags::TRANSACTION_TIMEOUT,
                    format!(
                        "timed out waiting for the transaction lock on resource {} (held by {holder})",
                        self.id
                    ),
                );
                false
            }
        }
    }

    pub fn commit(self: &Arc<Self>, sink: &mut dyn RaiseSink) {
        if self.auto_commit {
            return;
        }
        ThreadContext::remove_thread_resource(self.resource_handle());
        self.end_transaction_internal(sink, false);
    }

    pub fn rollback(self: &Arc<Self>, sink: &mut dyn RaiseSink) {
        if self.auto_commit {
            return;
        }
        ThreadContext::remove_thread_resource(self.resource_handle());
        self.end_transaction_internal(sink, true);
    }

    /// Shared tail of `commit`/`rollback`/the implicit-rollback thread
    /// cleanup. Does not itself touch the thread-resource registration:
    /// callers either already removed it (explicit commit/rollback) or are
    /// running as its cleanup callback (already popped by the time it
    /// runs).
    fn end_transaction_internal(&self, sink: &mut dyn RaiseSink, is_rollback: bool) {
        *self.txn_owner.lock() = None;
        {
            let mut inner = self.inner.lock();
            if let Some(raw) = inner.raw.as_mut() {
                let result = if is_rollback { raw.rollback() } else { raw.commit() };
                if let Err(e) = result {
                    sink.raise_tagged(ExceptionKind::System, "DATASOURCE-TRANSACTION-ERROR", e.to_string());
                }
            }
        }
        self.txn_gate.unlock();
    }

    /// `close()`: waits for `active == 0`, then closes the underlying
    /// resource and force-exits the transaction gate if held.
    pub fn close(self: &Arc<Self>) {
        let mut inner = self.inner.lock();
        while inner.active > 0 {
            self.status_cv.wait(&mut inner);
        }
        if inner.open {
            if let Some(raw) = inner.raw.as_mut() {
                raw.close();
            }
            inner.open = false;
        }
        drop(inner);
        if self.txn_owner.lock().take().is_some() {
            ThreadContext::remove_thread_resource(self.resource_handle());
            self.txn_gate.unlock();
        }
    }

    /// `reset()`: close then open, under a single hold of the object
    /// state (no other thread's `startAction` can slip in between the two
    /// halves).
    pub fn reset(self: &Arc<Self>, sink: &mut dyn RaiseSink) -> bool {
        let mut inner = self.inner.lock();
        while inner.active > 0 {
            self.status_cv.wait(&mut inner);
        }
        if inner.open {
            if let Some(raw) = inner.raw.as_mut() {
                raw.close();
            }
            inner.open = false;
        }
        drop(inner);
        if self.txn_owner.lock().take().is_some() {
            ThreadContext::remove_thread_resource(self.resource_handle());
            self.txn_gate.unlock();
        }
        self.open(sink)
    }

    /// Writes into the shadow configuration; takes effect on the next
    /// `open()` (spec.md §4.I: "Configuration setters ... write into
    /// shadow fields").
    pub fn set_config(&self, key: impl Into<String>, value: impl Into<String>) {
        self.inner
            .lock()
            .pending_config
            .insert(key.into(), value.into());
    }
}
