//! A plain, non-recursive mutex with an explicit `lock`/`unlock`/`try_lock`
//! API (as opposed to a RAII guard), because the runtime tracks lock
//! ownership itself via [`crate::thread_context::ThreadContext`] and routes
//! every blocking acquire through the [`crate::deadlock::DeadlockGraph`].

use crate::deadlock::DeadlockGraph;
use crate::ids::{LockId, LockKind, Tid};
use crate::thread_context::ThreadContext;
use qore_sink::{tags, ExceptionKind, RaiseSink};
use std::sync::{Condvar, Mutex as StdMutex};
use std::time::{Duration, Instant};

/// Outcome of a timed acquire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireResult {
    Acquired,
    TimedOut,
}

/// A plain recursive-unsafe mutex. Acquiring it twice from the same
/// thread without an intervening unlock deadlocks (or, since every
/// acquire is deadlock-checked, raises `THREAD-DEADLOCK` immediately
/// instead of blocking forever).
pub struct QoreMutex {
    id: LockId,
    state: StdMutex<bool>,
    cv: Condvar,
    deleted: std::sync::atomic::AtomicBool,
}

impl Default for QoreMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl QoreMutex {
    pub fn new() -> Self {
        Self {
            id: LockId::next(),
            state: StdMutex::new(false),
            cv: Condvar::new(),
            deleted: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> LockId {
        self.id
    }

    fn check_deleted(&self, sink: &mut dyn RaiseSink) -> bool {
        if self.deleted.load(std::sync::atomic::Ordering::SeqCst) {
            sink.raise_tagged(
                ExceptionKind::System,
                tags::LOCK_ERROR,
                format!("{} was deleted in another thread", self.id),
            );
            true
        } else {
            false
        }
    }

    /// Blocks until the lock is acquired, raising `THREAD-DEADLOCK` instead
    /// of blocking if a cycle is detected. Returns `false` iff the lock was
    /// deleted or a deadlock was detected (sink carries the exception).
    pub fn lock(&self, sink: &mut dyn RaiseSink) -> bool {
        matches!(self.lock_timeout(None, sink), AcquireResult::Acquired)
    }

    /// As [`QoreMutex::lock`] but gives up after `timeout`. A deadlock is
    /// still raised eagerly regardless of the timeout value, per the
    /// runtime's "deadlock is a bug" policy.
    pub fn lock_timeout(
        &self,
        timeout: Option<Duration>,
        sink: &mut dyn RaiseSink,
    ) -> AcquireResult {
        if self.check_deleted(sink) {
            return AcquireResult::TimedOut;
        }

        let thread = ThreadContext::current_tid();
        if ThreadContext::holds_lock(self.id) {
            sink.raise_tagged(
                ExceptionKind::System,
                tags::LOCK_ERROR,
                format!("thread already holds {}", self.id),
            );
            return AcquireResult::TimedOut;
        }

        if let Err(info) = DeadlockGraph::global().try_acquire(thread, self.id, LockKind::Mutex) {
            sink.raise_tagged(
                ExceptionKind::System,
                tags::THREAD_DEADLOCK,
                info.to_string(),
            );
            return AcquireResult::TimedOut;
        }

        let deadline = timeout.map(|d| Instant::now() + d);
        let mut locked = self.state.lock().expect("mutex state poisoned");
        loop {
            if !*locked {
                *locked = true;
                break;
            }
            match deadline {
                None => {
                    locked = self.cv.wait(locked).expect("mutex state poisoned");
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        DeadlockGraph::global().cancel_intent(thread);
                        return AcquireResult::TimedOut;
                    }
                    let (guard, result) = self
                        .cv
                        .wait_timeout(locked, deadline - now)
                        .expect("mutex state poisoned");
                    locked = guard;
                    if result.timed_out() && *locked {
                        DeadlockGraph::global().cancel_intent(thread);
                        return AcquireResult::TimedOut;
                    }
                }
            }
        }
        drop(locked);

        DeadlockGraph::global().commit_acquired(thread, self.id);
        ThreadContext::push_lock(self.id, LockKind::Mutex);
        AcquireResult::Acquired
    }

    /// Non-blocking acquire attempt.
    pub fn try_lock(&self) -> bool {
        if self.deleted.load(std::sync::atomic::Ordering::SeqCst) {
            return false;
        }
        let mut locked = self.state.lock().expect("mutex state poisoned");
        if *locked {
            false
        } else {
            *locked = true;
            drop(locked);
            let thread = ThreadContext::current_tid();
            DeadlockGraph::global().commit_acquired(thread, self.id);
            ThreadContext::push_lock(self.id, LockKind::Mutex);
            true
        }
    }

    /// Releases a lock held by the calling thread.
    pub fn unlock(&self) {
        let thread = ThreadContext::current_tid();
        ThreadContext::pop_lock(self.id);
        DeadlockGraph::global().release(thread, self.id);
        let mut locked = self.state.lock().expect("mutex state poisoned");
        *locked = false;
        self.cv.notify_one();
    }

    /// For use by [`crate::condvar::QoreCondvar::wait`], which needs to
    /// release and later reacquire this mutex around a wait without a
    /// thread-context / deadlock-graph round trip for the release half.
    pub(crate) fn release_for_wait(&self) {
        let mut locked = self.state.lock().expect("mutex state poisoned");
        *locked = false;
        self.cv.notify_one();
    }

    pub(crate) fn reacquire_after_wait(&self) {
        let mut locked = self.state.lock().expect("mutex state poisoned");
        while *locked {
            locked = self.cv.wait(locked).expect("mutex state poisoned");
        }
        *locked = true;
    }
}

impl Drop for QoreMutex {
    fn drop(&mut self) {
        self.deleted.store(true, std::sync::atomic::Ordering::SeqCst);
        DeadlockGraph::global().forget_lock(self.id);
        self.cv.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qore_sink::ExceptionSink;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn lock_unlock_roundtrip() {
        let mutex = QoreMutex::new();
        let mut sink: ExceptionSink<String> = ExceptionSink::new();
        assert!(mutex.lock(&mut sink));
        assert!(!sink.is_exception());
        mutex.unlock();
        assert!(mutex.try_lock());
        mutex.unlock();
    }

    #[test]
    fn try_lock_fails_while_held() {
        let mutex = QoreMutex::new();
        let mut sink: ExceptionSink<String> = ExceptionSink::new();
        assert!(mutex.lock(&mut sink));
        assert!(!mutex.try_lock());
        mutex.unlock();
    }

    #[test]
    fn contended_lock_blocks_until_release() {
        let mutex = Arc::new(QoreMutex::new());
        let mut sink: ExceptionSink<String> = ExceptionSink::new();
        assert!(mutex.lock(&mut sink));

        let m2 = mutex.clone();
        let handle = thread::spawn(move || {
            let mut sink: ExceptionSink<String> = ExceptionSink::new();
            m2.lock(&mut sink)
        });

        thread::sleep(Duration::from_millis(50));
        mutex.unlock();
        assert!(handle.join().unwrap());
    }

    #[test]
    fn timeout_returns_without_raising() {
        let mutex = Arc::new(QoreMutex::new());
        let mut sink: ExceptionSink<String> = ExceptionSink::new();
        assert!(mutex.lock(&mut sink));

        let m2 = mutex.clone();
        let handle = thread::spawn(move || {
            let mut sink: ExceptionSink<String> = ExceptionSink::new();
            let result = m2.lock_timeout(Some(Duration::from_millis(20)), &mut sink);
            (result, sink.is_exception())
        });
        let (result, raised) = handle.join().unwrap();
        assert_eq!(result, AcquireResult::TimedOut);
        assert!(!raised);
        mutex.unlock();
    }
}
