//! A preferential read/write lock.
//!
//! Either a single writer thread holds the lock, a set of reader threads
//! hold it, or it is free. The write lock is not recursive for a thread
//! that already holds the read lock on the same lock (or vice versa) —
//! that combination raises `LOCK-ERROR` rather than blocking. A thread may
//! acquire the read lock multiple times; each acquisition must be matched
//! by a release. The `prefer_writers` / `prefer_readers` policy decides
//! whether a newly arriving reader jumps a queue of waiting writers
//! (`PreferReaders`, the default) or waits behind them (`PreferWriters`).

use crate::condvar::{QoreCondvar, WaitResult};
use crate::deadlock::DeadlockGraph;
use crate::ids::{LockId, LockKind, Tid};
use crate::mutex::AcquireResult;
use crate::thread_context::ThreadContext;
use qore_sink::{tags, ExceptionKind, RaiseSink};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar as StdCondvar, Mutex as StdMutex};
use std::time::{Duration, Instant};

/// Which side of a contended lock is favored when both a reader and a
/// writer are ready to proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RwPolicy {
    PreferReaders,
    PreferWriters,
}

impl Default for RwPolicy {
    fn default() -> Self {
        RwPolicy::PreferReaders
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Read(u32),
    Write,
}

#[derive(Default)]
struct RwState {
    reader_counts: HashMap<Tid, u32>,
    writer: Option<Tid>,
    waiting_writers: u32,
}

impl RwState {
    fn total_readers(&self) -> u32 {
        self.reader_counts.values().sum()
    }
}

pub struct RwLock {
    id: LockId,
    policy: RwPolicy,
    state: StdMutex<RwState>,
    cv: StdCondvar,
    deleted: AtomicBool,
}

impl RwLock {
    pub fn new(policy: RwPolicy) -> Self {
        Self {
            id: LockId::next(),
            policy,
            state: StdMutex::new(RwState::default()),
            cv: StdCondvar::new(),
            deleted: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> LockId {
        self.id
    }

    fn raise_deleted(&self, sink: &mut dyn RaiseSink) {
        sink.raise_tagged(
            ExceptionKind::System,
            tags::LOCK_ERROR,
            format!("{} was deleted in another thread", self.id),
        );
    }

    // ---- read side ----

    pub fn read_lock(&self, sink: &mut dyn RaiseSink) -> bool {
        matches!(self.read_lock_timeout(None, sink), AcquireResult::Acquired)
    }

    pub fn read_lock_timeout(
        &self,
        timeout: Option<Duration>,
        sink: &mut dyn RaiseSink,
    ) -> AcquireResult {
        if self.deleted.load(Ordering::SeqCst) {
            self.raise_deleted(sink);
            return AcquireResult::TimedOut;
        }

        let thread = ThreadContext::current_tid();
        {
            let state = self.state.lock().expect("rwlock state poisoned");
            if state.writer == Some(thread) {
                drop(state);
                sink.raise_tagged(
                    ExceptionKind::System,
                    tags::LOCK_ERROR,
                    format!("thread holds the write side of {}, cannot also read-lock", self.id),
                );
                return AcquireResult::TimedOut;
            }
            // Recursive re-acquire by a thread that already holds the
            // read lock never contends and is never itself a deadlock.
            if let Some(count) = state.reader_counts.get(&thread).copied() {
                drop(state);
                let mut state = self.state.lock().expect("rwlock state poisoned");
                state.reader_counts.insert(thread, count + 1);
                drop(state);
                ThreadContext::push_lock(self.id, LockKind::RwLockRead);
                return AcquireResult::Acquired;
            }
        }

        if let Err(info) = DeadlockGraph::global().try_acquire(thread, self.id, LockKind::RwLockRead) {
            sink.raise_tagged(
                ExceptionKind::System,
                tags::THREAD_DEADLOCK,
                info.to_string(),
            );
            return AcquireResult::TimedOut;
        }

        let deadline = timeout.map(|d| Instant::now() + d);
        let mut state = self.state.lock().expect("rwlock state poisoned");
        loop {
            let can_acquire = state.writer.is_none()
                && (self.policy == RwPolicy::PreferReaders || state.waiting_writers == 0);
            if can_acquire {
                *state.reader_counts.entry(thread).or_insert(0) += 1;
                break;
            }
            match deadline {
                None => {
                    state = self.cv.wait(state).expect("rwlock state poisoned");
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        DeadlockGraph::global().cancel_intent(thread);
                        return AcquireResult::TimedOut;
                    }
                    let (guard, result) = self
                        .cv
                        .wait_timeout(state, deadline - now)
                        .expect("rwlock state poisoned");
                    state = guard;
                    if result.timed_out() {
                        let can_acquire_now = state.writer.is_none()
                            && (self.policy == RwPolicy::PreferReaders || state.waiting_writers == 0);
                        if !can_acquire_now {
                            DeadlockGraph::global().cancel_intent(thread);
                            return AcquireResult::TimedOut;
                        }
                    }
                }
            }
        }
        drop(state);

        DeadlockGraph::global().commit_acquired(thread, self.id);
        ThreadContext::push_lock(self.id, LockKind::RwLockRead);
        AcquireResult::Acquired
    }

    pub fn read_unlock(&self) {
        let thread = ThreadContext::current_tid();
        ThreadContext::pop_lock(self.id);
        let mut state = self.state.lock().expect("rwlock state poisoned");
        let last = match state.reader_counts.get_mut(&thread) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => {
                state.reader_counts.remove(&thread);
                true
            }
            None => true,
        };
        let now_free = state.total_readers() == 0;
        drop(state);
        if last {
            DeadlockGraph::global().release(thread, self.id);
        }
        if now_free {
            self.cv.notify_all();
        }
    }

    // ---- write side ----

    pub fn write_lock(&self, sink: &mut dyn RaiseSink) -> bool {
        matches!(self.write_lock_timeout(None, sink), AcquireResult::Acquired)
    }

    pub fn write_lock_timeout(
        &self,
        timeout: Option<Duration>,
        sink: &mut dyn RaiseSink,
    ) -> AcquireResult {
        if self.deleted.load(Ordering::SeqCst) {
            self.raise_deleted(sink);
            return AcquireResult::TimedOut;
        }

        let thread = ThreadContext::current_tid();
        {
            let state = self.state.lock().expect("rwlock state poisoned");
            if state.writer == Some(thread) {
                drop(state);
                sink.raise_tagged(
                    ExceptionKind::System,
                    tags::LOCK_ERROR,
                    format!("thread already holds the write side of {}", self.id),
                );
                return AcquireResult::TimedOut;
            }
            if state.reader_counts.contains_key(&thread) {
                drop(state);
                sink.raise_tagged(
                    ExceptionKind::System,
                    tags::LOCK_ERROR,
                    format!("thread holds the read side of {}, cannot also write-lock", self.id),
                );
                return AcquireResult::TimedOut;
            }
        }

        if let Err(info) = DeadlockGraph::global().try_acquire(thread, self.id, LockKind::RwLockWrite) {
            sink.raise_tagged(
                ExceptionKind::System,
                tags::THREAD_DEADLOCK,
                info.to_string(),
            );
            return AcquireResult::TimedOut;
        }

        let deadline = timeout.map(|d| Instant::now() + d);
        let mut state = self.state.lock().expect("rwlock state poisoned");
        state.waiting_writers += 1;
        let result = loop {
            if state.writer.is_none() && state.total_readers() == 0 {
                state.writer = Some(thread);
                break AcquireResult::Acquired;
            }
            match deadline {
                None => {
                    state = self.cv.wait(state).expect("rwlock state poisoned");
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break AcquireResult::TimedOut;
                    }
                    let (guard, timeout_result) = self
                        .cv
                        .wait_timeout(state, deadline - now)
                        .expect("rwlock state poisoned");
                    state = guard;
                    if timeout_result.timed_out()
                        && !(state.writer.is_none() && state.total_readers() == 0)
                    {
                        break AcquireResult::TimedOut;
                    }
                }
            }
        };
        state.waiting_writers -= 1;
        drop(state);

        match result {
            AcquireResult::Acquired => {
                DeadlockGraph::global().commit_acquired(thread, self.id);
                ThreadContext::push_lock(self.id, LockKind::RwLockWrite);
            }
            AcquireResult::TimedOut => {
                DeadlockGraph::global().cancel_intent(thread);
            }
        }
        result
    }

    pub fn write_unlock(&self) {
        let thread = ThreadContext::current_tid();
        ThreadContext::pop_lock(self.id);
        {
            let mut state = self.state.lock().expect("rwlock state poisoned");
            state.writer = None;
        }
        DeadlockGraph::global().release(thread, self.id);
        self.cv.notify_all();
    }

    // ---- waitOn ----

    /// Atomically releases the caller's hold on this lock (remembering
    /// whether it was held for read — and at what recursion depth — or
    /// for write), waits on `cond`, then reacquires the same mode.
    /// Returns `None` if the calling thread does not currently hold this
    /// lock at all.
    pub fn wait_on(&self, cond: &QoreCondvar, timeout: Option<Duration>) -> Option<WaitResult> {
        let thread = ThreadContext::current_tid();
        let mode = {
            let state = self.state.lock().expect("rwlock state poisoned");
            if state.writer == Some(thread) {
                Mode::Write
            } else if let Some(&count) = state.reader_counts.get(&thread) {
                Mode::Read(count)
            } else {
                return None;
            }
        };

        let result = cond.wait(
            timeout,
            || self.release_mode(thread, mode),
            || self.reacquire_mode(thread, mode),
        );
        Some(result)
    }

    fn release_mode(&self, thread: Tid, mode: Mode) {
        ThreadContext::pop_lock(self.id);
        let now_free;
        {
            let mut state = self.state.lock().expect("rwlock state poisoned");
            match mode {
                Mode::Write => state.writer = None,
                Mode::Read(_) => {
                    state.reader_counts.remove(&thread);
                }
            }
            now_free = state.writer.is_none() && state.total_readers() == 0;
        }
        DeadlockGraph::global().release(thread, self.id);
        if now_free {
            self.cv.notify_all();
        }
    }

    fn reacquire_mode(&self, thread: Tid, mode: Mode) {
        let mut state = self.state.lock().expect("rwlock state poisoned");
        loop {
            let can_acquire = match mode {
                Mode::Write => state.writer.is_none() && state.total_readers() == 0,
                Mode::Read(_) => {
                    state.writer.is_none()
                        && (self.policy == RwPolicy::PreferReaders || state.waiting_writers == 0)
                }
            };
            if can_acquire {
                match mode {
                    Mode::Write => state.writer = Some(thread),
                    Mode::Read(count) => {
                        state.reader_counts.insert(thread, count);
                    }
                }
                break;
            }
            state = self.cv.wait(state).expect("rwlock state poisoned");
        }
        drop(state);
        DeadlockGraph::global().commit_acquired(thread, self.id);
        ThreadContext::push_lock(
            self.id,
            match mode {
                Mode::Write => LockKind::RwLockWrite,
                Mode::Read(_) => LockKind::RwLockRead,
            },
        );
    }
}

impl Drop for RwLock {
    fn drop(&mut self) {
        self.deleted.store(true, Ordering::SeqCst);
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
    fn multiple_readers_concurrent() {
        let lock = Arc::new(RwLock::new(RwPolicy::PreferReaders));
        let mut sink: ExceptionSink<String> = ExceptionSink::new();
        assert!(lock.read_lock(&mut sink));

        let l2 = lock.clone();
        let handle = thread::spawn(move || {
            let mut sink: ExceptionSink<String> = ExceptionSink::new();
            l2.read_lock(&mut sink)
        });
        assert!(handle.join().unwrap());
        lock.read_unlock();
        lock.read_unlock();
    }

    #[test]
    fn writer_excludes_readers() {
        let lock = Arc::new(RwLock::new(RwPolicy::PreferReaders));
        let mut sink: ExceptionSink<String> = ExceptionSink::new();
        assert!(lock.write_lock(&mut sink));

        let l2 = lock.clone();
        let handle = thread::spawn(move || {
            let mut sink: ExceptionSink<String> = ExceptionSink::new();
            l2.read_lock_timeout(Some(Duration::from_millis(30)), &mut sink)
        });
        assert_eq!(handle.join().unwrap(), AcquireResult::TimedOut);
        lock.write_unlock();
    }

    #[test]
    fn same_thread_read_then_write_is_lock_error() {
        let lock = RwLock::new(RwPolicy::PreferReaders);
        let mut sink: ExceptionSink<String> = ExceptionSink::new();
        assert!(lock.read_lock(&mut sink));
        assert!(!lock.write_lock(&mut sink));
        assert!(sink.is_exception());
        assert_eq!(sink.exceptions()[0].err, tags::LOCK_ERROR);
        lock.read_unlock();
    }

    #[test]
    fn recursive_read_lock_by_same_thread() {
        let lock = RwLock::new(RwPolicy::PreferReaders);
        let mut sink: ExceptionSink<String> = ExceptionSink::new();
        assert!(lock.read_lock(&mut sink));
        assert!(lock.read_lock(&mut sink));
        lock.read_unlock();
        lock.read_unlock();
    }

    #[test]
    fn wait_on_releases_and_reacquires_write() {
        let lock = Arc::new(RwLock::new(RwPolicy::PreferReaders));
        let cond = Arc::new(QoreCondvar::new());
        let mut sink: ExceptionSink<String> = ExceptionSink::new();
        assert!(lock.write_lock(&mut sink));

        let l2 = lock.clone();
        let c2 = cond.clone();
        let handle = thread::spawn(move || {
            // Another writer waits for the lock to be released by the
            // waitOn below, proving it really let go while parked.
            let mut sink: ExceptionSink<String> = ExceptionSink::new();
            assert!(l2.write_lock(&mut sink));
            l2.write_unlock();
            c2.signal();
        });

        let result = lock.wait_on(&cond, Some(Duration::from_secs(2)));
        assert_eq!(result, Some(WaitResult::Signaled));
        handle.join().unwrap();
        lock.write_unlock();
    }
}
