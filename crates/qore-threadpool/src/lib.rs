//! A submission queue over bounded, idle-released worker threads
//! (component K), grounded on spec.md §4.K and
//! `original_source/include/qore/intern/ThreadPool.h`'s idle-worker/
//! submission-queue split.
//!
//! Every task runs against a fresh [`qore_sink::ExceptionSink`]; an
//! uncaught exception is drained by the default handler rather than
//! propagated anywhere, since there is no caller left to hand it to once
//! the task has been handed off to a worker thread.
//!
//! **Open Question resolution** (spec.md §4.K's two-phase stop, and the
//! apparent tension between the Cancellation paragraph's "stop() does not
//! return until all workers are done" and the Two-phase-stop paragraph's
//! "setting stop alone lets in-flight tasks finish"): [`ThreadPool::stop`]
//! is the non-blocking half — it rejects new submissions, runs the
//! cancel-callable of everything still queued, wakes idle workers so they
//! exit, and returns without waiting for a worker that is mid-task;
//! [`ThreadPool::stop_wait`] additionally blocks until every worker
//! (including ones mid-task when it was called) has exited. This reads
//! the "does not return until all workers are done" sentence as
//! describing the stronger `confirm` variant the following paragraph
//! names, not bare `stop()`. See DESIGN.md.

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::{Condvar, Mutex};
use qore_sink::{tags, ExceptionKind, ExceptionSink, RaiseSink};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// An invalid [`ThreadPoolConfig`], caught before any worker thread is
/// spawned. Misconfiguration here is a construction-time programmer error
/// rather than a runtime condition, so it is this crate's one non-exception
/// failure mode — it has nowhere to raise onto, since there is no
/// `ExceptionSink` until a pool already exists.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ThreadPoolConfigError {
    #[error("min_idle ({min_idle}) exceeds max ({max})")]
    MinIdleExceedsMax { min_idle: usize, max: usize },
}

type TaskFn<V> = Box<dyn FnOnce(&mut ExceptionSink<V>) + Send>;
type CancelFn = Box<dyn FnOnce() + Send>;

struct Task<V> {
    run: TaskFn<V>,
    cancel: Option<CancelFn>,
}

enum QueueItem<V> {
    Task(Task<V>),
    /// Wakes exactly one blocked worker so it can notice the stop flag
    /// and exit, without being mistaken for real work.
    Poison,
}

/// Construction-time parameters for a [`ThreadPool`], per spec.md §3's
/// field list.
#[derive(Debug, Clone, Copy)]
pub struct ThreadPoolConfig {
    /// Maximum worker count; `0` means unlimited.
    pub max: usize,
    pub min_idle: usize,
    pub max_idle: usize,
    /// How long an idle worker above `min_idle` waits for a task before
    /// releasing itself.
    pub release: Duration,
}

impl Default for ThreadPoolConfig {
    fn default() -> Self {
        Self {
            max: 0,
            min_idle: 0,
            max_idle: num_cpus::get(),
            release: Duration::from_secs(30),
        }
    }
}

#[derive(Default)]
struct PoolState {
    total_workers: usize,
    idle_workers: usize,
    stopping: bool,
    confirm: bool,
}

struct PoolInner<V> {
    config: ThreadPoolConfig,
    sender: Sender<QueueItem<V>>,
    receiver: Receiver<QueueItem<V>>,
    state: Mutex<PoolState>,
    stop_cv: Condvar,
}

/// A bounded pool of worker threads draining a shared submission queue.
pub struct ThreadPool<V> {
    inner: Arc<PoolInner<V>>,
}

impl<V> Clone for ThreadPool<V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<V> ThreadPool<V>
where
    V: From<String> + fmt::Display + Send + 'static,
{
    /// Builds a pool, pre-spawning `min_idle` workers. Panics if `config`
    /// is invalid; use [`ThreadPool::try_new`] to handle that case instead.
    pub fn new(config: ThreadPoolConfig) -> Self {
        Self::try_new(config).expect("invalid ThreadPoolConfig")
    }

    /// As [`ThreadPool::new`], but reports an invalid `config` as an error
    /// instead of panicking.
    pub fn try_new(config: ThreadPoolConfig) -> Result<Self, ThreadPoolConfigError> {
        if config.max != 0 && config.min_idle > config.max {
            return Err(ThreadPoolConfigError::MinIdleExceedsMax {
                min_idle: config.min_idle,
                max: config.max,
            });
        }
        let (sender, receiver) = crossbeam::channel::unbounded();
        let pool = Self {
            inner: Arc::new(PoolInner {
                config,
                sender,
                receiver,
                state: Mutex::new(PoolState::default()),
                stop_cv: Condvar::new(),
            }),
        };
        for _ in 0..config.min_idle {
            pool.spawn_worker();
        }
        Ok(pool)
    }

    pub fn total_workers(&self) -> usize {
        self.inner.state.lock().total_workers
    }

    pub fn idle_workers(&self) -> usize {
        self.inner.state.lock().idle_workers
    }

    fn spawn_worker(&self) {
        {
            let mut state = self.inner.state.lock();
            state.total_workers += 1;
        }
        let inner = self.inner.clone();
        std::thread::spawn(move || Self::worker_loop(inner));
    }

    /// `submit(task, cancel)`: schedules `task`, spawning a new worker if
    /// none is idle and the pool has room to grow. Returns `0` on success,
    /// `-1` with a `THREADPOOL-ERROR` on `sink` if the pool is stopping.
    pub fn submit(
        &self,
        task: impl FnOnce(&mut ExceptionSink<V>) + Send + 'static,
        cancel: Option<impl FnOnce() + Send + 'static>,
        sink: &mut dyn RaiseSink,
    ) -> i32 {
        let need_new_worker = {
            let mut state = self.inner.state.lock();
            if state.stopping {
                drop(state);
                sink.raise_tagged(
                    ExceptionKind::System,
                    tags::THREADPOOL_ERROR,
                    "thread pool is stopping; submission rejected".to_string(),
                );
                return -1;
            }
            let grow = state.idle_workers == 0
                && (self.inner.config.max == 0 || state.total_workers < self.inner.config.max);
            if grow {
                state.total_workers += 1;
            }
            grow
        };

        let item = QueueItem::Task(Task {
            run: Box::new(task),
            cancel: cancel.map(|c| Box::new(c) as CancelFn),
        });
        let _ = self.inner.sender.send(item);

        if need_new_worker {
            let inner = self.inner.clone();
            std::thread::spawn(move || Self::worker_loop(inner));
        }
        0
    }

    fn worker_loop(inner: Arc<PoolInner<V>>) {
        loop {
            {
                let mut state = inner.state.lock();
                state.idle_workers += 1;
            }
            let should_time_out = inner.state.lock().idle_workers > inner.config.min_idle;
            let recv_result = if should_time_out {
                inner.receiver.recv_timeout(inner.config.release)
            } else {
                inner.receiver.recv().map_err(|_| RecvTimeoutError::Disconnected)
            };
            {
                let mut state = inner.state.lock();
                state.idle_workers = state.idle_workers.saturating_sub(1);
            }

            match recv_result {
                Ok(QueueItem::Poison) => break,
                Ok(QueueItem::Task(task)) => {
                    let mut sink: ExceptionSink<V> = ExceptionSink::new();
                    (task.run)(&mut sink);
                    if sink.is_exception() {
                        sink.run_default_handler();
                    }
                    if inner.state.lock().stopping {
                        break;
                    }
                }
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        let mut state = inner.state.lock();
        state.total_workers = state.total_workers.saturating_sub(1);
        if state.confirm && state.total_workers == 0 {
            inner.stop_cv.notify_all();
        }
    }

    /// Rejects new submissions, runs the cancel-callable of every task
    /// still in the queue, wakes idle workers so they exit, and returns
    /// without waiting for a worker mid-task to finish.
    pub fn stop(&self) {
        self.do_stop(false);
    }

    /// As [`ThreadPool::stop`], but blocks until every worker — including
    /// ones that were executing a task when this was called — has exited.
    pub fn stop_wait(&self) {
        self.do_stop(true);
    }

    fn do_stop(&self, confirm: bool) {
        let total = {
            let mut state = self.inner.state.lock();
            if state.stopping {
                state.confirm = state.confirm || confirm;
                state.total_workers
            } else {
                state.stopping = true;
                state.confirm = confirm;
                state.total_workers
            }
        };

        while let Ok(item) = self.inner.receiver.try_recv() {
            if let QueueItem::Task(task) = item {
                if let Some(cancel) = task.cancel {
                    cancel();
                }
            }
        }

        for _ in 0..total {
            let _ = self.inner.sender.send(QueueItem::Poison);
        }

        if confirm {
            let mut state = self.inner.state.lock();
            while state.total_workers > 0 {
                self.inner.stop_cv.wait(&mut state);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    struct NullSink;
    impl RaiseSink for NullSink {
        fn raise_tagged(&mut self, _kind: ExceptionKind, _tag: &str, _message: String) {}
    }

    #[test]
    fn submit_runs_task() {
        let pool: ThreadPool<String> = ThreadPool::new(ThreadPoolConfig {
            max: 2,
            min_idle: 1,
            max_idle: 2,
            release: Duration::from_millis(200),
        });
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        let mut sink = NullSink;
        let result = pool.submit(
            move |_sink| {
                ran2.fetch_add(1, Ordering::SeqCst);
            },
            None::<fn()>,
            &mut sink,
        );
        assert_eq!(result, 0);
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        pool.stop_wait();
    }

    #[test]
    fn stop_cancels_pending_tasks_exactly_once() {
        // spec.md §8 scenario 5, scaled down.
        let pool: ThreadPool<String> = ThreadPool::new(ThreadPoolConfig {
            max: 1,
            min_idle: 1,
            max_idle: 1,
            release: Duration::from_secs(5),
        });
        let cancel_calls = Arc::new(StdMutex::new(Vec::new()));

        let mut sink = NullSink;
        // Occupy the single worker with a long-running task.
        let (tx, rx) = crossbeam::channel::bounded::<()>(0);
        pool.submit(
            move |_sink| {
                let _ = rx.recv_timeout(Duration::from_secs(2));
            },
            None::<fn()>,
            &mut sink,
        );

        for i in 0..3 {
            let calls = cancel_calls.clone();
            pool.submit(
                move |_sink| {},
                Some(move || calls.lock().unwrap().push(i)),
                &mut sink,
            );
        }

        std::thread::sleep(Duration::from_millis(50));
        pool.stop();
        let _ = tx.send(());
        assert_eq!(cancel_calls.lock().unwrap().len(), 3);
    }

    #[test]
    fn try_new_rejects_min_idle_above_max() {
        let err = ThreadPool::<String>::try_new(ThreadPoolConfig {
            max: 2,
            min_idle: 3,
            max_idle: 2,
            release: Duration::from_secs(5),
        })
        .unwrap_err();
        assert_eq!(
            err,
            ThreadPoolConfigError::MinIdleExceedsMax { min_idle: 3, max: 2 }
        );
    }

    #[test]
    fn idle_workers_above_min_release_after_timeout() {
        let pool: ThreadPool<String> = ThreadPool::new(ThreadPoolConfig {
            max: 4,
            min_idle: 0,
            max_idle: 4,
            release: Duration::from_millis(30),
        });
        let mut sink = NullSink;
        pool.submit(move |_sink| {}, None::<fn()>, &mut sink);
        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(pool.total_workers(), 0);
    }
}
