//! A fixed-min/max pool of [`ManagedResource`]s with thread-pinning
//! (component J), grounded on spec.md §4.J and
//! `original_source/include/qore/intern/DatasourcePool.h`'s
//! free-list-plus-thread-map allocation strategy.

use crate::managed_resource::{ManagedResource, RawResource, ResourceError};
use parking_lot::{Condvar, Mutex};
use qore_sink::{tags, ExceptionKind, RaiseSink};
use qore_sync::{ThreadContext, Tid};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

struct PoolState<R: RawResource> {
    resources: Vec<Arc<ManagedResource<R>>>,
    free: VecDeque<usize>,
    thread_map: HashMap<Tid, usize>,
    /// Indices of resources torn down after an abort and never replaced in
    /// place; `active_count` below treats these as not counting against
    /// `max`, so the pool can grow a fresh one on the next acquire.
    retired: HashSet<usize>,
}

impl<R: RawResource> PoolState<R> {
    fn active_count(&self) -> usize {
        self.resources.len() - self.retired.len()
    }
}

/// A pool of `R`-backed [`ManagedResource`]s, sized between `min` and
/// `max`, with per-thread transactional pinning (spec.md §4.J).
pub struct ResourcePool<R: RawResource + 'static> {
    max: usize,
    factory: Box<dyn Fn() -> R + Send + Sync>,
    auto_commit: bool,
    txn_timeout: Duration,
    state: Mutex<PoolState<R>>,
    cond: Condvar,
    wait_count: AtomicU32,
    valid: AtomicBool,
}

impl<R: RawResource + 'static> ResourcePool<R> {
    /// Constructs a pool pre-populated with `min` resources (opened lazily
    /// on first use, per [`ManagedResource`]'s own state machine) and
    /// capable of growing up to `max`.
    pub fn new(
        min: usize,
        max: usize,
        auto_commit: bool,
        txn_timeout: Duration,
        factory: impl Fn() -> R + Send + Sync + 'static,
    ) -> Self {
        assert!(min <= max && max > 0, "pool requires 0 < min <= max");
        let resources: Vec<_> = (0..min)
            .map(|_| Arc::new(ManagedResource::new(factory(), auto_commit, txn_timeout)))
            .collect();
        let free = (0..min).collect();
        Self {
            max,
            factory: Box::new(factory),
            auto_commit,
            txn_timeout,
            state: Mutex::new(PoolState {
                resources,
                free,
                thread_map: HashMap::new(),
                retired: HashSet::new(),
            }),
            cond: Condvar::new(),
            wait_count: AtomicU32::new(0),
            valid: AtomicBool::new(true),
        }
    }

    pub fn wait_count(&self) -> u32 {
        self.wait_count.load(Ordering::SeqCst)
    }

    /// Marks the pool invalid and wakes every waiter, who will observe
    /// `DATASOURCEPOOL-ERROR` instead of being handed a resource (spec.md
    /// §4.J's "on pool destruction during use"). A real teardown still
    /// requires every borrower to release its `Arc<ResourcePool<R>>`
    /// first; this method is the explicit trigger a graceful-shutdown
    /// sequence calls before dropping its own handle.
    pub fn invalidate(&self) {
        self.valid.store(false, Ordering::SeqCst);
        self.cond.notify_all();
    }

    /// Acquires a resource for the calling thread, per the allocation
    /// rules in spec.md §4.J: already-pinned resource, else a free one,
    /// else grow if under `max`, else wait. Returns the resource and
    /// whether it was freshly created by this call.
    pub fn acquire(&self, sink: &mut dyn RaiseSink) -> Option<(Arc<ManagedResource<R>>, bool)> {
        self.acquire_timeout(None, sink)
    }

    pub fn acquire_timeout(
        &self,
        timeout: Option<Duration>,
        sink: &mut dyn RaiseSink,
    ) -> Option<(Arc<ManagedResource<R>>, bool)> {
        let tid = ThreadContext::current_tid();
        let deadline = timeout.map(|d| Instant::now() + d);
        let mut state = self.state.lock();
        loop {
            if !self.valid.load(Ordering::SeqCst) {
                sink.raise_tagged(
                    ExceptionKind::System,
                    tags::DATASOURCEPOOL_ERROR,
                    "resource pool was destroyed while a thread was waiting".to_string(),
                );
                return None;
            }

            if let Some(&idx) = state.thread_map.get(&tid) {
                return Some((state.resources[idx].clone(), false));
            }
            if let Some(idx) = state.free.pop_front() {
                state.thread_map.insert(tid, idx);
                return Some((state.resources[idx].clone(), false));
            }
            if state.active_count() < self.max {
                let resource = Arc::new(ManagedResource::new(
                    (self.factory)(),
                    self.auto_commit,
                    self.txn_timeout,
                ));
                let idx = state.resources.len();
                state.resources.push(resource.clone());
                state.thread_map.insert(tid, idx);
                return Some((resource, true));
            }

            self.wait_count.fetch_add(1, Ordering::SeqCst);
            let timed_out = match deadline {
                None => {
                    self.cond.wait(&mut state);
                    false
                }
                Some(dl) => {
                    let now = Instant::now();
                    if now >= dl {
                        true
                    } else {
                        self.cond.wait_for(&mut state, dl - now).timed_out()
                    }
                }
            };
            self.wait_count.fetch_sub(1, Ordering::SeqCst);
            if timed_out {
                sink.raise_tagged(
                    ExceptionKind::System,
                    tags::DATASOURCEPOOL_TIMEOUT,
                    "timed out waiting for a pooled resource".to_string(),
                );
                return None;
            }
        }
    }

    /// Releases the calling thread's pinned resource, unless it is still
    /// in a transaction (spec.md §4.J: "If the thread is pinned and still
    /// in a transaction, keep the pinning"). A resource that reports
    /// itself aborted is retired instead of returned to the free list.
    pub fn release(&self, resource: Arc<ManagedResource<R>>) {
        if resource.in_transaction() {
            return;
        }
        let tid = ThreadContext::current_tid();
        let mut state = self.state.lock();
        let idx = match state.thread_map.remove(&tid) {
            Some(idx) => idx,
            None => return,
        };
        if resource.is_aborted() {
            state.retired.insert(idx);
        } else {
            state.free.push_back(idx);
        }
        drop(state);
        self.cond.notify_one();
    }
}

impl<R: RawResource + 'static> Drop for ResourcePool<R> {
    fn drop(&mut self) {
        self.valid.store(false, Ordering::SeqCst);
        self.cond.notify_all();
    }
}

/// What a [`PoolAction`] should do with the resource it acquires at
/// construction on its own `Drop`, per spec.md §4.J's "RAII-style" action
/// helper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolCommand {
    /// Neither acquires nor releases; a no-op helper for call sites that
    /// already hold a resource through some other path.
    None,
    /// Acquires a resource but leaves releasing it to the caller.
    Acquire,
    /// Acquires a resource and releases it back to the pool on drop.
    Release,
}

/// RAII helper: acquires a resource (per `command`) at construction,
/// releases it back to the pool on drop according to `command` and the
/// resource's own transaction state (still in a transaction? aborted? a
/// freshly grown resource?).
pub struct PoolAction<'a, R: RawResource + 'static> {
    pool: &'a ResourcePool<R>,
    resource: Option<Arc<ManagedResource<R>>>,
    command: PoolCommand,
    fresh: bool,
}

impl<'a, R: RawResource + 'static> PoolAction<'a, R> {
    pub fn new(
        pool: &'a ResourcePool<R>,
        command: PoolCommand,
        sink: &mut dyn RaiseSink,
    ) -> Option<Self> {
        match command {
            PoolCommand::None => Some(Self {
                pool,
                resource: None,
                command,
                fresh: false,
            }),
            PoolCommand::Acquire | PoolCommand::Release => {
                let (resource, fresh) = pool.acquire(sink)?;
                Some(Self {
                    pool,
                    resource: Some(resource),
                    command,
                    fresh,
                })
            }
        }
    }

    pub fn resource(&self) -> Option<&Arc<ManagedResource<R>>> {
        self.resource.as_ref()
    }

    pub fn is_fresh(&self) -> bool {
        self.fresh
    }
}

impl<'a, R: RawResource + 'static> Drop for PoolAction<'a, R> {
    fn drop(&mut self) {
        if self.command == PoolCommand::Release {
            if let Some(resource) = self.resource.take() {
                self.pool.release(resource);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qore_sink::ExceptionSink;
    use std::collections::HashMap as StdHashMap;
    use std::sync::atomic::AtomicBool as StdAtomicBool;

    #[derive(Default)]
    struct FakeConn {
        aborted: Arc<StdAtomicBool>,
    }

    impl RawResource for FakeConn {
        fn open(&mut self, _config: &StdHashMap<String, String>) -> Result<(), ResourceError> {
            Ok(())
        }
        fn close(&mut self) {}
        fn is_aborted(&self) -> bool {
            self.aborted.load(Ordering::SeqCst)
        }
    }

    fn sink() -> ExceptionSink<String> {
        ExceptionSink::new()
    }

    #[test]
    fn same_thread_reacquire_returns_same_resource() {
        let pool = ResourcePool::new(1, 1, true, Duration::from_millis(50), FakeConn::default);
        let mut s = sink();
        let (r1, fresh1) = pool.acquire(&mut s).unwrap();
        assert!(!fresh1);
        let (r2, fresh2) = pool.acquire(&mut s).unwrap();
        assert!(!fresh2);
        assert!(Arc::ptr_eq(&r1, &r2));
    }

    #[test]
    fn pool_grows_up_to_max() {
        let pool = Arc::new(ResourcePool::new(0, 2, true, Duration::from_millis(50), FakeConn::default));
        let mut s = sink();
        let (r1, fresh1) = pool.acquire(&mut s).unwrap();
        assert!(fresh1);
        let p2 = pool.clone();
        let handle = std::thread::spawn(move || {
            let mut s = sink();
            p2.acquire(&mut s)
        });
        let (r2, fresh2) = handle.join().unwrap().unwrap();
        assert!(fresh2);
        assert!(!Arc::ptr_eq(&r1, &r2));
    }

    #[test]
    fn contended_pool_times_out() {
        let pool = Arc::new(ResourcePool::new(1, 1, true, Duration::from_millis(50), FakeConn::default));
        let mut s = sink();
        let (_r1, _) = pool.acquire(&mut s).unwrap();

        let p2 = pool.clone();
        let handle = std::thread::spawn(move || {
            let mut s: ExceptionSink<String> = ExceptionSink::new();
            let result = p2.acquire_timeout(Some(Duration::from_millis(30)), &mut s);
            (result.is_none(), s.is_exception())
        });
        let (timed_out, raised) = handle.join().unwrap();
        assert!(timed_out);
        assert!(raised);
    }

    #[test]
    fn aborted_resource_is_retired_not_reused() {
        let aborted = Arc::new(StdAtomicBool::new(false));
        let aborted2 = aborted.clone();
        let pool = ResourcePool::new(0, 1, true, Duration::from_millis(50), move || FakeConn {
            aborted: aborted2.clone(),
        });
        let mut s = sink();
        let (r1, _) = pool.acquire(&mut s).unwrap();
        aborted.store(true, Ordering::SeqCst);
        pool.release(r1);
        assert_eq!(pool.state.lock().retired.len(), 1);
        assert_eq!(pool.state.lock().free.len(), 0);
    }
}
