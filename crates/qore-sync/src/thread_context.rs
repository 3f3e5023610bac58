//! Per-thread singleton owning the lock-acquisition stack, the current
//! program location, the debug-mode call stack, and per-thread resource
//! cleanup callbacks.

use crate::ids::{allocate_tid, LockId, Tid};
use qore_sink::{RaiseSink, SourceLocation, StackFrame};
use std::cell::RefCell;

/// An opaque handle under which a cleanup callback is registered. The
/// embedding layer mints these (typically from a pointer or resource id)
/// and uses them to remove a resource's cleanup before it runs normally,
/// e.g. after a clean `close()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceHandle(pub u64);

type CleanupFn = Box<dyn FnOnce(&mut dyn RaiseSink) + Send>;

struct ThreadResource {
    handle: ResourceHandle,
    cleanup: Option<CleanupFn>,
}

#[derive(Default)]
struct ThreadContextState {
    tid: Option<Tid>,
    lock_stack: Vec<(LockId, crate::ids::LockKind)>,
    location: SourceLocation,
    call_stack: Vec<StackFrame>,
    resources: Vec<ThreadResource>,
}

thread_local! {
    static CONTEXT: RefCell<ThreadContextState> = RefCell::new(ThreadContextState::default());
}

/// Handle to the calling OS thread's [`ThreadContext`]. All methods operate
/// on thread-local state; the handle itself carries no data.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadContext;

impl ThreadContext {
    /// The stable numeric id assigned to the current thread the first time
    /// it touches the runtime.
    pub fn current_tid() -> Tid {
        CONTEXT.with(|c| {
            let mut state = c.borrow_mut();
            *state.tid.get_or_insert_with(allocate_tid)
        })
    }

    /// Pushes a lock onto this thread's ownership stack. Called after a
    /// primitive's acquire succeeds.
    pub fn push_lock(id: LockId, kind: crate::ids::LockKind) {
        CONTEXT.with(|c| c.borrow_mut().lock_stack.push((id, kind)));
    }

    /// Removes a lock from this thread's ownership stack (on release).
    /// Locks need not be released in stack order (e.g. unlocking a mutex
    /// taken before an outer RW lock), so this removes the first matching
    /// entry rather than only the top.
    pub fn pop_lock(id: LockId) {
        CONTEXT.with(|c| {
            let mut state = c.borrow_mut();
            if let Some(pos) = state.lock_stack.iter().position(|(l, _)| *l == id) {
                state.lock_stack.remove(pos);
            }
        });
    }

    /// True iff this thread currently holds `id` (in any mode).
    pub fn holds_lock(id: LockId) -> bool {
        CONTEXT.with(|c| c.borrow().lock_stack.iter().any(|(l, _)| *l == id))
    }

    pub fn held_locks() -> Vec<LockId> {
        CONTEXT.with(|c| c.borrow().lock_stack.iter().map(|(l, _)| *l).collect())
    }

    /// Sets the program location used to enrich exceptions raised from
    /// this thread.
    pub fn set_location(location: SourceLocation) {
        CONTEXT.with(|c| c.borrow_mut().location = location);
    }

    pub fn location() -> SourceLocation {
        CONTEXT.with(|c| c.borrow().location.clone())
    }

    /// Pushes a debug-mode call-stack frame.
    pub fn push_frame(frame: StackFrame) {
        CONTEXT.with(|c| c.borrow_mut().call_stack.push(frame));
    }

    pub fn pop_frame() {
        CONTEXT.with(|c| {
            c.borrow_mut().call_stack.pop();
        });
    }

    /// A snapshot of the current call stack, youngest frame last, suitable
    /// for attaching to a freshly raised exception.
    pub fn call_stack_snapshot() -> Vec<StackFrame> {
        CONTEXT.with(|c| c.borrow().call_stack.clone())
    }

    /// Registers a cleanup callback invoked (in LIFO order, alongside any
    /// other registered resources) when the thread exits, normally or via
    /// an in-flight exception. Returns the handle it was registered under.
    pub fn register_thread_resource(
        handle: ResourceHandle,
        cleanup: impl FnOnce(&mut dyn RaiseSink) + Send + 'static,
    ) {
        CONTEXT.with(|c| {
            c.borrow_mut().resources.push(ThreadResource {
                handle,
                cleanup: Some(Box::new(cleanup)),
            })
        });
    }

    /// Removes a previously registered cleanup without running it, e.g.
    /// after the resource released itself normally.
    pub fn remove_thread_resource(handle: ResourceHandle) {
        CONTEXT.with(|c| {
            c.borrow_mut()
                .resources
                .retain(|r| r.handle != handle || r.cleanup.is_none());
        });
    }
}

impl Drop for ThreadContextState {
    fn drop(&mut self) {
        // Runs at thread exit (thread_local destructors run in the
        // reverse order they were initialized, here just this one cell).
        // Cleanups run LIFO: last-registered resource is released first,
        // matching a transaction gate opened after a connection was
        // opened being rolled back before the connection itself closes.
        struct LateSink;
        impl RaiseSink for LateSink {
            fn raise_tagged(&mut self, kind: qore_sink::ExceptionKind, tag: &str, message: String) {
                log::error!("thread-exit cleanup raised [{kind:?}] {tag}: {message}");
            }
        }
        let mut sink = LateSink;
        while let Some(mut resource) = self.resources.pop() {
            if let Some(cleanup) = resource.cleanup.take() {
                cleanup(&mut sink);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::LockKind;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn lock_stack_tracks_held_locks() {
        let id = LockId::next();
        assert!(!ThreadContext::holds_lock(id));
        ThreadContext::push_lock(id, LockKind::Mutex);
        assert!(ThreadContext::holds_lock(id));
        ThreadContext::pop_lock(id);
        assert!(!ThreadContext::holds_lock(id));
    }

    #[test]
    fn thread_exit_runs_cleanup_lifo() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let ran = Arc::new(AtomicBool::new(false));
        let order2 = order.clone();
        let ran2 = ran.clone();
        std::thread::spawn(move || {
            ThreadContext::register_thread_resource(ResourceHandle(1), {
                let order = order2.clone();
                move |_| order.lock().unwrap().push(1)
            });
            ThreadContext::register_thread_resource(ResourceHandle(2), {
                let order = order2.clone();
                move |_| order.lock().unwrap().push(2)
            });
            ran2.store(true, Ordering::SeqCst);
        })
        .join()
        .unwrap();
        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(*order.lock().unwrap(), vec![2, 1]);
    }
}
