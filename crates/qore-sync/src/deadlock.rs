//! Cycle detection across the process's blocking primitives.
//!
//! Every acquire that would block first publishes an intent edge
//! (`thread -> lock it wants`) and walks the transitive closure of
//! `lock -> owning threads -> their own waiting_on edge` looking for a
//! path back to a lock already owned by the acquiring thread. If one
//! exists, the acquire raises `THREAD-DEADLOCK` instead of blocking, even
//! under a timeout: a deadlock is a programming bug, not a race to avoid
//! eagerly raising on.

use crate::ids::{LockId, LockKind, Tid};
use once_cell::sync::Lazy;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use thiserror::Error;

/// Describes the cycle found by [`DeadlockGraph::try_acquire`]. Its
/// `Display` impl (via `thiserror`) is the exact `THREAD-DEADLOCK` message
/// every primitive (`QoreMutex`, `RwLock`) raises onto its `sink`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("deadlock detected: thread {acquirer} waiting on {acquirer_wants} ({kind}) held by thread {conflicting_thread}")]
pub struct DeadlockInfo {
    pub acquirer: Tid,
    pub acquirer_wants: LockId,
    pub kind: LockKind,
    /// A thread that (transitively) owns `acquirer_wants` and is itself
    /// blocked waiting on something `acquirer` owns.
    pub conflicting_thread: Tid,
}

#[derive(Default)]
struct GraphState {
    /// lock -> set of threads currently holding it (more than one entry
    /// only for a read-held RwLock).
    owners: HashMap<LockId, HashSet<Tid>>,
    /// thread -> the single lock it is currently blocked trying to
    /// acquire, if any.
    waiting_on: HashMap<Tid, LockId>,
}

/// Process-wide deadlock detector. One instance backs every
/// [`crate::mutex::QoreMutex`] and [`crate::rwlock::RwLock`] in the
/// process; primitives never construct their own.
pub struct DeadlockGraph {
    state: Mutex<GraphState>,
}

static GLOBAL: Lazy<DeadlockGraph> = Lazy::new(DeadlockGraph::new);

impl DeadlockGraph {
    fn new() -> Self {
        Self {
            state: Mutex::new(GraphState::default()),
        }
    }

    /// The single process-wide graph.
    pub fn global() -> &'static DeadlockGraph {
        &GLOBAL
    }

    /// Publishes `thread`'s intent to acquire `lock` (of `kind`) and
    /// checks for a cycle. On success the intent is recorded so a
    /// subsequent `owners_of` walk from another thread sees it; the caller
    /// is expected to block afterwards. On failure no intent is recorded
    /// and the caller must not block.
    pub fn try_acquire(&self, thread: Tid, lock: LockId, kind: LockKind) -> Result<(), DeadlockInfo> {
        let mut state = self.state.lock().expect("deadlock graph poisoned");

        if let Some(conflict) = Self::detect_cycle(&state, thread, lock) {
            return Err(DeadlockInfo {
                acquirer: thread,
                acquirer_wants: lock,
                kind,
                conflicting_thread: conflict,
            });
        }

        state.waiting_on.insert(thread, lock);
        Ok(())
    }

    /// Walks `lock`'s current owners and their own `waiting_on` edges,
    /// returning the first owner thread found to be part of a cycle that
    /// would eventually lead back to `thread`.
    fn detect_cycle(state: &GraphState, thread: Tid, lock: LockId) -> Option<Tid> {
        let mut visited: HashSet<Tid> = HashSet::new();
        let mut frontier: Vec<Tid> = state
            .owners
            .get(&lock)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();

        while let Some(owner) = frontier.pop() {
            if owner == thread {
                return Some(owner);
            }
            if !visited.insert(owner) {
                continue;
            }
            if let Some(next_lock) = state.waiting_on.get(&owner) {
                if let Some(next_owners) = state.owners.get(next_lock) {
                    frontier.extend(next_owners.iter().copied());
                }
            }
        }
        None
    }

    /// Called once the blocking acquire actually succeeds: clears the
    /// thread's waiting-on edge and records it as an owner.
    pub fn commit_acquired(&self, thread: Tid, lock: LockId) {
        let mut state = self.state.lock().expect("deadlock graph poisoned");
        state.waiting_on.remove(&thread);
        state.owners.entry(lock).or_default().insert(thread);
    }

    /// Cancels a pending intent without acquiring (used when a cycle was
    /// detected, or the caller gave up for another reason before
    /// blocking).
    pub fn cancel_intent(&self, thread: Tid) {
        let mut state = self.state.lock().expect("deadlock graph poisoned");
        state.waiting_on.remove(&thread);
    }

    /// Records `lock` as released by `thread`.
    pub fn release(&self, thread: Tid, lock: LockId) {
        let mut state = self.state.lock().expect("deadlock graph poisoned");
        if let Some(owners) = state.owners.get_mut(&lock) {
            owners.remove(&thread);
            if owners.is_empty() {
                state.owners.remove(&lock);
            }
        }
    }

    /// Drops every trace of `lock` from the graph, used when a primitive
    /// is destroyed while threads still hold or wait on it.
    pub fn forget_lock(&self, lock: LockId) {
        let mut state = self.state.lock().expect("deadlock graph poisoned");
        state.owners.remove(&lock);
        state.waiting_on.retain(|_, l| *l != lock);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_cycle_when_uncontended() {
        let g = DeadlockGraph::new();
        let t1 = Tid::test_new(1);
        let lock = LockId::test_new(1);
        assert!(g.try_acquire(t1, lock, LockKind::Mutex).is_ok());
        g.commit_acquired(t1, lock);
    }

    #[test]
    fn detects_two_thread_cycle() {
        let g = DeadlockGraph::new();
        let t1 = Tid::test_new(1);
        let t2 = Tid::test_new(2);
        let a = LockId::test_new(1);
        let b = LockId::test_new(2);

        // T1 owns A, T2 owns B.
        g.try_acquire(t1, a, LockKind::Mutex).unwrap();
        g.commit_acquired(t1, a);
        g.try_acquire(t2, b, LockKind::Mutex).unwrap();
        g.commit_acquired(t2, b);

        // T1 wants B (owned by T2, who owns nothing else yet): fine, T1 blocks.
        assert!(g.try_acquire(t1, b, LockKind::Mutex).is_ok());

        // T2 wants A (owned by T1, who is waiting on B which T2 owns): cycle.
        let err = g.try_acquire(t2, a, LockKind::Mutex).unwrap_err();
        assert_eq!(err.acquirer, t2);
        assert_eq!(err.acquirer_wants, a);
    }
}
