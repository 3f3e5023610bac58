//! A condition variable usable with any of the runtime's own lock
//! primitives, since [`crate::mutex::QoreMutex`] and
//! [`crate::rwlock::RwLock`] are not `std::sync::Mutex`-shaped and so
//! cannot use `std::sync::Condvar` directly.
//!
//! The wait protocol is generation-counter based: `wait` samples the
//! generation under the condvar's own internal lock, releases the
//! caller's lock via a supplied closure, blocks until the generation
//! changes (a signal/broadcast bumps it) or a timeout elapses, then
//! reacquires the caller's lock via another supplied closure. This makes
//! the "atomically release X, wait, reacquire X" protocol work for any X
//! without the condvar needing to know X's shape.

use std::sync::{Condvar as StdCondvar, Mutex as StdMutex};
use std::time::Duration;

/// Outcome of a [`QoreCondvar::wait`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    Signaled,
    TimedOut,
}

pub struct QoreCondvar {
    generation: StdMutex<u64>,
    cv: StdCondvar,
}

impl Default for QoreCondvar {
    fn default() -> Self {
        Self::new()
    }
}

impl QoreCondvar {
    pub fn new() -> Self {
        Self {
            generation: StdMutex::new(0),
            cv: StdCondvar::new(),
        }
    }

    /// Atomically (with respect to `signal`/`broadcast`) releases the
    /// caller's lock via `release`, waits for a signal or `timeout`, then
    /// reacquires it via `reacquire`. `release` and `reacquire` are run
    /// while this condvar's own internal lock is held, so a signal that
    /// arrives after `release` runs but before the wait begins is never
    /// missed.
    pub fn wait(
        &self,
        timeout: Option<Duration>,
        release: impl FnOnce(),
        reacquire: impl FnOnce(),
    ) -> WaitResult {
        let mut gen_guard = self.generation.lock().expect("condvar state poisoned");
        let start_gen = *gen_guard;
        release();

        let result = match timeout {
            None => {
                gen_guard = self
                    .cv
                    .wait_while(gen_guard, |g| *g == start_gen)
                    .expect("condvar state poisoned");
                WaitResult::Signaled
            }
            Some(timeout) => {
                let (guard, timeout_result) = self
                    .cv
                    .wait_timeout_while(gen_guard, timeout, |g| *g == start_gen)
                    .expect("condvar state poisoned");
                gen_guard = guard;
                if timeout_result.timed_out() {
                    WaitResult::TimedOut
                } else {
                    WaitResult::Signaled
                }
            }
        };

        drop(gen_guard);
        reacquire();
        result
    }

    /// Wakes exactly one waiter.
    pub fn signal(&self) {
        *self.generation.lock().expect("condvar state poisoned") += 1;
        self.cv.notify_one();
    }

    /// Wakes every waiter.
    pub fn broadcast(&self) {
        *self.generation.lock().expect("condvar state poisoned") += 1;
        self.cv.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutex::QoreMutex;
    use qore_sink::ExceptionSink;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn signal_wakes_waiter() {
        let mutex = Arc::new(QoreMutex::new());
        let cv = Arc::new(QoreCondvar::new());
        let mut sink: ExceptionSink<String> = ExceptionSink::new();
        assert!(mutex.lock(&mut sink));

        let m2 = mutex.clone();
        let cv2 = cv.clone();
        let handle = thread::spawn(move || {
            let mut sink: ExceptionSink<String> = ExceptionSink::new();
            assert!(m2.lock(&mut sink));
            let result = cv2.wait(None, || m2.release_for_wait(), || m2.reacquire_after_wait());
            m2.unlock();
            result
        });

        thread::sleep(Duration::from_millis(30));
        cv.signal();
        mutex.unlock();
        assert_eq!(handle.join().unwrap(), WaitResult::Signaled);
    }

    #[test]
    fn wait_times_out_without_signal() {
        let mutex = Arc::new(QoreMutex::new());
        let cv = QoreCondvar::new();
        let mut sink: ExceptionSink<String> = ExceptionSink::new();
        assert!(mutex.lock(&mut sink));
        let result = cv.wait(
            Some(Duration::from_millis(20)),
            || mutex.release_for_wait(),
            || mutex.reacquire_after_wait(),
        );
        assert_eq!(result, WaitResult::TimedOut);
        mutex.unlock();
    }
}
