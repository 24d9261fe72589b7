//! WaitGroup: wait for a counted set of tasks to finish
//!
//! At most one waiter is supported; a second concurrent waiter and calling
//! `done()` more often than the count allows are both caller bugs and abort.

use super::{CoWaiter, lock};
use crate::sched;
use coil_core::fatal;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock, PoisonError};

enum Waiter {
    Idle,
    Coroutine(CoWaiter),
    Thread,
    /// The blocked thread has been released but has not woken yet.
    Released,
}

struct Inner {
    count: AtomicU32,
    waiter: Mutex<Waiter>,
    cv: OnceLock<Condvar>,
}

#[derive(Clone)]
pub struct WaitGroup {
    inner: Arc<Inner>,
}

impl Default for WaitGroup {
    fn default() -> Self {
        Self::new(0)
    }
}

impl WaitGroup {
    pub fn new(n: u32) -> Self {
        Self {
            inner: Arc::new(Inner {
                count: AtomicU32::new(n),
                waiter: Mutex::new(Waiter::Idle),
                cv: OnceLock::new(),
            }),
        }
    }

    /// Add `n` to the count.
    pub fn add(&self, n: u32) {
        self.inner.count.fetch_add(n, Ordering::AcqRel);
    }

    /// Mark one task finished, waking the waiter when the count hits zero.
    pub fn done(&self) {
        let prev = self.inner.count.fetch_sub(1, Ordering::AcqRel);
        if prev == 0 {
            fatal!("WaitGroup::done() called more times than the count");
        }
        if prev != 1 {
            return;
        }

        let mut waiter = lock(&self.inner.waiter);
        match std::mem::replace(&mut *waiter, Waiter::Idle) {
            Waiter::Coroutine(co) => {
                drop(waiter);
                co.wake();
            }
            Waiter::Thread => {
                *waiter = Waiter::Released;
                drop(waiter);
                if let Some(cv) = self.inner.cv.get() {
                    cv.notify_one();
                }
            }
            other => *waiter = other,
        }
    }

    /// Block until the count reaches zero. Returns at once if it already is.
    pub fn wait(&self) {
        let mut waiter = lock(&self.inner.waiter);
        if self.inner.count.load(Ordering::Acquire) == 0 {
            return;
        }
        if !matches!(*waiter, Waiter::Idle) {
            fatal!("WaitGroup supports a single waiter");
        }

        if let Some(sched) = sched::current_coroutine() {
            *waiter = Waiter::Coroutine(CoWaiter::current(sched));
            drop(waiter);
            sched.yield_now();
            return;
        }

        *waiter = Waiter::Thread;
        let cv = self.inner.cv.get_or_init(Condvar::new);
        while matches!(*waiter, Waiter::Thread) {
            waiter = cv.wait(waiter).unwrap_or_else(PoisonError::into_inner);
        }
        *waiter = Waiter::Idle;
    }

    /// Current count.
    pub fn count(&self) -> u32 {
        self.inner.count.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_zero_count_returns_immediately() {
        let wg = WaitGroup::new(0);
        wg.wait();
        wg.wait();
    }

    #[test]
    fn test_thread_waiter_released_by_last_done() {
        let wg = WaitGroup::new(0);
        wg.add(8);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let wg = wg.clone();
                thread::spawn(move || wg.done())
            })
            .collect();
        wg.wait();
        assert_eq!(wg.count(), 0);
        for h in handles {
            h.join().unwrap();
        }

        // Reusable after reaching zero.
        wg.add(1);
        let wg2 = wg.clone();
        let h = thread::spawn(move || wg2.done());
        wg.wait();
        h.join().unwrap();
    }
}
