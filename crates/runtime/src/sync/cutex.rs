//! Cutex: a mutex that suspends coroutines instead of blocking threads
//!
//! Waiters queue in FIFO order. `unlock` never releases the lock while
//! someone is queued; ownership passes straight to the head of the queue,
//! which resumes already holding it. A plain thread waiting on the lock is
//! given a ticket and sleeps on the condvar until its ticket is handed the
//! lock.

use super::{CoWaiter, lock};
use crate::sched;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, OnceLock, PoisonError};

enum Waiter {
    Coroutine(CoWaiter),
    Thread(u64),
}

#[derive(Default)]
struct State {
    locked: bool,
    waiters: VecDeque<Waiter>,
    /// Thread ticket that has been handed the lock but not yet woken.
    handoff: Option<u64>,
    next_ticket: u64,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    cv: OnceLock<Condvar>,
}

/// Mutual exclusion usable from coroutines and threads alike.
///
/// Unlike `std::sync::Mutex` it guards no data: pair it with the data by
/// convention, or take a [`CutexGuard`] for scoped locking.
#[derive(Clone, Default)]
pub struct Cutex {
    inner: Arc<Inner>,
}

impl Cutex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock, suspending the caller while it is held elsewhere.
    pub fn lock(&self) {
        let mut st = lock(&self.inner.state);
        if !st.locked {
            st.locked = true;
            return;
        }

        if let Some(sched) = sched::current_coroutine() {
            st.waiters
                .push_back(Waiter::Coroutine(CoWaiter::current(sched)));
            drop(st);
            // Resumed by `unlock` with the lock already ours.
            sched.yield_now();
            return;
        }

        let ticket = st.next_ticket;
        st.next_ticket += 1;
        st.waiters.push_back(Waiter::Thread(ticket));
        let cv = self.inner.cv.get_or_init(Condvar::new);
        while st.handoff != Some(ticket) {
            st = cv.wait(st).unwrap_or_else(PoisonError::into_inner);
        }
        st.handoff = None;
    }

    /// Acquire the lock only if it is free right now.
    pub fn try_lock(&self) -> bool {
        let mut st = lock(&self.inner.state);
        if st.locked {
            false
        } else {
            st.locked = true;
            true
        }
    }

    /// Release the lock, handing it to the longest waiter if there is one.
    pub fn unlock(&self) {
        let mut st = lock(&self.inner.state);
        debug_assert!(st.locked, "unlock of an unlocked Cutex");
        match st.waiters.pop_front() {
            None => st.locked = false,
            Some(Waiter::Coroutine(waiter)) => {
                drop(st);
                waiter.wake();
            }
            Some(Waiter::Thread(ticket)) => {
                st.handoff = Some(ticket);
                drop(st);
                if let Some(cv) = self.inner.cv.get() {
                    cv.notify_all();
                }
            }
        }
    }

    /// Lock and return a guard that unlocks on drop.
    pub fn guard(&self) -> CutexGuard<'_> {
        self.lock();
        CutexGuard { cutex: self }
    }

    pub fn is_locked(&self) -> bool {
        lock(&self.inner.state).locked
    }
}

/// Scoped lock on a [`Cutex`].
#[must_use = "the Cutex is unlocked as soon as the guard is dropped"]
pub struct CutexGuard<'a> {
    cutex: &'a Cutex,
}

impl Drop for CutexGuard<'_> {
    fn drop(&mut self) {
        self.cutex.unlock();
    }
}
