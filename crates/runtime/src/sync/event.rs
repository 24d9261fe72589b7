//! Event: a signal that coroutines and threads can wait on
//!
//! `signal()` wakes everyone waiting at that moment. Whether the event stays
//! signaled afterwards depends on the reset mode:
//!
//! - auto-reset: a signal that found nobody waiting is latched and consumed
//!   by exactly one later wait; a signal that woke someone is not latched.
//! - manual-reset: the event stays signaled until `reset()`, including
//!   after a signal that woke waiters, so later waits pass straight through.
//!
//! Timed coroutine waits race their timer against `signal()` through a
//! shared [`WaitNode`]: whichever side moves the node out of `Waiting` first
//! resumes the coroutine, the other side leaves it alone. Queue entries
//! whose node already timed out are skipped by `signal()` and purged lazily
//! by later waits.

use super::{CoWaiter, lock};
use crate::sched;
use coil_core::WaitNode;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, OnceLock, PoisonError};
use std::time::{Duration, Instant};

struct Waiter {
    waiter: CoWaiter,
    node: Arc<WaitNode>,
}

struct State {
    signaled: bool,
    waiters: VecDeque<Waiter>,
    /// Threads currently blocked on the condvar.
    thread_waiters: usize,
    /// Bumped by every signal that releases blocked threads.
    generation: u64,
}

struct Inner {
    manual_reset: bool,
    state: Mutex<State>,
    cv: OnceLock<Condvar>,
}

/// Event usable from coroutines and threads alike.
#[derive(Clone)]
pub struct Event {
    inner: Arc<Inner>,
}

impl Default for Event {
    /// An auto-reset event, initially not signaled.
    fn default() -> Self {
        Self::new(false, false)
    }
}

impl Event {
    pub fn new(manual_reset: bool, signaled: bool) -> Self {
        Self {
            inner: Arc::new(Inner {
                manual_reset,
                state: Mutex::new(State {
                    signaled,
                    waiters: VecDeque::new(),
                    thread_waiters: 0,
                    generation: 0,
                }),
                cv: OnceLock::new(),
            }),
        }
    }

    /// Wait until the event is signaled.
    pub fn wait(&self) {
        self.wait_inner(None);
    }

    /// Wait at most `ms` milliseconds. Returns `false` only on timeout.
    ///
    /// `wait_for(0)` polls: it consumes a latched signal if there is one and
    /// never suspends.
    pub fn wait_for(&self, ms: u32) -> bool {
        self.wait_inner(Some(ms))
    }

    fn wait_inner(&self, ms: Option<u32>) -> bool {
        let mut st = lock(&self.inner.state);
        if st.signaled {
            if !self.inner.manual_reset {
                st.signaled = false;
            }
            return true;
        }
        if ms == Some(0) {
            return false;
        }

        if let Some(sched) = sched::current_coroutine() {
            while st.waiters.front().is_some_and(|w| w.node.is_timed_out()) {
                st.waiters.pop_front();
            }
            let node = Arc::new(WaitNode::new());
            st.waiters.push_back(Waiter {
                waiter: CoWaiter::current(sched),
                node: Arc::clone(&node),
            });
            drop(st);

            return match ms {
                Some(ms) => {
                    sched.set_wait_node(Some(node));
                    sched.add_timer(ms);
                    sched.yield_now();
                    sched.set_wait_node(None);
                    !sched.timeout()
                }
                None => {
                    sched.yield_now();
                    true
                }
            };
        }

        let cv = self.inner.cv.get_or_init(Condvar::new);
        let generation = st.generation;
        st.thread_waiters += 1;
        match ms {
            None => {
                while st.generation == generation {
                    st = cv.wait(st).unwrap_or_else(PoisonError::into_inner);
                }
                true
            }
            Some(ms) => {
                let deadline = Instant::now() + Duration::from_millis(ms as u64);
                loop {
                    if st.generation != generation {
                        return true;
                    }
                    let now = Instant::now();
                    if now >= deadline {
                        st.thread_waiters -= 1;
                        return false;
                    }
                    st = cv
                        .wait_timeout(st, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
            }
        }
    }

    /// Wake every current waiter.
    pub fn signal(&self) {
        let woken = {
            let mut st = lock(&self.inner.state);
            let woken: Vec<CoWaiter> = st
                .waiters
                .drain(..)
                .filter(|w| w.node.try_ready())
                .map(|w| w.waiter)
                .collect();

            let threads = st.thread_waiters > 0;
            if threads {
                st.thread_waiters = 0;
                st.generation = st.generation.wrapping_add(1);
                if let Some(cv) = self.inner.cv.get() {
                    cv.notify_all();
                }
            }

            st.signaled = self.inner.manual_reset || (woken.is_empty() && !threads);
            woken
        };
        for waiter in woken {
            waiter.wake();
        }
    }

    /// Clear a latched signal.
    pub fn reset(&self) {
        lock(&self.inner.state).signaled = false;
    }

    pub fn is_signaled(&self) -> bool {
        lock(&self.inner.state).signaled
    }

    pub fn is_manual_reset(&self) -> bool {
        self.inner.manual_reset
    }
}
