//! Coroutine-aware synchronization primitives
//!
//! Every blocking operation works from both worlds:
//!
//! - Inside a coroutine, the caller is queued as a [`CoWaiter`] and yields
//!   its scheduler. Whoever releases it re-submits the coroutine to the
//!   ready queue of the scheduler that owns it, from any thread.
//! - On a plain thread, the caller blocks on a `Condvar` that the primitive
//!   creates the first time a thread has to wait.
//!
//! The primitives are cheap `Arc` handles; cloning one shares the same
//! underlying state.

mod cutex;
mod event;
mod pool;
mod wait_group;

pub use cutex::{Cutex, CutexGuard};
pub use event::Event;
pub use pool::{Pool, Pooled};
pub use wait_group::WaitGroup;

use crate::coroutine::CoPtr;
use crate::sched::{Scheduler, Shared};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Lock a mutex, ignoring poisoning.
///
/// Coroutine panics are caught before they can unwind through a scheduler,
/// and none of the guarded state is left half-updated across a panic point.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A suspended coroutine plus the scheduler that can resume it.
pub(crate) struct CoWaiter {
    co: CoPtr,
    sched: Arc<Shared>,
}

impl CoWaiter {
    /// The coroutine currently running on `sched`.
    pub(crate) fn current(sched: &Scheduler) -> Self {
        Self {
            co: sched.running_or_abort(),
            sched: sched.shared(),
        }
    }

    /// Hand the coroutine back to its scheduler.
    pub(crate) fn wake(self) {
        self.sched.add_ready_task(self.co);
    }
}
