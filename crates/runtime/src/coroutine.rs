//! Coroutine records
//!
//! A record is boxed once and never moves while live: its address is what
//! the ready queues, the timer manager, the poller registry and primitive
//! wait queues all hold. `CoPtr` is that address.

use coil_core::{Recycle, TimerId, WaitNode};
use std::fmt;
use std::ptr::{self, NonNull};
use std::sync::Arc;

/// A closure waiting to become a coroutine.
pub(crate) type Task = Box<dyn FnOnce() + Send + 'static>;

pub(crate) struct Coroutine {
    /// Scheduler-local id; also picks the stack slot.
    pub(crate) id: u32,
    /// Saved stack pointer. Null until the coroutine first runs.
    pub(crate) sp: *mut u8,
    /// Closure to run on first resume.
    pub(crate) task: Option<Task>,
    /// Pending timer, cancelled when the coroutine is resumed early.
    pub(crate) timer: Option<TimerId>,
    /// Set during a timed wait so an expiring timer can arbitrate.
    pub(crate) wait: Option<Arc<WaitNode>>,
    /// Live frames, held here while another coroutine occupies the slot.
    pub(crate) saved: Vec<u8>,
    pub(crate) finished: bool,
}

impl Default for Coroutine {
    fn default() -> Self {
        Self {
            id: 0,
            sp: ptr::null_mut(),
            task: None,
            timer: None,
            wait: None,
            saved: Vec::new(),
            finished: false,
        }
    }
}

impl Recycle for Coroutine {
    fn recycle(&mut self) {
        self.id = 0;
        self.sp = ptr::null_mut();
        self.task = None;
        self.timer = None;
        self.wait = None;
        // Saved stacks can be large; don't let an idle record pin one.
        self.saved = Vec::new();
        self.finished = false;
    }
}

/// Address of a live coroutine record.
///
/// Only the owning scheduler thread dereferences it. Other threads merely
/// carry it back to that scheduler's ready queue.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct CoPtr(NonNull<Coroutine>);

// SAFETY: a CoPtr is dereferenced only on the scheduler thread that owns the
// record; sending or sharing the address itself is harmless.
unsafe impl Send for CoPtr {}
unsafe impl Sync for CoPtr {}

impl CoPtr {
    pub(crate) fn from_box(record: Box<Coroutine>) -> Self {
        Self(NonNull::from(Box::leak(record)))
    }

    /// Take the record back.
    ///
    /// # Safety
    /// The pointer must come from `from_box` and must not be used afterwards.
    pub(crate) unsafe fn into_box(self) -> Box<Coroutine> {
        unsafe { Box::from_raw(self.0.as_ptr()) }
    }

    pub(crate) fn as_ptr(self) -> *mut Coroutine {
        self.0.as_ptr()
    }
}

impl fmt::Debug for CoPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CoPtr({:p})", self.0)
    }
}
