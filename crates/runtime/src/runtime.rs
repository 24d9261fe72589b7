//! Runtime bootstrap and the coroutine-facing API
//!
//! The runtime is a fixed set of scheduler threads started on first use.
//! [`spawn`] places each closure on a random scheduler; once a closure has
//! become a coroutine it stays on that scheduler for life (only closures that
//! have not started yet can be stolen by an idle peer).
//!
//! Functions that act on "the current coroutine" behave sensibly when called
//! from a plain thread: `sleep` and `yield_now` fall back to their
//! `std::thread` counterparts, and the introspection calls return `None`.

use crate::config::config;
use crate::coroutine::CoPtr;
use crate::poller::Interest;
use crate::sched::{self, Scheduler, Shared};
use coil_core::fatal;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::Duration;

static RUNTIME: OnceLock<Runtime> = OnceLock::new();

struct Runtime {
    scheds: Arc<[Arc<Shared>]>,
    stopped: AtomicBool,
}

impl Runtime {
    fn start() -> Self {
        let config = config().clone();
        let scheds: Arc<[Arc<Shared>]> = (0..config.sched_num)
            .map(|id| match Shared::new(id) {
                Ok(shared) => Arc::new(shared),
                Err(e) => fatal!("failed to create scheduler {}: {}", id, e),
            })
            .collect();

        for shared in scheds.iter() {
            let shared = Arc::clone(shared);
            let peers = Arc::clone(&scheds);
            let (stack_num, stack_size) = (config.stack_num, config.stack_size);
            let id = shared.id();
            let spawned = thread::Builder::new()
                .name(format!("coil-sched-{}", id))
                .spawn(move || {
                    let sched = match Scheduler::new(shared, peers, stack_num, stack_size) {
                        Ok(sched) => sched,
                        Err(e) => fatal!("scheduler {}: failed to create poller: {}", id, e),
                    };
                    sched.run();
                });
            if let Err(e) = spawned {
                fatal!("failed to spawn scheduler thread {}: {}", id, e);
            }
        }

        #[cfg(all(unix, feature = "diagnostics"))]
        crate::diagnostics::install_signal_handler();

        tracing::info!(
            sched_num = config.sched_num,
            stack_num = config.stack_num,
            stack_size = config.stack_size,
            "coroutine runtime started"
        );

        Self {
            scheds,
            stopped: AtomicBool::new(false),
        }
    }

    fn next_sched(&self) -> &Shared {
        let n = self.scheds.len();
        let i = if n == 1 {
            0
        } else if n.is_power_of_two() {
            rand::random::<u32>() as usize & (n - 1)
        } else {
            rand::random::<u32>() as usize % n
        };
        &self.scheds[i]
    }
}

fn runtime() -> &'static Runtime {
    RUNTIME.get_or_init(Runtime::start)
}

/// Per-scheduler state for diagnostics. Empty until the runtime starts.
pub(crate) fn schedulers() -> &'static [Arc<Shared>] {
    match RUNTIME.get() {
        Some(rt) => &rt.scheds,
        None => &[],
    }
}

/// Start the scheduler threads. Idempotent; [`spawn`] calls it implicitly.
pub fn start() {
    runtime();
}

/// Run `f` as a coroutine on one of the schedulers.
pub fn spawn<F>(f: F)
where
    F: FnOnce() + Send + 'static,
{
    let rt = runtime();
    if rt.stopped.load(Ordering::Acquire) {
        tracing::warn!("spawn after stop(): the task will never run");
    }
    rt.next_sched().add_new_task(Box::new(f));
}

/// Stop every scheduler and wait for their loops to exit. Suspended
/// coroutines are abandoned where they are.
pub fn stop() {
    let Some(rt) = RUNTIME.get() else {
        return;
    };
    if rt.stopped.swap(true, Ordering::AcqRel) {
        return;
    }
    for shared in rt.scheds.iter() {
        shared.stop();
    }
    tracing::info!("coroutine runtime stopped");
}

/// Number of schedulers (started or not).
pub fn sched_num() -> usize {
    config().sched_num
}

/// Id of the scheduler running the caller, in `0..sched_num()`.
pub fn sched_id() -> Option<usize> {
    sched::current().map(Scheduler::id)
}

/// Process-wide unique id of the calling coroutine.
pub fn coroutine_id() -> Option<usize> {
    sched::current().and_then(Scheduler::coroutine_id)
}

/// Whether the caller is running inside a coroutine.
pub fn in_coroutine() -> bool {
    sched::current_coroutine().is_some()
}

/// Give other coroutines on this scheduler a turn.
pub fn yield_now() {
    match sched::current_coroutine() {
        Some(sched) => {
            // Resumed from the ready queue on the next loop iteration.
            sched.shared().add_ready_task(sched.running_or_abort());
            sched.yield_now();
        }
        None => thread::yield_now(),
    }
}

/// Suspend the caller for `ms` milliseconds.
pub fn sleep(ms: u32) {
    match sched::current_coroutine() {
        Some(sched) => sched.sleep(ms),
        None => thread::sleep(Duration::from_millis(ms as u64)),
    }
}

/// Whether the calling coroutine was just resumed by an expired timer
/// rather than by the event it was waiting for.
pub fn timeout() -> bool {
    sched::current().is_some_and(Scheduler::timeout)
}

/// Whether `p` points into the calling coroutine's stack.
///
/// Pointers into a coroutine stack are only valid while that coroutine is
/// the slot's resident; anything handed to another coroutine or thread must
/// live on the heap instead.
pub fn on_stack<T>(p: *const T) -> bool {
    sched::current().is_some_and(|s| s.on_stack(p as *const u8))
}

/// Arm a timer for the calling coroutine; pair it with a suspension such as
/// an I/O wait to bound how long that wait may take.
///
/// # Panics
/// Aborts when called outside a coroutine.
pub fn add_timer(ms: u32) {
    match sched::current_coroutine() {
        Some(sched) => sched.add_timer(ms),
        None => fatal!("add_timer() called outside a coroutine"),
    }
}

/// Register the calling coroutine for readiness of `fd` in one direction.
///
/// The next suspension of the coroutine then ends when the descriptor becomes
/// ready. Interest must be removed with [`del_io_event`] or
/// [`del_io_events`] before the coroutine finishes or the descriptor is
/// closed.
pub fn add_io_event(fd: RawFd, interest: Interest) -> io::Result<()> {
    match sched::current_coroutine() {
        Some(sched) => sched.add_io_event(fd, interest),
        None => fatal!("add_io_event() called outside a coroutine"),
    }
}

/// Drop the calling scheduler's interest in one direction of `fd`.
pub fn del_io_event(fd: RawFd, interest: Interest) {
    if let Some(sched) = sched::current() {
        sched.del_io_event(fd, interest);
    }
}

/// Drop the calling scheduler's interest in `fd` entirely.
pub fn del_io_events(fd: RawFd) {
    if let Some(sched) = sched::current() {
        sched.del_io_events(fd);
    }
}

/// Handle to the calling coroutine, for parking it and resuming it later.
pub fn current() -> Option<CoroutineHandle> {
    let sched = sched::current_coroutine()?;
    Some(CoroutineHandle {
        co: sched.running_or_abort(),
        sched: sched.shared(),
    })
}

/// A suspended coroutine that can be woken from any thread.
///
/// Typical use: take the handle, publish it somewhere, then yield with
/// [`suspend`]. Whoever picks the handle up calls [`CoroutineHandle::resume`]
/// exactly once.
pub struct CoroutineHandle {
    co: CoPtr,
    sched: Arc<Shared>,
}

impl CoroutineHandle {
    /// Queue the coroutine on its owning scheduler.
    pub fn resume(self) {
        self.sched.add_ready_task(self.co);
    }

    /// Scheduler that owns the coroutine.
    pub fn sched_id(&self) -> usize {
        self.sched.id()
    }
}

impl std::fmt::Debug for CoroutineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoroutineHandle")
            .field("co", &self.co)
            .field("sched", &self.sched.id())
            .finish()
    }
}

/// Suspend the calling coroutine until something resumes it (a
/// [`CoroutineHandle`], a registered I/O event or a timer).
///
/// # Panics
/// Aborts when called outside a coroutine.
pub fn suspend() {
    match sched::current_coroutine() {
        Some(sched) => sched.yield_now(),
        None => fatal!("suspend() called outside a coroutine"),
    }
}
