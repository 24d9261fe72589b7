//! Scheduler: one event loop per OS thread
//!
//! Each scheduler owns everything its coroutines touch: the stack slots, the
//! id allocator, the record slab, the timer manager and the poller. None of
//! that is shared. The only cross-thread surface is [`Shared`]: the task
//! queues, the poller's wake-up pipe and the stop flag. Other threads (and
//! coroutines on other schedulers) reach a scheduler exclusively through it.
//!
//! ## Loop iteration
//!
//! 1. Wait on the poller for at most `wait_ms` (the time to the next timer).
//! 2. Resume coroutines whose descriptors became ready.
//! 3. Swap out the task queues; start new closures, then resume ready
//!    coroutines.
//! 4. If no new closures arrived locally and there are peers, steal the back
//!    half of one random peer's new queue and start those closures here.
//! 5. Collect expired timers and resume them with the `timeout` flag set.
//!
//! ## Coroutine lifecycle
//!
//! A closure becomes a coroutine when the loop first picks it up: it gets an
//! id (smallest free, `0` is the scheduler's own), a record from the slab and
//! a stack slot (`id & (stack_num - 1)`). `resume` makes the coroutine the
//! slot's resident (copying the previous resident out and this one back in
//! if needed) and switches to it. When the closure returns the id and record
//! are recycled.
//!
//! Interior mutability is scoped tightly: no `RefCell` borrow is ever held
//! across a context switch, because the coroutine on the other side may need
//! the same cell.

use crate::context;
use crate::coroutine::{CoPtr, Coroutine, Task};
use crate::poller::{Interest, Poller, Waker};
use crate::stack::StackSlot;
use crate::sync::lock;
use crate::task::TaskManager;
use coil_core::{IdAllocator, Slab, TimerManager, WaitNode, fatal, mono_ms};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::io;
use std::os::unix::io::RawFd;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};

// Global coroutine counters, reported by diagnostics.
pub static ACTIVE_COROUTINES: AtomicUsize = AtomicUsize::new(0);
pub static TOTAL_SPAWNED: AtomicU64 = AtomicU64::new(0);
pub static TOTAL_COMPLETED: AtomicU64 = AtomicU64::new(0);
pub static PEAK_COROUTINES: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static CURRENT: Cell<*const Scheduler> = const { Cell::new(ptr::null()) };
}

/// The scheduler running on this thread, if any.
pub(crate) fn current() -> Option<&'static Scheduler> {
    let p = CURRENT.with(Cell::get);
    // SAFETY: CURRENT is non-null only while `Scheduler::run` (or a test
    // driving a scheduler by hand) is on this thread's stack, and everything
    // that can observe it runs inside that call.
    unsafe { p.as_ref() }
}

/// The scheduler on this thread, if the caller is one of its coroutines.
pub(crate) fn current_coroutine() -> Option<&'static Scheduler> {
    current().filter(|s| s.running.get().is_some())
}

/// Per-scheduler counters.
#[derive(Debug, Default)]
pub(crate) struct SchedStats {
    pub(crate) resumes: AtomicU64,
    pub(crate) stolen: AtomicU64,
    pub(crate) stack_saves: AtomicU64,
    pub(crate) stack_bytes_saved: AtomicU64,
}

/// The half of a scheduler other threads may touch.
pub(crate) struct Shared {
    id: usize,
    tasks: TaskManager,
    waker: Arc<Waker>,
    stopped: AtomicBool,
    exited: Mutex<bool>,
    exited_cv: Condvar,
    pub(crate) stats: SchedStats,
}

impl Shared {
    pub(crate) fn new(id: usize) -> io::Result<Self> {
        Ok(Self {
            id,
            tasks: TaskManager::new(),
            waker: Arc::new(Waker::new()?),
            stopped: AtomicBool::new(false),
            exited: Mutex::new(false),
            exited_cv: Condvar::new(),
            stats: SchedStats::default(),
        })
    }

    pub(crate) fn id(&self) -> usize {
        self.id
    }

    /// Queue a closure to start as a coroutine on this scheduler.
    pub(crate) fn add_new_task(&self, task: Task) {
        self.tasks.add_new(task);
        self.waker.signal();
    }

    /// Queue a suspended coroutine of this scheduler for resumption.
    pub(crate) fn add_ready_task(&self, co: CoPtr) {
        self.tasks.add_ready(co);
        self.waker.signal();
    }

    pub(crate) fn pending(&self) -> (usize, usize) {
        self.tasks.pending()
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Stop the loop and wait until it has exited.
    ///
    /// Called from one of this scheduler's own coroutines, it only raises the
    /// flag: the loop exits once that coroutine yields.
    pub(crate) fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.waker.signal();
        if current().is_some_and(|s| s.id() == self.id) {
            return;
        }
        let mut exited = lock(&self.exited);
        while !*exited {
            exited = self
                .exited_cv
                .wait(exited)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn mark_exited(&self) {
        *lock(&self.exited) = true;
        self.exited_cv.notify_all();
    }
}

pub(crate) struct Scheduler {
    shared: Arc<Shared>,
    peers: Arc<[Arc<Shared>]>,
    stack_size: usize,
    stack_mask: usize,
    stacks: RefCell<Box<[StackSlot]>>,
    poller: RefCell<Poller>,
    timers: RefCell<TimerManager<CoPtr>>,
    ids: RefCell<IdAllocator>,
    slab: RefCell<Slab<Coroutine>>,
    running: Cell<Option<CoPtr>>,
    /// Saved stack pointer of the loop while a coroutine runs.
    main_sp: Cell<*mut u8>,
    timeout: Cell<bool>,
    wait_ms: Cell<Option<u32>>,
    rng: RefCell<SmallRng>,
}

impl Scheduler {
    /// Build the thread-local half of scheduler `shared.id()`. `peers` holds
    /// every scheduler, this one included, indexed by id.
    pub(crate) fn new(
        shared: Arc<Shared>,
        peers: Arc<[Arc<Shared>]>,
        stack_num: usize,
        stack_size: usize,
    ) -> io::Result<Self> {
        debug_assert!(stack_num.is_power_of_two());
        let poller = Poller::new(Arc::clone(&shared.waker))?;

        let mut ids = IdAllocator::new();
        // Id 0 stands for the scheduler's own context.
        let reserved = ids.pop();
        debug_assert_eq!(reserved, 0);

        Ok(Self {
            shared,
            peers,
            stack_size,
            stack_mask: stack_num - 1,
            stacks: RefCell::new((0..stack_num).map(|_| StackSlot::new()).collect()),
            poller: RefCell::new(poller),
            timers: RefCell::new(TimerManager::new()),
            ids: RefCell::new(ids),
            slab: RefCell::new(Slab::new()),
            running: Cell::new(None),
            main_sp: Cell::new(ptr::null_mut()),
            timeout: Cell::new(false),
            wait_ms: Cell::new(None),
            rng: RefCell::new(SmallRng::from_entropy()),
        })
    }

    pub(crate) fn id(&self) -> usize {
        self.shared.id
    }

    pub(crate) fn sched_num(&self) -> usize {
        self.peers.len()
    }

    pub(crate) fn shared(&self) -> Arc<Shared> {
        Arc::clone(&self.shared)
    }

    pub(crate) fn running(&self) -> Option<CoPtr> {
        self.running.get()
    }

    pub(crate) fn running_or_abort(&self) -> CoPtr {
        match self.running.get() {
            Some(co) => co,
            None => fatal!("scheduler {}: no coroutine is running", self.id()),
        }
    }

    /// Globally unique id of the running coroutine.
    pub(crate) fn coroutine_id(&self) -> Option<usize> {
        self.running.get().map(|co| {
            // SAFETY: the running coroutine is live.
            let id = unsafe { (*co.as_ptr()).id } as usize;
            self.sched_num() * (id - 1) + self.id()
        })
    }

    fn slot_index(&self, id: u32) -> usize {
        id as usize & self.stack_mask
    }

    /// Run the loop until the scheduler is stopped.
    pub(crate) fn run(&self) {
        self.enter();
        tracing::debug!(sched = self.id(), "scheduler loop started");

        let mut io_ready = Vec::new();
        let mut new_tasks: Vec<Task> = Vec::with_capacity(512);
        let mut ready: Vec<CoPtr> = Vec::with_capacity(512);

        while !self.shared.is_stopped() {
            let waited = self.poller.borrow_mut().wait(self.wait_ms.get());
            if self.shared.is_stopped() {
                break;
            }
            if let Err(e) = waited {
                tracing::warn!(sched = self.id(), error = %e, "poller wait failed");
                continue;
            }

            self.poller.borrow_mut().drain_ready(&mut io_ready);
            for co in io_ready.drain(..) {
                self.resume(co);
            }

            self.shared.tasks.take_all(&mut new_tasks, &mut ready);
            let had_new = !new_tasks.is_empty();
            if had_new {
                tracing::trace!(sched = self.id(), n = new_tasks.len(), "starting new tasks");
                for task in new_tasks.drain(..) {
                    let co = self.new_coroutine(task);
                    self.resume(co);
                }
            }
            for co in ready.drain(..) {
                self.resume(co);
            }

            // Only a scheduler that found no new work of its own steals.
            if self.sched_num() > 1 && !had_new {
                let n = self.steal(&mut new_tasks);
                if n > 0 {
                    tracing::debug!(sched = self.id(), n, "stole tasks");
                    self.shared.stats.stolen.fetch_add(n as u64, Ordering::Relaxed);
                    for task in new_tasks.drain(..) {
                        let co = self.new_coroutine(task);
                        self.resume(co);
                    }
                }
            }

            let next = self
                .timers
                .borrow_mut()
                .collect_expired(mono_ms(), &mut ready, claim_timeout);
            self.wait_ms.set(next);
            if !ready.is_empty() {
                self.timeout.set(true);
                for co in ready.drain(..) {
                    self.resume(co);
                }
                self.timeout.set(false);
            }

            self.running.set(None);
            shrink(&mut new_tasks);
            shrink(&mut ready);
        }

        self.leave();
        tracing::debug!(sched = self.id(), "scheduler loop exited");
        self.shared.mark_exited();
    }

    fn enter(&self) {
        CURRENT.with(|c| c.set(self));
    }

    fn leave(&self) {
        CURRENT.with(|c| c.set(ptr::null()));
    }

    /// Pick a random peer other than ourselves and take half its new queue.
    fn steal(&self, out: &mut Vec<Task>) -> usize {
        let n = self.sched_num();
        let pick = self.rng.borrow_mut().gen_range(0..n - 1);
        let victim = if pick >= self.id() { pick + 1 } else { pick };
        self.peers[victim].tasks.steal(out)
    }

    fn new_coroutine(&self, task: Task) -> CoPtr {
        let mut record = self.slab.borrow_mut().pop();
        record.id = self.ids.borrow_mut().pop();
        record.task = Some(task);

        TOTAL_SPAWNED.fetch_add(1, Ordering::Relaxed);
        let active = ACTIVE_COROUTINES.fetch_add(1, Ordering::Relaxed) + 1;
        PEAK_COROUTINES.fetch_max(active, Ordering::Relaxed);

        CoPtr::from_box(record)
    }

    /// Switch into `co` until it yields or finishes.
    pub(crate) fn resume(&self, co: CoPtr) {
        let raw = co.as_ptr();
        self.running.set(Some(co));
        self.shared.stats.resumes.fetch_add(1, Ordering::Relaxed);

        // SAFETY: `co` is a live coroutine owned by this scheduler, and nothing
        // else dereferences it while the loop is running here.
        let to = unsafe {
            let mut stacks = self.stacks.borrow_mut();
            let slot = &mut stacks[self.slot_index((*raw).id)];
            slot.ensure_mapped(self.stack_size);

            if (*raw).sp.is_null() {
                if slot.resident() != Some(co) {
                    self.evict(slot);
                    slot.set_resident(Some(co));
                }
                (*raw).sp = context::init(slot.top(), coroutine_main);
                tracing::trace!(sched = self.id(), id = (*raw).id, "resume new coroutine");
            } else {
                if let Some(timer) = (*raw).timer.take() {
                    self.timers.borrow_mut().cancel(timer);
                }
                if slot.resident() != Some(co) {
                    self.evict(slot);
                    slot.restore(raw);
                    slot.set_resident(Some(co));
                }
            }
            (*raw).sp
        };

        // SAFETY: `to` was produced by `init` or by the coroutine's last
        // switch out, and its slot now holds its frames.
        unsafe { context::switch(self.main_sp.as_ptr(), to) };

        // SAFETY: still live; only `release` below frees it.
        if unsafe { (*raw).finished } {
            self.release(co);
        }
    }

    /// Copy the slot's current resident, if any, out to its buffer.
    ///
    /// # Safety
    /// The resident must be a live, suspended coroutine of this scheduler.
    unsafe fn evict(&self, slot: &mut StackSlot) {
        if let Some(resident) = slot.resident() {
            // SAFETY: per the function contract.
            let bytes = unsafe { slot.save(resident.as_ptr()) };
            self.shared.stats.stack_saves.fetch_add(1, Ordering::Relaxed);
            self.shared
                .stats
                .stack_bytes_saved
                .fetch_add(bytes as u64, Ordering::Relaxed);
        }
        slot.set_resident(None);
    }

    fn release(&self, co: CoPtr) {
        // SAFETY: the coroutine finished; this is the only reference left.
        let mut record = unsafe { co.into_box() };
        if let Some(timer) = record.timer.take() {
            self.timers.borrow_mut().cancel(timer);
        }
        {
            let mut stacks = self.stacks.borrow_mut();
            let slot = &mut stacks[self.slot_index(record.id)];
            if slot.resident() == Some(co) {
                slot.set_resident(None);
            }
        }
        tracing::trace!(sched = self.id(), id = record.id, "coroutine finished");
        self.ids.borrow_mut().push(record.id);
        self.slab.borrow_mut().push(record);
        self.running.set(None);

        ACTIVE_COROUTINES.fetch_sub(1, Ordering::Relaxed);
        TOTAL_COMPLETED.fetch_add(1, Ordering::Relaxed);
    }

    /// Switch from the running coroutine back to the loop.
    pub(crate) fn yield_now(&self) {
        let Some(co) = self.running.get() else {
            return;
        };
        // SAFETY: the running coroutine is live; the loop's context was saved
        // by the `resume` that switched into it.
        unsafe { context::switch(&raw mut (*co.as_ptr()).sp, self.main_sp.get()) };
    }

    /// Suspend the running coroutine for `ms` milliseconds.
    pub(crate) fn sleep(&self, ms: u32) {
        self.add_timer(ms);
        self.yield_now();
    }

    /// Arm a timer that resumes the running coroutine after `ms`
    /// milliseconds unless something else resumes it first.
    pub(crate) fn add_timer(&self, ms: u32) {
        let co = self.running_or_abort();
        if self.wait_ms.get().is_none_or(|w| w > ms) {
            self.wait_ms.set(Some(ms));
        }
        let id = self.timers.borrow_mut().add(ms, co);
        // SAFETY: the running coroutine is live.
        unsafe {
            if let Some(old) = (*co.as_ptr()).timer.replace(id) {
                self.timers.borrow_mut().cancel(old);
            }
        }
    }

    /// Whether the running coroutine was resumed by an expired timer.
    pub(crate) fn timeout(&self) -> bool {
        self.timeout.get()
    }

    /// Let a timed wait arbitrate its timer against a wake-up.
    pub(crate) fn set_wait_node(&self, node: Option<Arc<WaitNode>>) {
        let co = self.running_or_abort();
        // SAFETY: the running coroutine is live.
        unsafe { (*co.as_ptr()).wait = node };
    }

    /// Whether `p` points into the running coroutine's stack slot.
    pub(crate) fn on_stack(&self, p: *const u8) -> bool {
        let Some(co) = self.running.get() else {
            return false;
        };
        // SAFETY: the running coroutine is live.
        let id = unsafe { (*co.as_ptr()).id };
        self.stacks.borrow()[self.slot_index(id)].contains(p)
    }

    pub(crate) fn add_io_event(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        let co = self.running_or_abort();
        self.poller.borrow_mut().add(fd, interest, co)
    }

    pub(crate) fn del_io_event(&self, fd: RawFd, interest: Interest) {
        self.poller.borrow_mut().remove(fd, interest);
    }

    pub(crate) fn del_io_events(&self, fd: RawFd) {
        self.poller.borrow_mut().remove_all(fd);
    }

    /// Mark the running coroutine finished and leave it for good.
    fn finish(&self) -> ! {
        let co = self.running_or_abort();
        // SAFETY: the running coroutine is live until `resume` releases it
        // after this switch.
        unsafe {
            (*co.as_ptr()).finished = true;
            context::switch(&raw mut (*co.as_ptr()).sp, self.main_sp.get());
        }
        fatal!("scheduler {}: finished coroutine was resumed", self.id())
    }
}

/// Timer claim: an expired coroutine is resumed unless a wake-up already won
/// its wait node.
fn claim_timeout(co: &CoPtr) -> bool {
    // SAFETY: timers only reference live coroutines of this scheduler.
    let co = unsafe { &mut *co.as_ptr() };
    co.timer = None;
    co.wait.as_ref().is_none_or(|node| node.try_timeout())
}

fn shrink<T>(v: &mut Vec<T>) {
    if v.capacity() >= 16 * 1024 {
        *v = Vec::with_capacity(512);
    }
}

/// First frame of every coroutine.
extern "C" fn coroutine_main() -> ! {
    let Some(sched) = current() else {
        fatal!("coroutine started outside a scheduler thread")
    };
    run_task(sched);
    sched.finish()
}

fn run_task(sched: &Scheduler) {
    let co = sched.running_or_abort();
    // SAFETY: the running coroutine is live.
    let (id, task) = unsafe { ((*co.as_ptr()).id, (*co.as_ptr()).task.take()) };
    let Some(task) = task else {
        return;
    };
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
        tracing::error!(
            sched = sched.id(),
            id,
            "coroutine panicked: {}",
            panic_message(payload.as_ref())
        );
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "<non-string panic payload>"
    }
}
