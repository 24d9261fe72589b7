//! Coil: a multi-threaded stackful coroutine runtime
//!
//! Key design principles:
//! - One scheduler loop per OS thread; a coroutine never migrates once started
//! - A few shared stacks per scheduler; suspended coroutines are copied out of
//!   a stack only when another coroutine needs it
//! - Cross-thread traffic goes through each scheduler's task queues and
//!   nothing else
//! - Blocking primitives (`Cutex`, `Event`, `WaitGroup`) suspend coroutines
//!   and block plain threads, so both can share them
//!
//! ```no_run
//! let wg = coil::WaitGroup::new(0);
//! for i in 0..4 {
//!     wg.add(1);
//!     let wg = wg.clone();
//!     coil::spawn(move || {
//!         coil::sleep(10 * i);
//!         wg.done();
//!     });
//! }
//! wg.wait();
//! ```

#[cfg(not(unix))]
compile_error!("coil requires a Unix platform (epoll or kqueue)");

pub mod config;
mod context;
mod coroutine;
pub mod diagnostics;
pub mod logging;
mod poller;
pub mod runtime;
mod sched;
mod stack;
pub mod sync;
mod task;

pub use config::{Config, configure};
pub use logging::init_logging;
pub use poller::Interest;
pub use runtime::{
    CoroutineHandle, add_io_event, add_timer, coroutine_id, current, del_io_event, del_io_events,
    in_coroutine, on_stack, sched_id, sched_num, sleep, spawn, start, stop, suspend, timeout,
    yield_now,
};
pub use sched::{ACTIVE_COROUTINES, PEAK_COROUTINES, TOTAL_COMPLETED, TOTAL_SPAWNED};
pub use sync::{Cutex, CutexGuard, Event, Pool, Pooled, WaitGroup};
