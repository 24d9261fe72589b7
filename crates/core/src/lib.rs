//! Coil Core: scheduler-local building blocks for a stackful coroutine runtime
//!
//! Everything here is owned by exactly one scheduler thread, except the
//! wait node, which is the one piece deliberately shared across threads.
//!
//! # Modules
//!
//! - `idgen`: Dense smallest-free-first coroutine ids (4-level bitmap)
//! - `slab`: Boxed record pool with stable addresses and bounded reuse
//! - `timer`: Deadline-ordered timers and the monotonic millisecond clock
//! - `wait`: Tri-state wait node arbitrating wake-up against timeout
//! - `fatal`: Log-and-abort path for unrecoverable runtime errors

pub mod fatal;
pub mod idgen;
pub mod slab;
pub mod timer;
pub mod wait;

pub use idgen::{IdAllocator, MAX_IDS};
pub use slab::{Recycle, Slab};
pub use timer::{TimerId, TimerManager, mono_ms};
pub use wait::{WaitNode, WaitState};
