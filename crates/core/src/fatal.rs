//! Fatal runtime errors
//!
//! Some failures in a coroutine runtime cannot be recovered from: the id
//! space is exhausted, a stack could not be mapped, or a caller broke a
//! primitive's contract (a second wait-group waiter, a socket registered
//! from two coroutines). Unwinding is not an option either, because the
//! failing frame may sit on a coroutine stack that the unwinder knows
//! nothing about. These paths log the diagnostic and abort the process.
//!
//! # Usage
//!
//! ```ignore
//! if id >= MAX_IDS {
//!     coil_core::fatal!("id allocator exhausted ({} ids in use)", MAX_IDS);
//! }
//! ```

use std::fmt;
use std::io::Write;

/// Log `args` and abort the process.
///
/// The message goes through `tracing` (so it lands wherever the host
/// application routes logs) and straight to stderr, because a subscriber
/// may buffer and the process is about to die.
#[cold]
#[inline(never)]
pub fn abort_with(args: fmt::Arguments<'_>) -> ! {
    tracing::error!("fatal: {}", args);
    let mut err = std::io::stderr().lock();
    let _ = writeln!(err, "coil: fatal: {}", args);
    let _ = err.flush();
    std::process::abort()
}

/// Abort the process with a formatted diagnostic.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {
        $crate::fatal::abort_with(format_args!($($arg)*))
    };
}
