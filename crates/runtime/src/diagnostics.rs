//! Runtime diagnostics for production debugging
//!
//! Provides a SIGQUIT (kill -3) handler that dumps coroutine and scheduler
//! statistics to stderr, similar to JVM thread dumps, without stopping the
//! process.
//!
//! ```bash
//! kill -3 <pid>
//! ```
//!
//! ## Signal Safety
//!
//! `dump_diagnostics()` does I/O and takes locks, which is not allowed inside
//! a signal handler. A dedicated thread waits on signal-hook's iterator API
//! instead and does the dump from ordinary thread context.

use crate::runtime::schedulers;
use crate::sched::{ACTIVE_COROUTINES, PEAK_COROUTINES, TOTAL_COMPLETED, TOTAL_SPAWNED};
use std::sync::Once;
use std::sync::atomic::Ordering;

static SIGNAL_HANDLER_INIT: Once = Once::new();

/// Install the SIGQUIT handler thread.
///
/// Called when the runtime starts. Safe to call multiple times.
pub fn install_signal_handler() {
    SIGNAL_HANDLER_INIT.call_once(|| {
        #[cfg(all(unix, feature = "diagnostics"))]
        {
            use signal_hook::consts::SIGQUIT;
            use signal_hook::iterator::Signals;

            let mut signals = match Signals::new([SIGQUIT]) {
                Ok(s) => s,
                Err(e) => {
                    tracing::debug!(error = %e, "SIGQUIT diagnostics unavailable");
                    return;
                }
            };

            let spawned = std::thread::Builder::new()
                .name("coil-diagnostics".to_string())
                .spawn(move || {
                    for sig in signals.forever() {
                        if sig == SIGQUIT {
                            dump_diagnostics();
                        }
                    }
                });
            if let Err(e) = spawned {
                tracing::debug!(error = %e, "failed to start diagnostics thread");
            }
        }
    });
}

/// Dump runtime diagnostics to stderr.
///
/// Can be called directly or triggered via SIGQUIT.
pub fn dump_diagnostics() {
    use std::io::Write;

    let mut out = std::io::stderr().lock();

    let _ = writeln!(out, "\n=== Coil Runtime Diagnostics ===");
    let _ = writeln!(out, "Timestamp: {:?}", std::time::SystemTime::now());

    let active = ACTIVE_COROUTINES.load(Ordering::Relaxed);
    let spawned = TOTAL_SPAWNED.load(Ordering::Relaxed);
    let completed = TOTAL_COMPLETED.load(Ordering::Relaxed);
    let peak = PEAK_COROUTINES.load(Ordering::Relaxed);

    let _ = writeln!(out, "\n[Coroutines]");
    let _ = writeln!(out, "  Active:    {}", active);
    let _ = writeln!(out, "  Spawned:   {} (total)", spawned);
    let _ = writeln!(out, "  Completed: {} (total)", completed);
    let _ = writeln!(out, "  Peak:      {} (high-water mark)", peak);

    let scheds = schedulers();
    let _ = writeln!(out, "\n[Schedulers]");
    if scheds.is_empty() {
        let _ = writeln!(out, "  (runtime not started)");
    }
    for shared in scheds {
        let stats = &shared.stats;
        let (new, ready) = shared.pending();
        let _ = writeln!(
            out,
            "  #{:<3} resumes {:<10} stolen {:<8} stack saves {:<8} ({} copied)  queued new {} / ready {}{}",
            shared.id(),
            stats.resumes.load(Ordering::Relaxed),
            stats.stolen.load(Ordering::Relaxed),
            stats.stack_saves.load(Ordering::Relaxed),
            format_bytes(stats.stack_bytes_saved.load(Ordering::Relaxed)),
            new,
            ready,
            if shared.is_stopped() { "  [stopped]" } else { "" }
        );
    }

    let _ = writeln!(out, "\n=== End Diagnostics ===\n");
}

/// Format bytes as human-readable string
fn format_bytes(bytes: u64) -> String {
    if bytes >= 1024 * 1024 * 1024 {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    } else if bytes >= 1024 * 1024 {
        format!("{:.2} MB", bytes as f64 / (1024.0 * 1024.0))
    } else if bytes >= 1024 {
        format!("{:.2} KB", bytes as f64 / 1024.0)
    } else {
        format!("{} B", bytes)
    }
}
