//! Runtime shutdown
//!
//! Lives in its own test binary: once `stop()` returns, the schedulers of
//! this process are gone for good.

use coil::{Config, WaitGroup};
use std::time::{Duration, Instant};

#[test]
fn test_stop_joins_loops_and_is_idempotent() {
    coil::configure(Config {
        sched_num: 2,
        stack_num: 2,
        stack_size: 128 * 1024,
    });

    let wg = WaitGroup::new(4);
    for _ in 0..4 {
        let wg = wg.clone();
        coil::spawn(move || {
            coil::yield_now();
            wg.done();
        });
    }
    wg.wait();

    // A long sleeper is abandoned, not waited for.
    coil::spawn(|| coil::sleep(60_000));

    let start = Instant::now();
    coil::stop();
    assert!(start.elapsed() < Duration::from_secs(10));

    coil::stop();
    assert!(!coil::configure(Config::default()));
}
