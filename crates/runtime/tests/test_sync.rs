//! Integration tests for the blocking primitives
//!
//! Cutex, Event and WaitGroup are exercised from coroutines, from plain
//! threads, and from both at once.

use coil::{Config, Cutex, Event, Pool, Pooled, WaitGroup};
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once, mpsc};
use std::thread;
use std::time::{Duration, Instant};

const RECV_TIMEOUT: Duration = Duration::from_secs(10);
const ABORT_CHILD_ENV: &str = "COIL_TEST_ABORT_CHILD";

fn setup() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        coil::init_logging();
        coil::configure(Config {
            sched_num: 4,
            stack_num: 4,
            stack_size: 256 * 1024,
        });
    });
}

/// Re-run a single test of this binary in a child process with the abort
/// switch set, returning its exit status and stderr.
fn run_abort_child(test_name: &str) -> (bool, String) {
    let exe = std::env::current_exe().unwrap();
    let output = Command::new(exe)
        .args([test_name, "--exact", "--nocapture", "--test-threads=1"])
        .env(ABORT_CHILD_ENV, "1")
        .output()
        .unwrap();
    (
        output.status.success(),
        String::from_utf8_lossy(&output.stderr).into_owned(),
    )
}

fn is_abort_child() -> bool {
    std::env::var_os(ABORT_CHILD_ENV).is_some()
}

#[test]
fn test_cutex_serializes_coroutines_across_yields() {
    setup();
    let m = Cutex::new();
    let counter = Arc::new(AtomicUsize::new(0));
    let wg = WaitGroup::new(16);
    for _ in 0..16 {
        let m = m.clone();
        let counter = Arc::clone(&counter);
        let wg = wg.clone();
        coil::spawn(move || {
            {
                let _guard = m.guard();
                let v = counter.load(Ordering::SeqCst);
                // Give everyone else a chance to pile up on the lock.
                coil::yield_now();
                counter.store(v + 1, Ordering::SeqCst);
            }
            wg.done();
        });
    }
    wg.wait();
    assert_eq!(counter.load(Ordering::SeqCst), 16);
    assert!(!m.is_locked());
}

#[test]
fn test_cutex_shared_by_threads_and_coroutines() {
    setup();
    let m = Cutex::new();
    let counter = Arc::new(AtomicUsize::new(0));
    let wg = WaitGroup::new(8);

    for _ in 0..8 {
        let m = m.clone();
        let counter = Arc::clone(&counter);
        let wg = wg.clone();
        coil::spawn(move || {
            for _ in 0..100 {
                let _guard = m.guard();
                let v = counter.load(Ordering::SeqCst);
                counter.store(v + 1, Ordering::SeqCst);
            }
            wg.done();
        });
    }
    let threads: Vec<_> = (0..2)
        .map(|_| {
            let m = m.clone();
            let counter = Arc::clone(&counter);
            thread::spawn(move || {
                for _ in 0..100 {
                    let _guard = m.guard();
                    let v = counter.load(Ordering::SeqCst);
                    counter.store(v + 1, Ordering::SeqCst);
                }
            })
        })
        .collect();

    wg.wait();
    for t in threads {
        t.join().unwrap();
    }
    assert_eq!(counter.load(Ordering::SeqCst), 1000);
}

#[test]
fn test_event_wakes_waiting_coroutine() {
    setup();
    let ev = Event::new(false, false);
    let (tx, rx) = mpsc::channel();
    {
        let ev = ev.clone();
        coil::spawn(move || {
            ev.wait();
            tx.send(()).unwrap();
        });
    }
    thread::sleep(Duration::from_millis(20));
    ev.signal();
    rx.recv_timeout(RECV_TIMEOUT).unwrap();
}

#[test]
fn test_event_wait_for_times_out_in_coroutine() {
    setup();
    let ev = Event::default();
    let (tx, rx) = mpsc::channel();
    {
        let ev = ev.clone();
        coil::spawn(move || {
            let start = Instant::now();
            let signaled = ev.wait_for(30);
            tx.send((signaled, start.elapsed())).unwrap();
        });
    }
    let (signaled, elapsed) = rx.recv_timeout(RECV_TIMEOUT).unwrap();
    assert!(!signaled);
    assert!(elapsed >= Duration::from_millis(25), "woke after {:?}", elapsed);

    // The timed-out waiter must not swallow a later signal.
    ev.signal();
    assert!(ev.is_signaled());
}

#[test]
fn test_event_signal_beats_timeout() {
    setup();
    let ev = Event::default();
    let (tx, rx) = mpsc::channel();
    {
        let ev = ev.clone();
        coil::spawn(move || {
            let start = Instant::now();
            let signaled = ev.wait_for(10_000);
            tx.send((signaled, start.elapsed())).unwrap();
        });
    }
    thread::sleep(Duration::from_millis(20));
    ev.signal();
    let (signaled, elapsed) = rx.recv_timeout(RECV_TIMEOUT).unwrap();
    assert!(signaled);
    assert!(elapsed < Duration::from_secs(5));
}

#[test]
fn test_manual_event_releases_every_coroutine() {
    setup();
    let ev = Event::new(true, false);
    let wg = WaitGroup::new(16);
    for _ in 0..16 {
        let ev = ev.clone();
        let wg = wg.clone();
        coil::spawn(move || {
            ev.wait();
            wg.done();
        });
    }
    thread::sleep(Duration::from_millis(20));
    ev.signal();
    wg.wait();
    assert!(ev.is_signaled());
}

#[test]
fn test_wait_group_mixed_threads_and_coroutines() {
    setup();
    let wg = WaitGroup::new(0);
    wg.add(8);
    let threads: Vec<_> = (0..4)
        .map(|_| {
            let wg = wg.clone();
            thread::spawn(move || wg.done())
        })
        .collect();
    for _ in 0..4 {
        let wg = wg.clone();
        coil::spawn(move || {
            coil::sleep(5);
            wg.done();
        });
    }
    wg.wait();
    assert_eq!(wg.count(), 0);
    for t in threads {
        t.join().unwrap();
    }
}

#[test]
fn test_wait_group_coroutine_waiter() {
    setup();
    let (tx, rx) = mpsc::channel();
    coil::spawn(move || {
        let wg = WaitGroup::new(8);
        for i in 0..8 {
            let wg = wg.clone();
            coil::spawn(move || {
                coil::sleep(i);
                wg.done();
            });
        }
        wg.wait();
        tx.send(wg.count()).unwrap();
    });
    assert_eq!(rx.recv_timeout(RECV_TIMEOUT).unwrap(), 0);
}

#[test]
fn test_wait_group_extra_done_aborts() {
    if is_abort_child() {
        let wg = WaitGroup::new(8);
        for _ in 0..9 {
            wg.done();
        }
        return;
    }

    let (success, stderr) = run_abort_child("test_wait_group_extra_done_aborts");
    assert!(!success);
    assert!(
        stderr.contains("WaitGroup::done() called more times than the count"),
        "stderr was: {}",
        stderr
    );
}

#[test]
fn test_wait_group_second_waiter_aborts() {
    if is_abort_child() {
        let wg = WaitGroup::new(1);
        let first = wg.clone();
        thread::spawn(move || first.wait());
        // Give the first waiter time to register.
        thread::sleep(Duration::from_millis(200));
        wg.wait();
        return;
    }

    let (success, stderr) = run_abort_child("test_wait_group_second_waiter_aborts");
    assert!(!success);
    assert!(
        stderr.contains("WaitGroup supports a single waiter"),
        "stderr was: {}",
        stderr
    );
}

#[test]
fn test_pool_reuses_objects_within_a_scheduler() {
    setup();
    let created = Arc::new(AtomicUsize::new(0));
    let pool = {
        let created = Arc::clone(&created);
        Pool::with(
            move || {
                created.fetch_add(1, Ordering::SeqCst);
                Vec::<u8>::with_capacity(64)
            },
            |_| {},
            4,
        )
    };

    let wg = WaitGroup::new(32);
    for i in 0..32u8 {
        let pool = pool.clone();
        let wg = wg.clone();
        coil::spawn(move || {
            {
                let mut buf = Pooled::new(&pool);
                let buf = buf.get_mut().unwrap();
                buf.clear();
                buf.push(i);
            }
            assert!(pool.size() >= 1);
            wg.done();
        });
    }
    wg.wait();
    // Sequential borrowers on one scheduler share an object, so far fewer
    // than one object per coroutine is ever built.
    assert!(created.load(Ordering::SeqCst) < 32);
    pool.clear();
}

#[test]
fn test_pool_outside_scheduler_aborts() {
    if is_abort_child() {
        let pool: Pool<u32> = Pool::new();
        pool.push(1);
        return;
    }

    let (success, stderr) = run_abort_child("test_pool_outside_scheduler_aborts");
    assert!(!success);
    assert!(
        stderr.contains("Pool used outside a scheduler thread"),
        "stderr was: {}",
        stderr
    );
}
