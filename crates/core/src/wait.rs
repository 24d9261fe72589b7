//! Wait nodes: one-shot arbitration between a wake-up and a timeout
//!
//! A coroutine doing a timed wait is reachable from two places at once: the
//! primitive's wait queue (another thread may signal it) and its scheduler's
//! timer manager (the deadline may pass). Exactly one of them may resume it.
//! Both sides race on a shared node with a single compare-and-swap out of
//! `Waiting`; the loser backs off and leaves the coroutine alone.

use std::sync::atomic::{AtomicU8, Ordering};

const WAITING: u8 = 0;
const READY: u8 = 1;
const TIMED_OUT: u8 = 2;

/// Observable state of a wait node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitState {
    Waiting,
    Ready,
    TimedOut,
}

#[derive(Debug)]
pub struct WaitNode {
    state: AtomicU8,
}

impl WaitNode {
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(WAITING),
        }
    }

    /// Claim the node for the waking side. True if this call won the race.
    pub fn try_ready(&self) -> bool {
        self.transition(READY)
    }

    /// Claim the node for the timeout side. True if this call won the race.
    pub fn try_timeout(&self) -> bool {
        self.transition(TIMED_OUT)
    }

    fn transition(&self, to: u8) -> bool {
        self.state
            .compare_exchange(WAITING, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn state(&self) -> WaitState {
        match self.state.load(Ordering::Acquire) {
            WAITING => WaitState::Waiting,
            READY => WaitState::Ready,
            _ => WaitState::TimedOut,
        }
    }

    pub fn is_timed_out(&self) -> bool {
        self.state() == WaitState::TimedOut
    }
}

impl Default for WaitNode {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn test_first_transition_wins() {
        let node = WaitNode::new();
        assert_eq!(node.state(), WaitState::Waiting);
        assert!(node.try_timeout());
        assert!(!node.try_ready());
        assert!(!node.try_timeout());
        assert!(node.is_timed_out());
    }

    #[test]
    fn test_ready_blocks_timeout() {
        let node = WaitNode::new();
        assert!(node.try_ready());
        assert!(!node.try_timeout());
        assert_eq!(node.state(), WaitState::Ready);
    }

    #[test]
    fn test_concurrent_race_has_one_winner() {
        for _ in 0..200 {
            let node = Arc::new(WaitNode::new());
            let wins = Arc::new(AtomicUsize::new(0));
            let handles: Vec<_> = (0..4)
                .map(|i| {
                    let node = Arc::clone(&node);
                    let wins = Arc::clone(&wins);
                    thread::spawn(move || {
                        let won = if i % 2 == 0 {
                            node.try_ready()
                        } else {
                            node.try_timeout()
                        };
                        if won {
                            wins.fetch_add(1, Ordering::Relaxed);
                        }
                    })
                })
                .collect();
            for h in handles {
                h.join().unwrap();
            }
            assert_eq!(wins.load(Ordering::Relaxed), 1);
        }
    }
}
