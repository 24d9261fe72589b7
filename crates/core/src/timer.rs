//! Deadline-ordered timers
//!
//! Each scheduler keeps one `TimerManager` mapping absolute monotonic
//! deadlines (milliseconds) to the coroutine waiting on them. Deadlines are
//! paired with an insertion sequence so equal deadlines form a FIFO and every
//! entry has a unique, cancellable key.
//!
//! Inserts take no position hint: the ordered map finds the spot from the
//! key alone, so cancelling an entry never leaves stale state behind.
//! `collect_expired` only ever pops from the left.

use std::collections::BTreeMap;
use std::sync::OnceLock;
use std::time::Instant;

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Milliseconds on a process-wide monotonic clock.
pub fn mono_ms() -> u64 {
    EPOCH.get_or_init(Instant::now).elapsed().as_millis() as u64
}

/// Handle to a scheduled timer, used to cancel it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId {
    deadline: u64,
    seq: u64,
}

impl TimerId {
    /// Absolute deadline in `mono_ms` milliseconds.
    pub fn deadline(&self) -> u64 {
        self.deadline
    }
}

/// Ordered multimap of deadline -> item.
pub struct TimerManager<T> {
    timers: BTreeMap<TimerId, T>,
    seq: u64,
}

impl<T> TimerManager<T> {
    pub fn new() -> Self {
        Self {
            timers: BTreeMap::new(),
            seq: 0,
        }
    }

    /// Schedule `item` to expire `ms` milliseconds from now.
    pub fn add(&mut self, ms: u32, item: T) -> TimerId {
        self.add_at(mono_ms() + ms as u64, item)
    }

    /// Schedule `item` at an absolute deadline.
    pub fn add_at(&mut self, deadline: u64, item: T) -> TimerId {
        let id = TimerId {
            deadline,
            seq: self.seq,
        };
        self.seq += 1;
        self.timers.insert(id, item);
        id
    }

    /// Remove a pending timer. Returns its item if it had not expired yet.
    pub fn cancel(&mut self, id: TimerId) -> Option<T> {
        self.timers.remove(&id)
    }

    /// Move every entry with `deadline <= now` out of the manager, in
    /// deadline order.
    ///
    /// `claim` sees each expired item and decides whether it goes into `out`;
    /// a rejected item is still removed. Returns the milliseconds until the
    /// earliest remaining deadline, or `None` when no timers are left.
    pub fn collect_expired<F>(&mut self, now: u64, out: &mut Vec<T>, mut claim: F) -> Option<u32>
    where
        F: FnMut(&T) -> bool,
    {
        while let Some(entry) = self.timers.first_entry() {
            if entry.key().deadline > now {
                break;
            }
            let item = entry.remove();
            if claim(&item) {
                out.push(item);
            }
        }

        self.timers
            .first_key_value()
            .map(|(id, _)| id.deadline.saturating_sub(now).min(u32::MAX as u64) as u32)
    }

    /// Earliest pending deadline.
    pub fn next_deadline(&self) -> Option<u64> {
        self.timers.first_key_value().map(|(id, _)| id.deadline)
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }
}

impl<T> Default for TimerManager<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect_all(timers: &mut TimerManager<u32>, now: u64) -> (Vec<u32>, Option<u32>) {
        let mut out = Vec::new();
        let next = timers.collect_expired(now, &mut out, |_| true);
        (out, next)
    }

    #[test]
    fn test_collect_only_expired_in_deadline_order() {
        let mut timers = TimerManager::new();
        timers.add_at(300, 3);
        timers.add_at(100, 1);
        timers.add_at(500, 5);
        timers.add_at(200, 2);

        let (expired, next) = collect_all(&mut timers, 250);
        assert_eq!(expired, vec![1, 2]);
        assert_eq!(next, Some(50));
        assert_eq!(timers.len(), 2);

        let (expired, next) = collect_all(&mut timers, 300);
        assert_eq!(expired, vec![3]);
        assert_eq!(next, Some(200));

        let (expired, next) = collect_all(&mut timers, 10_000);
        assert_eq!(expired, vec![5]);
        assert_eq!(next, None);
        assert!(timers.is_empty());
    }

    #[test]
    fn test_equal_deadlines_are_fifo() {
        let mut timers = TimerManager::new();
        for item in [10, 11, 12] {
            timers.add_at(40, item);
        }
        let (expired, _) = collect_all(&mut timers, 40);
        assert_eq!(expired, vec![10, 11, 12]);
    }

    #[test]
    fn test_nothing_expired_reports_time_to_next() {
        let mut timers = TimerManager::new();
        timers.add_at(1_000, 1);
        let (expired, next) = collect_all(&mut timers, 400);
        assert!(expired.is_empty());
        assert_eq!(next, Some(600));
    }

    #[test]
    fn test_empty_manager_waits_forever() {
        let mut timers: TimerManager<u32> = TimerManager::new();
        let (expired, next) = collect_all(&mut timers, 123);
        assert!(expired.is_empty());
        assert_eq!(next, None);
    }

    #[test]
    fn test_cancel_removes_entry() {
        let mut timers = TimerManager::new();
        let a = timers.add_at(100, 1);
        let b = timers.add_at(100, 2);
        assert_eq!(timers.cancel(a), Some(1));
        assert_eq!(timers.cancel(a), None);

        let (expired, _) = collect_all(&mut timers, 100);
        assert_eq!(expired, vec![2]);
        assert_eq!(timers.cancel(b), None);
    }

    #[test]
    fn test_add_after_cancelling_latest_keeps_order() {
        let mut timers = TimerManager::new();
        timers.add_at(100, 1);
        let last = timers.add_at(300, 3);
        assert_eq!(timers.cancel(last), Some(3));

        // Lands between and after the survivors purely by deadline.
        timers.add_at(200, 2);
        timers.add_at(50, 0);
        timers.add_at(400, 4);
        let (expired, next) = collect_all(&mut timers, 1_000);
        assert_eq!(expired, vec![0, 1, 2, 4]);
        assert_eq!(next, None);
    }

    #[test]
    fn test_rejected_items_are_still_consumed() {
        let mut timers = TimerManager::new();
        for item in 0..6u32 {
            timers.add_at(10 + item as u64, item);
        }
        let mut out = Vec::new();
        let next = timers.collect_expired(20, &mut out, |item| item % 2 == 0);
        assert_eq!(out, vec![0, 2, 4]);
        assert_eq!(next, None);
        assert!(timers.is_empty());
    }

    #[test]
    fn test_relative_add_uses_monotonic_clock() {
        let mut timers = TimerManager::new();
        let before = mono_ms();
        let id = timers.add(50, 9);
        assert!(id.deadline() >= before + 50);
        assert_eq!(timers.next_deadline(), Some(id.deadline()));
    }
}
