//! Task Manager: the cross-thread half of a scheduler
//!
//! Other threads never touch a scheduler's internals. They hand it work by
//! pushing onto one of two queues behind a single mutex:
//!
//! - `new`: closures that have not started yet (from `spawn`)
//! - `ready`: suspended coroutines that should be resumed (from wake-ups)
//!
//! The loop swaps both queues out in one critical section per iteration.
//! Idle peers may steal from the back of `new`; a ready coroutine is bound to
//! its stack slot and is never stolen.

use crate::coroutine::{CoPtr, Task};
use crate::sync::lock;
use std::mem;
use std::sync::Mutex;

#[derive(Default)]
struct Queues {
    new: Vec<Task>,
    ready: Vec<CoPtr>,
}

#[derive(Default)]
pub(crate) struct TaskManager {
    queues: Mutex<Queues>,
}

impl TaskManager {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add_new(&self, task: Task) {
        lock(&self.queues).new.push(task);
    }

    pub(crate) fn add_ready(&self, co: CoPtr) {
        lock(&self.queues).ready.push(co);
    }

    /// Move everything queued into `new` and `ready`, which must be empty.
    pub(crate) fn take_all(&self, new: &mut Vec<Task>, ready: &mut Vec<CoPtr>) {
        debug_assert!(new.is_empty() && ready.is_empty());
        let mut q = lock(&self.queues);
        if !q.new.is_empty() {
            mem::swap(&mut q.new, new);
        }
        if !q.ready.is_empty() {
            mem::swap(&mut q.ready, ready);
        }
    }

    /// Move the back half of the new queue (`len / 2` closures) into `out`.
    /// Returns how many were taken.
    pub(crate) fn steal(&self, out: &mut Vec<Task>) -> usize {
        let mut q = lock(&self.queues);
        let n = q.new.len() / 2;
        if n > 0 {
            let keep = q.new.len() - n;
            out.extend(q.new.drain(keep..));
        }
        n
    }

    /// Queue lengths as `(new, ready)`.
    pub(crate) fn pending(&self) -> (usize, usize) {
        let q = lock(&self.queues);
        (q.new.len(), q.ready.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coroutine::Coroutine;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_tasks(tm: &TaskManager, n: usize, hits: &Arc<AtomicUsize>, tag: usize) {
        for _ in 0..n {
            let hits = Arc::clone(hits);
            tm.add_new(Box::new(move || {
                hits.fetch_add(tag, Ordering::Relaxed);
            }));
        }
    }

    #[test]
    fn test_take_all_swaps_both_queues() {
        let tm = TaskManager::new();
        let hits = Arc::new(AtomicUsize::new(0));
        counting_tasks(&tm, 3, &hits, 1);
        let co = CoPtr::from_box(Box::new(Coroutine::default()));
        tm.add_ready(co);

        let mut new = Vec::new();
        let mut ready = Vec::new();
        tm.take_all(&mut new, &mut ready);
        assert_eq!(new.len(), 3);
        assert_eq!(ready, vec![co]);
        assert_eq!(tm.pending(), (0, 0));

        for task in new {
            task();
        }
        assert_eq!(hits.load(Ordering::Relaxed), 3);
        drop(unsafe { co.into_box() });
    }

    #[test]
    fn test_steal_takes_back_half_only() {
        let tm = TaskManager::new();
        let hits = Arc::new(AtomicUsize::new(0));
        // Front half tagged 1, back half tagged 100.
        counting_tasks(&tm, 5, &hits, 1);
        counting_tasks(&tm, 4, &hits, 100);
        let co = CoPtr::from_box(Box::new(Coroutine::default()));
        tm.add_ready(co);

        let mut stolen = Vec::new();
        assert_eq!(tm.steal(&mut stolen), 4);
        assert_eq!(stolen.len(), 4);
        assert_eq!(tm.pending(), (5, 1));

        for task in stolen {
            task();
        }
        assert_eq!(hits.load(Ordering::Relaxed), 400);
        drop(unsafe { co.into_box() });
    }

    #[test]
    fn test_steal_leaves_single_task() {
        let tm = TaskManager::new();
        let hits = Arc::new(AtomicUsize::new(0));
        counting_tasks(&tm, 1, &hits, 1);

        let mut stolen = Vec::new();
        assert_eq!(tm.steal(&mut stolen), 0);
        assert!(stolen.is_empty());
        assert_eq!(tm.pending(), (1, 0));
    }

    #[test]
    fn test_steal_never_touches_ready() {
        let tm = TaskManager::new();
        let cos: Vec<CoPtr> = (0..6)
            .map(|_| CoPtr::from_box(Box::new(Coroutine::default())))
            .collect();
        for &co in &cos {
            tm.add_ready(co);
        }

        let mut stolen = Vec::new();
        assert_eq!(tm.steal(&mut stolen), 0);
        assert_eq!(tm.pending(), (0, 6));

        for co in cos {
            drop(unsafe { co.into_box() });
        }
    }
}
