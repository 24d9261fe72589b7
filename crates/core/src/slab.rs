//! Record pool with stable addresses
//!
//! Schedulers hand out raw pointers to coroutine records (as poller user data,
//! timer payloads and ready-queue entries), so a record must never move while
//! it is live. Each record is boxed; finished records go back on a free list
//! and are reused before anything new is allocated.
//!
//! The free list is bounded. Past `max_free` idle records, returned boxes are
//! dropped, which keeps a one-off spike of coroutines from pinning memory.

/// Default number of idle records kept for reuse.
pub const DEFAULT_MAX_FREE: usize = 1024;

/// A record type that can be recycled.
pub trait Recycle {
    /// Return the record to its freshly-constructed state, keeping any heap
    /// capacity it may want to reuse.
    fn recycle(&mut self);
}

/// Pool of boxed records.
pub struct Slab<T> {
    free: Vec<Box<T>>,
    max_free: usize,
    live: usize,
}

impl<T: Default + Recycle> Slab<T> {
    pub fn new() -> Self {
        Self::with_max_free(DEFAULT_MAX_FREE)
    }

    pub fn with_max_free(max_free: usize) -> Self {
        Self {
            free: Vec::new(),
            max_free,
            live: 0,
        }
    }

    /// Take a record, reusing an idle one when available.
    pub fn pop(&mut self) -> Box<T> {
        self.live += 1;
        self.free.pop().unwrap_or_default()
    }

    /// Give a record back.
    pub fn push(&mut self, mut record: Box<T>) {
        debug_assert!(self.live > 0, "slab: push without matching pop");
        self.live -= 1;
        if self.free.len() < self.max_free {
            record.recycle();
            self.free.push(record);
        }
    }

    /// Records currently handed out.
    pub fn live(&self) -> usize {
        self.live
    }

    /// Idle records waiting for reuse.
    pub fn idle(&self) -> usize {
        self.free.len()
    }
}

impl<T: Default + Recycle> Default for Slab<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Record {
        id: u32,
        scratch: Vec<u8>,
    }

    impl Recycle for Record {
        fn recycle(&mut self) {
            self.id = 0;
            self.scratch.clear();
        }
    }

    #[test]
    fn test_reuses_returned_record() {
        let mut slab: Slab<Record> = Slab::new();
        let mut a = slab.pop();
        a.id = 7;
        a.scratch.extend_from_slice(&[1, 2, 3]);
        let addr = &*a as *const Record;
        slab.push(a);

        let b = slab.pop();
        assert_eq!(&*b as *const Record, addr);
        assert_eq!(b.id, 0);
        assert!(b.scratch.is_empty());
        assert!(b.scratch.capacity() >= 3);
    }

    #[test]
    fn test_live_and_idle_counts() {
        let mut slab: Slab<Record> = Slab::new();
        let records: Vec<_> = (0..5).map(|_| slab.pop()).collect();
        assert_eq!(slab.live(), 5);
        assert_eq!(slab.idle(), 0);

        for r in records {
            slab.push(r);
        }
        assert_eq!(slab.live(), 0);
        assert_eq!(slab.idle(), 5);
    }

    #[test]
    fn test_free_list_is_bounded() {
        let mut slab: Slab<Record> = Slab::with_max_free(2);
        let records: Vec<_> = (0..4).map(|_| slab.pop()).collect();
        for r in records {
            slab.push(r);
        }
        assert_eq!(slab.idle(), 2);
        assert_eq!(slab.live(), 0);
    }
}
