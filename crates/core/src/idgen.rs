//! Dense, reusable coroutine ids
//!
//! Ids live in `[0, 2^24)` and are tracked by a four-level bitmap, each level
//! 64 bits wide:
//!
//! ```text
//! top (1 x u64)  ──>  64 x Mid  ──>  64 x Leaf  ──>  64 x u64 words
//!   bit = "mid full"   bit = "leaf full"  bit = "word full"  bit = "id used"
//! ```
//!
//! A bit at an upper level is set only when everything beneath it is full, so
//! following the lowest clear bit from the top always lands on the smallest
//! free id. Schedulers rely on that: slots are picked by `id & (stacks - 1)`,
//! and keeping ids dense keeps the set of touched stacks small.
//!
//! Child arrays are allocated on first use and released as soon as they become
//! empty again, so a burst of coroutines does not pin bitmap memory forever.

use crate::fatal;

/// Number of ids the allocator can hand out.
pub const MAX_IDS: u32 = 1 << 24;

const FULL: u64 = u64::MAX;

#[inline]
fn first_zero(bits: u64) -> Option<u32> {
    if bits == FULL {
        None
    } else {
        Some((!bits).trailing_zeros())
    }
}

#[inline]
fn split(id: u32) -> (usize, usize, usize, u32) {
    (
        (id >> 18) as usize,
        ((id >> 12) & 63) as usize,
        ((id >> 6) & 63) as usize,
        id & 63,
    )
}

#[derive(Default)]
struct Leaf {
    /// Ids currently allocated under this leaf.
    used: u32,
    /// Bit `i` set when `words[i]` is full.
    bits: u64,
    words: Option<Box<[u64; 64]>>,
}

#[derive(Default)]
struct Mid {
    /// Leaves under this mid that currently own a word array.
    used: u32,
    /// Bit `i` set when leaf `i` is full.
    bits: u64,
    leaves: Option<Box<[Leaf]>>,
}

/// Smallest-free-first id allocator.
pub struct IdAllocator {
    /// Bit `i` set when mid `i` is full.
    bits: u64,
    mids: Box<[Mid]>,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self {
            bits: 0,
            mids: (0..64).map(|_| Mid::default()).collect(),
        }
    }

    /// Allocate the smallest free id, aborting when the id space is exhausted.
    pub fn pop(&mut self) -> u32 {
        match self.try_pop() {
            Some(id) => id,
            None => fatal!("coroutine id space exhausted ({} ids in use)", MAX_IDS),
        }
    }

    /// Allocate the smallest free id, or `None` when all `MAX_IDS` are in use.
    pub fn try_pop(&mut self) -> Option<u32> {
        let Self { bits: top, mids } = self;

        let b3 = first_zero(*top)?;
        let Mid {
            used: mid_used,
            bits: mid_bits,
            leaves,
        } = &mut mids[b3 as usize];
        let leaves = leaves.get_or_insert_with(|| (0..64).map(|_| Leaf::default()).collect());

        // A clear bit at the top guarantees a non-full leaf below it.
        let b2 = first_zero(*mid_bits)?;
        let Leaf {
            used,
            bits: leaf_bits,
            words,
        } = &mut leaves[b2 as usize];
        if words.is_none() {
            *mid_used += 1;
        }
        let words = words.get_or_insert_with(|| Box::new([0u64; 64]));

        let b1 = first_zero(*leaf_bits)?;
        let word = &mut words[b1 as usize];
        let b0 = first_zero(*word)?;

        *word |= 1 << b0;
        *used += 1;
        if *word == FULL {
            *leaf_bits |= 1 << b1;
            if *leaf_bits == FULL {
                *mid_bits |= 1 << b2;
                if *mid_bits == FULL {
                    *top |= 1 << b3;
                }
            }
        }

        Some((b3 << 18) | (b2 << 12) | (b1 << 6) | b0)
    }

    /// Return `id` to the allocator.
    ///
    /// Releasing an id that is not allocated is a caller bug and aborts.
    pub fn push(&mut self, id: u32) {
        if id >= MAX_IDS {
            fatal!("released id {} is outside the id space", id);
        }
        let (b3, b2, b1, b0) = split(id);
        let Self { bits: top, mids } = self;
        let Mid {
            used: mid_used,
            bits: mid_bits,
            leaves,
        } = &mut mids[b3];

        let Some(leaf_array) = leaves.as_mut() else {
            fatal!("released id {} was never allocated", id);
        };
        let Leaf {
            used,
            bits: leaf_bits,
            words,
        } = &mut leaf_array[b2];
        let Some(word_array) = words.as_mut() else {
            fatal!("released id {} was never allocated", id);
        };

        let before = word_array[b1];
        if before & (1 << b0) == 0 {
            fatal!("id {} released twice", id);
        }
        word_array[b1] = before & !(1 << b0);

        if before == FULL {
            let leaf_before = *leaf_bits;
            *leaf_bits &= !(1 << b1);
            if leaf_before == FULL {
                let mid_before = *mid_bits;
                *mid_bits &= !(1 << b2);
                if mid_before == FULL {
                    *top &= !(1 << b3);
                }
            }
        }

        *used -= 1;
        if *used == 0 {
            *words = None;
            *mid_used -= 1;
            if *mid_used == 0 {
                *leaves = None;
            }
        }
    }

    /// Number of word arrays currently allocated (each covers 4096 ids).
    pub fn allocated_leaves(&self) -> usize {
        self.mids.iter().map(|m| m.used as usize).sum()
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}
