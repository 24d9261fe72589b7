//! Shared stack slots
//!
//! Each scheduler owns a small power-of-two array of real stacks. Coroutine
//! `id` runs on slot `id & (stack_num - 1)`, so many coroutines share one
//! slot. Only the slot's *resident* has its frames in place; when another
//! coroutine needs the slot, the resident's live frames `[sp, top)` are
//! copied into its own buffer and copied back before it runs again.
//!
//! Slot memory is mapped on first use with a `PROT_NONE` guard page at the
//! low end, so running off the bottom of a stack faults instead of silently
//! corrupting a neighbour.

use crate::coroutine::{CoPtr, Coroutine};
use coil_core::fatal;
use std::io;
use std::ptr;
use std::sync::OnceLock;

static PAGE_SIZE: OnceLock<usize> = OnceLock::new();

pub(crate) fn page_size() -> usize {
    *PAGE_SIZE.get_or_init(|| {
        // SAFETY: sysconf has no memory-safety preconditions.
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if page > 0 { page as usize } else { 4096 }
    })
}

pub(crate) struct StackSlot {
    /// Start of the mapping (the guard page); null until first use.
    base: *mut u8,
    /// Length of the mapping including the guard page.
    len: usize,
    /// Coroutine whose frames currently occupy the slot.
    resident: Option<CoPtr>,
}

impl StackSlot {
    pub(crate) const fn new() -> Self {
        Self {
            base: ptr::null_mut(),
            len: 0,
            resident: None,
        }
    }

    /// Map the slot if it has never been used.
    pub(crate) fn ensure_mapped(&mut self, size: usize) {
        if !self.base.is_null() {
            return;
        }
        match map_stack(size) {
            Ok((base, len)) => {
                self.base = base;
                self.len = len;
                tracing::debug!(bytes = len, "mapped coroutine stack");
            }
            Err(e) => fatal!("failed to map {} byte coroutine stack: {}", size, e),
        }
    }

    pub(crate) fn is_mapped(&self) -> bool {
        !self.base.is_null()
    }

    /// Highest address of the usable region (exclusive).
    pub(crate) fn top(&self) -> *mut u8 {
        // SAFETY: base..base+len is one mapping.
        unsafe { self.base.add(self.len) }
    }

    /// Lowest usable address, just above the guard page.
    pub(crate) fn bottom(&self) -> *mut u8 {
        // SAFETY: the mapping always covers at least one page past the guard.
        unsafe { self.base.add(page_size()) }
    }

    pub(crate) fn contains(&self, p: *const u8) -> bool {
        self.is_mapped() && (self.bottom() as *const u8) <= p && p < (self.top() as *const u8)
    }

    pub(crate) fn resident(&self) -> Option<CoPtr> {
        self.resident
    }

    pub(crate) fn set_resident(&mut self, co: Option<CoPtr>) {
        self.resident = co;
    }

    /// Copy the resident's live frames out of the slot and into its buffer.
    /// Returns the number of bytes copied.
    ///
    /// # Safety
    /// `co` must be the slot's resident and suspended, with `sp` inside the
    /// slot.
    pub(crate) unsafe fn save(&self, co: *mut Coroutine) -> usize {
        unsafe {
            let co = &mut *co;
            let top = self.top();
            if co.sp < self.bottom() || co.sp > top {
                fatal!(
                    "coroutine {} saved stack pointer {:p} is outside its slot",
                    co.id,
                    co.sp
                );
            }
            let len = top as usize - co.sp as usize;
            co.saved.clear();
            co.saved
                .extend_from_slice(std::slice::from_raw_parts(co.sp as *const u8, len));
            len
        }
    }

    /// Copy a suspended coroutine's saved frames back into the slot.
    ///
    /// # Safety
    /// `co` must be suspended on this slot with its frames in `saved`.
    pub(crate) unsafe fn restore(&self, co: *mut Coroutine) {
        unsafe {
            let co = &mut *co;
            let len = co.saved.len();
            if co.sp.add(len) != self.top() {
                fatal!(
                    "coroutine {} stack layout mismatch: sp {:p} + {} bytes != slot top {:p}",
                    co.id,
                    co.sp,
                    len,
                    self.top()
                );
            }
            ptr::copy_nonoverlapping(co.saved.as_ptr(), co.sp, len);
            co.saved.clear();
        }
    }
}

impl Drop for StackSlot {
    fn drop(&mut self) {
        if !self.base.is_null() {
            // SAFETY: base/len came from a successful mmap.
            unsafe {
                libc::munmap(self.base as *mut libc::c_void, self.len);
            }
        }
    }
}

/// Map `size` usable bytes (rounded up to whole pages) plus a guard page.
fn map_stack(size: usize) -> io::Result<(*mut u8, usize)> {
    let page = page_size();
    let usable = size.div_ceil(page).max(1) * page;
    let len = usable + page;

    #[cfg(target_os = "linux")]
    let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE;
    #[cfg(not(target_os = "linux"))]
    let flags = libc::MAP_PRIVATE | libc::MAP_ANON;

    // SAFETY: anonymous private mapping, no existing memory is touched.
    let base = unsafe {
        libc::mmap(
            ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            flags,
            -1,
            0,
        )
    };
    if base == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }

    // SAFETY: the first page belongs to the mapping just created.
    if unsafe { libc::mprotect(base, page, libc::PROT_NONE) } != 0 {
        let err = io::Error::last_os_error();
        // SAFETY: unmapping what we just mapped.
        unsafe { libc::munmap(base, len) };
        return Err(err);
    }

    Ok((base as *mut u8, len))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_maps_lazily_with_guard() {
        let mut slot = StackSlot::new();
        assert!(!slot.is_mapped());
        assert!(!slot.contains(ptr::null()));

        slot.ensure_mapped(64 * 1024);
        assert!(slot.is_mapped());
        let usable = slot.top() as usize - slot.bottom() as usize;
        assert!(usable >= 64 * 1024);
        assert_eq!(usable % page_size(), 0);

        let inside = unsafe { slot.top().sub(1) };
        assert!(slot.contains(inside));
        assert!(!slot.contains(slot.top()));
        assert!(!slot.contains(unsafe { slot.bottom().sub(1) }));

        // Second call keeps the same mapping.
        let top = slot.top();
        slot.ensure_mapped(64 * 1024);
        assert_eq!(slot.top(), top);
    }

    #[test]
    fn test_save_restore_round_trip() {
        let mut slot = StackSlot::new();
        slot.ensure_mapped(16 * 1024);

        let mut co = Coroutine::default();
        co.id = 3;
        unsafe {
            co.sp = slot.top().sub(256);
            for i in 0..256 {
                co.sp.add(i).write(i as u8);
            }
            assert_eq!(slot.save(&mut co), 256);
            assert_eq!(co.saved.len(), 256);

            ptr::write_bytes(co.sp, 0xAA, 256);
            slot.restore(&mut co);
            for i in 0..256 {
                assert_eq!(*co.sp.add(i), i as u8);
            }
        }
        assert!(co.saved.is_empty());
    }
}
