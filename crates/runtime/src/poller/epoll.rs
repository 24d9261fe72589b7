//! epoll backend (edge-triggered).

use super::Event;
use std::io;
use std::os::unix::io::RawFd;

pub(crate) struct Events {
    buf: Vec<libc::epoll_event>,
}

impl Events {
    pub(crate) fn with_capacity(cap: usize) -> Self {
        Self {
            buf: Vec::with_capacity(cap),
        }
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = Event> + '_ {
        self.buf.iter().map(|ev| {
            let bits = ev.events;
            let token = ev.u64;
            Event {
                token,
                readable: bits
                    & (libc::EPOLLIN | libc::EPOLLRDHUP | libc::EPOLLHUP | libc::EPOLLERR) as u32
                    != 0,
                writable: bits & (libc::EPOLLOUT | libc::EPOLLHUP | libc::EPOLLERR) as u32 != 0,
            }
        })
    }

    pub(crate) fn clear(&mut self) {
        self.buf.clear();
    }
}

pub(crate) struct Selector {
    ep: RawFd,
}

impl Selector {
    pub(crate) fn new() -> io::Result<Self> {
        // SAFETY: plain syscall.
        let ep = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if ep < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { ep })
    }

    pub(crate) fn select(&self, events: &mut Events, timeout_ms: Option<u32>) -> io::Result<usize> {
        let timeout = timeout_ms.map_or(-1, |ms| ms.min(i32::MAX as u32) as i32);
        events.buf.clear();
        // SAFETY: the kernel writes at most `capacity` entries into the buffer.
        let n = unsafe {
            libc::epoll_wait(
                self.ep,
                events.buf.as_mut_ptr(),
                events.buf.capacity() as i32,
                timeout,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: epoll_wait initialized the first `n` entries.
        unsafe { events.buf.set_len(n as usize) };
        Ok(n as usize)
    }

    /// Add or modify `fd` with the given directions enabled.
    pub(crate) fn register(
        &self,
        fd: RawFd,
        token: u64,
        read: bool,
        write: bool,
        modify: bool,
    ) -> io::Result<()> {
        let mut bits = libc::EPOLLET as u32;
        if read {
            bits |= (libc::EPOLLIN | libc::EPOLLRDHUP) as u32;
        }
        if write {
            bits |= libc::EPOLLOUT as u32;
        }
        let mut ev = libc::epoll_event {
            events: bits,
            u64: token,
        };
        let op = if modify {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_ADD
        };
        // SAFETY: ev is a valid epoll_event for the duration of the call.
        if unsafe { libc::epoll_ctl(self.ep, op, fd, &mut ev) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub(crate) fn deregister(&self, fd: RawFd) -> io::Result<()> {
        // SAFETY: a null event is accepted for EPOLL_CTL_DEL since Linux 2.6.9.
        if unsafe { libc::epoll_ctl(self.ep, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut()) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for Selector {
    fn drop(&mut self) {
        // SAFETY: ep is owned by this selector.
        unsafe { libc::close(self.ep) };
    }
}
