//! kqueue backend (`EV_CLEAR`, i.e. edge-triggered).

use super::Event;
use std::io;
use std::os::unix::io::RawFd;
use std::ptr;

pub(crate) struct Events {
    buf: Vec<libc::kevent>,
}

impl Events {
    pub(crate) fn with_capacity(cap: usize) -> Self {
        Self {
            buf: Vec::with_capacity(cap),
        }
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = Event> + '_ {
        self.buf.iter().map(|ev| {
            let error = ev.flags & (libc::EV_ERROR | libc::EV_EOF) != 0;
            Event {
                token: ev.udata as usize as u64,
                readable: ev.filter == libc::EVFILT_READ || error,
                writable: ev.filter == libc::EVFILT_WRITE || error,
            }
        })
    }

    pub(crate) fn clear(&mut self) {
        self.buf.clear();
    }
}

fn change(fd: RawFd, filter: i16, flags: u16, token: u64) -> libc::kevent {
    // SAFETY: kevent is plain old data; zero is a valid bit pattern.
    let mut ev: libc::kevent = unsafe { std::mem::zeroed() };
    ev.ident = fd as _;
    ev.filter = filter as _;
    ev.flags = flags as _;
    ev.udata = token as usize as _;
    ev
}

pub(crate) struct Selector {
    kq: RawFd,
}

impl Selector {
    pub(crate) fn new() -> io::Result<Self> {
        // SAFETY: plain syscall.
        let kq = unsafe { libc::kqueue() };
        if kq < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: kq was just created.
        unsafe { libc::fcntl(kq, libc::F_SETFD, libc::FD_CLOEXEC) };
        Ok(Self { kq })
    }

    pub(crate) fn select(&self, events: &mut Events, timeout_ms: Option<u32>) -> io::Result<usize> {
        let ts = timeout_ms.map(|ms| libc::timespec {
            tv_sec: (ms / 1000) as _,
            tv_nsec: ((ms % 1000) as i64 * 1_000_000) as _,
        });
        let ts_ptr = ts.as_ref().map_or(ptr::null(), |t| t as *const libc::timespec);
        events.buf.clear();
        // SAFETY: the kernel writes at most `capacity` entries into the buffer.
        let n = unsafe {
            libc::kevent(
                self.kq,
                ptr::null(),
                0,
                events.buf.as_mut_ptr(),
                events.buf.capacity() as _,
                ts_ptr,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: kevent initialized the first `n` entries.
        unsafe { events.buf.set_len(n as usize) };
        Ok(n as usize)
    }

    /// Enable the requested filters and, when modifying, delete the others.
    pub(crate) fn register(
        &self,
        fd: RawFd,
        token: u64,
        read: bool,
        write: bool,
        modify: bool,
    ) -> io::Result<()> {
        let add = (libc::EV_ADD | libc::EV_CLEAR) as u16;
        let del = libc::EV_DELETE as u16;
        let mut changes = Vec::with_capacity(2);
        for (filter, enabled) in [(libc::EVFILT_READ, read), (libc::EVFILT_WRITE, write)] {
            if enabled {
                changes.push(change(fd, filter as i16, add, token));
            } else if modify {
                changes.push(change(fd, filter as i16, del, token));
            }
        }
        self.apply(&changes)
    }

    pub(crate) fn deregister(&self, fd: RawFd) -> io::Result<()> {
        let del = libc::EV_DELETE as u16;
        let changes = [
            change(fd, libc::EVFILT_READ as i16, del, 0),
            change(fd, libc::EVFILT_WRITE as i16, del, 0),
        ];
        self.apply(&changes)
    }

    fn apply(&self, changes: &[libc::kevent]) -> io::Result<()> {
        for ev in changes {
            // SAFETY: one change, no event list.
            let rc = unsafe { libc::kevent(self.kq, ev, 1, ptr::null_mut(), 0, ptr::null()) };
            if rc < 0 {
                let err = io::Error::last_os_error();
                // Deleting a filter that was never added is fine.
                if ev.flags as u32 & libc::EV_DELETE as u32 != 0
                    && err.raw_os_error() == Some(libc::ENOENT)
                {
                    continue;
                }
                return Err(err);
            }
        }
        Ok(())
    }
}

impl Drop for Selector {
    fn drop(&mut self) {
        // SAFETY: kq is owned by this selector.
        unsafe { libc::close(self.kq) };
    }
}
