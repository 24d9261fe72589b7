//! Self-pipe used to interrupt a blocked poller from another thread.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};

pub(crate) struct Waker {
    /// Set while a wake-up byte is in the pipe and not yet drained.
    signaled: AtomicBool,
    rx: RawFd,
    tx: RawFd,
}

impl Waker {
    pub(crate) fn new() -> io::Result<Self> {
        let (rx, tx) = nonblocking_pipe()?;
        Ok(Self {
            signaled: AtomicBool::new(false),
            rx,
            tx,
        })
    }

    pub(crate) fn read_fd(&self) -> RawFd {
        self.rx
    }

    /// Wake the poller. Cheap and idempotent: only the first signal since the
    /// last drain writes to the pipe.
    pub(crate) fn signal(&self) {
        if self
            .signaled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let byte = [1u8];
        // SAFETY: writing one byte from a live buffer to our own pipe.
        let n = unsafe { libc::write(self.tx, byte.as_ptr() as *const libc::c_void, 1) };
        if n < 0 {
            let err = io::Error::last_os_error();
            // A full pipe still wakes the poller.
            if err.kind() != io::ErrorKind::WouldBlock {
                tracing::warn!(error = %err, "failed to signal scheduler");
            }
        }
    }

    /// Consume pending wake-up bytes and re-arm `signal`.
    pub(crate) fn drain(&self) {
        let mut buf = [0u8; 64];
        loop {
            // SAFETY: reading into a live local buffer.
            let n = unsafe {
                libc::read(self.rx, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
            };
            if n <= 0 {
                break;
            }
        }
        self.signaled.store(false, Ordering::Release);
    }

    pub(crate) fn is_signaled(&self) -> bool {
        self.signaled.load(Ordering::Acquire)
    }
}

impl Drop for Waker {
    fn drop(&mut self) {
        // SAFETY: both descriptors are owned by this waker.
        unsafe {
            libc::close(self.rx);
            libc::close(self.tx);
        }
    }
}

#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
fn nonblocking_pipe() -> io::Result<(RawFd, RawFd)> {
    let mut fds = [0 as RawFd; 2];
    // SAFETY: fds has room for the two descriptors pipe2 writes.
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok((fds[0], fds[1]))
}

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
fn nonblocking_pipe() -> io::Result<(RawFd, RawFd)> {
    let mut fds = [0 as RawFd; 2];
    // SAFETY: fds has room for the two descriptors pipe writes.
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    for fd in fds {
        // SAFETY: fd was just returned by pipe.
        let ok = unsafe {
            let flags = libc::fcntl(fd, libc::F_GETFL);
            libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) == 0
                && libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) == 0
        };
        if !ok {
            let err = io::Error::last_os_error();
            // SAFETY: closing the descriptors we own.
            unsafe {
                libc::close(fds[0]);
                libc::close(fds[1]);
            }
            return Err(err);
        }
    }
    Ok((fds[0], fds[1]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending_bytes(waker: &Waker) -> usize {
        let mut buf = [0u8; 16];
        let n = unsafe { libc::read(waker.rx, buf.as_mut_ptr() as *mut libc::c_void, 16) };
        n.max(0) as usize
    }

    #[test]
    fn test_repeated_signals_write_once() {
        let waker = Waker::new().unwrap();
        waker.signal();
        waker.signal();
        waker.signal();
        assert!(waker.is_signaled());
        assert_eq!(pending_bytes(&waker), 1);
    }

    #[test]
    fn test_drain_rearms() {
        let waker = Waker::new().unwrap();
        waker.signal();
        waker.drain();
        assert!(!waker.is_signaled());
        assert_eq!(pending_bytes(&waker), 0);

        waker.signal();
        assert_eq!(pending_bytes(&waker), 1);
    }
}
