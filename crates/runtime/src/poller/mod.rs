//! I/O multiplexer
//!
//! One poller per scheduler. It does two jobs:
//!
//! - Blocks the loop until a registered descriptor is ready, the next timer
//!   is due, or another thread signals the scheduler.
//! - Maps readiness back to the coroutine that registered interest.
//!
//! The OS facility sits behind a small `Selector` (epoll on Linux, kqueue on
//! the BSDs and macOS); registrations are tracked here so both backends share
//! the same bookkeeping. A descriptor is identified by its own value as the
//! event token, and the self-pipe uses `WAKE_TOKEN`.
//!
//! Registrations are edge-triggered: a coroutine waits once per readiness
//! edge and must drain the descriptor (until `EAGAIN`) before waiting again.

#[cfg(any(target_os = "linux", target_os = "android"))]
mod epoll;
#[cfg(any(target_os = "linux", target_os = "android"))]
use epoll as sys;

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
mod kqueue;
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
use kqueue as sys;

mod waker;

pub(crate) use waker::Waker;

use crate::coroutine::CoPtr;
use coil_core::fatal;
use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;

const WAKE_TOKEN: u64 = u64::MAX;

/// Direction of interest in a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Interest {
    Read,
    Write,
}

/// One readiness notification from the selector.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Event {
    pub(crate) token: u64,
    pub(crate) readable: bool,
    pub(crate) writable: bool,
}

#[derive(Debug, Default, Clone, Copy)]
struct Registration {
    reader: Option<CoPtr>,
    writer: Option<CoPtr>,
}

impl Registration {
    fn slot(&mut self, interest: Interest) -> &mut Option<CoPtr> {
        match interest {
            Interest::Read => &mut self.reader,
            Interest::Write => &mut self.writer,
        }
    }

    fn is_empty(&self) -> bool {
        self.reader.is_none() && self.writer.is_none()
    }
}

pub(crate) struct Poller {
    selector: sys::Selector,
    events: sys::Events,
    waker: Arc<Waker>,
    registrations: HashMap<RawFd, Registration>,
}

impl Poller {
    pub(crate) fn new(waker: Arc<Waker>) -> io::Result<Self> {
        let selector = sys::Selector::new()?;
        selector.register(waker.read_fd(), WAKE_TOKEN, true, false, false)?;
        Ok(Self {
            selector,
            events: sys::Events::with_capacity(1024),
            waker,
            registrations: HashMap::new(),
        })
    }

    /// Block until something is ready or `timeout_ms` elapses (`None` waits
    /// forever). Returns the number of raw events; an interrupted wait
    /// reports zero.
    pub(crate) fn wait(&mut self, timeout_ms: Option<u32>) -> io::Result<usize> {
        match self.selector.select(&mut self.events, timeout_ms) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(0),
            other => other,
        }
    }

    /// Translate the events from the last `wait` into coroutines to resume,
    /// draining the self-pipe if it fired.
    pub(crate) fn drain_ready(&mut self, out: &mut Vec<CoPtr>) {
        for ev in self.events.iter() {
            if ev.token == WAKE_TOKEN {
                self.waker.drain();
                continue;
            }
            let Some(reg) = self.registrations.get(&(ev.token as RawFd)) else {
                continue;
            };
            let reader = reg.reader.filter(|_| ev.readable);
            let writer = reg.writer.filter(|_| ev.writable);
            if let Some(co) = reader {
                out.push(co);
            }
            if let Some(co) = writer {
                if reader != Some(co) {
                    out.push(co);
                }
            }
        }
        self.events.clear();
    }

    /// Register `co` as the waiter for `interest` on `fd`.
    ///
    /// Re-registering the same coroutine is a no-op. A direction already held
    /// by another coroutine is a caller bug and aborts.
    pub(crate) fn add(&mut self, fd: RawFd, interest: Interest, co: CoPtr) -> io::Result<()> {
        let existing = self.registrations.get(&fd).copied();
        let mut next = existing.unwrap_or_default();
        let slot = next.slot(interest);
        match *slot {
            Some(held) if held == co => return Ok(()),
            Some(held) => fatal!(
                "fd {} already has a {:?} waiter ({:?}), refusing {:?}",
                fd,
                interest,
                held,
                co
            ),
            None => *slot = Some(co),
        }

        if let Err(e) = self.selector.register(
            fd,
            fd as u64,
            next.reader.is_some(),
            next.writer.is_some(),
            existing.is_some(),
        ) {
            tracing::warn!(fd, ?interest, error = %e, "failed to register I/O interest");
            return Err(e);
        }
        self.registrations.insert(fd, next);
        Ok(())
    }

    /// Drop interest in one direction of `fd`.
    pub(crate) fn remove(&mut self, fd: RawFd, interest: Interest) {
        let Some(reg) = self.registrations.get_mut(&fd) else {
            return;
        };
        if reg.slot(interest).take().is_none() {
            return;
        }
        let reg = *reg;
        let result = if reg.is_empty() {
            self.registrations.remove(&fd);
            self.selector.deregister(fd)
        } else {
            self.selector.register(
                fd,
                fd as u64,
                reg.reader.is_some(),
                reg.writer.is_some(),
                true,
            )
        };
        if let Err(e) = result {
            tracing::debug!(fd, ?interest, error = %e, "failed to update I/O interest");
        }
    }

    /// Drop all interest in `fd`.
    pub(crate) fn remove_all(&mut self, fd: RawFd) {
        if self.registrations.remove(&fd).is_some() {
            if let Err(e) = self.selector.deregister(fd) {
                tracing::debug!(fd, error = %e, "failed to deregister descriptor");
            }
        }
    }

    pub(crate) fn registered(&self) -> usize {
        self.registrations.len()
    }
}
