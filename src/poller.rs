use std::io;
use std::os::unix::io::RawFd;
use std::sync::Mutex;
use std::time::Duration;

use slab::Slab;

use crate::ctx::FsmRef;
use crate::ready::Ready;
use crate::sys;

/// Key reserved for the worker's wake channel; never handed out for an fd.
pub const WAKER_KEY: usize = usize::MAX;

/// Stable identity of one registered descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollKey(usize);

struct Entry {
    fd: RawFd,
    interest: Ready,
    target: FsmRef,
}

/// Readiness poller: one epoll instance plus the table of registered fds.
///
/// Registration and interest changes are callable from any thread (epoll_ctl
/// is thread-safe); the ready-set drain belongs to the worker thread that
/// owns the events buffer. Interest starts empty and is toggled explicitly;
/// a machine that saw readiness keeps draining until `WouldBlock` before the
/// interest is armed again.
pub struct Poller {
    epoll: sys::Epoll,
    entries: Mutex<Slab<Entry>>,
}

impl Poller {
    pub fn new() -> io::Result<Poller> {
        Ok(Poller {
            epoll: sys::Epoll::new()?,
            entries: Mutex::new(Slab::new()),
        })
    }

    pub fn add(&self, fd: RawFd, target: FsmRef) -> io::Result<PollKey> {
        let mut entries = self.entries.lock().unwrap();
        let key = entries.insert(Entry {
            fd,
            interest: Ready::empty(),
            target,
        });
        assert_ne!(key, WAKER_KEY);

        if let Err(e) = self.epoll.add(fd, key, Ready::empty()) {
            entries.remove(key);
            return Err(e);
        }

        Ok(PollKey(key))
    }

    pub fn rm(&self, key: PollKey) -> io::Result<()> {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.remove(key.0);
        self.epoll.delete(entry.fd)
    }

    pub fn set_in(&self, key: PollKey) -> io::Result<()> {
        self.change(key, Ready::readable(), true)
    }

    pub fn reset_in(&self, key: PollKey) -> io::Result<()> {
        self.change(key, Ready::readable(), false)
    }

    pub fn set_out(&self, key: PollKey) -> io::Result<()> {
        self.change(key, Ready::writable(), true)
    }

    pub fn reset_out(&self, key: PollKey) -> io::Result<()> {
        self.change(key, Ready::writable(), false)
    }

    fn change(&self, key: PollKey, what: Ready, on: bool) -> io::Result<()> {
        let mut entries = self.entries.lock().unwrap();
        let entry = &mut entries[key.0];

        if on {
            entry.interest.insert(what);
        } else {
            entry.interest.remove(what);
        }

        self.epoll.modify(entry.fd, key.0, entry.interest)
    }

    /// Target and current interest for a drained event key. `None` when the
    /// entry has been removed since the kernel queued the event.
    pub fn lookup(&self, key: usize) -> Option<(FsmRef, Ready)> {
        let entries = self.entries.lock().unwrap();
        entries
            .get(key)
            .map(|e| (e.target.clone(), e.interest))
    }

    pub fn add_waker(&self, waker: &crate::waker::Waker) -> io::Result<()> {
        use std::os::unix::io::AsRawFd;
        self.epoll
            .add(waker.as_raw_fd(), WAKER_KEY, Ready::readable())
    }

    pub fn wait(&self, events: &mut sys::Events, timeout: Option<Duration>) -> io::Result<usize> {
        self.epoll.wait(events, timeout)
    }
}
