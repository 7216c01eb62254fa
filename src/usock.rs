use std::io;
use std::os::unix::io::RawFd;

use bytes::{Bytes, BytesMut};
use libc::c_int;
use log::trace;

use crate::addr::SockAddr;
use crate::ctx::Reactor;
use crate::fsm::{Event, EventKind, Token};
use crate::poller::PollKey;
use crate::sys::socket;
use crate::worker::{Task, WorkerRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Starting,
    Connecting,
    Accepting,
    Active,
    Removing,
    Done,
}

/// What a usock reports to the machine that owns it.
#[derive(Debug)]
pub enum UsockEvent {
    Connected,
    Accepted(Usock),
    Sent,
    Received(Bytes),
    Error(io::Error),
    Stopped,
}

struct OutBuf {
    chunks: Vec<Bytes>,
    idx: usize,
    off: usize,
}

struct InBuf {
    buf: BytesMut,
    filled: usize,
}

/// One non-blocking OS socket driven through the worker's poller.
///
/// Every operation is attempted inline first; only the would-block
/// continuation goes through readiness. The fd is owned exclusively: it is
/// registered with exactly one poller while I/O can happen and closed on the
/// transition to the terminal state, after the worker has acknowledged the
/// removal. Public operations must be called with the owning context
/// entered.
pub struct Usock {
    fd: RawFd,
    worker: WorkerRef,
    state: State,
    fd_tok: Token,
    task_connect: Token,
    task_connected: Token,
    task_accept: Token,
    task_stop: Token,
    key: Option<PollKey>,
    in_armed: bool,
    out_armed: bool,
    pending_accept: bool,
    out: Option<OutBuf>,
    inb: Option<InBuf>,
}

impl Usock {
    /// Open a fresh stream socket in `domain`.
    pub fn open(r: &mut Reactor<'_>, domain: c_int) -> io::Result<Usock> {
        let fd = socket::stream(domain)?;
        Ok(Usock::adopt(r, fd))
    }

    /// Wrap an already-open descriptor (an accepted connection).
    fn adopt(r: &mut Reactor<'_>, fd: RawFd) -> Usock {
        Usock {
            fd,
            worker: r.worker(),
            state: State::Starting,
            fd_tok: r.token(),
            task_connect: r.token(),
            task_connected: r.token(),
            task_accept: r.token(),
            task_stop: r.token(),
            key: None,
            in_armed: false,
            out_armed: false,
            pending_accept: false,
            out: None,
            inb: None,
        }
    }

    pub fn owns(&self, tok: Token) -> bool {
        tok == self.fd_tok
            || tok == self.task_connect
            || tok == self.task_connected
            || tok == self.task_accept
            || tok == self.task_stop
    }

    pub fn tokens(&self, out: &mut Vec<Token>) {
        out.extend([
            self.fd_tok,
            self.task_connect,
            self.task_connected,
            self.task_accept,
            self.task_stop,
        ]);
    }

    pub fn bind(&self, addr: &SockAddr) -> io::Result<()> {
        socket::bind(self.fd, addr)
    }

    pub fn listen(&self, backlog: c_int) -> io::Result<()> {
        socket::listen(self.fd, backlog)
    }

    pub fn local_addr(&self) -> io::Result<std::net::SocketAddr> {
        socket::local_addr(self.fd)
    }

    /// Begin connecting. Emits `Connected` or `Error` through the event
    /// path; an immediate failure is returned inline.
    pub fn connect(&mut self, r: &mut Reactor<'_>, addr: &SockAddr) -> Option<UsockEvent> {
        assert_eq!(self.state, State::Starting, "connect on a started socket");

        match socket::connect(self.fd, addr) {
            Ok(()) => {
                // Connected synchronously. The fd still has to make it into
                // the poller before data-plane calls, so route through the
                // worker like the asynchronous case.
                self.worker.post(Task::Post {
                    target: r.fsm_ref(self.task_connected),
                });
                None
            }
            Err(ref e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {
                self.worker.post(Task::Post {
                    target: r.fsm_ref(self.task_connect),
                });
                None
            }
            Err(e) => Some(UsockEvent::Error(e)),
        }
    }

    /// Make an adopted descriptor usable for data-plane I/O: the worker adds
    /// it to the poller and `Connected` is emitted.
    pub fn activate(&mut self, r: &mut Reactor<'_>) {
        assert_eq!(self.state, State::Starting, "activate on a started socket");

        self.worker.post(Task::Post {
            target: r.fsm_ref(self.task_connected),
        });
    }

    /// Wait for one inbound connection. At most one accept is in flight.
    pub fn accept(&mut self, r: &mut Reactor<'_>) -> Option<UsockEvent> {
        assert!(
            self.state == State::Starting || self.state == State::Active,
            "accept in {:?}",
            self.state
        );
        assert!(!self.pending_accept, "accept already in flight");

        self.try_accept(r)
    }

    fn try_accept(&mut self, r: &mut Reactor<'_>) -> Option<UsockEvent> {
        loop {
            match socket::accept(self.fd) {
                Ok(newfd) => {
                    if self.in_armed {
                        self.reset_in();
                    }
                    if self.state == State::Accepting {
                        self.state = State::Active;
                    }
                    return Some(UsockEvent::Accepted(Usock::adopt(r, newfd)));
                }
                // The peer gave up while queued; wait for the next one.
                Err(ref e) if e.raw_os_error() == Some(libc::ECONNABORTED) => continue,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    match self.state {
                        State::Starting => {
                            // First wait: the fd is not with the poller yet.
                            self.pending_accept = true;
                            self.worker.post(Task::Post {
                                target: r.fsm_ref(self.task_accept),
                            });
                        }
                        State::Active => {
                            if let Err(e) = self.set_in() {
                                return Some(UsockEvent::Error(e));
                            }
                            self.state = State::Accepting;
                        }
                        State::Accepting => {}
                        _ => unreachable!(),
                    }
                    return None;
                }
                Err(e) => {
                    // Resource exhaustion and friends. Drop interest so a
                    // still-pending connection cannot spin the poller; the
                    // owner decides whether to back off and retry.
                    if self.in_armed {
                        self.reset_in();
                    }
                    if self.state == State::Accepting {
                        self.state = State::Active;
                    }
                    return Some(UsockEvent::Error(e));
                }
            }
        }
    }

    /// Submit a gathered write. One send is in flight at a time; `Sent` is
    /// emitted when the last chunk is drained.
    pub fn send(&mut self, _r: &mut Reactor<'_>, chunks: Vec<Bytes>) -> Option<UsockEvent> {
        assert_eq!(self.state, State::Active, "send in {:?}", self.state);
        assert!(self.out.is_none(), "send already in progress");

        self.out = Some(OutBuf {
            chunks,
            idx: 0,
            off: 0,
        });
        self.flush_out()
    }

    fn flush_out(&mut self) -> Option<UsockEvent> {
        loop {
            let out = self.out.as_mut().unwrap();

            let mut bufs: Vec<&[u8]> = Vec::with_capacity(out.chunks.len() - out.idx);
            for (i, chunk) in out.chunks.iter().enumerate().skip(out.idx) {
                let slice = if i == out.idx {
                    &chunk[out.off..]
                } else {
                    &chunk[..]
                };
                if !slice.is_empty() {
                    bufs.push(slice);
                }
            }

            if bufs.is_empty() {
                self.out = None;
                if self.out_armed {
                    self.reset_out();
                }
                return Some(UsockEvent::Sent);
            }

            match socket::sendv(self.fd, &bufs) {
                Ok(mut n) => {
                    while n > 0 {
                        let rem = out.chunks[out.idx].len() - out.off;
                        if n >= rem {
                            n -= rem;
                            out.idx += 1;
                            out.off = 0;
                        } else {
                            out.off += n;
                            n = 0;
                        }
                    }
                    while out.idx < out.chunks.len() && out.chunks[out.idx].is_empty() {
                        out.idx += 1;
                    }
                    if out.idx >= out.chunks.len() {
                        self.out = None;
                        if self.out_armed {
                            self.reset_out();
                        }
                        return Some(UsockEvent::Sent);
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if !self.out_armed {
                        if let Err(e) = self.set_out() {
                            self.out = None;
                            return Some(UsockEvent::Error(e));
                        }
                    }
                    return None;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.out = None;
                    return Some(UsockEvent::Error(e));
                }
            }
        }
    }

    /// Submit a read of exactly `n` bytes; `Received` carries the filled
    /// buffer once the count is satisfied.
    pub fn recv(&mut self, _r: &mut Reactor<'_>, n: usize) -> Option<UsockEvent> {
        assert_eq!(self.state, State::Active, "recv in {:?}", self.state);
        assert!(self.inb.is_none(), "recv already in progress");
        assert!(n > 0);

        self.inb = Some(InBuf {
            buf: BytesMut::zeroed(n),
            filled: 0,
        });
        self.fill_in()
    }

    fn fill_in(&mut self) -> Option<UsockEvent> {
        loop {
            let inb = self.inb.as_mut().unwrap();
            let filled = inb.filled;

            match socket::recv(self.fd, &mut inb.buf[filled..]) {
                Ok(0) => {
                    self.inb = None;
                    return Some(UsockEvent::Error(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed by peer",
                    )));
                }
                Ok(n) => {
                    inb.filled += n;
                    if inb.filled == inb.buf.len() {
                        let inb = self.inb.take().unwrap();
                        if self.in_armed {
                            self.reset_in();
                        }
                        return Some(UsockEvent::Received(inb.buf.freeze()));
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if !self.in_armed {
                        if let Err(e) = self.set_in() {
                            self.inb = None;
                            return Some(UsockEvent::Error(e));
                        }
                    }
                    return None;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.inb = None;
                    return Some(UsockEvent::Error(e));
                }
            }
        }
    }

    /// Begin teardown. Emits `Stopped` once the fd has left the poller and
    /// been closed; calling it again afterwards is a no-op.
    pub fn close(&mut self, r: &mut Reactor<'_>) -> Option<UsockEvent> {
        match self.state {
            State::Done | State::Removing => None,
            State::Starting => {
                socket::close(self.fd);
                self.state = State::Done;
                self.release(r);
                Some(UsockEvent::Stopped)
            }
            _ => {
                if let Some(key) = self.key.take() {
                    let _ = self.worker.poller().rm(key);
                    self.in_armed = false;
                    self.out_armed = false;
                }
                self.out = None;
                self.inb = None;
                self.worker.post(Task::Post {
                    target: r.fsm_ref(self.task_stop),
                });
                self.state = State::Removing;
                None
            }
        }
    }

    /// Throw away a socket that never started any I/O: tokens back, fd
    /// closed by drop. For synchronous setup failures only.
    pub(crate) fn discard(mut self, r: &mut Reactor<'_>) {
        debug_assert_eq!(self.state, State::Starting);
        self.release(r);
    }

    pub fn handle_ev(&mut self, r: &mut Reactor<'_>, ev: Event) -> Option<UsockEvent> {
        if ev.source == self.task_connected {
            debug_assert_eq!(ev.kind, EventKind::TaskPosted);
            return match self.state {
                State::Starting => match self.poller_add(r) {
                    Ok(()) => {
                        self.state = State::Active;
                        Some(UsockEvent::Connected)
                    }
                    Err(e) => Some(UsockEvent::Error(e)),
                },
                // Closed before the post landed.
                _ => None,
            };
        }

        if ev.source == self.task_connect {
            debug_assert_eq!(ev.kind, EventKind::TaskPosted);
            return match self.state {
                State::Starting => {
                    match self.poller_add(r).and_then(|_| self.set_out()) {
                        Ok(()) => {
                            self.state = State::Connecting;
                            None
                        }
                        Err(e) => Some(UsockEvent::Error(e)),
                    }
                }
                _ => None,
            };
        }

        if ev.source == self.task_accept {
            debug_assert_eq!(ev.kind, EventKind::TaskPosted);
            self.pending_accept = false;
            return match self.state {
                State::Starting => {
                    match self.poller_add(r).and_then(|_| self.set_in()) {
                        Ok(()) => {
                            self.state = State::Accepting;
                            None
                        }
                        Err(e) => Some(UsockEvent::Error(e)),
                    }
                }
                _ => None,
            };
        }

        if ev.source == self.task_stop {
            debug_assert_eq!(ev.kind, EventKind::TaskPosted);
            return match self.state {
                State::Removing => {
                    socket::close(self.fd);
                    self.state = State::Done;
                    self.release(r);
                    Some(UsockEvent::Stopped)
                }
                _ => None,
            };
        }

        debug_assert_eq!(ev.source, self.fd_tok);
        match ev.kind {
            EventKind::In => match self.state {
                State::Accepting => self.try_accept(r),
                State::Active if self.inb.is_some() => self.fill_in(),
                State::Removing | State::Done => None,
                _ => {
                    trace!("usock fd {}: stray In in {:?}", self.fd, self.state);
                    None
                }
            },
            EventKind::Out => match self.state {
                State::Connecting => {
                    let _ = self.reset_out();
                    match socket::take_error(self.fd) {
                        Ok(None) => {
                            self.state = State::Active;
                            Some(UsockEvent::Connected)
                        }
                        Ok(Some(e)) => Some(UsockEvent::Error(e)),
                        Err(e) => Some(UsockEvent::Error(e)),
                    }
                }
                State::Active if self.out.is_some() => self.flush_out(),
                State::Removing | State::Done => None,
                _ => {
                    trace!("usock fd {}: stray Out in {:?}", self.fd, self.state);
                    None
                }
            },
            EventKind::Err => match self.state {
                State::Removing | State::Done => None,
                _ => {
                    if self.in_armed {
                        self.reset_in();
                    }
                    if self.out_armed {
                        let _ = self.reset_out();
                    }
                    let err = match socket::take_error(self.fd) {
                        Ok(Some(e)) => e,
                        Ok(None) => {
                            io::Error::new(io::ErrorKind::ConnectionReset, "connection error")
                        }
                        Err(e) => e,
                    };
                    Some(UsockEvent::Error(err))
                }
            },
            _ => unreachable!("usock got {:?}", ev.kind),
        }
    }

    fn poller_add(&mut self, r: &mut Reactor<'_>) -> io::Result<()> {
        debug_assert!(self.key.is_none());
        let key = self
            .worker
            .poller()
            .add(self.fd, r.fsm_ref(self.fd_tok))?;
        self.key = Some(key);
        Ok(())
    }

    fn set_in(&mut self) -> io::Result<()> {
        self.worker.poller().set_in(self.key.expect("fd not polled"))?;
        self.in_armed = true;
        Ok(())
    }

    fn reset_in(&mut self) {
        let _ = self.worker.poller().reset_in(self.key.expect("fd not polled"));
        self.in_armed = false;
    }

    fn set_out(&mut self) -> io::Result<()> {
        self.worker.poller().set_out(self.key.expect("fd not polled"))?;
        self.out_armed = true;
        Ok(())
    }

    fn reset_out(&mut self) -> io::Result<()> {
        self.worker.poller().reset_out(self.key.expect("fd not polled"))?;
        self.out_armed = false;
        Ok(())
    }

    fn release(&mut self, r: &mut Reactor<'_>) {
        r.release(self.fd_tok);
        r.release(self.task_connect);
        r.release(self.task_connected);
        r.release(self.task_accept);
        r.release(self.task_stop);
    }
}

impl std::fmt::Debug for Usock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Usock(fd {}, {:?})", self.fd, self.state)
    }
}

impl Drop for Usock {
    fn drop(&mut self) {
        // Safety net for owners torn down without the close protocol.
        if self.state != State::Done {
            if let Some(key) = self.key.take() {
                let _ = self.worker.poller().rm(key);
            }
            socket::close(self.fd);
        }
    }
}
