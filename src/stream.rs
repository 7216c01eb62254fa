use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use log::{debug, trace};

use crate::ctx::Reactor;
use crate::error::Error;
use crate::fsm::{Event, EventKind, Token};
use crate::message::Message;
use crate::pipe::{PipeBase, PipeEvents};
use crate::timer::{Timer, TimerEvent};
use crate::usock::{Usock, UsockEvent};

const PROTO_TAG: [u8; 2] = [0x53, 0x50]; // "SP"

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Accepting,
    Activating,
    SendingHdr,
    ReceivingHdr,
    StoppingTimerOk,
    StoppingTimerErr,
    Active,
    Failed,
    Stopping,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InState {
    Hdr,
    Body,
    Ready,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutState {
    Idle,
    Busy,
}

/// What a session reports to the endpoint that owns it.
#[derive(Debug)]
pub(crate) enum SessionEvent {
    /// Accept phase only: a connection was taken off the listener.
    Accepted,
    Error(Error),
    Stopped,
}

/// Per-connection stream session.
///
/// Exchanges the 8-byte protocol header under a timer, then frames
/// length-prefixed messages in both directions, full duplex: the receive
/// side walks Hdr -> Body -> Ready while the send side independently runs
/// the staged message from the pipe slot.
pub(crate) struct Session {
    state: State,
    instate: InState,
    outstate: OutState,
    usock: Option<Usock>,
    timer: Timer,
    pipebase: PipeBase,
    pipe_tok: Token,
    protocol: u16,
    hdr_timeout: Duration,
    pending_err: Option<Error>,
    announced: bool,
    wait_timer: bool,
    wait_usock: bool,
}

impl Session {
    pub fn new(
        r: &mut Reactor<'_>,
        shell: Arc<dyn PipeEvents>,
        protocol: u16,
        hdr_timeout: Duration,
    ) -> Session {
        let pipe_tok = r.token();

        Session {
            state: State::Idle,
            instate: InState::Hdr,
            outstate: OutState::Idle,
            usock: None,
            timer: Timer::new(r),
            pipebase: PipeBase::new(shell, r.fsm_ref(pipe_tok), protocol),
            pipe_tok,
            protocol,
            hdr_timeout,
            pending_err: None,
            announced: false,
            wait_timer: false,
            wait_usock: false,
        }
    }

    pub fn owns(&self, tok: Token) -> bool {
        tok == self.pipe_tok
            || self.timer.owns(tok)
            || self.usock.as_ref().map_or(false, |u| u.owns(tok))
    }

    pub fn tokens(&self, out: &mut Vec<Token>) {
        out.push(self.pipe_tok);
        out.push(self.timer.token());
        if let Some(u) = &self.usock {
            u.tokens(out);
        }
    }

    /// Accept phase: wait for one connection on the shared listener.
    pub fn drive_accept(&mut self, r: &mut Reactor<'_>, lu: &mut Usock) -> Option<SessionEvent> {
        debug_assert!(self.state == State::Idle || self.state == State::Accepting);
        self.state = State::Accepting;

        match lu.accept(r) {
            Some(UsockEvent::Accepted(us)) => self.adopt(r, us),
            Some(UsockEvent::Error(e)) => Some(SessionEvent::Error(e.into())),
            None => None,
            Some(other) => unreachable!("accept yielded {:?}", other),
        }
    }

    /// Listener readiness routed through the accepting child.
    pub fn on_listen_event(
        &mut self,
        r: &mut Reactor<'_>,
        lu: &mut Usock,
        ev: Event,
    ) -> Option<SessionEvent> {
        debug_assert_eq!(self.state, State::Accepting);

        match lu.handle_ev(r, ev) {
            Some(UsockEvent::Accepted(us)) => self.adopt(r, us),
            Some(UsockEvent::Error(e)) => Some(SessionEvent::Error(e.into())),
            _ => None,
        }
    }

    fn adopt(&mut self, r: &mut Reactor<'_>, mut us: Usock) -> Option<SessionEvent> {
        us.activate(r);
        self.usock = Some(us);
        self.state = State::Activating;
        Some(SessionEvent::Accepted)
    }

    /// Connect side: the usock is already registered and connected.
    pub fn start_active(&mut self, r: &mut Reactor<'_>, usock: Usock) -> Option<SessionEvent> {
        debug_assert_eq!(self.state, State::Idle);
        self.usock = Some(usock);
        self.begin_handshake(r)
    }

    pub fn handle_ev(&mut self, r: &mut Reactor<'_>, ev: Event) -> Option<SessionEvent> {
        if self.timer.owns(ev.source) {
            return match self.timer.handle_ev(ev) {
                None => None,
                Some(TimerEvent::Timeout) => match self.state {
                    State::SendingHdr | State::ReceivingHdr => {
                        debug!("session: header exchange timed out");
                        self.state = State::Failed;
                        Some(SessionEvent::Error(Error::HandshakeTimeout))
                    }
                    _ => None,
                },
                Some(TimerEvent::Stopped) => match self.state {
                    State::StoppingTimerOk | State::StoppingTimerErr => self.after_timer(r),
                    State::Stopping => {
                        self.wait_timer = false;
                        self.maybe_finish(r)
                    }
                    _ => None,
                },
            };
        }

        if ev.source == self.pipe_tok {
            return match ev.kind {
                EventKind::Send => self.on_pipe_send(r),
                EventKind::Recv => self.on_pipe_recv(r),
                _ => unreachable!("pipe token got {:?}", ev.kind),
            };
        }

        debug_assert!(self.usock.as_ref().map_or(false, |u| u.owns(ev.source)));
        let uev = match self.usock.as_mut() {
            Some(u) => u.handle_ev(r, ev),
            None => None,
        };
        match uev {
            Some(uev) => self.on_usock_ev(r, uev),
            None => None,
        }
    }

    /// Begin teardown: stop the timer if armed, close the usock, wait for
    /// both acknowledgements, then detach the pipe and report `Stopped`.
    pub fn stop(&mut self, r: &mut Reactor<'_>) -> Option<SessionEvent> {
        if self.state == State::Stopping || self.state == State::Done {
            return None;
        }

        self.wait_timer = self.timer.stop(r);
        self.wait_usock = match self.usock.as_mut() {
            Some(u) => match u.close(r) {
                Some(UsockEvent::Stopped) => {
                    self.usock = None;
                    false
                }
                None => true,
                Some(other) => unreachable!("close yielded {:?}", other),
            },
            None => false,
        };
        self.state = State::Stopping;
        self.maybe_finish(r)
    }

    /// Throw away a session that never ran: tokens back, no upcalls.
    pub fn abandon(&mut self, r: &mut Reactor<'_>) {
        debug_assert!(self.state == State::Idle || self.state == State::Accepting);
        debug_assert!(self.usock.is_none());
        self.timer.release(r);
        r.release(self.pipe_tok);
        self.pipebase.detach(false);
        self.state = State::Done;
    }

    fn maybe_finish(&mut self, r: &mut Reactor<'_>) -> Option<SessionEvent> {
        if self.wait_timer || self.wait_usock {
            return None;
        }

        self.timer.release(r);
        r.release(self.pipe_tok);
        self.state = State::Done;
        self.pipebase.detach(self.announced);
        Some(SessionEvent::Stopped)
    }

    fn begin_handshake(&mut self, r: &mut Reactor<'_>) -> Option<SessionEvent> {
        let p = self.protocol.to_be_bytes();
        let hdr = [0x00, 0x00, PROTO_TAG[0], PROTO_TAG[1], p[0], p[1], 0x00, 0x00];

        self.timer.start(r, self.hdr_timeout);
        self.state = State::SendingHdr;

        trace!("session: sending protocol header, id {}", self.protocol);
        let uev = self
            .usock
            .as_mut()
            .unwrap()
            .send(r, vec![Bytes::copy_from_slice(&hdr)]);
        match uev {
            Some(uev) => self.on_usock_ev(r, uev),
            None => None,
        }
    }

    fn on_usock_ev(&mut self, r: &mut Reactor<'_>, uev: UsockEvent) -> Option<SessionEvent> {
        match uev {
            UsockEvent::Connected => {
                debug_assert_eq!(self.state, State::Activating);
                self.begin_handshake(r)
            }
            UsockEvent::Sent => match self.state {
                State::SendingHdr => {
                    self.state = State::ReceivingHdr;
                    let uev = self.usock.as_mut().unwrap().recv(r, 8);
                    match uev {
                        Some(uev) => self.on_usock_ev(r, uev),
                        None => None,
                    }
                }
                State::Active => {
                    debug_assert_eq!(self.outstate, OutState::Busy);
                    self.outstate = OutState::Idle;
                    self.pipebase.sent_ack();
                    None
                }
                _ => None,
            },
            UsockEvent::Received(b) => match self.state {
                State::ReceivingHdr => self.on_hdr(r, &b),
                State::Active => self.on_data(r, b),
                _ => None,
            },
            UsockEvent::Error(e) => self.on_io_error(r, e),
            UsockEvent::Stopped => {
                debug_assert_eq!(self.state, State::Stopping);
                self.usock = None;
                self.wait_usock = false;
                self.maybe_finish(r)
            }
            UsockEvent::Accepted(_) => unreachable!("data usock accepted"),
        }
    }

    fn on_hdr(&mut self, r: &mut Reactor<'_>, b: &[u8]) -> Option<SessionEvent> {
        let shape_ok =
            b.len() == 8 && b[0] == 0 && b[1] == 0 && b[2..4] == PROTO_TAG && b[6] == 0 && b[7] == 0;

        let verdict = if !shape_ok {
            Err(Error::BadHeader)
        } else {
            let peer = u16::from_be_bytes([b[4], b[5]]);
            if self.pipebase.is_peer(peer) {
                Ok(())
            } else {
                Err(Error::PeerRejected(peer))
            }
        };

        let waiting = self.timer.stop(r);
        match verdict {
            Ok(()) => self.state = State::StoppingTimerOk,
            Err(e) => {
                debug!("session: handshake rejected: {}", e);
                self.pending_err = Some(e);
                self.state = State::StoppingTimerErr;
            }
        }

        if waiting {
            None
        } else {
            self.after_timer(r)
        }
    }

    /// The header timer is fully disarmed; either enter the data plane or
    /// surface the recorded handshake failure.
    fn after_timer(&mut self, r: &mut Reactor<'_>) -> Option<SessionEvent> {
        match self.state {
            State::StoppingTimerOk => {
                self.state = State::Active;
                self.instate = InState::Hdr;
                self.outstate = OutState::Idle;
                self.announced = true;
                self.pipebase.activate();

                let uev = self.usock.as_mut().unwrap().recv(r, 8);
                match uev {
                    Some(uev) => self.on_usock_ev(r, uev),
                    None => None,
                }
            }
            State::StoppingTimerErr => {
                self.state = State::Failed;
                Some(SessionEvent::Error(self.pending_err.take().unwrap()))
            }
            _ => unreachable!(),
        }
    }

    fn on_data(&mut self, r: &mut Reactor<'_>, b: Bytes) -> Option<SessionEvent> {
        match self.instate {
            InState::Hdr => {
                debug_assert_eq!(b.len(), 8);
                let size = u64::from_be_bytes(b[..8].try_into().unwrap());

                let size = match usize::try_from(size) {
                    Ok(size) => size,
                    Err(_) => {
                        self.state = State::Failed;
                        return Some(SessionEvent::Error(Error::Io(std::io::Error::new(
                            std::io::ErrorKind::InvalidData,
                            "frame length out of range",
                        ))));
                    }
                };

                if size == 0 {
                    // Zero-length frame: a legal, empty message.
                    self.instate = InState::Ready;
                    self.pipebase.put_in(Message::new());
                    return None;
                }

                self.instate = InState::Body;
                let uev = self.usock.as_mut().unwrap().recv(r, size);
                match uev {
                    Some(uev) => self.on_usock_ev(r, uev),
                    None => None,
                }
            }
            InState::Body => {
                self.instate = InState::Ready;
                self.pipebase.put_in(Message::with_body(b));
                None
            }
            InState::Ready => unreachable!("data while a message is parked"),
        }
    }

    fn on_pipe_send(&mut self, r: &mut Reactor<'_>) -> Option<SessionEvent> {
        if self.state != State::Active || self.outstate != OutState::Idle {
            // The stage raced a teardown; the message is already gone.
            return None;
        }

        let msg = match self.pipebase.take_out() {
            Some(msg) => msg,
            None => return None,
        };

        self.outstate = OutState::Busy;
        let total = (msg.hdr.len() + msg.body.len()) as u64;
        let prefix = Bytes::copy_from_slice(&total.to_be_bytes());

        let uev = self
            .usock
            .as_mut()
            .unwrap()
            .send(r, vec![prefix, msg.hdr, msg.body]);
        match uev {
            Some(uev) => self.on_usock_ev(r, uev),
            None => None,
        }
    }

    fn on_pipe_recv(&mut self, r: &mut Reactor<'_>) -> Option<SessionEvent> {
        if self.state != State::Active || self.instate != InState::Ready {
            return None;
        }

        self.instate = InState::Hdr;
        let uev = self.usock.as_mut().unwrap().recv(r, 8);
        match uev {
            Some(uev) => self.on_usock_ev(r, uev),
            None => None,
        }
    }

    fn on_io_error(&mut self, r: &mut Reactor<'_>, e: std::io::Error) -> Option<SessionEvent> {
        match self.state {
            State::SendingHdr | State::ReceivingHdr => {
                self.pending_err = Some(e.into());
                let waiting = self.timer.stop(r);
                self.state = State::StoppingTimerErr;
                if waiting {
                    None
                } else {
                    self.after_timer(r)
                }
            }
            State::StoppingTimerOk => {
                self.pending_err = Some(e.into());
                self.state = State::StoppingTimerErr;
                None
            }
            State::Activating | State::Active => {
                self.state = State::Failed;
                Some(SessionEvent::Error(e.into()))
            }
            _ => None,
        }
    }
}
