use std::io;
use std::sync::Arc;

use log::{debug, trace};

use crate::ctx::Reactor;
use crate::fsm::{Event, EventKind, Fsm, Status, Token};
use crate::pipe::PipeEvents;
use crate::stream::{Session, SessionEvent};
use crate::timer::{Timer, TimerEvent};
use crate::usock::{Usock, UsockEvent};

use super::{Backoff, EndpointBase, EndpointConfig};

/// What to do once the child in flight has finished stopping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum After {
    Retry,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Connecting,
    Active,
    /// Reconnect backoff running.
    Waiting,
    StoppingUsock(After),
    StoppingSession(After),
    Done,
}

/// Connect-side endpoint: one session at a time, re-established with
/// exponential backoff whenever the connection or the handshake fails. A
/// failing connection is invisible to the caller; it simply keeps trying.
pub(crate) struct Connector {
    ctl: Token,
    state: State,
    cfg: EndpointConfig,
    shell: Arc<dyn PipeEvents>,
    base: Arc<dyn EndpointBase>,
    usock: Option<Usock>,
    session: Option<Session>,
    retry: Timer,
    backoff: Backoff,
}

impl Connector {
    pub fn create(
        r: &mut Reactor<'_>,
        ctl: Token,
        cfg: EndpointConfig,
        shell: Arc<dyn PipeEvents>,
        base: Arc<dyn EndpointBase>,
    ) -> io::Result<Connector> {
        // Bad addresses surface to the caller; everything later is retried.
        cfg.addr.to_sockaddr()?;

        let backoff = Backoff::new(cfg.reconnect_ivl, cfg.reconnect_ivl_max);
        Ok(Connector {
            ctl,
            state: State::Connecting,
            cfg,
            shell,
            base,
            usock: None,
            session: None,
            retry: Timer::new(r),
            backoff,
        })
    }

    fn start_connect(&mut self, r: &mut Reactor<'_>) -> Status {
        debug_assert!(self.usock.is_none() && self.session.is_none());

        let sa = match self.cfg.addr.to_sockaddr() {
            Ok(sa) => sa,
            Err(_) => return self.wait_retry(r),
        };

        let mut usock = match Usock::open(r, self.cfg.addr.domain()) {
            Ok(usock) => usock,
            Err(e) => {
                debug!("connect to {}: {}", self.cfg.addr, e);
                return self.wait_retry(r);
            }
        };

        match usock.connect(r, &sa) {
            None => {
                self.usock = Some(usock);
                self.state = State::Connecting;
                Status::Alive
            }
            Some(UsockEvent::Error(e)) => {
                debug!("connect to {}: {}", self.cfg.addr, e);
                usock.discard(r);
                self.wait_retry(r)
            }
            Some(other) => unreachable!("connect yielded {:?}", other),
        }
    }

    fn wait_retry(&mut self, r: &mut Reactor<'_>) -> Status {
        let delay = self.backoff.next();
        trace!("reconnect to {} in {:?}", self.cfg.addr, delay);
        self.retry.start(r, delay);
        self.state = State::Waiting;
        Status::Alive
    }

    fn on_connected(&mut self, r: &mut Reactor<'_>) -> Status {
        let usock = self.usock.take().unwrap();
        self.backoff.reset();
        debug!("connected to {}", self.cfg.addr);

        let mut session = Session::new(
            r,
            Arc::clone(&self.shell),
            self.cfg.protocol,
            self.cfg.hdr_timeout,
        );

        match session.start_active(r, usock) {
            None => {
                self.session = Some(session);
                self.state = State::Active;
                Status::Alive
            }
            Some(SessionEvent::Error(e)) => {
                debug!("session to {} failed at start: {}", self.cfg.addr, e);
                match session.stop(r) {
                    Some(SessionEvent::Stopped) => self.wait_retry(r),
                    None => {
                        self.session = Some(session);
                        self.state = State::StoppingSession(After::Retry);
                        Status::Alive
                    }
                    Some(other) => unreachable!("stop yielded {:?}", other),
                }
            }
            Some(other) => unreachable!("start yielded {:?}", other),
        }
    }

    fn proceed(&mut self, r: &mut Reactor<'_>, after: After) -> Status {
        match after {
            After::Retry => self.wait_retry(r),
            After::Stop => self.finish(r),
        }
    }

    fn begin_stop(&mut self, r: &mut Reactor<'_>) -> Status {
        debug!("stopping endpoint {}", self.cfg.addr);

        match self.state {
            State::Connecting => match self.usock.as_mut().unwrap().close(r) {
                None => {
                    self.state = State::StoppingUsock(After::Stop);
                    Status::Alive
                }
                Some(UsockEvent::Stopped) => {
                    self.usock = None;
                    self.finish(r)
                }
                Some(other) => unreachable!("close yielded {:?}", other),
            },
            State::Active => match self.session.as_mut().unwrap().stop(r) {
                None => {
                    self.state = State::StoppingSession(After::Stop);
                    Status::Alive
                }
                Some(SessionEvent::Stopped) => {
                    self.session = None;
                    self.finish(r)
                }
                Some(other) => unreachable!("stop yielded {:?}", other),
            },
            State::Waiting => {
                let _ = self.retry.stop(r);
                self.finish(r)
            }
            State::StoppingUsock(_) => {
                self.state = State::StoppingUsock(After::Stop);
                Status::Alive
            }
            State::StoppingSession(_) => {
                self.state = State::StoppingSession(After::Stop);
                Status::Alive
            }
            State::Done => Status::Alive,
        }
    }

    fn finish(&mut self, r: &mut Reactor<'_>) -> Status {
        self.retry.release(r);
        r.release(self.ctl);
        self.state = State::Done;
        debug!("endpoint {} stopped", self.cfg.addr);
        self.base.stopped();
        Status::Done
    }
}

impl Fsm for Connector {
    fn handle(&mut self, r: &mut Reactor<'_>, ev: Event) -> Status {
        if ev.source == self.ctl {
            return match ev.kind {
                EventKind::Start => self.start_connect(r),
                EventKind::Stop => self.begin_stop(r),
                _ => unreachable!("connector ctl got {:?}", ev.kind),
            };
        }

        if self.retry.owns(ev.source) {
            match self.retry.handle_ev(ev) {
                Some(TimerEvent::Timeout) if self.state == State::Waiting => {
                    return self.start_connect(r);
                }
                _ => {}
            }
            return Status::Alive;
        }

        if self.usock.as_ref().map_or(false, |u| u.owns(ev.source)) {
            let uev = self.usock.as_mut().unwrap().handle_ev(r, ev);
            return match (self.state, uev) {
                (State::Connecting, Some(UsockEvent::Connected)) => self.on_connected(r),
                (State::Connecting, Some(UsockEvent::Error(e))) => {
                    debug!("connect to {}: {}", self.cfg.addr, e);
                    match self.usock.as_mut().unwrap().close(r) {
                        None => {
                            self.state = State::StoppingUsock(After::Retry);
                            Status::Alive
                        }
                        Some(UsockEvent::Stopped) => {
                            self.usock = None;
                            self.wait_retry(r)
                        }
                        Some(other) => unreachable!("close yielded {:?}", other),
                    }
                }
                (State::StoppingUsock(after), Some(UsockEvent::Stopped)) => {
                    self.usock = None;
                    self.proceed(r, after)
                }
                (_, None) => Status::Alive,
                (state, uev) => {
                    trace!("connector: {:?} in {:?}", uev, state);
                    Status::Alive
                }
            };
        }

        if self.session.as_ref().map_or(false, |s| s.owns(ev.source)) {
            let sev = self.session.as_mut().unwrap().handle_ev(r, ev);
            return match (self.state, sev) {
                (State::Active, Some(SessionEvent::Error(e))) => {
                    debug!("session to {} failed: {}", self.cfg.addr, e);
                    match self.session.as_mut().unwrap().stop(r) {
                        None => {
                            self.state = State::StoppingSession(After::Retry);
                            Status::Alive
                        }
                        Some(SessionEvent::Stopped) => {
                            self.session = None;
                            self.wait_retry(r)
                        }
                        Some(other) => unreachable!("stop yielded {:?}", other),
                    }
                }
                (State::StoppingSession(after), Some(SessionEvent::Stopped)) => {
                    self.session = None;
                    self.proceed(r, after)
                }
                (_, None) => Status::Alive,
                (state, sev) => {
                    trace!("connector: {:?} in {:?}", sev, state);
                    Status::Alive
                }
            };
        }

        trace!("connector: stale event {:?}", ev);
        Status::Alive
    }
}
