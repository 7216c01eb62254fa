use std::io;
use std::sync::Arc;

use indexmap::IndexMap;
use log::{debug, trace, warn};
use slab::Slab;

use crate::ctx::Reactor;
use crate::fsm::{Event, EventKind, Fsm, Status, Token};
use crate::pipe::PipeEvents;
use crate::stream::{Session, SessionEvent};
use crate::timer::{Timer, TimerEvent};
use crate::usock::{Usock, UsockEvent};

use super::{transient, Backoff, EndpointBase, EndpointConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Listening; one accepting child is waiting on the listener (or a
    /// backoff retry is pending after an accept failure).
    Active,
    /// Listen itself failed transiently; retrying with backoff.
    Retrying,
    StoppingUsock,
    StoppingSessions,
    Done,
}

/// Bind-side endpoint: one listening socket, continuous accept, a session
/// per live connection, orderly fleet shutdown.
pub(crate) struct Acceptor {
    ctl: Token,
    state: State,
    cfg: EndpointConfig,
    shell: Arc<dyn PipeEvents>,
    base: Arc<dyn EndpointBase>,
    lsock: Option<Usock>,
    accepting: Option<Session>,
    sessions: Slab<Session>,
    /// Child token -> session key, for event routing.
    index: IndexMap<usize, usize>,
    retry: Timer,
    backoff: Backoff,
}

impl Acceptor {
    pub fn create(
        r: &mut Reactor<'_>,
        ctl: Token,
        cfg: EndpointConfig,
        shell: Arc<dyn PipeEvents>,
        base: Arc<dyn EndpointBase>,
    ) -> io::Result<Acceptor> {
        let backoff = Backoff::new(cfg.reconnect_ivl, cfg.reconnect_ivl_max);
        let mut acceptor = Acceptor {
            ctl,
            state: State::Active,
            cfg,
            shell,
            base,
            lsock: None,
            accepting: None,
            sessions: Slab::new(),
            index: IndexMap::new(),
            retry: Timer::new(r),
            backoff,
        };

        match acceptor.try_listen(r) {
            Ok(()) => {}
            Err(e) if transient(&e) => {
                warn!("listen on {} failed ({}), retrying", acceptor.cfg.addr, e);
                let delay = acceptor.backoff.next();
                acceptor.retry.start(r, delay);
                acceptor.state = State::Retrying;
            }
            Err(e) => return Err(e),
        }

        Ok(acceptor)
    }

    fn try_listen(&mut self, r: &mut Reactor<'_>) -> io::Result<()> {
        let sa = self.cfg.addr.to_sockaddr()?;
        self.cfg.addr.unlink_stale()?;

        let lsock = Usock::open(r, self.cfg.addr.domain())?;
        if let Err(e) = lsock.bind(&sa).and_then(|_| lsock.listen(self.cfg.backlog)) {
            lsock.discard(r);
            return Err(e);
        }

        debug!("listening on {}", self.cfg.addr);
        self.lsock = Some(lsock);
        Ok(())
    }

    /// Keep one accepting child outstanding; connections that are already
    /// queued come back synchronously, so loop until the listener blocks.
    fn start_accepting(&mut self, r: &mut Reactor<'_>) {
        loop {
            debug_assert!(self.accepting.is_none());
            let mut session = Session::new(
                r,
                Arc::clone(&self.shell),
                self.cfg.protocol,
                self.cfg.hdr_timeout,
            );

            match session.drive_accept(r, self.lsock.as_mut().unwrap()) {
                None => {
                    self.accepting = Some(session);
                    return;
                }
                Some(SessionEvent::Accepted) => {
                    self.backoff.reset();
                    self.adopt(session);
                }
                Some(SessionEvent::Error(e)) => {
                    session.abandon(r);
                    self.accept_failed(r, e);
                    return;
                }
                Some(SessionEvent::Stopped) => unreachable!(),
            }
        }
    }

    fn adopt(&mut self, session: Session) {
        let mut toks = Vec::new();
        session.tokens(&mut toks);
        let key = self.sessions.insert(session);
        for tok in toks {
            self.index.insert(tok.0, key);
        }
    }

    fn erase(&mut self, key: usize) {
        self.index.retain(|_, k| *k != key);
        self.sessions.remove(key);
    }

    fn accept_failed(&mut self, r: &mut Reactor<'_>, e: crate::error::Error) {
        warn!("accept on {} failed ({}), backing off", self.cfg.addr, e);
        let delay = self.backoff.next();
        self.retry.start(r, delay);
    }

    fn begin_stop(&mut self, r: &mut Reactor<'_>) -> Status {
        debug!("stopping endpoint {}", self.cfg.addr);

        if let Some(mut accepting) = self.accepting.take() {
            accepting.abandon(r);
        }
        let _ = self.retry.stop(r);

        match self.lsock.as_mut() {
            Some(lsock) => match lsock.close(r) {
                Some(UsockEvent::Stopped) => {
                    self.lsock = None;
                    self.stop_sessions(r)
                }
                None => {
                    self.state = State::StoppingUsock;
                    Status::Alive
                }
                Some(other) => unreachable!("close yielded {:?}", other),
            },
            None => self.stop_sessions(r),
        }
    }

    fn stop_sessions(&mut self, r: &mut Reactor<'_>) -> Status {
        self.state = State::StoppingSessions;

        let keys: Vec<usize> = self.sessions.iter().map(|(k, _)| k).collect();
        for key in keys {
            if let Some(SessionEvent::Stopped) = self.sessions[key].stop(r) {
                self.erase(key);
            }
        }

        if self.sessions.is_empty() {
            self.finish(r)
        } else {
            Status::Alive
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

    fn on_retry_fire(&mut self, r: &mut Reactor<'_>) {
        match self.state {
            State::Retrying => match self.try_listen(r) {
                Ok(()) => {
                    self.state = State::Active;
                    self.start_accepting(r);
                }
                Err(e) => {
                    if !transient(&e) {
                        warn!("listen on {} keeps failing: {}", self.cfg.addr, e);
                    }
                    let delay = self.backoff.next();
                    self.retry.start(r, delay);
                }
            },
            // Accept-side backoff elapsed; resume accepting.
            State::Active => self.start_accepting(r),
            _ => {}
        }
    }
}

impl Fsm for Acceptor {
    fn handle(&mut self, r: &mut Reactor<'_>, ev: Event) -> Status {
        if ev.source == self.ctl {
            return match ev.kind {
                EventKind::Start => {
                    if self.lsock.is_some() {
                        self.start_accepting(r);
                    }
                    Status::Alive
                }
                EventKind::Stop => self.begin_stop(r),
                _ => unreachable!("acceptor ctl got {:?}", ev.kind),
            };
        }

        if self.retry.owns(ev.source) {
            match self.retry.handle_ev(ev) {
                Some(TimerEvent::Timeout) => self.on_retry_fire(r),
                // Stop acknowledgement during teardown.
                Some(TimerEvent::Stopped) | None => {}
            }
            return Status::Alive;
        }

        if self.lsock.as_ref().map_or(false, |u| u.owns(ev.source)) {
            match self.state {
                State::Active => {
                    if let Some(mut accepting) = self.accepting.take() {
                        let lsock = self.lsock.as_mut().unwrap();
                        match accepting.on_listen_event(r, lsock, ev) {
                            None => self.accepting = Some(accepting),
                            Some(SessionEvent::Accepted) => {
                                self.backoff.reset();
                                self.adopt(accepting);
                                self.start_accepting(r);
                            }
                            Some(SessionEvent::Error(e)) => {
                                accepting.abandon(r);
                                self.accept_failed(r, e);
                            }
                            Some(SessionEvent::Stopped) => unreachable!(),
                        }
                    } else if let Some(uev) = self.lsock.as_mut().unwrap().handle_ev(r, ev) {
                        trace!("listener event with no accepting child: {:?}", uev);
                    }
                }
                State::StoppingUsock => {
                    if let Some(UsockEvent::Stopped) = self.lsock.as_mut().unwrap().handle_ev(r, ev)
                    {
                        self.lsock = None;
                        return self.stop_sessions(r);
                    }
                }
                _ => {
                    let _ = self.lsock.as_mut().unwrap().handle_ev(r, ev);
                }
            }
            return Status::Alive;
        }

        let key = match self.index.get(&ev.source.0) {
            Some(&key) => key,
            None => {
                trace!("acceptor: stale event {:?}", ev);
                return Status::Alive;
            }
        };

        match self.sessions[key].handle_ev(r, ev) {
            Some(SessionEvent::Error(e)) => {
                debug!("session on {} failed: {}", self.cfg.addr, e);
                if let Some(SessionEvent::Stopped) = self.sessions[key].stop(r) {
                    self.erase(key);
                }
            }
            Some(SessionEvent::Stopped) => {
                self.erase(key);
                if self.state == State::StoppingSessions && self.sessions.is_empty() {
                    return self.finish(r);
                }
            }
            Some(SessionEvent::Accepted) | None => {}
        }

        Status::Alive
    }
}
