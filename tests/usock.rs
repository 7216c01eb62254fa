//! Exercises the non-blocking socket machine directly, without the session
//! layer: listen, accept, connect, a 4-byte exchange, orderly close.

use std::collections::VecDeque;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use spio::{
    Addr, Ctx, Event, EventKind, Fsm, Pool, Reactor, Status, Token, Usock, UsockEvent,
};

enum Cmd {
    Accept,
    Connect(Addr),
    Send(usize, Vec<u8>),
    Recv(usize, usize),
    Close(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Out {
    Connected(usize),
    Accepted(usize),
    Sent(usize),
    Received(usize, Vec<u8>),
    Error(usize),
    Stopped(usize),
}

/// Root machine owning a set of usocks, driven by commands from the test
/// thread and reporting every emission back on a channel.
struct Probe {
    ctl: Token,
    socks: Vec<Option<Usock>>,
    cmds: Arc<Mutex<VecDeque<Cmd>>>,
    tx: mpsc::Sender<Out>,
}

impl Probe {
    fn run_cmds(&mut self, r: &mut Reactor<'_>) {
        loop {
            let cmd = self.cmds.lock().unwrap().pop_front();
            let Some(cmd) = cmd else { return };

            match cmd {
                Cmd::Accept => {
                    let uev = self.socks[0].as_mut().unwrap().accept(r);
                    self.consume(r, 0, uev);
                }
                Cmd::Connect(addr) => {
                    let sa = addr.to_sockaddr().unwrap();
                    let mut sock = Usock::open(r, addr.domain()).unwrap();
                    let uev = sock.connect(r, &sa);
                    let idx = self.socks.len();
                    self.socks.push(Some(sock));
                    self.consume(r, idx, uev);
                }
                Cmd::Send(idx, data) => {
                    let uev = self.socks[idx]
                        .as_mut()
                        .unwrap()
                        .send(r, vec![Bytes::from(data)]);
                    self.consume(r, idx, uev);
                }
                Cmd::Recv(idx, n) => {
                    let uev = self.socks[idx].as_mut().unwrap().recv(r, n);
                    self.consume(r, idx, uev);
                }
                Cmd::Close(idx) => {
                    let uev = self.socks[idx].as_mut().unwrap().close(r);
                    self.consume(r, idx, uev);
                }
            }
        }
    }

    fn consume(&mut self, r: &mut Reactor<'_>, idx: usize, uev: Option<UsockEvent>) {
        let Some(uev) = uev else { return };

        match uev {
            UsockEvent::Connected => self.tx.send(Out::Connected(idx)).unwrap(),
            UsockEvent::Accepted(mut sock) => {
                sock.activate(r);
                let new = self.socks.len();
                self.socks.push(Some(sock));
                self.tx.send(Out::Accepted(new)).unwrap();
            }
            UsockEvent::Sent => self.tx.send(Out::Sent(idx)).unwrap(),
            UsockEvent::Received(b) => self.tx.send(Out::Received(idx, b.to_vec())).unwrap(),
            UsockEvent::Error(_) => self.tx.send(Out::Error(idx)).unwrap(),
            // The socket stays in place so a later close can be verified as
            // a no-op.
            UsockEvent::Stopped => self.tx.send(Out::Stopped(idx)).unwrap(),
        }
    }
}

impl Fsm for Probe {
    fn handle(&mut self, r: &mut Reactor<'_>, ev: Event) -> Status {
        if ev.source == self.ctl {
            if ev.kind == EventKind::TaskPosted {
                self.run_cmds(r);
            }
            return Status::Alive;
        }

        let idx = self
            .socks
            .iter()
            .position(|s| s.as_ref().map_or(false, |u| u.owns(ev.source)));
        if let Some(idx) = idx {
            let uev = self.socks[idx].as_mut().unwrap().handle_ev(r, ev);
            self.consume(r, idx, uev);
        }

        Status::Alive
    }
}

/// Wait until every wanted event has been seen, in any order. Unrelated
/// events are ignored.
fn wait_all(rx: &mpsc::Receiver<Out>, wants: &[Out]) {
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    let mut missing: Vec<Out> = wants.to_vec();
    let mut seen = Vec::new();

    while !missing.is_empty() {
        let left = deadline.saturating_duration_since(std::time::Instant::now());
        match rx.recv_timeout(left) {
            Ok(out) => {
                if let Some(pos) = missing.iter().position(|w| *w == out) {
                    missing.remove(pos);
                } else {
                    seen.push(out);
                }
            }
            Err(_) => panic!("timed out waiting for {:?}; saw {:?}", missing, seen),
        }
    }
}

#[test]
fn listen_connect_send_recv_close() {
    let pool = Pool::new(1).unwrap();
    let ctx = Ctx::new(&pool);

    let (tx, rx) = mpsc::channel();
    let (addr_tx, addr_rx) = mpsc::channel();
    let cmds: Arc<Mutex<VecDeque<Cmd>>> = Arc::new(Mutex::new(VecDeque::new()));

    let probe_cmds = Arc::clone(&cmds);
    let ctl = ctx
        .spawn(move |r, ctl| {
            let addr = Addr::Tcp("127.0.0.1:0".parse().unwrap());
            let lsock = Usock::open(r, addr.domain())?;
            lsock.bind(&addr.to_sockaddr()?)?;
            lsock.listen(10)?;
            addr_tx.send(lsock.local_addr()?).unwrap();

            Ok(Probe {
                ctl,
                socks: vec![Some(lsock)],
                cmds: probe_cmds,
                tx,
            })
        })
        .unwrap();

    let bound = addr_rx.recv().unwrap();
    let push = |cmd: Cmd| {
        cmds.lock().unwrap().push_back(cmd);
        ctx.feed(ctl, EventKind::TaskPosted);
    };

    // Client connects; the listener hands back a new usock, which the
    // probe activates (Connected on the accepted side).
    push(Cmd::Accept);
    push(Cmd::Connect(Addr::Tcp(bound)));

    wait_all(
        &rx,
        &[Out::Connected(1), Out::Accepted(2), Out::Connected(2)],
    );

    // 4 bytes across, exactly as submitted.
    push(Cmd::Send(1, b"ABCD".to_vec()));
    push(Cmd::Recv(2, 4));
    wait_all(&rx, &[Out::Sent(1), Out::Received(2, b"ABCD".to_vec())]);

    // Orderly close of every socket, then close again: a no-op.
    push(Cmd::Close(1));
    push(Cmd::Close(2));
    push(Cmd::Close(0));
    wait_all(&rx, &[Out::Stopped(1), Out::Stopped(2), Out::Stopped(0)]);

    push(Cmd::Close(1));
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
}

#[test]
fn connect_refused_reports_error() {
    let pool = Pool::new(1).unwrap();
    let ctx = Ctx::new(&pool);

    let (tx, rx) = mpsc::channel();
    let cmds: Arc<Mutex<VecDeque<Cmd>>> = Arc::new(Mutex::new(VecDeque::new()));

    let probe_cmds = Arc::clone(&cmds);
    let ctl = ctx
        .spawn(move |r, ctl| {
            // Index 0 placeholder so client sockets start at 1.
            let addr = Addr::Tcp("127.0.0.1:0".parse().unwrap());
            let lsock = Usock::open(r, addr.domain())?;
            lsock.bind(&addr.to_sockaddr()?)?;
            lsock.listen(1)?;

            Ok(Probe {
                ctl,
                socks: vec![Some(lsock)],
                cmds: probe_cmds,
                tx,
            })
        })
        .unwrap();

    // Nothing listens on the reserved port once the helper socket is gone.
    let dead = common_free_port();
    cmds.lock()
        .unwrap()
        .push_back(Cmd::Connect(Addr::Tcp(format!("127.0.0.1:{}", dead).parse().unwrap())));
    ctx.feed(ctl, EventKind::TaskPosted);

    wait_all(&rx, &[Out::Error(1)]);
}

fn common_free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}
