#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use spio::{EndpointBase, Message, Pipe, PipeEvents};

pub const PUSH: u16 = 80;
pub const PULL: u16 = 81;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellEvent {
    Activated,
    Received(Vec<u8>),
    Sent,
    Detached,
}

/// Minimal protocol shell: accepts one peer protocol, drains every inbound
/// message as it lands and reports everything on a channel.
pub struct Shell {
    peer: u16,
    tx: Mutex<Sender<ShellEvent>>,
    pipes: Mutex<Vec<Pipe>>,
    activated: AtomicUsize,
}

impl Shell {
    pub fn new(peer: u16, tx: Sender<ShellEvent>) -> Shell {
        Shell {
            peer,
            tx: Mutex::new(tx),
            pipes: Mutex::new(Vec::new()),
            activated: AtomicUsize::new(0),
        }
    }

    pub fn pipe(&self, i: usize) -> Pipe {
        self.pipes.lock().unwrap()[i].clone()
    }

    pub fn activated_count(&self) -> usize {
        self.activated.load(Ordering::SeqCst)
    }

    fn emit(&self, ev: ShellEvent) {
        let _ = self.tx.lock().unwrap().send(ev);
    }
}

impl PipeEvents for Shell {
    fn is_peer(&self, protocol: u16) -> bool {
        protocol == self.peer
    }

    fn activated(&self, pipe: &Pipe) {
        self.pipes.lock().unwrap().push(pipe.clone());
        self.activated.fetch_add(1, Ordering::SeqCst);
        self.emit(ShellEvent::Activated);
    }

    fn received(&self, pipe: &Pipe) {
        let mut msg = Message::new();
        if pipe.recv(&mut msg).is_ok() {
            self.emit(ShellEvent::Received(msg.body.to_vec()));
        }
    }

    fn sent(&self, _pipe: &Pipe) {
        self.emit(ShellEvent::Sent);
    }

    fn detached(&self, _pipe: &Pipe) {
        self.emit(ShellEvent::Detached);
    }
}

pub struct Base {
    tx: Mutex<Sender<()>>,
}

impl Base {
    pub fn new(tx: Sender<()>) -> Base {
        Base { tx: Mutex::new(tx) }
    }
}

impl EndpointBase for Base {
    fn stopped(&self) {
        let _ = self.tx.lock().unwrap().send(());
    }
}

pub fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Reserve a port the endpoint can then bind. Small race window, same as
/// every test that needs a concrete listen address.
pub fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

pub fn ipc_path(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!("spio-test-{}-{}.ipc", std::process::id(), tag))
}

/// Drain `rx` until `want` is seen, failing loudly on timeout. Returns the
/// events consumed before the match.
pub fn wait_for(rx: &Receiver<ShellEvent>, want: &ShellEvent, timeout: Duration) -> Vec<ShellEvent> {
    let deadline = Instant::now() + timeout;
    let mut seen = Vec::new();

    loop {
        let left = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(left) {
            Ok(ev) if ev == *want => return seen,
            Ok(ev) => seen.push(ev),
            Err(_) => panic!("timed out waiting for {:?}; saw {:?}", want, seen),
        }
    }
}
