//! End-to-end endpoint tests: handshake, framing, backpressure, reconnect
//! and orderly shutdown, over TCP and IPC.

mod common;

use std::io::{Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use common::{free_port, ipc_path, wait_for, Base, Shell, ShellEvent, PULL, PUSH};
use spio::{Addr, Ctx, EndpointConfig, Message, Pipe, Pool};

fn send_blocking(pipe: &Pipe, mut msg: Message) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match pipe.send(&mut msg) {
            Ok(()) => return,
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                assert!(Instant::now() < deadline, "send stuck");
                thread::sleep(Duration::from_millis(1));
            }
            Err(e) => panic!("send failed: {}", e),
        }
    }
}

#[test]
fn tcp_push_pull_roundtrip() {
    common::init_logs();
    let pool = Pool::new(2).unwrap();
    let addr = Addr::Tcp(format!("127.0.0.1:{}", free_port()).parse().unwrap());

    let (pull_tx, pull_rx) = mpsc::channel();
    let (push_tx, push_rx) = mpsc::channel();
    let (stop_tx, stop_rx) = mpsc::channel();

    let pull_shell = Arc::new(Shell::new(PUSH, pull_tx));
    let push_shell = Arc::new(Shell::new(PULL, push_tx));

    let pull_ctx = Ctx::new(&pool);
    let push_ctx = Ctx::new(&pool);

    let bound = spio::bind(
        &pull_ctx,
        EndpointConfig::new(addr.clone(), PULL),
        pull_shell.clone(),
        Arc::new(Base::new(stop_tx.clone())),
    )
    .unwrap();
    let connected = spio::connect(
        &push_ctx,
        EndpointConfig::new(addr, PUSH),
        push_shell.clone(),
        Arc::new(Base::new(stop_tx)),
    )
    .unwrap();

    wait_for(&push_rx, &ShellEvent::Activated, Duration::from_secs(5));
    wait_for(&pull_rx, &ShellEvent::Activated, Duration::from_secs(5));

    let pipe = push_shell.pipe(0);

    // One small message.
    send_blocking(&pipe, Message::from(&b"hello"[..]));
    wait_for(
        &pull_rx,
        &ShellEvent::Received(b"hello".to_vec()),
        Duration::from_secs(5),
    );
    wait_for(&push_rx, &ShellEvent::Sent, Duration::from_secs(5));

    // A zero-length message is legal and arrives empty.
    send_blocking(&pipe, Message::new());
    wait_for(
        &pull_rx,
        &ShellEvent::Received(Vec::new()),
        Duration::from_secs(5),
    );

    // A stream of 1 KiB messages arrives complete and in order.
    const COUNT: usize = 100;
    for i in 0..COUNT {
        send_blocking(&pipe, Message::from(vec![i as u8; 1024]));
    }
    for i in 0..COUNT {
        wait_for(
            &pull_rx,
            &ShellEvent::Received(vec![i as u8; 1024]),
            Duration::from_secs(10),
        );
    }

    connected.stop();
    stop_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    bound.stop();
    stop_rx.recv_timeout(Duration::from_secs(5)).unwrap();
}

#[test]
fn ipc_wire_format_exact_bytes() {
    common::init_logs();
    let pool = Pool::new(1).unwrap();
    let path = ipc_path("wire");
    let addr = Addr::Ipc(path.clone());

    let (pull_tx, pull_rx) = mpsc::channel();
    let (stop_tx, stop_rx) = mpsc::channel();
    let pull_shell = Arc::new(Shell::new(PUSH, pull_tx));

    let ctx = Ctx::new(&pool);
    let endpoint = spio::bind(
        &ctx,
        EndpointConfig::new(addr, PULL),
        pull_shell.clone(),
        Arc::new(Base::new(stop_tx)),
    )
    .unwrap();

    // A raw peer speaks the wire protocol by hand.
    let mut raw = std::os::unix::net::UnixStream::connect(&path).unwrap();
    raw.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

    raw.write_all(&[0x00, 0x00, 0x53, 0x50, 0x00, PUSH as u8, 0x00, 0x00])
        .unwrap();

    let mut hdr = [0u8; 8];
    raw.read_exact(&mut hdr).unwrap();
    assert_eq!(hdr, [0x00, 0x00, 0x53, 0x50, 0x00, PULL as u8, 0x00, 0x00]);

    wait_for(&pull_rx, &ShellEvent::Activated, Duration::from_secs(5));

    // "hello", framed: 8-byte big-endian length, then the body.
    raw.write_all(&[0, 0, 0, 0, 0, 0, 0, 5]).unwrap();
    raw.write_all(b"hello").unwrap();
    wait_for(
        &pull_rx,
        &ShellEvent::Received(b"hello".to_vec()),
        Duration::from_secs(5),
    );

    // Zero-length frame: eight zero bytes, no body.
    raw.write_all(&[0, 0, 0, 0, 0, 0, 0, 0]).unwrap();
    wait_for(
        &pull_rx,
        &ShellEvent::Received(Vec::new()),
        Duration::from_secs(5),
    );

    // The reverse direction frames the same way.
    send_blocking(&pull_shell.pipe(0), Message::from(&b"world"[..]));
    let mut frame = [0u8; 13];
    raw.read_exact(&mut frame).unwrap();
    assert_eq!(&frame[..8], &[0, 0, 0, 0, 0, 0, 0, 5]);
    assert_eq!(&frame[8..], b"world");

    endpoint.stop();
    stop_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    let _ = std::fs::remove_file(&path);
}

#[test]
fn handshake_timeout_keeps_reconnecting() {
    common::init_logs();
    let pool = Pool::new(1).unwrap();

    // A mute server: accepts and never writes a header back.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let target = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));

    let thread_accepted = Arc::clone(&accepted);
    thread::spawn(move || {
        let mut keep = Vec::new();
        while let Ok((stream, _)) = listener.accept() {
            thread_accepted.fetch_add(1, Ordering::SeqCst);
            keep.push(stream);
        }
    });

    let (push_tx, push_rx) = mpsc::channel();
    let (stop_tx, stop_rx) = mpsc::channel();
    let push_shell = Arc::new(Shell::new(PULL, push_tx));

    let mut cfg = EndpointConfig::new(Addr::Tcp(target), PUSH);
    cfg.hdr_timeout = Duration::from_millis(300);

    let ctx = Ctx::new(&pool);
    let endpoint = spio::connect(&ctx, cfg, push_shell.clone(), Arc::new(Base::new(stop_tx)))
        .unwrap();

    thread::sleep(Duration::from_secs(3));

    // Each timed-out handshake schedules a reconnect with backoff.
    assert!(
        accepted.load(Ordering::SeqCst) >= 2,
        "only {} connection attempts",
        accepted.load(Ordering::SeqCst)
    );
    // The pipe never came up.
    assert_eq!(push_shell.activated_count(), 0);
    assert!(push_rx.try_recv().is_err());

    endpoint.stop();
    stop_rx.recv_timeout(Duration::from_secs(5)).unwrap();
}

#[test]
fn rejected_peer_gets_no_data() {
    common::init_logs();
    let pool = Pool::new(1).unwrap();
    let path = ipc_path("reject");

    let (pull_tx, pull_rx) = mpsc::channel();
    let (stop_tx, stop_rx) = mpsc::channel();
    // Only PUSH peers are acceptable.
    let pull_shell = Arc::new(Shell::new(PUSH, pull_tx));

    let ctx = Ctx::new(&pool);
    let endpoint = spio::bind(
        &ctx,
        EndpointConfig::new(Addr::Ipc(path.clone()), PULL),
        pull_shell.clone(),
        Arc::new(Base::new(stop_tx)),
    )
    .unwrap();

    let mut raw = std::os::unix::net::UnixStream::connect(&path).unwrap();
    raw.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

    // Valid header shape, wrong protocol id.
    raw.write_all(&[0x00, 0x00, 0x53, 0x50, 0x00, 99, 0x00, 0x00])
        .unwrap();

    // Our header still arrives (sent eagerly), then the connection dies.
    let mut hdr = [0u8; 8];
    raw.read_exact(&mut hdr).unwrap();
    let mut rest = [0u8; 1];
    match raw.read(&mut rest) {
        Ok(0) => {}
        Ok(n) => panic!("{} unexpected data bytes after rejection", n),
        Err(_) => {} // reset is as good as EOF here
    }

    // The shell never saw the pipe, let alone data.
    assert_eq!(pull_shell.activated_count(), 0);
    assert!(pull_rx.try_recv().is_err());

    endpoint.stop();
    stop_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    let _ = std::fs::remove_file(&path);
}

#[test]
fn shutdown_with_live_sessions() {
    const SESSIONS: usize = 20;

    common::init_logs();
    let pool = Pool::new(2).unwrap();
    let addr: std::net::SocketAddr = format!("127.0.0.1:{}", free_port()).parse().unwrap();

    let (pull_tx, pull_rx) = mpsc::channel();
    let (stop_tx, stop_rx) = mpsc::channel();
    let pull_shell = Arc::new(Shell::new(PUSH, pull_tx));

    let ctx = Ctx::new(&pool);
    let endpoint = spio::bind(
        &ctx,
        EndpointConfig::new(Addr::Tcp(addr), PULL),
        pull_shell.clone(),
        Arc::new(Base::new(stop_tx)),
    )
    .unwrap();

    // A fleet of raw peers, each completing the handshake then sitting idle
    // mid-conversation.
    let mut raws = Vec::new();
    for _ in 0..SESSIONS {
        let mut raw = std::net::TcpStream::connect(addr).unwrap();
        raw.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        raw.write_all(&[0x00, 0x00, 0x53, 0x50, 0x00, PUSH as u8, 0x00, 0x00])
            .unwrap();
        let mut hdr = [0u8; 8];
        raw.read_exact(&mut hdr).unwrap();
        raws.push(raw);
    }

    for _ in 0..SESSIONS {
        wait_for(&pull_rx, &ShellEvent::Activated, Duration::from_secs(5));
    }

    endpoint.stop();
    stop_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("endpoint did not stop");

    // Every session detached and every peer sees its connection closed.
    let mut detached = 0;
    while let Ok(ev) = pull_rx.recv_timeout(Duration::from_secs(1)) {
        if ev == ShellEvent::Detached {
            detached += 1;
            if detached == SESSIONS {
                break;
            }
        }
    }
    assert_eq!(detached, SESSIONS);

    for raw in &mut raws {
        let mut buf = [0u8; 1];
        match raw.read(&mut buf) {
            Ok(0) | Err(_) => {}
            Ok(n) => panic!("{} stray bytes at shutdown", n),
        }
    }
}
