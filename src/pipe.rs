use std::io;
use std::sync::{Arc, Mutex};

use crate::ctx::FsmRef;
use crate::fsm::EventKind;
use crate::message::Message;

/// Upcalls a session makes into its protocol shell. All of them run with
/// the session's context entered; calling back into the pipe from inside an
/// upcall is allowed.
pub trait PipeEvents: Send + Sync {
    /// Would a peer speaking `protocol` be acceptable on this socket?
    fn is_peer(&self, protocol: u16) -> bool;

    /// The header exchange finished; the pipe is ready for I/O.
    fn activated(&self, pipe: &Pipe);

    /// An inbound message is ready; fetch it with [`Pipe::recv`].
    fn received(&self, pipe: &Pipe);

    /// The egress slot is free again.
    fn sent(&self, pipe: &Pipe);

    /// The session is gone; the pipe will accept no more traffic.
    fn detached(&self, pipe: &Pipe);
}

struct Slots {
    active: bool,
    detached: bool,
    can_send: bool,
    outmsg: Option<Message>,
    inmsg: Option<Message>,
}

/// The shell-facing side of one session: a single-message slot in each
/// direction. Acceptance is immediate, completion is asynchronous through
/// the [`PipeEvents`] upcalls.
#[derive(Clone)]
pub struct Pipe {
    target: FsmRef,
    slots: Arc<Mutex<Slots>>,
    protocol: u16,
}

impl Pipe {
    /// Stage `msg` for sending; the message is moved out on acceptance.
    /// `WouldBlock` when the session is not ready or the egress slot is
    /// occupied; `NotConnected` once the session is gone.
    pub fn send(&self, msg: &mut Message) -> io::Result<()> {
        {
            let mut s = self.slots.lock().unwrap();
            if s.detached {
                return Err(io::ErrorKind::NotConnected.into());
            }
            if !s.active || !s.can_send || s.outmsg.is_some() {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            s.outmsg = Some(msg.take());
            s.can_send = false;
        }
        // Lock released before entering the context.
        self.target.feed(EventKind::Send);
        Ok(())
    }

    /// Move the completed inbound message out. `WouldBlock` when none is
    /// ready yet.
    pub fn recv(&self, msg: &mut Message) -> io::Result<()> {
        let got = {
            let mut s = self.slots.lock().unwrap();
            match s.inmsg.take() {
                Some(m) => m,
                None if s.detached => return Err(io::ErrorKind::NotConnected.into()),
                None => return Err(io::ErrorKind::WouldBlock.into()),
            }
        };
        *msg = got;
        self.target.feed(EventKind::Recv);
        Ok(())
    }

    /// The local protocol id this pipe was negotiated with.
    pub fn protocol(&self) -> u16 {
        self.protocol
    }
}

/// The session-facing side: stages, completions and shell notification.
/// Guard discipline: the slot lock is never held across an upcall.
pub(crate) struct PipeBase {
    shell: Arc<dyn PipeEvents>,
    slots: Arc<Mutex<Slots>>,
    pipe: Pipe,
}

impl PipeBase {
    pub fn new(shell: Arc<dyn PipeEvents>, target: FsmRef, protocol: u16) -> PipeBase {
        let slots = Arc::new(Mutex::new(Slots {
            active: false,
            detached: false,
            can_send: false,
            outmsg: None,
            inmsg: None,
        }));

        PipeBase {
            shell,
            slots: Arc::clone(&slots),
            pipe: Pipe {
                target,
                slots,
                protocol,
            },
        }
    }

    pub fn is_peer(&self, protocol: u16) -> bool {
        self.shell.is_peer(protocol)
    }

    /// Handshake done: open both directions and tell the shell.
    pub fn activate(&self) {
        {
            let mut s = self.slots.lock().unwrap();
            s.active = true;
            s.can_send = true;
        }
        self.shell.activated(&self.pipe);
    }

    /// Take the staged outbound message, if the stage and this event did not
    /// cross a detach.
    pub fn take_out(&self) -> Option<Message> {
        self.slots.lock().unwrap().outmsg.take()
    }

    /// The frame hit the wire; free the egress slot.
    pub fn sent_ack(&self) {
        {
            let mut s = self.slots.lock().unwrap();
            s.can_send = true;
        }
        self.shell.sent(&self.pipe);
    }

    /// A complete inbound message; park it for the shell.
    pub fn put_in(&self, msg: Message) {
        {
            let mut s = self.slots.lock().unwrap();
            debug_assert!(s.inmsg.is_none());
            s.inmsg = Some(msg);
        }
        self.shell.received(&self.pipe);
    }

    /// Tear the surface down; pending stages are dropped. The shell only
    /// hears about pipes it was introduced to.
    pub fn detach(&self, announce: bool) {
        {
            let mut s = self.slots.lock().unwrap();
            s.detached = true;
            s.active = false;
            s.can_send = false;
            s.outmsg = None;
        }
        if announce {
            self.shell.detached(&self.pipe);
        }
    }
}
