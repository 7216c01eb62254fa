//! Asynchronous I/O and protocol-engine core for brokerless
//! scalability-protocols messaging (the PUSH/PULL, REQ/REP, PUB/SUB
//! family).
//!
//! The crate provides the event-driven runtime underneath a messaging
//! socket: worker threads around an epoll poller, a hierarchical
//! state-machine framework serialized per socket, a non-blocking socket
//! machine, the per-connection session that negotiates the 8-byte protocol
//! header and frames length-prefixed messages, and the bind/connect
//! endpoints that manage session fleets. Protocol shells plug in through
//! [`PipeEvents`] and consume messages through [`Pipe`].
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use spio::{Addr, Ctx, EndpointConfig, Pool};
//!
//! # struct Shell;
//! # impl spio::PipeEvents for Shell {
//! #     fn is_peer(&self, _p: u16) -> bool { true }
//! #     fn activated(&self, _pipe: &spio::Pipe) {}
//! #     fn received(&self, _pipe: &spio::Pipe) {}
//! #     fn sent(&self, _pipe: &spio::Pipe) {}
//! #     fn detached(&self, _pipe: &spio::Pipe) {}
//! # }
//! # struct Base;
//! # impl spio::EndpointBase for Base { fn stopped(&self) {} }
//! let pool = Pool::new(1).unwrap();
//! let ctx = Ctx::new(&pool);
//!
//! let cfg = EndpointConfig::new(Addr::Tcp("127.0.0.1:5555".parse().unwrap()), 81);
//! let endpoint = spio::bind(&ctx, cfg, Arc::new(Shell), Arc::new(Base)).unwrap();
//!
//! // ... exchange messages through the pipes handed to the shell ...
//! endpoint.stop();
//! ```

mod sys;

mod addr;
mod ctx;
mod endpoint;
mod error;
mod fsm;
mod message;
mod pipe;
mod poller;
mod pool;
mod ready;
mod stream;
mod timer;
mod timerset;
mod usock;
mod waker;
mod worker;

pub use addr::{Addr, SockAddr};
pub use ctx::{Ctx, FsmRef, Reactor};
pub use endpoint::{bind, connect, EndpointBase, EndpointConfig, EndpointHandle};
pub use error::Error;
pub use fsm::{Event, EventKind, Fsm, Status, Token};
pub use message::Message;
pub use pipe::{Pipe, PipeEvents};
pub use pool::Pool;
pub use ready::Ready;
pub use timer::{Timer, TimerEvent};
pub use usock::{Usock, UsockEvent};
pub use worker::{Task, Worker, WorkerRef};
