use crate::ctx::Reactor;

/// Identity of one event source within a context: a child state machine, a
/// file descriptor, a posted task or a timer. Allocated by the context
/// (never reused for its lifetime) and compared by the owning handler to
/// route an event to the right child.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Token(pub usize);

/// Kinds of events travelling on a context's bus.
///
/// `Start`/`Stop` drive the lifecycle of a root machine, `TaskPosted` is the
/// arrival of a cross-thread post on the worker thread, `In`/`Out`/`Err` are
/// file-descriptor readiness, `Timeout`/`TimerStopped` come from the worker
/// timer set, and `Send`/`Recv` are raised by the pipe surface when a
/// protocol shell stages or consumes a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Start,
    Stop,
    TaskPosted,
    In,
    Out,
    Err,
    Timeout,
    TimerStopped,
    Send,
    Recv,
}

/// One event in flight: which child or input emitted it, and what happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub source: Token,
    pub kind: EventKind,
}

/// Outcome of a handler invocation. `Done` tells the context the machine has
/// reached its terminal state and its slot can be reclaimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Alive,
    Done,
}

/// A root state machine registered with a context.
///
/// Handlers run to completion with the context entered; they must not block.
/// Anything that would wait is split into a worker post and a completion
/// event that re-enters the machine.
pub trait Fsm: Send {
    fn handle(&mut self, r: &mut Reactor<'_>, ev: Event) -> Status;
}
