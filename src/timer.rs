use std::time::Duration;

use crate::ctx::Reactor;
use crate::fsm::{Event, EventKind, Token};
use crate::worker::{Task, WorkerRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Active,
    Stopping,
}

/// What a timer reports to the machine that owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    Timeout,
    Stopped,
}

/// One cancellable timer over the worker's timer set.
///
/// Arming and disarming are posted to the worker so the set is only touched
/// on its own thread. `stop` is always acknowledged: the worker posts
/// `TimerStopped` whether or not the deadline already fired, and a timeout
/// that raced the stop is swallowed here.
pub struct Timer {
    worker: WorkerRef,
    tok: Token,
    state: State,
}

impl Timer {
    pub fn new(r: &mut Reactor<'_>) -> Timer {
        Timer {
            worker: r.worker(),
            tok: r.token(),
            state: State::Idle,
        }
    }

    pub fn token(&self) -> Token {
        self.tok
    }

    pub fn owns(&self, tok: Token) -> bool {
        self.tok == tok
    }

    pub fn is_idle(&self) -> bool {
        self.state == State::Idle
    }

    pub fn start(&mut self, r: &mut Reactor<'_>, after: Duration) {
        assert_eq!(self.state, State::Idle, "timer restarted while armed");

        self.worker.post(Task::AddTimer {
            after,
            target: r.fsm_ref(self.tok),
        });
        self.state = State::Active;
    }

    /// Begin disarming. Returns `true` when an asynchronous
    /// `TimerEvent::Stopped` will follow; `false` means the timer was idle
    /// and there is nothing to wait for.
    pub fn stop(&mut self, r: &mut Reactor<'_>) -> bool {
        match self.state {
            State::Idle => false,
            State::Active => {
                self.worker.post(Task::RmTimer {
                    target: r.fsm_ref(self.tok),
                });
                self.state = State::Stopping;
                true
            }
            State::Stopping => true,
        }
    }

    pub fn handle_ev(&mut self, ev: Event) -> Option<TimerEvent> {
        debug_assert_eq!(ev.source, self.tok);

        match (self.state, ev.kind) {
            (State::Active, EventKind::Timeout) => {
                self.state = State::Idle;
                Some(TimerEvent::Timeout)
            }
            // The deadline fired while the stop request was in flight; the
            // ack is still coming.
            (State::Stopping, EventKind::Timeout) => None,
            (State::Stopping, EventKind::TimerStopped) => {
                self.state = State::Idle;
                Some(TimerEvent::Stopped)
            }
            _ => unreachable!("timer got {:?} in {:?}", ev.kind, self.state),
        }
    }

    /// Give the token back once the owner is done with the timer.
    pub fn release(&mut self, r: &mut Reactor<'_>) {
        r.release(self.tok);
    }
}
