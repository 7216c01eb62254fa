use std::io;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use concurrent_queue::ConcurrentQueue;
use log::{error, trace};

use crate::ctx::FsmRef;
use crate::fsm::EventKind;
use crate::poller::{Poller, WAKER_KEY};
use crate::sys;
use crate::timerset::TimerSet;
use crate::waker::Waker;

/// Work posted to an I/O thread from elsewhere. Posting is the only way a
/// non-worker thread touches worker-side state; everything a task names is
/// carried in the task itself.
pub enum Task {
    /// Deliver `TaskPosted` to the target on the worker thread.
    Post { target: FsmRef },
    /// Arm a timer; the target receives `Timeout` when it expires.
    AddTimer { after: Duration, target: FsmRef },
    /// Disarm the target's timer. Always acknowledged with `TimerStopped`,
    /// whether or not the deadline had already fired.
    RmTimer { target: FsmRef },
    /// Ask the thread to exit. Posting it more than once is benign.
    Stop,
}

struct Shared {
    poller: Poller,
    tasks: ConcurrentQueue<Task>,
    waker: Waker,
}

/// Cloneable handle to a worker, held by contexts and their machines.
#[derive(Clone)]
pub struct WorkerRef {
    shared: Arc<Shared>,
}

impl WorkerRef {
    pub fn post(&self, task: Task) {
        let _ = self.shared.tasks.push(task);
        let _ = self.shared.waker.wake();
    }

    pub(crate) fn poller(&self) -> &Poller {
        &self.shared.poller
    }
}

/// A dedicated I/O thread owning one poller, one timer set and one inbound
/// task queue. It dispatches readiness, expiry and posted tasks into the
/// owning machines' contexts; it keeps no state of its own for them.
pub struct Worker {
    shared: Arc<Shared>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Worker {
    pub fn new() -> io::Result<Worker> {
        let waker = Waker::new()?;
        let poller = Poller::new()?;
        poller.add_waker(&waker)?;

        let shared = Arc::new(Shared {
            poller,
            tasks: ConcurrentQueue::unbounded(),
            waker,
        });

        let routine = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name("spio-worker".into())
            .spawn(move || Worker::routine(routine))?;

        Ok(Worker {
            shared,
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> WorkerRef {
        WorkerRef {
            shared: Arc::clone(&self.shared),
        }
    }

    fn routine(shared: Arc<Shared>) {
        let mut events = sys::Events::with_capacity(256);
        let mut timers = TimerSet::new();

        loop {
            let timeout = timers
                .earliest()
                .map(|d| d.saturating_duration_since(Instant::now()));

            if let Err(e) = shared.poller.wait(&mut events, timeout) {
                error!("poller wait failed: {}", e);
                return;
            }

            // Expired timers first, in deadline order.
            let now = Instant::now();
            while let Some(target) = timers.pop_expired(now) {
                trace!("timer fired for {:?}", target);
                target.feed(EventKind::Timeout);
            }

            for i in 0..events.len() {
                let ev = match events.get(i) {
                    Some(ev) => ev,
                    None => break,
                };

                if ev.key == WAKER_KEY {
                    let _ = shared.waker.drain();
                    loop {
                        match shared.tasks.pop() {
                            Ok(Task::Post { target }) => target.feed(EventKind::TaskPosted),
                            Ok(Task::AddTimer { after, target }) => {
                                let key = target.timer_key();
                                timers.add(key, Instant::now() + after, target);
                            }
                            Ok(Task::RmTimer { target }) => {
                                timers.rm(target.timer_key());
                                target.feed(EventKind::TimerStopped);
                            }
                            Ok(Task::Stop) => return,
                            Err(_) => break,
                        }
                    }
                    continue;
                }

                // A true I/O event. The entry may have been removed since
                // the kernel queued it; interest bits filter out readiness
                // the owner no longer wants.
                let (target, interest) = match shared.poller.lookup(ev.key) {
                    Some(found) => found,
                    None => {
                        trace!("readiness for removed poll key {}", ev.key);
                        continue;
                    }
                };

                let mut delivered = false;
                if ev.ready.is_readable() && interest.is_readable() {
                    target.feed(EventKind::In);
                    delivered = true;
                }
                if ev.ready.is_writable() && interest.is_writable() {
                    target.feed(EventKind::Out);
                    delivered = true;
                }
                if !delivered && (ev.ready.is_error() || ev.ready.is_hup()) {
                    target.feed(EventKind::Err);
                }
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.handle().post(Task::Stop);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
