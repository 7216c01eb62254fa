use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use concurrent_queue::ConcurrentQueue;
use indexmap::IndexMap;
use log::trace;
use slab::Slab;

use crate::fsm::{Event, EventKind, Fsm, Status, Token};
use crate::pool::Pool;
use crate::worker::WorkerRef;

static NEXT_CTX: AtomicU64 = AtomicU64::new(1);
static NEXT_THREAD: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_SEQ: u64 = NEXT_THREAD.fetch_add(1, Ordering::Relaxed);
}

fn thread_seq() -> u64 {
    THREAD_SEQ.with(|s| *s)
}

pub(crate) struct CtxState {
    roots: Slab<Option<Box<dyn Fsm>>>,
    routes: IndexMap<usize, usize>,
    queue: VecDeque<Event>,
    next_token: usize,
}

/// Shared core of a serialization domain. Everything rooted at one
/// user-facing socket lives in a single `CtxShared`; its mutex is the
/// arbitration point for all handler code.
pub(crate) struct CtxShared {
    seq: u64,
    /// Thread marker of the dispatcher currently inside the lock, 0 if none.
    /// Lets `feed` detect re-entry from an upcall on the dispatching thread
    /// and defer instead of deadlocking.
    owner: AtomicU64,
    sync: Mutex<CtxState>,
    /// Side channel for events fed while this same thread is dispatching.
    pending: ConcurrentQueue<Event>,
    worker: WorkerRef,
}

/// A per-socket serialization domain: one lock, one deferred-event queue,
/// one worker chosen from the pool for all descendant machines.
#[derive(Clone)]
pub struct Ctx {
    shared: Arc<CtxShared>,
}

impl Ctx {
    pub fn new(pool: &Pool) -> Ctx {
        Ctx {
            shared: Arc::new(CtxShared {
                seq: NEXT_CTX.fetch_add(1, Ordering::Relaxed),
                owner: AtomicU64::new(0),
                sync: Mutex::new(CtxState {
                    roots: Slab::new(),
                    routes: IndexMap::new(),
                    queue: VecDeque::new(),
                    next_token: 1,
                }),
                pending: ConcurrentQueue::unbounded(),
                worker: pool.choose_worker(),
            }),
        }
    }

    pub fn seq(&self) -> u64 {
        self.shared.seq
    }

    /// Install a new root machine and feed it `Start`. The builder runs with
    /// the context entered and receives the root's control token; errors it
    /// returns surface synchronously to the caller.
    pub fn spawn<F, B>(&self, build: B) -> io::Result<Token>
    where
        F: Fsm + 'static,
        B: FnOnce(&mut Reactor<'_>, Token) -> io::Result<F>,
    {
        let shared = &self.shared;
        let me = thread_seq();
        assert_ne!(
            shared.owner.load(Ordering::Acquire),
            me,
            "spawn from inside a handler"
        );

        let mut st = shared.sync.lock().unwrap();
        shared.owner.store(me, Ordering::Release);

        let slot = st.roots.insert(None);
        let ctl = Token(st.next_token);
        st.next_token += 1;
        st.routes.insert(ctl.0, slot);

        let built = {
            let mut r = Reactor {
                shared,
                st: &mut *st,
                slot,
            };
            build(&mut r, ctl)
        };

        let res = match built {
            Ok(fsm) => {
                st.roots[slot] = Some(Box::new(fsm));
                st.queue.push_back(Event {
                    source: ctl,
                    kind: EventKind::Start,
                });
                Self::dispatch(shared, &mut *st);
                Ok(ctl)
            }
            Err(e) => {
                st.roots.remove(slot);
                st.routes.retain(|_, s| *s != slot);
                Err(e)
            }
        };

        shared.owner.store(0, Ordering::Release);
        res
    }

    /// External entry point: deliver an event into the domain. Locks the
    /// context if this thread has not already entered it and runs the
    /// dispatch loop if it is the outer call; otherwise the event is
    /// deferred and picked up before the running loop finishes.
    pub fn feed(&self, token: Token, kind: EventKind) {
        Self::feed_shared(
            &self.shared,
            Event {
                source: token,
                kind,
            },
        );
    }

    pub(crate) fn feed_shared(shared: &Arc<CtxShared>, ev: Event) {
        let me = thread_seq();
        if shared.owner.load(Ordering::Acquire) == me {
            let _ = shared.pending.push(ev);
            return;
        }

        let mut st = shared.sync.lock().unwrap();
        shared.owner.store(me, Ordering::Release);
        st.queue.push_back(ev);
        Self::dispatch(shared, &mut *st);
        shared.owner.store(0, Ordering::Release);
    }

    /// Run-to-completion loop: pop, route by token, invoke the destination
    /// handler with the lock held, repeat until both queues drain. Events
    /// for tokens that have been released (a machine torn down with I/O
    /// still in flight) are dropped.
    fn dispatch(shared: &Arc<CtxShared>, st: &mut CtxState) {
        loop {
            while let Ok(ev) = shared.pending.pop() {
                st.queue.push_back(ev);
            }

            let ev = match st.queue.pop_front() {
                Some(ev) => ev,
                None => break,
            };

            let slot = match st.routes.get(&ev.source.0) {
                Some(&slot) => slot,
                None => {
                    trace!("ctx {}: dropping stale event {:?}", shared.seq, ev);
                    continue;
                }
            };

            let mut fsm = st.roots[slot].take().expect("handler reentered");

            let status = {
                let mut r = Reactor {
                    shared,
                    st: &mut *st,
                    slot,
                };
                fsm.handle(&mut r, ev)
            };

            match status {
                Status::Alive => st.roots[slot] = Some(fsm),
                Status::Done => {
                    st.roots.remove(slot);
                    st.routes.retain(|_, s| *s != slot);
                }
            }
        }
    }
}

/// Handler-side capability: token allocation, deferred raises and
/// cross-thread addresses, all scoped to the root currently running.
pub struct Reactor<'a> {
    shared: &'a Arc<CtxShared>,
    st: &'a mut CtxState,
    slot: usize,
}

impl Reactor<'_> {
    /// Allocate a fresh token routed to the running root.
    pub fn token(&mut self) -> Token {
        let tok = Token(self.st.next_token);
        self.st.next_token += 1;
        self.st.routes.insert(tok.0, self.slot);
        tok
    }

    /// Stop routing `tok`. In-flight events for it will be dropped.
    pub fn release(&mut self, tok: Token) {
        self.st.routes.swap_remove(&tok.0);
    }

    /// Defer an event: it is dispatched after the current handler returns,
    /// in FIFO order with everything else already queued.
    pub fn raise(&mut self, source: Token, kind: EventKind) {
        self.st.queue.push_back(Event { source, kind });
    }

    /// Cross-thread address of `tok`, for registration with a worker.
    pub fn fsm_ref(&self, tok: Token) -> FsmRef {
        FsmRef {
            ctx: Arc::clone(self.shared),
            token: tok,
        }
    }

    /// The worker this context pinned at creation.
    pub fn worker(&self) -> WorkerRef {
        self.shared.worker.clone()
    }

    pub fn ctx_seq(&self) -> u64 {
        self.shared.seq
    }
}

/// Address of one event target: a context plus a token within it. Held by
/// workers (poller entries, timer entries, queued tasks) and by the pipe
/// surface; keeps the context alive until the last in-flight reference is
/// gone.
#[derive(Clone)]
pub struct FsmRef {
    ctx: Arc<CtxShared>,
    token: Token,
}

impl FsmRef {
    pub fn feed(&self, kind: EventKind) {
        Ctx::feed_shared(
            &self.ctx,
            Event {
                source: self.token,
                kind,
            },
        );
    }

    pub fn token(&self) -> Token {
        self.token
    }

    /// Key identifying this target across the worker's timer set.
    pub fn timer_key(&self) -> (u64, usize) {
        (self.ctx.seq, self.token.0)
    }
}

impl std::fmt::Debug for FsmRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FsmRef(ctx {}, token {})", self.ctx.seq, self.token.0)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::mpsc;

    struct Probe {
        ctl: Token,
        aux: Token,
        log: mpsc::Sender<(Token, EventKind)>,
        raise_on_start: bool,
    }

    impl Fsm for Probe {
        fn handle(&mut self, r: &mut Reactor<'_>, ev: Event) -> Status {
            self.log.send((ev.source, ev.kind)).unwrap();

            if ev.kind == EventKind::Start && self.raise_on_start {
                // Deferred: must arrive after this handler returns.
                r.raise(self.aux, EventKind::TaskPosted);
            }

            if ev.kind == EventKind::Stop {
                r.release(self.ctl);
                r.release(self.aux);
                return Status::Done;
            }

            Status::Alive
        }
    }

    fn pool() -> Pool {
        Pool::new(1).unwrap()
    }

    #[test]
    fn start_then_deferred_raise() {
        let pool = pool();
        let ctx = Ctx::new(&pool);
        let (tx, rx) = mpsc::channel();

        let ctl = ctx
            .spawn(|r, ctl| {
                Ok(Probe {
                    ctl,
                    aux: r.token(),
                    log: tx.clone(),
                    raise_on_start: true,
                })
            })
            .unwrap();

        let (_, kind) = rx.try_recv().unwrap();
        assert_eq!(kind, EventKind::Start);
        let (_, kind) = rx.try_recv().unwrap();
        assert_eq!(kind, EventKind::TaskPosted);

        ctx.feed(ctl, EventKind::Stop);
        let (src, kind) = rx.try_recv().unwrap();
        assert_eq!((src, kind), (ctl, EventKind::Stop));
    }

    #[test]
    fn events_after_done_are_dropped() {
        let pool = pool();
        let ctx = Ctx::new(&pool);
        let (tx, rx) = mpsc::channel();

        let ctl = ctx
            .spawn(|r, ctl| {
                Ok(Probe {
                    ctl,
                    aux: r.token(),
                    log: tx.clone(),
                    raise_on_start: false,
                })
            })
            .unwrap();

        ctx.feed(ctl, EventKind::Stop);
        ctx.feed(ctl, EventKind::TaskPosted);

        assert_eq!(rx.try_recv().unwrap().1, EventKind::Start);
        assert_eq!(rx.try_recv().unwrap().1, EventKind::Stop);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn spawn_error_rolls_back() {
        let pool = pool();
        let ctx = Ctx::new(&pool);

        let res = ctx.spawn(|r, _ctl| -> io::Result<Probe> {
            let _ = r.token();
            Err(io::Error::new(io::ErrorKind::Other, "nope"))
        });
        assert!(res.is_err());

        // The domain is still usable afterwards.
        let (tx, rx) = mpsc::channel();
        ctx.spawn(|r, ctl| {
            Ok(Probe {
                ctl,
                aux: r.token(),
                log: tx.clone(),
                raise_on_start: false,
            })
        })
        .unwrap();
        assert_eq!(rx.try_recv().unwrap().1, EventKind::Start);
    }
}
