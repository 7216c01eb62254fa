use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::worker::{Worker, WorkerRef};

/// Library context: the fixed set of I/O workers shared by every socket the
/// application opens. Created and destroyed by the application; contexts
/// pick their worker here at creation, round-robin.
pub struct Pool {
    workers: Vec<Worker>,
    next: AtomicUsize,
}

impl Pool {
    pub fn new(count: usize) -> io::Result<Pool> {
        assert!(count > 0, "a pool needs at least one worker");

        let mut workers = Vec::with_capacity(count);
        for _ in 0..count {
            workers.push(Worker::new()?);
        }

        Ok(Pool {
            workers,
            next: AtomicUsize::new(0),
        })
    }

    pub fn choose_worker(&self) -> WorkerRef {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        self.workers[n % self.workers.len()].handle()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}
