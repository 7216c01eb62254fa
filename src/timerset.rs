use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Instant;

use indexmap::IndexMap;

use crate::ctx::FsmRef;

/// `(context serial, token)`: identifies one timer across the worker.
pub type TimerKey = (u64, usize);

#[derive(Debug, Eq, PartialEq)]
struct Entry {
    deadline: Instant,
    key: TimerKey,
}

// Reversed so the BinaryHeap pops the earliest deadline first.
impl Ord for Entry {
    fn cmp(&self, other: &Entry) -> Ordering {
        match self.deadline.cmp(&other.deadline) {
            Ordering::Equal => Ordering::Equal,
            Ordering::Greater => Ordering::Less,
            Ordering::Less => Ordering::Greater,
        }
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Entry) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Min-heap of armed timers, keyed on absolute monotonic deadline.
///
/// Removal is lazy: cancelled or restarted entries stay in the heap and are
/// skipped when they surface; `live` is the authoritative set.
pub struct TimerSet {
    heap: BinaryHeap<Entry>,
    live: IndexMap<TimerKey, (Instant, FsmRef)>,
}

impl TimerSet {
    pub fn new() -> TimerSet {
        TimerSet {
            heap: BinaryHeap::new(),
            live: IndexMap::new(),
        }
    }

    /// Arm `key` for `deadline`. Re-adding an armed key restarts it.
    pub fn add(&mut self, key: TimerKey, deadline: Instant, target: FsmRef) {
        self.live.insert(key, (deadline, target));
        self.heap.push(Entry { deadline, key });
    }

    /// Disarm `key`. Returns whether it was armed.
    pub fn rm(&mut self, key: TimerKey) -> bool {
        self.live.swap_remove(&key).is_some()
    }

    /// Earliest live deadline, used to bound the poller wait.
    pub fn earliest(&mut self) -> Option<Instant> {
        self.prune();
        self.heap.peek().map(|e| e.deadline)
    }

    /// Pop one expired timer, disarming it. `None` once nothing is due.
    pub fn pop_expired(&mut self, now: Instant) -> Option<FsmRef> {
        self.prune();

        match self.heap.peek() {
            Some(e) if e.deadline <= now => {}
            _ => return None,
        }

        let entry = self.heap.pop().unwrap();
        let (_, target) = self.live.swap_remove(&entry.key).unwrap();
        Some(target)
    }

    fn prune(&mut self) {
        while let Some(top) = self.heap.peek() {
            match self.live.get(&top.key) {
                Some((deadline, _)) if *deadline == top.deadline => break,
                _ => {
                    self.heap.pop();
                }
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }
}
