//! Deadline-ordered timer queue.
//!
//! Entries live in a binary heap whose comparator is inverted so the heap
//! yields the earliest deadline first. Cancellation is lazy: the entry stays
//! in the heap but loses its slot in `live`, and is skipped when it surfaces.
//! A cancel that leaves the heap mostly dead rebuilds it from `live`.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::time::Instant;

use super::types::TimerId;

/// Dead heap entries tolerated before a cancel rebuilds the heap.
const COMPACT_SLACK: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct HeapEntry {
    deadline: Instant,
    id: TimerId,
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so `BinaryHeap` (a max-heap) pops the smallest deadline.
        // Ids are allocated in insertion order, which breaks ties FIFO.
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Pending expirations ordered by absolute deadline.
#[derive(Debug)]
pub struct TimerWheel<H> {
    heap: BinaryHeap<HeapEntry>,
    live: HashMap<TimerId, H>,
    next_id: TimerId,
}

impl<H> Default for TimerWheel<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H> TimerWheel<H> {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            live: HashMap::new(),
            next_id: 1,
        }
    }

    pub fn schedule(&mut self, deadline: Instant, handler: H) -> TimerId {
        let id = self.next_id;
        self.next_id += 1;
        self.heap.push(HeapEntry { deadline, id });
        self.live.insert(id, handler);
        id
    }

    /// Returns false if the timer already fired, was popped for delivery, or
    /// was never scheduled.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        let cancelled = self.live.remove(&id).is_some();
        if self.live.is_empty() {
            self.heap.clear();
        } else if self.heap.len() > 2 * self.live.len() + COMPACT_SLACK {
            self.compact();
        }
        cancelled
    }

    pub fn next_deadline(&mut self) -> Option<Instant> {
        self.prune_cancelled();
        self.heap.peek().map(|entry| entry.deadline)
    }

    /// Remove and return every live timer with `deadline <= now`, in
    /// deadline order.
    pub fn pop_expired(&mut self, now: Instant) -> Vec<(TimerId, H)> {
        let mut fired = Vec::new();
        while let Some(top) = self.heap.peek() {
            if top.deadline > now {
                break;
            }
            let entry = *top;
            self.heap.pop();
            if let Some(handler) = self.live.remove(&entry.id) {
                fired.push((entry.id, handler));
            }
        }
        fired
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Entries in the heap, cancelled ones included.
    pub fn heap_len(&self) -> usize {
        self.heap.len()
    }

    fn compact(&mut self) {
        let live = &self.live;
        self.heap.retain(|entry| live.contains_key(&entry.id));
    }

    fn prune_cancelled(&mut self) {
        while let Some(top) = self.heap.peek() {
            if self.live.contains_key(&top.id) {
                break;
            }
            self.heap.pop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::seq::SliceRandom;
    use std::time::Duration;

    #[test]
    fn pops_in_deadline_order_regardless_of_insertion() {
        let base = Instant::now();
        let mut offsets: Vec<u64> = (0..200).map(|i| i * 7 % 113).collect();
        offsets.shuffle(&mut rand::thread_rng());

        let mut wheel = TimerWheel::new();
        for off in &offsets {
            wheel.schedule(base + Duration::from_millis(*off), *off);
        }

        let fired = wheel.pop_expired(base + Duration::from_secs(1));
        assert_eq!(fired.len(), offsets.len());
        let order: Vec<u64> = fired.into_iter().map(|(_, off)| off).collect();
        assert!(order.windows(2).all(|w| w[0] <= w[1]), "order: {order:?}");
        assert!(wheel.is_empty());
    }

    #[test]
    fn equal_deadlines_fire_in_insertion_order() {
        let at = Instant::now();
        let mut wheel = TimerWheel::new();
        for tag in ["a", "b", "c", "d"] {
            wheel.schedule(at, tag);
        }
        let tags: Vec<_> = wheel.pop_expired(at).into_iter().map(|(_, t)| t).collect();
        assert_eq!(tags, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn only_expired_entries_are_popped() {
        let base = Instant::now();
        let mut wheel = TimerWheel::new();
        wheel.schedule(base + Duration::from_millis(10), 1);
        wheel.schedule(base + Duration::from_millis(30), 3);
        wheel.schedule(base + Duration::from_millis(20), 2);

        let fired = wheel.pop_expired(base + Duration::from_millis(20));
        assert_eq!(fired.iter().map(|(_, v)| *v).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(
            wheel.next_deadline(),
            Some(base + Duration::from_millis(30))
        );
    }

    #[test]
    fn cancelled_timer_is_not_delivered() {
        let base = Instant::now();
        let mut wheel = TimerWheel::new();
        let early = wheel.schedule(base + Duration::from_millis(5), "early");
        wheel.schedule(base + Duration::from_millis(50), "late");

        assert!(wheel.cancel(early));
        assert_eq!(
            wheel.next_deadline(),
            Some(base + Duration::from_millis(50))
        );
        let fired = wheel.pop_expired(base + Duration::from_secs(1));
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].1, "late");
    }

    #[test]
    fn cancelled_entries_are_compacted_while_others_stay_live() {
        let base = Instant::now();
        let mut wheel = TimerWheel::new();
        // A long-lived timer keeps the wheel from ever draining.
        wheel.schedule(base + Duration::from_secs(60), 0u32);
        for i in 1..=1000u32 {
            let id = wheel.schedule(base + Duration::from_secs(30), i);
            assert!(wheel.cancel(id));
        }
        assert_eq!(wheel.len(), 1);
        assert!(wheel.heap_len() <= 2 + COMPACT_SLACK, "heap: {}", wheel.heap_len());

        let fired = wheel.pop_expired(base + Duration::from_secs(60));
        assert_eq!(fired.into_iter().map(|(_, v)| v).collect::<Vec<_>>(), vec![0]);
    }

    #[test]
    fn cancel_after_delivery_is_a_noop() {
        let at = Instant::now();
        let mut wheel = TimerWheel::new();
        let id = wheel.schedule(at, ());
        assert_eq!(wheel.pop_expired(at).len(), 1);
        assert!(!wheel.cancel(id));
        assert!(!wheel.cancel(id + 100));
        assert_eq!(wheel.next_deadline(), None);
    }
}
