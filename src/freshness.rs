//! Freshness wrapper: a bounded FIFO that paces input batches.
//!
//! The queue sits in front of [`step`](crate::sql::Program::step) and bounds
//! how far a slow consumer can fall behind: when full, the oldest items are
//! dropped to make room for the newest; items older than the configured
//! maximum age are dropped before they can be dequeued.  Drops are reported
//! through an optional callback and counted in [`FreshnessStats`].
//!
//! All time-sensitive operations have `*_at` variants taking an explicit
//! [`Instant`] so tests control the clock; the plain methods use
//! `Instant::now()`.

use serde::{Deserialize, Serialize};
use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

/// Why items were dropped.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// The queue was full; the oldest items made room for the newest.
    Overflow,
    /// The items exceeded the configured maximum age.
    Stale,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreshnessConfig {
    /// Maximum number of queued items.
    pub capacity: usize,
    /// Items older than this are dropped before dequeue.
    pub max_age: Duration,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreshnessStats {
    pub enqueued: u64,
    pub dequeued: u64,
    pub dropped_overflow: u64,
    pub dropped_stale: u64,
}

type DropCallback = Box<dyn FnMut(usize, DropReason)>;

/// Bounded FIFO with drop-oldest and drop-stale policies.
pub struct FreshnessQueue<T> {
    config: FreshnessConfig,
    queue: VecDeque<(Instant, T)>,
    stats: FreshnessStats,
    on_drop: Option<DropCallback>,
}

impl<T> FreshnessQueue<T> {
    pub fn new(config: FreshnessConfig) -> Self {
        Self {
            config,
            queue: VecDeque::with_capacity(config.capacity),
            stats: FreshnessStats::default(),
            on_drop: None,
        }
    }

    /// Register a callback invoked once per drop event with the number of
    /// items dropped and the reason.
    pub fn on_drop<F>(mut self, callback: F) -> Self
    where
        F: FnMut(usize, DropReason) + 'static,
    {
        self.on_drop = Some(Box::new(callback));
        self
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn stats(&self) -> FreshnessStats {
        self.stats
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    pub fn enqueue(&mut self, item: T) {
        self.enqueue_at(item, Instant::now());
    }

    pub fn enqueue_at(&mut self, item: T, now: Instant) {
        if self.config.capacity == 0 {
            self.report(1, DropReason::Overflow);
            return;
        }
        if self.queue.len() == self.config.capacity {
            self.queue.pop_front();
            self.report(1, DropReason::Overflow);
        }
        self.queue.push_back((now, item));
        self.stats.enqueued += 1;
    }

    /// Dequeue up to `max_n` items, oldest first, after discarding stale
    /// ones.  Returns nothing while fewer than `min_n` items are queued,
    /// which lets callers batch.
    pub fn dequeue(&mut self, max_n: usize, min_n: usize) -> Vec<T> {
        self.dequeue_at(max_n, min_n, Instant::now())
    }

    pub fn dequeue_at(&mut self, max_n: usize, min_n: usize, now: Instant) -> Vec<T> {
        self.drop_stale_at(None, now);
        if self.queue.len() < min_n {
            return Vec::new();
        }
        let take = max_n.min(self.queue.len());
        let mut items = Vec::with_capacity(take);
        for _ in 0..take {
            let (_, item) = self.queue.pop_front().expect("len checked");
            items.push(item);
        }
        self.stats.dequeued += items.len() as u64;
        items
    }

    /// Drop items older than `max_age` (the configured age when `None`).
    /// Returns the number dropped.
    pub fn drop_stale(&mut self, max_age: Option<Duration>) -> usize {
        self.drop_stale_at(max_age, Instant::now())
    }

    pub fn drop_stale_at(&mut self, max_age: Option<Duration>, now: Instant) -> usize {
        let max_age = max_age.unwrap_or(self.config.max_age);
        let mut dropped = 0;
        while let Some((enqueued_at, _)) = self.queue.front() {
            if now.duration_since(*enqueued_at) > max_age {
                self.queue.pop_front();
                dropped += 1;
            } else {
                // The queue is in arrival order, so the first fresh item
                // ends the scan.
                break;
            }
        }
        if dropped > 0 {
            self.report(dropped, DropReason::Stale);
        }
        dropped
    }

    fn report(&mut self, count: usize, reason: DropReason) {
        match reason {
            DropReason::Overflow => self.stats.dropped_overflow += count as u64,
            DropReason::Stale => self.stats.dropped_stale += count as u64,
        }
        tracing::warn!(count, ?reason, "freshness queue dropped items");
        if let Some(callback) = &mut self.on_drop {
            callback(count, reason);
        }
    }
}

#[cfg(test)]
mod test {
    use super::{DropReason, FreshnessConfig, FreshnessQueue};
    use std::{
        cell::RefCell,
        rc::Rc,
        time::{Duration, Instant},
    };

    fn config(capacity: usize, max_age_ms: u64) -> FreshnessConfig {
        FreshnessConfig {
            capacity,
            max_age: Duration::from_millis(max_age_ms),
        }
    }

    // Capacity 5, enqueue 10: exactly the 5 oldest drop with reason
    // overflow and the 5 newest dequeue in order.
    #[test]
    fn overflow_drops_oldest() {
        let drops = Rc::new(RefCell::new(Vec::new()));
        let drops_clone = drops.clone();
        let mut queue = FreshnessQueue::new(config(5, 1_000))
            .on_drop(move |count, reason| drops_clone.borrow_mut().push((count, reason)));

        let start = Instant::now();
        for n in 0..10 {
            queue.enqueue_at(n, start);
        }

        assert_eq!(queue.dequeue_at(10, 0, start), vec![5, 6, 7, 8, 9]);
        assert_eq!(queue.stats().dropped_overflow, 5);
        assert_eq!(drops.borrow().len(), 5);
        assert!(drops
            .borrow()
            .iter()
            .all(|&(count, reason)| count == 1 && reason == DropReason::Overflow));
    }

    #[test]
    fn stale_items_drop_before_dequeue() {
        let mut queue = FreshnessQueue::new(config(10, 100));
        let start = Instant::now();
        queue.enqueue_at("old", start);
        queue.enqueue_at("fresh", start + Duration::from_millis(150));

        let later = start + Duration::from_millis(200);
        assert_eq!(queue.dequeue_at(10, 0, later), vec!["fresh"]);
        assert_eq!(queue.stats().dropped_stale, 1);
    }

    #[test]
    fn min_n_batches() {
        let mut queue = FreshnessQueue::new(config(10, 1_000));
        let start = Instant::now();
        queue.enqueue_at(1, start);
        assert!(queue.dequeue_at(10, 2, start).is_empty());
        queue.enqueue_at(2, start);
        assert_eq!(queue.dequeue_at(10, 2, start), vec![1, 2]);
        assert_eq!(queue.stats().dequeued, 2);
    }

    #[test]
    fn explicit_drop_stale_and_clear() {
        let mut queue = FreshnessQueue::new(config(10, 100));
        let start = Instant::now();
        for n in 0..3 {
            queue.enqueue_at(n, start);
        }
        assert_eq!(
            queue.drop_stale_at(Some(Duration::from_millis(0)), start + Duration::from_millis(1)),
            3
        );
        queue.enqueue_at(9, start);
        queue.clear();
        assert!(queue.is_empty());
    }
}
