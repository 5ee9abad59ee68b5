//! Delay queue of pending announces
//!
//! Each key has at most one pending deadline. Items come out in deadline
//! order, ties broken by insertion order.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::hash::Hash;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Debug)]
struct Slot<T> {
    due: Instant,
    seq: u64,
    key: T,
}

impl<T> PartialEq for Slot<T> {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl<T> Eq for Slot<T> {}

impl<T> PartialOrd for Slot<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// Reversed so the max-heap yields the earliest deadline first.
impl<T> Ord for Slot<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug)]
struct SchedulerState<T> {
    heap: BinaryHeap<Slot<T>>,
    live: HashMap<T, (Instant, u64)>,
    next_seq: u64,
}

impl<T: Clone + Eq + Hash> SchedulerState<T> {
    /// Drops heap entries that were replaced or removed.
    fn prune(&mut self) {
        while let Some(head) = self.heap.peek() {
            match self.live.get(&head.key) {
                Some((due, seq)) if *due == head.due && *seq == head.seq => break,
                _ => {
                    self.heap.pop();
                }
            }
        }
    }
}

/// Single-consumer announce timer.
///
/// Any task may insert or remove; one task awaits [`AnnounceScheduler::take`].
#[derive(Debug)]
pub struct AnnounceScheduler<T> {
    state: Mutex<SchedulerState<T>>,
    changed: Notify,
}

impl<T: Clone + Eq + Hash> Default for AnnounceScheduler<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Eq + Hash> AnnounceScheduler<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SchedulerState {
                heap: BinaryHeap::new(),
                live: HashMap::new(),
                next_seq: 0,
            }),
            changed: Notify::new(),
        }
    }

    /// Schedules `key` at `due`, replacing any pending deadline.
    pub fn insert(&self, key: T, due: Instant) {
        {
            let mut state = self.state.lock();
            let seq = state.next_seq;
            state.next_seq += 1;
            state.live.insert(key.clone(), (due, seq));
            state.heap.push(Slot { due, seq, key });
        }
        self.changed.notify_one();
    }

    /// Moves the deadline of a pending key. Returns false when absent.
    pub fn reschedule(&self, key: &T, due: Instant) -> bool {
        let updated = {
            let mut state = self.state.lock();
            let Some((_, seq)) = state.live.get(key).copied() else {
                return false;
            };
            state.live.insert(key.clone(), (due, seq));
            state.heap.push(Slot {
                due,
                seq,
                key: key.clone(),
            });
            true
        };
        self.changed.notify_one();
        updated
    }

    /// Cancels the pending deadline of `key`. Returns true when one existed.
    pub fn remove(&self, key: &T) -> bool {
        let mut state = self.state.lock();
        let removed = state.live.remove(key).is_some();
        state.prune();
        removed
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.heap.clear();
        state.live.clear();
    }

    pub fn contains(&self, key: &T) -> bool {
        self.state.lock().live.contains_key(key)
    }

    pub fn due_at(&self, key: &T) -> Option<Instant> {
        self.state.lock().live.get(key).map(|(due, _)| *due)
    }

    pub fn len(&self) -> usize {
        self.state.lock().live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().live.is_empty()
    }

    /// Removes and returns the earliest key whose deadline has passed.
    pub fn pop_due(&self, now: Instant) -> Option<T> {
        let mut state = self.state.lock();
        state.prune();
        if state.heap.peek().is_some_and(|head| head.due <= now) {
            let slot = state.heap.pop()?;
            state.live.remove(&slot.key);
            return Some(slot.key);
        }
        None
    }

    /// Waits for the next due key.
    ///
    /// Cancel safe: dropping the future never loses a key.
    pub async fn take(&self) -> T {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_due = {
                let mut state = self.state.lock();
                state.prune();
                state.heap.peek().map(|head| head.due)
            };

            if let Some(key) = self.pop_due(Instant::now()) {
                return key;
            }

            match next_due {
                Some(due) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(due) => {}
                        _ = &mut notified => {}
                    }
                }
                None => notified.await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_pop_due_orders_by_deadline_then_insertion() {
        let scheduler = AnnounceScheduler::new();
        let now = Instant::now();
        scheduler.insert("late", now + Duration::from_secs(10));
        scheduler.insert("first", now);
        scheduler.insert("second", now);

        assert_eq!(scheduler.pop_due(now), Some("first"));
        assert_eq!(scheduler.pop_due(now), Some("second"));
        assert_eq!(scheduler.pop_due(now), None);
        assert_eq!(scheduler.len(), 1);
    }

    #[test]
    fn test_insert_replaces_pending_deadline() {
        let scheduler = AnnounceScheduler::new();
        let now = Instant::now();
        scheduler.insert(1, now);
        scheduler.insert(1, now + Duration::from_secs(30));

        assert_eq!(scheduler.len(), 1);
        assert_eq!(scheduler.pop_due(now), None);
        assert_eq!(scheduler.pop_due(now + Duration::from_secs(30)), Some(1));
        assert!(scheduler.is_empty());
    }

    #[test]
    fn test_remove_and_reschedule() {
        let scheduler = AnnounceScheduler::new();
        let now = Instant::now();
        scheduler.insert(1, now);
        scheduler.insert(2, now);

        assert!(scheduler.remove(&1));
        assert!(!scheduler.remove(&1));
        assert!(!scheduler.reschedule(&1, now));

        assert!(scheduler.reschedule(&2, now + Duration::from_secs(5)));
        assert_eq!(scheduler.due_at(&2), Some(now + Duration::from_secs(5)));
        assert_eq!(scheduler.pop_due(now), None);

        scheduler.clear();
        assert!(!scheduler.contains(&2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_take_waits_for_deadline() {
        let scheduler = AnnounceScheduler::new();
        let start = Instant::now();
        scheduler.insert("a", start + Duration::from_secs(3));

        assert_eq!(scheduler.take().await, "a");
        assert!(Instant::now() >= start + Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_take_wakes_on_earlier_insert() {
        let scheduler = Arc::new(AnnounceScheduler::new());
        let start = Instant::now();
        scheduler.insert("slow", start + Duration::from_secs(60));

        let waiter = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.take().await })
        };
        tokio::task::yield_now().await;
        scheduler.insert("fast", start + Duration::from_secs(1));

        assert_eq!(waiter.await.unwrap(), "fast");
        assert!(Instant::now() < start + Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_insert_wakes_pending_take() {
        let scheduler = AnnounceScheduler::new();
        let mut take = tokio_test::task::spawn(scheduler.take());
        tokio_test::assert_pending!(take.poll());

        scheduler.insert("now", Instant::now());
        assert!(take.is_woken());
        tokio_test::assert_ready_eq!(take.poll(), "now");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_take_keeps_key() {
        let scheduler = AnnounceScheduler::new();
        let start = Instant::now();
        scheduler.insert(7, start + Duration::from_secs(10));

        let timed_out =
            tokio::time::timeout(Duration::from_secs(1), scheduler.take()).await;
        assert!(timed_out.is_err());
        assert!(scheduler.contains(&7));
        assert_eq!(scheduler.take().await, 7);
    }
}
