// SPDX-License-Identifier: GPL-2.0-only
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::hash::Hash;
use std::time::Duration;
use tokio::time::Instant;

/// Exponential backoff: `base`, `2 * base`, `4 * base`, ... capped at `cap`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub cap: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff {
            base: Duration::from_millis(200),
            cap: Duration::from_secs(60),
        }
    }
}

impl Backoff {
    /// Delay before retry number `attempts` (1-based). Zero attempts, zero delay.
    pub fn delay(&self, attempts: u32) -> Duration {
        if attempts == 0 {
            return Duration::ZERO;
        }
        let shift = (attempts - 1).min(31);
        self.base
            .checked_mul(1u32 << shift)
            .map_or(self.cap, |d| d.min(self.cap))
    }
}

/// Time-ordered set of keys with per-key attempt counters.
///
/// A key is held at most once: scheduling an already-scheduled key keeps
/// the earlier due time. Superseded heap entries are skipped lazily.
pub struct RetryScheduler<K> {
    heap: BinaryHeap<Reverse<(Instant, K)>>,
    due: HashMap<K, Instant>,
    attempts: HashMap<K, u32>,
    backoff: Backoff,
}

impl<K: Ord + Hash + Clone> RetryScheduler<K> {
    pub fn new(backoff: Backoff) -> Self {
        RetryScheduler {
            heap: BinaryHeap::new(),
            due: HashMap::new(),
            attempts: HashMap::new(),
            backoff,
        }
    }

    pub fn schedule(&mut self, key: K, at: Instant) {
        if let Some(existing) = self.due.get(&key) {
            if *existing <= at {
                return;
            }
        }
        self.due.insert(key.clone(), at);
        self.heap.push(Reverse((at, key)));
    }

    pub fn schedule_after(&mut self, key: K, now: Instant, delay: Duration) {
        self.schedule(key, now + delay);
    }

    /// Remove and return the earliest key due at or before `now`.
    pub fn pop_due(&mut self, now: Instant) -> Option<K> {
        loop {
            let Reverse((at, _)) = self.heap.peek()?;
            if *at > now {
                return None;
            }
            let Reverse((at, key)) = self.heap.pop()?;
            if self.due.get(&key) == Some(&at) {
                self.due.remove(&key);
                return Some(key);
            }
        }
    }

    /// When the earliest live key comes due.
    pub fn next_due(&mut self) -> Option<Instant> {
        while let Some(Reverse((at, key))) = self.heap.peek() {
            if self.due.get(key) == Some(at) {
                return Some(*at);
            }
            self.heap.pop();
        }
        None
    }

    /// Count a failure and reschedule the key after its backoff.
    /// Returns the delay chosen.
    pub fn record_failure(&mut self, key: K, now: Instant) -> Duration {
        let attempts = self.attempts.entry(key.clone()).or_insert(0);
        *attempts = attempts.saturating_add(1);
        let delay = self.backoff.delay(*attempts);
        self.schedule_after(key, now, delay);
        delay
    }

    pub fn record_success(&mut self, key: &K) {
        self.attempts.remove(key);
    }

    pub fn attempts(&self, key: &K) -> u32 {
        self.attempts.get(key).copied().unwrap_or(0)
    }

    /// Number of scheduled keys.
    pub fn len(&self) -> usize {
        self.due.len()
    }

    pub fn is_empty(&self) -> bool {
        self.due.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let b = Backoff::default();
        assert_eq!(b.delay(0), Duration::ZERO);
        assert_eq!(b.delay(1), Duration::from_millis(200));
        assert_eq!(b.delay(2), Duration::from_millis(400));
        assert_eq!(b.delay(3), Duration::from_millis(800));
        assert_eq!(b.delay(9), Duration::from_secs(51) + Duration::from_millis(200));
        assert_eq!(b.delay(10), Duration::from_secs(60));
        assert_eq!(b.delay(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn keys_come_out_in_due_order() {
        let now = Instant::now();
        let mut s = RetryScheduler::new(Backoff::default());
        s.schedule_after("c", now, Duration::from_secs(3));
        s.schedule_after("a", now, Duration::from_secs(1));
        s.schedule_after("b", now, Duration::from_secs(2));

        assert_eq!(s.pop_due(now), None);
        let later = now + Duration::from_secs(5);
        assert_eq!(s.pop_due(later), Some("a"));
        assert_eq!(s.pop_due(later), Some("b"));
        assert_eq!(s.pop_due(later), Some("c"));
        assert_eq!(s.pop_due(later), None);
        assert!(s.is_empty());
    }

    #[test]
    fn earliest_due_time_wins() {
        let now = Instant::now();
        let mut s = RetryScheduler::new(Backoff::default());
        s.schedule_after("a", now, Duration::from_secs(10));
        s.schedule("a", now);
        s.schedule_after("a", now, Duration::from_secs(20));

        assert_eq!(s.len(), 1);
        assert_eq!(s.next_due(), Some(now));
        assert_eq!(s.pop_due(now), Some("a"));
        // The stale 10s entry must not resurface
        assert_eq!(s.next_due(), None);
        assert_eq!(s.pop_due(now + Duration::from_secs(30)), None);
    }

    #[test]
    fn failures_back_off_and_success_resets() {
        let now = Instant::now();
        let mut s = RetryScheduler::new(Backoff::default());

        assert_eq!(s.record_failure(7, now), Duration::from_millis(200));
        assert_eq!(s.pop_due(now + Duration::from_millis(200)), Some(7));
        assert_eq!(s.record_failure(7, now), Duration::from_millis(400));
        assert_eq!(s.attempts(&7), 2);

        s.record_success(&7);
        assert_eq!(s.attempts(&7), 0);
        assert_eq!(s.record_failure(7, now), Duration::from_millis(200));
    }
}
