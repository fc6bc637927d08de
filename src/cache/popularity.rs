//! Popularity Counter
//!
//! Bounded key → access count map used to pick preload candidates. When the
//! map grows past its capacity it is compacted in place to the `retain` most
//! accessed keys, so its size never exceeds the capacity. Counts are a hint
//! only and never affect correctness.

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::debug;

/// Bounded access counter
#[derive(Debug)]
pub struct PopularityCounter {
    counts: Mutex<HashMap<String, u64>>,
    capacity: usize,
    retain: usize,
}

impl PopularityCounter {
    /// Create a counter holding at most `capacity` keys, compacted down to
    /// `retain` keys when full.
    pub fn new(capacity: usize, retain: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            counts: Mutex::new(HashMap::new()),
            capacity,
            retain: retain.min(capacity),
        }
    }

    /// Count one access of `key`
    pub fn record(&self, key: &str) {
        let mut counts = self.counts.lock();
        *counts.entry(key.to_string()).or_insert(0) += 1;

        if counts.len() > self.capacity {
            Self::compact(&mut counts, self.retain);
        }
    }

    /// Access count of `key`
    pub fn count(&self, key: &str) -> u64 {
        self.counts.lock().get(key).copied().unwrap_or(0)
    }

    /// Forget `key`
    pub fn remove(&self, key: &str) {
        self.counts.lock().remove(key);
    }

    /// Forget every key starting with `prefix`
    pub fn remove_prefix(&self, prefix: &str) {
        self.counts.lock().retain(|k, _| !k.starts_with(prefix));
    }

    /// Forget everything
    pub fn clear(&self) {
        self.counts.lock().clear();
    }

    /// Number of tracked keys
    pub fn len(&self) -> usize {
        self.counts.lock().len()
    }

    /// Check if nothing is tracked
    pub fn is_empty(&self) -> bool {
        self.counts.lock().is_empty()
    }

    /// The `n` most accessed keys, most popular first. Ties are ordered by
    /// key so the result is stable.
    pub fn top(&self, n: usize) -> Vec<(String, u64)> {
        let counts = self.counts.lock();
        let mut ranked: Vec<(String, u64)> =
            counts.iter().map(|(k, c)| (k.clone(), *c)).collect();
        drop(counts);

        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked.truncate(n);
        ranked
    }

    fn compact(counts: &mut HashMap<String, u64>, retain: usize) {
        let before = counts.len();
        let mut ranked: Vec<(String, u64)> = counts.drain().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1));
        ranked.truncate(retain);
        counts.extend(ranked);
        debug!("Compacted popularity counter from {} to {} keys", before, counts.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_top() {
        let counter = PopularityCounter::new(100, 50);
        for _ in 0..3 {
            counter.record("a");
        }
        counter.record("b");
        for _ in 0..2 {
            counter.record("c");
        }

        assert_eq!(counter.count("a"), 3);
        assert_eq!(counter.count("missing"), 0);
        assert_eq!(
            counter.top(2),
            vec![("a".to_string(), 3), ("c".to_string(), 2)]
        );
    }

    #[test]
    fn test_size_never_exceeds_capacity() {
        let counter = PopularityCounter::new(10, 5);

        // Make two keys clearly popular
        for _ in 0..20 {
            counter.record("hot-1");
            counter.record("hot-2");
        }
        for i in 0..100 {
            counter.record(&format!("cold-{}", i));
            assert!(counter.len() <= 10);
        }

        assert_eq!(counter.count("hot-1"), 20);
        assert_eq!(counter.count("hot-2"), 20);
    }

    #[test]
    fn test_remove_prefix() {
        let counter = PopularityCounter::new(100, 50);
        counter.record("image:a");
        counter.record("image:b");
        counter.record("video:a");

        counter.remove_prefix("image:");
        assert_eq!(counter.len(), 1);
        assert_eq!(counter.count("video:a"), 1);

        counter.remove("video:a");
        assert!(counter.is_empty());
    }
}
