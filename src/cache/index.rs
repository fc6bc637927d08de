//! Namespace Index
//!
//! Remembers which keys were written or served under each namespace so a
//! whole namespace can be invalidated without scanning the tiers. The index
//! is bounded: past `capacity` keys it is compacted to the `retain` most
//! recently touched keys. Keys dropped by compaction are no longer reachable
//! by namespace invalidation and stay in the tiers until they expire.

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::debug;

#[derive(Debug, Default)]
struct IndexState {
    /// namespace -> key -> last touch sequence number
    namespaces: HashMap<String, HashMap<String, u64>>,
    len: usize,
    next_seq: u64,
}

/// Bounded namespace -> keys index
#[derive(Debug)]
pub struct NamespaceIndex {
    state: Mutex<IndexState>,
    capacity: usize,
    retain: usize,
}

impl NamespaceIndex {
    pub fn new(capacity: usize, retain: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(IndexState::default()),
            capacity,
            retain: retain.min(capacity),
        }
    }

    /// Record `key` under `namespace`, refreshing it if already present
    pub fn insert(&self, namespace: &str, key: &str) {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        state.next_seq += 1;
        let seq = state.next_seq;
        let keys = state.namespaces.entry(namespace.to_string()).or_default();
        if keys.insert(key.to_string(), seq).is_none() {
            state.len += 1;
        }

        if state.len > self.capacity {
            Self::compact(state, self.retain);
        }
    }

    /// Forget `key`, returning whether it was indexed
    pub fn remove(&self, namespace: &str, key: &str) -> bool {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let Some(keys) = state.namespaces.get_mut(namespace) else {
            return false;
        };
        let removed = keys.remove(key).is_some();
        if keys.is_empty() {
            state.namespaces.remove(namespace);
        }
        if removed {
            state.len -= 1;
        }
        removed
    }

    /// Remove and return every key indexed under `namespace`
    pub fn take_namespace(&self, namespace: &str) -> Vec<String> {
        let mut state = self.state.lock();
        match state.namespaces.remove(namespace) {
            Some(keys) => {
                state.len -= keys.len();
                keys.into_keys().collect()
            }
            None => Vec::new(),
        }
    }

    /// Number of keys indexed under `namespace`
    pub fn namespace_len(&self, namespace: &str) -> usize {
        self.state
            .lock()
            .namespaces
            .get(namespace)
            .map_or(0, HashMap::len)
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.namespaces.clear();
        state.len = 0;
    }

    /// Total number of indexed keys
    pub fn len(&self) -> usize {
        self.state.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn compact(state: &mut IndexState, retain: usize) {
        let before = state.len;
        let mut seqs: Vec<u64> = state
            .namespaces
            .values()
            .flat_map(|keys| keys.values().copied())
            .collect();
        seqs.sort_unstable();
        let cutoff = seqs
            .len()
            .checked_sub(retain)
            .and_then(|skip| seqs.get(skip))
            .copied()
            .unwrap_or(u64::MAX);

        for keys in state.namespaces.values_mut() {
            keys.retain(|_, seq| *seq >= cutoff);
        }
        state.namespaces.retain(|_, keys| !keys.is_empty());
        state.len = state.namespaces.values().map(HashMap::len).sum();

        debug!("Compacted namespace index from {} to {} keys", before, state.len);
    }
}
