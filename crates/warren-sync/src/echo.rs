//! Suppression of visual spawns for echoed local edits.
//!
//! A local edit is shown immediately. When the server relays the same add
//! back, its spawn effect would play a second time; recording the edit's key
//! here lets the echo be recognised and the spawn skipped. The pending set is
//! bounded and evicts oldest-first, so a burst larger than the capacity can
//! at worst cause a duplicate spawn, never a missing one.

use std::collections::VecDeque;

use warren_net::Domain;

/// Default maximum number of pending keys.
pub const DEFAULT_CAPACITY: usize = 1_024;

/// Identity of one add op: domain, cell, and value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EchoKey {
    /// Domain of the op.
    pub domain: Domain,
    /// Grid X.
    pub gx: i32,
    /// Grid Y.
    pub gy: i32,
    /// Height, for domains keyed by height.
    pub y: Option<i32>,
    /// Value as text (voxel type, tile id, destination, item kind/payload).
    pub value: String,
}

impl EchoKey {
    /// Construct a key.
    pub fn new(domain: Domain, gx: i32, gy: i32, y: Option<i32>, value: String) -> Self {
        Self {
            domain,
            gx,
            gy,
            y,
            value,
        }
    }
}

/// Bounded FIFO of pending suppression keys.
#[derive(Debug, Clone)]
pub struct LocalEchoSuppressor {
    pending: VecDeque<EchoKey>,
    capacity: usize,
    evicted: u64,
}

impl Default for LocalEchoSuppressor {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl LocalEchoSuppressor {
    /// Create a suppressor holding at most `capacity` keys (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            pending: VecDeque::with_capacity(capacity),
            capacity,
            evicted: 0,
        }
    }

    /// Remember a local add. Evicts the oldest key when full.
    pub fn record(&mut self, key: EchoKey) {
        if self.pending.len() == self.capacity {
            self.pending.pop_front();
            self.evicted += 1;
            tracing::debug!(capacity = self.capacity, "Suppression set full, evicted oldest");
        }
        self.pending.push_back(key);
    }

    /// Consume a matching key. Returns `true` if the incoming add is an echo
    /// whose spawn should be skipped.
    pub fn consume(&mut self, key: &EchoKey) -> bool {
        match self.pending.iter().position(|k| k == key) {
            Some(index) => {
                self.pending.remove(index);
                true
            }
            None => false,
        }
    }

    /// Number of pending keys.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether no keys are pending.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Keys dropped to overflow since creation.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    /// Forget every pending key.
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(gx: i32, value: &str) -> EchoKey {
        EchoKey::new(Domain::Map, gx, 2, Some(0), value.to_string())
    }

    #[test]
    fn test_echo_consumed_once() {
        let mut sup = LocalEchoSuppressor::default();
        sup.record(key(2, "normal"));

        assert!(sup.consume(&key(2, "normal")));
        assert!(!sup.consume(&key(2, "normal")), "second echo spawns normally");
        assert!(sup.is_empty());
    }

    #[test]
    fn test_value_must_match() {
        let mut sup = LocalEchoSuppressor::default();
        sup.record(key(2, "normal"));
        assert!(!sup.consume(&key(2, "hazard")));
        assert_eq!(sup.len(), 1);
    }

    #[test]
    fn test_repeated_edits_need_repeated_echoes() {
        let mut sup = LocalEchoSuppressor::default();
        sup.record(key(1, "fence"));
        sup.record(key(1, "fence"));
        assert!(sup.consume(&key(1, "fence")));
        assert!(sup.consume(&key(1, "fence")));
        assert!(!sup.consume(&key(1, "fence")));
    }

    #[test]
    fn test_overflow_evicts_oldest_first() {
        let mut sup = LocalEchoSuppressor::new(3);
        for gx in 0..5 {
            sup.record(key(gx, "normal"));
        }
        assert_eq!(sup.len(), 3);
        assert_eq!(sup.evicted(), 2);
        assert!(!sup.consume(&key(0, "normal")), "oldest evicted");
        assert!(!sup.consume(&key(1, "normal")));
        assert!(sup.consume(&key(2, "normal")));
        assert!(sup.consume(&key(4, "normal")));
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let mut sup = LocalEchoSuppressor::new(0);
        sup.record(key(0, "slab"));
        assert_eq!(sup.len(), 1);
    }
}
