//! Bounded deduplication of recently seen packets.
//!
//! Two packets sharing a dedup key are the same logical transmission
//! regardless of relay path; only the first is dispatched or relayed. The
//! cache is a fixed-capacity FIFO ring: at capacity the oldest key is
//! evicted, so memory stays bounded for the lifetime of the process.

use chatmesh_wire::DedupKey;
use std::collections::{HashSet, VecDeque};
use tracing::trace;

/// Records recently seen dedup keys with FIFO eviction
#[derive(Debug)]
pub struct DedupCache {
    seen: HashSet<DedupKey>,
    order: VecDeque<DedupKey>,
    capacity: usize,
}

impl DedupCache {
    /// Create a cache holding at most `capacity` keys
    pub fn new(capacity: usize) -> Self {
        Self {
            seen: HashSet::with_capacity(capacity.min(1024)),
            order: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
        }
    }

    /// Record a key. Returns `true` if it was fresh, `false` on a repeat.
    pub fn insert(&mut self, key: DedupKey) -> bool {
        if !self.seen.insert(key) {
            return false;
        }
        self.order.push_back(key);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
                trace!("dedup cache full, evicted oldest key");
            }
        }
        true
    }

    /// Number of keys currently held
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Drop all keys
    pub fn clear(&mut self) {
        self.seen.clear();
        self.order.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use chatmesh_wire::{MessageKind, Packet, PeerId};

    fn key_for(timestamp: u64) -> DedupKey {
        Packet::broadcast(
            MessageKind::Message,
            PeerId::from_bytes(&[1]),
            timestamp,
            Bytes::from_static(b"payload"),
        )
        .dedup_key()
    }

    #[test]
    fn test_repeat_key_is_rejected() {
        let mut cache = DedupCache::new(16);
        assert!(cache.insert(key_for(1)));
        assert!(!cache.insert(key_for(1)));
        assert!(cache.insert(key_for(2)));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let mut cache = DedupCache::new(3);
        for t in 0..5 {
            assert!(cache.insert(key_for(t)));
        }
        assert_eq!(cache.len(), 3);
        // Oldest keys were evicted and are fresh again
        assert!(cache.insert(key_for(0)));
        // Newest keys are still present
        assert!(!cache.insert(key_for(4)));
    }

    #[test]
    fn test_clear() {
        let mut cache = DedupCache::new(8);
        cache.insert(key_for(1));
        cache.clear();
        assert!(cache.is_empty());
        assert!(cache.insert(key_for(1)));
    }
}
