use crate::types::ClusterEvent;
use crate::utils::fingerprint;
use indexmap::IndexMap;
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Identity of one logical event occurrence.
///
/// The orchestrator re-emits the same event with only `count` and the
/// last-seen timestamp bumped, so neither takes part in the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DedupKey(u64);

impl DedupKey {
    pub fn of(event: &ClusterEvent) -> Self {
        DedupKey(fingerprint([
            event.namespace.as_str(),
            event.name.as_str(),
            event.uid.as_str(),
            event.involved_object.uid.as_str(),
            event.reason.as_str(),
            event.event_type.as_str(),
            event.message.as_str(),
        ]))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Process-local record of occurrences already delivered.
///
/// Bounded by `capacity` (least recently used evicted first) and by `ttl`
/// (entries older than that are forgotten on access).
pub struct DedupGuard {
    capacity: usize,
    ttl: Duration,
    // Ordered oldest-used first.
    entries: Mutex<IndexMap<DedupKey, Instant>>,
}

impl DedupGuard {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity,
            ttl,
            entries: Mutex::new(IndexMap::with_capacity(capacity.min(4096))),
        }
    }

    pub fn has_forwarded(&self, key: &DedupKey) -> bool {
        let mut entries = self.lock();
        let Some(index) = entries.get_index_of(key) else {
            return false;
        };
        let now = Instant::now();
        if let Some((_, marked_at)) = entries.get_index(index)
            && now.duration_since(*marked_at) >= self.ttl
        {
            entries.shift_remove_index(index);
            return false;
        }
        // Touch: move to the most recently used end.
        let last = entries.len() - 1;
        entries.move_index(index, last);
        true
    }

    /// Only call after a confirmed delivery.
    pub fn mark_forwarded(&self, key: DedupKey) {
        let mut entries = self.lock();
        let now = Instant::now();
        entries.shift_remove(&key);
        entries.insert(key, now);

        // Expired entries go first, then least recently used ones.
        while let Some((_, marked_at)) = entries.first()
            && now.duration_since(*marked_at) >= self.ttl
        {
            entries.shift_remove_index(0);
        }
        while entries.len() > self.capacity {
            entries.shift_remove_index(0);
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, IndexMap<DedupKey, Instant>> {
        // A poisoned map is still a valid cache.
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}
