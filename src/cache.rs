//! LRU object cache (C4): id → managed CRDT mapping with access-order
//! eviction, time-based eviction, and transactional eviction-protection.
//!
//! Grounded on the teacher's `client_cache.rs` (id-keyed table of cached
//! rows, diffed and updated under a coarse lock) and on
//! `cache/query_cache.rs`'s LRU-queue-plus-TTL eviction shape
//! (`harborgrid-justin-rusty-db`), adapted so a single entry can be
//! "protected" by one or more open transactions and thus skipped by
//! size-based eviction until released.

use crate::crdt::{CrdtValue, ManagedCrdt, ObjectId};
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

/// Serial number identifying an open transaction for eviction-protection
/// purposes. Distinct from the transaction's client timestamp so that
/// protection bookkeeping doesn't need to reach into `txn`.
pub type ProtectionSerial = u64;

struct Slot<V: CrdtValue> {
    crdt: ManagedCrdt<V>,
    last_accessed: Instant,
    protected_by: HashSet<ProtectionSerial>,
}

/// Observes cache evictions so other subsystems (subscriptions, metrics)
/// can react without the cache depending on them directly.
pub trait EvictionListener<V: CrdtValue>: Send + Sync {
    fn on_evict(&self, id: &ObjectId);
}

/// An id → managed CRDT cache for a single CRDT value type, with
/// access-order (LRU) and TTL eviction, protected against evicting
/// entries still in use by an open transaction.
pub struct ObjectCache<V: CrdtValue> {
    entries: HashMap<ObjectId, Slot<V>>,
    /// Access order, oldest (least recently used) at the front. An id may
    /// appear only once; touching moves it to the back.
    order: VecDeque<ObjectId>,
    max_elements: usize,
    eviction_ttl: Duration,
    listeners: Vec<Box<dyn EvictionListener<V>>>,
}

impl<V: CrdtValue> ObjectCache<V> {
    pub fn new(max_elements: usize, eviction_ttl: Duration) -> Self {
        ObjectCache {
            entries: HashMap::new(),
            order: VecDeque::new(),
            max_elements,
            eviction_ttl,
            listeners: Vec::new(),
        }
    }

    pub fn add_eviction_listener(&mut self, listener: Box<dyn EvictionListener<V>>) {
        self.listeners.push(listener);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn touch_order(&mut self, id: &ObjectId) {
        if let Some(pos) = self.order.iter().position(|x| x == id) {
            self.order.remove(pos);
        }
        self.order.push_back(id.clone());
    }

    /// Look up `id`, updating its recency.
    pub fn get_and_touch(&mut self, id: &ObjectId) -> Option<&ManagedCrdt<V>> {
        if self.entries.contains_key(id) {
            self.touch_order(id);
            self.entries.get_mut(id).unwrap().last_accessed = Instant::now();
            self.entries.get(id).map(|s| &s.crdt)
        } else {
            None
        }
    }

    /// Look up `id` without affecting recency.
    pub fn get_without_touch(&self, id: &ObjectId) -> Option<&ManagedCrdt<V>> {
        self.entries.get(id).map(|s| &s.crdt)
    }

    pub fn get_mut_without_touch(&mut self, id: &ObjectId) -> Option<&mut ManagedCrdt<V>> {
        self.entries.get_mut(id).map(|s| &mut s.crdt)
    }

    /// Install a new managed CRDT, optionally protected by `serial`, and
    /// run size-based eviction. Returns the ids evicted as a side effect.
    pub fn add(&mut self, crdt: ManagedCrdt<V>, serial: Option<ProtectionSerial>) -> Vec<ObjectId> {
        let id = crdt.id.clone();
        let mut protected_by = HashSet::new();
        if let Some(serial) = serial {
            protected_by.insert(serial);
        }
        self.entries.insert(
            id.clone(),
            Slot {
                crdt,
                last_accessed: Instant::now(),
                protected_by,
            },
        );
        self.touch_order(&id);
        self.evict_for_size()
    }

    /// Tag an already-cached entry with a transaction serial so it cannot
    /// be evicted until the protection is released.
    pub fn protect(&mut self, id: &ObjectId, serial: ProtectionSerial) {
        if let Some(slot) = self.entries.get_mut(id) {
            slot.protected_by.insert(serial);
        }
    }

    fn is_protected(&self, id: &ObjectId) -> bool {
        self.entries
            .get(id)
            .map(|s| !s.protected_by.is_empty())
            .unwrap_or(false)
    }

    /// Evict the least-recently-used unprotected entry repeatedly while
    /// over `max_elements`. An entry tagged as protected is skipped, even
    /// if that means the cache temporarily exceeds `max_elements`.
    fn evict_for_size(&mut self) -> Vec<ObjectId> {
        let mut evicted = Vec::new();
        while self.entries.len() > self.max_elements {
            let candidate = self
                .order
                .iter()
                .position(|id| !self.is_protected(id));
            match candidate {
                Some(pos) => {
                    let id = self.order.remove(pos).unwrap();
                    self.entries.remove(&id);
                    self.notify_evicted(&id);
                    evicted.push(id);
                }
                None => break, // everything left is protected
            }
        }
        evicted
    }

    fn notify_evicted(&self, id: &ObjectId) {
        for listener in &self.listeners {
            listener.on_evict(id);
        }
        log::debug!("evicted object {} from cache", id);
    }

    /// Release a protection serial, allowing the entry to be evicted
    /// again once it also clears size/TTL criteria.
    pub fn release_protection(&mut self, serial: ProtectionSerial) {
        for slot in self.entries.values_mut() {
            slot.protected_by.remove(&serial);
        }
    }

    /// Sweep the cache: remove unprotected entries whose access time is
    /// older than `now - eviction_ttl`, then enforce `max_elements` again
    /// for any entries that were left over-capacity.
    pub fn remove_protection_and_sweep(&mut self, serial: ProtectionSerial) -> Vec<ObjectId> {
        self.release_protection(serial);
        let now = Instant::now();
        let mut evicted = Vec::new();
        let expired: Vec<ObjectId> = self
            .entries
            .iter()
            .filter(|(id, slot)| {
                slot.protected_by.is_empty()
                    && now.saturating_duration_since(slot.last_accessed) > self.eviction_ttl
                    && self.order.contains(id)
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            self.entries.remove(&id);
            if let Some(pos) = self.order.iter().position(|x| x == &id) {
                self.order.remove(pos);
            }
            self.notify_evicted(&id);
            evicted.push(id);
        }
        evicted.extend(self.evict_for_size());
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::Counter;
    use std::sync::{Arc, Mutex};

    fn oid(key: &str) -> ObjectId {
        ObjectId::new("accounts", key, Counter::TYPE_TAG)
    }

    struct RecordingListener(Arc<Mutex<Vec<ObjectId>>>);
    impl EvictionListener<Counter> for RecordingListener {
        fn on_evict(&self, id: &ObjectId) {
            self.0.lock().unwrap().push(id.clone());
        }
    }

    #[test]
    fn evicts_least_recently_used_when_over_capacity() {
        let mut cache: ObjectCache<Counter> = ObjectCache::new(1, Duration::from_secs(60));
        cache.add(ManagedCrdt::new(oid("a")), None);
        let evicted = cache.add(ManagedCrdt::new(oid("b")), None);
        assert_eq!(evicted, vec![oid("a")]);
        assert!(cache.get_without_touch(&oid("a")).is_none());
        assert!(cache.get_without_touch(&oid("b")).is_some());
    }

    #[test]
    fn protected_entry_is_not_evicted_even_over_capacity() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let mut cache: ObjectCache<Counter> = ObjectCache::new(1, Duration::from_secs(60));
        cache.add_eviction_listener(Box::new(RecordingListener(events.clone())));

        cache.add(ManagedCrdt::new(oid("a")), Some(1));
        let evicted = cache.add(ManagedCrdt::new(oid("b")), None);
        // "a" is protected by transaction serial 1, so eviction must skip
        // it even though the cache now holds 2 entries.
        assert!(evicted.is_empty());
        assert_eq!(cache.len(), 2);
        assert!(events.lock().unwrap().is_empty());

        cache.release_protection(1);
        let evicted = cache.remove_protection_and_sweep(1);
        assert_eq!(evicted, vec![oid("a")]);
        assert_eq!(events.lock().unwrap().as_slice(), &[oid("a")]);
    }

    #[test]
    fn get_and_touch_updates_recency_get_without_touch_does_not() {
        let mut cache: ObjectCache<Counter> = ObjectCache::new(2, Duration::from_secs(60));
        cache.add(ManagedCrdt::new(oid("a")), None);
        cache.add(ManagedCrdt::new(oid("b")), None);

        // Touch "a" so it becomes most-recently-used.
        cache.get_and_touch(&oid("a"));
        let evicted = cache.add(ManagedCrdt::new(oid("c")), None);
        assert_eq!(evicted, vec![oid("b")]);
    }

    #[test]
    fn ttl_sweep_removes_stale_unprotected_entries() {
        let mut cache: ObjectCache<Counter> = ObjectCache::new(10, Duration::from_millis(0));
        cache.add(ManagedCrdt::new(oid("a")), None);
        std::thread::sleep(Duration::from_millis(2));
        let evicted = cache.remove_protection_and_sweep(999);
        assert_eq!(evicted, vec![oid("a")]);
    }
}
