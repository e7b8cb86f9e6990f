//! Subscriptions and update notifications (C9).
//!
//! A session subscribes to an object id and gets woken when that id
//! changes, whether the change arrived as a server push or as the
//! scout's own commit becoming globally visible. Built on
//! [`tokio::sync::Notify`], whose `notify_one` already coalesces any
//! number of notifications sent before the waiter next polls into a
//! single pending permit — exactly the at-most-once firing spec.md calls
//! for, so there is no separate dedup flag to maintain by hand.
//!
//! A second, independent mechanism lives alongside the plain
//! subscription above: a *listener*, attached to a single read, fires
//! at most once, the first time an update strictly newer than that
//! read's snapshot becomes globally visible (spec.md §4.9's last
//! paragraph). It is tracked per pending read via [`PendingListener`]
//! rather than through `Notify`, since it needs to compare clocks, not
//! just coalesce wakeups.

use crate::clock::{CausalClock, ClockOrdering};
use crate::crdt::ObjectId;
use crate::txn::SessionId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

pub type SubscriptionId = u64;

/// A one-shot callback invoked when a listener fires.
pub type Listener = Box<dyn FnOnce() + Send>;

/// A listener waiting on the first update strictly newer than `snapshot`
/// to become globally visible. `fired` guards against firing twice, e.g.
/// once from the notification task and again from a racing periodic
/// refresh.
struct PendingListener {
    snapshot: CausalClock,
    fired: AtomicBool,
    listener: Mutex<Option<Listener>>,
}

pub struct SubscriptionHandle {
    id: SubscriptionId,
    object: ObjectId,
    notify: Arc<Notify>,
}

impl SubscriptionHandle {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn object(&self) -> &ObjectId {
        &self.object
    }

    /// Resolves once the object has been notified at least once since the
    /// last time this was awaited.
    pub async fn wait_for_update(&self) {
        self.notify.notified().await;
    }
}

struct Entry {
    id: SubscriptionId,
    object: ObjectId,
    notify: Arc<Notify>,
}

/// Registry of per-session object subscriptions, plus the bookkeeping a
/// transaction needs to self-notify its own writes once they become
/// globally visible (`uncommittedUpdatesObjectsToNotify` in spec.md §4.9:
/// the set of ids a pending transaction has written, held until commit,
/// so the writer doesn't have to wait on a round trip through the
/// surrogate's push channel to learn about its own update).
#[derive(Default)]
pub struct SubscriptionRegistry {
    next_id: AtomicU64,
    by_session: Mutex<HashMap<SessionId, Vec<Entry>>>,
    listeners: Mutex<HashMap<ObjectId, Vec<Arc<PendingListener>>>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        SubscriptionRegistry::default()
    }

    /// Attach a listener to `id`, to fire once an update strictly newer
    /// than `snapshot` becomes globally visible.
    pub fn register_listener(&self, id: ObjectId, snapshot: CausalClock, listener: Listener) {
        let pending = Arc::new(PendingListener {
            snapshot,
            fired: AtomicBool::new(false),
            listener: Mutex::new(Some(listener)),
        });
        self.listeners.lock().unwrap().entry(id).or_default().push(pending);
    }

    /// Fire every pending listener for `id` whose snapshot is strictly
    /// dominated by `committed_version`, removing them once fired.
    pub fn fire_ready_listeners(&self, id: &ObjectId, committed_version: &CausalClock) {
        let mut map = self.listeners.lock().unwrap();
        if let Some(entries) = map.get_mut(id) {
            entries.retain(|entry| {
                if committed_version.compare_to(&entry.snapshot) != ClockOrdering::Dominates {
                    return true;
                }
                if !entry.fired.swap(true, Ordering::SeqCst) {
                    if let Some(f) = entry.listener.lock().unwrap().take() {
                        f();
                    }
                }
                false
            });
            let is_empty = entries.is_empty();
            if is_empty {
                map.remove(id);
            }
        }
    }

    /// Re-check every object with a pending listener against
    /// `committed_version`. Used by the periodic-refresh protocol, which
    /// learns a new global clock without learning which specific ids it
    /// covers.
    pub fn fire_all_ready(&self, committed_version: &CausalClock) {
        let ids: Vec<ObjectId> = self.listeners.lock().unwrap().keys().cloned().collect();
        for id in ids {
            self.fire_ready_listeners(&id, committed_version);
        }
    }

    /// Remove every plain subscription and pending listener for `id`.
    /// Called when the cache evicts `id`, so a dangling subscription
    /// never outlives the entry it was watching.
    pub fn remove_object(&self, id: &ObjectId) {
        let mut by_session = self.by_session.lock().unwrap();
        for entries in by_session.values_mut() {
            entries.retain(|e| &e.object != id);
        }
        drop(by_session);
        self.listeners.lock().unwrap().remove(id);
    }

    pub fn subscribe(&self, session_id: SessionId, object: ObjectId) -> SubscriptionHandle {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let notify = Arc::new(Notify::new());
        self.by_session.lock().unwrap().entry(session_id).or_default().push(Entry {
            id,
            object: object.clone(),
            notify: notify.clone(),
        });
        SubscriptionHandle { id, object, notify }
    }

    pub fn unsubscribe(&self, session_id: &SessionId, subscription_id: SubscriptionId) {
        if let Some(entries) = self.by_session.lock().unwrap().get_mut(session_id) {
            entries.retain(|e| e.id != subscription_id);
        }
    }

    pub fn drop_session(&self, session_id: &SessionId) {
        self.by_session.lock().unwrap().remove(session_id);
    }

    /// Wake every subscription registered against `id`, across all
    /// sessions.
    pub fn notify_object_updated(&self, id: &ObjectId) {
        let by_session = self.by_session.lock().unwrap();
        for entries in by_session.values() {
            for entry in entries {
                if &entry.object == id {
                    entry.notify.notify_one();
                }
            }
        }
    }

    pub fn notify_many<'a>(&self, ids: impl IntoIterator<Item = &'a ObjectId>) {
        for id in ids {
            self.notify_object_updated(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::Counter;
    use tokio::time::{timeout, Duration};

    fn oid() -> ObjectId {
        ObjectId::new("accounts", "alice", Counter::TYPE_TAG)
    }

    #[tokio::test]
    async fn subscriber_wakes_on_matching_update() {
        let registry = SubscriptionRegistry::new();
        let handle = registry.subscribe("session-1".to_string(), oid());

        registry.notify_object_updated(&oid());
        timeout(Duration::from_millis(100), handle.wait_for_update()).await.unwrap();
    }

    #[tokio::test]
    async fn notifications_before_waiting_coalesce_to_one_pending_wakeup() {
        let registry = SubscriptionRegistry::new();
        let handle = registry.subscribe("session-1".to_string(), oid());

        registry.notify_object_updated(&oid());
        registry.notify_object_updated(&oid());
        registry.notify_object_updated(&oid());

        // All three collapse into a single pending permit.
        timeout(Duration::from_millis(100), handle.wait_for_update()).await.unwrap();
        assert!(timeout(Duration::from_millis(20), handle.wait_for_update()).await.is_err());
    }

    #[tokio::test]
    async fn unsubscribe_stops_future_wakeups() {
        let registry = SubscriptionRegistry::new();
        let handle = registry.subscribe("session-1".to_string(), oid());
        registry.unsubscribe(&"session-1".to_string(), handle.id());

        registry.notify_object_updated(&oid());
        assert!(timeout(Duration::from_millis(20), handle.wait_for_update()).await.is_err());
    }

    fn ts(counter: u64) -> crate::clock::Timestamp {
        crate::clock::Timestamp::new("dc1", counter)
    }

    #[test]
    fn listener_fires_only_once_a_strictly_newer_update_is_visible() {
        let registry = SubscriptionRegistry::new();
        let mut snapshot = CausalClock::new();
        snapshot.record(&ts(1));

        let fired = Arc::new(Mutex::new(false));
        let fired_clone = fired.clone();
        registry.register_listener(oid(), snapshot.clone(), Box::new(move || *fired_clone.lock().unwrap() = true));

        // Same clock: not strictly newer, must not fire.
        registry.fire_ready_listeners(&oid(), &snapshot);
        assert!(!*fired.lock().unwrap());

        let mut newer = snapshot.clone();
        newer.record(&ts(2));
        registry.fire_ready_listeners(&oid(), &newer);
        assert!(*fired.lock().unwrap());

        // Firing again must not invoke the (already-consumed) callback.
        registry.fire_ready_listeners(&oid(), &newer);
    }

    #[tokio::test]
    async fn remove_object_drops_both_plain_subscriptions_and_pending_listeners() {
        let registry = SubscriptionRegistry::new();
        let handle = registry.subscribe("session-1".to_string(), oid());
        let fired = Arc::new(Mutex::new(false));
        let fired_clone = fired.clone();
        registry.register_listener(oid(), CausalClock::new(), Box::new(move || *fired_clone.lock().unwrap() = true));

        registry.remove_object(&oid());

        registry.notify_object_updated(&oid());
        assert!(timeout(Duration::from_millis(20), handle.wait_for_update()).await.is_err());

        let mut newer = CausalClock::new();
        newer.record(&ts(1));
        registry.fire_ready_listeners(&oid(), &newer);
        assert!(!*fired.lock().unwrap());
    }
}
