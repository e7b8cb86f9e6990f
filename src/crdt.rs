//! Managed CRDT wrapper (C3).
//!
//! The CRDT value types themselves are out of scope (spec.md §1): the
//! scout only needs their generic operations. [`CrdtValue`] is the trait
//! those operations are abstracted over — a stand-in for the "deep
//! inheritance hierarchy of CRDT types" the design notes (spec.md §9)
//! call out, replaced here with a single flat trait plus a handful of
//! concrete variants so the pipeline can be exercised end to end.

use crate::clock::{CausalClock, Timestamp};
use crate::error::{ScoutError, ScoutResult};
use std::collections::BTreeMap;

/// Opaque CRDT identifier: (table, key, type-tag). Equality is structural.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct ObjectId {
    pub table: String,
    pub key: String,
    pub type_tag: &'static str,
}

impl ObjectId {
    pub fn new(table: impl Into<String>, key: impl Into<String>, type_tag: &'static str) -> Self {
        ObjectId {
            table: table.into(),
            key: key.into(),
            type_tag,
        }
    }
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}:{}", self.table, self.key, self.type_tag)
    }
}

/// The generic capability every CRDT value type must provide: apply an
/// update, produce an empty instance, and report its type tag for
/// `WRONG_TYPE` checks.
pub trait CrdtValue: Clone + Send + Sync + 'static {
    type Op: Clone + Send + Sync + 'static + serde::Serialize + serde::de::DeserializeOwned;

    /// Type tag used for `WRONG_TYPE` detection; must match the tag
    /// embedded in the object's [`ObjectId`].
    const TYPE_TAG: &'static str;

    fn empty() -> Self;

    /// Apply `op` to this value in place. CRDT operations are expected to
    /// be associative, commutative and idempotent at the value level; the
    /// managed wrapper is responsible for not re-applying an operation
    /// whose timestamp is already in the clock (see `DependencyPolicy`).
    fn apply(&mut self, op: &Self::Op);
}

/// Last-writer-wins register, compared by the attached timestamp.
#[derive(Debug, Clone, Default)]
pub struct LwwRegister<T: Clone + Send + Sync + 'static> {
    value: Option<T>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RegisterWrite<T: Clone + Send + Sync + 'static>(pub T);

impl<T> CrdtValue for LwwRegister<T>
where
    T: Clone + Send + Sync + 'static + Default + serde::Serialize + serde::de::DeserializeOwned,
{
    type Op = RegisterWrite<T>;
    const TYPE_TAG: &'static str = "lww-register";

    fn empty() -> Self {
        LwwRegister { value: None }
    }

    fn apply(&mut self, op: &Self::Op) {
        self.value = Some(op.0.clone());
    }
}

impl<T: Clone + Send + Sync + 'static> LwwRegister<T> {
    pub fn get(&self) -> Option<&T> {
        self.value.as_ref()
    }
}

/// A grow-only counter: the op is a delta, applied by summation.
#[derive(Debug, Clone, Copy, Default)]
pub struct Counter(pub i64);

impl CrdtValue for Counter {
    type Op = i64;
    const TYPE_TAG: &'static str = "counter";

    fn empty() -> Self {
        Counter(0)
    }

    fn apply(&mut self, op: &Self::Op) {
        self.0 += op;
    }
}

/// A grow-only set.
#[derive(Debug, Clone, Default)]
pub struct GSet<T: Clone + Eq + std::hash::Hash + Send + Sync + 'static> {
    elements: im::HashSet<T>,
}

impl<T> CrdtValue for GSet<T>
where
    T: Clone + Eq + std::hash::Hash + Send + Sync + 'static + serde::Serialize + serde::de::DeserializeOwned,
{
    type Op = T;
    const TYPE_TAG: &'static str = "g-set";

    fn empty() -> Self {
        GSet {
            elements: im::HashSet::new(),
        }
    }

    fn apply(&mut self, op: &Self::Op) {
        self.elements.insert(op.clone());
    }
}

impl<T: Clone + Eq + std::hash::Hash + Send + Sync + 'static> GSet<T> {
    pub fn contains(&self, v: &T) -> bool {
        self.elements.contains(v)
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }
}

/// How `execute` should treat an operation's dependency on the current
/// clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyPolicy {
    /// Refuse to apply if the timestamp is already present (default path
    /// for locally-originated writes and server replies).
    Check,
    /// Apply unconditionally, but still report whether it was new. Used
    /// for push notifications, which may arrive out of causal order and
    /// which the CRDT must tolerate as replays.
    Ignore,
    /// Apply and record the timestamp without checking anything at all.
    RecordBlindly,
}

/// Holds a CRDT value plus the clock bounding all updates ever
/// incorporated, and the prune-clock bounding updates that have been
/// collapsed into the checkpoint state. Invariant: `prune_clock ⊑ clock`.
#[derive(Clone)]
pub struct ManagedCrdt<V: CrdtValue> {
    pub id: ObjectId,
    /// Folded state of every update covered by `prune_clock`. Updates
    /// below the prune point are no longer individually retrievable, so
    /// this is the only trace of them that remains.
    checkpoint: V,
    /// Current value: `checkpoint` with every op in `history` folded in.
    value: V,
    clock: CausalClock,
    prune_clock: CausalClock,
    registered_in_store: bool,
    /// Individually retrievable history: operations not yet collapsed by
    /// a prune. Ordered so that `getVersion` can replay a deterministic
    /// subset and `getUpdatesTimestampMappingsSince` can enumerate by
    /// timestamp.
    history: BTreeMap<Timestamp, V::Op>,
}

impl<V: CrdtValue> ManagedCrdt<V> {
    pub fn new(id: ObjectId) -> Self {
        ManagedCrdt {
            id,
            checkpoint: V::empty(),
            value: V::empty(),
            clock: CausalClock::new(),
            prune_clock: CausalClock::new(),
            registered_in_store: false,
            history: BTreeMap::new(),
        }
    }

    pub fn clock(&self) -> &CausalClock {
        &self.clock
    }

    pub fn prune_clock(&self) -> &CausalClock {
        &self.prune_clock
    }

    pub fn is_registered_in_store(&self) -> bool {
        self.registered_in_store
    }

    pub fn mark_registered_in_store(&mut self) {
        self.registered_in_store = true;
    }

    pub fn current_value(&self) -> &V {
        &self.value
    }

    /// Apply `op` at `ts` per `policy`. Returns `true` if the operation
    /// was new (not already present in the clock).
    pub fn execute(&mut self, ts: Timestamp, op: V::Op, policy: DependencyPolicy) -> bool {
        let already_present = self.clock.includes(&ts);
        match policy {
            DependencyPolicy::Check if already_present => return false,
            _ => {}
        }
        self.value.apply(&op);
        self.clock.record(&ts);
        self.history.insert(ts, op);
        !already_present
    }

    /// Expand the CRDT's clock only, without importing new operation
    /// evidence. Used when the scout learns of global visibility via an
    /// `UP_TO_DATE` fetch reply, or after a commit, without the server
    /// shipping a payload.
    pub fn augment_with_dc_clock_without_mappings(&mut self, clock: &CausalClock) {
        self.clock.merge(clock);
    }

    pub fn augment_with_scout_timestamp(&mut self, ts: &Timestamp) {
        self.clock.record(ts);
    }

    /// Collapse history up to `point` into the checkpoint state. The
    /// clock is left unchanged; `prune_clock` becomes `prune_clock ⊔
    /// point` (it must end up dominating `point`).
    ///
    /// `check_versions`, when true, additionally verifies that every
    /// timestamp being collapsed is already reflected in `self.value`
    /// (i.e. nothing is pruned that was never applied) — a defensive
    /// check appropriate when pruning based on an externally-supplied
    /// point rather than one derived from our own clock.
    pub fn prune(&mut self, point: &CausalClock, check_versions: bool) -> ScoutResult<()> {
        if check_versions && !self.clock.dominates(point) {
            return Err(ScoutError::VersionNotFound {
                object: self.id.to_string(),
                reason: "prune point is not covered by the object's clock".to_string(),
            });
        }
        let mut collapsed = Vec::new();
        self.history.retain(|ts, op| {
            if point.includes(ts) {
                collapsed.push(op.clone());
                false
            } else {
                true
            }
        });
        for op in &collapsed {
            self.checkpoint.apply(op);
        }
        self.prune_clock.merge(point);
        Ok(())
    }

    /// Produce a snapshot value for `query_clock`. Fails with
    /// `VERSION_NOT_FOUND` unless `prune_clock ⊑ query_clock ⊑ clock`.
    pub fn get_version(&self, query_clock: &CausalClock) -> ScoutResult<V> {
        if !query_clock.dominates(&self.prune_clock) {
            return Err(ScoutError::VersionNotFound {
                object: self.id.to_string(),
                reason: "requested version is below the prune clock".to_string(),
            });
        }
        if !self.clock.dominates(query_clock) {
            return Err(ScoutError::VersionNotFound {
                object: self.id.to_string(),
                reason: "requested version is not yet replicated".to_string(),
            });
        }
        if query_clock.dominates(&self.clock) {
            // query_clock already covers everything we have.
            return Ok(self.value.clone());
        }
        // query_clock sits between prune_clock and clock: start from the
        // checkpoint (which already reflects everything pruned, and
        // query_clock is known to dominate prune_clock) and replay only
        // the still-individually-tracked ops it additionally covers.
        let mut v = self.checkpoint.clone();
        for (ts, op) in &self.history {
            if query_clock.includes(ts) {
                v.apply(op);
            }
        }
        Ok(v)
    }

    /// Merge another managed copy of the same object into this one.
    /// Requires overlapping prune-clocks; fails with `ILLEGAL_STATE`
    /// otherwise (the caller — the cache — must then drop its copy and
    /// refetch from scratch).
    pub fn merge(&mut self, other: &ManagedCrdt<V>) -> ScoutResult<()> {
        let overlap = self.prune_clock.intersected(&other.prune_clock);
        if overlap.is_empty() && !(self.prune_clock.is_empty() && other.prune_clock.is_empty()) {
            return Err(ScoutError::IllegalState(format!(
                "cannot merge {}: prune clocks do not overlap",
                self.id
            )));
        }
        for (ts, op) in &other.history {
            if !self.clock.includes(ts) {
                self.value.apply(op);
                self.history.insert(ts.clone(), op.clone());
            }
        }
        self.clock.merge(&other.clock);
        self.prune_clock.merge(&other.prune_clock);
        self.registered_in_store = self.registered_in_store || other.registered_in_store;
        Ok(())
    }

    /// Enumerate the timestamps of updates not covered by `clock`. Fails
    /// when `clock` is below the prune-clock (those updates have already
    /// been collapsed and their individual timestamps are unavailable).
    pub fn updates_timestamps_since(&self, clock: &CausalClock) -> ScoutResult<Vec<Timestamp>> {
        if !clock.dominates(&self.prune_clock) {
            return Err(ScoutError::VersionNotFound {
                object: self.id.to_string(),
                reason: "clock is below the prune clock".to_string(),
            });
        }
        Ok(self
            .history
            .keys()
            .filter(|ts| !clock.includes(ts))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oid() -> ObjectId {
        ObjectId::new("accounts", "alice", Counter::TYPE_TAG)
    }

    #[test]
    fn execute_reports_new_and_applies() {
        let mut c: ManagedCrdt<Counter> = ManagedCrdt::new(oid());
        let ts = Timestamp::new("scout-1", 1);
        assert!(c.execute(ts.clone(), 5, DependencyPolicy::Check));
        assert_eq!(c.current_value().0, 5);
        // Re-executing the same timestamp under Check is a no-op.
        assert!(!c.execute(ts, 5, DependencyPolicy::Check));
        assert_eq!(c.current_value().0, 5);
    }

    #[test]
    fn check_policy_rejects_timestamps_already_in_the_clock() {
        let mut c: ManagedCrdt<Counter> = ManagedCrdt::new(oid());
        let ts = Timestamp::new("scout-1", 1);
        assert!(c.execute(ts.clone(), 5, DependencyPolicy::Ignore));
        assert!(!c.execute(ts, 5, DependencyPolicy::Check));
        assert_eq!(c.current_value().0, 5);
    }

    #[test]
    fn prune_collapses_history_without_changing_clock() {
        let mut c: ManagedCrdt<Counter> = ManagedCrdt::new(oid());
        let ts1 = Timestamp::new("scout-1", 1);
        let ts2 = Timestamp::new("scout-1", 2);
        c.execute(ts1.clone(), 2, DependencyPolicy::Check);
        c.execute(ts2.clone(), 3, DependencyPolicy::Check);

        let mut point = CausalClock::new();
        point.record(&ts1);
        let clock_before = c.clock().clone();
        c.prune(&point, true).unwrap();
        assert_eq!(c.clock(), &clock_before);
        assert!(c.prune_clock().dominates(&point));
        assert!(c.updates_timestamps_since(&CausalClock::new()).is_err());
    }

    #[test]
    fn get_version_fails_outside_prune_clock_and_clock_bounds() {
        let mut c: ManagedCrdt<Counter> = ManagedCrdt::new(oid());
        let ts1 = Timestamp::new("scout-1", 1);
        c.execute(ts1.clone(), 2, DependencyPolicy::Check);

        let mut too_far = CausalClock::new();
        too_far.record(&Timestamp::new("scout-1", 99));
        assert!(c.get_version(&too_far).is_err());

        let mut at_ts1 = CausalClock::new();
        at_ts1.record(&ts1);
        assert_eq!(c.get_version(&at_ts1).unwrap().0, 2);

        let mut point = CausalClock::new();
        point.record(&ts1);
        c.prune(&point, true).unwrap();
        assert!(c.get_version(&CausalClock::new()).is_err());
    }

    #[test]
    fn merge_requires_prune_clock_overlap() {
        let mut a: ManagedCrdt<Counter> = ManagedCrdt::new(oid());
        let mut b: ManagedCrdt<Counter> = ManagedCrdt::new(oid());

        let ts1 = Timestamp::new("scout-1", 1);
        a.execute(ts1.clone(), 1, DependencyPolicy::Check);

        let mut point_a = CausalClock::new();
        point_a.record(&ts1);
        a.prune(&point_a, true).unwrap();

        let mut point_b = CausalClock::new();
        point_b.record(&Timestamp::new("scout-2", 1));
        b.execute(Timestamp::new("scout-2", 1), 7, DependencyPolicy::Check);
        b.prune(&point_b, true).unwrap();

        assert!(a.merge(&b).is_err());
    }

    #[test]
    fn merge_unions_history_and_clocks() {
        let mut a: ManagedCrdt<Counter> = ManagedCrdt::new(oid());
        let mut b: ManagedCrdt<Counter> = ManagedCrdt::new(oid());
        a.execute(Timestamp::new("scout-1", 1), 2, DependencyPolicy::Check);
        b.execute(Timestamp::new("scout-2", 1), 3, DependencyPolicy::Check);

        a.merge(&b).unwrap();
        assert_eq!(a.current_value().0, 5);
        assert!(a.clock().includes(&Timestamp::new("scout-2", 1)));
    }
}
