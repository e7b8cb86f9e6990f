//! Transaction handles (C5): the PENDING → COMMITTED_LOCAL →
//! COMMITTED_GLOBAL / CANCELLED state machine, the buffer of local
//! operations, and the snapshot view.

use crate::clock::CausalClock;
use crate::crdt::ObjectId;
use crate::error::{ScoutError, ScoutResult};
use crate::timestamp::TimestampMapping;
use std::collections::HashMap;

/// Session identifier: opaque, assigned by the application when it opens
/// a session on a scout.
pub type SessionId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    SnapshotIsolation,
    RepeatableReads,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePolicy {
    Cached,
    MostRecent,
    StrictlyMostRecent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnStatus {
    Pending,
    CommittedLocal,
    CommittedGlobal,
    Cancelled,
}

/// One buffered write: an opaque, serializable CRDT operation payload
/// together with the object it targets. The concrete operation type is
/// erased to bytes here because a single transaction may touch objects
/// of different CRDT value types; `Scout` decodes/applies per-object
/// using the type tag embedded in `ObjectId`.
#[derive(Debug, Clone)]
pub struct BufferedOp {
    pub payload: Vec<u8>,
}

/// A transaction handle. Reads and writes on a non-`Pending` handle are
/// `ILLEGAL_STATE` errors; status transitions are enforced by `Scout`
/// under its coarse lock, so this struct itself does no synchronization.
pub struct TxnHandle {
    pub serial: u64,
    pub session_id: SessionId,
    pub timestamp_mapping: TimestampMapping,
    pub isolation: IsolationLevel,
    pub cache_policy: CachePolicy,
    pub read_only: bool,
    /// Frozen at begin for SI. For RR this still exists but plays a
    /// smaller role: each object's version is instead frozen on first
    /// access (see `rr_frozen_versions`).
    pub snapshot_clock: CausalClock,
    /// Grows monotonically from `snapshot_clock` as the transaction reads
    /// values; transmitted with the commit so the store orders the
    /// transaction correctly.
    pub updates_dependency_clock: CausalClock,
    /// Buffered writes, grouped by target object.
    op_groups: HashMap<ObjectId, Vec<BufferedOp>>,
    /// Repeatable Reads: once an object has been read, the clock at which
    /// it was first observed is frozen here so later reads of the same id
    /// return the same value.
    rr_frozen_versions: HashMap<ObjectId, CausalClock>,
    status: TxnStatus,
}

impl TxnHandle {
    pub fn new(
        serial: u64,
        session_id: SessionId,
        timestamp_mapping: TimestampMapping,
        isolation: IsolationLevel,
        cache_policy: CachePolicy,
        read_only: bool,
        snapshot_clock: CausalClock,
    ) -> Self {
        TxnHandle {
            serial,
            session_id,
            timestamp_mapping,
            isolation,
            cache_policy,
            read_only,
            updates_dependency_clock: snapshot_clock.clone(),
            snapshot_clock,
            op_groups: HashMap::new(),
            rr_frozen_versions: HashMap::new(),
            status: TxnStatus::Pending,
        }
    }

    pub fn status(&self) -> TxnStatus {
        self.status
    }

    pub fn client_timestamp(&self) -> &crate::clock::Timestamp {
        &self.timestamp_mapping.client
    }

    pub fn has_updates(&self) -> bool {
        !self.op_groups.is_empty()
    }

    pub fn op_groups(&self) -> &HashMap<ObjectId, Vec<BufferedOp>> {
        &self.op_groups
    }

    fn require_pending(&self) -> ScoutResult<()> {
        if self.status != TxnStatus::Pending {
            return Err(ScoutError::IllegalState(format!(
                "transaction {} is {:?}, not PENDING",
                self.serial, self.status
            )));
        }
        Ok(())
    }

    /// Buffer a write. The transaction must still be PENDING.
    pub fn put(&mut self, id: ObjectId, op: BufferedOp) -> ScoutResult<()> {
        self.require_pending()?;
        if self.read_only {
            return Err(ScoutError::IllegalState(
                "cannot write in a read-only transaction".to_string(),
            ));
        }
        self.op_groups.entry(id).or_default().push(op);
        Ok(())
    }

    /// Advance the dependency clock with the clock of an object that was
    /// just read: the transitive causal antecedent of the eventual
    /// write-set must include everything the transaction observed.
    pub fn record_read_dependency(&mut self, object_clock: &CausalClock) -> ScoutResult<()> {
        self.require_pending()?;
        self.updates_dependency_clock.merge(object_clock);
        Ok(())
    }

    /// The snapshot-clock (or, for RR, a per-object frozen clock) this
    /// transaction should read `id` at.
    pub fn read_clock_for(&self, id: &ObjectId) -> &CausalClock {
        match self.isolation {
            IsolationLevel::SnapshotIsolation => &self.snapshot_clock,
            IsolationLevel::RepeatableReads => {
                self.rr_frozen_versions.get(id).unwrap_or(&self.snapshot_clock)
            }
        }
    }

    /// Freeze `id`'s version for Repeatable Reads on first access. A
    /// no-op for Snapshot Isolation and for ids already frozen.
    pub fn freeze_rr_version(&mut self, id: &ObjectId, clock: CausalClock) -> ScoutResult<()> {
        self.require_pending()?;
        if self.isolation == IsolationLevel::RepeatableReads {
            self.rr_frozen_versions.entry(id.clone()).or_insert(clock);
        }
        Ok(())
    }

    pub fn mark_committed_local(&mut self) -> ScoutResult<()> {
        self.require_pending()?;
        self.status = TxnStatus::CommittedLocal;
        Ok(())
    }

    pub fn mark_committed_global(&mut self) -> ScoutResult<()> {
        if !matches!(self.status, TxnStatus::Pending | TxnStatus::CommittedLocal) {
            return Err(ScoutError::IllegalState(format!(
                "transaction {} cannot move to COMMITTED_GLOBAL from {:?}",
                self.serial, self.status
            )));
        }
        self.status = TxnStatus::CommittedGlobal;
        Ok(())
    }

    pub fn mark_cancelled(&mut self) -> ScoutResult<()> {
        self.require_pending()?;
        self.status = TxnStatus::Cancelled;
        Ok(())
    }
}
