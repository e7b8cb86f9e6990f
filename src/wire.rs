//! Wire-level messages (§6): the shapes of the RPCs exchanged with the
//! surrogate. These are plain serializable structs; the actual framing
//! (length-prefixed binary object stream) and transport live in
//! [`crate::transport`] and are out of scope per spec.md §1 — the scout
//! only needs to agree on these shapes with whatever sits on the other
//! end of a [`crate::transport::SurrogateEndpoint`].
//!
//! Grounded on the teacher's `client-api-messages` crate (the wire
//! vocabulary SpacetimeDB's client SDK exchanges with its server:
//! `Message`, `SubscriptionUpdate`, `TableUpdate`, `TransactionUpdate`),
//! adapted from "table row operations" to the clock/CRDT vocabulary this
//! spec calls for.

use crate::clock::{CausalClock, Timestamp};
use crate::crdt::ObjectId;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatestKnownClockRequest {
    pub scout_id: String,
    pub disaster_safe: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatestKnownClockReply {
    pub clock: CausalClock,
    pub disaster_durable_clock: CausalClock,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchObjectVersion {
    pub id: ObjectId,
    pub known_clock: Option<CausalClock>,
    pub requested_version: CausalClock,
    pub send_more_recent_updates: bool,
    pub subscribe_updates: bool,
    pub create_if_missing: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchFetchObjectVersionRequest {
    pub scout_id: String,
    pub disaster_safe: bool,
    pub light_mode: bool,
    pub fetches: Vec<FetchObjectVersion>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FetchStatus {
    Ok,
    UpToDate,
    ObjectNotFound,
    VersionMissing,
    VersionPruned,
}

/// A single object's payload in a fetch reply. The CRDT state itself is
/// represented as an opaque, already-serialized blob of timestamped
/// operations: decoding into a concrete `CrdtValue::Op` is the caller's
/// job, since a single batch reply may carry objects of different CRDT
/// value types.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchedCrdtState {
    pub ops: Vec<(Timestamp, Vec<u8>)>,
    pub clock: CausalClock,
    pub prune_clock: CausalClock,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchFetchObjectVersionReplyEntry {
    pub id: ObjectId,
    pub status: FetchStatus,
    pub crdt: Option<FetchedCrdtState>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchFetchObjectVersionReply {
    pub entries: Vec<BatchFetchObjectVersionReplyEntry>,
    pub estimated_committed_version: CausalClock,
    pub estimated_disaster_durable_committed_version: CausalClock,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpsGroup {
    pub id: ObjectId,
    pub ops: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitUpdatesRequest {
    pub client_timestamp: Timestamp,
    pub dependency_clock: CausalClock,
    pub ops_groups: Vec<OpsGroup>,
    pub k_stability: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchCommitUpdatesRequest {
    pub scout_id: String,
    pub disaster_safe: bool,
    pub requests: Vec<CommitUpdatesRequest>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CommitUpdatesReply {
    CommittedWithKnownTimestamps { system_timestamps: Vec<Timestamp> },
    CommittedWithKnownClockRange { clock: CausalClock },
    InvalidOperation { reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchCommitUpdatesReply {
    pub replies: Vec<CommitUpdatesReply>,
}

/// A group of timestamped operations pushed for one object, as opposed to
/// [`OpsGroup`] (used in commit requests, where the timestamp is shared
/// across the whole request and so lives at the request level instead).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifiedOpsGroup {
    pub id: ObjectId,
    pub ops: Vec<(Timestamp, Vec<u8>)>,
}

/// Server-initiated push.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchUpdatesNotification {
    pub scout_id: String,
    pub new_version: CausalClock,
    pub is_disaster_safe: bool,
    pub updates: Vec<NotifiedOpsGroup>,
}
