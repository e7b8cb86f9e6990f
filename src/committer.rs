//! Committer worker (C8): a single-threaded background task batching
//! locally-committed transactions and shipping them to the surrogate,
//! then splicing the returned system timestamps back into the cached
//! CRDTs and releasing each transaction's eviction protection.
//!
//! Grounded on the teacher's `background_connection.rs` background-task
//! shape: one task owns an mpsc receiver and the only mutable state it
//! touches, so the rest of the scout only ever talks to it by message.

use crate::cache::{ObjectCache, ProtectionSerial};
use crate::clock::{CausalClock, Timestamp};
use crate::commitlog::CommitLog;
use crate::config::ScoutConfig;
use crate::crdt::{CrdtValue, ObjectId};
use crate::error::{ScoutError, ScoutResult};
use crate::transport::SurrogateEndpoint;
use crate::wire::*;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Clone)]
pub enum CommitAck {
    Timestamps(Vec<Timestamp>),
    ClockRange(CausalClock),
}

pub struct CommitRequest {
    pub serial: u64,
    pub protection_serial: ProtectionSerial,
    pub client_timestamp: Timestamp,
    pub dependency_clock: CausalClock,
    /// Bincode-encoded `V::Op` payloads per target object.
    pub op_groups: HashMap<ObjectId, Vec<Vec<u8>>>,
    pub respond: oneshot::Sender<ScoutResult<CommitAck>>,
}

pub struct Committer<V: CrdtValue> {
    transport: Arc<dyn SurrogateEndpoint>,
    scout_id: String,
    disaster_safe: bool,
    max_batch_size: usize,
    share_dependencies_in_batch: bool,
    cache: Arc<Mutex<ObjectCache<V>>>,
    committed_clock: Arc<Mutex<CausalClock>>,
    commit_log: Option<Arc<Mutex<CommitLog>>>,
    log_flush_on_commit: bool,
    rx: mpsc::Receiver<CommitRequest>,
}

impl<V: CrdtValue> Committer<V> {
    /// `config.max_async_transactions_queued` bounds the channel, so a
    /// session whose commit can't be enqueued blocks on `send` rather
    /// than growing the queue without limit (spec.md §4.6's commit
    /// backpressure point).
    pub fn new(
        transport: Arc<dyn SurrogateEndpoint>,
        scout_id: String,
        config: &ScoutConfig,
        cache: Arc<Mutex<ObjectCache<V>>>,
        committed_clock: Arc<Mutex<CausalClock>>,
        commit_log: Option<Arc<Mutex<CommitLog>>>,
    ) -> (Self, mpsc::Sender<CommitRequest>) {
        let (tx, rx) = mpsc::channel(config.max_async_transactions_queued);
        (
            Committer {
                transport,
                scout_id,
                disaster_safe: config.disaster_safe,
                max_batch_size: config.max_commit_batch_size,
                share_dependencies_in_batch: config.share_dependencies_in_batch,
                cache,
                committed_clock,
                commit_log,
                log_flush_on_commit: config.log_flush_on_commit,
                rx,
            },
            tx,
        )
    }

    /// Drive the committer until the sending half is dropped (i.e. the
    /// owning scout shuts down). Intended to be spawned as a single
    /// background task.
    pub async fn run(mut self) {
        while let Some(first) = self.rx.recv().await {
            let mut batch = vec![first];
            while batch.len() < self.max_batch_size {
                match self.rx.try_recv() {
                    Ok(item) => batch.push(item),
                    Err(_) => break,
                }
            }
            if !self.process_batch(batch).await {
                log::error!(
                    "committer for scout {} stopping after a fatal transport error; ongoing and future commits fail with NETWORK",
                    self.scout_id
                );
                break;
            }
        }
        log::info!("committer for scout {} shutting down", self.scout_id);
    }

    /// Process one batch. Returns `false` on a fatal transport failure,
    /// telling `run` to stop rather than keep accepting new batches
    /// (spec.md §4.8 step 4: "on null/timeout, treat as fatal and stop").
    async fn process_batch(&mut self, mut batch: Vec<CommitRequest>) -> bool {
        let shared_dependency_clock = if self.share_dependencies_in_batch {
            let mut combined = CausalClock::new();
            for item in &batch {
                combined.merge(&item.dependency_clock);
            }
            Some(combined)
        } else {
            None
        };

        let requests: Vec<CommitUpdatesRequest> = batch
            .iter()
            .map(|item| CommitUpdatesRequest {
                client_timestamp: item.client_timestamp.clone(),
                dependency_clock: shared_dependency_clock.clone().unwrap_or_else(|| item.dependency_clock.clone()),
                ops_groups: item
                    .op_groups
                    .iter()
                    .map(|(id, ops)| OpsGroup {
                        id: id.clone(),
                        ops: ops.clone(),
                    })
                    .collect(),
                k_stability: 1,
            })
            .collect();

        if let Some(log) = &self.commit_log {
            let mut log = log.lock().unwrap();
            for req in &requests {
                if let Err(e) = log.append(req) {
                    log::warn!("failed to append commit log record: {e}");
                }
            }
            if self.log_flush_on_commit {
                if let Err(e) = log.flush() {
                    log::warn!("failed to flush commit log: {e}");
                }
            }
        }

        let batch_req = BatchCommitUpdatesRequest {
            scout_id: self.scout_id.clone(),
            disaster_safe: self.disaster_safe,
            requests,
        };

        match self.transport.commit(batch_req).await {
            Err(e) => {
                let message = e.to_string();
                for item in batch.drain(..) {
                    let _ = item.respond.send(Err(ScoutError::Network(message.clone())));
                }
                false
            }
            Ok(reply) => {
                if reply.replies.len() != batch.len() {
                    for item in batch.drain(..) {
                        let _ = item.respond.send(Err(ScoutError::Network("commit reply length mismatch".to_string())));
                    }
                    return true;
                }
                for (item, ack) in batch.into_iter().zip(reply.replies.into_iter()) {
                    self.apply_ack(item, ack);
                }
                true
            }
        }
    }

    fn apply_ack(&self, item: CommitRequest, ack: CommitUpdatesReply) {
        let result = match ack {
            CommitUpdatesReply::CommittedWithKnownTimestamps { system_timestamps } => {
                let mut cache = self.cache.lock().unwrap();
                for id in item.op_groups.keys() {
                    if let Some(crdt) = cache.get_mut_without_touch(id) {
                        for ts in &system_timestamps {
                            crdt.augment_with_scout_timestamp(ts);
                        }
                    }
                }
                let mut committed = self.committed_clock.lock().unwrap();
                for ts in &system_timestamps {
                    committed.record(ts);
                }
                Ok(CommitAck::Timestamps(system_timestamps))
            }
            CommitUpdatesReply::CommittedWithKnownClockRange { clock } => {
                let mut cache = self.cache.lock().unwrap();
                for id in item.op_groups.keys() {
                    if let Some(crdt) = cache.get_mut_without_touch(id) {
                        crdt.augment_with_dc_clock_without_mappings(&clock);
                    }
                }
                self.committed_clock.lock().unwrap().merge(&clock);
                Ok(CommitAck::ClockRange(clock))
            }
            CommitUpdatesReply::InvalidOperation { reason } => Err(ScoutError::IllegalState(reason)),
        };
        self.cache.lock().unwrap().release_protection(item.protection_serial);
        let _ = item.respond.send(result);
    }
}
