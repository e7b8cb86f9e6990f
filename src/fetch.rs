//! Fetch pipeline (C7): on a cache miss, ask the surrogate for an
//! object's state at or above a requested version, merge the reply into
//! the cache, and retry while the server reports `VERSION_MISSING`.
//!
//! Concurrent requests for the same object are deduplicated: rather than
//! track per-id waiter lists, every fetch that loses the race to become
//! the "leader" for an id simply waits on one shared [`Notify`] and
//! re-checks the cache, the same coarse-grained style spec.md §5 asks for
//! everywhere else in the scout. Grounded on the request/response loop in
//! the teacher's `background_connection.rs`, adapted from a single
//! long-lived subscription socket to discrete deadline-bounded RPCs.

use crate::cache::ObjectCache;
use crate::clock::CausalClock;
use crate::crdt::{CrdtValue, ManagedCrdt, ObjectId};
use crate::error::{ScoutError, ScoutResult};
use crate::metrics::ScoutMetrics;
use crate::transport::SurrogateEndpoint;
use crate::wire::*;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

const INITIAL_BACKOFF: Duration = Duration::from_millis(20);
const MAX_BACKOFF: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Default)]
pub struct FetchOutcome {
    /// True if the cache already satisfied the request and no RPC was made.
    pub served_from_cache: bool,
    pub estimated_committed_version: CausalClock,
    pub estimated_disaster_durable_committed_version: CausalClock,
}

pub struct FetchPipeline<V: CrdtValue> {
    transport: Arc<dyn SurrogateEndpoint>,
    scout_id: String,
    disaster_safe: bool,
    cache: Arc<Mutex<ObjectCache<V>>>,
    /// The requested version of the current leader request for each id
    /// with a fetch in flight. Consulted by the scout before opportunistically
    /// pruning a cached object's history, so an in-flight fetch never has
    /// its lower bound pruned out from under it (spec.md §8 scenario S6).
    in_flight: Mutex<HashMap<ObjectId, CausalClock>>,
    notify: Notify,
    metrics: Arc<ScoutMetrics>,
}

impl<V: CrdtValue> FetchPipeline<V> {
    pub fn new(
        transport: Arc<dyn SurrogateEndpoint>,
        scout_id: String,
        disaster_safe: bool,
        cache: Arc<Mutex<ObjectCache<V>>>,
        metrics: Arc<ScoutMetrics>,
    ) -> Self {
        FetchPipeline {
            transport,
            scout_id,
            disaster_safe,
            cache,
            in_flight: Mutex::new(HashMap::new()),
            notify: Notify::new(),
            metrics,
        }
    }

    /// The requested version of an in-flight fetch for `id`, if any.
    pub fn in_flight_lower_bound(&self, id: &ObjectId) -> Option<CausalClock> {
        self.in_flight.lock().unwrap().get(id).cloned()
    }

    /// Ensure the cache holds a version of `id` that dominates
    /// `requested_version`, fetching and retrying as needed until
    /// `deadline` elapses.
    pub async fn ensure_version(
        &self,
        id: &ObjectId,
        requested_version: &CausalClock,
        create_if_missing: bool,
        deadline: Duration,
    ) -> ScoutResult<FetchOutcome> {
        let deadline = Instant::now() + deadline;

        loop {
            if self.satisfied_by_cache(id, requested_version) {
                return Ok(FetchOutcome {
                    served_from_cache: true,
                    ..Default::default()
                });
            }

            let became_leader = {
                let mut in_flight = self.in_flight.lock().unwrap();
                if in_flight.contains_key(id) {
                    false
                } else {
                    in_flight.insert(id.clone(), requested_version.clone());
                    true
                }
            };

            if !became_leader {
                if Instant::now() >= deadline {
                    return Err(ScoutError::Network(format!(
                        "timed out waiting for in-flight fetch of {}",
                        id
                    )));
                }
                let wait = self.notify.notified();
                tokio::select! {
                    _ = wait => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
                continue;
            }

            // Own the "in flight" entry for `id` across the whole retry
            // sequence below, not just a single attempt: a notification
            // arriving mid-retry must still see this fetch as pending so
            // it never prunes `id` below `requested_version` (spec.md §8
            // scenario S6). Followers that lost the leader race above wait
            // for the entire sequence to finish, not just one attempt.
            let result = self.retry_until_resolved(id, requested_version, create_if_missing, deadline).await;
            self.in_flight.lock().unwrap().remove(id);
            self.notify.notify_waiters();
            return result;
        }
    }

    async fn retry_until_resolved(
        &self,
        id: &ObjectId,
        requested_version: &CausalClock,
        create_if_missing: bool,
        deadline: Instant,
    ) -> ScoutResult<FetchOutcome> {
        let mut backoff = INITIAL_BACKOFF;
        loop {
            match self.do_fetch(id, requested_version, create_if_missing).await {
                Ok(Some(report)) => return Ok(report),
                Ok(None) => {
                    // VERSION_MISSING: retry with backoff until the deadline.
                    if Instant::now() >= deadline {
                        return Err(ScoutError::VersionNotFound {
                            object: id.to_string(),
                            reason: "version still missing at deadline".to_string(),
                        });
                    }
                    self.metrics.record_fetch_retry();
                    tokio::time::sleep(backoff.min(deadline.saturating_duration_since(Instant::now()))).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn satisfied_by_cache(&self, id: &ObjectId, requested_version: &CausalClock) -> bool {
        self.cache
            .lock()
            .unwrap()
            .get_without_touch(id)
            .map(|c| requested_version.is_empty() || c.clock().dominates(requested_version))
            .unwrap_or(false)
    }

    /// Perform one fetch RPC. `Ok(None)` means VERSION_MISSING, signaling
    /// the caller to retry; `Err(VersionNotFound)` for VERSION_PRUNED is
    /// terminal and must not be retried.
    async fn do_fetch(
        &self,
        id: &ObjectId,
        requested_version: &CausalClock,
        create_if_missing: bool,
    ) -> ScoutResult<Option<FetchOutcome>> {
        let req = BatchFetchObjectVersionRequest {
            scout_id: self.scout_id.clone(),
            disaster_safe: self.disaster_safe,
            light_mode: false,
            fetches: vec![FetchObjectVersion {
                id: id.clone(),
                known_clock: None,
                requested_version: requested_version.clone(),
                send_more_recent_updates: true,
                subscribe_updates: false,
                create_if_missing,
            }],
        };

        let reply = self
            .transport
            .fetch(req)
            .await
            .map_err(|e| ScoutError::Network(e.to_string()))?;

        let entry = reply
            .entries
            .into_iter()
            .find(|e| &e.id == id)
            .ok_or_else(|| ScoutError::Network(format!("fetch reply missing entry for {}", id)))?;

        let report = FetchOutcome {
            served_from_cache: false,
            estimated_committed_version: reply.estimated_committed_version,
            estimated_disaster_durable_committed_version: reply.estimated_disaster_durable_committed_version,
        };

        match entry.status {
            FetchStatus::ObjectNotFound => Err(ScoutError::NoSuchObject(id.to_string())),
            FetchStatus::VersionMissing => Ok(None),
            FetchStatus::VersionPruned => Err(ScoutError::VersionNotFound {
                object: id.to_string(),
                reason: "object has been pruned past the requested version".to_string(),
            }),
            FetchStatus::UpToDate => {
                let mut cache = self.cache.lock().unwrap();
                if let Some(crdt) = cache.get_mut_without_touch(id) {
                    crdt.augment_with_dc_clock_without_mappings(&report.estimated_committed_version);
                }
                Ok(Some(report))
            }
            FetchStatus::Ok => {
                let state = entry
                    .crdt
                    .ok_or_else(|| ScoutError::Network(format!("fetch reply for {} missing crdt state", id)))?;
                self.merge_fetched_state(id, state)?;
                Ok(Some(report))
            }
        }
    }

    fn merge_fetched_state(&self, id: &ObjectId, state: FetchedCrdtState) -> ScoutResult<()> {
        let mut fetched: ManagedCrdt<V> = ManagedCrdt::new(id.clone());
        for (ts, payload) in state.ops {
            let op: V::Op = bincode::serde::decode_from_slice(&payload, bincode::config::standard())
                .map(|(op, _)| op)
                .map_err(|e| ScoutError::Codec(e.to_string()))?;
            fetched.execute(ts, op, crate::crdt::DependencyPolicy::RecordBlindly);
        }
        fetched.augment_with_dc_clock_without_mappings(&state.clock);
        fetched.prune(&state.prune_clock, false)?;

        let mut cache = self.cache.lock().unwrap();
        let need_replace = match cache.get_mut_without_touch(id) {
            Some(existing) => existing.merge(&fetched).is_err(),
            None => true,
        };
        if need_replace {
            cache.add(fetched, None);
        }
        Ok(())
    }
}
