//! The scout core (C6): transaction lifecycle orchestration. Owns the
//! cache, the committer, the fetch pipeline, and the subscription
//! registry, and is the only place that advances a [`TxnHandle`] through
//! its state machine.
//!
//! Each piece of shared state (the cache, the scout's view of the
//! committed clock, the pending-transaction table) is behind its own
//! `Mutex` rather than a single giant one: spec.md §5 asks for "one
//! coarse mutex protecting all shared mutable state" to keep the
//! concurrency model easy to reason about, but the fetch pipeline and
//! committer both need to make network calls while holding a lock on
//! their piece of state, and folding everything into one lock would
//! serialize unrelated in-flight fetches behind a single commit RPC.
//! Each lock here is still coarse relative to what it protects — there
//! is one lock for the whole cache, not one per entry — so the spirit of
//! "few, simple locks" is kept; see `DESIGN.md` for the tradeoff.

use crate::cache::{EvictionListener, ObjectCache};
use crate::clock::CausalClock;
use crate::commitlog::CommitLog;
use crate::committer::{CommitAck, CommitRequest, Committer};
use crate::config::{CacheUpdateProtocol, ScoutConfig};
use crate::crdt::{CrdtValue, DependencyPolicy, ManagedCrdt, ObjectId};
use crate::error::{ScoutError, ScoutResult};
use crate::fetch::FetchPipeline;
use crate::metrics::ScoutMetrics;
use crate::session::SwiftSession;
use crate::subscription::{Listener, SubscriptionRegistry};
use crate::timestamp::TimestampSource;
use crate::transport::SurrogateEndpoint;
use crate::txn::{BufferedOp, CachePolicy, IsolationLevel, SessionId, TxnHandle, TxnStatus};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

pub struct Scout<V: CrdtValue> {
    config: ScoutConfig,
    scout_id: String,
    timestamp_source: TimestampSource,
    transport: Arc<dyn SurrogateEndpoint>,
    cache: Arc<Mutex<ObjectCache<V>>>,
    committed_clock: Arc<Mutex<CausalClock>>,
    disaster_durable_clock: Arc<Mutex<CausalClock>>,
    fetch_pipeline: Arc<FetchPipeline<V>>,
    commit_tx: Mutex<Option<mpsc::Sender<CommitRequest>>>,
    commit_log: Option<Arc<Mutex<CommitLog>>>,
    pending_txns: Mutex<HashMap<u64, TxnHandle>>,
    next_serial: AtomicU64,
    subscriptions: Arc<SubscriptionRegistry>,
    metrics: Arc<ScoutMetrics>,
    committer_handle: Mutex<Option<JoinHandle<()>>>,
    notification_handle: Mutex<Option<JoinHandle<()>>>,
}

impl<V: CrdtValue> Scout<V> {
    pub fn new(config: ScoutConfig, scout_id: impl Into<String>, transport: Arc<dyn SurrogateEndpoint>) -> ScoutResult<Arc<Self>> {
        config.validate()?;
        let scout_id = scout_id.into();

        let commit_log = match &config.log_filename {
            Some(path) => Some(Arc::new(Mutex::new(CommitLog::open(std::path::Path::new(path))?))),
            None => None,
        };

        let metrics = Arc::new(ScoutMetrics::new());
        let subscriptions = Arc::new(SubscriptionRegistry::new());

        let mut object_cache = ObjectCache::new(config.cache_size, config.cache_eviction_ttl());
        object_cache.add_eviction_listener(Box::new(MetricsEvictionListener { metrics: metrics.clone() }));
        object_cache.add_eviction_listener(Box::new(SubscriptionEvictionListener {
            subscriptions: subscriptions.clone(),
        }));
        let cache = Arc::new(Mutex::new(object_cache));
        let committed_clock = Arc::new(Mutex::new(CausalClock::new()));
        let disaster_durable_clock = Arc::new(Mutex::new(CausalClock::new()));

        let fetch_pipeline = Arc::new(FetchPipeline::new(
            transport.clone(),
            scout_id.clone(),
            config.disaster_safe,
            cache.clone(),
            metrics.clone(),
        ));

        let (committer, commit_tx) = Committer::new(
            transport.clone(),
            scout_id.clone(),
            &config,
            cache.clone(),
            committed_clock.clone(),
            commit_log.clone(),
        );

        // Resubmit any commits that were durably logged but whose ack was
        // never observed (process died mid-commit). The channel has not
        // started draining yet, so `try_send` only fails if the replayed
        // backlog exceeds the configured queue capacity.
        if let Some(path) = &config.log_filename {
            match CommitLog::replay::<crate::wire::CommitUpdatesRequest>(std::path::Path::new(path)) {
                Ok(records) if !records.is_empty() => {
                    log::info!("replaying {} commit-log record(s) for scout {}", records.len(), scout_id);
                    for rec in records {
                        let (respond, _ack) = oneshot::channel();
                        let op_groups: HashMap<ObjectId, Vec<Vec<u8>>> =
                            rec.ops_groups.into_iter().map(|g| (g.id, g.ops)).collect();
                        let request = CommitRequest {
                            serial: 0,
                            protection_serial: 0,
                            client_timestamp: rec.client_timestamp,
                            dependency_clock: rec.dependency_clock,
                            op_groups,
                            respond,
                        };
                        if commit_tx.try_send(request).is_err() {
                            log::warn!("commit log replay queue full, dropping a replayed record for scout {}", scout_id);
                        }
                    }
                }
                Ok(_) => {}
                Err(e) => log::warn!("failed to replay commit log for scout {}: {e}", scout_id),
            }
        }

        let committer_handle = tokio::spawn(committer.run());

        let notification_handle = match config.cache_update_protocol {
            CacheUpdateProtocol::NoCacheOrUncoordinated => None,
            CacheUpdateProtocol::CausalNotificationsStream => Some({
                let mut rx = transport.notifications();
                let cache = cache.clone();
                let committed_clock = committed_clock.clone();
                let subscriptions = subscriptions.clone();
                let fetch_pipeline = fetch_pipeline.clone();
                tokio::spawn(async move {
                    while let Some(notif) = rx.recv().await {
                        committed_clock.lock().unwrap().merge(&notif.new_version);
                        let committed_snapshot = committed_clock.lock().unwrap().clone();
                        let mut cache = cache.lock().unwrap();
                        for group in notif.updates {
                            if cache.get_without_touch(&group.id).is_none() {
                                cache.add(ManagedCrdt::<V>::new(group.id.clone()), None);
                            }
                            let crdt = cache.get_mut_without_touch(&group.id).unwrap();
                            for (ts, payload) in &group.ops {
                                if let Ok((op, _)) =
                                    bincode::serde::decode_from_slice::<V::Op, _>(payload, bincode::config::standard())
                                {
                                    // A push notification may arrive out of
                                    // causal order relative to what this scout
                                    // already knows, so replays must be
                                    // tolerated rather than rejected.
                                    crdt.execute(ts.clone(), op, DependencyPolicy::Ignore);
                                }
                            }

                            // Opportunistically fold the newly-covered prefix
                            // of history into the checkpoint. Never prune past
                            // the lower bound of a fetch currently in flight
                            // for this object, or the fetch would read a gap
                            // the surrogate has already been told it can
                            // discard (spec.md §8 scenario S6).
                            let mut prune_point = notif.new_version.intersected(crdt.clock());
                            if let Some(floor) = fetch_pipeline.in_flight_lower_bound(&group.id) {
                                prune_point.intersect(&floor);
                            }
                            let _ = crdt.prune(&prune_point, false);

                            subscriptions.notify_object_updated(&group.id);
                            subscriptions.fire_ready_listeners(&group.id, &committed_snapshot);
                        }
                    }
                    log::info!("notification listener shutting down");
                })
            }),
            CacheUpdateProtocol::CausalPeriodicRefresh => Some({
                let transport = transport.clone();
                let committed_clock = committed_clock.clone();
                let disaster_durable_clock = disaster_durable_clock.clone();
                let subscriptions = subscriptions.clone();
                let scout_id = scout_id.clone();
                let disaster_safe = config.disaster_safe;
                let period = config.cache_refresh_period();
                tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(period);
                    loop {
                        ticker.tick().await;
                        let reply = transport
                            .latest_known_clock(crate::wire::LatestKnownClockRequest {
                                scout_id: scout_id.clone(),
                                disaster_safe,
                            })
                            .await;
                        match reply {
                            Ok(reply) => {
                                committed_clock.lock().unwrap().merge(&reply.clock);
                                disaster_durable_clock.lock().unwrap().merge(&reply.disaster_durable_clock);
                                let snapshot = committed_clock.lock().unwrap().clone();
                                subscriptions.fire_all_ready(&snapshot);
                            }
                            Err(e) => log::warn!("periodic cache refresh failed for scout {}: {e}", scout_id),
                        }
                    }
                })
            }),
        };

        Ok(Arc::new(Scout {
            config,
            scout_id,
            timestamp_source: TimestampSource::new("scout-local"),
            transport,
            cache,
            committed_clock,
            disaster_durable_clock,
            fetch_pipeline,
            commit_tx: Mutex::new(Some(commit_tx)),
            commit_log,
            pending_txns: Mutex::new(HashMap::new()),
            next_serial: AtomicU64::new(1),
            subscriptions,
            metrics,
            committer_handle: Mutex::new(Some(committer_handle)),
            notification_handle: Mutex::new(notification_handle),
        }))
    }

    pub fn new_session(self: &Arc<Self>, session_id: impl Into<SessionId>) -> SwiftSession<V> {
        SwiftSession::new(self.clone(), session_id.into())
    }

    pub fn metrics(&self) -> &ScoutMetrics {
        &self.metrics
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionRegistry> {
        &self.subscriptions
    }

    fn reference_clock(&self) -> CausalClock {
        if self.config.disaster_safe {
            self.disaster_durable_clock.lock().unwrap().clone()
        } else {
            self.committed_clock.lock().unwrap().clone()
        }
    }

    /// Begin a transaction. STRICTLY_MOST_RECENT requires the scout's
    /// view of the reference clock to be fresh as of this instant, which
    /// means contacting the surrogate: if that RPC fails, begin fails
    /// with NETWORK, nothing is written, and the client timestamp is
    /// never issued (spec.md §8 scenario S2).
    pub(crate) async fn begin_txn(
        &self,
        session_id: SessionId,
        isolation: IsolationLevel,
        cache_policy: CachePolicy,
        read_only: bool,
    ) -> ScoutResult<u64> {
        if cache_policy == CachePolicy::StrictlyMostRecent {
            let reply = self
                .transport
                .latest_known_clock(crate::wire::LatestKnownClockRequest {
                    scout_id: self.scout_id.clone(),
                    disaster_safe: self.config.disaster_safe,
                })
                .await
                .map_err(|e| ScoutError::Network(e.to_string()))?;
            self.committed_clock.lock().unwrap().merge(&reply.clock);
            self.disaster_durable_clock.lock().unwrap().merge(&reply.disaster_durable_clock);
        }

        let mut pending = self.pending_txns.lock().unwrap();
        if !self.config.concurrent_open_transactions && !pending.is_empty() {
            return Err(ScoutError::IllegalState(
                "concurrent_open_transactions is disabled and a transaction is already open".to_string(),
            ));
        }

        let client_ts = self.timestamp_source.generate_new();
        let serial = self.next_serial.fetch_add(1, Ordering::SeqCst);
        let snapshot_clock = self.reference_clock();
        let handle = TxnHandle::new(
            serial,
            session_id,
            crate::timestamp::TimestampMapping::new(client_ts),
            isolation,
            cache_policy,
            read_only,
            snapshot_clock,
        );
        pending.insert(serial, handle);
        Ok(serial)
    }

    pub(crate) fn txn_status(&self, serial: u64) -> ScoutResult<TxnStatus> {
        self.pending_txns
            .lock()
            .unwrap()
            .get(&serial)
            .map(|t| t.status())
            .ok_or_else(|| ScoutError::IllegalState(format!("no such transaction {serial}")))
    }

    pub(crate) async fn get(
        &self,
        serial: u64,
        id: &ObjectId,
        create_if_missing: bool,
        listener: Option<Listener>,
    ) -> ScoutResult<V> {
        if id.type_tag != V::TYPE_TAG {
            return Err(ScoutError::WrongType {
                object: id.to_string(),
                cached: id.type_tag,
                requested: V::TYPE_TAG,
            });
        }

        let (read_clock, cache_policy) = {
            let pending = self.pending_txns.lock().unwrap();
            let txn = pending
                .get(&serial)
                .ok_or_else(|| ScoutError::IllegalState(format!("no such transaction {serial}")))?;
            (txn.read_clock_for(id).clone(), txn.cache_policy)
        };

        let requested_version = match cache_policy {
            CachePolicy::Cached => CausalClock::new(),
            CachePolicy::MostRecent => read_clock.clone(),
            CachePolicy::StrictlyMostRecent => read_clock.merged(&self.reference_clock()),
        };

        let outcome = self
            .fetch_pipeline
            .ensure_version(id, &requested_version, create_if_missing, self.config.deadline())
            .await?;
        if outcome.served_from_cache {
            self.metrics.record_cache_hit();
        } else {
            self.metrics.record_cache_miss();
            if !outcome.estimated_committed_version.is_empty() {
                self.committed_clock.lock().unwrap().merge(&outcome.estimated_committed_version);
            }
            if !outcome.estimated_disaster_durable_committed_version.is_empty() {
                self.disaster_durable_clock
                    .lock()
                    .unwrap()
                    .merge(&outcome.estimated_disaster_durable_committed_version);
            }
        }

        let observed_clock = {
            let mut cache = self.cache.lock().unwrap();
            // Protect the entry for the lifetime of this transaction: it
            // must survive size-based eviction even if a later read in
            // the same or another transaction brings the cache over
            // capacity (spec.md §8 scenario S3).
            cache.protect(id, serial);
            let crdt = cache
                .get_without_touch(id)
                .ok_or_else(|| ScoutError::NoSuchObject(id.to_string()))?;
            crdt.clock().clone()
        };

        // A listener argument means the caller wants to learn about the
        // first update strictly newer than what it is about to read; it
        // is armed against the clock observed right now, before the
        // dependency bookkeeping below (spec.md §4.6 step 1).
        if let Some(listener) = listener {
            self.subscriptions.register_listener(id.clone(), observed_clock.clone(), listener);
        }

        let mut pending = self.pending_txns.lock().unwrap();
        let txn = pending
            .get_mut(&serial)
            .ok_or_else(|| ScoutError::IllegalState(format!("no such transaction {serial}")))?;
        txn.record_read_dependency(&observed_clock)?;
        txn.freeze_rr_version(id, observed_clock)?;

        let base = {
            let cache = self.cache.lock().unwrap();
            let crdt = cache
                .get_without_touch(id)
                .ok_or_else(|| ScoutError::NoSuchObject(id.to_string()))?;
            crdt.get_version(txn.read_clock_for(id))?
        };

        // Read-your-writes: fold this transaction's own still-uncommitted
        // buffered ops for `id` on top of the materialized snapshot,
        // without mutating the shared cache entry other sessions see.
        let mut value = base;
        if let Some(ops) = txn.op_groups().get(id) {
            for op in ops {
                let decoded: V::Op = bincode::serde::decode_from_slice(&op.payload, bincode::config::standard())
                    .map(|(op, _)| op)
                    .map_err(|e| ScoutError::Codec(e.to_string()))?;
                value.apply(&decoded);
            }
        }
        Ok(value)
    }

    pub(crate) fn put(&self, serial: u64, id: ObjectId, op: &V::Op) -> ScoutResult<()> {
        if id.type_tag != V::TYPE_TAG {
            return Err(ScoutError::WrongType {
                object: id.to_string(),
                cached: id.type_tag,
                requested: V::TYPE_TAG,
            });
        }
        let payload = bincode::serde::encode_to_vec(op, bincode::config::standard())
            .map_err(|e| ScoutError::Codec(e.to_string()))?;
        let mut pending = self.pending_txns.lock().unwrap();
        let txn = pending
            .get_mut(&serial)
            .ok_or_else(|| ScoutError::IllegalState(format!("no such transaction {serial}")))?;
        txn.put(id, BufferedOp { payload })
    }

    /// Discard a transaction. If it never wrote anything, its client
    /// timestamp is simply handed back to the timestamp source and no
    /// counter value is ever consumed. If it had buffered writes, those
    /// writes are thrown away but a dummy commit carrying no ops still
    /// has to reach the surrogate: the client timestamp was already
    /// issued, and other scouts must never see a permanent gap at that
    /// counter for a write that could have causally preceded something
    /// else (spec.md §8 scenario S5).
    pub(crate) async fn discard_txn(&self, serial: u64) -> ScoutResult<()> {
        let had_updates = {
            let pending = self.pending_txns.lock().unwrap();
            pending
                .get(&serial)
                .ok_or_else(|| ScoutError::IllegalState(format!("no such transaction {serial}")))?
                .has_updates()
        };

        if !had_updates {
            let mut pending = self.pending_txns.lock().unwrap();
            let txn = pending.get_mut(&serial).unwrap();
            txn.mark_cancelled()?;
            self.timestamp_source.return_last_timestamp();
            pending.remove(&serial);
            self.cache.lock().unwrap().release_protection(serial);
            return Ok(());
        }

        let (client_timestamp, dependency_clock) = {
            let pending = self.pending_txns.lock().unwrap();
            let txn = pending.get(&serial).unwrap();
            (txn.client_timestamp().clone(), txn.updates_dependency_clock.clone())
        };
        self.timestamp_source.mark_consumed();
        let ack = self.ship_commit(serial, client_timestamp, dependency_clock, HashMap::new()).await;

        let mut pending = self.pending_txns.lock().unwrap();
        let txn = pending.get_mut(&serial).unwrap();
        ack?;
        txn.mark_cancelled()?;
        pending.remove(&serial);
        Ok(())
    }

    /// Hand a batch of ops (possibly empty, for a dummy commit) to the
    /// committer and await its outcome. The bounded channel send is the
    /// backpressure point spec.md §4.6 describes: once the queue is
    /// full, this await blocks the calling session until the committer
    /// drains it.
    async fn ship_commit(
        &self,
        serial: u64,
        client_timestamp: crate::clock::Timestamp,
        dependency_clock: CausalClock,
        op_groups: HashMap<ObjectId, Vec<Vec<u8>>>,
    ) -> ScoutResult<CommitAck> {
        let (ack_tx, ack_rx) = oneshot::channel();
        let request = CommitRequest {
            serial,
            protection_serial: serial,
            client_timestamp,
            dependency_clock,
            op_groups,
            respond: ack_tx,
        };

        let commit_tx = {
            let commit_tx = self.commit_tx.lock().unwrap();
            commit_tx
                .clone()
                .ok_or_else(|| ScoutError::IllegalState("scout has been stopped".to_string()))?
        };
        commit_tx
            .send(request)
            .await
            .map_err(|_| ScoutError::IllegalState("committer task is no longer running".to_string()))?;

        ack_rx
            .await
            .map_err(|_| ScoutError::Network("committer dropped the commit response channel".to_string()))?
    }

    pub(crate) async fn commit_txn(&self, serial: u64) -> ScoutResult<TxnStatus> {
        if !{
            let pending = self.pending_txns.lock().unwrap();
            pending
                .get(&serial)
                .ok_or_else(|| ScoutError::IllegalState(format!("no such transaction {serial}")))?
                .has_updates()
        } {
            let mut pending = self.pending_txns.lock().unwrap();
            let txn = pending.get_mut(&serial).unwrap();
            txn.mark_committed_local()?;
            txn.mark_committed_global()?;
            self.timestamp_source.return_last_timestamp();
            pending.remove(&serial);
            self.cache.lock().unwrap().release_protection(serial);
            return Ok(TxnStatus::CommittedGlobal);
        }

        let (client_timestamp, dependency_clock, op_groups) = {
            let mut pending = self.pending_txns.lock().unwrap();
            let txn = pending.get_mut(&serial).unwrap();

            let mut cache = self.cache.lock().unwrap();
            for (id, ops) in txn.op_groups() {
                if cache.get_without_touch(id).is_none() {
                    cache.add(ManagedCrdt::<V>::new(id.clone()), Some(serial));
                } else {
                    cache.protect(id, serial);
                }
                let crdt = cache.get_mut_without_touch(id).unwrap();
                for op in ops {
                    let decoded: V::Op = bincode::serde::decode_from_slice(&op.payload, bincode::config::standard())
                        .map(|(op, _)| op)
                        .map_err(|e| ScoutError::Codec(e.to_string()))?;
                    crdt.execute(txn.client_timestamp().clone(), decoded, DependencyPolicy::RecordBlindly);
                }
            }
            drop(cache);

            txn.mark_committed_local()?;
            self.timestamp_source.mark_consumed();

            let op_groups: HashMap<ObjectId, Vec<Vec<u8>>> = txn
                .op_groups()
                .iter()
                .map(|(id, ops)| (id.clone(), ops.iter().map(|o| o.payload.clone()).collect()))
                .collect();
            (txn.client_timestamp().clone(), txn.updates_dependency_clock.clone(), op_groups)
        };

        let ack = self.ship_commit(serial, client_timestamp, dependency_clock, op_groups.clone()).await;

        let mut pending = self.pending_txns.lock().unwrap();
        let txn = pending.get_mut(&serial).unwrap();
        match ack {
            Ok(CommitAck::Timestamps(_)) | Ok(CommitAck::ClockRange(_)) => {
                txn.mark_committed_global()?;
                pending.remove(&serial);
                self.subscriptions.notify_many(op_groups.keys());
                // A write becoming globally visible satisfies any listener
                // armed against a snapshot older than it, including ones
                // registered by this very transaction's own earlier reads
                // (spec.md §4.9's `uncommittedUpdatesObjectsToNotify`):
                // the writer learns of its own commit without waiting on
                // a push round trip.
                let committed_snapshot = self.committed_clock.lock().unwrap().clone();
                for id in op_groups.keys() {
                    self.subscriptions.fire_ready_listeners(id, &committed_snapshot);
                }
                Ok(TxnStatus::CommittedGlobal)
            }
            Err(e) => {
                pending.remove(&serial);
                self.cache.lock().unwrap().release_protection(serial);
                Err(e)
            }
        }
    }

    /// Stop the scout's background tasks. `graceful` drains any
    /// already-queued commits through the committer before returning;
    /// otherwise both background tasks are aborted immediately.
    pub async fn stop(&self, graceful: bool) {
        if graceful {
            self.commit_tx.lock().unwrap().take();
            if let Some(handle) = self.committer_handle.lock().unwrap().take() {
                let _ = handle.await;
            }
        } else {
            self.commit_tx.lock().unwrap().take();
            if let Some(handle) = self.committer_handle.lock().unwrap().take() {
                handle.abort();
            }
        }
        if let Some(handle) = self.notification_handle.lock().unwrap().take() {
            handle.abort();
        }
        if let Some(log) = &self.commit_log {
            if let Err(e) = log.lock().unwrap().close() {
                log::warn!("failed to close commit log for scout {}: {e}", self.scout_id);
            }
        }
    }
}

struct MetricsEvictionListener {
    metrics: Arc<ScoutMetrics>,
}

impl<V: CrdtValue> EvictionListener<V> for MetricsEvictionListener {
    fn on_evict(&self, _id: &ObjectId) {
        self.metrics.record_cache_eviction();
    }
}

/// Drops any dangling subscription or pending listener for an object
/// that the cache has evicted, so a later re-fetch of the same id starts
/// with a clean subscription state (spec.md §4.4).
struct SubscriptionEvictionListener {
    subscriptions: Arc<SubscriptionRegistry>,
}

impl<V: CrdtValue> EvictionListener<V> for SubscriptionEvictionListener {
    fn on_evict(&self, id: &ObjectId) {
        self.subscriptions.remove_object(id);
    }
}
