//! Transport collaborator (§6).
//!
//! The on-wire RPC transport is a named external collaborator
//! (spec.md §1): this module only defines the interface the scout core
//! needs from it, plus an in-memory mock surrogate used by tests. A real
//! deployment would implement [`SurrogateEndpoint`] over a websocket
//! connection the way the teacher's `websocket.rs`/
//! `background_connection.rs` manage a `tokio_tungstenite` stream and a
//! background receive loop — that concrete networking code is out of
//! scope here, same as for the teacher's own CRDT-store backend.

use crate::wire::*;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Everything the scout core needs from the surrogate/sequencer.
#[async_trait]
pub trait SurrogateEndpoint: Send + Sync {
    async fn latest_known_clock(&self, req: LatestKnownClockRequest) -> anyhow::Result<LatestKnownClockReply>;

    async fn fetch(&self, req: BatchFetchObjectVersionRequest) -> anyhow::Result<BatchFetchObjectVersionReply>;

    async fn commit(&self, req: BatchCommitUpdatesRequest) -> anyhow::Result<BatchCommitUpdatesReply>;

    /// A channel of server-initiated pushes. Called once per scout at
    /// startup; subsequent calls may return `None` to indicate no further
    /// independent subscription is available.
    fn notifications(&self) -> mpsc::UnboundedReceiver<BatchUpdatesNotification>;
}

#[cfg(any(test, feature = "mock-transport"))]
pub mod mock {
    //! An in-memory surrogate used by unit and integration tests so the
    //! scout core can be exercised deterministically without a real
    //! network. Mirrors the server-side behavior spec.md §4.6/§4.8
    //! describe from the client's point of view only: it is a test
    //! double, not a reference server implementation.

    use super::*;
    use crate::clock::CausalClock;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tokio::sync::mpsc::UnboundedSender;

    #[derive(Default)]
    struct ServerObject {
        ops: Vec<(crate::clock::Timestamp, Vec<u8>)>,
        clock: CausalClock,
        prune_clock: CausalClock,
        exists: bool,
    }

    pub struct MockSurrogate {
        inner: Mutex<MockInner>,
        notify_tx: UnboundedSender<BatchUpdatesNotification>,
        notify_rx: Mutex<Option<mpsc::UnboundedReceiver<BatchUpdatesNotification>>>,
    }

    struct MockInner {
        objects: HashMap<crate::crdt::ObjectId, ServerObject>,
        committed: CausalClock,
        disaster_durable: CausalClock,
        next_counter: HashMap<String, u64>,
        /// When set, the next `fetch` call for a matching id returns
        /// `VersionMissing` instead of serving from `objects`, to exercise
        /// the retry path (S6-style scenarios).
        stall_once: Option<crate::crdt::ObjectId>,
        /// When true, every RPC fails as if the network were unreachable,
        /// to exercise the STRICTLY_MOST_RECENT-with-network-down path
        /// (spec.md §8 scenario S2).
        network_down: bool,
    }

    impl MockSurrogate {
        pub fn new() -> std::sync::Arc<Self> {
            let (tx, rx) = mpsc::unbounded_channel();
            std::sync::Arc::new(MockSurrogate {
                inner: Mutex::new(MockInner {
                    objects: HashMap::new(),
                    committed: CausalClock::new(),
                    disaster_durable: CausalClock::new(),
                    next_counter: HashMap::new(),
                    stall_once: None,
                    network_down: false,
                }),
                notify_tx: tx,
                notify_rx: Mutex::new(Some(rx)),
            })
        }

        pub fn stall_next_fetch(&self, id: crate::crdt::ObjectId) {
            self.inner.lock().unwrap().stall_once = Some(id);
        }

        pub fn set_network_down(&self, down: bool) {
            self.inner.lock().unwrap().network_down = down;
        }

        pub fn push_notification(&self, notif: BatchUpdatesNotification) {
            let _ = self.notify_tx.send(notif);
        }

        fn next_system_ts(inner: &mut MockInner) -> crate::clock::Timestamp {
            let counter = inner.next_counter.entry("dc1".to_string()).or_insert(0);
            *counter += 1;
            crate::clock::Timestamp::new("dc1", *counter)
        }
    }

    #[async_trait]
    impl SurrogateEndpoint for MockSurrogate {
        async fn latest_known_clock(&self, _req: LatestKnownClockRequest) -> anyhow::Result<LatestKnownClockReply> {
            let inner = self.inner.lock().unwrap();
            if inner.network_down {
                anyhow::bail!("mock surrogate: network is down");
            }
            Ok(LatestKnownClockReply {
                clock: inner.committed.clone(),
                disaster_durable_clock: inner.disaster_durable.clone(),
            })
        }

        async fn fetch(&self, req: BatchFetchObjectVersionRequest) -> anyhow::Result<BatchFetchObjectVersionReply> {
            let mut inner = self.inner.lock().unwrap();
            if inner.network_down {
                anyhow::bail!("mock surrogate: network is down");
            }
            let mut entries = Vec::new();
            for f in req.fetches {
                if inner.stall_once.as_ref() == Some(&f.id) {
                    inner.stall_once = None;
                    entries.push(BatchFetchObjectVersionReplyEntry {
                        id: f.id,
                        status: FetchStatus::VersionMissing,
                        crdt: None,
                    });
                    continue;
                }
                match inner.objects.get(&f.id) {
                    None if !f.create_if_missing => {
                        entries.push(BatchFetchObjectVersionReplyEntry {
                            id: f.id,
                            status: FetchStatus::ObjectNotFound,
                            crdt: None,
                        });
                    }
                    None => {
                        inner.objects.insert(f.id.clone(), ServerObject { exists: true, ..Default::default() });
                        entries.push(BatchFetchObjectVersionReplyEntry {
                            id: f.id,
                            status: FetchStatus::Ok,
                            crdt: Some(FetchedCrdtState {
                                ops: Vec::new(),
                                clock: CausalClock::new(),
                                prune_clock: CausalClock::new(),
                            }),
                        });
                    }
                    Some(obj) => {
                        if f.requested_version.dominates(&obj.clock) && !f.requested_version.is_empty() {
                            entries.push(BatchFetchObjectVersionReplyEntry {
                                id: f.id,
                                status: FetchStatus::UpToDate,
                                crdt: None,
                            });
                        } else {
                            entries.push(BatchFetchObjectVersionReplyEntry {
                                id: f.id,
                                status: FetchStatus::Ok,
                                crdt: Some(FetchedCrdtState {
                                    ops: obj.ops.clone(),
                                    clock: obj.clock.clone(),
                                    prune_clock: obj.prune_clock.clone(),
                                }),
                            });
                        }
                    }
                }
            }
            Ok(BatchFetchObjectVersionReply {
                entries,
                estimated_committed_version: inner.committed.clone(),
                estimated_disaster_durable_committed_version: inner.disaster_durable.clone(),
            })
        }

        async fn commit(&self, req: BatchCommitUpdatesRequest) -> anyhow::Result<BatchCommitUpdatesReply> {
            let mut inner = self.inner.lock().unwrap();
            if inner.network_down {
                anyhow::bail!("mock surrogate: network is down");
            }
            let mut replies = Vec::new();
            for r in req.requests {
                let sys_ts = Self::next_system_ts(&mut inner);
                for group in &r.ops_groups {
                    let obj = inner.objects.entry(group.id.clone()).or_insert_with(|| ServerObject {
                        exists: true,
                        ..Default::default()
                    });
                    for op in &group.ops {
                        obj.ops.push((sys_ts.clone(), op.clone()));
                    }
                    obj.clock.record(&sys_ts);
                }
                inner.committed.record(&sys_ts);
                replies.push(CommitUpdatesReply::CommittedWithKnownTimestamps {
                    system_timestamps: vec![sys_ts],
                });
            }
            Ok(BatchCommitUpdatesReply { replies })
        }

        fn notifications(&self) -> mpsc::UnboundedReceiver<BatchUpdatesNotification> {
            self.notify_rx
                .lock()
                .unwrap()
                .take()
                .expect("notifications() called more than once on MockSurrogate")
        }
    }
}
