//! End-to-end behavioral tests for the scout, exercised against the
//! in-memory mock surrogate. Each test targets one cross-cutting
//! guarantee the unit tests in `src/` can't reach on their own because
//! it only shows up once transactions, the cache, the fetch pipeline and
//! the committer are wired together.

use std::sync::Arc;
use std::time::Duration;

use swiftcloud_scout::cache::ObjectCache;
use swiftcloud_scout::clock::CausalClock;
use swiftcloud_scout::config::ScoutConfig;
use swiftcloud_scout::crdt::{Counter, CrdtValue, ObjectId};
use swiftcloud_scout::fetch::FetchPipeline;
use swiftcloud_scout::scout::Scout;
use swiftcloud_scout::testutil::init_test_logger;
use swiftcloud_scout::transport::mock::MockSurrogate;
use swiftcloud_scout::transport::SurrogateEndpoint;
use swiftcloud_scout::txn::{CachePolicy, IsolationLevel};

fn oid(key: &str) -> ObjectId {
    ObjectId::new("accounts", key, Counter::TYPE_TAG)
}

fn config(cache_size: usize) -> ScoutConfig {
    ScoutConfig {
        cache_size,
        concurrent_open_transactions: true,
        deadline_millis: 2_000,
        ..ScoutConfig::default()
    }
}

#[tokio::test]
async fn own_uncommitted_write_is_visible_to_the_writer_but_not_to_other_sessions() {
    init_test_logger();
    let transport = MockSurrogate::new();
    let scout = Scout::<Counter>::new(config(10), "scout-1", transport).unwrap();

    let writer = scout.new_session("writer");
    let reader = scout.new_session("reader");
    let id = oid("alice");

    let txn = writer
        .begin_txn(IsolationLevel::SnapshotIsolation, CachePolicy::Cached, false)
        .await
        .unwrap();
    txn.put(id.clone(), 10).unwrap();

    // The writer reads its own uncommitted write back immediately. The
    // object has never been committed anywhere yet, so this read must
    // create it.
    let seen_by_writer = txn.get(&id, true, None).await.unwrap();
    assert_eq!(seen_by_writer.0, 10);

    // A concurrent reader must not observe it before commit.
    let other_txn = reader
        .begin_txn(IsolationLevel::SnapshotIsolation, CachePolicy::Cached, true)
        .await
        .unwrap();
    let seen_by_other = other_txn.get(&id, true, None).await.unwrap();
    assert_eq!(seen_by_other.0, 0);
    other_txn.discard().await.unwrap();

    txn.commit().await.unwrap();

    let after_commit = reader
        .begin_txn(IsolationLevel::SnapshotIsolation, CachePolicy::Cached, true)
        .await
        .unwrap();
    assert_eq!(after_commit.get(&id, false, None).await.unwrap().0, 10);

    scout.stop(true).await;
}

#[tokio::test]
async fn strictly_most_recent_begin_fails_fast_when_the_surrogate_is_unreachable() {
    init_test_logger();
    let transport = MockSurrogate::new();
    transport.set_network_down(true);
    let scout = Scout::<Counter>::new(config(10), "scout-1", transport.clone()).unwrap();
    let session = scout.new_session("s1");

    let err = session
        .begin_txn(IsolationLevel::SnapshotIsolation, CachePolicy::StrictlyMostRecent, true)
        .await
        .unwrap_err();
    assert!(matches!(err, swiftcloud_scout::ScoutError::Network(_)));

    // Once the network recovers, ordinary transactions still work and no
    // lasting damage was done by the failed attempt.
    transport.set_network_down(false);
    let txn = session
        .begin_txn(IsolationLevel::SnapshotIsolation, CachePolicy::Cached, false)
        .await
        .unwrap();
    txn.put(oid("alice"), 3).unwrap();
    txn.commit().await.unwrap();

    scout.stop(true).await;
}

#[tokio::test]
async fn an_open_read_handle_protects_its_object_from_size_based_eviction() {
    init_test_logger();
    let transport = MockSurrogate::new();

    // Seed "alice" and "bob" on the shared mock surrogate through a
    // separate, generously-sized scout so the object-under-test below
    // starts life with a cache capacity of exactly one.
    let seeder_scout = Scout::<Counter>::new(config(10), "seeder", transport.clone()).unwrap();
    let seeder = seeder_scout.new_session("seeder-session");
    for key in ["alice", "bob", "carol"] {
        let txn = seeder
            .begin_txn(IsolationLevel::SnapshotIsolation, CachePolicy::Cached, false)
            .await
            .unwrap();
        txn.put(oid(key), 1).unwrap();
        txn.commit().await.unwrap();
    }
    seeder_scout.stop(true).await;

    let scout = Scout::<Counter>::new(config(1), "scout-1", transport).unwrap();
    let session = scout.new_session("s1");

    let txn = session
        .begin_txn(IsolationLevel::SnapshotIsolation, CachePolicy::Cached, true)
        .await
        .unwrap();
    txn.get(&oid("alice"), false, None).await.unwrap();
    txn.get(&oid("bob"), false, None).await.unwrap();

    // Both reads happened under the same still-open handle, so neither
    // "alice" nor "bob" should have been evicted despite a capacity of 1.
    assert_eq!(scout.metrics().snapshot().cache_evictions, 0);

    txn.discard().await.unwrap();

    // Only once the handle releases its protection does a further fetch
    // bring the cache back down to its configured size.
    let txn2 = session
        .begin_txn(IsolationLevel::SnapshotIsolation, CachePolicy::Cached, true)
        .await
        .unwrap();
    txn2.get(&oid("carol"), false, None).await.unwrap();
    txn2.discard().await.unwrap();

    assert!(scout.metrics().snapshot().cache_evictions >= 1);

    scout.stop(true).await;
}

#[tokio::test]
async fn subscriber_is_woken_only_for_the_object_it_subscribed_to() {
    init_test_logger();
    let transport = MockSurrogate::new();
    let scout = Scout::<Counter>::new(config(10), "scout-1", transport.clone()).unwrap();

    let alice = oid("alice");
    let bob = oid("bob");
    let handle = scout.subscriptions().subscribe("watcher".to_string(), alice.clone());

    let payload = bincode::serde::encode_to_vec(5i64, bincode::config::standard()).unwrap();
    transport.push_notification(swiftcloud_scout::wire::BatchUpdatesNotification {
        scout_id: "scout-1".to_string(),
        new_version: {
            let mut c = CausalClock::new();
            c.record(&swiftcloud_scout::clock::Timestamp::new("dc1", 1));
            c
        },
        is_disaster_safe: false,
        updates: vec![swiftcloud_scout::wire::NotifiedOpsGroup {
            id: bob.clone(),
            ops: vec![(swiftcloud_scout::clock::Timestamp::new("dc1", 1), payload.clone())],
        }],
    });

    // The push only touched "bob"; the "alice" subscriber must not fire.
    assert!(tokio::time::timeout(Duration::from_millis(50), handle.wait_for_update())
        .await
        .is_err());

    transport.push_notification(swiftcloud_scout::wire::BatchUpdatesNotification {
        scout_id: "scout-1".to_string(),
        new_version: {
            let mut c = CausalClock::new();
            c.record(&swiftcloud_scout::clock::Timestamp::new("dc1", 2));
            c
        },
        is_disaster_safe: false,
        updates: vec![swiftcloud_scout::wire::NotifiedOpsGroup {
            id: alice.clone(),
            ops: vec![(swiftcloud_scout::clock::Timestamp::new("dc1", 2), payload)],
        }],
    });

    tokio::time::timeout(Duration::from_millis(200), handle.wait_for_update())
        .await
        .expect("subscriber should be woken once its own object is updated");

    scout.stop(true).await;
}

#[tokio::test]
async fn a_read_listener_fires_once_a_newer_commit_becomes_globally_visible() {
    init_test_logger();
    let transport = MockSurrogate::new();
    let scout = Scout::<Counter>::new(config(10), "scout-1", transport).unwrap();
    let id = oid("alice");

    let reader = scout.new_session("reader");
    let read_txn = reader
        .begin_txn(IsolationLevel::SnapshotIsolation, CachePolicy::Cached, true)
        .await
        .unwrap();

    let notify = Arc::new(tokio::sync::Notify::new());
    let notify_clone = notify.clone();
    read_txn
        .get(&id, true, Some(Box::new(move || notify_clone.notify_one())))
        .await
        .unwrap();
    read_txn.discard().await.unwrap();

    // No newer write has happened yet.
    assert!(tokio::time::timeout(Duration::from_millis(20), notify.notified())
        .await
        .is_err());

    let writer = scout.new_session("writer");
    let write_txn = writer
        .begin_txn(IsolationLevel::SnapshotIsolation, CachePolicy::Cached, false)
        .await
        .unwrap();
    write_txn.put(id.clone(), 9).unwrap();
    write_txn.commit().await.unwrap();

    // The commit becoming globally visible fires the listener, even though
    // it was a different session's transaction that wrote the update.
    tokio::time::timeout(Duration::from_millis(200), notify.notified())
        .await
        .expect("listener should fire once a strictly newer write is globally visible");

    scout.stop(true).await;
}

#[tokio::test]
async fn discarding_a_transaction_with_buffered_writes_still_advances_the_global_clock() {
    init_test_logger();
    let transport = MockSurrogate::new();
    let scout = Scout::<Counter>::new(config(10), "scout-1", transport.clone()).unwrap();
    let session = scout.new_session("s1");

    let before = transport
        .latest_known_clock(swiftcloud_scout::wire::LatestKnownClockRequest {
            scout_id: "scout-1".to_string(),
            disaster_safe: false,
        })
        .await
        .unwrap()
        .clock;

    let txn = session
        .begin_txn(IsolationLevel::SnapshotIsolation, CachePolicy::Cached, false)
        .await
        .unwrap();
    txn.put(oid("alice"), 7).unwrap();
    txn.discard().await.unwrap();

    let after = transport
        .latest_known_clock(swiftcloud_scout::wire::LatestKnownClockRequest {
            scout_id: "scout-1".to_string(),
            disaster_safe: false,
        })
        .await
        .unwrap()
        .clock;

    // The discard still shipped a dummy commit carrying the abandoned
    // transaction's client timestamp, so the store's clock moved forward
    // even though no operation was ever actually applied to "alice".
    assert_ne!(before, after);

    // Other scouts requesting a version at or below the new clock must
    // not see a permanent gap at the abandoned write's slot.
    let reply = transport
        .fetch(swiftcloud_scout::wire::BatchFetchObjectVersionRequest {
            scout_id: "scout-2".to_string(),
            disaster_safe: false,
            light_mode: false,
            fetches: vec![swiftcloud_scout::wire::FetchObjectVersion {
                id: oid("alice"),
                known_clock: None,
                requested_version: CausalClock::new(),
                send_more_recent_updates: true,
                subscribe_updates: false,
                create_if_missing: true,
            }],
        })
        .await
        .unwrap();
    assert_eq!(reply.entries.len(), 1);

    scout.stop(true).await;
}

#[tokio::test]
async fn in_flight_fetch_reports_its_requested_lower_bound_until_it_completes() {
    init_test_logger();
    let transport = MockSurrogate::new();
    let id = oid("alice");
    transport.stall_next_fetch(id.clone());

    let cache = Arc::new(std::sync::Mutex::new(ObjectCache::<Counter>::new(10, Duration::from_secs(60))));
    let pipeline = Arc::new(FetchPipeline::new(
        transport,
        "scout-1".to_string(),
        false,
        cache,
        Arc::new(swiftcloud_scout::metrics::ScoutMetrics::new()),
    ));

    let mut requested = CausalClock::new();
    requested.record(&swiftcloud_scout::clock::Timestamp::new("dc1", 1));

    let worker = {
        let pipeline = pipeline.clone();
        let requested = requested.clone();
        let id = id.clone();
        tokio::spawn(async move {
            pipeline
                .ensure_version(&id, &requested, true, Duration::from_secs(2))
                .await
        })
    };

    // Give the background fetch a moment to register itself as the
    // leader for `id` before the stalled reply forces a retry.
    tokio::time::sleep(Duration::from_millis(5)).await;
    let floor = pipeline.in_flight_lower_bound(&id);
    assert_eq!(floor.as_ref(), Some(&requested));

    worker.await.unwrap().unwrap();

    // Once the fetch has resolved, there is nothing left to guard.
    assert!(pipeline.in_flight_lower_bound(&id).is_none());
}
