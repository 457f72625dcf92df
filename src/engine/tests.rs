use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;

use super::*;
use crate::config::ChildWritePolicy;
use crate::limits::MAX_TREE_DEPTH;
use crate::store::{Cmd, ExpiryStream, Failure, MemoryStore};

const MIN: Duration = Duration::from_secs(60);

fn engine() -> ReservationEngine<MemoryStore> {
    engine_with(EngineConfig::default())
}

fn engine_with(config: EngineConfig) -> ReservationEngine<MemoryStore> {
    ReservationEngine::new(Arc::new(MemoryStore::new()), Keyspace::default(), config)
}

async fn reserved<S: Store>(engine: &ReservationEngine<S>, resource: &str) -> i64 {
    engine
        .counters()
        .get_one(CounterFamily::Reserved, resource)
        .await
        .unwrap()
}

async fn set(engine: &ReservationEngine<MemoryStore>, key: String, value: &str) {
    engine
        .store()
        .pipeline(vec![Cmd::Set(key, value.to_string())])
        .await
        .unwrap();
}

/// evt-42 -> row-A -> seat-1, returned root first.
async fn three_level_tree<S: Store>(
    engine: &ReservationEngine<S>,
) -> (ReservationId, ReservationId, ReservationId) {
    let leaf = engine
        .reserve("seat-1", 20 * MIN, &[], Depth::Child)
        .await
        .unwrap();
    let mid = engine
        .reserve(
            "row-A",
            20 * MIN,
            &[ChildReservation::new(leaf, "seat-1")],
            Depth::Child,
        )
        .await
        .unwrap();
    let root = engine
        .reserve(
            "evt-42",
            20 * MIN,
            &[ChildReservation::new(mid, "row-A")],
            Depth::Root,
        )
        .await
        .unwrap();
    (root, mid, leaf)
}

/// Memory store that loses the connection on chosen calls.
struct FlakyStore {
    inner: MemoryStore,
    scans: AtomicUsize,
    /// 1-based index of the hash scan that fails; 0 never fails.
    fail_scan: AtomicUsize,
    /// Pipelines still to fail.
    failing_pipelines: AtomicUsize,
}

impl FlakyStore {
    fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
            scans: AtomicUsize::new(0),
            fail_scan: AtomicUsize::new(0),
            failing_pipelines: AtomicUsize::new(0),
        }
    }

    fn fail_scan(&self, nth: usize) {
        self.scans.store(0, Ordering::SeqCst);
        self.fail_scan.store(nth, Ordering::SeqCst);
    }

    fn fail_pipelines(&self, n: usize) {
        self.failing_pipelines.store(n, Ordering::SeqCst);
    }
}

fn blip() -> StoreError {
    StoreError::Connection("blip".into())
}

#[async_trait]
impl Store for FlakyStore {
    async fn transaction(&self, cmds: Vec<Cmd>) -> Result<Vec<Reply>, StoreError> {
        self.inner.transaction(cmds).await
    }

    async fn pipeline(&self, cmds: Vec<Cmd>) -> Result<Vec<Reply>, StoreError> {
        let fail = self
            .failing_pipelines
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(blip());
        }
        self.inner.pipeline(cmds).await
    }

    async fn hscan(
        &self,
        key: &str,
        cursor: u64,
        count: usize,
    ) -> Result<(u64, Vec<(String, String)>), StoreError> {
        let nth = self.scans.fetch_add(1, Ordering::SeqCst) + 1;
        if nth == self.fail_scan.load(Ordering::SeqCst) {
            return Err(blip());
        }
        self.inner.hscan(key, cursor, count).await
    }

    async fn expired_keys(&self) -> Result<ExpiryStream, StoreError> {
        self.inner.expired_keys().await
    }
}

fn flaky_engine() -> ReservationEngine<FlakyStore> {
    ReservationEngine::new(
        Arc::new(FlakyStore::new()),
        Keyspace::default(),
        EngineConfig::default(),
    )
}

// ── Reserve ──────────────────────────────────────────────

#[tokio::test]
async fn reserve_writes_keys_and_counts() {
    let engine = engine();
    let id = engine
        .reserve("evt-42", 20 * MIN, &[], Depth::Root)
        .await
        .unwrap();

    let keys = engine.store().keys().await;
    assert!(keys.contains(&engine.keys().ttl_key(&id)));
    assert!(keys.contains(&engine.keys().id_key(&id)));
    assert!(!keys.contains(&engine.keys().children_key(&id)));
    assert_eq!(reserved(&engine, "evt-42").await, 1);
}

#[tokio::test(start_paused = true)]
async fn reserve_ttl_includes_grace() {
    let engine = engine();
    let root = engine.reserve("evt-42", 20 * MIN, &[], Depth::Root).await.unwrap();
    let child = engine.reserve("seat-1", 20 * MIN, &[], Depth::Child).await.unwrap();

    let ttls = engine
        .store()
        .pipeline(vec![
            Cmd::PTtl(engine.keys().ttl_key(&root)),
            Cmd::PTtl(engine.keys().ttl_key(&child)),
            Cmd::PTtl(engine.keys().id_key(&root)),
        ])
        .await
        .unwrap();
    assert_eq!(ttls[0].as_int(), Some((20 * 60 + 15) * 1000));
    assert_eq!(ttls[1].as_int(), Some((20 * 60 + 45) * 1000));
    // The id-key has no TTL; it is removed by release.
    assert_eq!(ttls[2].as_int(), Some(-1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_reserves_all_win() {
    let engine = engine();
    let n = 64;

    let handles: Vec<_> = (0..n)
        .map(|_| {
            let engine = engine.clone();
            tokio::spawn(async move { engine.reserve("evt-42", 20 * MIN, &[], Depth::Root).await })
        })
        .collect();

    let mut ids = HashSet::new();
    for handle in handles {
        ids.insert(handle.await.unwrap().unwrap());
    }
    assert_eq!(ids.len(), n);
    assert_eq!(reserved(&engine, "evt-42").await, n as i64);
}

#[tokio::test]
async fn collision_is_conflict_and_leaves_count() {
    let engine = engine();
    engine.reserve("evt-42", 20 * MIN, &[], Depth::Root).await.unwrap();

    let id = ReservationId::new();
    set(&engine, engine.keys().id_key(&id), "evt-other").await;

    let result = engine.reserve_as(id, "evt-42", 20 * MIN, &[], Depth::Root).await;
    assert!(matches!(result, Err(EngineError::Conflict(c)) if c == id));
    assert!(result.unwrap_err().is_retryable());
    assert_eq!(reserved(&engine, "evt-42").await, 1);

    let stored = engine
        .store()
        .pipeline(vec![Cmd::Get(engine.keys().id_key(&id))])
        .await
        .unwrap();
    assert_eq!(stored[0].clone().into_string().as_deref(), Some("evt-other"));

    // Only the id-key was taken, so no TTL key may be left to expire.
    let ttl = engine
        .store()
        .pipeline(vec![
            Cmd::Get(engine.keys().ttl_key(&id)),
            Cmd::PTtl(engine.keys().ttl_key(&id)),
        ])
        .await
        .unwrap();
    assert_eq!(ttl, vec![Reply::Nil, Reply::Int(-2)]);
}

#[tokio::test(start_paused = true)]
async fn collision_keeps_the_owners_hold() {
    let engine = engine();
    let id = ReservationId::new();
    engine.reserve_as(id, "evt-1", 20 * MIN, &[], Depth::Root).await.unwrap();

    let result = engine.reserve_as(id, "evt-2", MIN, &[], Depth::Root).await;
    assert!(matches!(result, Err(EngineError::Conflict(c)) if c == id));

    let ttl = engine
        .store()
        .pipeline(vec![
            Cmd::Get(engine.keys().ttl_key(&id)),
            Cmd::PTtl(engine.keys().ttl_key(&id)),
            Cmd::Get(engine.keys().id_key(&id)),
        ])
        .await
        .unwrap();
    assert_eq!(
        ttl,
        vec![
            Reply::Str("evt-1".into()),
            Reply::Int((20 * 60 + 15) * 1000),
            Reply::Str("evt-1".into()),
        ]
    );
    assert_eq!(reserved(&engine, "evt-1").await, 1);
    assert_eq!(reserved(&engine, "evt-2").await, 0);

    // Past the loser's minute plus grace; the owner's twenty minutes hold.
    tokio::time::advance(2 * MIN).await;
    let check = engine.check_reservation("evt-1", id, Depth::Root).await.unwrap();
    assert!(check.is_valid());
}

#[tokio::test]
async fn too_many_children_rejected() {
    let engine = engine();
    let children: Vec<_> = (0..=crate::limits::MAX_CHILDREN)
        .map(|i| ChildReservation::new(ReservationId::new(), format!("seat-{i}")))
        .collect();
    let result = engine.reserve("evt-42", 20 * MIN, &children, Depth::Root).await;
    assert!(matches!(result, Err(EngineError::LimitExceeded(_))));
    assert_eq!(reserved(&engine, "evt-42").await, 0);
}

#[tokio::test]
async fn store_unavailable_propagates() {
    let engine = engine();
    engine.store().inject_failure(Failure::Unavailable);

    let result = engine.reserve("evt-42", 20 * MIN, &[], Depth::Root).await;
    assert!(matches!(result, Err(EngineError::Store(StoreError::Connection(_)))));
    let result = engine.release(ReservationId::new()).await;
    assert!(matches!(result, Err(EngineError::Store(_))));
    let result = engine
        .check_reservation("evt-42", ReservationId::new(), Depth::Root)
        .await;
    assert!(matches!(result, Err(EngineError::Store(_))));
}

#[tokio::test]
async fn child_write_failure_rolls_back_by_default() {
    let engine = engine();
    let seat = engine.reserve("seat-1", 20 * MIN, &[], Depth::Child).await.unwrap();
    engine.store().inject_failure(Failure::HashWrites);

    let result = engine
        .reserve("evt-42", 20 * MIN, &[ChildReservation::new(seat, "seat-1")], Depth::Root)
        .await;
    assert!(matches!(result, Err(EngineError::Store(_))));
    assert_eq!(reserved(&engine, "evt-42").await, 0);

    // The child still belongs to the caller.
    engine.store().clear_failure();
    let check = engine.check_reservation("seat-1", seat, Depth::Child).await.unwrap();
    assert!(check.is_valid());
}

#[tokio::test]
async fn child_write_failure_keeps_parent_when_configured() {
    let engine = engine_with(EngineConfig {
        child_write_policy: ChildWritePolicy::KeepParent,
        ..EngineConfig::default()
    });
    let seat = engine.reserve("seat-1", 20 * MIN, &[], Depth::Child).await.unwrap();
    engine.store().inject_failure(Failure::HashWrites);

    let root = engine
        .reserve("evt-42", 20 * MIN, &[ChildReservation::new(seat, "seat-1")], Depth::Root)
        .await
        .unwrap();
    engine.store().clear_failure();

    assert_eq!(reserved(&engine, "evt-42").await, 1);
    let check = engine.check_reservation("evt-42", root, Depth::Root).await.unwrap();
    assert!(check.is_valid());
}

// ── Check ────────────────────────────────────────────────

#[tokio::test]
async fn check_unknown_is_not_found() {
    let engine = engine();
    let check = engine
        .check_reservation("evt-42", ReservationId::new(), Depth::Root)
        .await
        .unwrap();
    assert_eq!(check, Check::NotFound);
}

#[tokio::test]
async fn check_wrong_resource_is_invalid() {
    let engine = engine();
    let id = engine.reserve("evt-42", 20 * MIN, &[], Depth::Root).await.unwrap();
    let check = engine.check_reservation("evt-43", id, Depth::Root).await.unwrap();
    assert_eq!(
        check,
        Check::Invalid(InvalidReason::ResourceMismatch {
            stored: "evt-42".into()
        })
    );
}

#[tokio::test(start_paused = true)]
async fn check_fails_once_only_grace_remains() {
    let engine = engine();
    let id = engine.reserve("evt-42", 20 * MIN, &[], Depth::Root).await.unwrap();

    tokio::time::advance(19 * MIN).await;
    assert!(engine.check_reservation("evt-42", id, Depth::Root).await.unwrap().is_valid());

    tokio::time::advance(MIN + Duration::from_secs(1)).await;
    let check = engine.check_reservation("evt-42", id, Depth::Root).await.unwrap();
    assert!(matches!(
        check,
        Check::Invalid(InvalidReason::GraceElapsed { remaining }) if remaining < Duration::from_secs(15)
    ));
}

#[tokio::test]
async fn check_whole_tree_valid() {
    let engine = engine();
    let (root, mid, leaf) = three_level_tree(&engine).await;

    assert!(engine.check_reservation("evt-42", root, Depth::Root).await.unwrap().is_valid());
    assert!(engine.check_reservation("row-A", mid, Depth::Child).await.unwrap().is_valid());
    assert!(engine.check_reservation("seat-1", leaf, Depth::Child).await.unwrap().is_valid());
}

#[tokio::test]
async fn check_corrupted_leaf_invalidates_root() {
    let engine = engine();
    let (root, mid, leaf) = three_level_tree(&engine).await;

    set(&engine, engine.keys().id_key(&leaf), "seat-999").await;

    // Root keys still match; only the leaf is wrong.
    let check = engine.check_reservation("evt-42", root, Depth::Root).await.unwrap();
    assert_eq!(check, Check::Invalid(InvalidReason::Child(mid)));
    let check = engine.check_reservation("row-A", mid, Depth::Child).await.unwrap();
    assert_eq!(check, Check::Invalid(InvalidReason::Child(leaf)));
}

#[tokio::test]
async fn check_released_leaf_invalidates_root() {
    let engine = engine();
    let (root, _mid, leaf) = three_level_tree(&engine).await;

    assert!(engine.release(leaf).await.unwrap().is_released());
    assert!(!engine.check_reservation("evt-42", root, Depth::Root).await.unwrap().is_valid());
}

#[tokio::test]
async fn check_malformed_child_entry() {
    let engine = engine();
    let root = engine.reserve("evt-42", 20 * MIN, &[], Depth::Root).await.unwrap();
    engine
        .store()
        .pipeline(vec![Cmd::HSet(
            engine.keys().children_key(&root),
            vec![("bogus".into(), "seat-1".into())],
        )])
        .await
        .unwrap();

    let check = engine.check_reservation("evt-42", root, Depth::Root).await.unwrap();
    assert_eq!(check, Check::Invalid(InvalidReason::MalformedChild("bogus".into())));
}

// ── Release ──────────────────────────────────────────────

#[tokio::test]
async fn release_is_idempotent() {
    let engine = engine();
    let id = engine.reserve("evt-42", 20 * MIN, &[], Depth::Root).await.unwrap();

    let first = engine.release(id).await.unwrap();
    assert_eq!(first, Release::Released { anomalies: vec![] });
    assert_eq!(engine.release(id).await.unwrap(), Release::NotFound);
    assert_eq!(reserved(&engine, "evt-42").await, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_releases_decrement_once() {
    let engine = engine();
    let id = engine.reserve("evt-42", 20 * MIN, &[], Depth::Root).await.unwrap();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let engine = engine.clone();
            tokio::spawn(async move { engine.release(id).await })
        })
        .collect();
    let mut released = 0;
    for handle in handles {
        if handle.await.unwrap().unwrap().is_released() {
            released += 1;
        }
    }
    assert_eq!(released, 1);
    assert_eq!(reserved(&engine, "evt-42").await, 0);
}

#[tokio::test]
async fn release_frees_whole_tree() {
    let engine = engine();
    let (root, mid, leaf) = three_level_tree(&engine).await;

    assert!(engine.release(root).await.unwrap().is_released());

    for resource in ["evt-42", "row-A", "seat-1"] {
        assert_eq!(reserved(&engine, resource).await, 0, "{resource}");
    }
    for id in [root, mid, leaf] {
        assert_eq!(engine.release(id).await.unwrap(), Release::NotFound);
    }
    let keys = engine.store().keys().await;
    assert!(keys.iter().all(|k| !k.starts_with("reservation:")), "{keys:?}");
}

#[tokio::test]
async fn release_walks_every_scan_page() {
    let engine = engine_with(EngineConfig {
        scan_page_size: 7,
        ..EngineConfig::default()
    });
    let mut children = Vec::new();
    for i in 0..50 {
        let seat = format!("seat-{i}");
        let id = engine.reserve(&seat, 20 * MIN, &[], Depth::Child).await.unwrap();
        children.push(ChildReservation::new(id, seat));
    }
    let root = engine.reserve("evt-42", 20 * MIN, &children, Depth::Root).await.unwrap();
    assert!(engine.check_reservation("evt-42", root, Depth::Root).await.unwrap().is_valid());

    engine.release(root).await.unwrap();
    for child in &children {
        assert_eq!(reserved(&engine, &child.resource_id).await, 0);
    }
}

#[tokio::test]
async fn negative_count_is_reported_not_raised() {
    let engine = engine();
    let id = engine.reserve("evt-42", 20 * MIN, &[], Depth::Root).await.unwrap();
    set(&engine, engine.keys().counter_key(CounterFamily::Reserved, "evt-42"), "0").await;

    let release = engine.release(id).await.unwrap();
    assert_eq!(
        release,
        Release::Released {
            anomalies: vec![Anomaly::NegativeCount {
                resource_id: "evt-42".into(),
                value: -1
            }]
        }
    );
}

#[tokio::test]
async fn nested_anomalies_bubble_up() {
    let engine = engine();
    let (root, _mid, _leaf) = three_level_tree(&engine).await;
    set(&engine, engine.keys().counter_key(CounterFamily::Reserved, "seat-1"), "0").await;

    let Release::Released { anomalies } = engine.release(root).await.unwrap() else {
        panic!("root should release");
    };
    assert_eq!(
        anomalies,
        vec![Anomaly::NegativeCount {
            resource_id: "seat-1".into(),
            value: -1
        }]
    );
}

#[tokio::test(start_paused = true)]
async fn expiry_matches_explicit_release() {
    // Explicit release.
    let explicit = engine();
    let (root, _, _) = three_level_tree(&explicit).await;
    explicit.release(root).await.unwrap();
    let explicit_keys = explicit.store().keys().await;

    // Let the root TTL lapse, then release from the expiry event.
    let expired = engine();
    let mut events = expired.store().expired_keys().await.unwrap();
    three_level_tree(&expired).await;
    tokio::time::advance(20 * MIN + Duration::from_secs(16)).await;
    assert_eq!(expired.store().sweep().await, 1);

    let key = events.next().await.unwrap().unwrap();
    let id = expired.keys().reservation_from_expired(&key).unwrap();
    assert!(expired.release(id).await.unwrap().is_released());

    assert_eq!(expired.store().keys().await, explicit_keys);
    for resource in ["evt-42", "row-A", "seat-1"] {
        assert_eq!(reserved(&expired, resource).await, 0);
        assert_eq!(reserved(&explicit, resource).await, 0);
    }
}

#[tokio::test]
async fn interrupted_release_resumes_on_retry() {
    // Fail the root's, the row's and the seat's child scan in turn.
    for nth in 1..=3 {
        let engine = flaky_engine();
        let (root, mid, leaf) = three_level_tree(&engine).await;
        engine.store().fail_scan(nth);

        let result = engine.release(root).await;
        assert!(
            matches!(result, Err(EngineError::Store(StoreError::Connection(_)))),
            "scan {nth}: {result:?}"
        );
        for resource in ["evt-42", "row-A", "seat-1"] {
            assert_eq!(reserved(&engine, resource).await, 1, "scan {nth}: {resource}");
        }
        let keys = engine.store().inner.keys().await;
        assert!(keys.contains(&engine.keys().id_key(&root)), "scan {nth}: {keys:?}");
        assert!(keys.contains(&engine.keys().children_key(&root)), "scan {nth}: {keys:?}");
        assert!(!keys.iter().any(|k| k.ends_with(":releasing")), "scan {nth}: {keys:?}");
        let check = engine.check_reservation("evt-42", root, Depth::Root).await.unwrap();
        assert!(!check.is_valid());

        let retry = engine.release(root).await.unwrap();
        assert_eq!(retry, Release::Released { anomalies: vec![] }, "scan {nth}");
        for resource in ["evt-42", "row-A", "seat-1"] {
            assert_eq!(reserved(&engine, resource).await, 0, "scan {nth}: {resource}");
        }
        for id in [root, mid, leaf] {
            assert_eq!(engine.release(id).await.unwrap(), Release::NotFound);
        }
        let keys = engine.store().inner.keys().await;
        assert!(keys.iter().all(|k| !k.starts_with("reservation:")), "scan {nth}: {keys:?}");
    }
}

#[tokio::test(start_paused = true)]
async fn stuck_release_lease_lapses() {
    let engine = flaky_engine();
    let (root, _mid, _leaf) = three_level_tree(&engine).await;
    // The scan fails, then so does dropping the lease.
    engine.store().fail_scan(1);
    engine.store().fail_pipelines(1);
    assert!(engine.release(root).await.is_err());

    // Still leased to the failed release.
    assert_eq!(engine.release(root).await.unwrap(), Release::NotFound);
    assert_eq!(reserved(&engine, "evt-42").await, 1);

    tokio::time::advance(engine.config().release_lease + Duration::from_secs(1)).await;
    assert!(engine.release(root).await.unwrap().is_released());
    for resource in ["evt-42", "row-A", "seat-1"] {
        assert_eq!(reserved(&engine, resource).await, 0, "{resource}");
    }
    let keys = engine.store().inner.keys().await;
    assert!(keys.iter().all(|k| !k.starts_with("reservation:")), "{keys:?}");
}

#[tokio::test]
async fn release_stops_at_depth_limit_and_keeps_the_rest_reachable() {
    let engine = engine();
    // node-0 -> node-1 -> ... -> node-17, reserved deepest first.
    let mut below = Vec::new();
    let mut ids = Vec::new();
    for level in (0..=MAX_TREE_DEPTH + 1).rev() {
        let resource = format!("node-{level}");
        let depth = if level == 0 { Depth::Root } else { Depth::Child };
        let id = engine.reserve(&resource, 20 * MIN, &below, depth).await.unwrap();
        below = vec![ChildReservation::new(id, resource)];
        ids.push(id);
    }
    ids.reverse();
    let last = ids[MAX_TREE_DEPTH];
    let deepest = ids[MAX_TREE_DEPTH + 1];

    let release = engine.release(ids[0]).await.unwrap();
    assert_eq!(
        release,
        Release::Released {
            anomalies: vec![Anomaly::TreeTooDeep { reservation_id: last }]
        }
    );
    for level in 0..=MAX_TREE_DEPTH {
        assert_eq!(reserved(&engine, &format!("node-{level}")).await, 0, "node-{level}");
    }
    let deepest_resource = format!("node-{}", MAX_TREE_DEPTH + 1);
    assert_eq!(reserved(&engine, &deepest_resource).await, 1);

    // The link to the unreleased child survives with its own keys.
    let keys = engine.store().keys().await;
    assert!(!keys.contains(&engine.keys().id_key(&last)));
    assert!(keys.contains(&engine.keys().children_key(&last)), "{keys:?}");
    assert!(keys.contains(&engine.keys().id_key(&deepest)), "{keys:?}");
    let listed = crate::store::hscan_all(&**engine.store(), &engine.keys().children_key(&last), 10)
        .await
        .unwrap();
    assert_eq!(listed, vec![(deepest.to_string(), deepest_resource.clone())]);

    assert!(engine.release(deepest).await.unwrap().is_released());
    assert_eq!(reserved(&engine, &deepest_resource).await, 0);
}

// ── Scenario ─────────────────────────────────────────────

#[tokio::test]
async fn two_holds_on_one_event() {
    let engine = engine();
    let r1 = engine.reserve("evt-42", 20 * MIN, &[], Depth::Root).await.unwrap();
    let r2 = engine.reserve("evt-42", 20 * MIN, &[], Depth::Root).await.unwrap();
    assert_ne!(r1, r2);
    assert_eq!(reserved(&engine, "evt-42").await, 2);

    engine.release(r1).await.unwrap();
    assert_eq!(reserved(&engine, "evt-42").await, 1);
    assert!(!engine.check_reservation("evt-42", r1, Depth::Root).await.unwrap().is_valid());
    assert!(engine.check_reservation("evt-42", r2, Depth::Root).await.unwrap().is_valid());
}

// ── Release batch ────────────────────────────────────────

#[tokio::test]
async fn batch_releases_in_order_and_drains() {
    let engine = engine();
    let a = engine.reserve("evt-42", 20 * MIN, &[], Depth::Root).await.unwrap();
    let b = engine.reserve("evt-42", 20 * MIN, &[], Depth::Root).await.unwrap();

    let mut batch: ReleaseBatch = [a, b, a].into_iter().collect();
    let results = batch.execute(&engine).await.unwrap();
    assert!(batch.is_empty());
    assert_eq!(results.len(), 3);
    assert_eq!(results[0].0, a);
    assert!(results[0].1.is_released());
    assert!(results[1].1.is_released());
    assert_eq!(results[2].1, Release::NotFound);
    assert_eq!(reserved(&engine, "evt-42").await, 0);
}

#[tokio::test]
async fn batch_keeps_unreleased_on_store_error() {
    let engine = engine();
    let a = engine.reserve("evt-42", 20 * MIN, &[], Depth::Root).await.unwrap();

    let mut batch = ReleaseBatch::new();
    batch.push(a);
    engine.store().inject_failure(Failure::Unavailable);
    assert!(batch.execute(&engine).await.is_err());
    assert_eq!(batch.ids(), &[a]);

    engine.store().clear_failure();
    let results = batch.execute(&engine).await.unwrap();
    assert!(results[0].1.is_released());
    assert!(batch.is_empty());
}
