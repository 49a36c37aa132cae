//! Lifecycle manager integration tests.
//!
//! Drives the full dispatcher through the public request surface with
//! an in-memory repository, coordination store, and mock indexer /
//! cluster-info backends.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;

use indexgrid_coord::{BuildToken, CoordStore, DeleteToken};
use indexgrid_lifecycle::*;
use indexgrid_meta::*;

// ── Mock indexer ───────────────────────────────────────────────────

#[derive(Default)]
struct MockIndexerState {
    create_calls: Vec<InstId>,
    build_calls: Vec<Vec<InstId>>,
    delete_calls: Vec<InstId>,
    prune_calls: Vec<(InstId, Vec<PartitionId>)>,
    fetch_stats: usize,
    /// Errors returned for specific instances on build.
    build_errors: HashMap<InstId, IndexerError>,
    /// Error returned for every instance on build.
    fail_all_builds: Option<IndexerError>,
    create_error: Option<IndexerError>,
    delete_error: Option<IndexerError>,
    panic_on_build: bool,
}

#[derive(Default)]
struct MockIndexer {
    state: Mutex<MockIndexerState>,
}

impl MockIndexer {
    fn create_count(&self) -> usize {
        self.state.lock().unwrap().create_calls.len()
    }

    fn build_calls(&self) -> Vec<Vec<InstId>> {
        self.state.lock().unwrap().build_calls.clone()
    }

    fn delete_count(&self) -> usize {
        self.state.lock().unwrap().delete_calls.len()
    }

    fn prune_calls(&self) -> Vec<(InstId, Vec<PartitionId>)> {
        self.state.lock().unwrap().prune_calls.clone()
    }

    fn fetch_stats_count(&self) -> usize {
        self.state.lock().unwrap().fetch_stats
    }

    fn fail_all_builds(&self, err: IndexerError) {
        self.state.lock().unwrap().fail_all_builds = Some(err);
    }

    fn set_build_error(&self, inst_id: InstId, err: IndexerError) {
        self.state.lock().unwrap().build_errors.insert(inst_id, err);
    }

    fn set_delete_error(&self, err: IndexerError) {
        self.state.lock().unwrap().delete_error = Some(err);
    }

    fn panic_on_build(&self) {
        self.state.lock().unwrap().panic_on_build = true;
    }

    fn clear_failures(&self) {
        let mut state = self.state.lock().unwrap();
        state.build_errors.clear();
        state.fail_all_builds = None;
        state.create_error = None;
        state.delete_error = None;
        state.panic_on_build = false;
    }
}

impl IndexerNotifier for MockIndexer {
    fn on_index_create(
        &self,
        _defn: &IndexDefinition,
        inst_id: InstId,
        _replica_id: i32,
        _partitions: &[PartitionId],
        _versions: &[u64],
        _num_partitions: u32,
        _real_inst_id: InstId,
        _ctx: RequestContext,
    ) -> Result<(), IndexerError> {
        let mut state = self.state.lock().unwrap();
        state.create_calls.push(inst_id);
        match &state.create_error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn on_index_build(
        &self,
        inst_ids: &[InstId],
        _buckets: &[String],
        _ctx: RequestContext,
    ) -> HashMap<InstId, IndexerError> {
        let should_panic = self.state.lock().unwrap().panic_on_build;
        if should_panic {
            panic!("mock indexer build panic");
        }
        let mut state = self.state.lock().unwrap();
        state.build_calls.push(inst_ids.to_vec());

        let mut errors = HashMap::new();
        for &inst_id in inst_ids {
            if let Some(err) = &state.fail_all_builds {
                errors.insert(inst_id, err.clone());
            } else if let Some(err) = state.build_errors.get(&inst_id) {
                errors.insert(inst_id, err.clone());
            }
        }
        errors
    }

    fn on_index_delete(
        &self,
        inst_id: InstId,
        _bucket: &str,
        _ctx: RequestContext,
    ) -> Result<(), IndexerError> {
        let mut state = self.state.lock().unwrap();
        state.delete_calls.push(inst_id);
        match &state.delete_error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn on_partition_prune(
        &self,
        inst_id: InstId,
        partitions: &[PartitionId],
        _ctx: RequestContext,
    ) -> Result<(), IndexerError> {
        let mut state = self.state.lock().unwrap();
        state.prune_calls.push((inst_id, partitions.to_vec()));
        Ok(())
    }

    fn on_fetch_stats(&self) {
        self.state.lock().unwrap().fetch_stats += 1;
    }
}

// ── Mock cluster info ──────────────────────────────────────────────

struct MockClusterState {
    buckets: HashMap<String, String>,
    unreachable: bool,
    snapshot: ClusterSnapshot,
}

struct MockCluster {
    state: Mutex<MockClusterState>,
}

impl MockCluster {
    fn new() -> Self {
        MockCluster {
            state: Mutex::new(MockClusterState {
                buckets: HashMap::new(),
                unreachable: false,
                snapshot: ClusterSnapshot {
                    scan_addr: "127.0.0.1:9101".to_string(),
                    http_addr: "127.0.0.1:9102".to_string(),
                    admin_addr: "127.0.0.1:9100".to_string(),
                    node_addr: "127.0.0.1:8091".to_string(),
                    server_group: "Group 1".to_string(),
                    cluster_version: 1,
                },
            }),
        }
    }

    fn set_bucket(&self, bucket: &str, uuid: &str) {
        self.state
            .lock()
            .unwrap()
            .buckets
            .insert(bucket.to_string(), uuid.to_string());
    }
}

impl ClusterInfo for MockCluster {
    fn fetch(&self) -> LifecycleResult<ClusterSnapshot> {
        let state = self.state.lock().unwrap();
        if state.unreachable {
            return Err(LifecycleError::ClusterInfo("cluster unreachable".to_string()));
        }
        Ok(state.snapshot.clone())
    }

    fn bucket_uuid(&self, bucket: &str) -> LifecycleResult<String> {
        let state = self.state.lock().unwrap();
        if state.unreachable {
            return Err(LifecycleError::ClusterInfo("cluster unreachable".to_string()));
        }
        Ok(state
            .buckets
            .get(bucket)
            .cloned()
            .unwrap_or_else(|| BUCKET_UUID_NIL.to_string()))
    }
}

// ── Harness ────────────────────────────────────────────────────────

struct Harness {
    manager: LifecycleManager,
    responses: mpsc::Receiver<ResponsePacket>,
    repo: MetadataRepo,
    coord: CoordStore,
    indexer: Arc<MockIndexer>,
    cluster: Arc<MockCluster>,
    next_req: AtomicU64,
}

/// Test config: background tasks tick fast, and the builder does not
/// wait for rebalance tokens.
fn test_config() -> LifecycleConfig {
    LifecycleConfig {
        builder_settle: Duration::ZERO,
        // Keep the builder quiet unless a test wants it.
        builder_tick: Duration::from_secs(3600),
        janitor_interval: Duration::from_secs(3600),
        updator_interval: Duration::from_secs(3600),
        ..LifecycleConfig::default()
    }
}

impl Harness {
    fn start(config: LifecycleConfig) -> Harness {
        let repo = MetadataRepo::open_in_memory().unwrap();
        repo.set_local_indexer_id("indexer-1").unwrap();
        repo.set_local_node_uuid("node-uuid-1").unwrap();

        let coord = CoordStore::open_in_memory().unwrap();
        let indexer = Arc::new(MockIndexer::default());
        let cluster = Arc::new(MockCluster::new());
        cluster.set_bucket("b", "uuid-b");

        let cinfo = ClusterInfoCache::new(cluster.clone() as Arc<dyn ClusterInfo>);
        let (manager, responses) = LifecycleManager::start(
            repo.clone(),
            coord.clone(),
            cinfo,
            indexer.clone(),
            config,
        );

        Harness {
            manager,
            responses,
            repo,
            coord,
            indexer,
            cluster,
            next_req: AtomicU64::new(1),
        }
    }

    async fn ready(&self) {
        self.manager
            .submit(RequestPacket::new(OpCode::IndexerReady, 0, "", Vec::new(), "test"))
            .await
            .unwrap();
    }

    async fn submit(&self, op: OpCode, key: &str, content: Vec<u8>) -> u64 {
        let req_id = self.next_req.fetch_add(1, Ordering::Relaxed);
        self.manager
            .submit(RequestPacket::new(op, req_id, key, content, "test"))
            .await
            .unwrap();
        req_id
    }

    /// Submit and wait for the matching response.
    async fn request(&mut self, op: OpCode, key: &str, content: Vec<u8>) -> ResponsePacket {
        let req_id = self.submit(op, key, content).await;
        self.expect_response(req_id).await
    }

    async fn expect_response(&mut self, req_id: u64) -> ResponsePacket {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let resp = self.responses.recv().await.expect("response channel closed");
                if resp.req_id == req_id {
                    return resp;
                }
            }
        })
        .await
        .expect("timed out waiting for response")
    }

    fn instance_of(&self, bucket: &str, defn_id: DefnId) -> IndexInstRef {
        let topology = self.repo.topology(bucket).unwrap().unwrap();
        let insts = topology.instances_by_defn(defn_id);
        assert_eq!(insts.len(), 1, "expected a single instance");
        insts.into_iter().next().unwrap()
    }
}

fn test_defn(defn_id: DefnId, bucket: &str, name: &str, deferred: bool) -> IndexDefinition {
    IndexDefinition {
        defn_id,
        bucket: bucket.to_string(),
        bucket_uuid: String::new(),
        name: name.to_string(),
        using: StorageKind::Plasma,
        partition_scheme: PartitionScheme::Single,
        num_partitions: 0,
        deferred,
        num_replica: 0,
        replica_id: 0,
        inst_id: 0,
        real_inst_id: 0,
        inst_version: 0,
        partitions: Vec::new(),
        versions: Vec::new(),
    }
}

fn encode<T: serde::Serialize>(value: &T) -> Vec<u8> {
    serde_json::to_vec(value).unwrap()
}

// ── Create / build / drop ──────────────────────────────────────────

#[tokio::test]
async fn create_non_deferred_builds_and_activates() {
    let mut h = Harness::start(test_config());
    h.ready().await;

    let defn = test_defn(1, "b", "i", false);
    let resp = h
        .request(OpCode::CreateIndex, "i", encode(&defn))
        .await;
    assert_eq!(resp.error, "");

    // The indexer saw the create, then one build for the fresh instance.
    assert_eq!(h.indexer.create_count(), 1);
    let builds = h.indexer.build_calls();
    assert_eq!(builds.len(), 1);
    assert_eq!(builds[0].len(), 1);

    let inst = h.instance_of("b", 1);
    assert_eq!(inst.state, IndexState::Ready);
    assert!(inst.scheduled);

    // The indexer reports progress through UPDATE_INDEX_INST.
    for state in [IndexState::Initial, IndexState::Active] {
        let change = TopologyChange {
            bucket: "b".to_string(),
            defn_id: 1,
            inst_id: inst.inst_id,
            state,
            ..TopologyChange::default()
        };
        let resp = h
            .request(OpCode::UpdateIndexInst, "", encode(&change))
            .await;
        assert_eq!(resp.error, "");
    }

    let inst = h.instance_of("b", 1);
    assert_eq!(inst.state, IndexState::Active);
    assert!(!inst.scheduled, "scheduled flag clears past READY");

    // The definition captured the bucket UUID.
    assert_eq!(h.repo.defn(1).unwrap().unwrap().bucket_uuid, "uuid-b");
}

#[tokio::test]
async fn duplicate_name_is_rejected() {
    let mut h = Harness::start(test_config());
    h.ready().await;

    let resp = h
        .request(OpCode::CreateIndex, "i", encode(&test_defn(1, "b", "i", false)))
        .await;
    assert_eq!(resp.error, "");

    let resp = h
        .request(OpCode::CreateIndex, "i", encode(&test_defn(2, "b", "i", false)))
        .await;
    assert_eq!(resp.error, "Index b.i already exists");
    assert!(h.repo.defn(2).unwrap().is_none());
}

#[tokio::test]
async fn create_fails_when_bucket_is_gone() {
    let mut h = Harness::start(test_config());
    h.ready().await;

    let resp = h
        .request(
            OpCode::CreateIndex,
            "i",
            encode(&test_defn(1, "missing", "i", false)),
        )
        .await;
    assert!(
        resp.error
            .contains("Bucket does not exist or temporarily unavailable"),
        "unexpected error: {}",
        resp.error
    );
    assert!(h.repo.defn(1).unwrap().is_none());
}

#[tokio::test]
async fn deferred_create_skips_build() {
    let mut h = Harness::start(test_config());
    h.ready().await;

    let resp = h
        .request(OpCode::CreateIndex, "i", encode(&test_defn(1, "b", "i", true)))
        .await;
    assert_eq!(resp.error, "");
    assert!(h.indexer.build_calls().is_empty());

    let inst = h.instance_of("b", 1);
    assert_eq!(inst.state, IndexState::Ready);
    assert!(!inst.scheduled);
}

#[tokio::test]
async fn hard_build_error_deletes_the_index() {
    let mut h = Harness::start(test_config());
    h.ready().await;

    // A non-rebalance instance never retries, so any build error is
    // fatal to the create.
    h.indexer.fail_all_builds(IndexerError::new(
        IndexerErrorCode::Generic,
        "storage offline",
    ));

    let resp = h
        .request(OpCode::CreateIndex, "i", encode(&test_defn(1, "b", "i", false)))
        .await;
    assert!(
        resp.error.contains("fails to build for reason: storage offline"),
        "unexpected error: {}",
        resp.error
    );
    assert!(h.repo.defn(1).unwrap().is_none());

    // And the name is free again.
    h.indexer.clear_failures();
    let resp = h
        .request(OpCode::CreateIndex, "i", encode(&test_defn(3, "b", "i", false)))
        .await;
    assert_eq!(resp.error, "");
}

#[tokio::test]
async fn rebalance_active_build_error_retries_in_background() {
    let mut h = Harness::start(test_config());
    h.ready().await;

    let resp = h
        .request(OpCode::CreateIndex, "i", encode(&test_defn(1, "b", "i", true)))
        .await;
    assert_eq!(resp.error, "");
    let inst = h.instance_of("b", 1);

    // The rebalancer marks the instance ACTIVE.
    let change = TopologyChange {
        bucket: "b".to_string(),
        defn_id: 1,
        inst_id: inst.inst_id,
        r_state: RebalanceState::Active,
        ..TopologyChange::default()
    };
    let resp = h.request(OpCode::UpdateIndexInst, "", encode(&change)).await;
    assert_eq!(resp.error, "");

    h.indexer.set_build_error(
        inst.inst_id,
        IndexerError::new(IndexerErrorCode::Generic, "transient failure"),
    );

    let list = IndexIdList { defn_ids: vec![1] };
    let resp = h.request(OpCode::BuildIndex, "1", encode(&list)).await;
    assert!(
        resp.error.contains("will retry building in the background"),
        "unexpected error: {}",
        resp.error
    );

    // The retry message is persisted on the instance and the build
    // intent survives.
    let inst = h.instance_of("b", 1);
    assert!(inst.error.contains("will retry building in the background"));
    assert!(inst.scheduled);
    assert!(h.repo.defn(1).unwrap().is_some());
}

#[tokio::test]
async fn drop_is_idempotent() {
    let mut h = Harness::start(test_config());
    h.ready().await;

    let resp = h
        .request(OpCode::CreateIndex, "i", encode(&test_defn(1, "b", "i", true)))
        .await;
    assert_eq!(resp.error, "");

    let resp = h.request(OpCode::DropIndex, "1", Vec::new()).await;
    assert_eq!(resp.error, "");
    assert!(h.repo.defn(1).unwrap().is_none());

    // Second drop is a silent no-op.
    let resp = h.request(OpCode::DropIndex, "1", Vec::new()).await;
    assert_eq!(resp.error, "");
}

#[tokio::test]
async fn create_drop_create_succeeds() {
    let mut h = Harness::start(test_config());
    h.ready().await;

    let defn = test_defn(1, "b", "i", true);
    assert_eq!(h.request(OpCode::CreateIndex, "i", encode(&defn)).await.error, "");
    assert_eq!(h.request(OpCode::DropIndex, "1", Vec::new()).await.error, "");
    assert_eq!(h.request(OpCode::CreateIndex, "i", encode(&defn)).await.error, "");
    assert!(h.repo.defn(1).unwrap().is_some());
}

#[tokio::test]
async fn failed_indexer_drop_keeps_metadata_for_retry() {
    let mut h = Harness::start(test_config());
    h.ready().await;

    assert_eq!(
        h.request(OpCode::CreateIndex, "i", encode(&test_defn(1, "b", "i", true)))
            .await
            .error,
        ""
    );

    h.indexer
        .set_delete_error(IndexerError::new(IndexerErrorCode::Generic, "disk stuck"));
    let resp = h.request(OpCode::DropIndex, "1", Vec::new()).await;
    assert!(
        resp.error.contains("Drop index will retry in background"),
        "unexpected error: {}",
        resp.error
    );
    // Metadata stays so the client (or janitor) can retry.
    assert!(h.repo.defn(1).unwrap().is_some());

    // An "already gone" verdict counts as success.
    h.indexer.set_delete_error(IndexerError::new(
        IndexerErrorCode::IndexNotExist,
        "no such index",
    ));
    let resp = h.request(OpCode::DropIndex, "1", Vec::new()).await;
    assert_eq!(resp.error, "");
    assert!(h.repo.defn(1).unwrap().is_none());
}

// ── Bootstrap gating ───────────────────────────────────────────────

#[tokio::test]
async fn writes_stall_until_indexer_ready() {
    let mut h = Harness::start(test_config());

    // A create submitted before readiness stalls in the incoming queue.
    let create_req = h
        .submit(OpCode::CreateIndex, "i", encode(&test_defn(1, "b", "i", true)))
        .await;

    // A whitelisted opcode runs during bootstrap (no-op here: unknown
    // definition).
    let change = TopologyChange {
        bucket: "b".to_string(),
        defn_id: 99,
        inst_id: 1,
        state: IndexState::Active,
        ..TopologyChange::default()
    };
    let update_req = h.submit(OpCode::UpdateIndexInst, "", encode(&change)).await;

    // The bootstrap-queue response arrives while the create is still
    // parked.
    let resp = h.expect_response(update_req).await;
    assert_eq!(resp.error, "");
    assert!(!h.manager.is_ready());

    h.ready().await;
    let resp = h.expect_response(create_req).await;
    assert_eq!(resp.error, "");
    assert!(h.manager.is_ready());
}

#[tokio::test]
async fn service_map_is_served_before_ready() {
    let mut h = Harness::start(test_config());

    let resp = h.request(OpCode::ServiceMap, "", Vec::new()).await;
    assert_eq!(resp.error, "");

    let map: ServiceMap = serde_json::from_slice(&resp.result).unwrap();
    assert_eq!(map.indexer_id, "indexer-1");
    assert_eq!(map.node_uuid, "node-uuid-1");
    assert_eq!(map.server_group, "Group 1");
    assert_eq!(map.indexer_version, INDEXER_VERSION);

    // A successful service-map fetch also refreshes stats.
    assert_eq!(h.indexer.fetch_stats_count(), 1);
}

#[tokio::test]
async fn every_request_gets_exactly_one_response() {
    let mut h = Harness::start(test_config());
    h.ready().await;

    let mut req_ids = Vec::new();
    for i in 0..5u64 {
        // Drops of unknown definitions succeed silently.
        req_ids.push(h.submit(OpCode::DropIndex, &format!("{}", 100 + i), Vec::new()).await);
    }
    for req_id in req_ids {
        let resp = h.expect_response(req_id).await;
        assert_eq!(resp.req_id, req_id);
        assert_eq!(resp.error, "");
    }
}

#[tokio::test]
async fn handler_panic_does_not_stop_the_loop() {
    let mut h = Harness::start(test_config());
    h.ready().await;

    h.indexer.panic_on_build();
    let resp = h
        .request(OpCode::CreateIndex, "i", encode(&test_defn(1, "b", "i", false)))
        .await;
    assert!(resp.error.contains("panicked"), "unexpected error: {}", resp.error);

    // The dispatcher is still alive.
    h.indexer.clear_failures();
    let resp = h
        .request(OpCode::CreateIndex, "j", encode(&test_defn(2, "b", "j", true)))
        .await;
    assert_eq!(resp.error, "");
}

// ── Janitor ────────────────────────────────────────────────────────

#[tokio::test]
async fn delete_token_replay_drops_once() {
    let config = LifecycleConfig {
        janitor_interval: Duration::from_millis(200),
        ..test_config()
    };
    let h = Harness::start(config);

    // Definition 42 survives from a previous incarnation, together
    // with a durable delete token.
    let defn = test_defn(42, "b", "doomed", true);
    h.repo.create_defn(&defn).unwrap();
    h.repo
        .add_instance_to_topology(&defn, 420, 0, 0, &[0], &[0], 1, false)
        .unwrap();
    DeleteToken { defn_id: 42 }.post(&h.coord).unwrap();

    h.ready().await;

    // One janitor cycle drops the definition.
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if h.repo.defn(42).unwrap().is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("janitor did not drop the index");

    let deletes = h.indexer.delete_count();
    assert_eq!(deletes, 1);

    // Further cycles with the token still present emit nothing new.
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(h.indexer.delete_count(), deletes);
}

#[tokio::test]
async fn janitor_reaps_deleted_instances() {
    let config = LifecycleConfig {
        janitor_interval: Duration::from_millis(200),
        ..test_config()
    };
    let h = Harness::start(config);

    // An instance stuck in DELETED (say, a crash mid-drop) with a
    // second live instance, so only the dead one is reaped.
    let defn = test_defn(7, "b", "half-dead", true);
    h.repo.create_defn(&defn).unwrap();
    let mut topology = BucketTopology::new("b");
    topology.add_instance(7, 70, 0, 0, &[0], &[0], 1, "plasma", false, "indexer-1");
    topology.add_instance(7, 71, 0, 1, &[0], &[0], 1, "plasma", false, "indexer-1");
    topology.update_state(7, 70, IndexState::Deleted);
    topology.update_state(7, 71, IndexState::Ready);
    h.repo.set_topology("b", &topology).unwrap();

    h.ready().await;

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let topology = h.repo.topology("b").unwrap().unwrap();
            if topology.instance(7, 70).is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("janitor did not reap the deleted instance");

    // The live replica is untouched.
    let topology = h.repo.topology("b").unwrap().unwrap();
    assert!(topology.instance(7, 71).is_some());
    assert!(h.repo.defn(7).unwrap().is_some());
}

// ── Builder ────────────────────────────────────────────────────────

#[tokio::test]
async fn builder_respects_batch_quota() {
    let config = LifecycleConfig {
        build_batch_size: 3,
        builder_tick: Duration::from_millis(200),
        builder_settle: Duration::ZERO,
        ..test_config()
    };
    let mut h = Harness::start(config);
    h.cluster.set_bucket("b2", "uuid-b2");
    h.ready().await;

    // Five deferred READY instances across two buckets.
    for (defn_id, bucket, name) in [
        (1, "b", "i1"),
        (2, "b", "i2"),
        (3, "b", "i3"),
        (4, "b2", "j1"),
        (5, "b2", "j2"),
    ] {
        let resp = h
            .request(OpCode::CreateIndex, name, encode(&test_defn(defn_id, bucket, name, true)))
            .await;
        assert_eq!(resp.error, "");
    }
    assert!(h.indexer.build_calls().is_empty());

    // Durable build tokens request all five.
    for defn_id in 1..=5 {
        BuildToken { defn_id }.post(&h.coord).unwrap();
    }

    // The first builder tick submits exactly batch_size definitions;
    // bucket "b" (backlog 3 == quota) goes first.
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if !h.indexer.build_calls().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("builder never issued a build");

    let builds = h.indexer.build_calls();
    assert_eq!(builds[0].len(), 3, "one tick builds exactly the quota");
}

// ── Rebalance: overlap, merge, prune ───────────────────────────────

fn partitioned_defn(defn_id: DefnId, bucket: &str, name: &str) -> IndexDefinition {
    IndexDefinition {
        partition_scheme: PartitionScheme::Hash,
        num_partitions: 2,
        ..test_defn(defn_id, bucket, name, true)
    }
}

#[tokio::test]
async fn rebalance_partition_overlap_is_rejected() {
    let mut h = Harness::start(test_config());
    h.ready().await;

    // Existing partitioned instance holding partition 7 at version 2,
    // rebalance-ACTIVE.
    let defn = partitioned_defn(1, "b", "p");
    h.repo.create_defn(&defn).unwrap();
    let mut topology = BucketTopology::new("b");
    topology.add_instance(1, 10, 0, 0, &[7], &[2], 1, "plasma", false, "indexer-1");
    topology.update_state(1, 10, IndexState::Ready);
    topology.update_rstate(1, 10, RebalanceState::Active);
    h.repo.set_topology("b", &topology).unwrap();

    // A rebalance-origin create for the same partition at the same
    // version must not land.
    let mut incoming = partitioned_defn(1, "b", "p");
    incoming.inst_id = 20;
    incoming.real_inst_id = 10;
    incoming.partitions = vec![7];
    incoming.versions = vec![2];
    incoming.num_partitions = 1;

    let resp = h
        .request(OpCode::CreateIndexRebal, "p", encode(&incoming))
        .await;
    assert!(
        resp.error.contains("overlapping partition"),
        "unexpected error: {}",
        resp.error
    );
}

#[tokio::test]
async fn rebalance_create_requires_real_inst_id() {
    let mut h = Harness::start(test_config());
    h.ready().await;

    h.repo.create_defn(&partitioned_defn(1, "b", "p")).unwrap();
    let mut topology = BucketTopology::new("b");
    topology.add_instance(1, 10, 0, 0, &[1], &[1], 1, "plasma", false, "indexer-1");
    topology.update_state(1, 10, IndexState::Ready);
    h.repo.set_topology("b", &topology).unwrap();

    let mut incoming = partitioned_defn(1, "b", "p");
    incoming.partitions = vec![2];
    incoming.versions = vec![1];

    let resp = h
        .request(OpCode::CreateIndexRebal, "p", encode(&incoming))
        .await;
    assert!(
        resp.error.contains("Missing real instance id"),
        "unexpected error: {}",
        resp.error
    );
}

#[tokio::test]
async fn merge_partition_moves_partitions_atomically() {
    let mut h = Harness::start(test_config());
    h.ready().await;

    let defn = partitioned_defn(1, "b", "p");
    h.repo.create_defn(&defn).unwrap();
    let mut topology = BucketTopology::new("b");
    topology.add_instance(1, 10, 0, 0, &[1, 2], &[1, 1], 2, "plasma", false, "indexer-1");
    topology.add_instance(1, 20, 0, 0, &[3], &[1], 1, "plasma", false, "indexer-1");
    h.repo.set_topology("b", &topology).unwrap();

    let merge = MergePartitionRequest {
        defn_id: 1,
        src_inst_id: 10,
        src_r_state: RebalanceState::Merged,
        tgt_inst_id: 20,
        tgt_partitions: vec![1, 2],
        tgt_versions: vec![2, 2],
        tgt_inst_version: 5,
    };
    let resp = h.request(OpCode::MergePartition, "", encode(&merge)).await;
    assert_eq!(resp.error, "");

    let topology = h.repo.topology("b").unwrap().unwrap();
    let src = topology.instance(1, 10).unwrap();
    assert!(src.partitions.is_empty());
    assert_eq!(src.rstate, RebalanceState::Merged);

    let tgt = topology.instance(1, 20).unwrap();
    assert_eq!(tgt.partitions.len(), 3);
    assert_eq!(tgt.version, 5);
}

#[tokio::test]
async fn prune_splits_partitions_into_proxy() {
    let mut h = Harness::start(test_config());
    h.ready().await;

    let defn = partitioned_defn(1, "b", "p");
    h.repo.create_defn(&defn).unwrap();
    let mut topology = BucketTopology::new("b");
    topology.add_instance(1, 10, 0, 0, &[1, 2, 3], &[1, 1, 1], 3, "plasma", false, "indexer-1");
    topology.update_state(1, 10, IndexState::Ready);
    h.repo.set_topology("b", &topology).unwrap();

    let mut target = partitioned_defn(1, "b", "p");
    target.inst_id = 10;
    target.partitions = vec![2];
    let drop = DropInstanceRequest {
        defn: target,
        cleanup: true,
    };
    let resp = h
        .request(OpCode::DropOrPruneInstance, "1", encode(&drop))
        .await;
    assert_eq!(resp.error, "");

    let topology = h.repo.topology("b").unwrap().unwrap();
    let source = topology.instance(1, 10).unwrap();
    let remaining: Vec<PartitionId> = source.partitions.iter().map(|p| p.part_id).collect();
    assert_eq!(remaining, vec![1, 3]);

    // A proxy instance carries the split partition.
    let insts = topology.instances_by_defn(1);
    let proxy = insts.iter().find(|i| i.real_inst_id == 10).unwrap();
    assert_eq!(proxy.partitions.len(), 1);
    assert_eq!(proxy.partitions[0].part_id, 2);

    assert_eq!(h.indexer.prune_calls(), vec![(10, vec![2])]);
}

#[tokio::test]
async fn full_prune_collapses_to_instance_drop() {
    let mut h = Harness::start(test_config());
    h.ready().await;

    let defn = partitioned_defn(1, "b", "p");
    h.repo.create_defn(&defn).unwrap();
    let mut topology = BucketTopology::new("b");
    topology.add_instance(1, 10, 0, 0, &[1, 2], &[1, 1], 2, "plasma", false, "indexer-1");
    topology.add_instance(1, 20, 0, 1, &[3], &[1], 1, "plasma", false, "indexer-1");
    topology.update_state(1, 10, IndexState::Ready);
    topology.update_state(1, 20, IndexState::Ready);
    h.repo.set_topology("b", &topology).unwrap();

    // Pruning every partition of an unproxied instance drops it.
    let mut target = partitioned_defn(1, "b", "p");
    target.inst_id = 10;
    target.partitions = vec![1, 2];
    let drop = DropInstanceRequest {
        defn: target,
        cleanup: true,
    };
    let resp = h
        .request(OpCode::DropOrPruneInstance, "1", encode(&drop))
        .await;
    assert_eq!(resp.error, "");

    let topology = h.repo.topology("b").unwrap().unwrap();
    assert!(topology.instance(1, 10).is_none());
    assert!(topology.instance(1, 20).is_some());
    assert_eq!(h.indexer.delete_count(), 1);
}

// ── Bucket fan-out / defer cleanup ─────────────────────────────────

#[tokio::test]
async fn delete_bucket_honors_stream_filter() {
    let mut h = Harness::start(test_config());
    h.ready().await;

    // Index 1 on the maintenance stream, index 2 on the init stream.
    for (defn_id, name) in [(1, "m"), (2, "n")] {
        h.repo.create_defn(&test_defn(defn_id, "b", name, true)).unwrap();
    }
    let mut topology = BucketTopology::new("b");
    topology.add_instance(1, 10, 0, 0, &[0], &[0], 1, "plasma", false, "indexer-1");
    topology.add_instance(2, 20, 0, 0, &[0], &[0], 1, "plasma", false, "indexer-1");
    topology.update_state(1, 10, IndexState::Ready);
    topology.update_state(2, 20, IndexState::Ready);
    topology.update_stream(1, 10, StreamId::Maint);
    topology.update_stream(2, 20, StreamId::Init);
    h.repo.set_topology("b", &topology).unwrap();

    // Filter byte 1 = maintenance stream.
    let resp = h.request(OpCode::DeleteBucket, "b", vec![1]).await;
    assert_eq!(resp.error, "");

    assert!(h.repo.defn(1).unwrap().is_none());
    assert!(h.repo.defn(2).unwrap().is_some());

    // Filter byte 0 = any stream: everything goes.
    let resp = h.request(OpCode::DeleteBucket, "b", vec![0]).await;
    assert_eq!(resp.error, "");
    assert!(h.repo.defn(2).unwrap().is_none());
}

#[tokio::test]
async fn cleanup_defer_index_removes_stale_bucket_leftovers() {
    let mut h = Harness::start(test_config());
    h.ready().await;

    // A deferred index created against a previous incarnation of the
    // bucket (stale UUID), no active streams.
    let mut stale = test_defn(1, "b", "stale", true);
    stale.bucket_uuid = "uuid-old".to_string();
    h.repo.create_defn(&stale).unwrap();

    let mut fresh = test_defn(2, "b", "fresh", true);
    fresh.bucket_uuid = "uuid-b".to_string();
    h.repo.create_defn(&fresh).unwrap();

    let mut topology = BucketTopology::new("b");
    topology.add_instance(1, 10, 0, 0, &[0], &[0], 1, "plasma", false, "indexer-1");
    topology.add_instance(2, 20, 0, 0, &[0], &[0], 1, "plasma", false, "indexer-1");
    topology.update_state(1, 10, IndexState::Ready);
    topology.update_state(2, 20, IndexState::Ready);
    h.repo.set_topology("b", &topology).unwrap();

    let resp = h.request(OpCode::CleanupDeferIndex, "b", Vec::new()).await;
    assert_eq!(resp.error, "");

    assert!(h.repo.defn(1).unwrap().is_none(), "stale index dropped");
    assert!(h.repo.defn(2).unwrap().is_some(), "current index kept");
}

// ── Reset / stats / config ─────────────────────────────────────────

#[tokio::test]
async fn reset_index_restores_ready_under_new_storage_mode() {
    let mut h = Harness::start(test_config());
    h.ready().await;

    let defn = test_defn(1, "b", "i", false);
    h.repo.create_defn(&defn).unwrap();
    let mut topology = BucketTopology::new("b");
    topology.add_instance(1, 10, 0, 0, &[0], &[0], 1, "plasma", false, "indexer-1");
    topology.update_state(1, 10, IndexState::Ready);
    topology.update_state(1, 10, IndexState::Initial);
    topology.update_state(1, 10, IndexState::Active);
    topology.update_stream(1, 10, StreamId::Maint);
    h.repo.set_topology("b", &topology).unwrap();

    let mut upgraded = defn.clone();
    upgraded.using = StorageKind::MemoryOptimized;
    let inst = IndexInstance {
        inst_id: 10,
        state: IndexState::Active,
        defn: upgraded,
    };
    let resp = h.request(OpCode::ResetIndex, "", encode(&inst)).await;
    assert_eq!(resp.error, "");

    assert_eq!(
        h.repo.defn(1).unwrap().unwrap().using,
        StorageKind::MemoryOptimized
    );

    let topology = h.repo.topology("b").unwrap().unwrap();
    let inst = topology.instance(1, 10).unwrap();
    assert_eq!(inst.state, IndexState::Ready);
    assert_eq!(inst.stream, StreamId::Nil);
    assert_eq!(inst.old_storage_mode, "plasma");
    assert_eq!(inst.storage_mode, "memory_optimized");
    assert!(inst.scheduled, "an active index reschedules its build");
    assert!(inst.error.is_empty());
}

#[tokio::test]
async fn broadcast_stats_filters_progress_keys() {
    let mut h = Harness::start(test_config());
    h.ready().await;

    let stats = serde_json::json!({
        "b:i:num_docs_pending": 12,
        "b:i:num_docs_queued": 3,
        "b:i:last_rollback_time": "0",
        "b:i:progress_stat_time": "17",
        "b:i:scan_duration": 99,
        "memory_used": 1024,
    });
    let resp = h
        .request(OpCode::BroadcastStats, "", encode(&stats))
        .await;
    assert_eq!(resp.error, "");

    let stats = h.repo.last_stats().unwrap().unwrap();
    assert_eq!(stats.stats.len(), 4);
    assert!(stats.stats.contains_key("b:i:num_docs_pending"));
    assert!(!stats.stats.contains_key("b:i:scan_duration"));

    // Malformed stats are dropped without failing the request.
    let resp = h
        .request(OpCode::BroadcastStats, "", b"not json".to_vec())
        .await;
    assert_eq!(resp.error, "");
}

#[tokio::test]
async fn config_update_requires_the_full_map() {
    let mut h = Harness::start(test_config());
    h.ready().await;

    let full = serde_json::json!({
        BUILD_BATCH_SIZE_KEY: 8,
        BUILD_DISABLE_KEY: false,
    });
    let resp = h.request(OpCode::ConfigUpdate, "", encode(&full)).await;
    assert_eq!(resp.error, "");

    let partial = serde_json::json!({ BUILD_DISABLE_KEY: true });
    let resp = h.request(OpCode::ConfigUpdate, "", encode(&partial)).await;
    assert!(resp.error.contains("missing config key"));
}

#[tokio::test]
async fn non_enterprise_rejects_replicas_and_partitions() {
    let config = LifecycleConfig {
        enterprise: false,
        ..test_config()
    };
    let mut h = Harness::start(config);
    h.ready().await;

    let mut replicated = test_defn(1, "b", "i", false);
    replicated.num_replica = 1;
    let resp = h.request(OpCode::CreateIndex, "i", encode(&replicated)).await;
    assert_eq!(resp.error, "Index Replica not supported in non-Enterprise Edition");

    let resp = h
        .request(OpCode::CreateIndex, "p", encode(&partitioned_defn(2, "b", "p")))
        .await;
    assert_eq!(
        resp.error,
        "Index Partitioning is not supported in non-Enterprise Edition"
    );
}

// ── Updator ────────────────────────────────────────────────────────

#[tokio::test]
async fn updator_broadcasts_service_map_on_drift() {
    let config = LifecycleConfig {
        updator_interval: Duration::from_millis(100),
        ..test_config()
    };
    let h = Harness::start(config);
    assert!(h.repo.last_service_map().unwrap().is_none());

    h.ready().await;

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if h.repo.last_service_map().unwrap().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("updator never broadcast the service map");

    let map = h.repo.last_service_map().unwrap().unwrap();
    assert_eq!(map.node_addr, "127.0.0.1:8091");
    assert_eq!(map.server_group, "Group 1");
}

// ── Shutdown ───────────────────────────────────────────────────────

#[tokio::test]
async fn shutdown_stops_the_dispatcher() {
    let h = Harness::start(test_config());
    h.ready().await;
    h.manager.shutdown();

    // Give the dispatcher a beat to observe the kill signal, then a
    // submitted request should never produce a response.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let _ = h
        .manager
        .submit(RequestPacket::new(OpCode::DropIndex, 9, "1", Vec::new(), "test"))
        .await;
    // Nothing to assert beyond "does not hang": the kill signal lets
    // in-flight handlers finish and the loop exit.
}
