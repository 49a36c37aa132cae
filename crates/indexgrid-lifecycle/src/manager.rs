//! LifecycleManager — the single-writer event loop.
//!
//! All metadata-mutating operations on this node funnel through one
//! dispatcher task fed by two bounded queues. Until the indexer
//! signals readiness, only a whitelist of repair opcodes is admitted
//! (through the bootstrap queue); everything else stalls in the
//! regular queue. INDEXER_READY is a one-way latch: it closes the
//! bootstrap queue, and once that queue drains the dispatcher moves on
//! to client traffic. It also starts the janitor, builder, and updator
//! tasks.
//!
//! A handler failure never stops the loop — it becomes a per-request
//! error, and panics are caught at the loop boundary.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use futures_util::FutureExt;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info};

use indexgrid_coord::CoordStore;
use indexgrid_meta::{IndexDefinition, MetadataRepo};

use crate::builder::Builder;
use crate::cluster::ClusterInfoCache;
use crate::config::{BuildSettings, LifecycleConfig};
use crate::error::{LifecycleError, LifecycleResult};
use crate::janitor::Janitor;
use crate::notifier::{IndexerNotifier, RequestContext};
use crate::request::{
    OpCode, RequestPacket, RequestServer, ResponsePacket, INTERNAL_FID,
};
use crate::updator::Updator;

/// Capacity of the bootstrap and incoming request queues.
const REQUEST_QUEUE_CAP: usize = 1000;

/// Capacity of the outgoing response queue.
const RESPONSE_QUEUE_CAP: usize = 1000;

/// Capacity of the builder's retry notification channel.
const BUILDER_NOTIFY_CAP: usize = 10_000;

/// Shared state of the lifecycle manager.
pub(crate) struct Inner {
    pub(crate) repo: MetadataRepo,
    pub(crate) coord: CoordStore,
    pub(crate) cinfo: ClusterInfoCache,
    pub(crate) notifier: Arc<dyn IndexerNotifier>,
    pub(crate) config: LifecycleConfig,
    pub(crate) settings: BuildSettings,
    pub(crate) builder_tx: mpsc::Sender<IndexDefinition>,
    pub(crate) kill_tx: watch::Sender<bool>,

    incomings_tx: mpsc::Sender<RequestPacket>,
    /// Dropped when INDEXER_READY arrives, closing the bootstrap queue.
    bootstraps_tx: Mutex<Option<mpsc::Sender<RequestPacket>>>,
    outgoings_tx: mpsc::Sender<ResponsePacket>,
    /// Taken by the builder task when it starts.
    builder_rx: Mutex<Option<mpsc::Receiver<IndexDefinition>>>,
    indexer_ready: AtomicBool,
    next_req_id: AtomicU64,
}

/// Handle to a running lifecycle manager.
#[derive(Clone)]
pub struct LifecycleManager {
    inner: Arc<Inner>,
}

impl LifecycleManager {
    /// Start the manager: spawns the dispatcher task and returns the
    /// handle plus the outgoing response stream.
    pub fn start(
        repo: MetadataRepo,
        coord: CoordStore,
        cinfo: ClusterInfoCache,
        notifier: Arc<dyn IndexerNotifier>,
        config: LifecycleConfig,
    ) -> (LifecycleManager, mpsc::Receiver<ResponsePacket>) {
        let (incomings_tx, incomings_rx) = mpsc::channel(REQUEST_QUEUE_CAP);
        let (bootstraps_tx, bootstraps_rx) = mpsc::channel(REQUEST_QUEUE_CAP);
        let (outgoings_tx, outgoings_rx) = mpsc::channel(RESPONSE_QUEUE_CAP);
        let (builder_tx, builder_rx) = mpsc::channel(BUILDER_NOTIFY_CAP);
        let (kill_tx, _) = watch::channel(false);

        let settings = BuildSettings::new(&config);
        let inner = Arc::new(Inner {
            repo,
            coord,
            cinfo,
            notifier,
            config,
            settings,
            builder_tx,
            kill_tx,
            incomings_tx,
            bootstraps_tx: Mutex::new(Some(bootstraps_tx)),
            outgoings_tx,
            builder_rx: Mutex::new(Some(builder_rx)),
            indexer_ready: AtomicBool::new(false),
            next_req_id: AtomicU64::new(1 << 32),
        });

        tokio::spawn(run_dispatcher(
            Arc::clone(&inner),
            bootstraps_rx,
            incomings_rx,
        ));

        (LifecycleManager { inner }, outgoings_rx)
    }

    /// Submit a request into the manager.
    pub async fn submit(&self, packet: RequestPacket) -> LifecycleResult<()> {
        self.inner.enqueue(packet).await
    }

    /// The narrow submit-only capability for background components and
    /// server layers.
    pub fn request_server(&self) -> RequestServer {
        RequestServer {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Whether INDEXER_READY has been observed.
    pub fn is_ready(&self) -> bool {
        self.inner.indexer_ready.load(Ordering::Acquire)
    }

    /// Terminate the dispatcher and all background tasks. Handlers in
    /// flight are allowed to finish.
    pub fn shutdown(&self) {
        let _ = self.inner.kill_tx.send(true);
    }
}

impl Inner {
    pub(crate) fn next_req_id(&self) -> u64 {
        self.next_req_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Route a request to the right queue, or handle it inline for the
    /// two distinguished opcodes.
    pub(crate) async fn enqueue(self: &Arc<Self>, packet: RequestPacket) -> LifecycleResult<()> {
        debug!(op = ?packet.op, req_id = packet.req_id, "queuing new request");

        match packet.op {
            OpCode::IndexerReady => {
                // One-way latch; no response is emitted.
                self.mark_ready();
                Ok(())
            }
            OpCode::ServiceMap => {
                // Read-only shortcut: handled immediately on a fresh
                // worker without entering either queue.
                let inner = Arc::clone(self);
                tokio::spawn(async move {
                    inner.dispatch(packet).await;
                });
                Ok(())
            }
            op => {
                if !self.indexer_ready.load(Ordering::Acquire) && op.bootstrap_allowed() {
                    let tx = self
                        .bootstraps_tx
                        .lock()
                        .expect("bootstrap sender poisoned")
                        .clone();
                    if let Some(tx) = tx {
                        return tx.send(packet).await.map_err(|_| LifecycleError::Shutdown);
                    }
                }
                self.incomings_tx
                    .send(packet)
                    .await
                    .map_err(|_| LifecycleError::Shutdown)
            }
        }
    }

    /// Mark the indexer ready, start the reconcilers, and close the
    /// bootstrap queue so the dispatcher drains it and moves on.
    fn mark_ready(self: &Arc<Self>) {
        if self.indexer_ready.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("indexer ready; starting janitor, builder, and updator");

        let server = RequestServer {
            inner: Arc::clone(self),
        };

        tokio::spawn(Janitor::new(Arc::clone(self), server.clone()).run());

        let builder_rx = self
            .builder_rx
            .lock()
            .expect("builder receiver poisoned")
            .take();
        if let Some(rx) = builder_rx {
            tokio::spawn(Builder::new(Arc::clone(self), server, rx).run());
        }

        tokio::spawn(Updator::new(Arc::clone(self)).run());

        self.bootstraps_tx
            .lock()
            .expect("bootstrap sender poisoned")
            .take();
    }

    /// Run one request through its handler and emit the response.
    pub(crate) async fn dispatch(self: &Arc<Self>, packet: RequestPacket) {
        let RequestPacket {
            op,
            req_id,
            key,
            content,
            fid,
            reply,
        } = packet;

        debug!(?op, req_id, %key, "dispatching request");

        let outcome = AssertUnwindSafe(self.apply(op, &key, &content))
            .catch_unwind()
            .await;

        let (error_str, result) = match outcome {
            Ok(Ok(result)) => (String::new(), result),
            Ok(Err(e)) => (e.to_string(), Vec::new()),
            Err(_) => {
                error!(?op, req_id, "request handler panicked");
                (
                    "internal error: request handler panicked".to_string(),
                    Vec::new(),
                )
            }
        };

        let response = ResponsePacket {
            req_id,
            fid: fid.clone(),
            error: error_str,
            result,
        };

        if let Some(reply) = reply {
            let _ = reply.send(response);
            return;
        }
        if fid == INTERNAL_FID {
            return;
        }
        let _ = self.outgoings_tx.send(response).await;
    }

    /// Exhaustive opcode routing: decode the payload and invoke the
    /// handler.
    async fn apply(&self, op: OpCode, key: &str, content: &[u8]) -> LifecycleResult<Vec<u8>> {
        match op {
            OpCode::CreateIndex => {
                self.handle_create_index(content, RequestContext::user())
                    .await?;
                Ok(Vec::new())
            }
            OpCode::CreateIndexRebal => {
                self.handle_create_index(content, RequestContext::rebalance())
                    .await?;
                Ok(Vec::new())
            }
            OpCode::UpdateIndexInst => {
                self.handle_topology_change(content).await?;
                Ok(Vec::new())
            }
            OpCode::DropIndex => {
                self.handle_delete_index(key, RequestContext::user())
                    .await?;
                Ok(Vec::new())
            }
            OpCode::DropIndexRebal => {
                self.handle_delete_index(key, RequestContext::rebalance())
                    .await?;
                Ok(Vec::new())
            }
            OpCode::BuildIndex => {
                self.handle_build_indexes(content, RequestContext::user(), true)
                    .await?;
                Ok(Vec::new())
            }
            OpCode::BuildIndexRebal => {
                self.handle_build_indexes(content, RequestContext::rebalance(), false)
                    .await?;
                Ok(Vec::new())
            }
            OpCode::BuildIndexRetry => {
                self.handle_build_indexes(content, RequestContext::user(), true)
                    .await?;
                Ok(Vec::new())
            }
            OpCode::ServiceMap => self.handle_service_map(),
            OpCode::DeleteBucket => {
                self.handle_delete_bucket(key, content).await?;
                Ok(Vec::new())
            }
            OpCode::CleanupIndex => {
                self.handle_cleanup_index(content).await?;
                Ok(Vec::new())
            }
            OpCode::CleanupDeferIndex => {
                self.handle_cleanup_defer_index(key).await?;
                Ok(Vec::new())
            }
            OpCode::BroadcastStats => {
                self.handle_broadcast_stats(content);
                Ok(Vec::new())
            }
            OpCode::ResetIndex => {
                self.handle_reset_index(content)?;
                Ok(Vec::new())
            }
            OpCode::ConfigUpdate => {
                self.handle_config_update(content)?;
                Ok(Vec::new())
            }
            OpCode::DropOrPruneInstance => {
                self.handle_drop_or_prune_instance(content, RequestContext::rebalance())
                    .await?;
                Ok(Vec::new())
            }
            OpCode::MergePartition => {
                self.handle_merge_partition(content).await?;
                Ok(Vec::new())
            }
            // Consumed by enqueue(); nothing to do if it ever lands here.
            OpCode::IndexerReady => Ok(Vec::new()),
        }
    }
}

/// The dispatcher: drain the bootstrap queue to completion, then
/// process client requests until shutdown.
async fn run_dispatcher(
    inner: Arc<Inner>,
    mut bootstraps_rx: mpsc::Receiver<RequestPacket>,
    mut incomings_rx: mpsc::Receiver<RequestPacket>,
) {
    let mut kill_rx = inner.kill_tx.subscribe();
    debug!("lifecycle manager ready to process requests");

    loop {
        tokio::select! {
            request = bootstraps_rx.recv() => match request {
                Some(request) => inner.dispatch(request).await,
                None => break,
            },
            _ = kill_rx.changed() => {
                debug!("kill signal received; stopping bootstrap request processing");
                return;
            }
        }
    }

    debug!("bootstrap queue drained; processing client requests");

    loop {
        tokio::select! {
            request = incomings_rx.recv() => match request {
                Some(request) => inner.dispatch(request).await,
                None => return,
            },
            _ = kill_rx.changed() => {
                debug!("kill signal received; stopping client request processing");
                return;
            }
        }
    }
}

/// Allocate a fresh instance id: non-zero and unique enough for token
/// equality across the cluster.
pub(crate) fn new_inst_id() -> u64 {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let mut hasher = DefaultHasher::new();
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
        .hash(&mut hasher);
    COUNTER.fetch_add(1, Ordering::Relaxed).hash(&mut hasher);
    hasher.finish().max(1)
}
