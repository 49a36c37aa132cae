//! Builder — batch scheduler for deferred and recovered index builds.
//!
//! Keeps a per-bucket queue of pending definitions, fed by the
//! dispatcher (build retries, ready hand-offs) and by build tokens in
//! the coordination store. Each tick it computes a quota — the batch
//! size minus whatever is already building — picks the buckets whose
//! backlog sits closest to that quota, and issues one synchronous
//! BUILD_INDEX_RETRY request per bucket back through the dispatcher.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{info, warn};

use indexgrid_coord::{BuildToken, BUILD_TOKEN_ROOT};
use indexgrid_meta::{DefnId, IndexDefinition, IndexState};

use crate::manager::Inner;
use crate::request::{IndexIdList, OpCode, RequestServer};

pub(crate) struct Builder {
    inner: Arc<Inner>,
    server: RequestServer,
    notify_rx: mpsc::Receiver<IndexDefinition>,
    /// bucket → pending definition ids, no duplicates per bucket.
    pendings: HashMap<String, Vec<DefnId>>,
}

impl Builder {
    pub(crate) fn new(
        inner: Arc<Inner>,
        server: RequestServer,
        notify_rx: mpsc::Receiver<IndexDefinition>,
    ) -> Self {
        Builder {
            inner,
            server,
            notify_rx,
            pendings: HashMap::new(),
        }
    }

    pub(crate) async fn run(mut self) {
        self.recover();

        let mut kill_rx = self.inner.kill_tx.subscribe();
        let mut ticker = tokio::time::interval(self.inner.config.builder_tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                Some(defn) = self.notify_rx.recv() => {
                    info!(
                        defn_id = defn.defn_id,
                        bucket = %defn.bucket,
                        "builder: received build request; scheduling"
                    );
                    let bucket = defn.bucket.clone();
                    self.add_pending(&bucket, defn.defn_id);
                }

                _ = ticker.tick() => {
                    self.process_build_token();

                    // Let rebalance tokens settle before issuing
                    // builds, so the builder cannot get ahead of the
                    // rebalancer on a freshly recovered node.
                    tokio::select! {
                        _ = tokio::time::sleep(self.inner.config.builder_settle) => {}
                        _ = kill_rx.changed() => {
                            info!("builder: terminating");
                            return;
                        }
                    }

                    let (build_list, mut quota) = self.get_build_list();
                    for bucket in build_list {
                        quota = self.try_build_index(&bucket, quota).await;
                    }
                }

                _ = kill_rx.changed() => {
                    info!("builder: terminating");
                    return;
                }
            }
        }
    }

    /// Recover pending builds after restart: replay build tokens, then
    /// sweep the repository for READY instances whose scheduled flag
    /// survived.
    fn recover(&mut self) {
        info!("builder: recovering scheduled index builds");

        self.process_build_token();

        let defns = match self.inner.repo.iter_defns() {
            Ok(defns) => defns,
            Err(e) => {
                warn!(error = %e, "builder: unable to read repository; skipping recovery sweep");
                return;
            }
        };

        for defn in defns {
            let insts = match self.inner.find_all_local_insts(&defn.bucket, defn.defn_id) {
                Ok(insts) if !insts.is_empty() => insts,
                _ => {
                    warn!(bucket = %defn.bucket, name = %defn.name,
                        "builder: unable to read index instances; skipping");
                    continue;
                }
            };

            for inst in insts {
                if inst.scheduled && inst.state == IndexState::Ready {
                    let bucket = defn.bucket.clone();
                    if self.add_pending(&bucket, defn.defn_id) {
                        info!(
                            bucket = %defn.bucket,
                            name = %defn.name,
                            replica_id = inst.replica_id,
                            "builder: scheduled index build"
                        );
                    }
                }
            }
        }
    }

    /// Enqueue every build token whose definition still resolves
    /// locally and has at least one READY instance.
    fn process_build_token(&mut self) {
        let entries = match self.inner.coord.list_children(BUILD_TOKEN_ROOT) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "builder: failed to list build tokens");
                return;
            }
        };

        for (path, value) in entries {
            let token = match BuildToken::decode(&value) {
                Ok(token) => token,
                Err(e) => {
                    warn!(%path, error = %e, "builder: skipping malformed build token");
                    continue;
                }
            };

            let defn = match self.inner.repo.defn(token.defn_id) {
                Ok(defn) => defn,
                Err(e) => {
                    warn!(%path, error = %e, "builder: unable to read definition; skipping token");
                    continue;
                }
            };
            // Already deleted, or never lived on this node.
            let Some(defn) = defn else { continue };

            let insts = match self.inner.find_all_local_insts(&defn.bucket, defn.defn_id) {
                Ok(insts) => insts,
                Err(e) => {
                    warn!(bucket = %defn.bucket, name = %defn.name, error = %e,
                        "builder: unable to read index instances; skipping token");
                    continue;
                }
            };

            for inst in insts {
                if inst.state == IndexState::Ready {
                    info!(%path, "builder: processing build token");
                    let bucket = defn.bucket.clone();
                    if self.add_pending(&bucket, defn.defn_id) {
                        info!(bucket = %defn.bucket, name = %defn.name, "builder: scheduled index build");
                    }
                }
            }
        }
    }

    fn add_pending(&mut self, bucket: &str, defn_id: DefnId) -> bool {
        let pending = self.pendings.entry(bucket.to_string()).or_default();
        if pending.contains(&defn_id) {
            return false;
        }
        pending.push(defn_id);
        true
    }

    /// Quota for this tick: the batch size minus every instance
    /// already building, whose buckets are skipped outright.
    fn get_quota(&self) -> (i32, HashSet<String>) {
        let mut quota = self.inner.settings.batch_size();
        let mut skip_list = HashSet::new();

        let defns = match self.inner.repo.iter_defns() {
            Ok(defns) => defns,
            Err(_) => {
                warn!("builder: unable to read repository; skipping quota check");
                return (quota, skip_list);
            }
        };

        for defn in defns {
            let insts = match self.inner.find_all_local_insts(&defn.bucket, defn.defn_id) {
                Ok(insts) if !insts.is_empty() => insts,
                _ => {
                    warn!(bucket = %defn.bucket, name = %defn.name,
                        "builder: unable to read index instances; skipping for quota check");
                    continue;
                }
            };

            for inst in insts {
                if matches!(inst.state, IndexState::Initial | IndexState::Catchup) {
                    quota -= 1;
                    skip_list.insert(defn.bucket.clone());
                }
            }
        }

        (quota, skip_list)
    }

    fn get_build_list(&self) -> (Vec<String>, i32) {
        let (quota, skip_list) = self.get_quota();
        let build_list = sort_build_list(&self.pendings, &skip_list, quota);
        (build_list, quota)
    }

    /// Drain a bucket's pending list into one build batch, bounded by
    /// the quota, and issue it synchronously through the dispatcher.
    /// Returns the remaining quota.
    async fn try_build_index(&mut self, bucket: &str, quota: i32) -> i32 {
        let defn_ids = self.pendings.get(bucket).cloned().unwrap_or_default();
        if defn_ids.is_empty() {
            return quota;
        }
        // Pre-cautionary; the authoritative check is the indexer's.
        if !self.inner.can_build_index(bucket) {
            return quota;
        }

        let mut new_quota = quota;
        let mut build_list: Vec<DefnId> = Vec::new();
        let mut pending_list: Vec<DefnId> = defn_ids.clone();

        for &defn_id in &defn_ids {
            if new_quota == 0 {
                break;
            }
            pending_list.remove(0);

            let defn = match self.inner.repo.defn(defn_id) {
                Ok(Some(defn)) => defn,
                _ => {
                    warn!(defn_id, %bucket, "builder: cannot find index definition; dropping");
                    continue;
                }
            };

            let insts = match self.inner.find_all_local_insts(&defn.bucket, defn_id) {
                Ok(insts) if !insts.is_empty() => insts,
                _ => {
                    warn!(defn_id, %bucket, "builder: cannot find index instances; dropping");
                    continue;
                }
            };

            for inst in insts {
                if new_quota == 0 {
                    break;
                }
                if inst.state != IndexState::Ready {
                    warn!(defn_id, %bucket, "builder: index instance is not in ready state; skipping");
                    continue;
                }

                // Upgrade-driven builds (an old storage mode is
                // recorded) ignore the disable switch.
                if !self.inner.settings.build_disabled() || !inst.old_storage_mode.is_empty() {
                    if !build_list.contains(&defn_id) {
                        build_list.push(defn_id);
                    }
                    new_quota -= 1;
                } else {
                    pending_list.push(defn_id);
                    warn!(defn_id, %bucket, "builder: background build is disabled; will retry next tick");
                }
            }
        }

        if build_list.is_empty() {
            self.set_pending(bucket, pending_list);
            return new_quota;
        }

        let id_list = IndexIdList {
            defn_ids: build_list,
        };
        let key = id_list.defn_ids[0].to_string();
        let content = match serde_json::to_vec(&id_list) {
            Ok(content) => content,
            Err(e) => {
                warn!(error = %e, "builder: failed to encode build list; will retry later");
                return quota;
            }
        };

        info!(%bucket, ids = ?id_list.defn_ids, "builder: issuing index build");

        // Rewrite the residual pending list before issuing: anything
        // that fails retryably flows back through the notify channel.
        self.set_pending(bucket, pending_list.clone());

        if let Err(e) = self
            .server
            .make_request(OpCode::BuildIndexRetry, &key, content)
            .await
        {
            warn!(error = %e, "builder: index build request failed");
        }

        info!(?pending_list, "builder: pending definitions remaining");
        new_quota
    }

    fn set_pending(&mut self, bucket: &str, pending: Vec<DefnId>) {
        if pending.is_empty() {
            self.pendings.remove(bucket);
        } else {
            self.pendings.insert(bucket.to_string(), pending);
        }
    }
}

/// Order the buckets for this tick: skip the busy ones, then prefer
/// the bucket whose backlog is closest to the quota so the batch
/// wastes as little of it as possible.
fn sort_build_list(
    pendings: &HashMap<String, Vec<DefnId>>,
    skip_list: &HashSet<String>,
    quota: i32,
) -> Vec<String> {
    let mut build_list: Vec<String> = pendings
        .keys()
        .filter(|bucket| !skip_list.contains(*bucket))
        .cloned()
        .collect();
    build_list.sort();

    let count = |bucket: &String| pendings.get(bucket).map(Vec::len).unwrap_or(0) as i32;

    // Descending by backlog, then closest-to-quota first; both passes
    // are stable so earlier ordering breaks ties.
    build_list.sort_by(|a, b| count(b).cmp(&count(a)));
    build_list.sort_by_key(|bucket| (count(bucket) - quota).abs());

    build_list
}
