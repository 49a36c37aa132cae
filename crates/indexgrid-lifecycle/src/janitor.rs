//! Janitor — periodic cleanup of deleted indexes.
//!
//! Two passes per cycle: replay delete tokens from the coordination
//! store, and sweep the repository for instances stuck in DELETED.
//! The janitor never mutates the repository itself — every cleanup is
//! an asynchronous request back into the dispatcher, which preserves
//! the single-writer invariant.

use std::sync::Arc;

use tracing::{info, warn};

use indexgrid_coord::{DeleteToken, DELETE_TOKEN_ROOT};
use indexgrid_meta::{IndexState, RebalanceState};

use crate::manager::Inner;
use crate::request::{DropInstanceRequest, OpCode, RequestServer};

pub(crate) struct Janitor {
    inner: Arc<Inner>,
    server: RequestServer,
}

impl Janitor {
    pub(crate) fn new(inner: Arc<Inner>, server: RequestServer) -> Self {
        Janitor { inner, server }
    }

    pub(crate) async fn run(self) {
        let mut kill_rx = self.inner.kill_tx.subscribe();

        let mut ticker = tokio::time::interval(self.inner.config.janitor_interval);
        // The first interval tick completes immediately; that is the
        // eager startup run.
        loop {
            tokio::select! {
                _ = ticker.tick() => self.cleanup().await,
                _ = kill_rx.changed() => {
                    info!("janitor: terminating");
                    return;
                }
            }
        }
    }

    async fn cleanup(&self) {
        info!("janitor: running cleanup");

        // Pass 1: delete tokens.
        match self.inner.coord.list_children(DELETE_TOKEN_ROOT) {
            Ok(entries) => {
                for (path, value) in entries {
                    info!(%path, "janitor: processing delete token");

                    let token = match DeleteToken::decode(&value) {
                        Ok(token) => token,
                        Err(e) => {
                            warn!(%path, error = %e, "janitor: skipping malformed delete token");
                            continue;
                        }
                    };

                    let defn = match self.inner.repo.defn(token.defn_id) {
                        Ok(defn) => defn,
                        Err(e) => {
                            warn!(%path, error = %e, "janitor: failed to read definition; skipping token");
                            continue;
                        }
                    };
                    // Already deleted, or the index never lived on this node.
                    if defn.is_none() {
                        continue;
                    }

                    match self
                        .server
                        .make_async_request(
                            OpCode::DropIndex,
                            &token.defn_id.to_string(),
                            Vec::new(),
                        )
                        .await
                    {
                        Ok(()) => {
                            info!(defn_id = token.defn_id, "janitor: cleaning up deleted index")
                        }
                        Err(e) => {
                            warn!(defn_id = token.defn_id, error = %e, "janitor: failed to submit drop request")
                        }
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "janitor: failed to list delete tokens");
                return;
            }
        }

        // Pass 2: instances stuck in DELETED. Rebalance bookkeeping
        // states (pending-delete, merged) are the rebalancer's to
        // clean, not ours.
        let defns = match self.inner.repo.iter_defns() {
            Ok(defns) => defns,
            Err(e) => {
                warn!(error = %e, "janitor: failed to iterate definitions");
                return;
            }
        };

        for defn in defns {
            let insts = match self.inner.find_all_local_insts(&defn.bucket, defn.defn_id) {
                Ok(insts) => insts,
                Err(e) => {
                    warn!(bucket = %defn.bucket, name = %defn.name, error = %e,
                        "janitor: failed to find index instances; skipping");
                    continue;
                }
            };

            for inst in insts {
                if inst.state != IndexState::Deleted
                    || inst.rstate == RebalanceState::PendingDelete
                    || inst.rstate == RebalanceState::Merged
                {
                    continue;
                }

                let mut payload_defn = defn.clone();
                payload_defn.inst_id = inst.inst_id;
                payload_defn.partitions = Vec::new();
                let request = DropInstanceRequest {
                    defn: payload_defn,
                    cleanup: true,
                };

                let content = match serde_json::to_vec(&request) {
                    Ok(content) => content,
                    Err(e) => {
                        warn!(defn_id = defn.defn_id, inst_id = inst.inst_id, error = %e,
                            "janitor: failed to encode drop-instance request; skipping");
                        continue;
                    }
                };

                match self
                    .server
                    .make_async_request(
                        OpCode::DropOrPruneInstance,
                        &defn.defn_id.to_string(),
                        content,
                    )
                    .await
                {
                    Ok(()) => info!(
                        bucket = %defn.bucket,
                        name = %defn.name,
                        inst_id = inst.inst_id,
                        "janitor: cleaning up deleted instance"
                    ),
                    Err(e) => warn!(
                        bucket = %defn.bucket,
                        name = %defn.name,
                        inst_id = inst.inst_id,
                        error = %e,
                        "janitor: failed to submit drop-instance request"
                    ),
                }
            }
        }
    }
}
