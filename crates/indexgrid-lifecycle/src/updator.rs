//! Updator — republishes the service map when it drifts.
//!
//! Every cycle it recomputes the local service map and compares the
//! fields that matter (server group, indexer version, node address,
//! cluster version) against the last broadcast; on any difference it
//! broadcasts the new map and memoizes it.

use std::sync::Arc;

use tracing::{error, info};

use crate::manager::Inner;

pub(crate) struct Updator {
    inner: Arc<Inner>,
    indexer_version: u64,
    server_group: String,
    node_addr: String,
    cluster_version: u64,
}

impl Updator {
    pub(crate) fn new(inner: Arc<Inner>) -> Self {
        Updator {
            inner,
            indexer_version: 0,
            server_group: String::new(),
            node_addr: String::new(),
            cluster_version: 0,
        }
    }

    pub(crate) async fn run(mut self) {
        let mut kill_rx = self.inner.kill_tx.subscribe();
        let mut ticker = tokio::time::interval(self.inner.config.updator_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.check_service_map(),
                _ = kill_rx.changed() => {
                    info!("updator: terminating");
                    return;
                }
            }
        }
    }

    fn check_service_map(&mut self) {
        let map = match self.inner.service_map() {
            Ok(map) => map,
            Err(e) => {
                error!(error = %e, "updator: failed to compute service map");
                return;
            }
        };

        if map.server_group != self.server_group
            || map.indexer_version != self.indexer_version
            || map.node_addr != self.node_addr
            || map.cluster_version != self.cluster_version
        {
            self.server_group = map.server_group.clone();
            self.indexer_version = map.indexer_version;
            self.node_addr = map.node_addr.clone();
            self.cluster_version = map.cluster_version;

            info!(
                server_group = %self.server_group,
                indexer_version = self.indexer_version,
                node_addr = %self.node_addr,
                cluster_version = self.cluster_version,
                "updator: broadcasting service map"
            );

            if let Err(e) = self.inner.repo.broadcast_service_map(&map) {
                error!(error = %e, "updator: failed to broadcast service map");
            }
        }
    }
}
