//! Service map assembly and bucket verification.

use std::time::Duration;

use tracing::error;

use indexgrid_meta::{IndexState, ServiceMap, BUCKET_UUID_NIL};

use crate::config::INDEXER_VERSION;
use crate::error::{LifecycleError, LifecycleResult};
use crate::manager::Inner;

/// Attempts for a bucket-UUID fetch before giving up.
const BUCKET_UUID_RETRIES: u32 = 5;

/// Back-off between bucket-UUID fetch attempts.
const BUCKET_UUID_RETRY_DELAY: Duration = Duration::from_millis(100);

impl Inner {
    /// SERVICE_MAP: marshal the current service map. A successful
    /// fetch also nudges the indexer to refresh its stats.
    pub(crate) fn handle_service_map(&self) -> LifecycleResult<Vec<u8>> {
        let map = self.service_map()?;
        let result =
            serde_json::to_vec(&map).map_err(|e| LifecycleError::Internal(e.to_string()))?;
        self.notifier.on_fetch_stats();
        Ok(result)
    }

    /// Recompute the local service map from the cluster-info cache and
    /// the repository's local records.
    pub(crate) fn service_map(&self) -> LifecycleResult<ServiceMap> {
        let snapshot = self.cinfo.fetch()?;

        Ok(ServiceMap {
            indexer_id: self.repo.local_indexer_id()?,
            scan_addr: snapshot.scan_addr,
            http_addr: snapshot.http_addr,
            admin_addr: snapshot.admin_addr,
            node_addr: snapshot.node_addr,
            server_group: snapshot.server_group,
            node_uuid: self.repo.local_node_uuid()?,
            indexer_version: INDEXER_VERSION,
            cluster_version: snapshot.cluster_version,
        })
    }

    /// Fetch a bucket's UUID with bounded retries. Returns
    /// [`BUCKET_UUID_NIL`] when the bucket does not exist but the
    /// cluster is reachable; an error means the cluster could not be
    /// reached at all.
    pub(crate) async fn get_bucket_uuid(&self, bucket: &str) -> LifecycleResult<String> {
        let mut attempts = 0;
        loop {
            match self.cinfo.bucket_uuid(bucket) {
                Ok(uuid) => return Ok(uuid),
                Err(_) if attempts < BUCKET_UUID_RETRIES => {
                    attempts += 1;
                    tokio::time::sleep(BUCKET_UUID_RETRY_DELAY).await;
                }
                Err(e) => {
                    error!(%bucket, error = %e, "failed to fetch bucket uuid");
                    return Err(e);
                }
            }
        }
    }

    /// Verify that the bucket exists and that every live definition on
    /// it carries the current bucket UUID. Because the manager
    /// serializes all metadata operations, passing this check here
    /// means the whole bucket is consistent.
    pub(crate) async fn verify_bucket(&self, bucket: &str) -> LifecycleResult<String> {
        let current_uuid = self.get_bucket_uuid(bucket).await?;

        let Some(topology) = self.repo.topology(bucket)? else {
            return Ok(current_uuid);
        };

        for defn_ref in &topology.definitions {
            let live = defn_ref
                .instances
                .iter()
                .any(|i| i.state != IndexState::Deleted);
            if !live {
                continue;
            }
            if let Some(defn) = self.repo.defn(defn_ref.defn_id)? {
                if defn.bucket_uuid != current_uuid && defn.bucket_uuid != BUCKET_UUID_NIL {
                    return Err(LifecycleError::BucketUnavailable(format!(
                        "index {} was created against a previous incarnation of bucket {}",
                        defn.name, bucket
                    )));
                }
            }
        }

        Ok(current_uuid)
    }
}
