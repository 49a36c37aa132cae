//! The DDL state machine.
//!
//! Create, build, drop, reset, merge, and prune protocols. Every
//! operation runs on the dispatcher task, so there is no fine-grained
//! locking here — the ordering of repository writes is the crash
//! contract:
//!
//! * create: definition record first, then topology. A crash in
//!   between leaves a dangling definition, which is invalid (no
//!   instance) and garbage-collected by the janitor.
//! * drop: definition record first, then topology. A crash in between
//!   leaves an orphan DELETED instance, same janitor path.

use std::collections::{HashMap, HashSet};

use tracing::{debug, error, info, warn};

use indexgrid_meta::{
    DefnId, IndexDefinition, IndexState, IndexStats, InstId, PartitionId, RebalanceState,
    StorageKind, StreamId, BUCKET_UUID_NIL,
};

use crate::error::{LifecycleError, LifecycleResult};
use crate::manager::{new_inst_id, Inner};
use crate::notifier::{
    is_idempotent_drop_error, IndexerError, IndexerErrorCode, RequestContext, RequestSource,
};
use crate::request::{decode, DropInstanceRequest, IndexIdList, MergePartitionRequest, TopologyChange};

use indexgrid_meta::IndexInstRef;

/// A conditional topology delta for one instance. `None` fields are
/// left untouched; `error` is always written.
#[derive(Debug, Default)]
pub(crate) struct InstanceUpdate<'a> {
    pub state: Option<IndexState>,
    pub stream: Option<StreamId>,
    pub error: &'a str,
    pub rstate: Option<RebalanceState>,
    pub partitions: &'a [PartitionId],
    pub versions: &'a [u64],
    pub inst_version: Option<u64>,
}

impl Inner {
    // ── Create ─────────────────────────────────────────────────────

    pub(crate) async fn handle_create_index(
        &self,
        content: &[u8],
        ctx: RequestContext,
    ) -> LifecycleResult<()> {
        let defn: IndexDefinition = decode(content).map_err(|e| {
            error!(error = %e, "create index failed: unable to decode index definition");
            e
        })?;
        self.create_index_or_instance(defn, true, ctx).await
    }

    pub(crate) async fn create_index_or_instance(
        &self,
        defn: IndexDefinition,
        scheduled: bool,
        ctx: RequestContext,
    ) -> LifecycleResult<()> {
        if !self.config.enterprise {
            if defn.num_replica != 0 {
                error!(name = %defn.name, "create index failed: replicas need enterprise edition");
                return Err(LifecycleError::ReplicaNotSupported);
            }
            if defn.is_partitioned() {
                error!(name = %defn.name, "create index failed: partitions need enterprise edition");
                return Err(LifecycleError::PartitionNotSupported);
            }
        }

        let exist_defn = self.verify_duplicate_defn(&defn)?;
        let has_index = exist_defn
            .as_ref()
            .map(|e| e.defn_id == defn.defn_id)
            .unwrap_or(false);

        if defn.is_partitioned() && has_index {
            return self.create_index_instance(defn, scheduled, ctx).await;
        }
        self.create_index(defn, scheduled, ctx).await
    }

    async fn create_index(
        &self,
        mut defn: IndexDefinition,
        scheduled: bool,
        ctx: RequestContext,
    ) -> LifecycleResult<()> {
        self.set_bucket_uuid(&mut defn).await?;
        self.set_storage_mode(&mut defn);

        let (mut inst_id, real_inst_id) = set_inst_id(&mut defn);
        if real_inst_id != 0 {
            inst_id = real_inst_id;
        }
        let replica_id = set_replica(&mut defn);
        let (partitions, versions, num_partitions) = set_partition(&mut defn);

        // Definition record first. A dangling definition (no instance)
        // is invalid and will be collected; this ordering is what the
        // recovery rules assume.
        self.repo.create_defn(&defn)?;

        if let Err(e) = self.repo.add_instance_to_topology(
            &defn,
            inst_id,
            0,
            replica_id,
            &partitions,
            &versions,
            num_partitions,
            !defn.deferred && scheduled,
        ) {
            error!(defn_id = defn.defn_id, error = %e, "create index failed writing topology");
            let _ = self.repo.drop_defn(defn.defn_id);
            return Err(e.into());
        }

        if let Err(e) = self.notifier.on_index_create(
            &defn,
            inst_id,
            replica_id,
            &partitions,
            &versions,
            num_partitions,
            0,
            ctx,
        ) {
            error!(defn_id = defn.defn_id, error = %e, "create index rejected by indexer");
            let _ = self.delete_index(defn.defn_id, false, ctx).await;
            return Err(e.into());
        }

        if let Err(e) = self.update_index_state(&defn.bucket, defn.defn_id, inst_id, IndexState::Ready)
        {
            error!(defn_id = defn.defn_id, error = %e, "create index failed moving to ready");
            let _ = self.delete_index(defn.defn_id, true, ctx).await;
            return Err(e);
        }

        if !defn.deferred {
            debug!(defn_id = defn.defn_id, "starting index build");
            let (retry, skipped, errs) = self.build_indexes(&[defn.defn_id], ctx, false).await;

            if !retry.is_empty() {
                return Err(LifecycleError::BuildWillRetry);
            }
            if let Some(e) = errs.into_iter().next() {
                error!(defn_id = defn.defn_id, error = %e, "index build failed");
                let _ = self.delete_index(defn.defn_id, true, ctx).await;
                return Err(e);
            }
            if !skipped.is_empty() {
                error!(defn_id = defn.defn_id, "index build failed due to internal errors");
                let _ = self.delete_index(defn.defn_id, true, ctx).await;
                return Err(LifecycleError::InternalBuildError);
            }
        }

        debug!(defn_id = defn.defn_id, "create index completed");
        Ok(())
    }

    async fn create_index_instance(
        &self,
        mut defn: IndexDefinition,
        scheduled: bool,
        ctx: RequestContext,
    ) -> LifecycleResult<()> {
        self.verify_overlap_partition(&defn, ctx)?;
        self.set_bucket_uuid(&mut defn).await?;
        self.set_storage_mode(&mut defn);

        let (mut inst_id, mut real_inst_id) = set_inst_id(&mut defn);
        let replica_id = set_replica(&mut defn);
        let (partitions, versions, num_partitions) = set_partition(&mut defn);

        // If the real instance is not on this node, the new instance
        // becomes the real one.
        if real_inst_id != 0
            && self
                .find_local_inst(&defn.bucket, defn.defn_id, real_inst_id)?
                .is_none()
        {
            inst_id = real_inst_id;
            real_inst_id = 0;
        }

        if let Err(e) = self.repo.add_instance_to_topology(
            &defn,
            inst_id,
            real_inst_id,
            replica_id,
            &partitions,
            &versions,
            num_partitions,
            !defn.deferred && scheduled,
        ) {
            error!(defn_id = defn.defn_id, error = %e, "create instance failed writing topology");
            return Err(e.into());
        }

        if let Err(e) = self.notifier.on_index_create(
            &defn,
            inst_id,
            replica_id,
            &partitions,
            &versions,
            num_partitions,
            real_inst_id,
            ctx,
        ) {
            error!(defn_id = defn.defn_id, error = %e, "create instance rejected by indexer");
            let _ = self
                .delete_index_instance(defn.defn_id, inst_id, false, ctx)
                .await;
            return Err(e.into());
        }

        if let Err(e) = self.update_index_state(&defn.bucket, defn.defn_id, inst_id, IndexState::Ready)
        {
            error!(defn_id = defn.defn_id, error = %e, "create instance failed moving to ready");
            let _ = self
                .delete_index_instance(defn.defn_id, inst_id, false, ctx)
                .await;
            return Err(e);
        }

        if !defn.deferred {
            debug!(defn_id = defn.defn_id, "starting instance build");
            let (retry, skipped, errs) = self.build_indexes(&[defn.defn_id], ctx, false).await;

            if !retry.is_empty() {
                return Err(LifecycleError::BuildWillRetry);
            }
            if let Some(e) = errs.into_iter().next() {
                error!(defn_id = defn.defn_id, error = %e, "instance build failed");
                let _ = self
                    .delete_index_instance(defn.defn_id, inst_id, false, ctx)
                    .await;
                return Err(e);
            }
            if !skipped.is_empty() {
                error!(defn_id = defn.defn_id, "instance build failed due to internal errors");
                let _ = self
                    .delete_index_instance(defn.defn_id, inst_id, false, ctx)
                    .await;
                return Err(LifecycleError::InternalBuildError);
            }
        }

        debug!(defn_id = defn.defn_id, "create instance completed");
        Ok(())
    }

    /// Reject a duplicate (bucket, name) unless every existing
    /// instance is gone. Returns the existing definition, if any, so
    /// the caller can route partitioned-over-partitioned creates to
    /// the instance path.
    fn verify_duplicate_defn(
        &self,
        defn: &IndexDefinition,
    ) -> LifecycleResult<Option<IndexDefinition>> {
        let Some(exist_defn) = self.repo.defn_by_name(&defn.bucket, &defn.name)? else {
            return Ok(None);
        };

        if let Some(topology) = self.repo.topology(&exist_defn.bucket)? {
            if !defn.is_partitioned() || !exist_defn.is_partitioned() {
                for inst in topology.instances_by_defn(exist_defn.defn_id) {
                    if inst.state != IndexState::Nil && inst.state != IndexState::Deleted {
                        return Err(LifecycleError::DuplicateIndex {
                            bucket: defn.bucket.clone(),
                            name: defn.name.clone(),
                        });
                    }
                }
            }
        }
        Ok(Some(exist_defn))
    }

    /// During a rebalance-origin partitioned create, make sure no
    /// target partition collides with a surviving instance entry.
    /// Lower-version PENDING leftovers from an earlier rebalance
    /// attempt are tolerated; they will be cleaned up.
    fn verify_overlap_partition(
        &self,
        defn: &IndexDefinition,
        ctx: RequestContext,
    ) -> LifecycleResult<()> {
        let is_rebalance_partition =
            ctx.source == RequestSource::Rebalance && defn.is_partitioned();
        if !is_rebalance_partition {
            return Ok(());
        }

        if defn.real_inst_id == 0 {
            error!(name = %defn.name, "create instance failed: missing real instance id");
            return Err(LifecycleError::MissingRealInstId);
        }

        let Some(exist_defn) = self.repo.defn_by_name(&defn.bucket, &defn.name)? else {
            return Ok(());
        };
        let Some(topology) = self.repo.topology(&exist_defn.bucket)? else {
            return Ok(());
        };

        let insts = topology.instances_by_defn(exist_defn.defn_id);
        for (i, &part_id) in defn.partitions.iter().enumerate() {
            for inst in &insts {
                if inst.inst_id == defn.inst_id {
                    error!(inst_id = inst.inst_id, "create instance failed: duplicate instance");
                    return Err(LifecycleError::DuplicateInstance(inst.inst_id));
                }

                if inst.inst_id != defn.real_inst_id && inst.real_inst_id != defn.real_inst_id {
                    continue;
                }

                for part in &inst.partitions {
                    if part.part_id == part_id && inst.state != IndexState::Deleted {
                        let requested = defn.versions.get(i).copied().unwrap_or(0);
                        if inst.rstate == RebalanceState::Merged
                            || inst.rstate == RebalanceState::Active
                            || part.version >= requested
                        {
                            error!(
                                inst_id = inst.inst_id,
                                part_id, "create instance failed: overlapping partition"
                            );
                            return Err(LifecycleError::OverlappingPartition {
                                inst_id: inst.inst_id,
                                part_id,
                            });
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Verify the bucket and snapshot its UUID into the definition.
    async fn set_bucket_uuid(&self, defn: &mut IndexDefinition) -> LifecycleResult<()> {
        match self.verify_bucket(&defn.bucket).await {
            Ok(uuid) if uuid != BUCKET_UUID_NIL => {
                defn.bucket_uuid = uuid;
                Ok(())
            }
            Ok(_) => Err(LifecycleError::BucketUnavailable(
                "bucket not found".to_string(),
            )),
            Err(e) => Err(LifecycleError::BucketUnavailable(e.to_string())),
        }
    }

    /// Resolve the storage kind: a generic "gsi" request takes the
    /// configured cluster storage mode, defaulting to plasma.
    fn set_storage_mode(&self, defn: &mut IndexDefinition) {
        if defn.using == StorageKind::Gsi {
            defn.using = self.config.storage_mode.unwrap_or(StorageKind::Plasma);
        }
    }

    // ── Build ──────────────────────────────────────────────────────

    pub(crate) async fn handle_build_indexes(
        &self,
        content: &[u8],
        ctx: RequestContext,
        retry: bool,
    ) -> LifecycleResult<()> {
        let list: IndexIdList = decode(content).map_err(|e| {
            error!(error = %e, "build index failed: unable to decode id list");
            e
        })?;

        let (retry_errs, skipped, errs) = self.build_indexes(&list.defn_ids, ctx, retry).await;
        if retry_errs.is_empty() && skipped.is_empty() && errs.is_empty() {
            return Ok(());
        }

        let mut msg = String::from("Build index fails.");
        if retry_errs.len() == 1 {
            msg.push_str(&format!("  {}", retry_errs[0]));
        }
        if errs.len() == 1 {
            msg.push_str(&format!("  {}.", errs[0]));
        }
        if retry_errs.len() > 1 {
            msg.push_str("  Some index will be retried building in the background.");
        }
        if errs.len() > 1 {
            msg.push_str("  Some index cannot be built due to errors.");
        }
        if !skipped.is_empty() {
            msg.push_str(
                "  Some index cannot be built since it may not exist.  \
                 Please check if the list of indexes are valid.",
            );
        }
        if errs.len() > 1 || retry_errs.len() > 1 {
            msg.push_str("  For more details, please check index status.");
        }
        Err(LifecycleError::BuildFailed(msg))
    }

    /// Schedule and issue builds for the given definitions. Returns
    /// `(retryable errors, skipped definitions, hard errors)`;
    /// retryable definitions are handed to the builder.
    pub(crate) async fn build_indexes(
        &self,
        ids: &[DefnId],
        ctx: RequestContext,
        retry: bool,
    ) -> (Vec<LifecycleError>, Vec<DefnId>, Vec<LifecycleError>) {
        let mut seen: HashSet<DefnId> = HashSet::new();
        let mut skipped: Vec<DefnId> = Vec::new();
        let mut inst_ids: Vec<InstId> = Vec::new();
        let mut inst2defn: HashMap<InstId, DefnId> = HashMap::new();
        let mut buckets: Vec<String> = Vec::new();

        for &id in ids {
            if !seen.insert(id) {
                info!(defn_id = id, "duplicate index definition in build list; skipping");
                continue;
            }

            let defn = match self.repo.defn(id) {
                Ok(Some(defn)) => defn,
                Ok(None) => {
                    warn!(defn_id = id, "index does not exist; skipping build");
                    skipped.push(id);
                    continue;
                }
                Err(e) => {
                    error!(defn_id = id, error = %e, "failed to read index definition; skipping build");
                    skipped.push(id);
                    continue;
                }
            };

            let insts = match self.find_all_local_insts(&defn.bucket, id) {
                Ok(insts) if !insts.is_empty() => insts,
                _ => {
                    error!(defn_id = id, bucket = %defn.bucket, "failed to find index instance; skipping build");
                    skipped.push(id);
                    continue;
                }
            };

            for inst in &insts {
                if inst.state != IndexState::Ready {
                    warn!(
                        defn_id = id,
                        inst_id = inst.inst_id,
                        replica_id = inst.replica_id,
                        "index instance is not in ready state; skipping"
                    );
                    continue;
                }

                if let Err(e) = self.set_scheduled_flag(&defn.bucket, id, inst.inst_id, true) {
                    warn!(
                        defn_id = id,
                        inst_id = inst.inst_id,
                        error = %e,
                        "unable to set scheduled flag; build will not retry across restart"
                    );
                }

                // Reset any previous error.
                let _ = self.update_index_instance(
                    &defn.bucket,
                    id,
                    inst.inst_id,
                    InstanceUpdate::default(),
                );

                inst_ids.push(inst.inst_id);
                inst2defn.insert(inst.inst_id, id);
            }

            if !buckets.contains(&defn.bucket) {
                buckets.push(defn.bucket.clone());
            }
        }

        let mut retry_errs: Vec<LifecycleError> = Vec::new();
        let mut errs: Vec<LifecycleError> = Vec::new();

        if !inst_ids.is_empty() {
            let err_map = self.notifier.on_index_build(&inst_ids, &buckets, ctx);
            if !err_map.is_empty() {
                error!(failures = err_map.len(), "index build reported failures");

                let mut retry_defns: Vec<IndexDefinition> = Vec::new();
                for (inst_id, build_err) in err_map {
                    let Some(&defn_id) = inst2defn.get(&inst_id) else {
                        warn!(inst_id, "cannot find index defn for inst while processing build error");
                        continue;
                    };
                    let Ok(Some(defn)) = self.repo.defn(defn_id) else {
                        warn!(inst_id, "cannot find index defn for inst while processing build error");
                        continue;
                    };

                    let inst = self
                        .find_local_inst(&defn.bucket, defn_id, inst_id)
                        .ok()
                        .flatten();
                    let can_retry = can_retry_error(inst.as_ref(), &build_err, retry);

                    let build_msg = if can_retry {
                        format!(
                            "Index {} will retry building in the background for reason: {}.",
                            defn.name, build_err
                        )
                    } else {
                        build_err.to_string()
                    };

                    if let Some(inst) = &inst {
                        let _ = self.update_index_instance(
                            &defn.bucket,
                            defn_id,
                            inst.inst_id,
                            InstanceUpdate {
                                error: &build_msg,
                                ..InstanceUpdate::default()
                            },
                        );

                        if can_retry && !inst.scheduled {
                            if let Err(e) =
                                self.set_scheduled_flag(&defn.bucket, defn_id, inst.inst_id, true)
                            {
                                warn!(
                                    defn_id,
                                    inst_id = inst.inst_id,
                                    error = %e,
                                    "unable to set scheduled flag; build will not retry across restart"
                                );
                            }
                        }
                    } else {
                        info!(
                            defn_id,
                            inst_id, "failed to persist build error on index instance"
                        );
                    }

                    if can_retry {
                        info!(
                            bucket = %defn.bucket,
                            name = %defn.name,
                            inst_id,
                            "build error is retryable; will retry at a later time"
                        );
                        retry_defns.push(defn.clone());
                        retry_errs.push(LifecycleError::BuildFailed(build_msg));
                    } else {
                        errs.push(LifecycleError::BuildFailed(format!(
                            "Index {} fails to build for reason: {}",
                            defn.name, build_err
                        )));
                    }
                }

                // Hand retryable definitions to the builder.
                for defn in retry_defns {
                    let _ = self.builder_tx.send(defn).await;
                }
            }
        }

        debug!("build indexes completed");
        (retry_errs, skipped, errs)
    }

    // ── Drop ───────────────────────────────────────────────────────

    pub(crate) async fn handle_delete_index(
        &self,
        key: &str,
        ctx: RequestContext,
    ) -> LifecycleResult<()> {
        let id: DefnId = key
            .parse()
            .map_err(|_| LifecycleError::InvalidRequest(format!("bad defn id {key}")))?;
        self.delete_index(id, true, ctx).await
    }

    /// Drop an index: mark every instance DELETED, notify the indexer
    /// (idempotently), then remove the definition record followed by
    /// its topology rows.
    pub(crate) async fn delete_index(
        &self,
        id: DefnId,
        notify: bool,
        ctx: RequestContext,
    ) -> LifecycleResult<()> {
        let Some(defn) = self.repo.defn(id)? else {
            info!(defn_id = id, "index does not exist; drop is a no-op");
            return Ok(());
        };

        // Mark every instance DELETED. The index counts as dropped as
        // soon as any instance is DELETED; stragglers are repaired by
        // the janitor.
        let insts = self.find_all_local_insts(&defn.bucket, id)?;
        let mut has_error = false;
        for inst in &insts {
            if self
                .update_index_state(&defn.bucket, id, inst.inst_id, IndexState::Deleted)
                .is_err()
            {
                has_error = true;
            }
        }
        if has_error {
            error!(defn_id = id, "drop index failed marking instances deleted");
            return Err(LifecycleError::Internal(format!(
                "fail to mark instances of index {id} as deleted"
            )));
        }

        if notify {
            let insts = self.find_all_local_insts(&defn.bucket, id)?;
            let mut drop_err: Option<LifecycleError> = None;
            for inst in &insts {
                // Safe to call again after the indexer already cleaned
                // up; non-existence counts as success.
                if let Err(err) = self.notifier.on_index_delete(inst.inst_id, &defn.bucket, ctx) {
                    if !is_idempotent_drop_error(&err) {
                        error!(
                            defn_id = id,
                            inst_id = inst.inst_id,
                            error = %err,
                            "indexer failed to drop index; will retry in background"
                        );
                        drop_err = Some(LifecycleError::DropWillRetry(err.to_string()));
                    }
                }
            }
            // Leave the repository untouched so the client can retry.
            if let Some(err) = drop_err {
                return Err(err);
            }
        }

        // Definition first, then topology: a crash in between leaves
        // only an orphan the janitor cleans.
        let _ = self.repo.drop_defn(id);
        let _ = self.repo.remove_defn_from_topology(&defn.bucket, id);

        debug!(bucket = %defn.bucket, bucket_uuid = %defn.bucket_uuid, name = %defn.name, "index deleted");
        Ok(())
    }

    pub(crate) async fn handle_cleanup_index(&self, content: &[u8]) -> LifecycleResult<()> {
        let inst: indexgrid_meta::IndexInstance = decode(content).map_err(|e| {
            error!(error = %e, "cleanup index failed: unable to decode index instance");
            e
        })?;
        self.delete_index_instance(inst.defn.defn_id, inst.inst_id, false, RequestContext::user())
            .await
    }

    pub(crate) async fn handle_drop_or_prune_instance(
        &self,
        content: &[u8],
        ctx: RequestContext,
    ) -> LifecycleResult<()> {
        let change: DropInstanceRequest = decode(content)?;
        self.delete_or_prune_instance(change.defn, change.cleanup, ctx)
            .await
    }

    pub(crate) async fn delete_or_prune_instance(
        &self,
        defn: IndexDefinition,
        cleanup: bool,
        ctx: RequestContext,
    ) -> LifecycleResult<()> {
        let id = defn.defn_id;
        let mut inst_id = defn.inst_id;

        info!(
            defn_id = id,
            inst_id,
            real_inst_id = defn.real_inst_id,
            partitions = ?defn.partitions,
            "delete or prune index instance"
        );

        if self.find_local_inst(&defn.bucket, id, inst_id)?.is_none() {
            match self.find_local_inst(&defn.bucket, id, defn.real_inst_id)? {
                Some(real) => inst_id = real.inst_id,
                None => return Ok(()),
            }
        }

        if defn.partitions.is_empty() {
            return self.delete_index_instance(id, inst_id, cleanup, ctx).await;
        }
        self.prune_index_instance(id, inst_id, &defn.partitions, cleanup, ctx)
            .await
    }

    /// Drop one instance. Falls back to a full index drop when no
    /// other live instance remains.
    pub(crate) async fn delete_index_instance(
        &self,
        id: DefnId,
        inst_id: InstId,
        cleanup: bool,
        ctx: RequestContext,
    ) -> LifecycleResult<()> {
        info!(defn_id = id, inst_id, "delete index instance");

        let Some(defn) = self.repo.defn(id)? else {
            info!(defn_id = id, "index does not exist; drop instance is a no-op");
            return Ok(());
        };

        let insts = self.find_all_local_insts(&defn.bucket, id)?;
        let mut valid_inst = 0;
        let mut target: Option<IndexInstRef> = None;
        for inst in insts {
            if inst.inst_id == inst_id {
                target = Some(inst);
            } else if inst.state != IndexState::Deleted {
                valid_inst += 1;
            }
        }

        if target.is_none() {
            return Ok(());
        }

        if valid_inst == 0 {
            info!(defn_id = id, "only a single instance remains; deleting the index");
            return self.delete_index(id, cleanup, ctx).await;
        }

        if cleanup {
            self.update_index_state(&defn.bucket, id, inst_id, IndexState::Deleted)?;
            if let Err(err) = self.notifier.on_index_delete(inst_id, &defn.bucket, ctx) {
                if !is_idempotent_drop_error(&err) {
                    error!(
                        defn_id = id,
                        inst_id,
                        error = %err,
                        "indexer failed to drop instance; will retry in background"
                    );
                    return Err(err.into());
                }
            }
        }

        let _ = self.repo.remove_instance_from_topology(&defn.bucket, id, inst_id);
        Ok(())
    }

    // ── Prune ──────────────────────────────────────────────────────

    /// Split the named partitions off an instance into a proxy and ask
    /// the indexer to drop them. Collapses into a full instance drop
    /// when the prune would empty the instance and no proxy depends on
    /// it.
    pub(crate) async fn prune_index_instance(
        &self,
        id: DefnId,
        inst_id: InstId,
        partitions: &[PartitionId],
        cleanup: bool,
        ctx: RequestContext,
    ) -> LifecycleResult<()> {
        info!(defn_id = id, inst_id, ?partitions, "prune index instance");

        let Some(defn) = self.repo.defn(id)? else {
            info!(defn_id = id, "index does not exist; prune is a no-op");
            return Ok(());
        };
        let Some(inst) = self.find_local_inst(&defn.bucket, id, inst_id)? else {
            return Ok(());
        };

        let pruned: Vec<PartitionId> = partitions
            .iter()
            .copied()
            .filter(|p| inst.partitions.iter().any(|q| q.part_id == *p))
            .collect();

        let num_proxy = self
            .find_all_local_insts(&defn.bucket, id)?
            .iter()
            .filter(|i| i.real_inst_id == inst_id)
            .count();

        if num_proxy == 0 && (pruned.len() == inst.partitions.len() || inst.partitions.is_empty()) {
            return self.delete_index_instance(id, inst_id, cleanup, ctx).await;
        }

        let proxy_inst_id = new_inst_id();
        self.repo
            .split_partitions(&defn.bucket, id, inst_id, proxy_inst_id, &pruned)
            .map_err(|e| {
                error!(defn_id = id, inst_id, error = %e, "failed to split pruned partitions");
                e
            })?;

        if cleanup {
            if let Err(err) = self.notifier.on_partition_prune(inst_id, &pruned, ctx) {
                if !is_idempotent_drop_error(&err) {
                    error!(
                        defn_id = id,
                        inst_id,
                        error = %err,
                        "indexer failed to prune partitions; will retry in background"
                    );
                    return Err(err.into());
                }
            }
        }
        Ok(())
    }

    // ── Merge ──────────────────────────────────────────────────────

    pub(crate) async fn handle_merge_partition(&self, content: &[u8]) -> LifecycleResult<()> {
        let change: MergePartitionRequest = decode(content)?;

        info!(
            defn_id = change.defn_id,
            src = change.src_inst_id,
            tgt = change.tgt_inst_id,
            "merge partition"
        );

        let Some(defn) = self.repo.defn(change.defn_id)? else {
            info!(defn_id = change.defn_id, "index does not exist; merge is a no-op");
            return Ok(());
        };

        let indexer_id = self.repo.local_indexer_id().map_err(|e| {
            error!(error = %e, "merge partition failed: no indexer id");
            e
        })?;

        self.repo.merge_partitions(
            &indexer_id,
            &defn.bucket,
            change.defn_id,
            change.src_inst_id,
            change.src_r_state,
            change.tgt_inst_id,
            change.tgt_inst_version,
            &change.tgt_partitions,
            &change.tgt_versions,
        )?;
        Ok(())
    }

    // ── Topology delta (UPDATE_INDEX_INST) ─────────────────────────

    pub(crate) async fn handle_topology_change(&self, content: &[u8]) -> LifecycleResult<()> {
        let change: TopologyChange = decode(content)?;

        let Some(defn) = self.repo.defn(change.defn_id)? else {
            return Ok(());
        };
        let Some(inst) =
            self.find_local_inst(&change.bucket, change.defn_id, change.inst_id)?
        else {
            return Ok(());
        };

        let prev_state = inst.state;
        let was_scheduled = inst.scheduled;

        self.update_index_instance(
            &change.bucket,
            change.defn_id,
            change.inst_id,
            InstanceUpdate {
                state: (change.state != IndexState::Nil).then_some(change.state),
                stream: (change.stream_id != StreamId::Nil).then_some(change.stream_id),
                error: &change.error,
                rstate: (change.r_state != RebalanceState::Nil).then_some(change.r_state),
                partitions: &change.partitions,
                versions: &change.versions,
                inst_version: u64::try_from(change.inst_version).ok(),
            },
        )?;

        // The indexer moved the instance from CREATED to READY: hand
        // any scheduled build to the builder.
        if prev_state == IndexState::Created && change.state == IndexState::Ready && was_scheduled {
            let _ = self.builder_tx.send(defn).await;
        }
        Ok(())
    }

    /// Apply a conditional topology delta: a single write is issued
    /// iff any field actually changed. Moving the state into or past
    /// the build pipeline clears the scheduled flag, and the storage
    /// mode is refreshed from the definition on every delta.
    pub(crate) fn update_index_instance(
        &self,
        bucket: &str,
        defn_id: DefnId,
        inst_id: InstId,
        update: InstanceUpdate<'_>,
    ) -> LifecycleResult<()> {
        let Some(mut topology) = self.repo.topology(bucket)? else {
            warn!(%bucket, defn_id, "topology does not exist; skipping instance update");
            return Ok(());
        };
        let Some(defn) = self.repo.defn(defn_id)? else {
            warn!(defn_id, "index does not exist; skipping instance update");
            return Ok(());
        };
        let indexer_id = self.repo.local_indexer_id()?;

        let mut changed = false;

        if let Some(rstate) = update.rstate {
            changed = topology.update_rstate(defn_id, inst_id, rstate) || changed;
        }

        if let Some(state) = update.state {
            changed = topology.update_state(defn_id, inst_id, state) || changed;
            if matches!(
                state,
                IndexState::Initial | IndexState::Catchup | IndexState::Active | IndexState::Deleted
            ) {
                changed = topology.update_scheduled(defn_id, inst_id, false) || changed;
            }
        }

        if let Some(stream) = update.stream {
            changed = topology.update_stream(defn_id, inst_id, stream) || changed;
        }

        changed = topology.set_error(defn_id, inst_id, update.error) || changed;
        changed = topology.update_storage_mode(defn_id, inst_id, defn.using.as_str()) || changed;

        if !update.partitions.is_empty() {
            changed = topology.add_partitions(
                defn_id,
                inst_id,
                &indexer_id,
                update.partitions,
                update.versions,
            ) || changed;
        }

        if let Some(version) = update.inst_version {
            changed = topology.update_version(defn_id, inst_id, version) || changed;
        }

        if changed {
            self.repo.set_topology(bucket, &topology)?;
        }
        Ok(())
    }

    // ── Delete bucket / defer cleanup ──────────────────────────────

    /// Drop every index on a bucket whose instances match the one-byte
    /// stream filter (NIL matches everything).
    pub(crate) async fn handle_delete_bucket(
        &self,
        bucket: &str,
        content: &[u8],
    ) -> LifecycleResult<()> {
        if content.is_empty() {
            return Err(LifecycleError::InvalidRequest(
                "delete bucket needs a stream id".to_string(),
            ));
        }
        let stream_filter = StreamId::from_byte(content[0]);

        let mut result = Ok(());
        if let Some(topology) = self.repo.topology(bucket)? {
            for defn_ref in topology.definitions.clone() {
                match self.repo.defn(defn_ref.defn_id) {
                    Ok(Some(defn)) => {
                        for inst in &defn_ref.instances {
                            if stream_filter == StreamId::Nil
                                || inst.stream == stream_filter
                                || inst.stream == StreamId::Nil
                            {
                                debug!(
                                    inst_id = inst.inst_id,
                                    stream = ?inst.stream,
                                    "deleting index instance for bucket drop"
                                );
                                if let Err(e) =
                                    self.delete_index(defn.defn_id, false, RequestContext::user()).await
                                {
                                    result = Err(e);
                                }
                                break;
                            }
                        }
                    }
                    _ => {
                        debug!(defn_id = defn_ref.defn_id, "cannot find index definition; skipping");
                    }
                }
            }
        }
        result
    }

    /// Delete deferred indexes left over from a recreated bucket. Only
    /// acts when the bucket is fetchable and nothing on it holds an
    /// active stream.
    pub(crate) async fn handle_cleanup_defer_index(&self, bucket: &str) -> LifecycleResult<()> {
        let current_uuid = match self.get_bucket_uuid(bucket).await {
            Ok(uuid) => uuid,
            // Cannot reach the cluster; do not attempt to delete.
            Err(_) => return Ok(()),
        };

        let Some(topology) = self.repo.topology(bucket)? else {
            return Ok(());
        };

        let has_active_index = topology.definitions.iter().any(|d| {
            d.instances
                .iter()
                .any(|i| i.state != IndexState::Deleted && i.stream != StreamId::Nil)
        });
        if has_active_index {
            // The bucket-delete stream teardown will take all indexes
            // down with it.
            return Ok(());
        }

        for defn_ref in &topology.definitions {
            let Ok(Some(defn)) = self.repo.defn(defn_ref.defn_id) else {
                continue;
            };
            if defn.bucket_uuid == current_uuid || !defn.deferred {
                continue;
            }
            for inst in &defn_ref.instances {
                if inst.state != IndexState::Deleted && inst.stream == StreamId::Nil {
                    self.delete_index(defn.defn_id, true, RequestContext::user())
                        .await?;
                    break;
                }
            }
        }
        Ok(())
    }

    // ── Stats / reset / config ─────────────────────────────────────

    /// Best effort: filter the stats map down to the progress keys and
    /// broadcast it. Never fails the request.
    pub(crate) fn handle_broadcast_stats(&self, content: &[u8]) {
        if content.is_empty() {
            return;
        }
        match serde_json::from_slice::<serde_json::Map<String, serde_json::Value>>(content) {
            Ok(stats) => {
                let filtered: serde_json::Map<_, _> = stats
                    .into_iter()
                    .filter(|(key, _)| {
                        key.contains("num_docs_pending")
                            || key.contains("num_docs_queued")
                            || key.contains("last_rollback_time")
                            || key.contains("progress_stat_time")
                    })
                    .collect();
                if let Err(e) = self.repo.broadcast_stats(&IndexStats { stats: filtered }) {
                    error!(error = %e, "failed to broadcast index stats");
                }
            }
            Err(e) => error!(error = %e, "failed to decode index stats"),
        }
    }

    /// Storage-mode reset (upgrade): overwrite the definition and
    /// restore the instance as if freshly created.
    pub(crate) fn handle_reset_index(&self, content: &[u8]) -> LifecycleResult<()> {
        let inst: indexgrid_meta::IndexInstance = decode(content).map_err(|e| {
            error!(error = %e, "reset index failed: unable to decode index instance");
            e
        })?;
        let defn = inst.defn;

        let old_defn = self.repo.defn(defn.defn_id)?;
        let old_storage_mode = old_defn
            .as_ref()
            .map(|d| d.using.as_str())
            .unwrap_or_default();

        self.repo.update_defn(&defn).map_err(|e| {
            error!(bucket = %defn.bucket, name = %defn.name, error = %e, "reset index failed updating definition");
            e
        })?;

        let Some(mut topology) = self.repo.topology(&defn.bucket)? else {
            error!(bucket = %defn.bucket, name = %defn.name, "reset index failed: topology does not exist");
            return Ok(());
        };

        if self
            .find_local_inst(&defn.bucket, defn.defn_id, inst.inst_id)?
            .is_none()
        {
            error!(bucket = %defn.bucket, name = %defn.name, "reset index failed: instance does not exist");
            return Ok(());
        }

        // An instance that was already building (or built) needs the
        // build rescheduled under the new storage mode.
        if matches!(
            inst.state,
            IndexState::Initial | IndexState::Catchup | IndexState::Active
        ) {
            topology.update_scheduled(defn.defn_id, inst.inst_id, true);
        }

        topology.update_old_storage_mode(defn.defn_id, inst.inst_id, old_storage_mode);
        topology.update_storage_mode(defn.defn_id, inst.inst_id, defn.using.as_str());
        topology.reset_to_ready(defn.defn_id, inst.inst_id);
        topology.set_error(defn.defn_id, inst.inst_id, "");
        topology.update_stream(defn.defn_id, inst.inst_id, StreamId::Nil);

        self.repo.set_topology(&defn.bucket, &topology).map_err(|e| {
            error!(bucket = %defn.bucket, name = %defn.name, error = %e, "reset index failed writing topology");
            e
        })?;
        Ok(())
    }

    pub(crate) fn handle_config_update(&self, content: &[u8]) -> LifecycleResult<()> {
        let config: serde_json::Map<String, serde_json::Value> = decode(content)?;
        self.settings.apply(&config)
    }

    // ── Support ────────────────────────────────────────────────────

    pub(crate) fn find_all_local_insts(
        &self,
        bucket: &str,
        defn_id: DefnId,
    ) -> LifecycleResult<Vec<IndexInstRef>> {
        match self.repo.topology(bucket)? {
            Some(topology) => Ok(topology.instances_by_defn(defn_id)),
            None => Ok(Vec::new()),
        }
    }

    pub(crate) fn find_local_inst(
        &self,
        bucket: &str,
        defn_id: DefnId,
        inst_id: InstId,
    ) -> LifecycleResult<Option<IndexInstRef>> {
        Ok(self
            .find_all_local_insts(bucket, defn_id)?
            .into_iter()
            .find(|i| i.inst_id == inst_id))
    }

    pub(crate) fn update_index_state(
        &self,
        bucket: &str,
        defn_id: DefnId,
        inst_id: InstId,
        state: IndexState,
    ) -> LifecycleResult<()> {
        let Some(mut topology) = self.repo.topology(bucket)? else {
            warn!(%bucket, defn_id, ?state, "topology does not exist; skipping state update");
            return Ok(());
        };
        if topology.update_state(defn_id, inst_id, state) {
            self.repo.set_topology(bucket, &topology)?;
        }
        Ok(())
    }

    pub(crate) fn set_scheduled_flag(
        &self,
        bucket: &str,
        defn_id: DefnId,
        inst_id: InstId,
        scheduled: bool,
    ) -> LifecycleResult<()> {
        let Some(mut topology) = self.repo.topology(bucket)? else {
            warn!(%bucket, defn_id, "topology does not exist; skipping scheduled update");
            return Ok(());
        };
        if topology.update_scheduled(defn_id, inst_id, scheduled) {
            self.repo.set_topology(bucket, &topology)?;
        }
        Ok(())
    }

    /// Whether the builder may issue a build for this bucket: nothing
    /// on it may already be in the build pipeline. The authoritative
    /// check stays with the indexer.
    pub(crate) fn can_build_index(&self, bucket: &str) -> bool {
        match self.repo.topology(bucket) {
            Ok(Some(topology)) => !topology.definitions.iter().any(|d| {
                d.instances
                    .iter()
                    .any(|i| matches!(i.state, IndexState::Initial | IndexState::Catchup))
            }),
            _ => true,
        }
    }
}

/// Retry classification for a build failure.
///
/// Only instances the rebalancer marked ACTIVE retry; definitive
/// indexer verdicts never do, and RebalanceInProgress only retries
/// when the caller allows it.
pub(crate) fn can_retry_error(
    inst: Option<&IndexInstRef>,
    err: &IndexerError,
    retry: bool,
) -> bool {
    let Some(inst) = inst else {
        return false;
    };
    if inst.rstate != RebalanceState::Active {
        return false;
    }
    match err.code {
        IndexerErrorCode::IndexNotExist
        | IndexerErrorCode::InvalidBucket
        | IndexerErrorCode::IndexAlreadyExist
        | IndexerErrorCode::IndexInvalidState => false,
        IndexerErrorCode::RebalanceInProgress => retry,
        IndexerErrorCode::Generic => true,
    }
}

/// Capture the instance id from the request (rebalance supplies one)
/// or allocate a fresh one, clearing the transport fields.
fn set_inst_id(defn: &mut IndexDefinition) -> (InstId, InstId) {
    let inst_id = if defn.inst_id > 0 {
        defn.inst_id
    } else {
        new_inst_id()
    };
    defn.inst_id = 0;

    let real_inst_id = defn.real_inst_id;
    defn.real_inst_id = 0;

    (inst_id, real_inst_id)
}

fn set_replica(defn: &mut IndexDefinition) -> i32 {
    let replica_id = defn.replica_id;
    defn.replica_id = -1;
    replica_id
}

/// Normalize the partition set: a non-partitioned index gets the
/// single partition 0 at the definition's instance version.
fn set_partition(defn: &mut IndexDefinition) -> (Vec<PartitionId>, Vec<u64>, u32) {
    let (partitions, versions, num_partitions) = if !defn.is_partitioned() {
        (vec![0], vec![defn.inst_version], 1)
    } else {
        (
            defn.partitions.clone(),
            defn.versions.clone(),
            defn.num_partitions,
        )
    };

    defn.num_partitions = 0;
    defn.partitions = Vec::new();
    defn.versions = Vec::new();

    (partitions, versions, num_partitions)
}
