//! Request envelopes, opcodes, and wire payloads.
//!
//! Every metadata-mutating operation enters the manager as a
//! `RequestPacket` and leaves as exactly one `ResponsePacket` (unless
//! it was submitted internally). The opcode plus its decoded payload
//! form a closed sum — the dispatcher matches on it exhaustively, so a
//! new opcode cannot be silently ignored.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::error::{LifecycleError, LifecycleResult};
use crate::manager::Inner;
use indexgrid_meta::{
    DefnId, IndexDefinition, IndexState, InstId, PartitionId, RebalanceState, StreamId,
};

/// Correlation id that suppresses response emission.
pub const INTERNAL_FID: &str = "internal";

/// Every operation the lifecycle manager serializes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    CreateIndex,
    UpdateIndexInst,
    DropIndex,
    BuildIndex,
    ServiceMap,
    DeleteBucket,
    CleanupIndex,
    CleanupDeferIndex,
    CreateIndexRebal,
    BuildIndexRebal,
    DropIndexRebal,
    BuildIndexRetry,
    BroadcastStats,
    ResetIndex,
    ConfigUpdate,
    DropOrPruneInstance,
    MergePartition,
    IndexerReady,
}

impl OpCode {
    /// Opcodes admitted to the bootstrap queue before INDEXER_READY.
    pub fn bootstrap_allowed(self) -> bool {
        matches!(
            self,
            OpCode::UpdateIndexInst
                | OpCode::DeleteBucket
                | OpCode::CleanupIndex
                | OpCode::ResetIndex
        )
    }
}

/// An incoming request envelope.
#[derive(Debug)]
pub struct RequestPacket {
    pub op: OpCode,
    pub req_id: u64,
    pub key: String,
    pub content: Vec<u8>,
    /// Correlation id; [`INTERNAL_FID`] suppresses the response.
    pub fid: String,
    /// Direct reply channel for synchronous internal requests;
    /// bypasses the outgoing queue.
    pub reply: Option<oneshot::Sender<ResponsePacket>>,
}

impl RequestPacket {
    pub fn new(
        op: OpCode,
        req_id: u64,
        key: impl Into<String>,
        content: Vec<u8>,
        fid: impl Into<String>,
    ) -> Self {
        RequestPacket {
            op,
            req_id,
            key: key.into(),
            content,
            fid: fid.into(),
            reply: None,
        }
    }
}

/// The response emitted for every non-internal request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponsePacket {
    pub req_id: u64,
    pub fid: String,
    /// Empty on success.
    pub error: String,
    pub result: Vec<u8>,
}

// ── Wire payloads ──────────────────────────────────────────────────

/// UPDATE_INDEX_INST payload: a topology delta for one instance.
/// `Nil` enum values and a negative `instVersion` mean "no change".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TopologyChange {
    pub bucket: String,
    pub defn_id: DefnId,
    pub inst_id: InstId,
    pub state: IndexState,
    pub stream_id: StreamId,
    pub error: String,
    pub build_time: Vec<u64>,
    pub r_state: RebalanceState,
    pub partitions: Vec<PartitionId>,
    pub versions: Vec<u64>,
    pub inst_version: i64,
}

/// DROP_OR_PRUNE_INSTANCE payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DropInstanceRequest {
    pub defn: IndexDefinition,
    #[serde(default)]
    pub cleanup: bool,
}

/// MERGE_PARTITION payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MergePartitionRequest {
    pub defn_id: DefnId,
    pub src_inst_id: InstId,
    pub src_r_state: RebalanceState,
    pub tgt_inst_id: InstId,
    pub tgt_partitions: Vec<PartitionId>,
    pub tgt_versions: Vec<u64>,
    pub tgt_inst_version: u64,
}

/// BUILD_INDEX payload: the definitions to build.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IndexIdList {
    pub defn_ids: Vec<DefnId>,
}

/// Decode a JSON wire payload.
pub(crate) fn decode<T: serde::de::DeserializeOwned>(content: &[u8]) -> LifecycleResult<T> {
    serde_json::from_slice(content).map_err(|e| LifecycleError::InvalidRequest(e.to_string()))
}

// ── RequestServer ──────────────────────────────────────────────────

/// The narrow capability handed to background components: it can only
/// submit opcodes back into the dispatcher, never write metadata
/// itself. This keeps the dispatcher the sole serializer.
#[derive(Clone)]
pub struct RequestServer {
    pub(crate) inner: Arc<Inner>,
}

impl RequestServer {
    /// Submit a request and forget it; any failure surfaces through
    /// the normal background retry paths.
    pub async fn make_async_request(
        &self,
        op: OpCode,
        key: &str,
        content: Vec<u8>,
    ) -> LifecycleResult<()> {
        let packet = RequestPacket::new(op, self.inner.next_req_id(), key, content, INTERNAL_FID);
        self.inner.enqueue(packet).await
    }

    /// Submit a request and wait for its response.
    pub async fn make_request(&self, op: OpCode, key: &str, content: Vec<u8>) -> LifecycleResult<()> {
        let (tx, rx) = oneshot::channel();
        let mut packet =
            RequestPacket::new(op, self.inner.next_req_id(), key, content, INTERNAL_FID);
        packet.reply = Some(tx);
        self.inner.enqueue(packet).await?;

        match rx.await {
            Ok(resp) if resp.error.is_empty() => Ok(()),
            Ok(resp) => Err(LifecycleError::Request(resp.error)),
            Err(_) => Err(LifecycleError::Shutdown),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_whitelist() {
        let allowed = [
            OpCode::UpdateIndexInst,
            OpCode::DeleteBucket,
            OpCode::CleanupIndex,
            OpCode::ResetIndex,
        ];
        for op in allowed {
            assert!(op.bootstrap_allowed(), "{op:?}");
        }
        for op in [
            OpCode::CreateIndex,
            OpCode::DropIndex,
            OpCode::BuildIndex,
            OpCode::MergePartition,
            OpCode::ConfigUpdate,
        ] {
            assert!(!op.bootstrap_allowed(), "{op:?}");
        }
    }

    #[test]
    fn topology_change_defaults_mean_no_change() {
        let change: TopologyChange =
            serde_json::from_str(r#"{"bucket":"b","defnId":1,"instId":2}"#).unwrap();
        assert_eq!(change.state, IndexState::Nil);
        assert_eq!(change.stream_id, StreamId::Nil);
        assert_eq!(change.r_state, RebalanceState::Nil);
        assert_eq!(change.inst_version, 0);
        assert!(change.partitions.is_empty());
    }

    #[test]
    fn index_id_list_round_trip() {
        let list = IndexIdList {
            defn_ids: vec![3, 1, 2],
        };
        let bytes = serde_json::to_vec(&list).unwrap();
        let back: IndexIdList = decode(&bytes).unwrap();
        assert_eq!(back.defn_ids, vec![3, 1, 2]);
    }
}
