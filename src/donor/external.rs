//! Capabilities a donor instance calls outward through.

use super::record::DonorPhase;
use crate::error::Result;
use crate::types::{Namespace, OperationId, ShardId, Timestamp};
use serde::{Deserialize, Serialize};

/// Progress report pushed to the coordinator's own durable record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorUpdate {
    pub operation_id: OperationId,
    pub donor: ShardId,
    pub phase: DonorPhase,
    pub min_fetch_boundary: Option<Timestamp>,
    pub aborted: bool,
}

/// External state the donor depends on but does not own.
///
/// Implemented by the surrounding node. Errors are treated as transient and
/// retried with the external retry policy.
#[async_trait::async_trait]
pub trait DonorExternalState: Send + Sync + std::fmt::Debug {
    /// This node's participant identity.
    fn my_shard_id(&self) -> ShardId;

    /// Refresh cluster routing metadata for `ns`.
    async fn refresh_catalog_cache(&self, ns: &Namespace) -> Result<()>;

    /// Wait until a collection created at `ns` is durably visible cluster-wide.
    async fn wait_for_collection_flush(&self, ns: &Namespace) -> Result<()>;

    /// Push a progress update to the coordinator.
    async fn update_coordinator(&self, update: CoordinatorUpdate) -> Result<()>;
}

/// External state that accepts every call and does nothing.
#[derive(Debug, Clone)]
pub struct NoOpExternalState {
    shard_id: ShardId,
}

impl NoOpExternalState {
    pub fn new(shard_id: ShardId) -> Self {
        Self { shard_id }
    }
}

#[async_trait::async_trait]
impl DonorExternalState for NoOpExternalState {
    fn my_shard_id(&self) -> ShardId {
        self.shard_id.clone()
    }

    async fn refresh_catalog_cache(&self, _ns: &Namespace) -> Result<()> {
        Ok(())
    }

    async fn wait_for_collection_flush(&self, _ns: &Namespace) -> Result<()> {
        Ok(())
    }

    async fn update_coordinator(&self, _update: CoordinatorUpdate) -> Result<()> {
        Ok(())
    }
}
