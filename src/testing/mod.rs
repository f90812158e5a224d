//! Testing utilities for the resharding donor.
//!
//! [`DonorTestHarness`] wires a [`DonorRegistry`] to in-memory storage, a
//! [`RecordingExternalState`], and a failpoint registry, and seeds the
//! collections a resharding operation needs. Scenario tests drive it through
//! coordinator signals and leadership changes.
//!
//! # Example
//!
//! ```rust,ignore
//! use reshard_donor::testing::DonorTestHarness;
//!
//! let harness = DonorTestHarness::new("myShardId")?;
//! harness.registry.on_become_primary().await?;
//!
//! let params = harness.seed_operation(&["recipient1", "recipient2"]).await?;
//! let donor = harness.registry.create(params).await?;
//! donor.notify_recipients_done_cloning();
//! ```

mod external;

mod donor_scenarios;

pub use external::RecordingExternalState;

use crate::config::{DonorServiceConfig, RetryConfig};
use crate::error::{Error, Result};
use crate::donor::{DonorContext, DonorRegistry, KeyPattern, ReshardingParams, SourceCollection};
use crate::failpoint::FailpointRegistry;
use crate::metrics::DonorMetrics;
use crate::storage::{DonorStorage, InMemoryStorage, OplogEntry};
use crate::types::{Namespace, OperationId, ShardId};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Upper bound on any single wait in scenario tests.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// A registry plus everything around it, for driving donors in tests.
#[derive(Debug)]
pub struct DonorTestHarness {
    pub storage: Arc<InMemoryStorage>,
    pub external: Arc<RecordingExternalState>,
    pub failpoints: Arc<FailpointRegistry>,
    pub metrics: Arc<DonorMetrics>,
    pub registry: DonorRegistry,
}

impl DonorTestHarness {
    /// Harness for a node whose participant identity is `shard_id`, with
    /// near-zero retry delays.
    pub fn new(shard_id: &str) -> Result<Self> {
        Self::with_storage(shard_id, Arc::new(InMemoryStorage::new()))
    }

    /// Harness over existing storage, e.g. to model a different node taking
    /// over the same records.
    pub fn with_storage(shard_id: &str, storage: Arc<InMemoryStorage>) -> Result<Self> {
        let external = Arc::new(RecordingExternalState::new(ShardId::new(shard_id)));
        let failpoints = Arc::new(FailpointRegistry::new());
        let metrics = Arc::new(DonorMetrics::new());
        let config = DonorServiceConfig::new()
            .with_storage_retry(RetryConfig::immediate(5))
            .with_external_retry(RetryConfig::immediate(5));

        let ctx = DonorContext::new(config, storage.clone(), external.clone())
            .with_failpoints(failpoints.clone())
            .with_metrics(metrics.clone());
        let registry = DonorRegistry::new(ctx)?;

        Ok(Self {
            storage,
            external,
            failpoints,
            metrics,
            registry,
        })
    }

    /// Namespace every harness operation reshards.
    pub fn source_ns() -> Namespace {
        Namespace::new("sourcedb", "sourcecollection")
    }

    /// Create the source collection and the temporary collection recipients
    /// would have built, and return intake params for them.
    pub async fn seed_operation(&self, participants: &[&str]) -> Result<ReshardingParams> {
        let source = SourceCollection::new(Self::source_ns(), Uuid::new_v4());
        let params = ReshardingParams::new(
            Uuid::new_v4(),
            source.clone(),
            KeyPattern::new("{newKey: 1}"),
            participants.iter().map(|p| ShardId::new(*p)).collect(),
        );

        self.storage.create_collection(&source.ns, source.uuid).await?;
        self.storage
            .create_collection(&params.destination_ns, params.operation_id)
            .await?;
        Ok(params)
    }

    /// Boundary markers in the replication log.
    pub async fn boundary_markers(&self) -> Vec<OplogEntry> {
        self.oplog()
            .await
            .into_iter()
            .filter(|e| e.is_boundary_marker())
            .collect()
    }

    /// Final markers written for `operation_id`.
    pub async fn final_markers(&self, operation_id: OperationId) -> Vec<OplogEntry> {
        self.oplog()
            .await
            .into_iter()
            .filter(|e| e.is_final_marker_for(operation_id))
            .collect()
    }

    async fn oplog(&self) -> Vec<OplogEntry> {
        self.storage.oplog().await.unwrap_or_default()
    }
}

/// Await `fut`, failing with `Error::Internal` if it takes longer than
/// [`TEST_TIMEOUT`].
pub async fn with_timeout<T, F>(fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::time::timeout(TEST_TIMEOUT, fut)
        .await
        .map_err(|_| Error::Internal("timed out".to_string()))?
}

/// Poll `cond` until it holds or [`TEST_TIMEOUT`] elapses.
pub async fn wait_until(cond: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + TEST_TIMEOUT;
    while !cond() {
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    true
}
