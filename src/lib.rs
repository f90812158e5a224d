//! Donor side of a collection resharding operation.
//!
//! When a sharded collection is resharded, every shard that owns data for
//! the source collection acts as a donor. The donor runs a small, durable
//! state machine: it publishes a boundary marker so recipients know where to
//! start reading its replication log, waits for the coordinator to advance
//! the operation, blocks writes with one final marker per recipient, and
//! finally either drops the source collection, renames the resharded one
//! into place, or aborts and leaves the original data untouched.
//!
//! # Example
//!
//! ```rust,ignore
//! use reshard_donor::{DonorContext, DonorRegistry, DonorServiceConfig};
//! use reshard_donor::donor::CoordinatorState;
//!
//! let config = DonorServiceConfig::new().with_data_dir("./donor-data");
//! let ctx = DonorContext::open(config, external).await?;
//! let registry = DonorRegistry::new(ctx)?;
//!
//! // Resume whatever the previous primary left behind.
//! registry.on_become_primary().await?;
//!
//! let donor = registry.get_or_create(params).await?;
//! registry
//!     .on_coordinator_state_change(donor.operation_id(), CoordinatorState::Applying)
//!     .await?;
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │        Coordinator / replication layer      │
//! └─────────────────────────────────────────────┘
//!          │ state changes       │ step up / step down
//!          ▼                     ▼
//! ┌─────────────────────────────────────────────┐
//! │               DonorRegistry                 │
//! │  • create / get_or_create                   │
//! │  • on_coordinator_state_change              │
//! │  • on_become_primary / on_step_down         │
//! └─────────────────────────────────────────────┘
//!                     │
//!     ┌───────────────┼───────────────┐
//!     ▼               ▼               ▼
//! ┌─────────┐   ┌──────────┐   ┌──────────────┐
//! │ Storage │   │ External │   │  Failpoints  │
//! │(catalog)│   │ (bridge) │   │  & Metrics   │
//! └─────────┘   └──────────┘   └──────────────┘
//! ```
//!
//! # Durability
//!
//! Every phase transition is one [`storage::WriteUnit`]: the record update
//! and its side effects (markers, drop, rename) commit together or not at
//! all. A donor interrupted by a step-down resumes from its persisted record
//! on the next primary.

pub mod config;
pub mod donor;
pub mod error;
pub mod failpoint;
pub mod metrics;
pub mod retry;
pub mod storage;
pub mod testing;
pub mod types;

// Re-export main types for convenience
pub use config::{DonorServiceConfig, RetryConfig};
pub use error::{Error, Result, StorageError, ValidationError};
pub use types::{CollectionUuid, Namespace, OperationId, ShardId, Timestamp};

// Re-export donor types
pub use donor::{
    CompletionOutcome, CoordinatorState, CoordinatorUpdate, DonorContext, DonorExternalState,
    DonorInstance, DonorPhase, DonorRegistry, DonorStateRecord, ReshardingParams,
    SourceCollection,
};

// Re-export storage types
pub use storage::{DonorStorage, FileStorage, InMemoryStorage, OplogEntry, WriteUnit};

// Re-export metrics types
pub use metrics::{Counter, DonorMetrics, DonorMetricsSnapshot, Gauge, LabeledCounter};

pub use failpoint::{FailpointAction, FailpointRegistry};
