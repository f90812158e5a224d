//! Donor side of a resharding operation.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                        DonorRegistry                          │
//! │  on_become_primary / on_step_down / create / get_or_create    │
//! │  ┌──────────────────┐  ┌──────────────────┐                   │
//! │  │  DonorInstance   │  │  DonorInstance   │  ...              │
//! │  │  latches, phase  │  │  latches, phase  │                   │
//! │  └────────┬─────────┘  └────────┬─────────┘                   │
//! └───────────┼─────────────────────┼─────────────────────────────┘
//!             │ WriteUnit           │ bridge calls
//!             ▼                     ▼
//!      ┌─────────────┐      ┌─────────────────────┐
//!      │DonorStorage │      │ DonorExternalState  │
//!      └─────────────┘      └─────────────────────┘
//! ```
//!
//! - [`record`]: the persisted [`DonorStateRecord`] and [`DonorPhase`].
//! - [`latch`]: single-assignment signals for coordinator notifications.
//! - [`external`]: capabilities the donor calls but does not implement.
//! - [`signal`]: coordinator state intake and ordering checks.
//! - [`instance`]: the state machine.
//! - [`registry`]: the per-node instance table and leadership lifecycle.

pub mod external;
pub mod instance;
pub mod latch;
pub mod record;
pub mod registry;
pub mod signal;

pub use external::{CoordinatorUpdate, DonorExternalState, NoOpExternalState};
pub use instance::{CompletionOutcome, DonorContext, DonorInstance};
pub use latch::{DonorLatches, EventLatch, LatchCategory};
pub use record::{
    validate_participants, DonorPhase, DonorStateRecord, KeyPattern, ReshardingParams,
    SourceCollection,
};
pub use registry::DonorRegistry;
pub use signal::CoordinatorState;
