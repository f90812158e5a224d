//! Coordinator signal intake.
//!
//! The coordinator announces cluster-wide progress as a [`CoordinatorState`].
//! A state is a level, not an edge: a donor that resumes after a step-down
//! only hears the coordinator's current state, so delivering a state fires
//! every latch that state implies, not just the newest one.

use super::instance::DonorInstance;
use super::latch::LatchCategory;
use crate::error::{Result, ValidationError};
use serde::{Deserialize, Serialize};

/// Cluster-wide state of a resharding operation, as seen by the coordinator.
/// Variants are ordered by progress, except `Aborting` which can follow any
/// state short of `Committing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoordinatorState {
    Initializing,
    PreparingToDonate,
    Cloning,
    Applying,
    BlockingWrites,
    Committing,
    Aborting,
    Done,
}

impl CoordinatorState {
    /// Latches a donor must have fired once the coordinator is in this state,
    /// in firing order.
    pub fn latches(&self) -> &'static [LatchCategory] {
        const CLONED: &[LatchCategory] = &[LatchCategory::RecipientsDoneCloning];
        const BLOCKING: &[LatchCategory] = &[
            LatchCategory::RecipientsDoneCloning,
            LatchCategory::StartBlockingWrites,
        ];
        const COMMITTING: &[LatchCategory] = &[
            LatchCategory::RecipientsDoneCloning,
            LatchCategory::StartBlockingWrites,
            LatchCategory::Committing,
        ];
        match self {
            CoordinatorState::Applying => CLONED,
            CoordinatorState::BlockingWrites => BLOCKING,
            CoordinatorState::Committing => COMMITTING,
            CoordinatorState::Aborting => &[LatchCategory::Aborting],
            CoordinatorState::Initializing
            | CoordinatorState::PreparingToDonate
            | CoordinatorState::Cloning
            | CoordinatorState::Done => &[],
        }
    }
}

impl std::fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CoordinatorState::Initializing => write!(f, "initializing"),
            CoordinatorState::PreparingToDonate => write!(f, "preparing_to_donate"),
            CoordinatorState::Cloning => write!(f, "cloning"),
            CoordinatorState::Applying => write!(f, "applying"),
            CoordinatorState::BlockingWrites => write!(f, "blocking_writes"),
            CoordinatorState::Committing => write!(f, "committing"),
            CoordinatorState::Aborting => write!(f, "aborting"),
            CoordinatorState::Done => write!(f, "done"),
        }
    }
}

/// Fire every latch `state` implies on `instance`.
///
/// Redelivery is a no-op. The one rejected combination is `Committing` for a
/// donor whose record is already aborted: the coordinator cannot commit an
/// operation it aborted. Returns the latches `state` maps to.
pub fn deliver(instance: &DonorInstance, state: CoordinatorState) -> Result<&'static [LatchCategory]> {
    let categories = state.latches();
    if categories.is_empty() {
        tracing::debug!(operation_id = %instance.operation_id(), state = %state, "no donor latch for coordinator state");
        return Ok(categories);
    }

    if state == CoordinatorState::Committing && instance.record().aborted {
        return Err(ValidationError::SignalOutOfOrder {
            operation_id: instance.operation_id(),
            signal: category_name(LatchCategory::Committing),
            requires: "no prior abort",
        }
        .into());
    }

    for category in categories {
        match category {
            LatchCategory::RecipientsDoneCloning => instance.notify_recipients_done_cloning(),
            LatchCategory::StartBlockingWrites => instance.notify_start_blocking_writes(),
            LatchCategory::Committing => instance.notify_committing(),
            LatchCategory::Aborting => instance.notify_aborting(),
        }
    }
    Ok(categories)
}

fn category_name(category: LatchCategory) -> &'static str {
    match category {
        LatchCategory::RecipientsDoneCloning => "recipientsDoneCloning",
        LatchCategory::StartBlockingWrites => "startBlockingWrites",
        LatchCategory::Committing => "committing",
        LatchCategory::Aborting => "aborting",
    }
}
