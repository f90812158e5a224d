//! End-to-end donor scenarios: commit as a pure donor, commit as a donor that
//! is also a recipient, abort, and the signal and marker contracts around
//! them.

#![cfg(test)]

use super::{wait_until, with_timeout, DonorTestHarness};
use crate::donor::{CoordinatorState, DonorPhase};
use crate::error::{Error, ValidationError};
use crate::failpoint::{pause_before_transition, FailpointAction};
use crate::storage::{DonorStorage, MarkerPayload, OplogOp};
use crate::types::{Namespace, ShardId};
use test_log::test;

// ============================================================================
// Test Helpers
// ============================================================================

const DONOR: &str = "myShardId";

/// Deliver the full commit sequence through coordinator signal intake.
async fn drive_to_commit(harness: &DonorTestHarness, id: uuid::Uuid) {
    for state in [
        CoordinatorState::Cloning,
        CoordinatorState::Applying,
        CoordinatorState::BlockingWrites,
        CoordinatorState::Committing,
    ] {
        harness
            .registry
            .on_coordinator_state_change(id, state)
            .await
            .unwrap();
    }
}

// ============================================================================
// Commit
// ============================================================================

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_donor_only_commit_drops_source() {
    let harness = DonorTestHarness::new(DONOR).unwrap();
    harness.registry.on_become_primary().await.unwrap();

    let params = harness
        .seed_operation(&["recipient1", "recipient2", "recipient3"])
        .await
        .unwrap();
    let source = params.source.clone();
    let donor = harness.registry.create(params).await.unwrap();
    let id = donor.operation_id();

    // Signals can be ordered ahead of the phases they release.
    donor.wait_for_phase(DonorPhase::DonatingLogEntries).await.unwrap();
    drive_to_commit(&harness, id).await;
    with_timeout(donor.completion_signal()).await.unwrap();

    assert_eq!(harness.storage.collection_uuid(&source.ns).await.unwrap(), None);
    assert!(harness.storage.load_record(id).await.unwrap().is_none());
    assert_eq!(donor.phase(), DonorPhase::Done);

    assert_eq!(harness.boundary_markers().await.len(), 1);
    assert_eq!(harness.final_markers(id).await.len(), 3);
    assert_eq!(harness.external.refreshed(), vec![source.ns.clone()]);
    assert!(harness.external.flushed().is_empty());

    let snapshot = harness.metrics.snapshot();
    assert_eq!(snapshot.completed, 1);
    assert_eq!(snapshot.active, 0);
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_recipient_donor_renames_temporary_collection() {
    let harness = DonorTestHarness::new(DONOR).unwrap();
    harness.registry.on_become_primary().await.unwrap();

    let params = harness
        .seed_operation(&["recipient1", DONOR, "recipient3"])
        .await
        .unwrap();
    let source = params.source.clone();
    let temp_ns = params.destination_ns.clone();
    let donor = harness.registry.create(params).await.unwrap();
    let id = donor.operation_id();

    drive_to_commit(&harness, id).await;
    with_timeout(donor.completion_signal()).await.unwrap();

    // The resharded collection now lives under the source name.
    assert_eq!(
        harness.storage.collection_uuid(&source.ns).await.unwrap(),
        Some(id)
    );
    assert_eq!(harness.storage.collection_uuid(&temp_ns).await.unwrap(), None);
    assert_eq!(harness.external.flushed(), vec![temp_ns]);
    assert!(harness.storage.load_record(id).await.unwrap().is_none());
}

#[test(tokio::test)]
async fn test_marker_layout() {
    let harness = DonorTestHarness::new(DONOR).unwrap();
    harness.registry.on_become_primary().await.unwrap();

    let params = harness
        .seed_operation(&["recipient1", DONOR, "recipient3"])
        .await
        .unwrap();
    let source = params.source.clone();
    let participants = params.participants.clone();
    let donor = harness.registry.create(params).await.unwrap();
    let id = donor.operation_id();

    donor.notify_recipients_done_cloning();
    donor.notify_start_blocking_writes();
    assert!(wait_until(|| donor.record().writes_blocked()).await);

    let boundary = harness.boundary_markers().await;
    assert_eq!(boundary.len(), 1);
    let boundary = &boundary[0];
    assert_eq!(boundary.op, OplogOp::Noop);
    assert_eq!(boundary.ns, Namespace::force_batch_boundary());
    assert!(boundary.uuid.is_none());
    assert!(boundary.destined_recipient.is_none());
    assert!(boundary.object2.is_none());
    assert!(!boundary.msg.is_empty());
    assert_eq!(donor.record().min_fetch_boundary, Some(boundary.ts));

    let finals = harness.final_markers(id).await;
    let recipients: Vec<ShardId> = finals
        .iter()
        .filter_map(|e| e.destined_recipient.clone())
        .collect();
    assert_eq!(recipients, participants);
    for marker in &finals {
        assert_eq!(marker.op, OplogOp::Noop);
        assert_eq!(marker.ns, source.ns);
        assert_eq!(marker.uuid, Some(source.uuid));
        assert!(!marker.msg.is_empty());
        assert_eq!(
            marker.object2,
            Some(MarkerPayload::ReshardFinalOp { operation_id: id })
        );
        assert!(marker.ts > boundary.ts);
    }
    assert_eq!(
        donor.record().blocking_writes_boundary,
        finals.last().map(|e| e.ts)
    );

    donor.notify_aborting();
    with_timeout(donor.completion_signal()).await.unwrap();
}

#[test(tokio::test)]
async fn test_coordinator_updates() {
    let harness = DonorTestHarness::new(DONOR).unwrap();
    harness.registry.on_become_primary().await.unwrap();

    let params = harness.seed_operation(&["recipient1"]).await.unwrap();
    let donor = harness.registry.create(params).await.unwrap();
    drive_to_commit(&harness, donor.operation_id()).await;
    with_timeout(donor.completion_signal()).await.unwrap();

    let updates = harness.external.updates();
    let phases: Vec<DonorPhase> = updates.iter().map(|u| u.phase).collect();
    assert_eq!(
        phases,
        vec![
            DonorPhase::DonatingLogEntries,
            DonorPhase::BlockingWrites,
            DonorPhase::Done
        ]
    );
    assert!(updates[0].min_fetch_boundary.is_some());
    assert!(updates.iter().all(|u| u.donor == ShardId::new(DONOR)));
    assert!(updates.iter().all(|u| !u.aborted));
}

#[test(tokio::test)]
async fn test_coordinator_update_failures_are_retried() {
    let harness = DonorTestHarness::new(DONOR).unwrap();
    harness.registry.on_become_primary().await.unwrap();
    harness.external.fail_next_updates(3);

    let params = harness.seed_operation(&["recipient1"]).await.unwrap();
    let donor = harness.registry.create(params).await.unwrap();
    drive_to_commit(&harness, donor.operation_id()).await;
    with_timeout(donor.completion_signal()).await.unwrap();

    assert_eq!(harness.external.updates().len(), 3);
    assert!(harness.metrics.snapshot().retries >= 3);
}

// ============================================================================
// Abort
// ============================================================================

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_abort_retains_source_collection() {
    let harness = DonorTestHarness::new(DONOR).unwrap();
    harness.registry.on_become_primary().await.unwrap();

    let params = harness
        .seed_operation(&["recipient1", "recipient2", "recipient3"])
        .await
        .unwrap();
    let source = params.source.clone();
    let donor = harness.registry.create(params).await.unwrap();
    let id = donor.operation_id();

    harness
        .registry
        .on_coordinator_state_change(id, CoordinatorState::Applying)
        .await
        .unwrap();
    donor.wait_for_phase(DonorPhase::BlockingWrites).await.unwrap();
    harness
        .registry
        .on_coordinator_state_change(id, CoordinatorState::Aborting)
        .await
        .unwrap();
    with_timeout(donor.completion_signal()).await.unwrap();

    assert_eq!(
        harness.storage.collection_uuid(&source.ns).await.unwrap(),
        Some(source.uuid)
    );
    assert!(harness.final_markers(id).await.is_empty());
    assert!(harness.storage.load_record(id).await.unwrap().is_none());
    assert!(harness.external.refreshed().is_empty());

    let last = harness.external.updates().pop().unwrap();
    assert_eq!(last.phase, DonorPhase::Done);
    assert!(last.aborted);
    assert_eq!(harness.metrics.snapshot().aborted, 1);
}

#[test(tokio::test)]
async fn test_abort_before_boundary_marker() {
    let harness = DonorTestHarness::new(DONOR).unwrap();
    harness.registry.on_become_primary().await.unwrap();
    let name = pause_before_transition(DonorPhase::DonatingInitialData);
    harness.failpoints.enable(&name, FailpointAction::Pause);

    let params = harness.seed_operation(&["recipient1"]).await.unwrap();
    let donor = harness.registry.create(params).await.unwrap();
    harness.failpoints.wait_for_hit(&name, 1).await;

    donor.notify_aborting();
    harness.failpoints.disable(&name);
    with_timeout(donor.completion_signal()).await.unwrap();

    assert!(harness.boundary_markers().await.is_empty());
    assert!(harness
        .storage
        .load_record(donor.operation_id())
        .await
        .unwrap()
        .is_none());
}

#[test(tokio::test)]
async fn test_abort_wins_over_commit_at_same_suspension_point() {
    let harness = DonorTestHarness::new(DONOR).unwrap();
    harness.registry.on_become_primary().await.unwrap();
    let name = pause_before_transition(DonorPhase::BlockingWrites);
    harness.failpoints.enable(&name, FailpointAction::Pause);

    let params = harness.seed_operation(&["recipient1"]).await.unwrap();
    let source = params.source.clone();
    let donor = harness.registry.create(params).await.unwrap();
    donor.notify_recipients_done_cloning();
    harness.failpoints.wait_for_hit(&name, 1).await;

    donor.notify_start_blocking_writes();
    donor.notify_committing();
    donor.notify_aborting();
    harness.failpoints.disable(&name);
    with_timeout(donor.completion_signal()).await.unwrap();

    assert_eq!(
        harness.storage.collection_uuid(&source.ns).await.unwrap(),
        Some(source.uuid)
    );
    assert_eq!(harness.metrics.snapshot().aborted, 1);
}

#[test(tokio::test)]
async fn test_abort_after_done_is_noop() {
    let harness = DonorTestHarness::new(DONOR).unwrap();
    harness.registry.on_become_primary().await.unwrap();

    let params = harness.seed_operation(&["recipient1"]).await.unwrap();
    let source = params.source.clone();
    let donor = harness.registry.create(params).await.unwrap();
    drive_to_commit(&harness, donor.operation_id()).await;
    with_timeout(donor.completion_signal()).await.unwrap();

    donor.notify_aborting();
    with_timeout(donor.completion_signal()).await.unwrap();
    assert_eq!(harness.storage.collection_uuid(&source.ns).await.unwrap(), None);
    assert_eq!(harness.metrics.snapshot().aborted, 0);
}

// ============================================================================
// Intake
// ============================================================================

#[test(tokio::test)]
async fn test_intake_validation() {
    let harness = DonorTestHarness::new(DONOR).unwrap();
    harness.registry.on_become_primary().await.unwrap();

    let params = harness.seed_operation(&["recipient1"]).await.unwrap();
    harness.registry.create(params.clone()).await.unwrap();
    let err = harness.registry.create(params.clone()).await.unwrap_err();
    assert!(matches!(
        err,
        Error::Validation(ValidationError::DuplicateOperation(_))
    ));

    let dup = harness
        .seed_operation(&["recipient1", "recipient2", "recipient1"])
        .await
        .unwrap();
    let err = harness.registry.create(dup).await.unwrap_err();
    assert!(matches!(
        err,
        Error::Validation(ValidationError::DuplicateParticipant(_))
    ));
    assert_eq!(harness.registry.active_operations(), vec![params.operation_id]);
}

#[test(tokio::test)]
async fn test_current_state_alone_drives_commit() {
    let harness = DonorTestHarness::new(DONOR).unwrap();
    harness.registry.on_become_primary().await.unwrap();

    let params = harness
        .seed_operation(&["recipient1", "recipient2"])
        .await
        .unwrap();
    let source = params.source.clone();
    let donor = harness.registry.create(params).await.unwrap();
    let id = donor.operation_id();
    donor.wait_for_phase(DonorPhase::DonatingLogEntries).await.unwrap();

    // Committing implies every earlier coordinator state.
    harness
        .registry
        .on_coordinator_state_change(id, CoordinatorState::Committing)
        .await
        .unwrap();
    with_timeout(donor.completion_signal()).await.unwrap();

    assert_eq!(harness.storage.collection_uuid(&source.ns).await.unwrap(), None);
    assert_eq!(harness.boundary_markers().await.len(), 1);
    assert_eq!(harness.final_markers(id).await.len(), 2);

    // Redelivery once the donor is gone is ignored.
    harness
        .registry
        .on_coordinator_state_change(id, CoordinatorState::Committing)
        .await
        .unwrap();
}
