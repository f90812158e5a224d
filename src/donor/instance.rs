//! The donor state machine.
//!
//! A [`DonorInstance`] drives one persisted [`DonorStateRecord`] from its
//! current phase to `Done`. Its steps run strictly in sequence inside a single
//! task; between steps it either commits one transition unit or suspends on a
//! latch. Every suspension point also watches the leadership token, so a
//! step-down interrupts the instance at the next boundary and never in the
//! middle of a unit.
//!
//! # Phase flow
//!
//! ```text
//! PreparingToDonate ──▶ DonatingInitialData ──▶ DonatingLogEntries
//!                                    (boundary marker)      │ recipientsDoneCloning
//!                                                           ▼
//!              Done ◀── committing ── BlockingWrites ◀──────┘
//!               ▲                       │ startBlockingWrites
//!               │                       ▼ (final markers)
//!               └──────── aborting (from any non-terminal phase)
//! ```
//!
//! Resumption reads only the persisted phase and boundary fields: whatever a
//! committed unit did is reflected there, so nothing is ever replayed.

use super::external::{CoordinatorUpdate, DonorExternalState};
use super::latch::{DonorLatches, EventLatch};
use super::record::{DonorPhase, DonorStateRecord, ReshardingParams};
use crate::config::DonorServiceConfig;
use crate::error::{Error, Result};
use crate::failpoint::{pause_before_transition, FailpointRegistry};
use crate::metrics::DonorMetrics;
use crate::retry::retry_transient;
use crate::storage::{
    DonorStorage, FileStorage, InMemoryStorage, NamespaceLocks, OplogEntry, WriteUnit,
};
use crate::types::OperationId;
use parking_lot::RwLock;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};
use tokio_util::sync::CancellationToken;

/// Services shared by every donor instance on a node.
#[derive(Debug)]
pub struct DonorContext {
    pub storage: Arc<dyn DonorStorage>,
    pub external: Arc<dyn DonorExternalState>,
    pub config: DonorServiceConfig,
    pub failpoints: Arc<FailpointRegistry>,
    pub metrics: Arc<DonorMetrics>,
    pub namespace_locks: Arc<NamespaceLocks>,
    /// Bounds transition units executing at once across instances.
    pub step_permits: Arc<Semaphore>,
}

impl DonorContext {
    pub fn new(
        config: DonorServiceConfig,
        storage: Arc<dyn DonorStorage>,
        external: Arc<dyn DonorExternalState>,
    ) -> Self {
        let step_permits = Arc::new(Semaphore::new(config.max_concurrent_steps));
        Self {
            storage,
            external,
            config,
            failpoints: Arc::new(FailpointRegistry::new()),
            metrics: Arc::new(DonorMetrics::new()),
            namespace_locks: Arc::new(NamespaceLocks::new()),
            step_permits,
        }
    }

    /// Context over the storage `config` selects: a [`FileStorage`] in
    /// `data_dir` when set, in-memory storage otherwise.
    pub async fn open(
        config: DonorServiceConfig,
        external: Arc<dyn DonorExternalState>,
    ) -> Result<Self> {
        config.validate()?;
        let storage: Arc<dyn DonorStorage> = match &config.data_dir {
            Some(dir) => Arc::new(FileStorage::open(dir).await?),
            None => Arc::new(InMemoryStorage::new()),
        };
        Ok(Self::new(config, storage, external))
    }

    pub fn with_failpoints(mut self, failpoints: Arc<FailpointRegistry>) -> Self {
        self.failpoints = failpoints;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<DonorMetrics>) -> Self {
        self.metrics = metrics;
        self
    }
}

/// How an instance finished. Cloned to every completion waiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionOutcome {
    /// Committed or gracefully aborted.
    Ok,
    /// Leadership was lost; the record survives for the next primary.
    Interrupted,
    /// Unrecoverable failure.
    Fatal(String),
}

impl CompletionOutcome {
    pub fn into_result(self) -> Result<()> {
        match self {
            CompletionOutcome::Ok => Ok(()),
            CompletionOutcome::Interrupted => Err(Error::Interrupted),
            CompletionOutcome::Fatal(msg) => Err(Error::Fatal(msg)),
        }
    }
}

/// What woke an instance suspended on a latch.
enum Wake {
    Fired,
    Aborted,
}

/// In-memory state machine for one donor operation.
#[derive(Debug)]
pub struct DonorInstance {
    operation_id: OperationId,
    /// Last durably committed record.
    record: RwLock<DonorStateRecord>,
    latches: DonorLatches,
    phase: watch::Sender<DonorPhase>,
    completion: watch::Sender<Option<CompletionOutcome>>,
    cancellation: CancellationToken,
    ctx: Arc<DonorContext>,
}

impl DonorInstance {
    fn new(ctx: Arc<DonorContext>, record: DonorStateRecord, cancellation: CancellationToken) -> Self {
        Self {
            operation_id: record.operation_id,
            phase: watch::channel(record.phase).0,
            record: RwLock::new(record),
            latches: DonorLatches::new(),
            completion: watch::channel(None).0,
            cancellation,
            ctx,
        }
    }

    /// Validate `params`, persist a fresh record, and build an instance for it.
    ///
    /// Fails with `DuplicateParticipant` or `EmptyParticipantSet` for a bad
    /// participant set and `DuplicateOperation` if a record with the same id
    /// already exists. The instance does not run until the registry starts it.
    #[tracing::instrument(skip(ctx, params, cancellation), fields(operation_id = %params.operation_id))]
    pub async fn create(
        ctx: Arc<DonorContext>,
        params: ReshardingParams,
        cancellation: CancellationToken,
    ) -> Result<Arc<Self>> {
        let record = DonorStateRecord::new(params)?;

        retry_transient(&ctx.config.storage_retry, &ctx.metrics, "insert record", || {
            ctx.storage.commit(WriteUnit::new().insert_record(record.clone()))
        })
        .await?;

        tracing::info!(
            operation_id = %record.operation_id,
            source_ns = %record.source.ns,
            participants = record.participants.len(),
            "created donor state record"
        );
        Ok(Arc::new(Self::new(ctx, record, cancellation)))
    }

    /// Build an instance for an already persisted record.
    pub fn resume(
        ctx: Arc<DonorContext>,
        record: DonorStateRecord,
        cancellation: CancellationToken,
    ) -> Arc<Self> {
        tracing::info!(
            operation_id = %record.operation_id,
            phase = %record.phase,
            aborted = record.aborted,
            "resuming donor from persisted record"
        );
        let aborted = record.aborted;
        let instance = Self::new(ctx, record, cancellation);
        if aborted {
            instance.latches.aborting.fire();
        }
        Arc::new(instance)
    }

    pub fn operation_id(&self) -> OperationId {
        self.operation_id
    }

    /// Phase of the last committed record.
    pub fn phase(&self) -> DonorPhase {
        *self.phase.borrow()
    }

    /// Copy of the last committed record.
    pub fn record(&self) -> DonorStateRecord {
        self.record.read().clone()
    }

    pub fn latches(&self) -> &DonorLatches {
        &self.latches
    }

    /// Whether the instance has finished, in any way.
    pub fn is_complete(&self) -> bool {
        self.completion.borrow().is_some()
    }

    pub fn notify_recipients_done_cloning(&self) {
        self.fire(&self.latches.recipients_done_cloning);
    }

    pub fn notify_start_blocking_writes(&self) {
        self.fire(&self.latches.start_blocking_writes);
    }

    pub fn notify_committing(&self) {
        self.fire(&self.latches.committing);
    }

    pub fn notify_aborting(&self) {
        self.fire(&self.latches.aborting);
    }

    fn fire(&self, latch: &EventLatch) {
        if latch.fire() {
            tracing::info!(operation_id = %self.operation_id, latch = %latch.category(), "latch fired");
        } else {
            tracing::debug!(operation_id = %self.operation_id, latch = %latch.category(), "latch already fired");
        }
    }

    /// Resolves once the instance finishes: `Ok` on commit or abort,
    /// `Interrupted` on leadership loss, `Fatal` otherwise.
    pub async fn completion_signal(&self) -> Result<()> {
        let mut rx = self.completion.subscribe();
        let outcome = rx
            .wait_for(|outcome| outcome.is_some())
            .await
            .ok()
            .and_then(|outcome| outcome.clone());
        outcome.unwrap_or(CompletionOutcome::Interrupted).into_result()
    }

    /// Wait until the committed phase is at least `phase`. Fails with the
    /// instance's outcome if it finishes short of `phase`, e.g. on a
    /// step-down.
    pub async fn wait_for_phase(&self, phase: DonorPhase) -> Result<()> {
        let mut phase_rx = self.phase.subscribe();
        let mut completion_rx = self.completion.subscribe();

        let outcome = tokio::select! {
            biased;
            _ = async { phase_rx.wait_for(|current| *current >= phase).await.is_ok() } => None,
            outcome = async {
                completion_rx
                    .wait_for(|outcome| outcome.is_some())
                    .await
                    .ok()
                    .and_then(|outcome| outcome.clone())
            } => Some(outcome.unwrap_or(CompletionOutcome::Interrupted)),
        };

        match outcome {
            Some(outcome) if self.phase() < phase => {
                outcome.into_result()?;
                Err(Error::Internal(format!(
                    "donor finished at {} before reaching {}",
                    self.phase(),
                    phase
                )))
            }
            _ => Ok(()),
        }
    }

    /// Drive the instance to completion and publish the outcome.
    pub(crate) async fn run(&self) {
        let outcome = match self.run_phases().await {
            Ok(()) => {
                self.ctx.metrics.record_finished(self.record.read().aborted);
                CompletionOutcome::Ok
            }
            Err(Error::Interrupted) => {
                tracing::warn!(
                    operation_id = %self.operation_id,
                    phase = %self.phase(),
                    "donor interrupted by leadership change"
                );
                self.ctx.metrics.record_interrupted();
                CompletionOutcome::Interrupted
            }
            Err(e) => {
                tracing::error!(
                    operation_id = %self.operation_id,
                    phase = %self.phase(),
                    error = %e,
                    "donor failed"
                );
                self.ctx.metrics.record_failed();
                CompletionOutcome::Fatal(e.to_string())
            }
        };
        self.completion.send_replace(Some(outcome));
    }

    async fn run_phases(&self) -> Result<()> {
        loop {
            if self.cancellation.is_cancelled() {
                return Err(Error::Interrupted);
            }

            let record = self.record();
            match record.phase {
                DonorPhase::PreparingToDonate => {
                    if self.latches.aborting.is_fired() {
                        self.abort(&record).await?;
                    } else {
                        self.transition_to_donating_initial_data(&record).await?;
                    }
                }
                DonorPhase::DonatingInitialData => {
                    if self.latches.aborting.is_fired() {
                        self.abort(&record).await?;
                    } else {
                        self.transition_to_donating_log_entries(&record).await?;
                    }
                }
                DonorPhase::DonatingLogEntries => {
                    self.report(&record).await?;
                    match self.wait_for(&self.latches.recipients_done_cloning).await? {
                        Wake::Fired => self.transition_to_blocking_writes(&record).await?,
                        Wake::Aborted => self.abort(&record).await?,
                    }
                }
                DonorPhase::BlockingWrites if !record.writes_blocked() => {
                    match self.wait_for(&self.latches.start_blocking_writes).await? {
                        Wake::Fired => self.write_final_markers(&record).await?,
                        Wake::Aborted => self.abort(&record).await?,
                    }
                }
                DonorPhase::BlockingWrites => {
                    self.report(&record).await?;
                    match self.wait_for(&self.latches.committing).await? {
                        Wake::Fired => self.commit(&record).await?,
                        Wake::Aborted => self.abort(&record).await?,
                    }
                }
                DonorPhase::Done => {
                    return self.finish(&record).await;
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Suspension points
    // ------------------------------------------------------------------

    /// Race `fut` against leadership loss.
    async fn cancellable<F: Future>(&self, fut: F) -> Result<F::Output> {
        tokio::select! {
            biased;
            _ = self.cancellation.cancelled() => Err(Error::Interrupted),
            out = fut => Ok(out),
        }
    }

    /// Suspend until `latch` fires. An abort wins over `latch` when both
    /// have fired.
    async fn wait_for(&self, latch: &EventLatch) -> Result<Wake> {
        tracing::debug!(operation_id = %self.operation_id, latch = %latch.category(), "waiting on latch");
        tokio::select! {
            biased;
            _ = self.cancellation.cancelled() => Err(Error::Interrupted),
            _ = self.latches.aborting.wait() => Ok(Wake::Aborted),
            _ = latch.wait() => Ok(Wake::Fired),
        }
    }

    /// Last cancellable point before a unit that writes `to` state.
    /// Entering BlockingWrites and writing the final markers share a
    /// failpoint. Returns the permit the unit runs under.
    async fn prepare_unit(&self, to: DonorPhase) -> Result<tokio::sync::OwnedSemaphorePermit> {
        let name = pause_before_transition(to);
        self.cancellable(retry_transient(
            &self.ctx.config.storage_retry,
            &self.ctx.metrics,
            "transition failpoint",
            || self.ctx.failpoints.check(&name),
        ))
        .await??;

        self.cancellable(self.ctx.step_permits.clone().acquire_owned())
            .await?
            .map_err(|_| Error::Internal("step permits closed".to_string()))
    }

    // ------------------------------------------------------------------
    // Transition units
    // ------------------------------------------------------------------

    /// Commit `unit` and publish `next` as the new durable state. Not
    /// cancellable: once started, the unit runs to completion or failure.
    async fn commit_unit(&self, unit: WriteUnit, next: DonorStateRecord) -> Result<()> {
        retry_transient(
            &self.ctx.config.storage_retry,
            &self.ctx.metrics,
            "commit transition",
            || self.ctx.storage.commit(unit.clone()),
        )
        .await?;

        let from = self.record.read().phase;
        let to = next.phase;
        *self.record.write() = next;
        self.phase.send_replace(to);

        if from != to {
            tracing::info!(
                operation_id = %self.operation_id,
                from_phase = %from,
                to_phase = %to,
                "donor phase transition"
            );
            self.ctx.metrics.record_transition(&to.to_string());
        }
        Ok(())
    }

    #[tracing::instrument(skip(self, record), fields(operation_id = %self.operation_id))]
    async fn transition_to_donating_initial_data(&self, record: &DonorStateRecord) -> Result<()> {
        let next = record.with_phase(DonorPhase::DonatingInitialData);
        let _permit = self.prepare_unit(next.phase).await?;
        self.commit_unit(WriteUnit::new().update_record(next.clone()), next)
            .await
    }

    #[tracing::instrument(skip(self, record), fields(operation_id = %self.operation_id))]
    async fn transition_to_donating_log_entries(&self, record: &DonorStateRecord) -> Result<()> {
        let _permit = self.prepare_unit(DonorPhase::DonatingLogEntries).await?;

        let ts = retry_transient(
            &self.ctx.config.storage_retry,
            &self.ctx.metrics,
            "reserve op time",
            || self.ctx.storage.reserve_op_time(),
        )
        .await?;

        let mut next = record.with_phase(DonorPhase::DonatingLogEntries);
        next.min_fetch_boundary = Some(ts);
        let unit = WriteUnit::new()
            .append_oplog(OplogEntry::boundary_marker(ts, record))
            .update_record(next.clone());

        self.commit_unit(unit, next).await?;
        self.ctx.metrics.record_boundary_marker();
        tracing::info!(operation_id = %self.operation_id, min_fetch_boundary = ts, "wrote boundary marker");
        Ok(())
    }

    #[tracing::instrument(skip(self, record), fields(operation_id = %self.operation_id))]
    async fn transition_to_blocking_writes(&self, record: &DonorStateRecord) -> Result<()> {
        let next = record.with_phase(DonorPhase::BlockingWrites);
        let _permit = self.prepare_unit(next.phase).await?;
        self.commit_unit(WriteUnit::new().update_record(next.clone()), next)
            .await
    }

    /// Write one final marker per participant, recording the blocking
    /// boundary in the same unit.
    #[tracing::instrument(skip(self, record), fields(operation_id = %self.operation_id))]
    async fn write_final_markers(&self, record: &DonorStateRecord) -> Result<()> {
        let _permit = self.prepare_unit(DonorPhase::BlockingWrites).await?;

        let mut unit = WriteUnit::new();
        let mut boundary = None;
        for recipient in &record.participants {
            let ts = retry_transient(
                &self.ctx.config.storage_retry,
                &self.ctx.metrics,
                "reserve op time",
                || self.ctx.storage.reserve_op_time(),
            )
            .await?;
            unit = unit.append_oplog(OplogEntry::final_marker(ts, record, recipient));
            boundary = Some(ts);
        }

        let mut next = record.clone();
        next.blocking_writes_boundary = boundary;
        self.commit_unit(unit.update_record(next.clone()), next).await?;

        let count = record.participants.len() as u64;
        self.ctx.metrics.record_final_markers(count);
        tracing::info!(
            operation_id = %self.operation_id,
            markers = count,
            blocking_writes_boundary = ?boundary,
            "writes to source collection blocked"
        );
        Ok(())
    }

    /// Replace or drop the source collection and move to `Done` in one unit.
    #[tracing::instrument(skip(self, record), fields(operation_id = %self.operation_id))]
    async fn commit(&self, record: &DonorStateRecord) -> Result<()> {
        let me = self.ctx.external.my_shard_id();
        let also_recipient = record.is_participant(&me);

        if also_recipient {
            self.cancellable(retry_transient(
                &self.ctx.config.external_retry,
                &self.ctx.metrics,
                "wait for collection flush",
                || self.ctx.external.wait_for_collection_flush(&record.destination_ns),
            ))
            .await??;
        }

        let _permit = self.prepare_unit(DonorPhase::Done).await?;
        let source = &record.source;
        let _guard = self
            .cancellable(
                self.ctx
                    .namespace_locks
                    .lock(&[&source.ns, &record.destination_ns]),
            )
            .await?;

        let mut unit = WriteUnit::new();
        let current = self.ctx.storage.collection_uuid(&source.ns).await?;

        if also_recipient {
            let destination_uuid = record.destination_uuid();
            if current == Some(destination_uuid) {
                tracing::warn!(
                    operation_id = %self.operation_id,
                    ns = %source.ns,
                    "source namespace already holds resharded collection, skipping rename"
                );
            } else if self.ctx.storage.collection_uuid(&record.destination_ns).await?
                == Some(destination_uuid)
            {
                unit = unit.rename_collection(
                    record.destination_ns.clone(),
                    source.ns.clone(),
                    destination_uuid,
                );
            } else {
                return Err(Error::Fatal(format!(
                    "resharded collection {} not found under {} or {}",
                    destination_uuid, record.destination_ns, source.ns
                )));
            }
        } else {
            match current {
                Some(uuid) if uuid == source.uuid => {
                    unit = unit.drop_collection(source.ns.clone(), uuid);
                }
                Some(other) => {
                    tracing::warn!(
                        operation_id = %self.operation_id,
                        ns = %source.ns,
                        expected = %source.uuid,
                        found = %other,
                        "source namespace holds a different collection, leaving it"
                    );
                }
                None => {
                    tracing::warn!(
                        operation_id = %self.operation_id,
                        ns = %source.ns,
                        "source collection already dropped"
                    );
                }
            }
        }

        let next = record.with_phase(DonorPhase::Done);
        self.commit_unit(unit.update_record(next.clone()), next).await
    }

    /// Move straight to `Done` with the abort flag set. The source
    /// collection is left untouched.
    #[tracing::instrument(skip(self, record), fields(operation_id = %self.operation_id))]
    async fn abort(&self, record: &DonorStateRecord) -> Result<()> {
        tracing::warn!(operation_id = %self.operation_id, phase = %record.phase, "aborting donor");
        let mut next = record.with_phase(DonorPhase::Done);
        next.aborted = true;

        let _permit = self.prepare_unit(DonorPhase::Done).await?;
        self.commit_unit(WriteUnit::new().update_record(next.clone()), next)
            .await
    }

    /// Post-`Done` work: bridge calls, then record deletion.
    #[tracing::instrument(skip(self, record), fields(operation_id = %self.operation_id))]
    async fn finish(&self, record: &DonorStateRecord) -> Result<()> {
        if !record.aborted {
            self.cancellable(retry_transient(
                &self.ctx.config.external_retry,
                &self.ctx.metrics,
                "refresh catalog cache",
                || self.ctx.external.refresh_catalog_cache(&record.source.ns),
            ))
            .await??;
        }
        self.report(record).await?;

        if self.cancellation.is_cancelled() {
            return Err(Error::Interrupted);
        }
        retry_transient(
            &self.ctx.config.storage_retry,
            &self.ctx.metrics,
            "delete record",
            || {
                self.ctx
                    .storage
                    .commit(WriteUnit::new().delete_record(self.operation_id))
            },
        )
        .await?;

        tracing::info!(
            operation_id = %self.operation_id,
            aborted = record.aborted,
            "donor finished"
        );
        Ok(())
    }

    /// Push this donor's current state to the coordinator.
    async fn report(&self, record: &DonorStateRecord) -> Result<()> {
        let update = CoordinatorUpdate {
            operation_id: self.operation_id,
            donor: self.ctx.external.my_shard_id(),
            phase: record.phase,
            min_fetch_boundary: record.min_fetch_boundary,
            aborted: record.aborted,
        };
        self.cancellable(retry_transient(
            &self.ctx.config.external_retry,
            &self.ctx.metrics,
            "update coordinator",
            || self.ctx.external.update_coordinator(update.clone()),
        ))
        .await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::donor::{KeyPattern, NoOpExternalState, SourceCollection};
    use crate::config::RetryConfig;
    use crate::error::ValidationError;
    use crate::failpoint::FailpointAction;
    use crate::storage::InMemoryStorage;
    use crate::types::{Namespace, ShardId};
    use std::time::Duration;
    use test_log::test;
    use uuid::Uuid;

    struct Fixture {
        storage: Arc<InMemoryStorage>,
        ctx: Arc<DonorContext>,
        source: SourceCollection,
    }

    async fn fixture(me: &str) -> Fixture {
        let storage = Arc::new(InMemoryStorage::new());
        let config = DonorServiceConfig::new()
            .with_storage_retry(RetryConfig::immediate(3))
            .with_external_retry(RetryConfig::immediate(3));
        let ctx = Arc::new(DonorContext::new(
            config,
            storage.clone(),
            Arc::new(NoOpExternalState::new(ShardId::new(me))),
        ));
        let source = SourceCollection::new(Namespace::new("sourcedb", "sourcecollection"), Uuid::new_v4());
        storage.create_collection(&source.ns, source.uuid).await.unwrap();
        Fixture { storage, ctx, source }
    }

    fn params(source: &SourceCollection, participants: &[&str]) -> ReshardingParams {
        ReshardingParams::new(
            Uuid::new_v4(),
            source.clone(),
            KeyPattern::new("{newKey: 1}"),
            participants.iter().map(|p| ShardId::new(*p)).collect(),
        )
    }

    fn spawn(instance: &Arc<DonorInstance>) -> tokio::task::JoinHandle<()> {
        let instance = instance.clone();
        tokio::spawn(async move { instance.run().await })
    }

    #[test(tokio::test)]
    async fn test_create_persists_record() {
        let f = fixture("myShardId").await;
        let p = params(&f.source, &["recipient1", "recipient3"]);
        let instance = DonorInstance::create(f.ctx.clone(), p.clone(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(instance.phase(), DonorPhase::PreparingToDonate);
        let stored = f.storage.load_record(p.operation_id).await.unwrap().unwrap();
        assert_eq!(stored, instance.record());
    }

    #[test(tokio::test)]
    async fn test_create_rejects_duplicate_operation() {
        let f = fixture("myShardId").await;
        let p = params(&f.source, &["recipient1"]);
        DonorInstance::create(f.ctx.clone(), p.clone(), CancellationToken::new())
            .await
            .unwrap();

        let err = DonorInstance::create(f.ctx.clone(), p.clone(), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Validation(ValidationError::DuplicateOperation(id)) if id == p.operation_id
        ));
    }

    #[test(tokio::test)]
    async fn test_advances_to_donating_log_entries_without_signals() {
        let f = fixture("myShardId").await;
        let instance = DonorInstance::create(
            f.ctx.clone(),
            params(&f.source, &["recipient1", "recipient3"]),
            CancellationToken::new(),
        )
        .await
        .unwrap();
        let task = spawn(&instance);

        instance.wait_for_phase(DonorPhase::DonatingLogEntries).await.unwrap();
        let record = instance.record();
        let oplog = f.storage.oplog().await.unwrap();
        assert_eq!(oplog.len(), 1);
        assert!(oplog[0].is_boundary_marker());
        assert_eq!(record.min_fetch_boundary, Some(oplog[0].ts));

        // Stays parked until the cloning latch fires.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(instance.phase(), DonorPhase::DonatingLogEntries);

        instance.notify_aborting();
        instance.completion_signal().await.unwrap();
        task.await.unwrap();
    }

    #[test(tokio::test)]
    async fn test_transient_commit_failures_are_retried() {
        let f = fixture("myShardId").await;
        let instance = DonorInstance::create(
            f.ctx.clone(),
            params(&f.source, &["recipient1"]),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        f.storage.fail_next_commits(2);
        let task = spawn(&instance);
        instance.wait_for_phase(DonorPhase::DonatingLogEntries).await.unwrap();
        assert_eq!(f.ctx.metrics.snapshot().retries, 2);

        instance.notify_aborting();
        instance.completion_signal().await.unwrap();
        task.await.unwrap();
    }

    #[test(tokio::test)]
    async fn test_exhausted_retries_are_fatal() {
        let f = fixture("myShardId").await;
        let instance = DonorInstance::create(
            f.ctx.clone(),
            params(&f.source, &["recipient1"]),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        f.storage.fail_next_commits(100);
        let task = spawn(&instance);
        let err = instance.completion_signal().await.unwrap_err();
        assert!(matches!(err, Error::Fatal(_)));
        task.await.unwrap();

        // Nothing moved.
        let stored = f.storage.load_record(instance.operation_id()).await.unwrap().unwrap();
        assert_eq!(stored.phase, DonorPhase::PreparingToDonate);
        assert_eq!(f.ctx.metrics.snapshot().failed, 1);
    }

    #[test(tokio::test)]
    async fn test_failpoint_error_is_retried() {
        let f = fixture("myShardId").await;
        f.ctx.failpoints.enable(
            &pause_before_transition(DonorPhase::DonatingInitialData),
            FailpointAction::Error(2),
        );
        let instance = DonorInstance::create(
            f.ctx.clone(),
            params(&f.source, &["recipient1"]),
            CancellationToken::new(),
        )
        .await
        .unwrap();
        let task = spawn(&instance);

        instance.wait_for_phase(DonorPhase::DonatingLogEntries).await.unwrap();
        let stats = f
            .ctx
            .failpoints
            .stats(&pause_before_transition(DonorPhase::DonatingInitialData))
            .unwrap();
        assert_eq!(stats.triggered_count, 2);

        instance.notify_aborting();
        instance.completion_signal().await.unwrap();
        task.await.unwrap();
    }

    #[test(tokio::test)]
    async fn test_cancel_while_paused_leaves_record_behind() {
        let f = fixture("myShardId").await;
        let name = pause_before_transition(DonorPhase::DonatingLogEntries);
        f.ctx.failpoints.enable(&name, FailpointAction::Pause);

        let token = CancellationToken::new();
        let instance = DonorInstance::create(
            f.ctx.clone(),
            params(&f.source, &["recipient1"]),
            token.clone(),
        )
        .await
        .unwrap();
        let task = spawn(&instance);

        f.ctx.failpoints.wait_for_hit(&name, 1).await;
        let waiter = {
            let instance = instance.clone();
            tokio::spawn(async move { instance.wait_for_phase(DonorPhase::BlockingWrites).await })
        };
        token.cancel();

        let err = instance.completion_signal().await.unwrap_err();
        assert!(err.is_interrupted());
        task.await.unwrap();

        // A phase wait does not outlive the instance.
        let err = waiter.await.unwrap().unwrap_err();
        assert!(err.is_interrupted());
        assert!(instance.wait_for_phase(DonorPhase::DonatingInitialData).await.is_ok());

        let stored = f.storage.load_record(instance.operation_id()).await.unwrap().unwrap();
        assert_eq!(stored.phase, DonorPhase::DonatingInitialData);
        assert!(f.storage.oplog().await.unwrap().is_empty());
    }

    #[test(tokio::test)]
    async fn test_missing_resharded_collection_is_fatal() {
        // Also a recipient, but the temporary collection was never created.
        let f = fixture("recipient1").await;
        let instance = DonorInstance::create(
            f.ctx.clone(),
            params(&f.source, &["recipient1"]),
            CancellationToken::new(),
        )
        .await
        .unwrap();
        let task = spawn(&instance);

        instance.notify_recipients_done_cloning();
        instance.notify_start_blocking_writes();
        instance.notify_committing();

        let err = instance.completion_signal().await.unwrap_err();
        assert!(matches!(err, Error::Fatal(ref msg) if msg.contains("not found")));
        task.await.unwrap();

        // The failed unit never reached storage.
        let stored = f.storage.load_record(instance.operation_id()).await.unwrap().unwrap();
        assert_eq!(stored.phase, DonorPhase::BlockingWrites);
        assert_eq!(
            f.storage.collection_uuid(&f.source.ns).await.unwrap(),
            Some(f.source.uuid)
        );
    }

    #[test(tokio::test)]
    async fn test_resume_at_done_skips_side_effects() {
        let f = fixture("myShardId").await;
        let mut record = DonorStateRecord::new(params(&f.source, &["recipient1"])).unwrap();
        record.phase = DonorPhase::Done;
        f.storage
            .commit(WriteUnit::new().insert_record(record.clone()))
            .await
            .unwrap();

        let instance = DonorInstance::resume(f.ctx.clone(), record.clone(), CancellationToken::new());
        spawn(&instance).await.unwrap();
        instance.completion_signal().await.unwrap();

        // Source not dropped a second time; record gone.
        assert_eq!(
            f.storage.collection_uuid(&f.source.ns).await.unwrap(),
            Some(f.source.uuid)
        );
        assert!(f.storage.load_record(record.operation_id).await.unwrap().is_none());
    }

    #[test(tokio::test)]
    async fn test_resume_aborted_prefires_latch() {
        let f = fixture("myShardId").await;
        let mut record = DonorStateRecord::new(params(&f.source, &["recipient1"])).unwrap();
        record.phase = DonorPhase::Done;
        record.aborted = true;

        let instance = DonorInstance::resume(f.ctx.clone(), record, CancellationToken::new());
        assert!(instance.latches().aborting.is_fired());
    }

    #[test]
    fn test_outcome_into_result() {
        assert!(CompletionOutcome::Ok.into_result().is_ok());
        assert!(matches!(
            CompletionOutcome::Interrupted.into_result(),
            Err(Error::Interrupted)
        ));
        assert!(matches!(
            CompletionOutcome::Fatal("x".into()).into_result(),
            Err(Error::Fatal(_))
        ));
    }
}
