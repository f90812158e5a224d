//! Process-wide table of donor instances and the leadership lifecycle.
//!
//! Only a primary runs donor instances. [`DonorRegistry::on_become_primary`]
//! rebuilds an instance for every persisted record;
//! [`DonorRegistry::on_step_down`] trips the shared leadership token, which
//! every instance observes at its next suspension point, and discards all
//! instances. Persisted records are left exactly as the last committed unit
//! wrote them.

use super::instance::{DonorContext, DonorInstance};
use super::record::ReshardingParams;
use super::signal::{self, CoordinatorState};
use crate::error::{Error, Result, ValidationError};
use crate::retry::retry_transient;
use crate::types::OperationId;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Registry of active donor instances on this node.
#[derive(Debug)]
pub struct DonorRegistry {
    ctx: Arc<DonorContext>,
    instances: Arc<DashMap<OperationId, Arc<DonorInstance>>>,
    /// Present while primary. Shared by every instance started this term.
    leadership: RwLock<Option<CancellationToken>>,
    term: AtomicU64,
    /// Run tasks, awaited on step-up so an interrupted instance's last unit
    /// finishes before its record is read again.
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Serializes intake so two creates for one id cannot interleave.
    intake: tokio::sync::Mutex<()>,
}

impl DonorRegistry {
    /// Create a registry. Not primary until [`Self::on_become_primary`].
    pub fn new(ctx: DonorContext) -> Result<Self> {
        ctx.config.validate()?;
        Ok(Self {
            ctx: Arc::new(ctx),
            instances: Arc::new(DashMap::new()),
            leadership: RwLock::new(None),
            term: AtomicU64::new(0),
            tasks: Mutex::new(Vec::new()),
            intake: tokio::sync::Mutex::new(()),
        })
    }

    pub fn context(&self) -> &Arc<DonorContext> {
        &self.ctx
    }

    pub fn is_primary(&self) -> bool {
        self.leadership.read().is_some()
    }

    /// Number of step-ups so far.
    pub fn term(&self) -> u64 {
        self.term.load(Ordering::SeqCst)
    }

    pub fn active_count(&self) -> usize {
        self.instances.len()
    }

    pub fn active_operations(&self) -> Vec<OperationId> {
        self.instances.iter().map(|e| *e.key()).collect()
    }

    pub fn lookup(&self, operation_id: OperationId) -> Option<Arc<DonorInstance>> {
        self.instances.get(&operation_id).map(|e| e.value().clone())
    }

    fn leadership_token(&self) -> Result<CancellationToken> {
        self.leadership.read().clone().ok_or(Error::NotPrimary)
    }

    /// Become primary: resume an instance for every persisted record.
    /// Returns the number of instances resumed.
    #[tracing::instrument(skip(self), fields(term = self.term() + 1))]
    pub async fn on_become_primary(&self) -> Result<usize> {
        if self.is_primary() {
            tracing::warn!("step up while already primary, restarting instances");
            self.on_step_down();
        }

        let previous: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        for handle in previous {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "previous donor task ended abnormally");
            }
        }

        let token = CancellationToken::new();
        *self.leadership.write() = Some(token.clone());
        let term = self.term.fetch_add(1, Ordering::SeqCst) + 1;

        let records = retry_transient(
            &self.ctx.config.storage_retry,
            &self.ctx.metrics,
            "scan records",
            || self.ctx.storage.scan_records(),
        )
        .await?;

        let _intake = self.intake.lock().await;
        let mut resumed = 0;
        for record in records {
            if self.instances.contains_key(&record.operation_id) {
                continue;
            }
            let instance = DonorInstance::resume(self.ctx.clone(), record, token.clone());
            self.ctx.metrics.record_resumed();
            self.start(instance);
            resumed += 1;
        }

        tracing::info!(term, resumed, "became primary");
        Ok(resumed)
    }

    /// Stop being primary: interrupt and discard every instance.
    #[tracing::instrument(skip(self), fields(term = self.term()))]
    pub fn on_step_down(&self) {
        let token = self.leadership.write().take();
        match token {
            Some(token) => token.cancel(),
            None => {
                tracing::debug!("step down while not primary");
                return;
            }
        }
        let discarded = self.instances.len();
        self.instances.clear();
        tracing::warn!(discarded, "stepped down, donor instances interrupted");
    }

    /// Intake a new operation. Fails with `DuplicateOperation` if the id is
    /// already registered or persisted.
    #[tracing::instrument(skip(self, params), fields(operation_id = %params.operation_id))]
    pub async fn create(&self, params: ReshardingParams) -> Result<Arc<DonorInstance>> {
        let token = self.leadership_token()?;
        let _intake = self.intake.lock().await;

        if self.instances.contains_key(&params.operation_id) {
            return Err(ValidationError::DuplicateOperation(params.operation_id).into());
        }
        let instance = DonorInstance::create(self.ctx.clone(), params, token).await?;
        self.ctx.metrics.record_started();
        self.start(instance.clone());
        Ok(instance)
    }

    /// Return the registered instance for `params.operation_id`, or resume
    /// it from a persisted record, or create it. `params` is ignored when an
    /// instance or record already exists.
    #[tracing::instrument(skip(self, params), fields(operation_id = %params.operation_id))]
    pub async fn get_or_create(&self, params: ReshardingParams) -> Result<Arc<DonorInstance>> {
        let token = self.leadership_token()?;
        let _intake = self.intake.lock().await;

        if let Some(existing) = self.lookup(params.operation_id) {
            return Ok(existing);
        }

        let persisted = retry_transient(
            &self.ctx.config.storage_retry,
            &self.ctx.metrics,
            "load record",
            || self.ctx.storage.load_record(params.operation_id),
        )
        .await?;

        let instance = match persisted {
            Some(record) => {
                let instance = DonorInstance::resume(self.ctx.clone(), record, token);
                self.ctx.metrics.record_resumed();
                instance
            }
            None => {
                let instance = DonorInstance::create(self.ctx.clone(), params, token).await?;
                self.ctx.metrics.record_started();
                instance
            }
        };
        self.start(instance.clone());
        Ok(instance)
    }

    /// Route a coordinator state change to the operation's instance.
    ///
    /// `Committing`, `Aborting` and `Done` for an operation with neither a
    /// live instance nor a persisted record are redeliveries after the donor
    /// finished, and are ignored. Any other state for an unregistered
    /// operation fails with `UnknownOperation`.
    #[tracing::instrument(skip(self), fields(state = %state))]
    pub async fn on_coordinator_state_change(
        &self,
        operation_id: OperationId,
        state: CoordinatorState,
    ) -> Result<()> {
        if let Some(instance) = self.lookup(operation_id) {
            signal::deliver(&instance, state)?;
            return Ok(());
        }

        let finishing = matches!(
            state,
            CoordinatorState::Committing | CoordinatorState::Aborting | CoordinatorState::Done
        );
        if finishing {
            let persisted = retry_transient(
                &self.ctx.config.storage_retry,
                &self.ctx.metrics,
                "load record",
                || self.ctx.storage.load_record(operation_id),
            )
            .await?;
            if persisted.is_none() {
                tracing::debug!(%operation_id, "donor already finished, ignoring coordinator state");
                return Ok(());
            }
        }
        Err(ValidationError::UnknownOperation(operation_id).into())
    }

    /// Wait for the registered operation to finish.
    pub async fn await_completion(&self, operation_id: OperationId) -> Result<()> {
        let instance = self
            .lookup(operation_id)
            .ok_or(ValidationError::UnknownOperation(operation_id))?;
        instance.completion_signal().await
    }

    /// Register `instance` and spawn its run task. The task deregisters the
    /// instance when it finishes, unless it was already replaced.
    fn start(&self, instance: Arc<DonorInstance>) {
        let operation_id = instance.operation_id();
        self.instances.insert(operation_id, instance.clone());

        let instances = self.instances.clone();
        let handle = tokio::spawn(async move {
            instance.run().await;
            instances.remove_if(&operation_id, |_, current| Arc::ptr_eq(current, &instance));
        });

        let mut tasks = self.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
    }
}

impl Drop for DonorRegistry {
    fn drop(&mut self) {
        if let Some(token) = self.leadership.get_mut().take() {
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DonorServiceConfig, RetryConfig};
    use crate::donor::{DonorPhase, DonorStateRecord, KeyPattern, NoOpExternalState, SourceCollection};
    use crate::storage::{DonorStorage, InMemoryStorage, OplogEntry, WriteUnit};
    use crate::types::{Namespace, ShardId};
    use test_log::test;
    use uuid::Uuid;

    fn registry() -> (DonorRegistry, Arc<InMemoryStorage>) {
        let storage = Arc::new(InMemoryStorage::new());
        let config = DonorServiceConfig::new().with_storage_retry(RetryConfig::immediate(3));
        let ctx = DonorContext::new(
            config,
            storage.clone(),
            Arc::new(NoOpExternalState::new(ShardId::new("myShardId"))),
        );
        (DonorRegistry::new(ctx).unwrap(), storage)
    }

    fn params(participants: &[&str]) -> ReshardingParams {
        ReshardingParams::new(
            Uuid::new_v4(),
            SourceCollection::new(Namespace::new("sourcedb", "sourcecollection"), Uuid::new_v4()),
            KeyPattern::new("{newKey: 1}"),
            participants.iter().map(|p| ShardId::new(*p)).collect(),
        )
    }

    #[test(tokio::test)]
    async fn test_not_primary() {
        let (registry, _) = registry();
        assert!(!registry.is_primary());
        let err = registry.create(params(&["r1"])).await.unwrap_err();
        assert!(matches!(err, Error::NotPrimary));
        let err = registry.get_or_create(params(&["r1"])).await.unwrap_err();
        assert!(matches!(err, Error::NotPrimary));
    }

    #[test(tokio::test)]
    async fn test_invalid_config_rejected() {
        let ctx = DonorContext::new(
            DonorServiceConfig::new().with_max_concurrent_steps(0),
            Arc::new(InMemoryStorage::new()),
            Arc::new(NoOpExternalState::new(ShardId::new("myShardId"))),
        );
        assert!(matches!(DonorRegistry::new(ctx), Err(Error::Config(_))));
    }

    #[test(tokio::test)]
    async fn test_get_or_create_returns_existing() {
        let (registry, _) = registry();
        registry.on_become_primary().await.unwrap();

        let p = params(&["r1", "r2"]);
        let first = registry.get_or_create(p.clone()).await.unwrap();

        // Different payload, same id: the existing instance wins.
        let mut other = params(&["r3"]);
        other.operation_id = p.operation_id;
        let second = registry.get_or_create(other).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.record().participants.len(), 2);
        assert_eq!(registry.active_count(), 1);
    }

    #[test(tokio::test)]
    async fn test_get_or_create_resumes_persisted_record() {
        let (registry, storage) = registry();
        registry.on_become_primary().await.unwrap();

        // A previous primary got as far as blocking writes.
        let p = params(&["r1", "r2"]);
        let id = p.operation_id;
        storage
            .create_collection(&p.source.ns, p.source.uuid)
            .await
            .unwrap();
        let mut record = DonorStateRecord::new(p.clone())
            .unwrap()
            .with_phase(DonorPhase::BlockingWrites);
        let boundary = storage.reserve_op_time().await.unwrap();
        record.min_fetch_boundary = Some(boundary);
        let mut unit = WriteUnit::new().append_oplog(OplogEntry::boundary_marker(boundary, &record));
        for recipient in &record.participants {
            let ts = storage.reserve_op_time().await.unwrap();
            unit = unit.append_oplog(OplogEntry::final_marker(ts, &record, recipient));
        }
        record.blocking_writes_boundary = Some(storage.reserve_op_time().await.unwrap());
        storage.commit(unit.insert_record(record)).await.unwrap();

        // Different payload, same id: the persisted record wins.
        let mut other = params(&["r3"]);
        other.operation_id = id;
        let instance = registry.get_or_create(other).await.unwrap();
        assert_eq!(instance.phase(), DonorPhase::BlockingWrites);
        assert!(instance.record().writes_blocked());
        assert_eq!(instance.record().participants, p.participants);

        registry
            .on_coordinator_state_change(id, CoordinatorState::Committing)
            .await
            .unwrap();
        instance.completion_signal().await.unwrap();

        let oplog = storage.oplog().await.unwrap();
        assert_eq!(oplog.iter().filter(|e| e.is_final_marker_for(id)).count(), 2);
        assert_eq!(oplog.iter().filter(|e| e.is_boundary_marker()).count(), 1);
        assert_eq!(storage.collection_uuid(&p.source.ns).await.unwrap(), None);
        assert!(storage.load_record(id).await.unwrap().is_none());

        let snapshot = registry.context().metrics.snapshot();
        assert_eq!(snapshot.resumed, 1);
        assert_eq!(snapshot.started, 0);
    }

    #[test(tokio::test)]
    async fn test_create_duplicate_fails() {
        let (registry, _) = registry();
        registry.on_become_primary().await.unwrap();

        let p = params(&["r1"]);
        registry.create(p.clone()).await.unwrap();
        let err = registry.create(p.clone()).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Validation(ValidationError::DuplicateOperation(id)) if id == p.operation_id
        ));
    }

    #[test(tokio::test)]
    async fn test_duplicate_participant_fails_intake() {
        let (registry, storage) = registry();
        registry.on_become_primary().await.unwrap();

        let err = registry.create(params(&["r1", "r2", "r1"])).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Validation(ValidationError::DuplicateParticipant(_))
        ));
        assert!(storage.scan_records().await.unwrap().is_empty());
        assert_eq!(registry.active_count(), 0);
    }

    #[test(tokio::test)]
    async fn test_step_down_interrupts_and_step_up_resumes() {
        let (registry, storage) = registry();
        registry.on_become_primary().await.unwrap();
        assert_eq!(registry.term(), 1);

        let a = registry.create(params(&["r1"])).await.unwrap();
        let b = registry.create(params(&["r2"])).await.unwrap();
        a.wait_for_phase(DonorPhase::DonatingLogEntries).await.unwrap();
        b.wait_for_phase(DonorPhase::DonatingLogEntries).await.unwrap();

        registry.on_step_down();
        assert!(!registry.is_primary());
        assert_eq!(registry.active_count(), 0);
        assert!(a.completion_signal().await.unwrap_err().is_interrupted());
        assert!(b.completion_signal().await.unwrap_err().is_interrupted());
        assert_eq!(storage.scan_records().await.unwrap().len(), 2);

        let resumed = registry.on_become_primary().await.unwrap();
        assert_eq!(resumed, 2);
        assert_eq!(registry.term(), 2);

        let a2 = registry.lookup(a.operation_id()).unwrap();
        assert_eq!(a2.phase(), DonorPhase::DonatingLogEntries);
        assert!(!Arc::ptr_eq(&a, &a2));
        assert_eq!(registry.context().metrics.snapshot().interrupted, 2);
    }

    #[test(tokio::test)]
    async fn test_completed_instance_deregisters() {
        let (registry, storage) = registry();
        registry.on_become_primary().await.unwrap();

        let instance = registry.create(params(&["r1"])).await.unwrap();
        let id = instance.operation_id();
        registry
            .on_coordinator_state_change(id, CoordinatorState::Aborting)
            .await
            .unwrap();
        registry.await_completion(id).await.unwrap();

        // Deregistration runs right after the completion signal.
        while registry.lookup(id).is_some() {
            tokio::task::yield_now().await;
        }
        assert!(storage.load_record(id).await.unwrap().is_none());
        assert_eq!(registry.context().metrics.snapshot().aborted, 1);
    }

    #[test(tokio::test)]
    async fn test_signal_for_unknown_operation() {
        let (registry, _) = registry();
        registry.on_become_primary().await.unwrap();
        let err = registry
            .on_coordinator_state_change(Uuid::new_v4(), CoordinatorState::Applying)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Validation(ValidationError::UnknownOperation(_))
        ));
    }

    #[test(tokio::test)]
    async fn test_redelivery_after_completion_is_noop() {
        let (registry, storage) = registry();
        registry.on_become_primary().await.unwrap();

        let instance = registry.create(params(&["r1"])).await.unwrap();
        let id = instance.operation_id();
        registry
            .on_coordinator_state_change(id, CoordinatorState::Aborting)
            .await
            .unwrap();
        instance.completion_signal().await.unwrap();
        while registry.lookup(id).is_some() {
            tokio::task::yield_now().await;
        }

        for state in [
            CoordinatorState::Aborting,
            CoordinatorState::Committing,
            CoordinatorState::Done,
        ] {
            registry.on_coordinator_state_change(id, state).await.unwrap();
        }
        assert!(storage.load_record(id).await.unwrap().is_none());
        assert_eq!(registry.context().metrics.snapshot().aborted, 1);

        // Progress states still need a live donor.
        let err = registry
            .on_coordinator_state_change(id, CoordinatorState::BlockingWrites)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Validation(ValidationError::UnknownOperation(_))
        ));
    }

    #[test(tokio::test)]
    async fn test_terminal_state_with_orphaned_record_is_unknown() {
        let (registry, storage) = registry();
        registry.on_become_primary().await.unwrap();

        // Persisted, but no instance registered on this node.
        let record = DonorStateRecord::new(params(&["r1"])).unwrap();
        let id = record.operation_id;
        storage
            .commit(WriteUnit::new().insert_record(record))
            .await
            .unwrap();

        let err = registry
            .on_coordinator_state_change(id, CoordinatorState::Aborting)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Validation(ValidationError::UnknownOperation(_))
        ));
    }
}
