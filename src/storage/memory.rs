//! In-memory storage.

use super::catalog::CatalogState;
use super::oplog::OplogEntry;
use super::{DonorStorage, WriteUnit};
use crate::donor::DonorStateRecord;
use crate::error::{Result, StorageError};
use crate::types::{CollectionUuid, Namespace, OperationId, Timestamp};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// In-memory storage (for testing and single-process use).
#[derive(Debug)]
pub struct InMemoryStorage {
    state: Mutex<CatalogState>,
    fail_next_commits: AtomicU64,
    commits: AtomicU64,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CatalogState::new()),
            fail_next_commits: AtomicU64::new(0),
            commits: AtomicU64::new(0),
        }
    }

    /// Make the next `n` commits fail with a transient error before applying
    /// anything.
    pub fn fail_next_commits(&self, n: u64) {
        self.fail_next_commits.store(n, Ordering::SeqCst);
    }

    /// Number of successfully applied units.
    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::SeqCst)
    }

    /// Copy of the whole catalog.
    pub fn state(&self) -> CatalogState {
        self.state.lock().clone()
    }

    fn take_injected_failure(&self) -> bool {
        self.fail_next_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DonorStorage for InMemoryStorage {
    async fn reserve_op_time(&self) -> Result<Timestamp> {
        Ok(self.state.lock().reserve_op_time())
    }

    async fn commit(&self, unit: WriteUnit) -> Result<()> {
        if self.take_injected_failure() {
            return Err(StorageError::Transient("injected write conflict".to_string()).into());
        }
        let mut state = self.state.lock();
        let staged = state.staged(&unit)?;
        *state = staged;
        self.commits.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(ops = unit.ops().len(), "committed write unit");
        Ok(())
    }

    async fn load_record(&self, id: OperationId) -> Result<Option<DonorStateRecord>> {
        Ok(self.state.lock().records.get(&id).cloned())
    }

    async fn scan_records(&self) -> Result<Vec<DonorStateRecord>> {
        Ok(self.state.lock().records.values().cloned().collect())
    }

    async fn collection_uuid(&self, ns: &Namespace) -> Result<Option<CollectionUuid>> {
        Ok(self.state.lock().collections.get(ns).copied())
    }

    async fn oplog(&self) -> Result<Vec<OplogEntry>> {
        Ok(self.state.lock().oplog.clone())
    }

    async fn create_collection(&self, ns: &Namespace, uuid: CollectionUuid) -> Result<()> {
        self.state.lock().collections.insert(ns.clone(), uuid);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::donor::{KeyPattern, ReshardingParams, SourceCollection};
    use crate::error::{Error, ValidationError};
    use crate::types::ShardId;
    use test_log::test;
    use uuid::Uuid;

    fn record() -> DonorStateRecord {
        DonorStateRecord::new(ReshardingParams::new(
            Uuid::new_v4(),
            SourceCollection::new(Namespace::new("db", "coll"), Uuid::new_v4()),
            KeyPattern::new("{x: 1}"),
            vec![ShardId::new("r1")],
        ))
        .unwrap()
    }

    #[test(tokio::test)]
    async fn test_insert_load_delete() {
        let storage = InMemoryStorage::new();
        let r = record();

        storage
            .commit(WriteUnit::new().insert_record(r.clone()))
            .await
            .unwrap();
        assert_eq!(storage.load_record(r.operation_id).await.unwrap(), Some(r.clone()));
        assert_eq!(storage.scan_records().await.unwrap().len(), 1);

        storage
            .commit(WriteUnit::new().delete_record(r.operation_id))
            .await
            .unwrap();
        assert!(storage.load_record(r.operation_id).await.unwrap().is_none());
    }

    #[test(tokio::test)]
    async fn test_duplicate_insert() {
        let storage = InMemoryStorage::new();
        let r = record();
        storage
            .commit(WriteUnit::new().insert_record(r.clone()))
            .await
            .unwrap();

        let err = storage
            .commit(WriteUnit::new().insert_record(r.clone()))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Validation(ValidationError::DuplicateOperation(id)) if id == r.operation_id
        ));
        assert_eq!(storage.commit_count(), 1);
    }

    #[test(tokio::test)]
    async fn test_injected_failures() {
        let storage = InMemoryStorage::new();
        storage.fail_next_commits(2);

        for _ in 0..2 {
            let err = storage
                .commit(WriteUnit::new().insert_record(record()))
                .await
                .unwrap_err();
            assert!(err.is_transient());
        }
        storage
            .commit(WriteUnit::new().insert_record(record()))
            .await
            .unwrap();
        assert_eq!(storage.scan_records().await.unwrap().len(), 1);
    }

    #[test(tokio::test)]
    async fn test_op_times_are_monotonic() {
        let storage = InMemoryStorage::new();
        let a = storage.reserve_op_time().await.unwrap();
        let b = storage.reserve_op_time().await.unwrap();
        assert!(b > a);
    }
}
