//! File-backed storage.
//!
//! The whole catalog is kept in memory and mirrored to a single snapshot
//! file. A commit stages the new catalog, writes it to disk, and only then
//! swaps it in, so a crash at any point leaves either the old or the new
//! catalog on disk.

use super::catalog::CatalogState;
use super::oplog::OplogEntry;
use super::{snapshot, DonorStorage, WriteUnit};
use crate::donor::DonorStateRecord;
use crate::error::{Result, StorageError};
use crate::types::{CollectionUuid, Namespace, OperationId, Timestamp};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

const SNAPSHOT_FILE: &str = "donor_state.snap";

/// File-based storage.
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    state: Mutex<CatalogState>,
}

impl FileStorage {
    /// Open storage in `dir`, loading and verifying any existing snapshot.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).await.map_err(StorageError::Io)?;
        let path = dir.join(SNAPSHOT_FILE);

        let state = match fs::read(&path).await {
            Ok(data) => snapshot::decode(&data)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => CatalogState::new(),
            Err(e) => return Err(StorageError::Io(e).into()),
        };

        tracing::info!(
            path = %path.display(),
            records = state.records.len(),
            oplog_entries = state.oplog.len(),
            "opened donor storage"
        );

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    /// Path of the snapshot file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn atomic_write(&self, content: &[u8]) -> Result<()> {
        let temp_path = self.path.with_extension("tmp");

        let mut file = fs::File::create(&temp_path).await.map_err(StorageError::Io)?;
        file.write_all(content).await.map_err(StorageError::Io)?;
        file.sync_all().await.map_err(StorageError::Io)?;

        fs::rename(&temp_path, &self.path)
            .await
            .map_err(StorageError::Io)?;
        Ok(())
    }
}

#[async_trait]
impl DonorStorage for FileStorage {
    async fn reserve_op_time(&self) -> Result<Timestamp> {
        Ok(self.state.lock().await.reserve_op_time())
    }

    async fn commit(&self, unit: WriteUnit) -> Result<()> {
        let mut state = self.state.lock().await;
        let staged = state.staged(&unit)?;

        // Persist to disk first, then publish in memory.
        self.atomic_write(&snapshot::encode(&staged)?).await?;
        *state = staged;

        tracing::debug!(ops = unit.ops().len(), path = %self.path.display(), "committed write unit");
        Ok(())
    }

    async fn load_record(&self, id: OperationId) -> Result<Option<DonorStateRecord>> {
        Ok(self.state.lock().await.records.get(&id).cloned())
    }

    async fn scan_records(&self) -> Result<Vec<DonorStateRecord>> {
        Ok(self.state.lock().await.records.values().cloned().collect())
    }

    async fn collection_uuid(&self, ns: &Namespace) -> Result<Option<CollectionUuid>> {
        Ok(self.state.lock().await.collections.get(ns).copied())
    }

    async fn oplog(&self) -> Result<Vec<OplogEntry>> {
        Ok(self.state.lock().await.oplog.clone())
    }

    async fn create_collection(&self, ns: &Namespace, uuid: CollectionUuid) -> Result<()> {
        let mut state = self.state.lock().await;
        let mut staged = state.clone();
        staged.collections.insert(ns.clone(), uuid);
        self.atomic_write(&snapshot::encode(&staged)?).await?;
        *state = staged;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::donor::{DonorPhase, KeyPattern, ReshardingParams, SourceCollection};
    use crate::error::Error;
    use crate::types::ShardId;
    use tempfile::TempDir;
    use test_log::test;
    use uuid::Uuid;

    fn record() -> DonorStateRecord {
        DonorStateRecord::new(ReshardingParams::new(
            Uuid::new_v4(),
            SourceCollection::new(Namespace::new("db", "coll"), Uuid::new_v4()),
            KeyPattern::new("{x: 1}"),
            vec![ShardId::new("r1"), ShardId::new("r2")],
        ))
        .unwrap()
    }

    #[test(tokio::test)]
    async fn test_state_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let mut r = record();
        let source = r.source.clone();

        {
            let storage = FileStorage::open(dir.path()).await.unwrap();
            storage.create_collection(&source.ns, source.uuid).await.unwrap();
            storage
                .commit(WriteUnit::new().insert_record(r.clone()))
                .await
                .unwrap();

            let ts = storage.reserve_op_time().await.unwrap();
            r.phase = DonorPhase::DonatingLogEntries;
            r.min_fetch_boundary = Some(ts);
            storage
                .commit(
                    WriteUnit::new()
                        .append_oplog(OplogEntry::boundary_marker(ts, &r))
                        .update_record(r.clone()),
                )
                .await
                .unwrap();
        }

        let storage = FileStorage::open(dir.path()).await.unwrap();
        assert_eq!(storage.load_record(r.operation_id).await.unwrap(), Some(r.clone()));
        assert_eq!(
            storage.collection_uuid(&source.ns).await.unwrap(),
            Some(source.uuid)
        );
        let oplog = storage.oplog().await.unwrap();
        assert_eq!(oplog.len(), 1);
        assert!(oplog[0].is_boundary_marker());

        // Positions keep increasing across reopen.
        let next = storage.reserve_op_time().await.unwrap();
        assert!(next > r.min_fetch_boundary.unwrap());
    }

    #[test(tokio::test)]
    async fn test_failed_unit_not_persisted() {
        let dir = TempDir::new().unwrap();
        let r = record();
        {
            let storage = FileStorage::open(dir.path()).await.unwrap();
            storage
                .commit(WriteUnit::new().insert_record(r.clone()))
                .await
                .unwrap();
            let unit = WriteUnit::new()
                .delete_record(r.operation_id)
                .drop_collection(Namespace::new("db", "missing"), Uuid::new_v4());
            assert!(storage.commit(unit).await.is_err());
        }

        let storage = FileStorage::open(dir.path()).await.unwrap();
        assert!(storage.load_record(r.operation_id).await.unwrap().is_some());
    }

    #[test(tokio::test)]
    async fn test_corrupted_snapshot_rejected() {
        let dir = TempDir::new().unwrap();
        let path = {
            let storage = FileStorage::open(dir.path()).await.unwrap();
            storage
                .commit(WriteUnit::new().insert_record(record()))
                .await
                .unwrap();
            storage.path().to_path_buf()
        };

        let mut data = std::fs::read(&path).unwrap();
        let mid = data.len() / 2;
        data[mid] ^= 0xff;
        std::fs::write(&path, data).unwrap();

        let err = FileStorage::open(dir.path()).await.unwrap_err();
        assert!(matches!(err, Error::Storage(StorageError::Corrupted(_))));
    }
}
