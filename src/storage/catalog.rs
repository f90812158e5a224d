//! In-memory catalog state and the atomic application of write units.

use super::oplog::OplogEntry;
use super::{StorageOp, WriteUnit};
use crate::donor::DonorStateRecord;
use crate::error::{Result, StorageError, ValidationError};
use crate::types::{CollectionUuid, Namespace, OperationId, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Everything a donor node keeps durably: state records, the local
/// collection catalog, and the replication log.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogState {
    pub records: BTreeMap<OperationId, DonorStateRecord>,
    pub collections: BTreeMap<Namespace, CollectionUuid>,
    pub oplog: Vec<OplogEntry>,
    pub next_op_time: Timestamp,
}

impl CatalogState {
    pub fn new() -> Self {
        Self {
            next_op_time: 1,
            ..Default::default()
        }
    }

    pub fn reserve_op_time(&mut self) -> Timestamp {
        let ts = self.next_op_time;
        self.next_op_time += 1;
        ts
    }

    /// Apply every op of `unit` to a copy of this state and return it.
    /// `self` is untouched on error.
    pub fn staged(&self, unit: &WriteUnit) -> Result<Self> {
        let mut staged = self.clone();
        for op in unit.ops() {
            staged.apply(op)?;
        }
        Ok(staged)
    }

    fn apply(&mut self, op: &StorageOp) -> Result<()> {
        match op {
            StorageOp::InsertRecord(record) => {
                if self.records.contains_key(&record.operation_id) {
                    return Err(ValidationError::DuplicateOperation(record.operation_id).into());
                }
                self.records.insert(record.operation_id, record.clone());
            }
            StorageOp::UpdateRecord(record) => match self.records.get_mut(&record.operation_id) {
                Some(existing) => *existing = record.clone(),
                None => return Err(StorageError::RecordNotFound(record.operation_id).into()),
            },
            StorageOp::DeleteRecord(id) => {
                self.records.remove(id);
            }
            StorageOp::AppendOplog(entry) => {
                if entry.ts >= self.next_op_time {
                    self.next_op_time = entry.ts + 1;
                }
                self.oplog.push(entry.clone());
            }
            StorageOp::DropCollection { ns, uuid } => {
                self.expect_collection(ns, *uuid)?;
                self.collections.remove(ns);
            }
            StorageOp::RenameCollection { from, to, uuid } => {
                self.expect_collection(from, *uuid)?;
                self.collections.remove(from);
                self.collections.insert(to.clone(), *uuid);
            }
        }
        Ok(())
    }

    fn expect_collection(&self, ns: &Namespace, expected: CollectionUuid) -> Result<()> {
        match self.collections.get(ns) {
            None => Err(StorageError::NamespaceNotFound(ns.clone()).into()),
            Some(actual) if *actual != expected => Err(StorageError::UuidMismatch {
                ns: ns.clone(),
                expected,
                actual: *actual,
            }
            .into()),
            Some(_) => Ok(()),
        }
    }
}
