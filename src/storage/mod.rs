//! Durable storage for donor state.
//!
//! A donor node keeps three things durably: its [`DonorStateRecord`]s, the
//! local collection catalog, and the replication log. Every change a
//! transition makes goes through one [`WriteUnit`], which a [`DonorStorage`]
//! commits atomically: either every op in the unit is applied, or none is.
//! This is what makes "side effect plus phase persist" a single step.
//!
//! # Implementations
//!
//! - [`InMemoryStorage`]: copy-then-swap over an in-memory catalog. Supports
//!   injecting transient commit failures for retry tests.
//! - [`FileStorage`]: the same catalog, persisted as a checksummed snapshot
//!   that is rewritten atomically (temp file, fsync, rename) before each
//!   commit becomes visible.

mod catalog;
mod file;
mod locks;
mod memory;
mod oplog;
pub mod snapshot;

pub use catalog::CatalogState;
pub use file::FileStorage;
pub use locks::{NamespaceGuard, NamespaceLocks};
pub use memory::InMemoryStorage;
pub use oplog::{MarkerPayload, OplogEntry, OplogOp};

use crate::donor::DonorStateRecord;
use crate::error::Result;
use crate::types::{CollectionUuid, Namespace, OperationId, Timestamp};
use async_trait::async_trait;

/// One change inside a [`WriteUnit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageOp {
    /// Insert a new record. Fails with `DuplicateOperation` if one exists.
    InsertRecord(DonorStateRecord),
    /// Replace an existing record.
    UpdateRecord(DonorStateRecord),
    /// Delete a record. Absent records are ignored.
    DeleteRecord(OperationId),
    /// Append a replication-log entry.
    AppendOplog(OplogEntry),
    /// Drop the collection at `ns`, which must hold `uuid`.
    DropCollection { ns: Namespace, uuid: CollectionUuid },
    /// Move the collection at `from`, which must hold `uuid`, to `to`,
    /// replacing whatever `to` held.
    RenameCollection {
        from: Namespace,
        to: Namespace,
        uuid: CollectionUuid,
    },
}

/// An ordered batch of ops committed atomically.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteUnit {
    ops: Vec<StorageOp>,
}

impl WriteUnit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(mut self, op: StorageOp) -> Self {
        self.ops.push(op);
        self
    }

    pub fn insert_record(self, record: DonorStateRecord) -> Self {
        self.push(StorageOp::InsertRecord(record))
    }

    pub fn update_record(self, record: DonorStateRecord) -> Self {
        self.push(StorageOp::UpdateRecord(record))
    }

    pub fn delete_record(self, id: OperationId) -> Self {
        self.push(StorageOp::DeleteRecord(id))
    }

    pub fn append_oplog(self, entry: OplogEntry) -> Self {
        self.push(StorageOp::AppendOplog(entry))
    }

    pub fn drop_collection(self, ns: Namespace, uuid: CollectionUuid) -> Self {
        self.push(StorageOp::DropCollection { ns, uuid })
    }

    pub fn rename_collection(self, from: Namespace, to: Namespace, uuid: CollectionUuid) -> Self {
        self.push(StorageOp::RenameCollection { from, to, uuid })
    }

    pub fn ops(&self) -> &[StorageOp] {
        &self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Durable substrate for donor records, the local catalog, and the
/// replication log.
#[async_trait]
pub trait DonorStorage: Send + Sync + std::fmt::Debug {
    /// Reserve the next replication-log position.
    async fn reserve_op_time(&self) -> Result<Timestamp>;

    /// Apply every op in `unit` atomically.
    async fn commit(&self, unit: WriteUnit) -> Result<()>;

    /// Load one record.
    async fn load_record(&self, id: OperationId) -> Result<Option<DonorStateRecord>>;

    /// Load all records.
    async fn scan_records(&self) -> Result<Vec<DonorStateRecord>>;

    /// Uuid of the collection at `ns`, if any.
    async fn collection_uuid(&self, ns: &Namespace) -> Result<Option<CollectionUuid>>;

    /// The full replication log, oldest first.
    async fn oplog(&self) -> Result<Vec<OplogEntry>>;

    /// Create (or replace) a collection at `ns`.
    async fn create_collection(&self, ns: &Namespace, uuid: CollectionUuid) -> Result<()>;
}
