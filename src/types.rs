//! Core types used throughout the resharding donor.

use crate::error::ValidationError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Globally unique identifier of one resharding operation.
pub type OperationId = Uuid;

/// Content identity of a collection. Survives renames.
pub type CollectionUuid = Uuid;

/// Position in the local replication log.
pub type Timestamp = u64;

/// Identifier of a shard taking part in a resharding operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardId(String);

impl ShardId {
    /// Create a new shard identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ShardId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Fully qualified collection name, `db.collection`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Namespace {
    db: String,
    coll: String,
}

impl Namespace {
    /// Create a namespace from its database and collection parts.
    pub fn new(db: impl Into<String>, coll: impl Into<String>) -> Self {
        Self {
            db: db.into(),
            coll: coll.into(),
        }
    }

    /// Namespace of the temporary collection that receives resharded data
    /// for the collection with the given uuid.
    pub fn temporary_resharding(db: &str, source_uuid: CollectionUuid) -> Self {
        Self::new(db, format!("system.resharding.{}", source_uuid))
    }

    /// Namespace that boundary-only replication log entries are written against.
    pub fn force_batch_boundary() -> Self {
        Self::new("config", "$forceOplogBatchBoundary")
    }

    /// Database part.
    pub fn db(&self) -> &str {
        &self.db
    }

    /// Collection part.
    pub fn coll(&self) -> &str {
        &self.coll
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.db, self.coll)
    }
}

impl FromStr for Namespace {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('.') {
            Some((db, coll)) if !db.is_empty() && !coll.is_empty() => Ok(Self::new(db, coll)),
            _ => Err(ValidationError::MalformedNamespace(s.to_string())),
        }
    }
}
