//! Replication-log entries produced by donor transitions.

use crate::donor::DonorStateRecord;
use crate::types::{CollectionUuid, Namespace, OperationId, ShardId, Timestamp};
use serde::{Deserialize, Serialize};

/// Kind of replication-log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OplogOp {
    /// Carries no data change; exists to mark a position in the log.
    Noop,
}

/// Structured payload that log shipping routes on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarkerPayload {
    /// Last entry a recipient needs to apply for this operation.
    ReshardFinalOp { operation_id: OperationId },
}

/// One replication-log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OplogEntry {
    pub ts: Timestamp,
    pub op: OplogOp,
    pub ns: Namespace,
    pub uuid: Option<CollectionUuid>,
    pub destined_recipient: Option<ShardId>,
    pub msg: String,
    pub object2: Option<MarkerPayload>,
}

impl OplogEntry {
    /// Marker written on entering DonatingLogEntries. Its position becomes
    /// the record's `min_fetch_boundary`.
    pub fn boundary_marker(ts: Timestamp, record: &DonorStateRecord) -> Self {
        Self {
            ts,
            op: OplogOp::Noop,
            ns: Namespace::force_batch_boundary(),
            uuid: None,
            destined_recipient: None,
            msg: format!(
                "Created temporary resharding collection {}",
                record.destination_ns
            ),
            object2: None,
        }
    }

    /// Marker telling `recipient` that writes to the source collection are
    /// now blocked.
    pub fn final_marker(ts: Timestamp, record: &DonorStateRecord, recipient: &ShardId) -> Self {
        Self {
            ts,
            op: OplogOp::Noop,
            ns: record.source.ns.clone(),
            uuid: Some(record.source.uuid),
            destined_recipient: Some(recipient.clone()),
            msg: format!(
                "Writes to {} are temporarily blocked for resharding.",
                record.source.ns
            ),
            object2: Some(MarkerPayload::ReshardFinalOp {
                operation_id: record.operation_id,
            }),
        }
    }

    /// Whether this is a final marker for `operation_id`.
    pub fn is_final_marker_for(&self, operation_id: OperationId) -> bool {
        matches!(
            self.object2,
            Some(MarkerPayload::ReshardFinalOp { operation_id: id }) if id == operation_id
        )
    }

    /// Whether this is a boundary marker.
    pub fn is_boundary_marker(&self) -> bool {
        self.ns == Namespace::force_batch_boundary() && self.object2.is_none()
    }
}
