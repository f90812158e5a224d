//! The durable donor state record and its phase model.

use crate::error::{Result, ValidationError};
use crate::types::{CollectionUuid, Namespace, OperationId, ShardId, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Phase of a donor operation.
///
/// Phases are ordered; a record's phase only moves forward along this order,
/// and an abort jumps straight to [`DonorPhase::Done`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DonorPhase {
    /// Record created, nothing done yet.
    PreparingToDonate,
    /// Recipients are cloning the collection.
    DonatingInitialData,
    /// Recipients are tailing this donor's replication log from `minFetchBoundary`.
    DonatingLogEntries,
    /// Writes to the source collection are being blocked.
    BlockingWrites,
    /// Terminal. Committed or aborted.
    Done,
}

impl std::fmt::Display for DonorPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DonorPhase::PreparingToDonate => write!(f, "preparing_to_donate"),
            DonorPhase::DonatingInitialData => write!(f, "donating_initial_data"),
            DonorPhase::DonatingLogEntries => write!(f, "donating_log_entries"),
            DonorPhase::BlockingWrites => write!(f, "blocking_writes"),
            DonorPhase::Done => write!(f, "done"),
        }
    }
}

impl DonorPhase {
    /// Check if this is the terminal phase.
    pub fn is_terminal(&self) -> bool {
        matches!(self, DonorPhase::Done)
    }
}

/// The collection being repartitioned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceCollection {
    pub ns: Namespace,
    pub uuid: CollectionUuid,
}

impl SourceCollection {
    pub fn new(ns: Namespace, uuid: CollectionUuid) -> Self {
        Self { ns, uuid }
    }
}

/// New shard key definition. Carried through untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPattern(String);

impl KeyPattern {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self(pattern.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Intake payload for a new donor operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReshardingParams {
    pub operation_id: OperationId,
    pub source: SourceCollection,
    pub destination_ns: Namespace,
    pub key_pattern: KeyPattern,
    pub participants: Vec<ShardId>,
}

impl ReshardingParams {
    /// Build intake params with the conventional temporary destination
    /// namespace for `source`.
    pub fn new(
        operation_id: OperationId,
        source: SourceCollection,
        key_pattern: KeyPattern,
        participants: Vec<ShardId>,
    ) -> Self {
        let destination_ns = Namespace::temporary_resharding(source.ns.db(), source.uuid);
        Self {
            operation_id,
            source,
            destination_ns,
            key_pattern,
            participants,
        }
    }

    /// Override the destination namespace.
    pub fn with_destination_ns(mut self, ns: Namespace) -> Self {
        self.destination_ns = ns;
        self
    }
}

/// Persisted state of one donor operation.
///
/// Written only by the owning instance's transition units. The phase plus the
/// two boundary fields are the whole resumption state: a resumed instance
/// never re-runs a side effect whose result is already reflected here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DonorStateRecord {
    pub operation_id: OperationId,
    pub source: SourceCollection,
    pub destination_ns: Namespace,
    pub key_pattern: KeyPattern,
    pub participants: Vec<ShardId>,
    pub phase: DonorPhase,
    /// Position of the boundary marker; set on entering DonatingLogEntries.
    pub min_fetch_boundary: Option<Timestamp>,
    /// Position of the last final marker; set when writes start blocking.
    pub blocking_writes_boundary: Option<Timestamp>,
    pub aborted: bool,
}

impl DonorStateRecord {
    /// Build a fresh record from intake params, rejecting invalid
    /// participant sets.
    pub fn new(params: ReshardingParams) -> Result<Self> {
        validate_participants(&params.participants)?;
        Ok(Self {
            operation_id: params.operation_id,
            source: params.source,
            destination_ns: params.destination_ns,
            key_pattern: params.key_pattern,
            participants: params.participants,
            phase: DonorPhase::PreparingToDonate,
            min_fetch_boundary: None,
            blocking_writes_boundary: None,
            aborted: false,
        })
    }

    /// Uuid the destination collection is created with. Recipients create the
    /// temporary collection under the operation id, so after a rename the
    /// source namespace carries it.
    pub fn destination_uuid(&self) -> CollectionUuid {
        self.operation_id
    }

    /// Whether `shard` also receives data in this operation.
    pub fn is_participant(&self, shard: &ShardId) -> bool {
        self.participants.iter().any(|p| p == shard)
    }

    /// Whether the final markers have been written.
    pub fn writes_blocked(&self) -> bool {
        self.blocking_writes_boundary.is_some()
    }

    /// Copy of this record advanced to `phase`.
    pub(crate) fn with_phase(&self, phase: DonorPhase) -> Self {
        Self {
            phase,
            ..self.clone()
        }
    }
}

/// Reject empty participant sets and repeated participants.
pub fn validate_participants(participants: &[ShardId]) -> Result<()> {
    if participants.is_empty() {
        return Err(ValidationError::EmptyParticipantSet.into());
    }
    let mut seen = HashSet::with_capacity(participants.len());
    for p in participants {
        if !seen.insert(p) {
            return Err(ValidationError::DuplicateParticipant(p.clone()).into());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use uuid::Uuid;

    fn params(participants: &[&str]) -> ReshardingParams {
        ReshardingParams::new(
            Uuid::new_v4(),
            SourceCollection::new(Namespace::new("sourcedb", "sourcecollection"), Uuid::new_v4()),
            KeyPattern::new("{newKey: 1}"),
            participants.iter().map(|p| ShardId::new(*p)).collect(),
        )
    }

    #[test]
    fn test_phase_order() {
        assert!(DonorPhase::PreparingToDonate < DonorPhase::DonatingInitialData);
        assert!(DonorPhase::DonatingInitialData < DonorPhase::DonatingLogEntries);
        assert!(DonorPhase::DonatingLogEntries < DonorPhase::BlockingWrites);
        assert!(DonorPhase::BlockingWrites < DonorPhase::Done);
        assert!(DonorPhase::Done.is_terminal());
        assert!(!DonorPhase::BlockingWrites.is_terminal());
    }

    #[test]
    fn test_new_record() {
        let p = params(&["recipient1", "recipient2"]);
        let source_uuid = p.source.uuid;
        let record = DonorStateRecord::new(p).unwrap();

        assert_eq!(record.phase, DonorPhase::PreparingToDonate);
        assert!(!record.aborted);
        assert!(record.min_fetch_boundary.is_none());
        assert!(!record.writes_blocked());
        assert_eq!(
            record.destination_ns,
            Namespace::temporary_resharding("sourcedb", source_uuid)
        );
        assert!(record.is_participant(&ShardId::new("recipient2")));
        assert!(!record.is_participant(&ShardId::new("myShardId")));
    }

    #[test]
    fn test_duplicate_participant_rejected() {
        let err = DonorStateRecord::new(params(&["r1", "r2", "r1"])).unwrap_err();
        assert!(matches!(
            err,
            Error::Validation(ValidationError::DuplicateParticipant(ref s)) if s.as_str() == "r1"
        ));
    }

    #[test]
    fn test_empty_participants_rejected() {
        let err = DonorStateRecord::new(params(&[])).unwrap_err();
        assert!(matches!(
            err,
            Error::Validation(ValidationError::EmptyParticipantSet)
        ));
    }

    #[test]
    fn test_record_bincode() {
        let mut record = DonorStateRecord::new(params(&["r1"])).unwrap();
        record.phase = DonorPhase::BlockingWrites;
        record.min_fetch_boundary = Some(7);

        let bytes = bincode::serialize(&record).unwrap();
        let decoded: DonorStateRecord = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, record);
    }
}
