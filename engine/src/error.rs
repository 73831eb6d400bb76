//! Error types for the mushaf engine.

use crate::{ConflictKey, EntityType, LocalId, RemoteId};
use thiserror::Error;

/// All possible errors from the mushaf engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Adapter errors
    #[error("missing field '{field}' for {entity}")]
    MissingField { entity: EntityType, field: String },

    #[error("invalid value for field '{field}': {reason}")]
    InvalidField { field: String, reason: String },

    #[error("unparseable field '{field}': {text:?}")]
    UnparseableField { field: String, text: String },

    #[error("payload for {actual} used where {expected} was expected")]
    PayloadMismatch {
        expected: EntityType,
        actual: EntityType,
    },

    // Reconciliation errors
    #[error("{entity}: conflict key {key} is shared by more than one {side} record")]
    DuplicateConflictKey {
        entity: EntityType,
        key: ConflictKey,
        side: &'static str,
    },

    #[error("{entity}: server confirmed {confirmed} but {expected} was pushed")]
    IdentityMismatch {
        entity: EntityType,
        expected: String,
        confirmed: String,
    },

    // Ledger errors
    #[error("record not found: {entity} #{local_id}")]
    RecordNotFound {
        entity: EntityType,
        local_id: LocalId,
    },

    #[error("remote id of {entity} #{local_id} is {current}, refusing to change it to {requested}")]
    RemoteIdChanged {
        entity: EntityType,
        local_id: LocalId,
        current: RemoteId,
        requested: RemoteId,
    },

    #[error("remote id {0} is already assigned to another record")]
    RemoteIdTaken(RemoteId),

    #[error("unknown collection: {0}")]
    UnknownCollection(String),

    #[error("{entity} #{local_id} already holds the same content")]
    AlreadyExists {
        entity: EntityType,
        local_id: LocalId,
    },

    #[error("operation on deleted record: {entity} #{local_id}")]
    OperationOnDeleted {
        entity: EntityType,
        local_id: LocalId,
    },

    // Snapshot errors
    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),
}

impl Error {
    /// Whether the error describes a single malformed record that can be
    /// skipped without failing the rest of the batch.
    pub fn is_malformed_record(&self) -> bool {
        matches!(
            self,
            Error::MissingField { .. }
                | Error::InvalidField { .. }
                | Error::UnparseableField { .. }
                | Error::UnknownCollection(_)
        )
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
