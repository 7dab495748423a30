#![allow(missing_docs)]

use std::io;

use thiserror::Error;
use time::OffsetDateTime;

/// Result alias used throughout the engine.
pub type Result<T> = std::result::Result<T, TrackError>;

/// Business-rule outcomes reported by validation.
///
/// Every variant describes an expected, caller-correctable situation; the
/// batch that triggered it is aborted without writes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationKind {
    #[error("sample id '{0}' is already used")]
    DuplicateSampleId(String),
    #[error("sample id '{0}' contains whitespace")]
    WhitespaceInSampleId(String),
    #[error("biotype {0} does not exist")]
    MissingBiotype(u64),
    #[error("the field '{0}' is required")]
    MissingField(String),
    #[error("name '{name}' is already used by {other}")]
    DuplicateName { name: String, other: String },
    #[error("field '{field}' refers to unknown biosample '{reference}'")]
    UnresolvedReference { field: String, reference: String },
    #[error("field '{field}' has invalid value '{value}': {reason}")]
    InvalidMetadata {
        field: String,
        value: String,
        reason: String,
    },
    #[error("parent {0} does not exist")]
    MissingParent(u64),
    #[error("parent chain of {0} loops back onto itself")]
    Cycle(String),
    #[error("location {0} does not exist")]
    MissingLocation(u64),
    #[error("position {pos} is outside of {location} ({capacity} slots)")]
    PositionOutOfRange {
        location: String,
        pos: i32,
        capacity: i32,
    },
    #[error("position {label} of {location} is already occupied by {occupant}")]
    PositionOccupied {
        location: String,
        label: String,
        occupant: String,
    },
    #[error("{location} needs at least {min_rows} rows and {min_cols} columns to keep its samples")]
    GridTooSmall {
        location: String,
        min_rows: i32,
        min_cols: i32,
    },
    #[error("{location} has {count} samples but only {capacity} positions")]
    GridOverflow {
        location: String,
        count: usize,
        capacity: i32,
    },
    #[error("container {container_id} of type {container_type} holds only one sample")]
    ContainerNotShared {
        container_id: String,
        container_type: String,
    },
    #[error("samples in container {0} belong to different studies")]
    ContainerStudyMismatch(String),
    #[error("samples in container {0} are stored at different places")]
    ContainerPlacementMismatch(String),
    #[error("{0} belongs to another study")]
    StudyMismatch(String),
    #[error("location name '{0}' is invalid")]
    InvalidLocationName(String),
    #[error("location type is required")]
    MissingLocationType,
    #[error("a {0} location must have an owning group")]
    MissingOwnerGroup(String),
    #[error("a labeled location needs positive rows and columns (got {rows}x{cols})")]
    InvalidDimensions { rows: i32, cols: i32 },
    #[error("location hierarchy deeper than {0} levels")]
    HierarchyTooDeep(usize),
    #[error("{0} is not empty")]
    NotEmpty(String),
    #[error("{0} is listed more than once in the batch")]
    RepeatedInBatch(String),
}

/// Error type for every engine operation.
#[derive(Debug, Error)]
pub enum TrackError {
    /// A business rule rejected the record named `record`.
    #[error("{record}: {kind}")]
    Validation { record: String, kind: ValidationKind },
    /// The committed copy was modified after the in-memory copy was loaded.
    #[error(
        "{entity} {record} was modified by {other_editor} at {committed_at} (your copy is from {loaded_at})"
    )]
    Conflict {
        entity: &'static str,
        record: String,
        other_editor: String,
        committed_at: OffsetDateTime,
        loaded_at: OffsetDateTime,
    },
    /// The rights collaborator refused the action.
    #[error("{user} is not allowed to {action} {record}")]
    Rights {
        action: &'static str,
        record: String,
        user: String,
    },
    /// The identifier pattern cannot produce an identifier.
    #[error("cannot allocate an identifier for pattern '{pattern}': {reason}")]
    Allocation { pattern: String, reason: String },
    /// A referenced record is missing.
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    /// The transaction was already committed or rolled back.
    #[error("transaction is no longer active")]
    TransactionClosed,
    /// Backend-specific failure.
    #[error("storage error: {0}")]
    Storage(String),
    /// SQLite failure.
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    /// JSON encoding failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TrackError {
    pub(crate) fn validation(record: impl Into<String>, kind: ValidationKind) -> Self {
        TrackError::Validation {
            record: record.into(),
            kind,
        }
    }

    pub(crate) fn not_found(entity: &'static str, id: impl ToString) -> Self {
        TrackError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Returns the validation outcome, if this is a validation error.
    pub fn validation_kind(&self) -> Option<&ValidationKind> {
        match self {
            TrackError::Validation { kind, .. } => Some(kind),
            _ => None,
        }
    }

    /// Returns true for business-rule violations.
    pub fn is_validation(&self) -> bool {
        matches!(self, TrackError::Validation { .. })
    }

    /// Returns true for stale-write conflicts.
    pub fn is_conflict(&self) -> bool {
        matches!(self, TrackError::Conflict { .. })
    }
}
