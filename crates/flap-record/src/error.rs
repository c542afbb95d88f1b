use std::time::Duration;

use flap_kv::KvError;
use flap_types::TypeError;

use crate::validation::{ValidationErrors, ViolationKind};

/// Errors from record store operations.
#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    /// One or more validators rejected the record. Every violation is listed.
    #[error("validation failed: {0}")]
    ValidationFailed(ValidationErrors),

    /// One or more ids are absent from the class id set.
    #[error("{class} not found: {}", ids.join(", "))]
    NotFound { class: String, ids: Vec<String> },

    /// The record was destroyed; no further operations are allowed on it.
    #[error("{class} record {id} has been destroyed")]
    DestroyedRecordAccess { class: String, id: String },

    /// The operation needs a persisted record.
    #[error("{class} record has not been saved")]
    Unsaved { class: String },

    /// Other writers kept changing the record between each read and the
    /// batch built from it.
    #[error("{class} record {id} changed during write; gave up after {attempts} attempts")]
    WriteConflict {
        class: String,
        id: String,
        attempts: usize,
    },

    /// The cross-class lock could not be acquired within the bounded wait.
    #[error("timed out after {waited:?} waiting for lock on {}", classes.join(", "))]
    LockTimeout {
        classes: Vec<String>,
        waited: Duration,
    },

    /// Backend transport or state failure.
    #[error("backend error: {0}")]
    Backend(#[from] KvError),

    /// A stored value could not be decoded as its declared type.
    #[error("type error: {0}")]
    Type(#[from] TypeError),

    #[error("unknown class: {0}")]
    UnknownClass(String),

    #[error("unknown attribute {attribute} on {class}")]
    UnknownAttribute { class: String, attribute: String },

    #[error("attribute {attribute} on {class} is not indexed")]
    UnindexedAttribute { class: String, attribute: String },

    #[error("attribute {attribute} on {class} is not sortable")]
    UnsortableAttribute { class: String, attribute: String },

    #[error("unknown association {relation} on {class}")]
    UnknownAssociation { class: String, relation: String },

    /// The schema declaration itself is inconsistent.
    #[error("schema definition error: {0}")]
    Schema(String),
}

impl RecordError {
    /// The violations behind a validation failure.
    pub fn validation_errors(&self) -> Option<&ValidationErrors> {
        match self {
            RecordError::ValidationFailed(errors) => Some(errors),
            _ => None,
        }
    }

    /// Returns `true` if this is a validation failure caused by a unique
    /// index collision.
    pub fn is_unique_violation(&self) -> bool {
        self.validation_errors()
            .is_some_and(|e| e.iter().any(|v| v.kind == ViolationKind::Unique))
    }

    /// Returns `true` if the backend could not be reached.
    pub fn is_backend_unavailable(&self) -> bool {
        matches!(self, RecordError::Backend(KvError::Unavailable(_)))
    }
}

/// Result alias for record store operations.
pub type RecordResult<T> = Result<T, RecordError>;
