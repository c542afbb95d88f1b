use flap_record::RecordError;

/// Errors from monitoring data operations.
#[derive(Debug, thiserror::Error)]
pub enum DataError {
    #[error(transparent)]
    Record(#[from] RecordError),

    /// A record was wrapped as the wrong class.
    #[error("expected a {expected} record, got {actual}")]
    WrongClass {
        expected: &'static str,
        actual: String,
    },

    /// A compound create found the id or unique value already claimed.
    #[error("{class} with {attribute} {value:?} already exists")]
    Conflict {
        class: &'static str,
        attribute: &'static str,
        value: String,
    },

    #[error("unknown severity: {0}")]
    UnknownSeverity(String),
}

impl DataError {
    /// The underlying record store error, if any.
    pub fn as_record_error(&self) -> Option<&RecordError> {
        match self {
            DataError::Record(e) => Some(e),
            _ => None,
        }
    }
}

/// Result alias for monitoring data operations.
pub type DataResult<T> = Result<T, DataError>;
