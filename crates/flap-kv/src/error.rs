/// Errors from key-value backend operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KvError {
    /// The backend could not be reached or its state is unusable.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// The key holds a value of a different kind than the operation expects.
    #[error("wrong kind of value at {key}: expected {expected}")]
    WrongType { key: String, expected: &'static str },

    /// A counter key holds something other than an integer.
    #[error("value at {0} is not an integer")]
    NotAnInteger(String),
}

/// Result alias for backend operations.
pub type KvResult<T> = Result<T, KvError>;
