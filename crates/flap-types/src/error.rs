use thiserror::Error;

use crate::value::AttrType;

/// Errors produced by type operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypeError {
    #[error("cannot decode {raw:?} as {expected}: {reason}")]
    Decode {
        expected: AttrType,
        raw: String,
        reason: String,
    },

    #[error("expected a {expected} value, got {actual}")]
    Mismatch { expected: AttrType, actual: AttrType },
}
