use thiserror::Error;

/// Errors produced by type operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypeError {
    #[error("invalid hex string: {0}")]
    InvalidHex(String),

    #[error("invalid byte length: expected 20 or 32, got {0}")]
    InvalidLength(usize),

    #[error("unknown object type: {0}")]
    UnknownObjectType(String),

    #[error("unknown pack type code: {0}")]
    UnknownTypeCode(u8),
}
