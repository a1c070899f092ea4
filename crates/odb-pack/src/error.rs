use std::path::{Path, PathBuf};

use odb_store::StoreError;
use odb_types::ObjectId;
use thiserror::Error;

use crate::delta::DeltaError;

#[derive(Debug, Error)]
pub enum PackError {
    #[error("invalid magic: expected {expected}, got {actual}")]
    InvalidMagic { expected: String, actual: String },

    #[error("unsupported version: {0}")]
    UnsupportedVersion(u32),

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("corrupt pack entry at offset {offset}: {reason}")]
    CorruptEntry { offset: u64, reason: String },

    #[error("CRC32 mismatch for entry at offset {offset}: index has {expected:08x}, data has {actual:08x}")]
    CrcMismatch { offset: u64, expected: u32, actual: u32 },

    #[error("inflate failed at offset {offset}: {reason}")]
    Inflate { offset: u64, reason: String },

    #[error("bad delta at offset {offset}: {source}")]
    Delta {
        offset: u64,
        #[source]
        source: DeltaError,
    },

    #[error("delta chain at offset {offset} exceeds maximum depth {limit}")]
    DeltaChainTooDeep { offset: u64, limit: usize },

    #[error("delta cycle detected at offset {offset}")]
    DeltaCycle { offset: u64 },

    #[error("delta base not found: {0}")]
    DeltaBaseNotFound(ObjectId),

    #[error("index corrupted: {0}")]
    IndexCorrupted(String),

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{resource} budget exhausted: requested {requested} bytes, limit {limit}")]
    ResourceExhausted {
        resource: &'static str,
        requested: u64,
        limit: u64,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl PackError {
    pub(crate) fn corrupt(offset: u64, reason: impl Into<String>) -> Self {
        Self::CorruptEntry {
            offset,
            reason: reason.into(),
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Classify into the store taxonomy, naming `location` for corruption.
    ///
    /// Everything that is not I/O, a budget failure or an error bubbling up
    /// from another backend means the pack is damaged.
    pub fn into_store_error(self, location: &Path) -> StoreError {
        match self {
            Self::Io { path, source } => StoreError::Io { path, source },
            Self::ResourceExhausted {
                resource,
                requested,
                limit,
            } => StoreError::ResourceExhausted {
                resource,
                requested,
                limit,
            },
            Self::Store(inner) => inner,
            other => StoreError::corrupt(location.display(), other.to_string()),
        }
    }
}

impl From<PackError> for StoreError {
    fn from(err: PackError) -> Self {
        err.into_store_error(Path::new("pack"))
    }
}

pub type PackResult<T> = Result<T, PackError>;
