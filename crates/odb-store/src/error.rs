use std::path::{Path, PathBuf};

use odb_types::{ObjectId, TypeError};

/// Errors from object store operations.
///
/// Callers distinguish "object does not exist" ([`StoreError::is_not_found`])
/// from "store is damaged" ([`StoreError::is_corruption`]); the two need
/// different remediation.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The requested object was not found in any backend.
    #[error("object not found: {0}")]
    NotFound(ObjectId),

    /// An abbreviated id matched more than one object.
    #[error("ambiguous object prefix: {0}")]
    Ambiguous(String),

    /// No object matched an abbreviated id.
    #[error("no object matches prefix: {0}")]
    PrefixNotFound(String),

    /// An abbreviated id was malformed.
    #[error("invalid object prefix {prefix:?}: {reason}")]
    InvalidPrefix { prefix: String, reason: String },

    /// Content hash mismatch on read (data corruption).
    #[error("hash mismatch for {id}: content hashes to {computed}")]
    HashMismatch { id: ObjectId, computed: ObjectId },

    /// The object data is malformed or cannot be decoded.
    #[error("corrupt object store at {location}: {reason}")]
    Corrupt { location: String, reason: String },

    /// I/O error from the underlying storage backend.
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A single request exceeded a configured memory budget.
    #[error("{resource} budget exhausted: requested {requested} bytes, limit {limit}")]
    ResourceExhausted {
        resource: &'static str,
        requested: u64,
        limit: u64,
    },

    /// No writable backend is available.
    #[error("store is read-only")]
    ReadOnly,

    #[error(transparent)]
    Type(#[from] TypeError),
}

impl StoreError {
    /// Build a corruption error.
    pub fn corrupt(location: impl std::fmt::Display, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            location: location.to_string(),
            reason: reason.into(),
        }
    }

    /// Build an I/O error carrying the offending path.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// `true` when the object simply does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::PrefixNotFound(_))
    }

    /// `true` when the store is damaged (checksum, framing or size errors).
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::HashMismatch { .. } | Self::Corrupt { .. })
    }

    /// `true` for filesystem or mapping failures.
    pub fn is_io(&self) -> bool {
        matches!(self, Self::Io { .. })
    }

    /// `true` when a memory budget could not satisfy a request.
    pub fn is_resource_exhausted(&self) -> bool {
        matches!(self, Self::ResourceExhausted { .. })
    }
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Attach a path to raw I/O errors.
pub trait IoResultExt<T> {
    fn with_path(self, path: &Path) -> StoreResult<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn with_path(self, path: &Path) -> StoreResult<T> {
        self.map_err(|e| StoreError::io(path, e))
    }
}
