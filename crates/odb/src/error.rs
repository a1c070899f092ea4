use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while loading database configuration.
///
/// Object operations report [`odb_store::StoreError`] directly so callers
/// can classify them with `is_not_found` / `is_corruption`.
#[derive(Debug, Error)]
pub enum OdbError {
    #[error("failed to read config {}: {source}", path.display())]
    ConfigIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("invalid config value: {0}")]
    InvalidConfig(String),

    #[error("store error: {0}")]
    Store(#[from] odb_store::StoreError),
}

pub type OdbResult<T> = Result<T, OdbError>;
