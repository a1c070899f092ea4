use std::path::Path;

use odb_pack::{PackReadConfig, PackWriterConfig, WindowConfig};
use odb_store::{CacheConfig, LooseConfig};
use odb_types::HashAlgorithm;
use serde::{Deserialize, Serialize};

use crate::error::{OdbError, OdbResult};

/// Top-level database configuration.
///
/// Every section has defaults, so a partial TOML document only needs the
/// keys it changes:
///
/// ```toml
/// algorithm = "sha256"
///
/// [cache]
/// max_bytes = 67108864
///
/// [windows]
/// mapped_limit = 134217728
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OdbConfig {
    /// Digest used for object ids, pack trailers and index checksums.
    pub algorithm: HashAlgorithm,
    pub cache: CacheConfig,
    pub windows: WindowConfig,
    pub pack: PackReadConfig,
    pub writer: PackWriterConfig,
    pub loose: LooseConfig,
    /// Rescan `pack/` once when a lookup misses every backend.
    pub refresh_on_miss: bool,
    /// How deep `info/alternates` chains are followed.
    pub max_alternate_depth: usize,
}

impl Default for OdbConfig {
    fn default() -> Self {
        Self {
            algorithm: HashAlgorithm::Sha1,
            cache: CacheConfig::default(),
            windows: WindowConfig::default(),
            pack: PackReadConfig::default(),
            writer: PackWriterConfig::default(),
            loose: LooseConfig::default(),
            refresh_on_miss: true,
            max_alternate_depth: 5,
        }
    }
}

impl OdbConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(s: &str) -> OdbResult<Self> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Read a TOML file.
    pub fn load(path: &Path) -> OdbResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| OdbError::ConfigIo {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Reject settings no store could operate under.
    pub fn validate(&self) -> OdbResult<()> {
        if self.windows.window_size == 0 {
            return Err(OdbError::InvalidConfig("windows.window_size must be non-zero".into()));
        }
        if self.windows.mapped_limit == 0 {
            return Err(OdbError::InvalidConfig("windows.mapped_limit must be non-zero".into()));
        }
        if self.pack.max_delta_depth == 0 {
            return Err(OdbError::InvalidConfig("pack.max_delta_depth must be non-zero".into()));
        }
        for (key, level) in [
            ("loose.compression_level", self.loose.compression_level),
            ("writer.compression_level", self.writer.compression_level),
        ] {
            if level > 9 {
                return Err(OdbError::InvalidConfig(format!("{key} must be 0-9, got {level}")));
            }
        }
        Ok(())
    }
}
