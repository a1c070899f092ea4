use std::fmt;

use serde::{Deserialize, Serialize};

/// Digest algorithm configured for a repository.
///
/// The algorithm fixes the length of every [`ObjectId`](crate::ObjectId) in
/// the store as well as the pack trailer and index checksums.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    /// SHA-1, 20-byte ids.
    #[default]
    Sha1,
    /// SHA-256, 32-byte ids.
    Sha256,
    /// BLAKE3, 32-byte ids.
    Blake3,
}

impl HashAlgorithm {
    /// Length in bytes of a digest produced by this algorithm.
    pub const fn digest_len(&self) -> usize {
        match self {
            Self::Sha1 => 20,
            Self::Sha256 | Self::Blake3 => 32,
        }
    }

    /// Length of the hex representation of a digest.
    pub const fn hex_len(&self) -> usize {
        self.digest_len() * 2
    }

    /// Lowercase algorithm name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Sha1 => "sha1",
            Self::Sha256 => "sha256",
            Self::Blake3 => "blake3",
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_lengths() {
        assert_eq!(HashAlgorithm::Sha1.digest_len(), 20);
        assert_eq!(HashAlgorithm::Sha256.digest_len(), 32);
        assert_eq!(HashAlgorithm::Blake3.digest_len(), 32);
        assert_eq!(HashAlgorithm::Sha1.hex_len(), 40);
    }

    #[test]
    fn default_is_sha1() {
        assert_eq!(HashAlgorithm::default(), HashAlgorithm::Sha1);
    }

    #[test]
    fn serde_uses_lowercase_names() {
        let json = serde_json::to_string(&HashAlgorithm::Sha256).unwrap();
        assert_eq!(json, "\"sha256\"");
        let parsed: HashAlgorithm = serde_json::from_str("\"blake3\"").unwrap();
        assert_eq!(parsed, HashAlgorithm::Blake3);
    }
}
