use std::io;

use odb_types::{HashAlgorithm, ObjectId};
use sha2::Digest as _;

/// Streaming digest over the configured [`HashAlgorithm`].
///
/// Used wherever bytes arrive incrementally: canonical object hashing, the
/// whole-pack trailer written by the pack writer, and index checksums.
#[derive(Clone)]
pub enum Digest {
    Sha1(sha1::Sha1),
    Sha256(sha2::Sha256),
    Blake3(Box<blake3::Hasher>),
}

impl Digest {
    /// Start a new digest for `algorithm`.
    pub fn new(algorithm: HashAlgorithm) -> Self {
        match algorithm {
            HashAlgorithm::Sha1 => Self::Sha1(sha1::Sha1::new()),
            HashAlgorithm::Sha256 => Self::Sha256(sha2::Sha256::new()),
            HashAlgorithm::Blake3 => Self::Blake3(Box::new(blake3::Hasher::new())),
        }
    }

    /// The algorithm this digest computes.
    pub fn algorithm(&self) -> HashAlgorithm {
        match self {
            Self::Sha1(_) => HashAlgorithm::Sha1,
            Self::Sha256(_) => HashAlgorithm::Sha256,
            Self::Blake3(_) => HashAlgorithm::Blake3,
        }
    }

    /// Feed more bytes.
    pub fn update(&mut self, data: &[u8]) {
        match self {
            Self::Sha1(h) => h.update(data),
            Self::Sha256(h) => h.update(data),
            Self::Blake3(h) => {
                h.update(data);
            }
        }
    }

    /// Finish and return the digest as an [`ObjectId`].
    pub fn finalize(self) -> ObjectId {
        match self {
            Self::Sha1(h) => {
                let out: [u8; 20] = h.finalize().into();
                ObjectId::from_sha1(out)
            }
            Self::Sha256(h) => {
                let out: [u8; 32] = h.finalize().into();
                ObjectId::from_hash(out)
            }
            Self::Blake3(h) => ObjectId::from_hash(*h.finalize().as_bytes()),
        }
    }

    /// One-shot digest of `data`.
    pub fn hash(algorithm: HashAlgorithm, data: &[u8]) -> ObjectId {
        let mut digest = Self::new(algorithm);
        digest.update(data);
        digest.finalize()
    }
}

impl io::Write for Digest {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl std::fmt::Debug for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Digest").field(&self.algorithm()).finish()
    }
}
