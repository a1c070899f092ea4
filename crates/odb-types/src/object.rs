use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use crate::algorithm::HashAlgorithm;
use crate::error::TypeError;

/// Largest supported digest length.
const MAX_LEN: usize = 32;

/// Content-addressed identifier for any stored object.
///
/// An `ObjectId` is the digest of an object's canonical encoding. It holds
/// either a 20-byte (SHA-1) or 32-byte (SHA-256, BLAKE3) digest inline, so it
/// is `Copy` and never allocates. Ordering is bytewise over the digest, which
/// is the sort order used by pack indexes.
#[derive(Clone, Copy)]
pub struct ObjectId {
    len: u8,
    bytes: [u8; MAX_LEN],
}

impl ObjectId {
    /// Build an id from a raw digest slice of length 20 or 32.
    pub fn from_slice(digest: &[u8]) -> Result<Self, TypeError> {
        if digest.len() != 20 && digest.len() != 32 {
            return Err(TypeError::InvalidLength(digest.len()));
        }
        let mut bytes = [0u8; MAX_LEN];
        bytes[..digest.len()].copy_from_slice(digest);
        Ok(Self {
            len: digest.len() as u8,
            bytes,
        })
    }

    /// Create an `ObjectId` from a pre-computed 32-byte hash.
    pub fn from_hash(hash: [u8; 32]) -> Self {
        Self {
            len: 32,
            bytes: hash,
        }
    }

    /// Create an `ObjectId` from a pre-computed 20-byte SHA-1 hash.
    pub fn from_sha1(hash: [u8; 20]) -> Self {
        let mut bytes = [0u8; MAX_LEN];
        bytes[..20].copy_from_slice(&hash);
        Self { len: 20, bytes }
    }

    /// The null object ID (all zeros) for the given algorithm.
    pub fn null(algorithm: HashAlgorithm) -> Self {
        Self {
            len: algorithm.digest_len() as u8,
            bytes: [0u8; MAX_LEN],
        }
    }

    /// Returns `true` if this is the null object ID.
    pub fn is_null(&self) -> bool {
        self.as_bytes().iter().all(|&b| b == 0)
    }

    /// The raw digest bytes (20 or 32 of them).
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    /// Digest length in bytes.
    pub fn digest_len(&self) -> usize {
        self.len as usize
    }

    /// Leading byte, used to select a fan-out bucket.
    pub fn first_byte(&self) -> u8 {
        self.bytes[0]
    }

    /// Hex-encoded string representation.
    pub fn to_hex(&self) -> String {
        hex::encode(self.as_bytes())
    }

    /// Short hex representation (first 8 characters).
    pub fn short_hex(&self) -> String {
        hex::encode(&self.bytes[..4])
    }

    /// Loose-object path components: the first two hex characters and the rest.
    pub fn loose_path_parts(&self) -> (String, String) {
        let hex = self.to_hex();
        let (dir, file) = hex.split_at(2);
        (dir.to_string(), file.to_string())
    }

    /// Parse from a full-length hex string (40 or 64 characters).
    pub fn from_hex(s: &str) -> Result<Self, TypeError> {
        let bytes = hex::decode(s).map_err(|e| TypeError::InvalidHex(e.to_string()))?;
        Self::from_slice(&bytes)
    }

    /// Returns `true` if this id's hex form starts with `prefix`.
    ///
    /// `prefix` must be lowercase hex; odd lengths are supported.
    pub fn matches_hex_prefix(&self, prefix: &str) -> bool {
        let hex = self.to_hex();
        hex.len() >= prefix.len() && hex.as_bytes()[..prefix.len()] == *prefix.as_bytes()
    }
}

impl PartialEq for ObjectId {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl Eq for ObjectId {}

impl Hash for ObjectId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.as_bytes().hash(state);
    }
}

impl PartialOrd for ObjectId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ObjectId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.as_bytes().cmp(other.as_bytes())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.short_hex())
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for ObjectId {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl From<[u8; 32]> for ObjectId {
    fn from(bytes: [u8; 32]) -> Self {
        Self::from_hash(bytes)
    }
}

impl From<[u8; 20]> for ObjectId {
    fn from(bytes: [u8; 20]) -> Self {
        Self::from_sha1(bytes)
    }
}

impl AsRef<[u8]> for ObjectId {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}
