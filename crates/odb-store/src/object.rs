use odb_crypto::{canonical_header, ContentHasher};
use odb_types::{HashAlgorithm, ObjectId, ObjectType};

use crate::error::{StoreError, StoreResult};

/// Minimum length of an abbreviated hex id.
pub const MIN_PREFIX_LEN: usize = 4;

/// A raw object: type tag + content bytes.
///
/// `RawObject` is the unit of storage. Stores never interpret the content;
/// they hand out owned copies so no caller ever shares mutable state with a
/// store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawObject {
    /// The type of this object.
    pub kind: ObjectType,
    /// The content bytes.
    pub data: Vec<u8>,
}

impl RawObject {
    /// Create a new raw object from kind and data.
    pub fn new(kind: ObjectType, data: impl Into<Vec<u8>>) -> Self {
        Self {
            kind,
            data: data.into(),
        }
    }

    /// Shorthand for a blob.
    pub fn blob(data: impl Into<Vec<u8>>) -> Self {
        Self::new(ObjectType::Blob, data)
    }

    /// Compute the content-addressed ID for this object.
    pub fn compute_id(&self, algorithm: HashAlgorithm) -> ObjectId {
        ContentHasher::new(algorithm).address(self.kind, &self.data)
    }

    /// Content length in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if the content is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Header summary of this object.
    pub fn header(&self) -> ObjectHeader {
        ObjectHeader {
            kind: self.kind,
            size: self.data.len() as u64,
        }
    }

    /// The canonical `"{type} {len}\0{content}"` encoding.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = canonical_header(self.kind, self.data.len());
        out.extend_from_slice(&self.data);
        out
    }
}

/// Type and size of an object, readable without materialising the content.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ObjectHeader {
    pub kind: ObjectType,
    pub size: u64,
}

/// Parse a canonical header from the front of `buf`.
///
/// Returns the header and the number of bytes it occupied (including the
/// terminating NUL). `None` means the NUL has not been seen yet.
pub fn parse_canonical_header(buf: &[u8]) -> StoreResult<Option<(ObjectHeader, usize)>> {
    let Some(nul) = buf.iter().position(|&b| b == 0) else {
        return Ok(None);
    };
    let header = &buf[..nul];
    let space = header
        .iter()
        .position(|&b| b == b' ')
        .ok_or_else(|| StoreError::corrupt("object header", "missing space separator"))?;
    let kind = ObjectType::from_name(&header[..space])?;
    let len_digits = &header[space + 1..];
    if len_digits.is_empty() || !len_digits.iter().all(u8::is_ascii_digit) {
        return Err(StoreError::corrupt("object header", "invalid length field"));
    }
    if len_digits.len() > 1 && len_digits[0] == b'0' {
        return Err(StoreError::corrupt("object header", "length has leading zero"));
    }
    let size = std::str::from_utf8(len_digits)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .ok_or_else(|| StoreError::corrupt("object header", "length out of range"))?;
    Ok(Some((ObjectHeader { kind, size }, nul + 1)))
}

/// Normalise and validate an abbreviated hex id.
pub fn normalize_prefix(prefix: &str, algorithm: HashAlgorithm) -> StoreResult<String> {
    let lower = prefix.to_ascii_lowercase();
    let invalid = |reason: &str| StoreError::InvalidPrefix {
        prefix: prefix.to_string(),
        reason: reason.to_string(),
    };
    if lower.len() < MIN_PREFIX_LEN {
        return Err(invalid("too short"));
    }
    if lower.len() > algorithm.hex_len() {
        return Err(invalid("longer than a full id"));
    }
    if !lower.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(invalid("not hexadecimal"));
    }
    Ok(lower)
}
