use odb_types::{HashAlgorithm, ObjectId, ObjectType};

use crate::digest::Digest;

/// Canonical object header: `"{type} {decimal length}\0"`.
pub fn canonical_header(kind: ObjectType, len: usize) -> Vec<u8> {
    format!("{} {}\0", kind.name(), len).into_bytes()
}

/// Canonical content hasher.
///
/// Every object id is the digest of `"{type} {len}\0{content}"`. The type name
/// in the header separates domains: identical bytes stored as a blob and as a
/// tree produce different ids, while the same bytes under the same type always
/// produce the same id.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ContentHasher {
    algorithm: HashAlgorithm,
}

impl ContentHasher {
    /// SHA-1 hasher (20-byte ids).
    pub const SHA1: Self = Self {
        algorithm: HashAlgorithm::Sha1,
    };
    /// SHA-256 hasher (32-byte ids).
    pub const SHA256: Self = Self {
        algorithm: HashAlgorithm::Sha256,
    };
    /// BLAKE3 hasher (32-byte ids).
    pub const BLAKE3: Self = Self {
        algorithm: HashAlgorithm::Blake3,
    };

    /// Create a hasher for the given algorithm.
    pub const fn new(algorithm: HashAlgorithm) -> Self {
        Self { algorithm }
    }

    /// The algorithm used by this hasher.
    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    /// Compute the content address of an object.
    pub fn address(&self, kind: ObjectType, data: &[u8]) -> ObjectId {
        let mut digest = Digest::new(self.algorithm);
        digest.update(&canonical_header(kind, data.len()));
        digest.update(data);
        digest.finalize()
    }

    /// Verify that `data` under `kind` produces the expected object ID.
    pub fn verify(&self, kind: ObjectType, data: &[u8], expected: &ObjectId) -> bool {
        self.address(kind, data) == *expected
    }
}

impl Default for ContentHasher {
    fn default() -> Self {
        Self::new(HashAlgorithm::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn matches_git_blob_id() {
        // `printf 'hello' | git hash-object --stdin`
        let id = ContentHasher::SHA1.address(ObjectType::Blob, b"hello");
        assert_eq!(id.to_hex(), "b6fc4c620b67d95f953a5c1c1230aaab5db5a1b0");
    }

    #[test]
    fn matches_git_empty_tree_id() {
        let id = ContentHasher::SHA1.address(ObjectType::Tree, b"");
        assert_eq!(id.to_hex(), "4b825dc642cb6eb9a060e54bf8d69288fbee4904");
    }

    #[test]
    fn matches_git_sha256_empty_blob_id() {
        let id = ContentHasher::SHA256.address(ObjectType::Blob, b"");
        assert_eq!(
            id.to_hex(),
            "473a0f4c3be8a93681a267e3b1e9a7dcda1185436fe141f7749120a303721813"
        );
    }

    #[test]
    fn address_is_deterministic() {
        let a = ContentHasher::SHA1.address(ObjectType::Blob, b"hello world");
        let b = ContentHasher::SHA1.address(ObjectType::Blob, b"hello world");
        assert_eq!(a, b);
    }

    #[test]
    fn different_types_produce_different_ids() {
        let data = b"same content";
        let mut seen = std::collections::HashSet::new();
        for kind in ObjectType::ALL {
            assert!(seen.insert(ContentHasher::SHA1.address(kind, data)));
        }
    }

    #[test]
    fn id_length_follows_algorithm() {
        assert_eq!(ContentHasher::SHA1.address(ObjectType::Blob, b"x").digest_len(), 20);
        assert_eq!(ContentHasher::SHA256.address(ObjectType::Blob, b"x").digest_len(), 32);
        assert_eq!(ContentHasher::BLAKE3.address(ObjectType::Blob, b"x").digest_len(), 32);
    }

    #[test]
    fn verify_detects_tampering() {
        let id = ContentHasher::SHA1.address(ObjectType::Blob, b"original");
        assert!(ContentHasher::SHA1.verify(ObjectType::Blob, b"original", &id));
        assert!(!ContentHasher::SHA1.verify(ObjectType::Blob, b"tampered", &id));
        assert!(!ContentHasher::SHA1.verify(ObjectType::Tree, b"original", &id));
    }

    #[test]
    fn header_format() {
        assert_eq!(canonical_header(ObjectType::Commit, 42), b"commit 42\0");
    }

    proptest! {
        #[test]
        fn distinct_content_distinct_ids(
            a in proptest::collection::vec(any::<u8>(), 0..256),
            b in proptest::collection::vec(any::<u8>(), 0..256),
        ) {
            let hasher = ContentHasher::SHA1;
            let ia = hasher.address(ObjectType::Blob, &a);
            let ib = hasher.address(ObjectType::Blob, &b);
            prop_assert_eq!(a == b, ia == ib);
        }
    }
}
