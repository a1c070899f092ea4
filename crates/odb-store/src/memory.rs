use std::collections::HashMap;

use odb_crypto::ContentHasher;
use odb_types::{HashAlgorithm, ObjectId};
use parking_lot::RwLock;

use crate::error::StoreResult;
use crate::object::RawObject;
use crate::traits::ObjectBackend;

/// In-memory, HashMap-based object store.
///
/// Intended for tests and embedding, and as a staging area for objects that
/// will be written into a pack without ever touching the loose directory.
/// Objects are cloned on read/write.
pub struct InMemoryObjectStore {
    hasher: ContentHasher,
    objects: RwLock<HashMap<ObjectId, RawObject>>,
}

impl InMemoryObjectStore {
    /// Create a new empty in-memory store.
    pub fn new(algorithm: HashAlgorithm) -> Self {
        Self {
            hasher: ContentHasher::new(algorithm),
            objects: RwLock::new(HashMap::new()),
        }
    }

    /// Number of objects currently stored.
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    /// Returns `true` if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    /// Total content bytes across all stored objects.
    pub fn total_bytes(&self) -> u64 {
        self.objects.read().values().map(|obj| obj.len() as u64).sum()
    }

    /// Remove all objects from the store.
    pub fn clear(&self) {
        self.objects.write().clear();
    }

    /// Remove one object. Returns `true` if it was present.
    pub fn delete(&self, id: &ObjectId) -> bool {
        self.objects.write().remove(id).is_some()
    }

    /// Return a sorted list of all object IDs in the store.
    pub fn all_ids(&self) -> Vec<ObjectId> {
        let mut ids: Vec<ObjectId> = self.objects.read().keys().copied().collect();
        ids.sort();
        ids
    }

    /// Snapshot of all objects, sorted by id.
    pub fn objects(&self) -> Vec<RawObject> {
        let map = self.objects.read();
        let mut entries: Vec<(&ObjectId, &RawObject)> = map.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        entries.into_iter().map(|(_, obj)| obj.clone()).collect()
    }
}

impl ObjectBackend for InMemoryObjectStore {
    fn read(&self, id: &ObjectId) -> StoreResult<Option<RawObject>> {
        Ok(self.objects.read().get(id).cloned())
    }

    fn exists(&self, id: &ObjectId) -> StoreResult<bool> {
        Ok(self.objects.read().contains_key(id))
    }

    fn write(&self, object: &RawObject) -> StoreResult<ObjectId> {
        let id = self.hasher.address(object.kind, &object.data);
        // Same id always maps to the same content, so an existing entry wins.
        self.objects
            .write()
            .entry(id)
            .or_insert_with(|| object.clone());
        Ok(id)
    }

    fn for_each_id(&self, f: &mut dyn FnMut(&ObjectId) -> StoreResult<()>) -> StoreResult<()> {
        for id in self.all_ids() {
            f(&id)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for InMemoryObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryObjectStore")
            .field("algorithm", &self.hasher.algorithm())
            .field("object_count", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use odb_types::ObjectType;

    fn store() -> InMemoryObjectStore {
        InMemoryObjectStore::new(HashAlgorithm::Sha1)
    }

    #[test]
    fn write_and_read() {
        let store = store();
        let obj = RawObject::new(ObjectType::Commit, b"tree abc\n".to_vec());
        let id = store.write(&obj).unwrap();
        assert_eq!(store.read(&id).unwrap(), Some(obj));
    }

    #[test]
    fn same_content_produces_same_id() {
        let store = store();
        let id1 = store.write(&RawObject::blob(b"identical".to_vec())).unwrap();
        let id2 = store.write(&RawObject::blob(b"identical".to_vec())).unwrap();
        assert_eq!(id1, id2);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn exists_and_delete() {
        let store = store();
        let id = store.write(&RawObject::blob(b"x".to_vec())).unwrap();
        assert!(store.exists(&id).unwrap());
        assert!(store.delete(&id));
        assert!(!store.exists(&id).unwrap());
        assert!(!store.delete(&id));
    }

    #[test]
    fn read_batch_with_missing() {
        let store = store();
        let id1 = store.write(&RawObject::blob(b"exists".to_vec())).unwrap();
        let id2 = ObjectId::from_sha1([3; 20]);
        let results = store.read_batch(&[id1, id2]).unwrap();
        assert!(results[0].is_some());
        assert!(results[1].is_none());
    }

    #[test]
    fn total_bytes_and_clear() {
        let store = store();
        store.write(&RawObject::blob(b"12345".to_vec())).unwrap();
        store.write(&RawObject::blob(b"123456789".to_vec())).unwrap();
        assert_eq!(store.total_bytes(), 14);
        store.clear();
        assert!(store.is_empty());
    }

    #[test]
    fn header_via_default_impl() {
        let store = store();
        let id = store.write(&RawObject::new(ObjectType::Tag, b"tag v1".to_vec())).unwrap();
        let header = store.read_header(&id).unwrap().unwrap();
        assert_eq!(header.kind, ObjectType::Tag);
        assert_eq!(header.size, 6);
    }

    #[test]
    fn resolve_prefix_via_default_impl() {
        let store = store();
        let id = store.write(&RawObject::blob(b"hello".to_vec())).unwrap();
        assert_eq!(store.resolve_prefix("b6fc").unwrap(), Some(id));
        assert_eq!(store.resolve_prefix("ffff").unwrap(), None);
    }

    #[test]
    fn resolve_prefix_ambiguous() {
        let store = store();
        // 257 objects over 256 leading-byte buckets: two must share a bucket.
        let mut ids: Vec<ObjectId> = (0..257u32)
            .map(|i| store.write(&RawObject::blob(i.to_be_bytes().to_vec())).unwrap())
            .collect();
        ids.sort();
        let pair = ids
            .windows(2)
            .find(|w| w[0].first_byte() == w[1].first_byte())
            .unwrap();
        let err = store.resolve_prefix(&pair[0].to_hex()[..2]).unwrap_err();
        assert!(matches!(err, StoreError::Ambiguous(_)));
    }

    #[test]
    fn concurrent_reads_are_safe() {
        use std::sync::Arc;
        use std::thread;

        let store = Arc::new(store());
        let id = store.write(&RawObject::blob(b"shared data".to_vec())).unwrap();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    let obj = store.read(&id).unwrap().unwrap();
                    assert_eq!(obj.compute_id(HashAlgorithm::Sha1), id);
                })
            })
            .collect();
        for h in handles {
            h.join().expect("thread should not panic");
        }
    }
}
