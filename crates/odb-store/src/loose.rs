use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use odb_crypto::{canonical_header, ContentHasher};
use odb_types::{HashAlgorithm, ObjectId};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{IoResultExt, StoreError, StoreResult};
use crate::object::{normalize_prefix, parse_canonical_header, ObjectHeader, RawObject};
use crate::traits::ObjectBackend;

/// Bytes inflated when only the header is wanted. Longer than any valid
/// header (`"commit " + 20 digits + NUL`).
const HEADER_PROBE_LEN: usize = 64;

/// Configuration for the loose object store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LooseConfig {
    /// zlib level, 0-9.
    pub compression_level: u32,
    /// `fsync` each object file before it is renamed into place.
    pub fsync: bool,
    /// Re-hash content on read and fail on mismatch.
    pub verify_hash: bool,
}

impl Default for LooseConfig {
    fn default() -> Self {
        Self {
            compression_level: 6,
            fsync: false,
            verify_hash: true,
        }
    }
}

/// One-file-per-object store.
///
/// Layout: `<root>/<2 hex>/<remaining hex>`, each file the zlib stream of
/// `"{type} {len}\0{content}"`. Files are written to a temporary name in the
/// target directory and renamed into place, so readers never observe a
/// partial object.
#[derive(Debug)]
pub struct LooseObjectStore {
    root: PathBuf,
    hasher: ContentHasher,
    config: LooseConfig,
}

impl LooseObjectStore {
    /// Open a loose store rooted at `root`. The directory is created lazily.
    pub fn new(root: impl Into<PathBuf>, algorithm: HashAlgorithm, config: LooseConfig) -> Self {
        Self {
            root: root.into(),
            hasher: ContentHasher::new(algorithm),
            config,
        }
    }

    /// Store root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Hash algorithm of the ids in this store.
    pub fn algorithm(&self) -> HashAlgorithm {
        self.hasher.algorithm()
    }

    /// Path where the object with `id` lives (whether or not it exists).
    pub fn object_path(&self, id: &ObjectId) -> PathBuf {
        let (dir, file) = id.loose_path_parts();
        self.root.join(dir).join(file)
    }

    /// Delete an object by ID. Returns `true` if the object existed.
    ///
    /// Intended for garbage collection and pruning after a repack only.
    pub fn delete(&self, id: &ObjectId) -> StoreResult<bool> {
        let path = self.object_path(id);
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(id = %id.short_hex(), "removed loose object");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::io(path, e)),
        }
    }

    fn open_object(&self, id: &ObjectId) -> StoreResult<Option<(File, PathBuf)>> {
        let path = self.object_path(id);
        match File::open(&path) {
            Ok(file) => Ok(Some((file, path))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::io(path, e)),
        }
    }

    fn decode(&self, id: &ObjectId, path: &Path, compressed: &[u8]) -> StoreResult<RawObject> {
        let mut inflated = Vec::new();
        ZlibDecoder::new(compressed)
            .read_to_end(&mut inflated)
            .map_err(|e| StoreError::corrupt(path.display(), format!("inflate failed: {e}")))?;

        let (header, used) = parse_canonical_header(&inflated)
            .map_err(|e| StoreError::corrupt(path.display(), e.to_string()))?
            .ok_or_else(|| StoreError::corrupt(path.display(), "missing object header"))?;

        let content_len = (inflated.len() - used) as u64;
        if content_len != header.size {
            return Err(StoreError::corrupt(
                path.display(),
                format!("declared size {} but found {content_len} bytes", header.size),
            ));
        }

        inflated.drain(..used);
        let object = RawObject::new(header.kind, inflated);

        if self.config.verify_hash {
            let computed = self.hasher.address(object.kind, &object.data);
            if computed != *id {
                warn!(id = %id, computed = %computed, "loose object hash mismatch");
                return Err(StoreError::HashMismatch { id: *id, computed });
            }
        }
        Ok(object)
    }

    fn write_object_file(&self, object: &RawObject, path: &Path) -> StoreResult<()> {
        let dir = path
            .parent()
            .ok_or_else(|| StoreError::io(path, io::Error::other("object path has no parent")))?;
        fs::create_dir_all(dir).with_path(dir)?;

        let tmp = tempfile::Builder::new()
            .prefix("tmp_obj_")
            .tempfile_in(dir)
            .with_path(dir)?;

        let level = Compression::new(self.config.compression_level.min(9));
        let mut encoder = ZlibEncoder::new(tmp, level);
        encoder
            .write_all(&canonical_header(object.kind, object.data.len()))
            .and_then(|_| encoder.write_all(&object.data))
            .with_path(path)?;
        let tmp = encoder.finish().with_path(path)?;

        if self.config.fsync {
            tmp.as_file().sync_all().with_path(path)?;
        }

        tmp.persist(path).map_err(|e| StoreError::io(path, e.error))?;
        Ok(())
    }
}

impl ObjectBackend for LooseObjectStore {
    fn read(&self, id: &ObjectId) -> StoreResult<Option<RawObject>> {
        let Some((mut file, path)) = self.open_object(id)? else {
            return Ok(None);
        };
        let mut compressed = Vec::new();
        file.read_to_end(&mut compressed).with_path(&path)?;
        self.decode(id, &path, &compressed).map(Some)
    }

    fn read_header(&self, id: &ObjectId) -> StoreResult<Option<ObjectHeader>> {
        let Some((file, path)) = self.open_object(id)? else {
            return Ok(None);
        };
        let mut decoder = ZlibDecoder::new(io::BufReader::new(file));
        let mut buf = [0u8; HEADER_PROBE_LEN];
        let mut filled = 0;
        while filled < buf.len() {
            let n = decoder
                .read(&mut buf[filled..])
                .map_err(|e| StoreError::corrupt(path.display(), format!("inflate failed: {e}")))?;
            if n == 0 {
                break;
            }
            filled += n;
            if let Some((header, _)) = parse_canonical_header(&buf[..filled])
                .map_err(|e| StoreError::corrupt(path.display(), e.to_string()))?
            {
                return Ok(Some(header));
            }
        }
        Err(StoreError::corrupt(path.display(), "missing object header"))
    }

    fn exists(&self, id: &ObjectId) -> StoreResult<bool> {
        let path = self.object_path(id);
        path.try_exists().with_path(&path)
    }

    fn write(&self, object: &RawObject) -> StoreResult<ObjectId> {
        let id = self.hasher.address(object.kind, &object.data);
        let path = self.object_path(&id);
        if path.try_exists().with_path(&path)? {
            return Ok(id);
        }
        self.write_object_file(object, &path)?;
        debug!(id = %id.short_hex(), kind = %object.kind, size = object.len(), "wrote loose object");
        Ok(id)
    }

    fn for_each_id(&self, f: &mut dyn FnMut(&ObjectId) -> StoreResult<()>) -> StoreResult<()> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(StoreError::io(&self.root, e)),
        };
        for entry in entries {
            let entry = entry.with_path(&self.root)?;
            let name = entry.file_name();
            let Some(dir_name) = name.to_str() else { continue };
            if !is_fanout_dir(dir_name) || !entry.path().is_dir() {
                continue;
            }
            self.for_each_in_dir(dir_name, f)?;
        }
        Ok(())
    }

    fn resolve_prefix(&self, prefix: &str) -> StoreResult<Option<ObjectId>> {
        let prefix = normalize_prefix(prefix, self.algorithm())?;
        let Some(dir_name) = prefix.get(..2) else {
            return Ok(None);
        };
        let mut found: Option<ObjectId> = None;
        self.for_each_in_dir(dir_name, &mut |id| {
            if id.matches_hex_prefix(&prefix) {
                if found.is_some() {
                    return Err(StoreError::Ambiguous(prefix.clone()));
                }
                found = Some(*id);
            }
            Ok(())
        })?;
        Ok(found)
    }
}

impl LooseObjectStore {
    fn for_each_in_dir(
        &self,
        dir_name: &str,
        f: &mut dyn FnMut(&ObjectId) -> StoreResult<()>,
    ) -> StoreResult<()> {
        let dir = self.root.join(dir_name);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(StoreError::io(dir, e)),
        };
        let rest_len = self.hasher.algorithm().hex_len() - 2;
        for entry in entries {
            let entry = entry.with_path(&dir)?;
            let name = entry.file_name();
            let Some(file_name) = name.to_str() else { continue };
            if file_name.len() != rest_len || !file_name.bytes().all(|b| b.is_ascii_hexdigit()) {
                continue;
            }
            if let Ok(id) = ObjectId::from_hex(&format!("{dir_name}{file_name}")) {
                f(&id)?;
            }
        }
        Ok(())
    }
}

fn is_fanout_dir(name: &str) -> bool {
    name.len() == 2 && name.bytes().all(|b| b.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use odb_types::ObjectType;

    fn store(dir: &Path) -> LooseObjectStore {
        LooseObjectStore::new(dir, HashAlgorithm::Sha1, LooseConfig::default())
    }

    #[test]
    fn write_and_read_blob() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let obj = RawObject::blob(b"hello".to_vec());
        let id = store.write(&obj).unwrap();
        assert_eq!(id.to_hex(), "b6fc4c620b67d95f953a5c1c1230aaab5db5a1b0");

        let path = dir.path().join("b6").join("fc4c620b67d95f953a5c1c1230aaab5db5a1b0");
        assert!(path.exists());

        let read_back = store.read(&id).unwrap().expect("should exist");
        assert_eq!(read_back, obj);
    }

    #[test]
    fn file_is_zlib_of_canonical_encoding() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let obj = RawObject::new(ObjectType::Tree, b"entries".to_vec());
        let id = store.write(&obj).unwrap();

        let compressed = fs::read(store.object_path(&id)).unwrap();
        let mut inflated = Vec::new();
        ZlibDecoder::new(&compressed[..]).read_to_end(&mut inflated).unwrap();
        assert_eq!(inflated, b"tree 7\0entries");
    }

    #[test]
    fn write_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let obj = RawObject::blob(b"idempotent".to_vec());
        let id1 = store.write(&obj).unwrap();
        let id2 = store.write(&obj).unwrap();
        assert_eq!(id1, id2);

        let mut count = 0;
        store.for_each_id(&mut |_| {
            count += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn read_missing_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let id = ObjectId::from_sha1([9; 20]);
        assert!(store.read(&id).unwrap().is_none());
        assert!(store.read_header(&id).unwrap().is_none());
        assert!(!store.exists(&id).unwrap());
    }

    #[test]
    fn exists_for_present_object() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let id = store.write(&RawObject::blob(b"present".to_vec())).unwrap();
        assert!(store.exists(&id).unwrap());
    }

    #[test]
    fn garbage_file_is_corruption_not_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let id = store.write(&RawObject::blob(b"soon broken".to_vec())).unwrap();
        fs::write(store.object_path(&id), b"definitely not zlib").unwrap();

        let err = store.read(&id).unwrap_err();
        assert!(err.is_corruption(), "got {err:?}");
        assert!(!err.is_not_found());
    }

    #[test]
    fn swapped_content_fails_hash_check() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let a = store.write(&RawObject::blob(b"aaa".to_vec())).unwrap();
        let b = store.write(&RawObject::blob(b"bbb".to_vec())).unwrap();
        fs::copy(store.object_path(&b), store.object_path(&a)).unwrap();

        let err = store.read(&a).unwrap_err();
        assert!(matches!(err, StoreError::HashMismatch { .. }));
    }

    #[test]
    fn size_mismatch_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let id = ObjectId::from_sha1([0x11; 20]);
        let path = store.object_path(&id);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
        enc.write_all(b"blob 10\0short").unwrap();
        fs::write(&path, enc.finish().unwrap()).unwrap();

        let err = store.read(&id).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn read_header_without_content() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let data = vec![0x5a; 100_000];
        let id = store.write(&RawObject::blob(data)).unwrap();
        let header = store.read_header(&id).unwrap().unwrap();
        assert_eq!(header.kind, ObjectType::Blob);
        assert_eq!(header.size, 100_000);
    }

    #[test]
    fn delete_present_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let id = store.write(&RawObject::blob(b"to-delete".to_vec())).unwrap();
        assert!(store.delete(&id).unwrap());
        assert!(!store.exists(&id).unwrap());
        assert!(!store.delete(&id).unwrap());
    }

    #[test]
    fn for_each_id_skips_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let a = store.write(&RawObject::blob(b"a".to_vec())).unwrap();
        let b = store.write(&RawObject::blob(b"b".to_vec())).unwrap();
        fs::create_dir_all(dir.path().join("pack")).unwrap();
        fs::create_dir_all(dir.path().join("info")).unwrap();
        fs::write(dir.path().join("info").join("alternates"), b"").unwrap();

        let mut ids = Vec::new();
        store.for_each_id(&mut |id| {
            ids.push(*id);
            Ok(())
        })
        .unwrap();
        ids.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(ids, expected);
    }

    #[test]
    fn resolve_prefix_unique_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let id = store.write(&RawObject::blob(b"hello".to_vec())).unwrap();
        assert_eq!(store.resolve_prefix("b6fc4c").unwrap(), Some(id));
        assert_eq!(store.resolve_prefix("0000").unwrap(), None);
    }

    #[test]
    fn resolve_prefix_rejects_short_or_non_hex() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        store.write(&RawObject::blob(b"hello".to_vec())).unwrap();
        for prefix in ["", "b", "b6f", "b6fz"] {
            let err = store.resolve_prefix(prefix).unwrap_err();
            assert!(
                matches!(err, StoreError::InvalidPrefix { .. }),
                "{prefix:?} gave {err:?}"
            );
        }
        assert!(store.resolve_prefix("B6FC4C").unwrap().is_some());
    }

    #[test]
    fn sha256_layout() {
        let dir = tempfile::tempdir().unwrap();
        let store = LooseObjectStore::new(dir.path(), HashAlgorithm::Sha256, LooseConfig::default());
        let id = store.write(&RawObject::blob(Vec::new())).unwrap();
        assert_eq!(
            id.to_hex(),
            "473a0f4c3be8a93681a267e3b1e9a7dcda1185436fe141f7749120a303721813"
        );
        assert_eq!(store.read(&id).unwrap().unwrap().data, b"");
    }

    #[test]
    fn concurrent_writers_agree() {
        use std::sync::Arc;
        use std::thread;

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(store(dir.path()));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                thread::spawn(move || store.write(&RawObject::blob(b"shared".to_vec())).unwrap())
            })
            .collect();
        let ids: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(ids.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(store.read(&ids[0]).unwrap().unwrap().data, b"shared");
    }
}
