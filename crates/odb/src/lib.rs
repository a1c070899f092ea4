//! Content-addressed object database.
//!
//! [`ObjectDatabase`] answers `lookup`, `exists` and `insert` over an
//! ordered set of backends: loose objects, pack files, in-memory stores and
//! alternate databases. Packs share one [`odb_pack::WindowManager`] memory
//! budget and one [`odb_store::ObjectCache`].
//!
//! ```no_run
//! use odb::{ObjectDatabase, OdbConfig, RawObject};
//!
//! # fn main() -> odb::StoreResult<()> {
//! let db = ObjectDatabase::open(".git/objects".as_ref(), OdbConfig::default())?;
//! let id = db.insert(RawObject::blob(b"hello".to_vec()))?;
//! assert_eq!(db.lookup(&id)?.data, b"hello");
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod config;
pub mod database;
pub mod error;

pub use backend::{
    Backend, BackendId, ALTERNATE_PRIORITY, LOOSE_PRIORITY, MEMORY_PRIORITY, PACK_PRIORITY,
};
pub use config::OdbConfig;
pub use database::{ObjectDatabase, OdbStats};
pub use error::{OdbError, OdbResult};

pub use odb_pack::{PackFile, PackReadConfig, PackWriterConfig, WindowConfig};
pub use odb_store::{CacheConfig, LooseConfig, ObjectHeader, RawObject, StoreError, StoreResult};
pub use odb_types::{HashAlgorithm, ObjectId, ObjectType};

#[cfg(test)]
mod tests {
    use std::fs;
    use std::io::Write;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;

    use flate2::write::ZlibEncoder;
    use flate2::Compression;
    use odb_crypto::Digest;
    use odb_pack::entry::{write_frame_header, OBJ_REF_DELTA};
    use odb_pack::{delta, PackIndex};

    use super::*;

    const SHA1: HashAlgorithm = HashAlgorithm::Sha1;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    }

    fn objects_dir(root: &Path, name: &str) -> PathBuf {
        let dir = root.join(name).join("objects");
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn loose_path(objects: &Path, id: &ObjectId) -> PathBuf {
        let (dir, file) = id.loose_path_parts();
        objects.join(dir).join(file)
    }

    fn text(lines: usize) -> Vec<u8> {
        (0..lines)
            .map(|i| format!("line {i:05} of a versioned document\n"))
            .collect::<String>()
            .into_bytes()
    }

    fn zlib(data: &[u8]) -> Vec<u8> {
        let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    /// Write a single-object pack whose only entry is a ref-delta against
    /// `base`, which the pack does not contain.
    fn install_thin_pack(objects: &Path, base: &RawObject, target: &RawObject) {
        let base_id = base.compute_id(SHA1);
        let delta = delta::encode(&base.data, &target.data);

        let mut pack = b"PACK\0\0\0\x02\0\0\0\x01".to_vec();
        let offset = pack.len() as u64;
        let mut frame = Vec::new();
        write_frame_header(&mut frame, OBJ_REF_DELTA, delta.len() as u64);
        frame.extend_from_slice(base_id.as_bytes());
        frame.extend_from_slice(&zlib(&delta));
        let crc = crc32fast::hash(&frame);
        pack.extend_from_slice(&frame);
        let checksum = Digest::hash(SHA1, &pack);
        pack.extend_from_slice(checksum.as_bytes());

        let index = PackIndex::build(SHA1, vec![(target.compute_id(SHA1), crc, offset)], checksum);
        let pack_dir = objects.join("pack");
        fs::create_dir_all(&pack_dir).unwrap();
        let stem = pack_dir.join(format!("pack-{}", checksum.to_hex()));
        fs::write(stem.with_extension("pack"), &pack).unwrap();
        fs::write(stem.with_extension("idx"), index.to_bytes()).unwrap();
    }

    #[test]
    fn insert_pack_prune_and_reopen() {
        init_tracing();
        let tmp = tempfile::tempdir().unwrap();
        let objects = objects_dir(tmp.path(), "repo");
        let db = ObjectDatabase::open(&objects, OdbConfig::default()).unwrap();

        let blob = RawObject::blob(b"hello".to_vec());
        let blob_id = db.insert(blob.clone()).unwrap();
        let mut tree_data = b"100644 hello.txt\0".to_vec();
        tree_data.extend_from_slice(blob_id.as_bytes());
        let tree = RawObject::new(ObjectType::Tree, tree_data);
        let tree_id = db.insert(tree.clone()).unwrap();
        let commit = RawObject::new(
            ObjectType::Commit,
            format!(
                "tree {tree_id}\nauthor A <a@example.com> 0 +0000\n\
                 committer A <a@example.com> 0 +0000\n\ninitial\n"
            )
            .into_bytes(),
        );
        let commit_id = db.insert(commit.clone()).unwrap();

        let expected = [(blob_id, &blob), (tree_id, &tree), (commit_id, &commit)];
        for (id, obj) in &expected {
            assert_eq!(&db.lookup(id).unwrap(), *obj);
            assert!(loose_path(&objects, id).is_file());
        }

        let file = db.repack(true).unwrap().unwrap();
        assert_eq!(file.object_count, 3);
        for (id, _) in &expected {
            assert!(!loose_path(&objects, id).exists());
        }
        assert!(db.repack(true).unwrap().is_none());
        drop(db);

        let db = ObjectDatabase::open(&objects, OdbConfig::default()).unwrap();
        assert_eq!(db.pack_count(), 1);
        for (id, obj) in &expected {
            assert_eq!(&db.lookup(id).unwrap(), *obj);
            assert_eq!(db.read_header(id).unwrap(), obj.header());
        }
        assert_eq!(db.resolve_prefix(&commit_id.to_hex()[..8]).unwrap(), commit_id);
    }

    #[test]
    fn ofs_delta_through_database() {
        let tmp = tempfile::tempdir().unwrap();
        let objects = objects_dir(tmp.path(), "repo");
        let x = RawObject::blob(text(400));
        let mut y_data = x.data.clone();
        y_data.truncate(y_data.len() - 120);
        y_data[2000..2007].copy_from_slice(b"CHANGED");
        let y = RawObject::blob(y_data);

        let db = ObjectDatabase::open(&objects, OdbConfig::default()).unwrap();
        let file = db.write_pack(vec![x.clone(), y.clone()]).unwrap();
        assert_eq!(file.object_count, 2);
        assert_eq!(file.delta_count, 1);
        drop(db);

        let db = ObjectDatabase::open(&objects, OdbConfig::default()).unwrap();
        assert_eq!(db.lookup(&y.compute_id(SHA1)).unwrap(), y);
        assert_eq!(db.lookup(&x.compute_id(SHA1)).unwrap(), x);
    }

    #[test]
    fn thin_pack_base_comes_from_loose_store() {
        let tmp = tempfile::tempdir().unwrap();
        let objects = objects_dir(tmp.path(), "repo");
        let db = ObjectDatabase::open(&objects, OdbConfig::default()).unwrap();

        let base = RawObject::blob(text(100));
        db.insert(base.clone()).unwrap();
        let mut data = base.data.clone();
        data.extend_from_slice(b"one more line\n");
        let target = RawObject::blob(data);
        install_thin_pack(&objects, &base, &target);

        // picked up by the refresh after the first miss
        let target_id = target.compute_id(SHA1);
        assert_eq!(db.lookup(&target_id).unwrap(), target);
        assert_eq!(db.pack_count(), 1);
        assert_eq!(db.read_header(&target_id).unwrap(), target.header());
    }

    #[test]
    fn thin_pack_without_base_is_corruption() {
        let tmp = tempfile::tempdir().unwrap();
        let objects = objects_dir(tmp.path(), "repo");
        let base = RawObject::blob(text(100));
        let mut data = base.data.clone();
        data.extend_from_slice(b"one more line\n");
        let target = RawObject::blob(data);
        install_thin_pack(&objects, &base, &target);

        let db = ObjectDatabase::open(&objects, OdbConfig::default()).unwrap();
        let err = db.lookup(&target.compute_id(SHA1)).unwrap_err();
        assert!(err.is_corruption(), "got {err:?}");
    }

    #[test]
    fn alternates_are_searched_and_never_written() {
        let tmp = tempfile::tempdir().unwrap();
        let shared = objects_dir(tmp.path(), "shared");
        let local = objects_dir(tmp.path(), "local");

        let shared_db = ObjectDatabase::open(&shared, OdbConfig::default()).unwrap();
        let packed = shared_db.insert(RawObject::blob(b"packed upstream".to_vec())).unwrap();
        shared_db.repack(true).unwrap();
        let loose = shared_db.insert(RawObject::blob(b"loose upstream".to_vec())).unwrap();
        drop(shared_db);

        fs::create_dir_all(local.join("info")).unwrap();
        fs::write(
            local.join("info").join("alternates"),
            "# borrowed objects\n../../shared/objects\n",
        )
        .unwrap();

        let db = ObjectDatabase::open(&local, OdbConfig::default()).unwrap();
        assert_eq!(db.backend_count(), 2);
        assert_eq!(db.lookup(&packed).unwrap().data, b"packed upstream");
        assert!(db.exists(&loose).unwrap());

        let own = db.insert(RawObject::blob(b"local only".to_vec())).unwrap();
        assert!(loose_path(&local, &own).is_file());
        assert!(!loose_path(&shared, &own).exists());

        let mut count = 0;
        db.for_each_id(&mut |_| {
            count += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(count, 3);
    }

    #[test]
    fn alternate_cycles_and_depth_are_bounded() {
        let tmp = tempfile::tempdir().unwrap();
        let a = objects_dir(tmp.path(), "a");
        let b = objects_dir(tmp.path(), "b");
        for (from, to) in [(&a, &b), (&b, &a)] {
            fs::create_dir_all(from.join("info")).unwrap();
            fs::write(
                from.join("info").join("alternates"),
                format!("{}\n", to.display()),
            )
            .unwrap();
        }
        let in_b = ObjectDatabase::open(&b, OdbConfig::default())
            .unwrap()
            .insert(RawObject::blob(b"lives in b".to_vec()))
            .unwrap();

        let db = ObjectDatabase::open(&a, OdbConfig::default()).unwrap();
        assert_eq!(db.backend_count(), 2);
        assert_eq!(db.lookup(&in_b).unwrap().data, b"lives in b");

        let flat = OdbConfig {
            max_alternate_depth: 0,
            ..OdbConfig::default()
        };
        let db = ObjectDatabase::open(&a, flat).unwrap();
        assert_eq!(db.backend_count(), 1);
        assert!(db.lookup(&in_b).unwrap_err().is_not_found());
    }

    #[test]
    fn refresh_registers_and_drops_packs() {
        let tmp = tempfile::tempdir().unwrap();
        let objects = objects_dir(tmp.path(), "repo");
        let config = OdbConfig {
            refresh_on_miss: false,
            ..OdbConfig::default()
        };
        let db = ObjectDatabase::open(&objects, config.clone()).unwrap();

        let writer = ObjectDatabase::open(&objects, config).unwrap();
        let obj = RawObject::blob(b"written elsewhere".to_vec());
        let file = writer.write_pack(vec![obj.clone()]).unwrap();
        let id = obj.compute_id(SHA1);

        assert!(db.lookup(&id).unwrap_err().is_not_found());
        assert_eq!(db.refresh().unwrap(), 1);
        assert_eq!(db.refresh().unwrap(), 0);
        assert_eq!(db.lookup(&id).unwrap(), obj);

        fs::remove_file(&file.index_path).unwrap();
        fs::remove_file(&file.pack_path).unwrap();
        assert_eq!(db.refresh().unwrap(), 0);
        assert_eq!(db.pack_count(), 0);
    }

    #[test]
    fn damaged_pack_reports_corruption() {
        let tmp = tempfile::tempdir().unwrap();
        let objects = objects_dir(tmp.path(), "repo");
        let obj = RawObject::blob(text(50));
        let file = ObjectDatabase::open(&objects, OdbConfig::default())
            .unwrap()
            .write_pack(vec![obj.clone()])
            .unwrap();

        let pack = fs::OpenOptions::new()
            .write(true)
            .open(&file.pack_path)
            .unwrap();
        let len = pack.metadata().unwrap().len();
        pack.set_len(len - 1).unwrap();
        drop(pack);

        let db = ObjectDatabase::open(&objects, OdbConfig::default()).unwrap();
        let err = db.lookup(&obj.compute_id(SHA1)).unwrap_err();
        assert!(err.is_corruption(), "got {err:?}");
        assert!(!err.is_not_found());
    }

    #[test]
    fn open_missing_directory_is_io_error() {
        let tmp = tempfile::tempdir().unwrap();
        let err = ObjectDatabase::open(&tmp.path().join("absent"), OdbConfig::default())
            .unwrap_err();
        assert!(err.is_io(), "got {err:?}");
    }

    #[test]
    fn sha256_repository_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let objects = objects_dir(tmp.path(), "repo");
        let config = OdbConfig::from_toml_str("algorithm = \"sha256\"\n").unwrap();

        let db = ObjectDatabase::open(&objects, config.clone()).unwrap();
        let ids: Vec<ObjectId> = (0..5)
            .map(|i| db.insert(RawObject::blob(text(20 + i))).unwrap())
            .collect();
        assert!(ids.iter().all(|id| id.digest_len() == 32));
        db.repack(true).unwrap();
        drop(db);

        let db = ObjectDatabase::open(&objects, config).unwrap();
        for (i, id) in ids.iter().enumerate() {
            assert_eq!(db.lookup(id).unwrap().data, text(20 + i));
        }
    }

    #[test]
    fn concurrent_reads_under_small_window_budget() {
        let tmp = tempfile::tempdir().unwrap();
        let objects = objects_dir(tmp.path(), "repo");
        let objs: Vec<RawObject> = (0..40)
            .map(|i| {
                let mut data = text(60 + i);
                data.extend_from_slice(format!("variant {i}\n").as_bytes());
                RawObject::blob(data)
            })
            .collect();
        ObjectDatabase::open(&objects, OdbConfig::default())
            .unwrap()
            .write_pack(objs.clone())
            .unwrap();

        let config = OdbConfig {
            windows: WindowConfig {
                window_size: 4096,
                mapped_limit: 16 * 1024,
            },
            cache: CacheConfig {
                max_entries: 8,
                max_bytes: 64 * 1024,
            },
            ..OdbConfig::default()
        };
        let db = Arc::new(ObjectDatabase::open(&objects, config).unwrap());
        let objs = Arc::new(objs);

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let db = db.clone();
                let objs = objs.clone();
                std::thread::spawn(move || {
                    for round in 0..3 {
                        for (i, obj) in objs.iter().enumerate() {
                            if (i + t + round) % 2 == 0 {
                                let id = obj.compute_id(SHA1);
                                assert_eq!(&db.lookup(&id).unwrap(), obj);
                            }
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let stats = db.stats();
        assert!(stats.windows.peak_mapped_bytes <= 16 * 1024);
        assert!(stats.cache.evictions > 0);
        assert_eq!(stats.packs, 1);
    }
}
