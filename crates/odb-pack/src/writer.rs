use std::collections::HashSet;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use flate2::write::ZlibEncoder;
use flate2::Compression;
use odb_crypto::{ContentHasher, Digest};
use odb_store::RawObject;
use odb_types::{HashAlgorithm, ObjectId};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::delta;
use crate::entry::{write_frame_header, write_ofs_distance, OBJ_OFS_DELTA};
use crate::error::{PackError, PackResult};
use crate::index::PackIndex;
use crate::reader::{PACK_HEADER_LEN, PACK_MAGIC};

/// Settings of the pack write path.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PackWriterConfig {
    /// How many preceding objects of the same type are tried as delta bases.
    /// Zero disables delta compression.
    pub window: usize,
    /// Longest delta chain the writer will build.
    pub max_depth: usize,
    /// zlib level, 0-9.
    pub compression_level: u32,
}

impl Default for PackWriterConfig {
    fn default() -> Self {
        Self {
            window: 10,
            max_depth: 50,
            compression_level: 6,
        }
    }
}

/// Result of writing a pack file.
#[derive(Clone, Debug)]
pub struct PackFile {
    pub pack_path: PathBuf,
    pub index_path: PathBuf,
    pub object_count: usize,
    pub delta_count: usize,
    pub checksum: ObjectId,
}

/// Passes bytes through while keeping the running pack digest and length.
struct HashingWriter<W: Write> {
    inner: W,
    digest: Digest,
    written: u64,
}

impl<W: Write> HashingWriter<W> {
    fn new(inner: W, algorithm: HashAlgorithm) -> Self {
        Self {
            inner,
            digest: Digest::new(algorithm),
            written: 0,
        }
    }

    fn write_all(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.inner.write_all(data)?;
        self.digest.update(data);
        self.written += data.len() as u64;
        Ok(())
    }

    /// Append the trailer and hand back the sink.
    fn finish(mut self) -> std::io::Result<(W, ObjectId)> {
        let checksum = self.digest.finalize();
        self.inner.write_all(checksum.as_bytes())?;
        self.inner.flush()?;
        Ok((self.inner, checksum))
    }
}

/// Bookkeeping for an object already written in this pack.
struct Written {
    offset: u64,
    depth: usize,
}

/// Builds a pack file from a collection of objects.
///
/// Objects are written ordered by type and then by size, largest first, so
/// that each object is compared against similar, larger neighbours that were
/// already emitted and can serve as same-pack delta bases.
pub struct PackWriter {
    algorithm: HashAlgorithm,
    config: PackWriterConfig,
    objects: Vec<(ObjectId, RawObject)>,
    seen: HashSet<ObjectId>,
}

impl PackWriter {
    pub fn new(algorithm: HashAlgorithm, config: PackWriterConfig) -> Self {
        Self {
            algorithm,
            config,
            objects: Vec::new(),
            seen: HashSet::new(),
        }
    }

    /// Queue an object. Duplicates are written once.
    pub fn add(&mut self, object: RawObject) -> ObjectId {
        let id = ContentHasher::new(self.algorithm).address(object.kind, &object.data);
        if self.seen.insert(id) {
            self.objects.push((id, object));
        }
        id
    }

    /// Number of objects queued.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Returns true if empty.
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Write `pack-<checksum>.pack` and `.idx` into `pack_dir`.
    ///
    /// Both files are fully written and synced under temporary names in
    /// `pack_dir` before either is renamed. The pack is renamed first, so a
    /// reader that sees the index always finds its pack; if the index rename
    /// then fails, a pack this call created is removed again.
    pub fn write_to_dir(self, pack_dir: &Path) -> PackResult<PackFile> {
        std::fs::create_dir_all(pack_dir).map_err(|e| PackError::io(pack_dir, e))?;

        let temp = tempfile::Builder::new()
            .prefix("tmp_pack_")
            .tempfile_in(pack_dir)
            .map_err(|e| PackError::io(pack_dir, e))?;
        let temp_path = temp.path().to_path_buf();
        let (writer, index, delta_count) = self.write_pack(BufWriter::new(temp))?;
        let temp = writer
            .into_inner()
            .map_err(|e| PackError::io(&temp_path, e.into_error()))?;
        temp.as_file()
            .sync_all()
            .map_err(|e| PackError::io(&temp_path, e))?;

        let mut idx_temp = tempfile::Builder::new()
            .prefix("tmp_idx_")
            .tempfile_in(pack_dir)
            .map_err(|e| PackError::io(pack_dir, e))?;
        idx_temp
            .write_all(&index.to_bytes())
            .and_then(|()| idx_temp.as_file().sync_all())
            .map_err(|e| PackError::io(idx_temp.path(), e))?;

        let base = format!("pack-{}", index.pack_checksum.to_hex());
        let pack_path = pack_dir.join(format!("{base}.pack"));
        let index_path = pack_dir.join(format!("{base}.idx"));
        let pack_existed = pack_path.exists();
        temp.persist(&pack_path)
            .map_err(|e| PackError::io(&pack_path, e.error))?;
        if let Err(e) = idx_temp.persist(&index_path) {
            if !pack_existed {
                if let Err(cleanup) = std::fs::remove_file(&pack_path) {
                    warn!(
                        pack = %pack_path.display(),
                        error = %cleanup,
                        "failed to remove orphaned pack"
                    );
                }
            }
            return Err(PackError::io(&index_path, e.error));
        }

        info!(
            pack = %pack_path.display(),
            objects = index.object_count(),
            deltas = delta_count,
            "wrote pack"
        );
        Ok(PackFile {
            pack_path,
            index_path,
            object_count: index.object_count(),
            delta_count,
            checksum: index.pack_checksum,
        })
    }

    /// Build pack bytes and index in memory (no disk I/O).
    pub fn finish_to_bytes(self) -> PackResult<(Vec<u8>, PackIndex)> {
        let (bytes, index, _) = self.write_pack(Vec::new())?;
        Ok((bytes, index))
    }

    fn write_pack<W: Write>(mut self, sink: W) -> PackResult<(W, PackIndex, usize)> {
        let io_err = |e: std::io::Error| PackError::io("<pack stream>", e);
        let count = u32::try_from(self.objects.len()).map_err(|_| {
            PackError::corrupt(0, format!("{} objects do not fit a pack", self.objects.len()))
        })?;

        self.objects.sort_by(|(a_id, a), (b_id, b)| {
            a.kind
                .pack_code()
                .cmp(&b.kind.pack_code())
                .then(b.data.len().cmp(&a.data.len()))
                .then(a_id.cmp(b_id))
        });

        let mut out = HashingWriter::new(sink, self.algorithm);
        let mut header = Vec::with_capacity(PACK_HEADER_LEN as usize);
        header.extend_from_slice(&PACK_MAGIC);
        header.extend_from_slice(&2u32.to_be_bytes());
        header.extend_from_slice(&count.to_be_bytes());
        out.write_all(&header).map_err(io_err)?;

        let level = Compression::new(self.config.compression_level.min(9));
        let mut written: Vec<Written> = Vec::with_capacity(self.objects.len());
        let mut index_entries = Vec::with_capacity(self.objects.len());
        let mut delta_count = 0;

        for (i, (id, object)) in self.objects.iter().enumerate() {
            let offset = out.written;
            let mut frame = Vec::with_capacity(object.data.len() / 2 + 16);
            write_frame_header(&mut frame, object.kind.pack_code(), object.data.len() as u64);
            frame.extend_from_slice(&compress(&object.data, level)?);
            let mut depth = 0;

            if let Some((base, delta)) = self.best_delta(i, &written) {
                let mut delta_frame = Vec::with_capacity(delta.len() + 16);
                write_frame_header(&mut delta_frame, OBJ_OFS_DELTA, delta.len() as u64);
                write_ofs_distance(&mut delta_frame, offset - written[base].offset);
                delta_frame.extend_from_slice(&compress(&delta, level)?);
                if delta_frame.len() < frame.len() {
                    frame = delta_frame;
                    depth = written[base].depth + 1;
                    delta_count += 1;
                }
            }

            out.write_all(&frame).map_err(io_err)?;
            index_entries.push((*id, crc32fast::hash(&frame), offset));
            written.push(Written { offset, depth });
        }

        let (sink, checksum) = out.finish().map_err(io_err)?;
        debug!(objects = count, deltas = delta_count, "encoded pack stream");
        let index = PackIndex::build(self.algorithm, index_entries, checksum);
        Ok((sink, index, delta_count))
    }

    /// Pick the candidate among the preceding `window` objects of the same
    /// type that yields the smallest delta for object `i`.
    fn best_delta(&self, i: usize, written: &[Written]) -> Option<(usize, Vec<u8>)> {
        let target = &self.objects[i].1;
        if self.config.window == 0 || target.data.len() < 32 {
            return None;
        }
        let mut best: Option<(usize, Vec<u8>)> = None;
        for j in (i.saturating_sub(self.config.window)..i).rev() {
            let base = &self.objects[j].1;
            if base.kind != target.kind {
                break;
            }
            if written[j].depth >= self.config.max_depth {
                continue;
            }
            // sorted largest first, so base >= target; skip wildly different sizes
            if base.data.len() / 4 > target.data.len() {
                continue;
            }
            let delta = delta::encode(&base.data, &target.data);
            if delta.len() >= target.data.len() {
                continue;
            }
            if best.as_ref().map_or(true, |(_, d)| delta.len() < d.len()) {
                best = Some((j, delta));
            }
        }
        best
    }
}

fn compress(data: &[u8], level: Compression) -> PackResult<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len() / 2 + 16), level);
    encoder
        .write_all(data)
        .map_err(|e| PackError::io("<zlib>", e))?;
    encoder.finish().map_err(|e| PackError::io("<zlib>", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{parse_frame_header, PackObjectKind};
    use odb_types::ObjectType;

    fn text(n: usize) -> Vec<u8> {
        (0..n)
            .map(|i| format!("{i:05} lorem ipsum dolor sit amet\n"))
            .collect::<String>()
            .into_bytes()
    }

    fn frame_kind(pack: &[u8], index: &PackIndex, id: &ObjectId) -> PackObjectKind {
        let (offset, _) = index.lookup(id).unwrap();
        parse_frame_header(&pack[offset as usize..], offset, HashAlgorithm::Sha1)
            .unwrap()
            .kind
    }

    #[test]
    fn header_and_trailer_layout() {
        let mut writer = PackWriter::new(HashAlgorithm::Sha1, PackWriterConfig::default());
        writer.add(RawObject::blob(b"hello".to_vec()));
        let (pack, index) = writer.finish_to_bytes().unwrap();

        assert_eq!(&pack[..4], b"PACK");
        assert_eq!(&pack[4..8], &2u32.to_be_bytes());
        assert_eq!(&pack[8..12], &1u32.to_be_bytes());
        let body = &pack[..pack.len() - 20];
        assert_eq!(Digest::hash(HashAlgorithm::Sha1, body), index.pack_checksum);
        assert_eq!(&pack[pack.len() - 20..], index.pack_checksum.as_bytes());
    }

    #[test]
    fn duplicates_are_written_once() {
        let mut writer = PackWriter::new(HashAlgorithm::Sha1, PackWriterConfig::default());
        let a = writer.add(RawObject::blob(b"same".to_vec()));
        let b = writer.add(RawObject::blob(b"same".to_vec()));
        assert_eq!(a, b);
        assert_eq!(writer.len(), 1);
    }

    #[test]
    fn similar_objects_become_ofs_deltas() {
        let base = text(400);
        let mut edited = base[..base.len() - 100].to_vec();
        edited[50..60].copy_from_slice(b"0123456789");

        let mut writer = PackWriter::new(HashAlgorithm::Sha1, PackWriterConfig::default());
        let base_id = writer.add(RawObject::blob(base));
        let edited_id = writer.add(RawObject::blob(edited));
        let (pack, index) = writer.finish_to_bytes().unwrap();

        assert_eq!(frame_kind(&pack, &index, &base_id), PackObjectKind::Full(ObjectType::Blob));
        let (base_offset, _) = index.lookup(&base_id).unwrap();
        assert_eq!(
            frame_kind(&pack, &index, &edited_id),
            PackObjectKind::OfsDelta { base_offset }
        );
    }

    #[test]
    fn zero_window_disables_deltas() {
        let config = PackWriterConfig {
            window: 0,
            ..PackWriterConfig::default()
        };
        let mut writer = PackWriter::new(HashAlgorithm::Sha1, config);
        let base = text(200);
        writer.add(RawObject::blob(base.clone()));
        let id = writer.add(RawObject::blob(base[..base.len() - 10].to_vec()));
        let (pack, index) = writer.finish_to_bytes().unwrap();
        assert!(!frame_kind(&pack, &index, &id).is_delta());
    }

    #[test]
    fn different_types_never_delta_against_each_other() {
        let data = text(200);
        let mut writer = PackWriter::new(HashAlgorithm::Sha1, PackWriterConfig::default());
        writer.add(RawObject::blob(data.clone()));
        let tree = writer.add(RawObject::new(ObjectType::Tree, data[..data.len() - 5].to_vec()));
        let (pack, index) = writer.finish_to_bytes().unwrap();
        assert_eq!(frame_kind(&pack, &index, &tree), PackObjectKind::Full(ObjectType::Tree));
    }

    #[test]
    fn crc_covers_whole_frame() {
        let mut writer = PackWriter::new(HashAlgorithm::Sha1, PackWriterConfig::default());
        let a = writer.add(RawObject::blob(b"first".to_vec()));
        let b = writer.add(RawObject::blob(b"second object".to_vec()));
        let (pack, index) = writer.finish_to_bytes().unwrap();

        let mut offsets: Vec<u64> = index.offsets.clone();
        offsets.sort_unstable();
        let end_of = |offset: u64| {
            offsets
                .iter()
                .copied()
                .find(|&o| o > offset)
                .unwrap_or(pack.len() as u64 - 20)
        };
        for id in [a, b] {
            let (offset, crc) = index.lookup(&id).unwrap();
            let frame = &pack[offset as usize..end_of(offset) as usize];
            assert_eq!(crc32fast::hash(frame), crc);
        }
    }

    #[test]
    fn write_to_dir_names_files_by_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let pack_dir = dir.path().join("pack");
        let mut writer = PackWriter::new(HashAlgorithm::Sha1, PackWriterConfig::default());
        writer.add(RawObject::blob(b"on disk".to_vec()));
        let file = writer.write_to_dir(&pack_dir).unwrap();

        let hex = file.checksum.to_hex();
        assert_eq!(file.pack_path, pack_dir.join(format!("pack-{hex}.pack")));
        assert_eq!(file.index_path, pack_dir.join(format!("pack-{hex}.idx")));
        assert!(file.pack_path.exists() && file.index_path.exists());

        let leftovers: Vec<_> = std::fs::read_dir(&pack_dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("tmp_"))
            .collect();
        assert!(leftovers.is_empty());

        let index = PackIndex::load(&file.index_path, HashAlgorithm::Sha1).unwrap();
        assert_eq!(index.pack_checksum, file.checksum);
    }

    #[test]
    fn failed_index_rename_leaves_no_pack_behind() {
        let objects = || {
            let mut writer = PackWriter::new(HashAlgorithm::Sha1, PackWriterConfig::default());
            writer.add(RawObject::blob(b"never published".to_vec()));
            writer
        };
        let (_, index) = objects().finish_to_bytes().unwrap();
        let hex = index.pack_checksum.to_hex();

        let dir = tempfile::tempdir().unwrap();
        let pack_dir = dir.path().join("pack");
        // a directory squatting on the index name makes the final rename fail
        std::fs::create_dir_all(pack_dir.join(format!("pack-{hex}.idx"))).unwrap();

        let err = objects().write_to_dir(&pack_dir).unwrap_err();
        assert!(matches!(err, PackError::Io { .. }), "got {err:?}");

        let names: Vec<String> = std::fs::read_dir(&pack_dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec![format!("pack-{hex}.idx")]);
    }
}
