use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use flate2::{Decompress, FlushDecompress, Status};
use odb_crypto::{ContentHasher, Digest};
use odb_store::{ObjectBackend, ObjectCache, ObjectHeader, RawObject, StoreError, StoreResult};
use odb_types::{HashAlgorithm, ObjectId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::delta::{self, delta_sizes};
use crate::entry::{parse_frame_header, FrameHeader, PackObjectKind, MAX_FRAME_HEADER};
use crate::error::{PackError, PackResult};
use crate::index::PackIndex;
use crate::window::{PackFileId, WindowManager};

pub const PACK_MAGIC: [u8; 4] = *b"PACK";
pub const PACK_HEADER_LEN: u64 = 12;

/// Upper bound on what the inflater reserves ahead of time.
const MAX_PREALLOC: usize = 16 * 1024 * 1024;
/// Inflated bytes needed to read both sizes of a delta header.
const DELTA_HEADER_PREFIX: usize = 20;

/// Read-side settings of a pack store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PackReadConfig {
    /// Longest delta chain that will be resolved.
    pub max_delta_depth: usize,
    /// Check each frame's CRC32 against the index before inflating it.
    pub verify_crc: bool,
}

impl Default for PackReadConfig {
    fn default() -> Self {
        Self {
            max_delta_depth: 50,
            verify_crc: true,
        }
    }
}

/// Source of ref-delta bases that are not in this pack (thin packs).
pub trait BaseResolver: Send + Sync {
    /// Look up `id` in other backends. `depth` is the delta depth already
    /// consumed by the caller and must be passed on to nested pack reads.
    fn resolve_base(&self, id: &ObjectId, depth: usize) -> StoreResult<Option<RawObject>>;
}

/// Resolver for self-contained packs.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoExternalBases;

impl BaseResolver for NoExternalBases {
    fn resolve_base(&self, _id: &ObjectId, _depth: usize) -> StoreResult<Option<RawObject>> {
        Ok(None)
    }
}

enum BaseRef {
    Offset(u64),
    Id(ObjectId),
}

/// Pack file state established on first access.
#[derive(Clone, Copy, Debug)]
struct OpenPack {
    file: PackFileId,
    /// Offset of the trailer; frames live in `[12, data_end)`.
    data_end: u64,
}

/// Outcome of [`PackStore::verify`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VerifyReport {
    pub objects: usize,
    pub deltas: usize,
}

/// Reads objects from a pack file using its index for random access.
///
/// The index is loaded when the store is opened. The pack itself is opened
/// through the shared [`WindowManager`] on first access, at which point its
/// header and trailer are checked against the index.
pub struct PackStore {
    pack_path: PathBuf,
    index_path: PathBuf,
    index: PackIndex,
    /// `(offset, index position)` sorted by offset.
    by_offset: Vec<(u64, usize)>,
    windows: Arc<WindowManager>,
    cache: Option<Arc<ObjectCache>>,
    config: PackReadConfig,
    opened: Mutex<Option<OpenPack>>,
}

impl PackStore {
    /// Open the pack described by `index_path` (`pack-*.idx`); the pack file
    /// is its sibling with a `.pack` extension.
    pub fn open(
        index_path: &Path,
        algorithm: HashAlgorithm,
        windows: Arc<WindowManager>,
        cache: Option<Arc<ObjectCache>>,
        config: PackReadConfig,
    ) -> PackResult<Self> {
        let index = PackIndex::load(index_path, algorithm)?;
        let mut by_offset: Vec<(u64, usize)> = index
            .offsets
            .iter()
            .enumerate()
            .map(|(pos, &offset)| (offset, pos))
            .collect();
        by_offset.sort_unstable();
        if let Some(&(first, _)) = by_offset.first() {
            if first < PACK_HEADER_LEN {
                return Err(PackError::IndexCorrupted(format!(
                    "entry offset {first} inside pack header"
                )));
            }
        }
        if by_offset.windows(2).any(|w| w[0].0 == w[1].0) {
            return Err(PackError::IndexCorrupted("duplicate entry offsets".into()));
        }

        let pack_path = index_path.with_extension("pack");
        debug!(
            pack = %pack_path.display(),
            objects = index.object_count(),
            "opened pack index"
        );
        Ok(Self {
            pack_path,
            index_path: index_path.to_path_buf(),
            index,
            by_offset,
            windows,
            cache,
            config,
            opened: Mutex::new(None),
        })
    }

    pub fn pack_path(&self) -> &Path {
        &self.pack_path
    }

    pub fn index_path(&self) -> &Path {
        &self.index_path
    }

    /// Access the index.
    pub fn index(&self) -> &PackIndex {
        &self.index
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.index.algorithm
    }

    /// Object count.
    pub fn object_count(&self) -> usize {
        self.index.object_count()
    }

    /// Check containment.
    pub fn contains(&self, id: &ObjectId) -> bool {
        self.index.contains(id)
    }

    /// Read an object, resolving thin-pack bases through `resolver`.
    ///
    /// `depth` is the delta depth already consumed by an enclosing read.
    pub fn read_with(
        &self,
        id: &ObjectId,
        resolver: &dyn BaseResolver,
        depth: usize,
    ) -> StoreResult<Option<RawObject>> {
        // the cache is shared with other backends; only answer for our ids
        let Some(pos) = self.index.position(id) else {
            return Ok(None);
        };
        if let Some(obj) = self.cache.as_ref().and_then(|c| c.get(id)) {
            return Ok(Some(obj));
        }
        let obj = self
            .resolve_at(self.index.offsets[pos], resolver, depth)
            .map_err(|e| self.store_error(e))?;
        self.remember(id, &obj);
        Ok(Some(obj))
    }

    /// Type and size of an object without applying its delta chain.
    pub fn read_header_with(
        &self,
        id: &ObjectId,
        resolver: &dyn BaseResolver,
        depth: usize,
    ) -> StoreResult<Option<ObjectHeader>> {
        let Some(pos) = self.index.position(id) else {
            return Ok(None);
        };
        if let Some(obj) = self.cache.as_ref().and_then(|c| c.get(id)) {
            return Ok(Some(obj.header()));
        }
        self.header_at(self.index.offsets[pos], resolver, depth)
            .map(Some)
            .map_err(|e| self.store_error(e))
    }

    /// Ids in this pack whose hex form starts with `prefix`.
    pub fn resolve_prefix(&self, prefix: &str) -> StoreResult<Option<ObjectId>> {
        let mut matches = self.index.prefix_matches(prefix);
        let first = matches.next().copied();
        if matches.next().is_some() {
            return Err(StoreError::Ambiguous(prefix.to_string()));
        }
        Ok(first)
    }

    /// Check the whole pack: trailer digest, every frame CRC and every id.
    pub fn verify(&self, resolver: &dyn BaseResolver) -> StoreResult<VerifyReport> {
        self.verify_inner(resolver).map_err(|e| self.store_error(e))
    }

    fn verify_inner(&self, resolver: &dyn BaseResolver) -> PackResult<VerifyReport> {
        let open = self.opened()?;

        let mut digest = Digest::new(self.algorithm());
        let mut pos = 0u64;
        while pos < open.data_end {
            let len = self.chunk_len(pos, open.data_end);
            let view = self.windows.view(open.file, pos, len)?;
            digest.update(&view);
            pos += len as u64;
        }
        let actual = digest.finalize();
        if actual != self.index.pack_checksum {
            return Err(PackError::ChecksumMismatch {
                expected: self.index.pack_checksum.to_hex(),
                actual: actual.to_hex(),
            });
        }

        let hasher = ContentHasher::new(self.algorithm());
        let mut report = VerifyReport::default();
        for (i, &(offset, pos)) in self.by_offset.iter().enumerate() {
            let end = self
                .by_offset
                .get(i + 1)
                .map_or(open.data_end, |&(next, _)| next);
            let actual_crc = self.crc_of_range(open, offset, end)?;
            if actual_crc != self.index.crc32s[pos] {
                return Err(PackError::CrcMismatch {
                    offset,
                    expected: self.index.crc32s[pos],
                    actual: actual_crc,
                });
            }

            let header = self.frame_header(open, offset)?;
            if header.kind.is_delta() {
                report.deltas += 1;
            }
            let obj = self.resolve_at(offset, resolver, 0)?;
            let id = self.index.object_ids[pos];
            let computed = hasher.address(obj.kind, &obj.data);
            if computed != id {
                return Err(PackError::Store(StoreError::HashMismatch { id, computed }));
            }
            report.objects += 1;
        }
        debug!(pack = %self.pack_path.display(), objects = report.objects, "verified pack");
        Ok(report)
    }

    fn crc_of_range(&self, open: OpenPack, start: u64, end: u64) -> PackResult<u32> {
        let mut crc = crc32fast::Hasher::new();
        let mut pos = start;
        while pos < end {
            let len = self.chunk_len(pos, end);
            let view = self.windows.view(open.file, pos, len)?;
            crc.update(&view);
            pos += len as u64;
        }
        Ok(crc.finalize())
    }

    /// Length of the next sequential read from `pos`, stopping at the next
    /// window boundary so each read is served by a single window.
    fn chunk_len(&self, pos: u64, end: u64) -> usize {
        let config = self.windows.config();
        let step = config.window_size.min(config.mapped_limit).max(1);
        (step - pos % step).min(end - pos) as usize
    }

    fn store_error(&self, err: PackError) -> StoreError {
        let err = err.into_store_error(&self.pack_path);
        if err.is_corruption() {
            warn!(pack = %self.pack_path.display(), error = %err, "pack read failed");
        }
        err
    }

    fn remember(&self, id: &ObjectId, obj: &RawObject) {
        if let Some(cache) = &self.cache {
            if let Err(e) = cache.insert(*id, obj.clone()) {
                debug!(id = %id.short_hex(), error = %e, "object not cached");
            }
        }
    }

    /// Open the pack file and check it against the index, once.
    fn opened(&self) -> PackResult<OpenPack> {
        let mut slot = self.opened.lock();
        if let Some(open) = *slot {
            return Ok(open);
        }

        let (file, len) = self.windows.open_file(&self.pack_path)?;
        match self.validate(file, len) {
            Ok(open) => {
                *slot = Some(open);
                Ok(open)
            }
            Err(e) => {
                self.windows.close_file(file);
                Err(e)
            }
        }
    }

    fn validate(&self, file: PackFileId, len: u64) -> PackResult<OpenPack> {
        let hash_len = self.algorithm().digest_len() as u64;
        if len < PACK_HEADER_LEN + hash_len {
            return Err(PackError::corrupt(0, format!("pack is only {len} bytes")));
        }

        let header = self.windows.view(file, 0, PACK_HEADER_LEN as usize)?;
        if header[0..4] != PACK_MAGIC {
            return Err(PackError::InvalidMagic {
                expected: "PACK".into(),
                actual: String::from_utf8_lossy(&header[0..4]).into(),
            });
        }
        let version = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
        if version != 2 && version != 3 {
            return Err(PackError::UnsupportedVersion(version));
        }
        let count = u32::from_be_bytes([header[8], header[9], header[10], header[11]]);
        if count as usize != self.index.object_count() {
            return Err(PackError::corrupt(
                8,
                format!(
                    "pack holds {count} objects but index lists {}",
                    self.index.object_count()
                ),
            ));
        }

        let data_end = len - hash_len;
        let trailer = self.windows.view(file, data_end, hash_len as usize)?;
        if &trailer[..] != self.index.pack_checksum.as_bytes() {
            return Err(PackError::ChecksumMismatch {
                expected: self.index.pack_checksum.to_hex(),
                actual: trailer.iter().map(|b| format!("{b:02x}")).collect(),
            });
        }
        if let Some(&(last, _)) = self.by_offset.last() {
            if last >= data_end {
                return Err(PackError::IndexCorrupted(format!(
                    "entry offset {last} beyond pack data"
                )));
            }
        }
        Ok(OpenPack { file, data_end })
    }

    fn index_position_at(&self, offset: u64) -> Option<usize> {
        self.by_offset
            .binary_search_by_key(&offset, |&(o, _)| o)
            .ok()
            .map(|i| self.by_offset[i].1)
    }

    fn frame_header(&self, open: OpenPack, offset: u64) -> PackResult<FrameHeader> {
        if offset < PACK_HEADER_LEN || offset >= open.data_end {
            return Err(PackError::corrupt(offset, "entry offset outside pack data"));
        }
        let avail = (open.data_end - offset).min(MAX_FRAME_HEADER as u64) as usize;
        let view = self.windows.view(open.file, offset, avail)?;
        parse_frame_header(&view, offset, self.algorithm())
    }

    /// Inflate the payload of the frame at `offset`.
    ///
    /// With `limit` set, stops once that many bytes are out and skips the
    /// size and CRC checks.
    fn inflate(
        &self,
        open: OpenPack,
        offset: u64,
        header: &FrameHeader,
        limit: Option<usize>,
    ) -> PackResult<Vec<u8>> {
        let declared = usize::try_from(header.size)
            .map_err(|_| PackError::corrupt(offset, "object too large for this platform"))?;
        let expected_crc = match limit {
            None if self.config.verify_crc => self
                .index_position_at(offset)
                .map(|pos| self.index.crc32s[pos]),
            _ => None,
        };
        let mut crc = expected_crc.map(|_| crc32fast::Hasher::new());
        if let Some(crc) = crc.as_mut() {
            let raw = self.windows.view(open.file, offset, header.header_len)?;
            crc.update(&raw);
        }

        let inflate_err = |reason: String| PackError::Inflate { offset, reason };
        let mut de = Decompress::new(true);
        let mut out = Vec::with_capacity(declared.min(limit.unwrap_or(MAX_PREALLOC)).min(MAX_PREALLOC));
        let mut buf = vec![0u8; 32 * 1024];
        let mut pos = offset + header.header_len as u64;

        loop {
            if pos >= open.data_end {
                return Err(PackError::corrupt(offset, "compressed data runs past end of pack"));
            }
            let len = self.chunk_len(pos, open.data_end);
            let view = self.windows.view(open.file, pos, len)?;

            let mut in_pos = 0;
            let finished = loop {
                let before_in = de.total_in();
                let before_out = de.total_out();
                let status = de
                    .decompress(&view[in_pos..], &mut buf, FlushDecompress::None)
                    .map_err(|e| inflate_err(e.to_string()))?;
                let consumed = (de.total_in() - before_in) as usize;
                let produced = (de.total_out() - before_out) as usize;
                in_pos += consumed;

                if out.len() + produced > declared {
                    return Err(PackError::corrupt(
                        offset,
                        format!("inflates beyond declared size {declared}"),
                    ));
                }
                out.extend_from_slice(&buf[..produced]);
                if limit.is_some_and(|l| out.len() >= l) {
                    return Ok(out);
                }

                match status {
                    Status::StreamEnd => break true,
                    Status::Ok | Status::BufError => {
                        if consumed == 0 && produced == 0 {
                            if in_pos < view.len() {
                                return Err(inflate_err("inflater stalled".into()));
                            }
                            break false;
                        }
                    }
                }
            };

            if let Some(crc) = crc.as_mut() {
                crc.update(&view[..in_pos]);
            }
            pos += in_pos as u64;
            if finished {
                break;
            }
        }

        if out.len() != declared {
            return Err(PackError::corrupt(
                offset,
                format!("declared size {declared} but inflated {} bytes", out.len()),
            ));
        }
        if let (Some(expected), Some(crc)) = (expected_crc, crc) {
            let actual = crc.finalize();
            if actual != expected {
                return Err(PackError::CrcMismatch {
                    offset,
                    expected,
                    actual,
                });
            }
        }
        Ok(out)
    }

    fn cached_at(&self, offset: u64) -> Option<RawObject> {
        let cache = self.cache.as_ref()?;
        let pos = self.index_position_at(offset)?;
        cache.get(&self.index.object_ids[pos])
    }

    /// Reconstruct the object at `offset`.
    ///
    /// Walks base links onto an explicit stack until a full object (or a
    /// cached one) is reached, then applies the deltas outward.
    fn resolve_at(
        &self,
        offset: u64,
        resolver: &dyn BaseResolver,
        depth: usize,
    ) -> PackResult<RawObject> {
        let open = self.opened()?;
        let limit = self.config.max_delta_depth;
        let mut chain: Vec<(u64, Vec<u8>)> = Vec::new();
        let mut seen = HashSet::new();
        let mut current = offset;

        let base = loop {
            if !seen.insert(current) {
                return Err(PackError::DeltaCycle { offset: current });
            }
            let header = self.frame_header(open, current)?;
            let base_ref = match header.kind {
                PackObjectKind::Full(kind) => {
                    break RawObject::new(kind, self.inflate(open, current, &header, None)?);
                }
                PackObjectKind::OfsDelta { base_offset } => BaseRef::Offset(base_offset),
                PackObjectKind::RefDelta { base } => BaseRef::Id(base),
            };

            if depth + chain.len() >= limit {
                return Err(PackError::DeltaChainTooDeep { offset, limit });
            }
            chain.push((current, self.inflate(open, current, &header, None)?));

            match base_ref {
                BaseRef::Offset(base_offset) => {
                    if let Some(obj) = self.cached_at(base_offset) {
                        break obj;
                    }
                    current = base_offset;
                }
                BaseRef::Id(base) => {
                    if let Some(obj) = self.cache.as_ref().and_then(|c| c.get(&base)) {
                        break obj;
                    }
                    if let Some(pos) = self.index.position(&base) {
                        current = self.index.offsets[pos];
                        continue;
                    }
                    match resolver.resolve_base(&base, depth + chain.len())? {
                        Some(obj) => break obj,
                        None => return Err(PackError::DeltaBaseNotFound(base)),
                    }
                }
            }
        };

        let mut obj = base;
        while let Some((delta_offset, delta)) = chain.pop() {
            let data = delta::apply(&obj.data, &delta).map_err(|source| PackError::Delta {
                offset: delta_offset,
                source,
            })?;
            obj = RawObject::new(obj.kind, data);
            // intermediate bases are likely to be asked for again
            if !chain.is_empty() {
                if let Some(pos) = self.index_position_at(delta_offset) {
                    self.remember(&self.index.object_ids[pos], &obj);
                }
            }
        }
        Ok(obj)
    }

    /// Header of the object at `offset`: the size comes from the outermost
    /// frame, the type from the end of the chain.
    fn header_at(
        &self,
        offset: u64,
        resolver: &dyn BaseResolver,
        depth: usize,
    ) -> PackResult<ObjectHeader> {
        let open = self.opened()?;
        let limit = self.config.max_delta_depth;
        let mut size: Option<u64> = None;
        let mut seen = HashSet::new();
        let mut current = offset;
        let mut steps = 0usize;

        loop {
            if !seen.insert(current) {
                return Err(PackError::DeltaCycle { offset: current });
            }
            let header = self.frame_header(open, current)?;
            if size.is_none() && header.kind.is_delta() {
                let prefix = self.inflate(open, current, &header, Some(DELTA_HEADER_PREFIX))?;
                let (_, target) = delta_sizes(&prefix).map_err(|source| PackError::Delta {
                    offset: current,
                    source,
                })?;
                size = Some(target);
            }
            let base_ref = match header.kind {
                PackObjectKind::Full(kind) => {
                    return Ok(ObjectHeader {
                        kind,
                        size: size.unwrap_or(header.size),
                    })
                }
                PackObjectKind::OfsDelta { base_offset } => BaseRef::Offset(base_offset),
                PackObjectKind::RefDelta { base } => BaseRef::Id(base),
            };
            if depth + steps >= limit {
                return Err(PackError::DeltaChainTooDeep { offset, limit });
            }
            steps += 1;

            let base_id = match base_ref {
                BaseRef::Offset(base_offset) => {
                    current = base_offset;
                    continue;
                }
                BaseRef::Id(base) => base,
            };
            if let Some(pos) = self.index.position(&base_id) {
                current = self.index.offsets[pos];
                continue;
            }
            let obj = resolver
                .resolve_base(&base_id, depth + steps)?
                .ok_or(PackError::DeltaBaseNotFound(base_id))?;
            return Ok(ObjectHeader {
                kind: obj.kind,
                size: size.unwrap_or(obj.len() as u64),
            });
        }
    }
}

impl ObjectBackend for PackStore {
    fn read(&self, id: &ObjectId) -> StoreResult<Option<RawObject>> {
        self.read_with(id, &NoExternalBases, 0)
    }

    fn read_header(&self, id: &ObjectId) -> StoreResult<Option<ObjectHeader>> {
        self.read_header_with(id, &NoExternalBases, 0)
    }

    fn exists(&self, id: &ObjectId) -> StoreResult<bool> {
        Ok(self.contains(id))
    }

    fn for_each_id(&self, f: &mut dyn FnMut(&ObjectId) -> StoreResult<()>) -> StoreResult<()> {
        for id in &self.index.object_ids {
            f(id)?;
        }
        Ok(())
    }

    fn resolve_prefix(&self, prefix: &str) -> StoreResult<Option<ObjectId>> {
        PackStore::resolve_prefix(self, prefix)
    }
}

impl Drop for PackStore {
    fn drop(&mut self) {
        if let Some(open) = self.opened.get_mut().take() {
            self.windows.close_file(open.file);
        }
    }
}

impl std::fmt::Debug for PackStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackStore")
            .field("pack_path", &self.pack_path)
            .field("objects", &self.index.object_count())
            .finish()
    }
}
