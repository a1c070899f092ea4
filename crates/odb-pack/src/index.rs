use std::path::Path;

use odb_crypto::Digest;
use odb_types::{HashAlgorithm, ObjectId};

use crate::error::{PackError, PackResult};

/// Magic bytes of a version 2 pack index.
pub const INDEX_MAGIC: [u8; 4] = [0xff, b't', b'O', b'c'];
pub const INDEX_VERSION: u32 = 2;

/// Offsets above this go to the 64-bit extension table.
const MAX_SMALL_OFFSET: u64 = 0x7fff_ffff;
const LARGE_OFFSET_FLAG: u32 = 0x8000_0000;

/// Pack index for fast random-access lookups.
///
/// Layout is git's pack index v2:
/// - Magic and version
/// - Fan-out table: 256 entries counting objects with first byte <= index
/// - Sorted ObjectId array
/// - CRC32 array (parallel)
/// - 31-bit offset array (parallel); MSB set means "see the 64-bit table"
/// - 64-bit offset table
/// - Pack checksum, then a checksum of every preceding index byte
#[derive(Clone, Debug)]
pub struct PackIndex {
    pub algorithm: HashAlgorithm,
    pub fan_out: [u32; 256],
    pub object_ids: Vec<ObjectId>,
    pub crc32s: Vec<u32>,
    pub offsets: Vec<u64>,
    pub pack_checksum: ObjectId,
}

fn be_u32(data: &[u8], pos: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&data[pos..pos + 4]);
    u32::from_be_bytes(raw)
}

fn be_u64(data: &[u8], pos: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&data[pos..pos + 8]);
    u64::from_be_bytes(raw)
}

fn fan_out_for(ids: &[ObjectId]) -> [u32; 256] {
    let mut fan_out = [0u32; 256];
    for id in ids {
        fan_out[id.first_byte() as usize] += 1;
    }
    let mut total = 0u32;
    for slot in fan_out.iter_mut() {
        total += *slot;
        *slot = total;
    }
    fan_out
}

impl PackIndex {
    /// Build an index from (id, crc32, offset) entries and a pack checksum.
    pub fn build(
        algorithm: HashAlgorithm,
        mut entries: Vec<(ObjectId, u32, u64)>,
        pack_checksum: ObjectId,
    ) -> Self {
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries.dedup_by(|a, b| a.0 == b.0);

        let mut object_ids = Vec::with_capacity(entries.len());
        let mut crc32s = Vec::with_capacity(entries.len());
        let mut offsets = Vec::with_capacity(entries.len());
        for (id, crc, offset) in entries {
            object_ids.push(id);
            crc32s.push(crc);
            offsets.push(offset);
        }

        Self {
            algorithm,
            fan_out: fan_out_for(&object_ids),
            object_ids,
            crc32s,
            offsets,
            pack_checksum,
        }
    }

    /// Position of `id` in the sorted tables.
    pub fn position(&self, id: &ObjectId) -> Option<usize> {
        let (start, end) = self.bucket(id.first_byte());
        self.object_ids[start..end]
            .binary_search(id)
            .ok()
            .map(|pos| start + pos)
    }

    /// Look up an object's (offset, crc32) by ID.
    pub fn lookup(&self, id: &ObjectId) -> Option<(u64, u32)> {
        self.position(id)
            .map(|idx| (self.offsets[idx], self.crc32s[idx]))
    }

    /// Total object count.
    pub fn object_count(&self) -> usize {
        self.object_ids.len()
    }

    /// Check if an object exists.
    pub fn contains(&self, id: &ObjectId) -> bool {
        self.position(id).is_some()
    }

    /// Ids whose hex form starts with `prefix` (at least two hex digits).
    pub fn prefix_matches<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = &'a ObjectId> + 'a {
        let range = prefix
            .get(..2)
            .and_then(|lead| u8::from_str_radix(lead, 16).ok())
            .map(|first| self.bucket(first))
            .unwrap_or((0, 0));
        self.object_ids[range.0..range.1]
            .iter()
            .filter(move |id| id.matches_hex_prefix(prefix))
    }

    fn bucket(&self, first_byte: u8) -> (usize, usize) {
        let first = first_byte as usize;
        let start = if first == 0 {
            0
        } else {
            self.fan_out[first - 1] as usize
        };
        (start, self.fan_out[first] as usize)
    }

    /// Serialize to the on-disk v2 layout, including the trailing checksum.
    pub fn to_bytes(&self) -> Vec<u8> {
        let n = self.object_ids.len();
        let hash_len = self.algorithm.digest_len();
        let mut buf = Vec::with_capacity(8 + 1024 + n * (hash_len + 8) + 2 * hash_len);
        buf.extend_from_slice(&INDEX_MAGIC);
        buf.extend_from_slice(&INDEX_VERSION.to_be_bytes());
        for &count in &self.fan_out {
            buf.extend_from_slice(&count.to_be_bytes());
        }
        for id in &self.object_ids {
            buf.extend_from_slice(id.as_bytes());
        }
        for &crc in &self.crc32s {
            buf.extend_from_slice(&crc.to_be_bytes());
        }
        let mut large = Vec::new();
        for &offset in &self.offsets {
            if offset > MAX_SMALL_OFFSET {
                let slot = LARGE_OFFSET_FLAG | large.len() as u32;
                buf.extend_from_slice(&slot.to_be_bytes());
                large.push(offset);
            } else {
                buf.extend_from_slice(&(offset as u32).to_be_bytes());
            }
        }
        for offset in large {
            buf.extend_from_slice(&offset.to_be_bytes());
        }
        buf.extend_from_slice(self.pack_checksum.as_bytes());
        let checksum = Digest::hash(self.algorithm, &buf);
        buf.extend_from_slice(checksum.as_bytes());
        buf
    }

    /// Parse and validate the on-disk v2 layout.
    pub fn from_bytes(data: &[u8], algorithm: HashAlgorithm) -> PackResult<Self> {
        let hash_len = algorithm.digest_len();
        if data.len() < 8 {
            return Err(PackError::IndexCorrupted("too short".into()));
        }
        if data[0..4] != INDEX_MAGIC {
            return Err(PackError::InvalidMagic {
                expected: "\\377tOc".into(),
                actual: String::from_utf8_lossy(&data[0..4]).into(),
            });
        }
        let version = be_u32(data, 4);
        if version != INDEX_VERSION {
            return Err(PackError::UnsupportedVersion(version));
        }
        if data.len() < 8 + 1024 + 2 * hash_len {
            return Err(PackError::IndexCorrupted("fan-out truncated".into()));
        }

        let body_end = data.len() - hash_len;
        let expected = Digest::hash(algorithm, &data[..body_end]);
        if expected.as_bytes() != &data[body_end..] {
            return Err(PackError::ChecksumMismatch {
                expected: expected.to_hex(),
                actual: to_hex(&data[body_end..]),
            });
        }

        let mut pos = 8;
        let mut fan_out = [0u32; 256];
        for entry in &mut fan_out {
            *entry = be_u32(data, pos);
            pos += 4;
        }
        if fan_out.windows(2).any(|w| w[0] > w[1]) {
            return Err(PackError::IndexCorrupted("fan-out is not monotonic".into()));
        }

        let count = fan_out[255] as usize;
        let fixed = count
            .checked_mul(hash_len + 8)
            .and_then(|n| n.checked_add(pos + 2 * hash_len))
            .ok_or_else(|| PackError::IndexCorrupted("object count overflows".into()))?;
        if data.len() < fixed {
            return Err(PackError::IndexCorrupted("tables truncated".into()));
        }

        let mut object_ids = Vec::with_capacity(count);
        for _ in 0..count {
            let id = ObjectId::from_slice(&data[pos..pos + hash_len])
                .map_err(|e| PackError::IndexCorrupted(e.to_string()))?;
            object_ids.push(id);
            pos += hash_len;
        }
        if object_ids.windows(2).any(|w| w[0] >= w[1]) {
            return Err(PackError::IndexCorrupted("object ids are not sorted".into()));
        }
        if fan_out_for(&object_ids) != fan_out {
            return Err(PackError::IndexCorrupted("fan-out does not match ids".into()));
        }

        let mut crc32s = Vec::with_capacity(count);
        for _ in 0..count {
            crc32s.push(be_u32(data, pos));
            pos += 4;
        }

        let small_start = pos;
        let large_start = small_start + count * 4;
        let large_end = data.len() - 2 * hash_len;
        if (large_end - large_start) % 8 != 0 {
            return Err(PackError::IndexCorrupted("ragged 64-bit offset table".into()));
        }
        let large_count = (large_end - large_start) / 8;

        let mut offsets = Vec::with_capacity(count);
        for i in 0..count {
            let raw = be_u32(data, small_start + i * 4);
            if raw & LARGE_OFFSET_FLAG == 0 {
                offsets.push(u64::from(raw));
                continue;
            }
            let slot = (raw & !LARGE_OFFSET_FLAG) as usize;
            if slot >= large_count {
                return Err(PackError::IndexCorrupted(format!(
                    "64-bit offset slot {slot} out of range"
                )));
            }
            offsets.push(be_u64(data, large_start + slot * 8));
        }

        let pack_checksum = ObjectId::from_slice(&data[large_end..body_end])
            .map_err(|e| PackError::IndexCorrupted(e.to_string()))?;

        Ok(Self {
            algorithm,
            fan_out,
            object_ids,
            crc32s,
            offsets,
            pack_checksum,
        })
    }

    /// Read and parse an index file.
    pub fn load(path: &Path, algorithm: HashAlgorithm) -> PackResult<Self> {
        let data = std::fs::read(path).map_err(|e| PackError::io(path, e))?;
        Self::from_bytes(&data, algorithm)
    }
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
