use odb_types::{HashAlgorithm, ObjectId, ObjectType};

use crate::error::{PackError, PackResult};

/// Type code of a delta against an earlier entry in the same pack.
pub const OBJ_OFS_DELTA: u8 = 6;
/// Type code of a delta against an object named by id.
pub const OBJ_REF_DELTA: u8 = 7;

/// Upper bound on the encoded frame header: ten type/size bytes followed by
/// the widest base reference (a 32-byte id).
pub const MAX_FRAME_HEADER: usize = 10 + 32;

/// Type tag of a pack frame, with its delta base where there is one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PackObjectKind {
    /// Complete object with its full data.
    Full(ObjectType),
    /// Delta against the entry starting at `base_offset` in the same pack.
    OfsDelta { base_offset: u64 },
    /// Delta against an object that may live anywhere (thin packs).
    RefDelta { base: ObjectId },
}

impl PackObjectKind {
    /// The 3-bit type code stored in the frame header.
    pub fn type_code(&self) -> u8 {
        match self {
            Self::Full(kind) => kind.pack_code(),
            Self::OfsDelta { .. } => OBJ_OFS_DELTA,
            Self::RefDelta { .. } => OBJ_REF_DELTA,
        }
    }

    pub fn is_delta(&self) -> bool {
        !matches!(self, Self::Full(_))
    }
}

/// Decoded frame header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameHeader {
    pub kind: PackObjectKind,
    /// Inflated payload size: object size for full frames, delta size for
    /// delta frames.
    pub size: u64,
    /// Bytes from the frame start to the first compressed byte.
    pub header_len: usize,
}

/// Append the type/size bytes of a frame header.
pub fn write_frame_header(out: &mut Vec<u8>, type_code: u8, mut size: u64) {
    let mut byte = ((type_code & 0x07) << 4) | (size & 0x0f) as u8;
    size >>= 4;
    while size != 0 {
        out.push(byte | 0x80);
        byte = (size & 0x7f) as u8;
        size >>= 7;
    }
    out.push(byte);
}

/// Append the negative offset of an ofs-delta base.
///
/// Each continuation step adds one before shifting, so no value has two
/// encodings.
pub fn write_ofs_distance(out: &mut Vec<u8>, mut distance: u64) {
    let mut buf = [0u8; 10];
    let mut pos = buf.len() - 1;
    buf[pos] = (distance & 0x7f) as u8;
    distance >>= 7;
    while distance != 0 {
        distance -= 1;
        pos -= 1;
        buf[pos] = 0x80 | (distance & 0x7f) as u8;
        distance >>= 7;
    }
    out.extend_from_slice(&buf[pos..]);
}

/// Parse a frame header from `buf`, which starts at pack offset `offset`.
///
/// `buf` may extend past the header; it must hold the whole header.
pub fn parse_frame_header(
    buf: &[u8],
    offset: u64,
    algorithm: HashAlgorithm,
) -> PackResult<FrameHeader> {
    let truncated = || PackError::corrupt(offset, "truncated frame header");

    let mut pos = 0;
    let mut byte = *buf.first().ok_or_else(truncated)?;
    pos += 1;
    let type_code = (byte >> 4) & 0x07;
    let mut size = u64::from(byte & 0x0f);
    let mut shift = 4u32;
    while byte & 0x80 != 0 {
        byte = *buf.get(pos).ok_or_else(truncated)?;
        pos += 1;
        if shift > 57 {
            return Err(PackError::corrupt(offset, "object size overflows 64 bits"));
        }
        size |= u64::from(byte & 0x7f) << shift;
        shift += 7;
    }

    let kind = match type_code {
        OBJ_OFS_DELTA => {
            let mut c = *buf.get(pos).ok_or_else(truncated)?;
            pos += 1;
            let mut distance = u64::from(c & 0x7f);
            while c & 0x80 != 0 {
                c = *buf.get(pos).ok_or_else(truncated)?;
                pos += 1;
                distance = distance
                    .checked_add(1)
                    .and_then(|d| d.checked_mul(128))
                    .ok_or_else(|| PackError::corrupt(offset, "delta base offset overflows"))?
                    | u64::from(c & 0x7f);
            }
            if distance == 0 || distance > offset {
                return Err(PackError::corrupt(
                    offset,
                    format!("delta base distance {distance} is out of range"),
                ));
            }
            PackObjectKind::OfsDelta {
                base_offset: offset - distance,
            }
        }
        OBJ_REF_DELTA => {
            let len = algorithm.digest_len();
            let raw = buf.get(pos..pos + len).ok_or_else(truncated)?;
            pos += len;
            PackObjectKind::RefDelta {
                base: ObjectId::from_slice(raw)
                    .map_err(|e| PackError::corrupt(offset, e.to_string()))?,
            }
        }
        code => PackObjectKind::Full(
            ObjectType::from_pack_code(code)
                .map_err(|_| PackError::corrupt(offset, format!("unknown object type {code}")))?,
        ),
    };

    Ok(FrameHeader {
        kind,
        size,
        header_len: pos,
    })
}
