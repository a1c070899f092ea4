//! Git delta codec.
//!
//! A delta is two LEB128 sizes (base, target) followed by opcodes:
//!
//! - copy (`1xxxxxxx`): bits 0-3 flag which little-endian offset bytes follow,
//!   bits 4-6 flag which size bytes follow. A size of zero means `0x10000`.
//! - insert (`0nnnnnnn`, n in 1..=127): the next n bytes are literal output.
//!
//! Opcode zero is reserved and rejected.

use std::collections::HashMap;

use thiserror::Error;

/// Size a copy opcode encodes when its size field is zero.
const MAX_COPY: usize = 0x10000;
/// Longest literal run one insert opcode carries.
const MAX_INSERT: usize = 0x7f;
/// Granularity of the base index used by [`encode`].
const BLOCK: usize = 16;
/// Candidate positions kept per block; repetitive bases would otherwise
/// degrade matching to quadratic time.
const MAX_CANDIDATES: usize = 64;
/// Upper bound on what `apply` reserves ahead of time. Output still grows to
/// the declared size; this only keeps a corrupt header from forcing a huge
/// allocation before any opcode is checked.
const MAX_PREALLOC: usize = 16 * 1024 * 1024;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeltaError {
    #[error("delta stream truncated")]
    Truncated,
    #[error("size varint overflows 64 bits")]
    VarintOverflow,
    #[error("declared base size {declared} does not match base length {actual}")]
    BaseSizeMismatch { declared: u64, actual: u64 },
    #[error("copy of {size} bytes at offset {offset} exceeds base length {base_len}")]
    CopyOutOfRange {
        offset: usize,
        size: usize,
        base_len: usize,
    },
    #[error("output exceeds declared target size {0}")]
    OutputOverrun(u64),
    #[error("reserved opcode 0")]
    ReservedOpcode,
    #[error("declared target size {declared} but produced {actual} bytes")]
    TargetSizeMismatch { declared: u64, actual: u64 },
}

/// Read one LEB128 size from `data` at `*pos`.
fn read_size(data: &[u8], pos: &mut usize) -> Result<u64, DeltaError> {
    let mut value: u64 = 0;
    let mut shift: u32 = 0;
    loop {
        let byte = *data.get(*pos).ok_or(DeltaError::Truncated)?;
        *pos += 1;
        if shift > 63 || (shift == 63 && (byte & 0x7f) > 1) {
            return Err(DeltaError::VarintOverflow);
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

fn write_size(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if value == 0 {
            break;
        }
    }
}

/// Parse the `(base size, target size)` header of a delta.
pub fn delta_sizes(delta: &[u8]) -> Result<(u64, u64), DeltaError> {
    let mut pos = 0;
    let base = read_size(delta, &mut pos)?;
    let target = read_size(delta, &mut pos)?;
    Ok((base, target))
}

fn decode_copy(delta: &[u8], pos: &mut usize, cmd: u8) -> Result<(usize, usize), DeltaError> {
    let mut next = || -> Result<usize, DeltaError> {
        let byte = *delta.get(*pos).ok_or(DeltaError::Truncated)?;
        *pos += 1;
        Ok(byte as usize)
    };

    let mut offset = 0usize;
    for i in 0..4 {
        if cmd & (1 << i) != 0 {
            offset |= next()? << (8 * i);
        }
    }
    let mut size = 0usize;
    for i in 0..3 {
        if cmd & (0x10 << i) != 0 {
            size |= next()? << (8 * i);
        }
    }
    if size == 0 {
        size = MAX_COPY;
    }
    Ok((offset, size))
}

/// Reconstruct a target buffer from `base` and a delta stream.
pub fn apply(base: &[u8], delta: &[u8]) -> Result<Vec<u8>, DeltaError> {
    let mut pos = 0;
    let base_size = read_size(delta, &mut pos)?;
    let target_size = read_size(delta, &mut pos)?;
    if base_size != base.len() as u64 {
        return Err(DeltaError::BaseSizeMismatch {
            declared: base_size,
            actual: base.len() as u64,
        });
    }
    let target_len =
        usize::try_from(target_size).map_err(|_| DeltaError::OutputOverrun(target_size))?;

    let mut out = Vec::with_capacity(target_len.min(MAX_PREALLOC));
    while pos < delta.len() {
        let cmd = delta[pos];
        pos += 1;

        if cmd & 0x80 != 0 {
            let (offset, size) = decode_copy(delta, &mut pos, cmd)?;
            let end = offset
                .checked_add(size)
                .filter(|&end| end <= base.len())
                .ok_or(DeltaError::CopyOutOfRange {
                    offset,
                    size,
                    base_len: base.len(),
                })?;
            if out.len() + size > target_len {
                return Err(DeltaError::OutputOverrun(target_size));
            }
            out.extend_from_slice(&base[offset..end]);
        } else if cmd != 0 {
            let size = cmd as usize;
            let literal = delta.get(pos..pos + size).ok_or(DeltaError::Truncated)?;
            if out.len() + size > target_len {
                return Err(DeltaError::OutputOverrun(target_size));
            }
            out.extend_from_slice(literal);
            pos += size;
        } else {
            return Err(DeltaError::ReservedOpcode);
        }
    }

    if out.len() != target_len {
        return Err(DeltaError::TargetSizeMismatch {
            declared: target_size,
            actual: out.len() as u64,
        });
    }
    Ok(out)
}

/// Block index over a base buffer: every `BLOCK`-aligned window maps to the
/// offsets where it occurs.
struct BaseIndex<'a> {
    base: &'a [u8],
    blocks: HashMap<&'a [u8], Vec<usize>>,
}

impl<'a> BaseIndex<'a> {
    fn new(base: &'a [u8]) -> Self {
        let mut blocks: HashMap<&[u8], Vec<usize>> = HashMap::new();
        for start in (0..base.len().saturating_sub(BLOCK - 1)).step_by(BLOCK) {
            let slots = blocks.entry(&base[start..start + BLOCK]).or_default();
            if slots.len() < MAX_CANDIDATES {
                slots.push(start);
            }
        }
        Self { base, blocks }
    }

    /// Longest match for `target[pos..]`, as `(base offset, length)`.
    fn longest_match(&self, target: &[u8], pos: usize) -> Option<(usize, usize)> {
        let key = target.get(pos..pos + BLOCK)?;
        let candidates = self.blocks.get(key)?;
        let mut best: Option<(usize, usize)> = None;
        for &start in candidates {
            let len = self.base[start..]
                .iter()
                .zip(&target[pos..])
                .take_while(|(a, b)| a == b)
                .count();
            if best.map_or(true, |(_, best_len)| len > best_len) {
                best = Some((start, len));
            }
        }
        best
    }
}

fn flush_insert(out: &mut Vec<u8>, literal: &[u8]) {
    for chunk in literal.chunks(MAX_INSERT) {
        out.push(chunk.len() as u8);
        out.extend_from_slice(chunk);
    }
}

fn emit_copy(out: &mut Vec<u8>, mut offset: usize, mut len: usize) {
    while len > 0 {
        let size = len.min(MAX_COPY);
        let mut op = [0u8; 8];
        let mut n = 1;
        let mut cmd = 0x80u8;
        for i in 0..4 {
            let byte = (offset >> (8 * i)) as u8;
            if byte != 0 {
                cmd |= 1 << i;
                op[n] = byte;
                n += 1;
            }
        }
        if size != MAX_COPY {
            for i in 0..3 {
                let byte = (size >> (8 * i)) as u8;
                if byte != 0 {
                    cmd |= 0x10 << i;
                    op[n] = byte;
                    n += 1;
                }
            }
        }
        op[0] = cmd;
        out.extend_from_slice(&op[..n]);
        offset += size;
        len -= size;
    }
}

/// Encode `target` as a delta against `base`.
///
/// Matching is greedy over a block index of `base`; matches are extended
/// backwards into pending literals. Copy offsets are four bytes wide, so only
/// the first 4 GiB of `base` is used as a copy source.
pub fn encode(base: &[u8], target: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(target.len() / 4 + 16);
    write_size(&mut out, base.len() as u64);
    write_size(&mut out, target.len() as u64);

    let source = &base[..base.len().min(u32::MAX as usize)];
    let index = BaseIndex::new(source);

    let mut literal_start = 0;
    let mut pos = 0;
    while pos < target.len() {
        match index.longest_match(target, pos) {
            Some((mut start, mut len)) => {
                let mut at = pos;
                while start > 0 && at > literal_start && source[start - 1] == target[at - 1] {
                    start -= 1;
                    at -= 1;
                    len += 1;
                }
                flush_insert(&mut out, &target[literal_start..at]);
                emit_copy(&mut out, start, len);
                pos = at + len;
                literal_start = pos;
            }
            None => pos += 1,
        }
    }
    flush_insert(&mut out, &target[literal_start..]);
    out
}
