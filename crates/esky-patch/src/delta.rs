//! Copy/insert binary deltas.
//!
//! Layout: `EDLT`, source length, target length (varints), then a run of
//! instructions (`1` copy offset+len, `2` insert len+bytes, `0` end) and the
//! hex sha256 of the target. Reconstruction never needs the generator.

use std::io::Read;

use anyhow::{anyhow, bail, Context, Result};
use esky_security::sha256_hex;

use crate::varint::{read_varint, write_varint};

const DELTA_MAGIC: &[u8; 4] = b"EDLT";
const OP_END: u8 = 0;
const OP_COPY: u8 = 1;
const OP_INSERT: u8 = 2;
#[cfg(feature = "delta-generate")]
const BLOCK: usize = 16;

pub fn apply_delta(source: &[u8], delta: &[u8]) -> Result<Vec<u8>> {
    let mut reader = delta;
    let mut magic = [0_u8; 4];
    reader
        .read_exact(&mut magic)
        .context("delta is truncated")?;
    if &magic != DELTA_MAGIC {
        bail!("delta has an unknown header");
    }

    let source_len = read_len(&mut reader)?;
    if source_len != source.len() {
        bail!(
            "delta expects a {source_len} byte source, got {} bytes",
            source.len()
        );
    }
    let target_len = read_len(&mut reader)?;
    // untrusted header: preallocate no more than the inputs could account for
    let mut target = Vec::with_capacity(target_len.min(source.len() + delta.len()));

    loop {
        let mut op = [0_u8; 1];
        reader
            .read_exact(&mut op)
            .context("delta is truncated")?;
        match op[0] {
            OP_END => break,
            OP_COPY => {
                let offset = read_len(&mut reader)?;
                let len = read_len(&mut reader)?;
                let end = offset
                    .checked_add(len)
                    .filter(|end| *end <= source.len())
                    .ok_or_else(|| anyhow!("delta copies past the end of its source"))?;
                target.extend_from_slice(&source[offset..end]);
            }
            OP_INSERT => {
                let len = read_len(&mut reader)?;
                if len > reader.len() {
                    bail!("delta insert runs past the end of the delta");
                }
                let (bytes, rest) = reader.split_at(len);
                target.extend_from_slice(bytes);
                reader = rest;
            }
            other => bail!("delta has unknown instruction {other}"),
        }
        if target.len() > target_len {
            bail!("delta produces more than {target_len} bytes");
        }
    }

    if target.len() != target_len {
        bail!(
            "delta produced {} bytes, expected {target_len}",
            target.len()
        );
    }
    if reader != sha256_hex(&target).as_bytes() {
        bail!("delta output does not match its recorded checksum");
    }
    Ok(target)
}

fn read_len(reader: &mut &[u8]) -> Result<usize> {
    let value = read_varint(reader).context("delta is truncated")?;
    usize::try_from(value).context("delta length does not fit in memory")
}

/// Greedy block-match delta from `source` to `target`.
#[cfg(feature = "delta-generate")]
pub fn generate_delta(source: &[u8], target: &[u8]) -> Vec<u8> {
    use std::collections::HashMap;

    let mut index: HashMap<&[u8], usize> = HashMap::new();
    for offset in (0..source.len().saturating_sub(BLOCK - 1)).step_by(BLOCK) {
        index.entry(&source[offset..offset + BLOCK]).or_insert(offset);
    }

    let mut out = Vec::with_capacity(target.len() / 4 + 64);
    out.extend_from_slice(DELTA_MAGIC);
    push_varint(&mut out, source.len());
    push_varint(&mut out, target.len());

    let mut cursor = 0;
    let mut pending = 0;
    while cursor + BLOCK <= target.len() {
        let Some(&block_offset) = index.get(&target[cursor..cursor + BLOCK]) else {
            cursor += 1;
            continue;
        };

        let mut src_start = block_offset;
        let mut dst_start = cursor;
        while dst_start > pending && src_start > 0 && source[src_start - 1] == target[dst_start - 1]
        {
            src_start -= 1;
            dst_start -= 1;
        }
        let mut len = cursor + BLOCK - dst_start;
        while src_start + len < source.len()
            && dst_start + len < target.len()
            && source[src_start + len] == target[dst_start + len]
        {
            len += 1;
        }

        push_insert(&mut out, &target[pending..dst_start]);
        out.push(OP_COPY);
        push_varint(&mut out, src_start);
        push_varint(&mut out, len);
        cursor = dst_start + len;
        pending = cursor;
    }
    push_insert(&mut out, &target[pending..]);
    out.push(OP_END);

    out.extend_from_slice(sha256_hex(target).as_bytes());
    out
}

#[cfg(feature = "delta-generate")]
fn push_insert(out: &mut Vec<u8>, bytes: &[u8]) {
    if bytes.is_empty() {
        return;
    }
    out.push(OP_INSERT);
    push_varint(out, bytes.len());
    out.extend_from_slice(bytes);
}

#[cfg(feature = "delta-generate")]
fn push_varint(out: &mut Vec<u8>, value: usize) {
    // writing into a Vec cannot fail
    let _ = write_varint(out, value as u64);
}
