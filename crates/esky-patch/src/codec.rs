use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use anyhow::{bail, Context, Result};
use esky_core::EskyError;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::ops::{ContainerEntry, ContainerLayout, EntryCompression, PatchOp, PatchSet};
use crate::varint::{read_varint, write_varint};

pub const PATCH_MAGIC: &[u8; 8] = b"ESKYPTCH";
pub const PATCH_FORMAT_VERSION: u8 = 2;
/// Format 1 carried no archive entry timestamps.
const FORMAT_WITHOUT_TIMESTAMPS: u8 = 1;

const TAG_END: u8 = 0;
const TAG_ADD: u8 = 1;
const TAG_ADD_DIR: u8 = 2;
const TAG_DELETE: u8 = 3;
const TAG_COPY: u8 = 4;
const TAG_DELTA: u8 = 5;
const TAG_ENTER: u8 = 6;
const TAG_LEAVE: u8 = 7;

pub fn write_patch<W: Write>(patch: &PatchSet, writer: W) -> Result<()> {
    let mut writer = writer;
    writer.write_all(PATCH_MAGIC)?;
    writer.write_all(&[PATCH_FORMAT_VERSION])?;

    let mut encoder = ZlibEncoder::new(writer, Compression::default());
    for op in patch.ops() {
        write_op(&mut encoder, op)?;
    }
    encoder.write_all(&[TAG_END])?;
    encoder
        .finish()
        .context("failed to finish patch stream")?
        .flush()?;
    Ok(())
}

pub fn read_patch<R: Read>(reader: R) -> Result<PatchSet> {
    let mut reader = reader;
    let mut header = [0_u8; 9];
    reader
        .read_exact(&mut header)
        .context("patch header is truncated")?;
    if &header[..8] != PATCH_MAGIC {
        bail!("not an esky patch");
    }
    let format = header[8];
    if format != PATCH_FORMAT_VERSION && format != FORMAT_WITHOUT_TIMESTAMPS {
        bail!("unsupported patch format version {format}");
    }

    let mut decoder = ZlibDecoder::new(reader);
    let mut patch = PatchSet::new();
    loop {
        let tag = read_u8(&mut decoder)?;
        if tag == TAG_END {
            break;
        }
        patch.push(read_op(&mut decoder, tag, format)?);
    }
    Ok(patch)
}

pub fn encode_patch(patch: &PatchSet) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    write_patch(patch, &mut out)?;
    Ok(out)
}

pub fn decode_patch(bytes: &[u8]) -> Result<PatchSet> {
    read_patch(bytes)
}

pub fn write_patch_file(patch: &PatchSet, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let file =
        File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    write_patch(patch, BufWriter::new(file))
        .with_context(|| format!("failed to write patch {}", path.display()))
}

/// Reads a patch artifact; any decoding problem is a [`EskyError::CorruptArtifact`].
pub fn read_patch_file(path: &Path) -> Result<PatchSet> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    read_patch(BufReader::new(file)).with_context(|| EskyError::CorruptArtifact {
        path: path.to_path_buf(),
        detail: "patch cannot be decoded".to_string(),
    })
}

fn write_op<W: Write>(writer: &mut W, op: &PatchOp) -> Result<()> {
    match op {
        PatchOp::Add { path, data, mode } => {
            writer.write_all(&[TAG_ADD])?;
            write_str(writer, path)?;
            write_bytes(writer, data)?;
            write_mode(writer, *mode)?;
        }
        PatchOp::AddDir { path } => {
            writer.write_all(&[TAG_ADD_DIR])?;
            write_str(writer, path)?;
        }
        PatchOp::Delete { path } => {
            writer.write_all(&[TAG_DELETE])?;
            write_str(writer, path)?;
        }
        PatchOp::Copy { from, to } => {
            writer.write_all(&[TAG_COPY])?;
            write_str(writer, from)?;
            write_str(writer, to)?;
        }
        PatchOp::Delta { path, delta } => {
            writer.write_all(&[TAG_DELTA])?;
            write_str(writer, path)?;
            write_bytes(writer, delta)?;
        }
        PatchOp::EnterContainer { path } => {
            writer.write_all(&[TAG_ENTER])?;
            write_str(writer, path)?;
        }
        PatchOp::LeaveContainer { layout } => {
            writer.write_all(&[TAG_LEAVE])?;
            write_varint(writer, layout.entries.len() as u64)?;
            for entry in &layout.entries {
                write_str(writer, &entry.name)?;
                writer.write_all(&[entry.compression.tag()])?;
                write_mode(writer, entry.mode)?;
                write_stamp(writer, entry.modified)?;
            }
        }
    }
    Ok(())
}

fn read_op<R: Read>(reader: &mut R, tag: u8, format: u8) -> Result<PatchOp> {
    let op = match tag {
        TAG_ADD => PatchOp::Add {
            path: read_str(reader)?,
            data: read_bytes(reader)?,
            mode: read_mode(reader)?,
        },
        TAG_ADD_DIR => PatchOp::AddDir {
            path: read_str(reader)?,
        },
        TAG_DELETE => PatchOp::Delete {
            path: read_str(reader)?,
        },
        TAG_COPY => PatchOp::Copy {
            from: read_str(reader)?,
            to: read_str(reader)?,
        },
        TAG_DELTA => PatchOp::Delta {
            path: read_str(reader)?,
            delta: read_bytes(reader)?,
        },
        TAG_ENTER => PatchOp::EnterContainer {
            path: read_str(reader)?,
        },
        TAG_LEAVE => {
            let count = read_varint(reader).context("patch is truncated")?;
            let mut layout = ContainerLayout::default();
            for _ in 0..count {
                let name = read_str(reader)?;
                let compression_tag = read_u8(reader)?;
                let compression = EntryCompression::from_tag(compression_tag).with_context(
                    || format!("unknown archive compression {compression_tag} for '{name}'"),
                )?;
                let mode = read_mode(reader)?;
                let modified = if format == FORMAT_WITHOUT_TIMESTAMPS {
                    None
                } else {
                    read_stamp(reader)?
                };
                layout.entries.push(ContainerEntry {
                    name,
                    compression,
                    mode,
                    modified,
                });
            }
            PatchOp::LeaveContainer { layout }
        }
        other => bail!("unknown patch op tag {other}"),
    };
    Ok(op)
}

fn write_str<W: Write>(writer: &mut W, value: &str) -> Result<()> {
    write_bytes(writer, value.as_bytes())
}

fn write_bytes<W: Write>(writer: &mut W, value: &[u8]) -> Result<()> {
    write_varint(writer, value.len() as u64)?;
    writer.write_all(value)?;
    Ok(())
}

fn write_mode<W: Write>(writer: &mut W, mode: Option<u32>) -> Result<()> {
    match mode {
        Some(mode) => {
            writer.write_all(&[1])?;
            write_varint(writer, u64::from(mode))?;
        }
        None => writer.write_all(&[0])?,
    }
    Ok(())
}

fn write_stamp<W: Write>(writer: &mut W, stamp: Option<(u16, u16)>) -> Result<()> {
    match stamp {
        Some((date, time)) => {
            writer.write_all(&[1])?;
            writer.write_all(&date.to_le_bytes())?;
            writer.write_all(&time.to_le_bytes())?;
        }
        None => writer.write_all(&[0])?,
    }
    Ok(())
}

fn read_u8<R: Read>(reader: &mut R) -> Result<u8> {
    let mut byte = [0_u8; 1];
    reader
        .read_exact(&mut byte)
        .context("patch is truncated")?;
    Ok(byte[0])
}

fn read_bytes<R: Read>(reader: &mut R) -> Result<Vec<u8>> {
    let len = read_varint(reader).context("patch is truncated")?;
    let mut data = Vec::new();
    reader
        .by_ref()
        .take(len)
        .read_to_end(&mut data)
        .context("patch is truncated")?;
    if data.len() as u64 != len {
        bail!("patch is truncated");
    }
    Ok(data)
}

fn read_str<R: Read>(reader: &mut R) -> Result<String> {
    String::from_utf8(read_bytes(reader)?).context("patch path is not UTF-8")
}

fn read_mode<R: Read>(reader: &mut R) -> Result<Option<u32>> {
    match read_u8(reader)? {
        0 => Ok(None),
        1 => {
            let mode = read_varint(reader).context("patch is truncated")?;
            Ok(Some(u32::try_from(mode).context("file mode out of range")?))
        }
        other => bail!("invalid mode marker {other}"),
    }
}

fn read_stamp<R: Read>(reader: &mut R) -> Result<Option<(u16, u16)>> {
    match read_u8(reader)? {
        0 => Ok(None),
        1 => {
            let mut words = [0_u8; 4];
            reader
                .read_exact(&mut words)
                .context("patch is truncated")?;
            Ok(Some((
                u16::from_le_bytes([words[0], words[1]]),
                u16::from_le_bytes([words[2], words[3]]),
            )))
        }
        other => bail!("invalid timestamp marker {other}"),
    }
}
