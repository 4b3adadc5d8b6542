use std::collections::BTreeSet;
use std::io::{Cursor, Read, Write};

use anyhow::{anyhow, bail, Context, Result};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, DateTime, ZipArchive, ZipWriter};

use crate::ops::{ContainerEntry, ContainerLayout, EntryCompression};
use crate::tree::{is_within, validate_rel_path, Entries, Node, TreeOps};

pub fn is_container(bytes: &[u8]) -> bool {
    bytes.starts_with(b"PK\x03\x04") || bytes.starts_with(b"PK\x05\x06")
}

/// A zip archive opened as a directory tree in memory.
///
/// Keys carry no trailing `/`; entry order and compression live in the
/// [`ContainerLayout`] that comes with it.
#[derive(Debug, Default)]
pub(crate) struct ZipTree {
    entries: Entries,
}

impl ZipTree {
    pub(crate) fn from_bytes(bytes: &[u8]) -> Result<(Self, ContainerLayout)> {
        let mut archive = ZipArchive::new(Cursor::new(bytes)).context("failed to open archive")?;
        let mut entries = Entries::new();
        let mut layout = ContainerLayout::default();

        for index in 0..archive.len() {
            let mut file = archive
                .by_index(index)
                .with_context(|| format!("failed to read archive entry {index}"))?;
            let name = file.name().to_string();
            let compression = match file.compression() {
                CompressionMethod::Stored => EntryCompression::Stored,
                CompressionMethod::Deflated => EntryCompression::Deflated,
                other => bail!("archive entry '{name}' uses unsupported compression {other:?}"),
            };
            let key = name.trim_end_matches('/').to_string();
            validate_rel_path(&key)?;

            let node = if name.ends_with('/') {
                Node::Dir
            } else {
                // untrusted header size: preallocate at most the archive length
                let capacity = usize::try_from(file.size()).unwrap_or(usize::MAX);
                let mut data = Vec::with_capacity(capacity.min(bytes.len()));
                file.read_to_end(&mut data)
                    .with_context(|| format!("failed to inflate archive entry '{name}'"))?;
                Node::File { data, mode: None }
            };
            if entries.insert(key, node).is_some() {
                bail!("archive has duplicate entry '{name}'");
            }
            let modified: Option<DateTime> = file.last_modified().into();
            layout.entries.push(ContainerEntry {
                name,
                compression,
                mode: file.unix_mode().map(|mode| mode & 0o7777),
                modified: modified.map(|stamp| (stamp.datepart(), stamp.timepart())),
            });
        }

        Ok((Self { entries }, layout))
    }

    /// Serializes the tree in `layout` order. Entries without a recorded
    /// timestamp get the zip epoch.
    pub(crate) fn to_bytes(&self, layout: &ContainerLayout) -> Result<Vec<u8>> {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        let mut written = BTreeSet::new();

        for entry in &layout.entries {
            let key = entry.name.trim_end_matches('/');
            let modified = match entry.modified {
                Some((date, time)) => DateTime::try_from_msdos(date, time).map_err(|_| {
                    anyhow!("archive entry '{}' has an invalid timestamp", entry.name)
                })?,
                None => DateTime::default(),
            };
            let mut options = SimpleFileOptions::default()
                .compression_method(match entry.compression {
                    EntryCompression::Stored => CompressionMethod::Stored,
                    EntryCompression::Deflated => CompressionMethod::Deflated,
                })
                .last_modified_time(modified);
            if let Some(mode) = entry.mode {
                options = options.unix_permissions(mode);
            }

            match (self.entries.get(key), entry.is_dir()) {
                (Some(Node::Dir), true) => writer
                    .add_directory(entry.name.clone(), options)
                    .with_context(|| format!("failed to write archive entry '{}'", entry.name))?,
                (Some(Node::File { data, .. }), false) => {
                    writer
                        .start_file(entry.name.clone(), options)
                        .with_context(|| {
                            format!("failed to write archive entry '{}'", entry.name)
                        })?;
                    writer.write_all(data).with_context(|| {
                        format!("failed to write archive entry '{}'", entry.name)
                    })?;
                }
                _ => bail!("archive layout names missing entry '{}'", entry.name),
            }
            written.insert(key);
        }

        if let Some(extra) = self
            .entries
            .keys()
            .find(|key| !written.contains(key.as_str()))
        {
            bail!("archive entry '{extra}' is missing from the container layout");
        }

        let cursor = writer.finish().context("failed to finish archive")?;
        Ok(cursor.into_inner())
    }

    pub(crate) fn entries(&self) -> &Entries {
        &self.entries
    }
}

impl TreeOps for ZipTree {
    fn read(&self, path: &str) -> Result<Vec<u8>> {
        match self.entries.get(path) {
            Some(Node::File { data, .. }) => Ok(data.clone()),
            _ => bail!("patch source entry is missing from archive: {path}"),
        }
    }

    fn write(&mut self, path: &str, data: Vec<u8>, _mode: Option<u32>) -> Result<()> {
        validate_rel_path(path)?;
        self.entries
            .insert(path.to_string(), Node::File { data, mode: None });
        Ok(())
    }

    fn add_dir(&mut self, path: &str) -> Result<()> {
        validate_rel_path(path)?;
        self.entries.insert(path.to_string(), Node::Dir);
        Ok(())
    }

    fn delete(&mut self, path: &str) -> Result<()> {
        if self.entries.remove(path).is_none() {
            bail!("patch deletes a missing archive entry: {path}");
        }
        self.entries.retain(|key, _| !is_within(key, path));
        Ok(())
    }
}

/// Builds an archive from `(name, contents)` pairs; names ending in `/` are
/// directories. Output is deterministic for the same input.
pub fn build_container<I, N, D>(entries: I, compression: EntryCompression) -> Result<Vec<u8>>
where
    I: IntoIterator<Item = (N, D)>,
    N: AsRef<str>,
    D: AsRef<[u8]>,
{
    let mut tree = ZipTree::default();
    let mut layout = ContainerLayout::default();
    for (name, data) in entries {
        let name = name.as_ref();
        let is_dir = name.ends_with('/');
        if is_dir {
            tree.add_dir(name.trim_end_matches('/'))?;
        } else {
            tree.write(name, data.as_ref().to_vec(), None)?;
        }
        layout.entries.push(ContainerEntry {
            name: name.to_string(),
            compression,
            mode: Some(if is_dir { 0o755 } else { 0o644 }),
            modified: None,
        });
    }
    tree.to_bytes(&layout)
}
