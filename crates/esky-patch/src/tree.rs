use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use esky_fstxn::remove_path;
use walkdir::WalkDir;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Node {
    Dir,
    File { data: Vec<u8>, mode: Option<u32> },
}

/// Relative `/`-separated path → node, parents sort before children.
pub(crate) type Entries = BTreeMap<String, Node>;

pub(crate) fn is_within(path: &str, dir: &str) -> bool {
    path == dir
        || path
            .strip_prefix(dir)
            .is_some_and(|rest| rest.starts_with('/'))
}

pub(crate) fn validate_rel_path(path: &str) -> Result<()> {
    if path.is_empty()
        || path.contains('\\')
        || path
            .split('/')
            .any(|part| part.is_empty() || part == "." || part == "..")
    {
        bail!("invalid patch path '{path}'");
    }
    Ok(())
}

pub(crate) fn load_dir(root: &Path) -> Result<Entries> {
    let mut entries = Entries::new();
    for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
        let entry = entry.with_context(|| format!("failed to walk {}", root.display()))?;
        let rel = entry
            .path()
            .strip_prefix(root)
            .with_context(|| format!("failed to relativize {}", entry.path().display()))?
            .components()
            .map(|part| part.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");

        let file_type = entry.file_type();
        if file_type.is_dir() {
            entries.insert(rel, Node::Dir);
        } else if file_type.is_file() {
            let data = fs::read(entry.path())
                .with_context(|| format!("failed to read {}", entry.path().display()))?;
            let mode = file_mode(entry.path())?;
            entries.insert(rel, Node::File { data, mode });
        } else {
            bail!(
                "unsupported file type in patch tree: {}",
                entry.path().display()
            );
        }
    }
    Ok(entries)
}

#[cfg(unix)]
fn file_mode(path: &Path) -> Result<Option<u32>> {
    use std::os::unix::fs::PermissionsExt;
    let metadata =
        fs::metadata(path).with_context(|| format!("failed to stat {}", path.display()))?;
    Ok(Some(metadata.permissions().mode() & 0o7777))
}

#[cfg(not(unix))]
fn file_mode(_path: &Path) -> Result<Option<u32>> {
    Ok(None)
}

/// Mutations a patch performs on one level of the tree.
pub(crate) trait TreeOps {
    fn read(&self, path: &str) -> Result<Vec<u8>>;
    fn write(&mut self, path: &str, data: Vec<u8>, mode: Option<u32>) -> Result<()>;
    fn add_dir(&mut self, path: &str) -> Result<()>;
    fn delete(&mut self, path: &str) -> Result<()>;

    fn copy(&mut self, from: &str, to: &str) -> Result<()> {
        let data = self.read(from)?;
        self.write(to, data, None)
    }
}

/// A real directory being patched in place.
pub(crate) struct DirTree {
    root: PathBuf,
}

impl DirTree {
    pub(crate) fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    fn path(&self, rel: &str) -> Result<PathBuf> {
        validate_rel_path(rel)?;
        Ok(rel.split('/').fold(self.root.clone(), |path, part| path.join(part)))
    }
}

impl TreeOps for DirTree {
    fn read(&self, path: &str) -> Result<Vec<u8>> {
        let full = self.path(path)?;
        fs::read(&full).with_context(|| format!("patch source entry is missing: {path}"))
    }

    fn write(&mut self, path: &str, data: Vec<u8>, mode: Option<u32>) -> Result<()> {
        let full = self.path(path)?;
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        fs::write(&full, data).with_context(|| format!("failed to write {}", full.display()))?;
        set_mode(&full, mode)
    }

    fn add_dir(&mut self, path: &str) -> Result<()> {
        let full = self.path(path)?;
        fs::create_dir_all(&full).with_context(|| format!("failed to create {}", full.display()))
    }

    fn delete(&mut self, path: &str) -> Result<()> {
        let full = self.path(path)?;
        fs::symlink_metadata(&full)
            .with_context(|| format!("patch deletes a missing entry: {path}"))?;
        remove_path(&full).with_context(|| format!("failed to remove {}", full.display()))
    }

    fn copy(&mut self, from: &str, to: &str) -> Result<()> {
        let src = self.path(from)?;
        let dst = self.path(to)?;
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        fs::copy(&src, &dst).with_context(|| format!("patch copy source is missing: {from}"))?;
        Ok(())
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: Option<u32>) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    if let Some(mode) = mode {
        fs::set_permissions(path, fs::Permissions::from_mode(mode))
            .with_context(|| format!("failed to set mode on {}", path.display()))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: Option<u32>) -> Result<()> {
    Ok(())
}
