use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Filesystems whose rename cannot atomically replace an existing entry.
const NON_ATOMIC_RENAME_FILESYSTEMS: &[&str] =
    &["vfat", "msdos", "exfat", "fat", "ntfs", "fuseblk", "ntfs3"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxnStrategy {
    /// Pick per root at `begin()`.
    #[default]
    Auto,
    /// Payloads land next to their target and are renamed over it.
    Direct,
    /// Payloads are staged and hash-verified up front, renames come last.
    Staged,
}

impl TxnStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Direct => "direct",
            Self::Staged => "staged",
        }
    }
}

#[derive(Debug, Clone)]
struct MountEntry {
    mount_point: PathBuf,
    fs_type: String,
}

static MOUNT_TABLE: OnceLock<Vec<MountEntry>> = OnceLock::new();

fn mount_table() -> &'static [MountEntry] {
    MOUNT_TABLE.get_or_init(|| {
        fs::read_to_string("/proc/self/mounts")
            .map(|raw| parse_mount_table(&raw))
            .unwrap_or_default()
    })
}

fn parse_mount_table(raw: &str) -> Vec<MountEntry> {
    raw.lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let _device = fields.next()?;
            let mount_point = fields.next()?;
            let fs_type = fields.next()?;
            Some(MountEntry {
                mount_point: PathBuf::from(unescape_mount_field(mount_point)),
                fs_type: fs_type.to_string(),
            })
        })
        .collect()
}

fn unescape_mount_field(field: &str) -> String {
    field
        .replace("\\040", " ")
        .replace("\\011", "\t")
        .replace("\\012", "\n")
        .replace("\\134", "\\")
}

fn filesystem_type_in(table: &[MountEntry], path: &Path) -> Option<String> {
    table
        .iter()
        .filter(|entry| path.starts_with(&entry.mount_point))
        .max_by_key(|entry| entry.mount_point.components().count())
        .map(|entry| entry.fs_type.clone())
}

/// Resolves `Auto` for a canonical root; other strategies pass through.
///
/// Known-bad filesystems from the mount table win; otherwise a
/// trial rename-over-existing inside `scratch_dir` decides.
pub fn detect_strategy(requested: TxnStrategy, root: &Path, scratch_dir: &Path) -> TxnStrategy {
    if requested != TxnStrategy::Auto {
        return requested;
    }

    if let Some(fs_type) = filesystem_type_in(mount_table(), root) {
        if NON_ATOMIC_RENAME_FILESYSTEMS.contains(&fs_type.as_str()) {
            debug!(root = %root.display(), fs_type = %fs_type, "filesystem lacks atomic rename");
            return TxnStrategy::Staged;
        }
    }

    if rename_over_existing_works(scratch_dir) {
        TxnStrategy::Direct
    } else {
        debug!(root = %root.display(), "trial rename failed");
        TxnStrategy::Staged
    }
}

fn rename_over_existing_works(dir: &Path) -> bool {
    let source = dir.join("rename-source");
    let target = dir.join("rename-target");
    let outcome = (|| -> std::io::Result<bool> {
        fs::write(&source, b"new")?;
        fs::write(&target, b"old")?;
        fs::rename(&source, &target)?;
        Ok(fs::read(&target)? == b"new" && !source.exists())
    })();
    let _ = fs::remove_file(&source);
    let _ = fs::remove_file(&target);
    outcome.unwrap_or(false)
}
