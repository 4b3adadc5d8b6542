use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use esky_core::{
    AppLayout, EskyError, VersionName, BOOTSTRAP_DIR, CONTROL_DIR, LEGACY_MANIFEST_FILE, LOCK_FILE,
    MANIFEST_FILE,
};
use esky_fstxn::{Transaction, TxnStrategy};
use tracing::info;

use crate::lock::RemovalLock;

const LEGACY_BOOTSTRAP_DIR: &str = "esky-bootstrap";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlLayout {
    /// `esky-files/bootstrap-manifest.txt` and `esky-files/esky-lockfile.txt`.
    Current,
    /// `esky-bootstrap.txt` and `esky-lockfile.txt` directly in the version dir.
    Legacy,
}

/// Control file locations of one version directory, whichever layout it
/// was written with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlFiles {
    layout: ControlLayout,
    manifest: PathBuf,
    lock: PathBuf,
    bootstrap_dir: PathBuf,
}

impl ControlFiles {
    /// Only reads the directory; a version with neither layout reports
    /// `Current` paths that may not exist yet.
    pub fn detect(version_dir: &Path) -> Self {
        let control_dir = version_dir.join(CONTROL_DIR);
        let legacy_manifest = version_dir.join(LEGACY_MANIFEST_FILE);
        if !control_dir.is_dir() && legacy_manifest.is_file() {
            return Self {
                layout: ControlLayout::Legacy,
                manifest: legacy_manifest,
                lock: version_dir.join(LOCK_FILE),
                bootstrap_dir: version_dir.join(LEGACY_BOOTSTRAP_DIR),
            };
        }
        Self {
            layout: ControlLayout::Current,
            manifest: control_dir.join(MANIFEST_FILE),
            lock: control_dir.join(LOCK_FILE),
            bootstrap_dir: control_dir.join(BOOTSTRAP_DIR),
        }
    }

    pub fn layout(&self) -> ControlLayout {
        self.layout
    }

    pub fn manifest_path(&self) -> &Path {
        &self.manifest
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock
    }

    /// Where the version keeps its own copies of the app-root bootstrap files.
    pub fn bootstrap_dir(&self) -> &Path {
        &self.bootstrap_dir
    }

    /// A version is complete once its manifest exists.
    pub fn is_complete(&self) -> bool {
        self.manifest.is_file()
    }

    /// Paths relative to the app root that this version's bootstrap needs.
    pub fn bootstrap_files(&self) -> Result<Vec<String>> {
        let text = match fs::read_to_string(&self.manifest) {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read {}", self.manifest.display()))
            }
        };
        parse_manifest(&text)
            .with_context(|| format!("invalid bootstrap manifest {}", self.manifest.display()))
    }
}

/// Parses a bootstrap manifest: one forward-slash path per line, blank
/// lines and `#` comments ignored, duplicates dropped.
pub fn parse_manifest(text: &str) -> Result<Vec<String>> {
    let mut files: Vec<String> = Vec::new();
    for (index, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let path = line.replace('\\', "/");
        if path.starts_with('/')
            || path.contains(':')
            || path
                .split('/')
                .any(|part| part.is_empty() || part == "." || part == "..")
        {
            bail!("manifest line {} is not a plain relative path: {line}", index + 1);
        }
        if !files.contains(&path) {
            files.push(path);
        }
    }
    Ok(files)
}

/// Moves a legacy version's control files into `esky-files/` in one
/// transaction. Returns `false` when the version already uses the current
/// layout.
pub fn migrate_legacy_layout(
    layout: &AppLayout,
    version: &VersionName,
    strategy: TxnStrategy,
) -> Result<bool> {
    let version_dir = layout.version_dir(version);
    if !version_dir.is_dir() {
        return Err(EskyError::VersionNotFound {
            version: version.to_string(),
        }
        .into());
    }
    let control = ControlFiles::detect(&version_dir);
    if control.layout() == ControlLayout::Current {
        return Ok(false);
    }

    let _guard = RemovalLock::acquire(control.lock_path(), version)?;
    let control_dir = version_dir.join(CONTROL_DIR);
    let mut txn = Transaction::begin_with(layout.root(), strategy)?;
    txn.add_dir(&control_dir)?;
    txn.move_path(control.manifest_path(), control_dir.join(MANIFEST_FILE))?;
    if control.lock_path().is_file() {
        txn.move_path(control.lock_path(), control_dir.join(LOCK_FILE))?;
    } else {
        txn.add(control_dir.join(LOCK_FILE), Vec::new())?;
    }
    if control.bootstrap_dir().is_dir() {
        txn.move_path(control.bootstrap_dir(), control_dir.join(BOOTSTRAP_DIR))?;
    }
    txn.commit()?;

    info!(version = %version, "migrated legacy control files");
    Ok(true)
}

/// Brings an uninstalled tree (staging copy or `updates/ready` entry) to the
/// current layout with plain renames, creating the lock file and an empty
/// manifest when they are missing.
pub(crate) fn normalize_tree(tree: &Path) -> Result<()> {
    let control = ControlFiles::detect(tree);
    let control_dir = tree.join(CONTROL_DIR);
    fs::create_dir_all(&control_dir)
        .with_context(|| format!("failed to create {}", control_dir.display()))?;

    if control.layout() == ControlLayout::Legacy {
        let moves = [
            (control.manifest_path(), control_dir.join(MANIFEST_FILE)),
            (control.lock_path(), control_dir.join(LOCK_FILE)),
            (control.bootstrap_dir(), control_dir.join(BOOTSTRAP_DIR)),
        ];
        for (from, to) in moves {
            if from.exists() {
                fs::rename(from, &to).with_context(|| {
                    format!("failed to move {} to {}", from.display(), to.display())
                })?;
            }
        }
    }

    let manifest = control_dir.join(MANIFEST_FILE);
    if !manifest.exists() {
        fs::write(&manifest, b"")
            .with_context(|| format!("failed to write {}", manifest.display()))?;
    }
    let lock = control_dir.join(LOCK_FILE);
    OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&lock)
        .with_context(|| format!("failed to create {}", lock.display()))?;
    Ok(())
}
