use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::VersionName;

pub const CONTROL_DIR: &str = "esky-files";
pub const MANIFEST_FILE: &str = "bootstrap-manifest.txt";
pub const LOCK_FILE: &str = "esky-lockfile.txt";
pub const BOOTSTRAP_DIR: &str = "bootstrap";
pub const LEGACY_MANIFEST_FILE: &str = "esky-bootstrap.txt";

/// On-disk layout of one application directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppLayout {
    root: PathBuf,
}

impl AppLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn version_dir(&self, name: &VersionName) -> PathBuf {
        self.root.join(name.dir_name())
    }

    pub fn control_dir(&self, name: &VersionName) -> PathBuf {
        self.version_dir(name).join(CONTROL_DIR)
    }

    pub fn manifest_path(&self, name: &VersionName) -> PathBuf {
        self.control_dir(name).join(MANIFEST_FILE)
    }

    pub fn lock_path(&self, name: &VersionName) -> PathBuf {
        self.control_dir(name).join(LOCK_FILE)
    }

    pub fn updates_dir(&self) -> PathBuf {
        self.root.join("updates")
    }

    pub fn downloads_dir(&self) -> PathBuf {
        self.updates_dir().join("downloads")
    }

    pub fn unpack_dir(&self) -> PathBuf {
        self.updates_dir().join("unpack")
    }

    pub fn ready_dir(&self) -> PathBuf {
        self.updates_dir().join("ready")
    }

    pub fn ready_path(&self, name: &VersionName) -> PathBuf {
        self.ready_dir().join(name.dir_name())
    }

    pub fn download_path(&self, file_name: &str) -> PathBuf {
        self.downloads_dir().join(file_name)
    }

    pub fn ensure_update_dirs(&self) -> Result<()> {
        for dir in [
            self.updates_dir(),
            self.downloads_dir(),
            self.unpack_dir(),
            self.ready_dir(),
        ] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }
}
