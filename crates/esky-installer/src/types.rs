use std::path::PathBuf;

use esky_core::VersionName;
use esky_patch::PatchSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockMode {
    Shared,
    Exclusive,
}

impl LockMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Shared => "shared",
            Self::Exclusive => "exclusive",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockWait {
    Block,
    FailFast,
}

/// Lifecycle position of one version directory.
///
/// `Locked` is reported instead of `Removable` for versions that would
/// otherwise be cleaned up but have a live lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionStatus {
    /// Fully prepared under `updates/ready/`, not yet in the app root.
    Fetching,
    /// Committed by this process's manager and not yet activated.
    Installed,
    Active,
    Locked,
    Removable,
}

impl VersionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fetching => "fetching",
            Self::Installed => "installed",
            Self::Active => "active",
            Self::Locked => "locked",
            Self::Removable => "removable",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledVersion {
    pub name: VersionName,
    pub path: PathBuf,
    pub status: VersionStatus,
}

/// What `install_version` materialises a new version directory from.
#[derive(Debug, Clone)]
pub enum InstallSource {
    /// A complete version tree; its directory name is the version name.
    Tree(PathBuf),
    /// A patch against whichever installed version it applies to.
    Patch { name: VersionName, patch: PatchSet },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Active,
    Running,
    Installed,
    Locked,
}

impl SkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Running => "running",
            Self::Installed => "installed",
            Self::Locked => "locked",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub removed: Vec<VersionName>,
    pub skipped: Vec<(VersionName, SkipReason)>,
    pub failed: Vec<(VersionName, String)>,
    /// Scratch directories of crashed transactions that were rolled back.
    pub recovered_transactions: Vec<PathBuf>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}
