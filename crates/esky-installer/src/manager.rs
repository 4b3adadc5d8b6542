use std::cmp::Ordering;
use std::fs;
use std::io;
use std::path::PathBuf;

use anyhow::{Context, Result};
use esky_core::{host_platform, AppLayout, EskyError, VersionName};
use esky_fstxn::{recover_stale_transactions, TxnStrategy};
use tracing::{debug, info, warn};

use crate::lock::inspect_version_lock;
use crate::types::{CleanupReport, InstalledVersion, SkipReason, VersionStatus};

/// The Version Directory Manager for one application inside one app root.
///
/// `active` is the version this process treats as current. `running` is the
/// version whose code the process executes; it is never removed. Versions
/// this manager installed stay `Installed` until the next activation.
#[derive(Debug, Clone)]
pub struct VersionManager {
    layout: AppLayout,
    app_name: String,
    platform: String,
    strategy: TxnStrategy,
    active: Option<VersionName>,
    running: Option<VersionName>,
    installed: Vec<VersionName>,
}

impl VersionManager {
    pub fn new(layout: AppLayout, app_name: &str) -> Self {
        Self {
            layout,
            app_name: app_name.to_string(),
            platform: host_platform().to_string(),
            strategy: TxnStrategy::Auto,
            active: None,
            running: None,
            installed: Vec::new(),
        }
    }

    pub fn with_platform(mut self, platform: &str) -> Self {
        self.platform = platform.to_string();
        self
    }

    pub fn with_strategy(mut self, strategy: TxnStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_running(mut self, running: Option<VersionName>) -> Self {
        self.running = running;
        self
    }

    pub fn layout(&self) -> &AppLayout {
        &self.layout
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    pub fn platform(&self) -> &str {
        &self.platform
    }

    pub fn strategy(&self) -> TxnStrategy {
        self.strategy
    }

    /// The version explicitly designated with [`VersionManager::set_active`].
    pub fn designated_active(&self) -> Option<&VersionName> {
        self.active.as_ref()
    }

    pub fn running_version(&self) -> Option<&VersionName> {
        self.running.as_ref()
    }

    /// Designates the current version. Activating any version settles the
    /// versions installed before it, which become removable.
    pub fn set_active(&mut self, version: Option<VersionName>) {
        if let Some(version) = &version {
            info!(version = %version, "activated version");
            self.installed.clear();
        }
        self.active = version;
    }

    pub(crate) fn note_installed(&mut self, version: &VersionName) {
        if !self.installed.contains(version) {
            self.installed.push(version.clone());
        }
    }

    /// The designated active version, falling back to the running one and
    /// then to the newest complete version the bootstrap would pick.
    pub fn active_version(&self) -> Result<Option<VersionName>> {
        if let Some(active) = self.active.clone().or_else(|| self.running.clone()) {
            return Ok(Some(active));
        }
        Ok(crate::bootstrap::newest_complete(&self.scan()?, &self.platform))
    }

    /// Installed versions of this app, most recent first.
    pub fn list_versions(&self) -> Result<Vec<InstalledVersion>> {
        let active = self.active_version()?;
        let mut versions = Vec::new();
        for (name, path) in self.scan()? {
            let status = self.status_of(&name, active.as_ref())?;
            versions.push(InstalledVersion { name, path, status });
        }
        Ok(versions)
    }

    pub fn find_installed(&self, version: &VersionName) -> Result<Option<InstalledVersion>> {
        Ok(self
            .list_versions()?
            .into_iter()
            .find(|installed| &installed.name == version))
    }

    /// True when `cleanup` would remove at least one version. Only looks.
    pub fn needs_cleanup(&self) -> Result<bool> {
        Ok(self
            .list_versions()?
            .iter()
            .any(|installed| installed.status == VersionStatus::Removable))
    }

    /// Removes every version that is not active, running, freshly installed
    /// or locked.
    ///
    /// Per-version failures are collected in the report instead of aborting
    /// the sweep; crashed transactions under the root are rolled back first.
    pub fn cleanup(&self) -> Result<CleanupReport> {
        let mut report = CleanupReport {
            recovered_transactions: recover_stale_transactions(self.layout.root())?,
            ..CleanupReport::default()
        };
        let active = self.active_version()?;
        let scanned = self.scan()?;

        for (name, _) in &scanned {
            if let Some(reason) = self.keep_reason(name, active.as_ref())? {
                debug!(version = %name, reason = reason.as_str(), "cleanup keeps version");
                report.skipped.push((name.clone(), reason));
                continue;
            }
            match self.remove_version(name) {
                Ok(()) => report.removed.push(name.clone()),
                Err(err) => match EskyError::find(&err) {
                    Some(EskyError::VersionLocked { .. }) => {
                        report.skipped.push((name.clone(), SkipReason::Locked));
                    }
                    _ => {
                        let reason = format!("{err:#}");
                        warn!(version = %name, error = %reason, "failed to remove version");
                        report.failed.push((name.clone(), reason));
                    }
                },
            }
        }

        info!(
            removed = report.removed.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            "cleanup finished"
        );
        Ok(report)
    }

    pub(crate) fn scan(&self) -> Result<Vec<(VersionName, PathBuf)>> {
        scan_versions(&self.layout, &self.app_name)
    }

    fn keep_reason(
        &self,
        name: &VersionName,
        active: Option<&VersionName>,
    ) -> Result<Option<SkipReason>> {
        if self.running.as_ref() == Some(name) {
            return Ok(Some(SkipReason::Running));
        }
        if active == Some(name) {
            return Ok(Some(SkipReason::Active));
        }
        if self.installed.contains(name) {
            return Ok(Some(SkipReason::Installed));
        }
        if inspect_version_lock(&self.layout, name)?.is_locked() {
            return Ok(Some(SkipReason::Locked));
        }
        Ok(None)
    }

    fn status_of(&self, name: &VersionName, active: Option<&VersionName>) -> Result<VersionStatus> {
        let status = match self.keep_reason(name, active)? {
            Some(SkipReason::Active | SkipReason::Running) => VersionStatus::Active,
            Some(SkipReason::Installed) => VersionStatus::Installed,
            Some(SkipReason::Locked) => VersionStatus::Locked,
            None => VersionStatus::Removable,
        };
        Ok(status)
    }
}

/// Version directories of `app_name` under the app root, most recent first.
///
/// Entries whose names do not parse, dot-prefixed entries (transaction
/// scratch) and plain files are ignored.
pub fn scan_versions(layout: &AppLayout, app_name: &str) -> Result<Vec<(VersionName, PathBuf)>> {
    let root = layout.root();
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err).with_context(|| format!("failed to read {}", root.display())),
    };

    let mut versions = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("failed to read {}", root.display()))?;
        let file_name = entry.file_name();
        let Some(file_name) = file_name.to_str() else {
            continue;
        };
        if file_name.starts_with('.') || !entry.path().is_dir() {
            continue;
        }
        let Ok(name) = VersionName::parse(file_name) else {
            continue;
        };
        if name.app_name.eq_ignore_ascii_case(app_name) {
            versions.push((name, entry.path()));
        }
    }
    versions.sort_by(|(left, _), (right, _)| newest_first(left, right));
    Ok(versions)
}

/// Prepared versions waiting in `updates/ready/`, most recent first.
pub fn list_prepared_versions(layout: &AppLayout, app_name: &str) -> Result<Vec<InstalledVersion>> {
    let ready = AppLayout::new(layout.ready_dir());
    Ok(scan_versions(&ready, app_name)?
        .into_iter()
        .map(|(name, path)| InstalledVersion {
            name,
            path,
            status: VersionStatus::Fetching,
        })
        .collect())
}

pub(crate) fn newest_first(left: &VersionName, right: &VersionName) -> Ordering {
    right
        .version
        .cmp_lenient(&left.version)
        .then_with(|| right.is_host_platform().cmp(&left.is_host_platform()))
        .then_with(|| left.platform.cmp(&right.platform))
        .then_with(|| left.version_str.cmp(&right.version_str))
}
