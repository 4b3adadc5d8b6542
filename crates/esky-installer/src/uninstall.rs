use std::collections::HashSet;
use std::fs;

use anyhow::{Context, Result};
use esky_core::{EskyError, VersionName};
use tracing::{debug, info, warn};

use crate::control::ControlFiles;
use crate::lock::RemovalLock;
use crate::manager::VersionManager;

impl VersionManager {
    /// Removes one version and the bootstrap files only it needed.
    ///
    /// Fails with [`EskyError::VersionLocked`] while the version is active,
    /// running, or locked by any process, this one included.
    pub fn uninstall_version(&self, version: &VersionName) -> Result<()> {
        if self.designated_active() == Some(version) || self.running_version() == Some(version) {
            return Err(EskyError::VersionLocked {
                version: version.to_string(),
            }
            .into());
        }
        self.remove_version(version)
    }

    pub(crate) fn remove_version(&self, version: &VersionName) -> Result<()> {
        let root = self.layout().root().to_path_buf();
        let version_dir = self.layout().version_dir(version);
        if !version_dir.is_dir() {
            return Err(EskyError::VersionNotFound {
                version: version.to_string(),
            }
            .into());
        }

        let control = ControlFiles::detect(&version_dir);
        let _lock = RemovalLock::acquire(control.lock_path(), version)?;
        let still_needed = self.bootstrap_files_except(version)?;

        let mut txn = self.begin()?;
        txn.delete(&version_dir)?;
        for rel in control.bootstrap_files()? {
            if still_needed.contains(&rel) {
                continue;
            }
            let path = root.join(&rel);
            if fs::symlink_metadata(&path).is_ok() {
                txn.delete(&path)?;
            } else if !version.is_host_platform() {
                let skipped = EskyError::PlatformMismatch {
                    path,
                    platform: version.platform.clone(),
                };
                warn!(version = %version, error = %skipped, "skipping missing platform file");
            } else {
                debug!(version = %version, file = %rel, "bootstrap file already gone");
            }
        }
        txn.commit()
            .with_context(|| format!("failed to uninstall {version}"))?;

        info!(version = %version, "uninstalled version");
        Ok(())
    }

    /// Bootstrap files listed by every installed version except `version`.
    fn bootstrap_files_except(&self, version: &VersionName) -> Result<HashSet<String>> {
        let mut files = HashSet::new();
        for (name, path) in self.scan()? {
            if &name == version {
                continue;
            }
            files.extend(ControlFiles::detect(&path).bootstrap_files()?);
        }
        Ok(files)
    }
}
