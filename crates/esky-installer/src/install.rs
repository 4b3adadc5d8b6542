use std::cmp::Ordering;
use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use esky_core::{EskyError, VersionName};
use esky_fstxn::{copy_dir_recursive, remove_path, Transaction};
use esky_patch::{apply_patch_in_place, PatchSet};
use tracing::{debug, info, warn};

use crate::control::{normalize_tree, ControlFiles};
use crate::lock::{lock_version, unlock_version};
use crate::manager::VersionManager;
use crate::types::{InstallSource, LockMode, LockWait};

impl VersionManager {
    /// Materialises a new version directory in one transaction, together
    /// with the bootstrap files its manifest lists.
    ///
    /// Installing a version that is already present is a no-op.
    pub fn install_version(&mut self, source: InstallSource) -> Result<VersionName> {
        match source {
            InstallSource::Tree(tree) => self.install_tree(&tree),
            InstallSource::Patch { name, patch } => self.install_patch(&name, &patch),
        }
    }

    fn install_tree(&mut self, tree: &Path) -> Result<VersionName> {
        let dir_name = tree
            .file_name()
            .and_then(|name| name.to_str())
            .with_context(|| format!("version tree has no usable name: {}", tree.display()))?;
        let name = VersionName::parse(dir_name).with_context(|| {
            format!("{} is not named like a version directory", tree.display())
        })?;
        if self.is_installed(&name) {
            return Ok(name);
        }

        let mut txn = self.begin()?;
        let tree = tree
            .canonicalize()
            .with_context(|| format!("version tree does not exist: {}", tree.display()))?;
        let staged = if tree.starts_with(txn.root()) {
            tree
        } else {
            let staging = txn.staging_dir("install")?;
            copy_dir_recursive(&tree, &staging)?;
            staging
        };
        normalize_tree(&staged)?;
        self.finish_install(txn, &name, &staged)?;
        Ok(name)
    }

    fn install_patch(&mut self, name: &VersionName, patch: &PatchSet) -> Result<VersionName> {
        if self.is_installed(name) {
            return Ok(name.clone());
        }

        let candidates = self
            .scan()?
            .into_iter()
            .filter(|(candidate, _)| {
                candidate.platform.eq_ignore_ascii_case(&name.platform)
                    && candidate.version.cmp_lenient(&name.version) != Ordering::Greater
            })
            .collect::<Vec<_>>();

        let mut txn = self.begin()?;
        let mut last_err = None;
        for (candidate, path) in &candidates {
            let staging = txn.staging_dir("patch")?;
            match self.patch_from(candidate, path, &staging, patch) {
                Ok(()) => {
                    normalize_tree(&staging)?;
                    self.finish_install(txn, name, &staging)?;
                    info!(from = %candidate, version = %name, "installed version from patch");
                    return Ok(name.clone());
                }
                Err(err) => {
                    warn!(
                        from = %candidate,
                        version = %name,
                        error = %format!("{err:#}"),
                        "patch does not apply, trying an older version"
                    );
                    remove_path(&staging)
                        .with_context(|| format!("failed to remove {}", staging.display()))?;
                    last_err = Some(err);
                }
            }
        }

        let from = candidates
            .iter()
            .map(|(candidate, _)| candidate.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        let err = last_err.unwrap_or_else(|| anyhow!("no installed version to patch from"));
        Err(err.context(EskyError::NoUpdatePath {
            from: if from.is_empty() {
                "nothing installed".to_string()
            } else {
                from
            },
            to: name.to_string(),
        }))
    }

    /// Copies `candidate` into `staging` under a shared lock and patches the
    /// copy.
    fn patch_from(
        &self,
        candidate: &VersionName,
        path: &Path,
        staging: &Path,
        patch: &PatchSet,
    ) -> Result<()> {
        lock_version(self.layout(), candidate, LockMode::Shared, LockWait::FailFast)?;
        let copied = copy_dir_recursive(path, staging);
        unlock_version(self.layout(), candidate)?;
        copied?;
        apply_patch_in_place(patch, staging)
    }

    /// Commits the staged tree as `name`. Another process that installed
    /// the same version first wins; its directory is never replaced.
    pub(crate) fn finish_install(
        &mut self,
        mut txn: Transaction,
        name: &VersionName,
        staged: &Path,
    ) -> Result<()> {
        let root = txn.root().to_path_buf();
        let control = ControlFiles::detect(staged);
        for rel in control.bootstrap_files()? {
            let source = control.bootstrap_dir().join(&rel);
            if !source.is_file() {
                let missing = anyhow!(EskyError::PlatformMismatch {
                    path: source,
                    platform: name.platform.clone(),
                });
                return Err(missing.context(format!(
                    "cannot install {name}: bootstrap file '{rel}' is missing"
                )));
            }
            debug!(version = %name, file = %rel, "queued bootstrap file");
            txn.copy_file(&source, root.join(&rel))?;
        }

        // Bootstrap copies read from `staged`, so they are queued before the move.
        let version_dir = root.join(name.dir_name());
        txn.move_new(staged, &version_dir)?;
        if let Err(err) = txn.commit() {
            if version_dir.is_dir() {
                info!(version = %name, "version was installed concurrently");
                return Ok(());
            }
            return Err(err.context(format!("failed to install {name}")));
        }
        self.note_installed(name);
        info!(version = %name, "installed version");
        Ok(())
    }

    fn is_installed(&self, name: &VersionName) -> bool {
        let installed = self.layout().version_dir(name).is_dir();
        if installed {
            info!(version = %name, "version is already installed");
        }
        installed
    }

    pub(crate) fn begin(&self) -> Result<Transaction> {
        let root = self.layout().root();
        fs::create_dir_all(root).with_context(|| format!("failed to create {}", root.display()))?;
        Transaction::begin_with(root, self.strategy())
    }
}
