use std::io;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use esky_core::{AppLayout, EskyError, VersionName};
use esky_finder::{DownloadStatus, FinderContext, SummaryVersionFinder, VersionFinder};
use esky_fstxn::TxnStrategy;
use esky_installer::bootstrap::ESKY_VERSION_ENV;
use esky_installer::{CleanupReport, InstallSource, InstalledVersion, VersionManager};
use esky_security::Ed25519Verifier;
use esky_sudo::{HelperClient, PrivilegedCall, PrivilegedOps, SpawnConfig};
use tracing::{debug, info, warn};

use crate::config::EskyConfig;

/// Steps of an update, in the order `auto_update` runs them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum UpdateStep {
    Fetch,
    Install,
    Cleanup,
}

impl UpdateStep {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fetch => "fetch",
            Self::Install => "install",
            Self::Cleanup => "cleanup",
        }
    }
}

/// A self-updating application rooted at one app directory.
pub struct Esky {
    layout: AppLayout,
    app_name: String,
    platform: String,
    manager: VersionManager,
    finder: Option<Box<dyn VersionFinder>>,
    escalation: Option<SpawnConfig>,
    helper: Option<HelperClient>,
}

impl Esky {
    pub fn new(app_root: impl Into<PathBuf>, app_name: &str) -> Self {
        let layout = AppLayout::new(app_root);
        let manager = VersionManager::new(layout.clone(), app_name);
        let platform = manager.platform().to_string();
        Self {
            layout,
            app_name: app_name.to_string(),
            platform,
            manager,
            finder: None,
            escalation: None,
            helper: None,
        }
    }

    /// Builds the handle `config` describes. The running version comes from
    /// `ESKY_VERSION` when the bootstrap loader set it.
    pub fn from_config(config: &EskyConfig) -> Result<Self> {
        let strategy = config.transaction.strategy;
        let mut esky = Self::new(&config.app_root, &config.app_name)
            .with_platform(config.platform())
            .with_strategy(strategy)
            .with_running(running_from_env(&config.app_name)?);

        if let Some(url) = &config.finder.summary_url {
            let mut finder = SummaryVersionFinder::new(url.as_str()).with_strategy(strategy);
            if let Some(key) = &config.finder.public_key_hex {
                finder = finder.with_verifier(Box::new(
                    Ed25519Verifier::new(key.as_str()).context("invalid finder.public_key_hex")?,
                ));
            }
            esky = esky.with_finder(Box::new(finder));
        }

        if config.escalation.enabled {
            let program = match &config.escalation.helper_program {
                Some(program) => program.clone(),
                None => std::env::current_exe().context("failed to locate the helper program")?,
            };
            let mut spawn = SpawnConfig::new(program);
            spawn.wrapper = config.escalation.wrapper.clone();
            spawn.ready_timeout = config.escalation.ready_timeout();
            esky = esky.with_escalation(Some(spawn));
        }
        Ok(esky)
    }

    pub fn with_platform(mut self, platform: &str) -> Self {
        self.platform = platform.to_string();
        self.manager = self.manager.with_platform(platform);
        self
    }

    pub fn with_strategy(mut self, strategy: TxnStrategy) -> Self {
        self.manager = self.manager.with_strategy(strategy);
        self
    }

    pub fn with_running(mut self, running: Option<VersionName>) -> Self {
        self.manager = self.manager.with_running(running);
        self
    }

    pub fn with_finder(mut self, finder: Box<dyn VersionFinder>) -> Self {
        self.finder = Some(finder);
        self
    }

    pub fn with_escalation(mut self, escalation: Option<SpawnConfig>) -> Self {
        self.escalation = escalation;
        self
    }

    /// Arguments the helper program is started with, ahead of `--token`.
    pub fn with_helper_args(mut self, args: Vec<String>) -> Self {
        if let Some(spawn) = self.escalation.as_mut() {
            spawn.args = args;
        }
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

    pub fn manager(&self) -> &VersionManager {
        &self.manager
    }

    pub fn version_name(&self, version: &str) -> Result<VersionName> {
        VersionName::new(&self.app_name, version, &self.platform)
    }

    pub fn active_version(&self) -> Result<Option<VersionName>> {
        self.manager.active_version()
    }

    pub fn list_versions(&self) -> Result<Vec<InstalledVersion>> {
        self.manager.list_versions()
    }

    pub fn finder_context(&self) -> Result<FinderContext> {
        Ok(FinderContext::new(self.layout.clone(), &self.app_name)
            .with_platform(&self.platform)
            .with_current(self.active_version()?))
    }

    fn finder(&mut self) -> Result<&mut Box<dyn VersionFinder>> {
        self.finder
            .as_mut()
            .ok_or_else(|| anyhow!("no update source configured for {}", self.app_name))
    }

    /// Newer versions that can be reached from the active one, newest first.
    pub fn find_versions(&mut self) -> Result<Vec<VersionName>> {
        let ctx = self.finder_context()?;
        self.finder()?.find_versions(&ctx)
    }

    /// The newest reachable version that is not installed yet.
    pub fn find_update(&mut self) -> Result<Option<VersionName>> {
        for version in self.find_versions()? {
            if self.manager.find_installed(&version)?.is_none() {
                return Ok(Some(version));
            }
            debug!(version = %version, "newest candidate already installed");
        }
        Ok(None)
    }

    pub fn fetch_version(
        &mut self,
        version: &VersionName,
        callback: &mut dyn FnMut(&DownloadStatus),
    ) -> Result<PathBuf> {
        let ctx = self.finder_context()?;
        self.finder()?.fetch_version(&ctx, version, callback)
    }

    /// Installs the prepared tree of `version` next to the existing ones.
    pub fn install_version(&mut self, version: &VersionName) -> Result<VersionName> {
        if let Some(installed) = self.manager.find_installed(version)? {
            return Ok(installed.name);
        }
        let ctx = self.finder_context()?;
        let ready = self
            .finder()?
            .has_version(&ctx, version)?
            .ok_or_else(|| EskyError::VersionNotFound {
                version: version.to_string(),
            })?;
        self.manager.install_version(InstallSource::Tree(ready))
    }

    pub fn uninstall_version(&mut self, version: &VersionName) -> Result<()> {
        self.manager.uninstall_version(version)
    }

    pub fn needs_cleanup(&self) -> Result<bool> {
        if self.manager.needs_cleanup()? {
            return Ok(true);
        }
        match &self.finder {
            Some(finder) => finder.needs_cleanup(&self.finder_context()?),
            None => Ok(false),
        }
    }

    /// Removes unused versions, then the finder's leftovers.
    pub fn cleanup(&mut self) -> Result<CleanupReport> {
        let report = self.manager.cleanup()?;
        if self.finder.is_some() {
            let ctx = self.finder_context()?;
            self.finder()?.cleanup(&ctx)?;
        }
        Ok(report)
    }

    /// Whether operations run as root, asking the helper when one is up.
    pub fn has_root(&mut self) -> Result<bool> {
        match self.helper.as_mut() {
            Some(helper) => Ok(helper
                .call(&PrivilegedCall::has_root())?
                .as_bool()
                .unwrap_or(false)),
            None => Ok(esky_sudo::has_root()),
        }
    }

    /// Starts the elevated helper unless one is already running.
    pub fn get_root(&mut self) -> Result<()> {
        if self.helper.is_some() {
            return Ok(());
        }
        let spawn = self
            .escalation
            .as_ref()
            .ok_or_else(|| anyhow!("privilege escalation is not enabled"))?;
        info!(program = %spawn.program.display(), "starting elevated helper");
        self.helper = Some(HelperClient::spawn(spawn)?);
        Ok(())
    }

    /// Shuts the helper down and, when running as root under sudo, switches
    /// back to the invoking user.
    pub fn drop_root(&mut self) -> Result<()> {
        if let Some(helper) = self.helper.take() {
            helper.shutdown()?;
        }
        esky_sudo::drop_root()?;
        Ok(())
    }

    /// Finds, fetches and installs the newest version, then cleans up. A
    /// permission error escalates through the helper when allowed and the
    /// remaining steps run there. Returns the installed version.
    pub fn auto_update(
        &mut self,
        callback: &mut dyn FnMut(&DownloadStatus),
    ) -> Result<Option<VersionName>> {
        let Some(target) = self.find_update()? else {
            info!(app = %self.app_name, "no update available");
            return Ok(None);
        };
        info!(version = %target, "updating");

        let outcome = self.update_locally(&target, callback);
        let result = match outcome {
            Ok(()) => Ok(Some(target)),
            Err((step, err)) if self.may_escalate(&err) => {
                warn!(
                    step = step.as_str(),
                    error = %format!("{err:#}"),
                    "permission denied; escalating"
                );
                self.update_elevated(&target, step).map(|()| Some(target))
            }
            Err((_, err)) => Err(err),
        };
        let dropped = self.drop_root();
        let updated = result?;
        dropped?;
        Ok(updated)
    }

    fn update_locally(
        &mut self,
        target: &VersionName,
        callback: &mut dyn FnMut(&DownloadStatus),
    ) -> std::result::Result<(), (UpdateStep, anyhow::Error)> {
        self.fetch_version(target, callback)
            .map_err(|err| (UpdateStep::Fetch, err))?;
        let installed = self
            .install_version(target)
            .map_err(|err| (UpdateStep::Install, err))?;
        self.manager.set_active(Some(installed));
        self.cleanup_after_update()
            .map_err(|err| (UpdateStep::Cleanup, err))
    }

    fn update_elevated(&mut self, target: &VersionName, from: UpdateStep) -> Result<()> {
        self.get_root()?;
        let version = target.version_str.clone();
        let helper = self
            .helper
            .as_mut()
            .ok_or_else(|| anyhow!("elevated helper is not running"))?;
        if from <= UpdateStep::Fetch {
            helper.call(&PrivilegedCall::validate("fetch_version", &[version.clone()])?)?;
        }
        if from <= UpdateStep::Install {
            helper.call(&PrivilegedCall::validate("install_version", &[version])?)?;
            self.manager.set_active(Some(target.clone()));
        }
        if let Err(err) = helper.call(&PrivilegedCall::cleanup()) {
            warn!(error = %format!("{err:#}"), "elevated cleanup failed");
        }
        Ok(())
    }

    fn cleanup_after_update(&mut self) -> Result<()> {
        let report = match self.cleanup() {
            Ok(report) => report,
            Err(err) if is_permission_error(&err) => return Err(err),
            Err(err) => {
                warn!(error = %format!("{err:#}"), "cleanup after update failed");
                return Ok(());
            }
        };
        for (version, reason) in &report.failed {
            warn!(version = %version, reason = %reason, "could not remove old version");
        }
        Ok(())
    }

    fn may_escalate(&self, err: &anyhow::Error) -> bool {
        let security = EskyError::find(err).is_some_and(EskyError::is_security_relevant);
        self.escalation.is_some() && !security && is_permission_error(err)
    }
}

/// Serves the helper's allow-listed calls from this handle.
impl PrivilegedOps for Esky {
    fn has_root(&mut self) -> Result<bool> {
        Ok(esky_sudo::has_root())
    }

    fn fetch_version(&mut self, version: &str) -> Result<PathBuf> {
        let name = self.version_name(version)?;
        Esky::fetch_version(self, &name, &mut |status| {
            debug!(file = %status.file, phase = status.phase.as_str(), "elevated fetch");
        })
    }

    fn install_version(&mut self, version: &str) -> Result<()> {
        let name = self.version_name(version)?;
        Esky::install_version(self, &name).map(|_| ())
    }

    fn uninstall_version(&mut self, version: &str) -> Result<()> {
        let name = self.version_name(version)?;
        Esky::uninstall_version(self, &name)
    }

    fn cleanup(&mut self) -> Result<()> {
        Esky::cleanup(self).map(|_| ())
    }
}

/// True when anything in the error chain is an OS permission refusal.
pub fn is_permission_error(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<io::Error>()
            .is_some_and(|io_err| io_err.kind() == io::ErrorKind::PermissionDenied)
    })
}

/// The version the bootstrap loader chainloaded into, if any.
pub fn running_from_env(app_name: &str) -> Result<Option<VersionName>> {
    let Some(raw) = std::env::var_os(ESKY_VERSION_ENV) else {
        return Ok(None);
    };
    let raw = raw
        .into_string()
        .map_err(|raw| anyhow!("{ESKY_VERSION_ENV} is not valid unicode: {raw:?}"))?;
    let name = VersionName::parse(&raw)
        .with_context(|| format!("{ESKY_VERSION_ENV} does not name a version: {raw}"))?;
    if !name.app_name.eq_ignore_ascii_case(app_name) {
        warn!(running = %name, app = app_name, "ignoring {ESKY_VERSION_ENV} of another app");
        return Ok(None);
    }
    Ok(Some(name))
}
