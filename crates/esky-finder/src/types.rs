use esky_core::{host_platform, AppLayout, VersionName, VersionNumber};

/// What a finder needs to know about the application it updates.
#[derive(Debug, Clone)]
pub struct FinderContext {
    pub layout: AppLayout,
    pub app_name: String,
    pub platform: String,
    /// Version the update starts from; `None` for a fresh install.
    pub current: Option<VersionName>,
}

impl FinderContext {
    pub fn new(layout: AppLayout, app_name: &str) -> Self {
        Self {
            layout,
            app_name: app_name.to_string(),
            platform: host_platform().to_string(),
            current: None,
        }
    }

    pub fn with_platform(mut self, platform: &str) -> Self {
        self.platform = platform.to_string();
        self
    }

    pub fn with_current(mut self, current: Option<VersionName>) -> Self {
        self.current = current;
        self
    }

    /// The current version number, blank when nothing is installed yet.
    pub fn source_version(&self) -> VersionNumber {
        self.current
            .as_ref()
            .map(|current| current.version.clone())
            .unwrap_or_else(VersionNumber::blank)
    }

    pub fn version_name(&self, version: &str) -> anyhow::Result<VersionName> {
        VersionName::new(&self.app_name, version, &self.platform)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadPhase {
    Downloading,
    /// The artifact on disk passed size and checksum checks.
    Verified,
    Preparing,
    Ready,
}

impl DownloadPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Downloading => "downloading",
            Self::Verified => "verified",
            Self::Preparing => "preparing",
            Self::Ready => "ready",
        }
    }
}

/// One progress report from a fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadStatus {
    pub fetched: u64,
    pub total: Option<u64>,
    pub file: String,
    pub phase: DownloadPhase,
}
