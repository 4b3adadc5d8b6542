use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use esky_core::host_platform;
use esky_fstxn::TxnStrategy;
use serde::{Deserialize, Serialize};

pub const CONFIG_ENV: &str = "ESKY_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "esky.toml";
const DEFAULT_READY_TIMEOUT_SECS: u64 = 30;

/// Contents of `esky.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct EskyConfig {
    pub app_name: String,
    /// Defaults to the host platform tag.
    pub platform: Option<String>,
    pub app_root: PathBuf,
    #[serde(default)]
    pub finder: FinderConfig,
    #[serde(default)]
    pub transaction: TransactionConfig,
    #[serde(default)]
    pub escalation: EscalationConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct FinderConfig {
    pub summary_url: Option<String>,
    /// Hex Ed25519 key; when set the summary must carry a valid `.sig`.
    pub public_key_hex: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct TransactionConfig {
    #[serde(default)]
    pub strategy: TxnStrategy,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct EscalationConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Argv prefix for the helper, such as `["sudo", "-n"]`.
    #[serde(default)]
    pub wrapper: Vec<String>,
    /// Defaults to the running executable.
    pub helper_program: Option<PathBuf>,
    #[serde(default = "default_ready_timeout_secs")]
    pub ready_timeout_secs: u64,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            wrapper: Vec::new(),
            helper_program: None,
            ready_timeout_secs: DEFAULT_READY_TIMEOUT_SECS,
        }
    }
}

impl EscalationConfig {
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }
}

fn default_ready_timeout_secs() -> u64 {
    DEFAULT_READY_TIMEOUT_SECS
}

impl EskyConfig {
    pub fn new(app_name: &str, app_root: impl Into<PathBuf>) -> Self {
        Self {
            app_name: app_name.to_string(),
            platform: None,
            app_root: app_root.into(),
            finder: FinderConfig::default(),
            transaction: TransactionConfig::default(),
            escalation: EscalationConfig::default(),
        }
    }

    pub fn from_toml_str(input: &str) -> Result<Self> {
        let config: Self = toml::from_str(input).context("failed to parse esky config")?;
        if config.app_name.trim().is_empty() {
            return Err(anyhow!("app_name must not be empty"));
        }
        if config.app_name.contains(['/', '\\']) {
            return Err(anyhow!(
                "app_name '{}' must not contain path separators",
                config.app_name
            ));
        }
        if config.escalation.enabled && config.escalation.ready_timeout_secs == 0 {
            return Err(anyhow!("escalation.ready_timeout_secs must be positive"));
        }
        Ok(config)
    }

    /// Reads `path`. A relative `app_root` is taken relative to the file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let mut config = Self::from_toml_str(&content)
            .with_context(|| format!("invalid config {}", path.display()))?;
        if config.app_root.is_relative() {
            if let Some(base) = path.parent() {
                config.app_root = base.join(&config.app_root);
            }
        }
        Ok(config)
    }

    /// Picks the config file: `explicit`, then `ESKY_CONFIG`, then
    /// `esky.toml` in the working directory.
    pub fn locate(explicit: Option<&Path>) -> PathBuf {
        if let Some(path) = explicit {
            return path.to_path_buf();
        }
        match std::env::var_os(CONFIG_ENV) {
            Some(path) if !path.is_empty() => PathBuf::from(path),
            _ => PathBuf::from(DEFAULT_CONFIG_FILE),
        }
    }

    pub fn platform(&self) -> &str {
        self.platform.as_deref().unwrap_or_else(|| host_platform())
    }
}
