use std::fmt;
use std::sync::LazyLock;

use anyhow::{anyhow, Result};

use crate::VersionNumber;

static HOST_PLATFORM: LazyLock<String> =
    LazyLock::new(|| format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH));

/// Platform tag of the running host, e.g. `linux-x86_64`.
pub fn host_platform() -> &'static str {
    HOST_PLATFORM.as_str()
}

/// Parsed `<appname>-<version>-<platform>` directory name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VersionName {
    pub app_name: String,
    /// Version text exactly as it appears on disk or in a summary file.
    pub version_str: String,
    pub version: VersionNumber,
    pub platform: String,
}

impl VersionName {
    pub fn new(app_name: &str, version: &str, platform: &str) -> Result<Self> {
        let name = Self::parse(&format!("{app_name}-{version}-{platform}"))?;
        if name.app_name != app_name || name.version_str != version {
            return Err(anyhow!(
                "'{app_name}' / '{version}' do not form an unambiguous version name"
            ));
        }
        Ok(name)
    }

    /// Splits a directory name. The version is the first `-`-separated token
    /// after the app name that starts with a digit; everything after it is the
    /// platform, so both app names and platforms may contain dashes.
    pub fn parse(raw: &str) -> Result<Self> {
        let tokens = raw.split('-').collect::<Vec<_>>();
        let version_idx = tokens
            .iter()
            .enumerate()
            .skip(1)
            .find(|(_, token)| token.starts_with(|c: char| c.is_ascii_digit()))
            .map(|(idx, _)| idx)
            .ok_or_else(|| anyhow!("no version component in '{raw}'"))?;

        let app_name = tokens[..version_idx].join("-");
        let platform = tokens[version_idx + 1..].join("-");
        if app_name.is_empty() {
            return Err(anyhow!("empty app name in '{raw}'"));
        }
        if platform.is_empty() {
            return Err(anyhow!("empty platform in '{raw}'"));
        }

        let version = VersionNumber::parse(tokens[version_idx])?;
        if version.is_wildcard() || version.is_blank() {
            return Err(anyhow!("version in '{raw}' must be concrete"));
        }

        Ok(Self {
            app_name,
            version_str: tokens[version_idx].to_string(),
            version,
            platform,
        })
    }

    pub fn dir_name(&self) -> String {
        self.to_string()
    }

    pub fn is_host_platform(&self) -> bool {
        self.platform == host_platform()
    }

    /// Case-insensitive identity check used when matching remote candidates.
    pub fn same_app(&self, app_name: &str, platform: &str) -> bool {
        self.app_name.eq_ignore_ascii_case(app_name)
            && self.platform.eq_ignore_ascii_case(platform)
    }
}

impl fmt::Display for VersionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.app_name, self.version_str, self.platform)
    }
}
