use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use esky_core::{AppLayout, VersionNumber};
use esky_security::sha256_file;
use tracing::warn;

const MIB: u64 = 1024 * 1024;
const FULL_INSTALL_GUESS: u64 = 10 * MIB;
const PATCH_GUESS: u64 = 2 * MIB;

/// One artifact line of a summary file:
/// `app platform version from_versions URL [size [sha256]]`.
///
/// `from_versions` is a comma-separated list that may contain wildcards; a
/// line whose list matches the blank version (`*`) is a full install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownFile {
    pub app_name: String,
    pub platform: String,
    pub version: VersionNumber,
    pub version_str: String,
    pub from_versions: Vec<VersionNumber>,
    pub url: String,
    pub size: Option<u64>,
    pub sha256: Option<String>,
}

impl KnownFile {
    pub fn parse_line(line: &str) -> Result<Self> {
        let fields = line.split_whitespace().collect::<Vec<_>>();
        if !(5..=7).contains(&fields.len()) {
            bail!("expected 5 to 7 fields, found {}", fields.len());
        }

        let version = VersionNumber::parse(fields[2])?;
        if version.is_wildcard() || version.is_blank() {
            bail!("target version '{}' must be concrete", fields[2]);
        }
        let from_versions = fields[3]
            .split(',')
            .map(VersionNumber::parse)
            .collect::<Result<Vec<_>>>()
            .with_context(|| format!("invalid from_versions '{}'", fields[3]))?;
        let size = match fields.get(5) {
            Some(raw) => {
                let size = raw
                    .parse::<u64>()
                    .with_context(|| format!("invalid size '{raw}'"))?;
                (size > 0).then_some(size)
            }
            None => None,
        };
        let sha256 = match fields.get(6) {
            Some(raw) if raw.len() == 64 && raw.chars().all(|c| c.is_ascii_hexdigit()) => {
                Some(raw.to_ascii_lowercase())
            }
            Some(raw) => bail!("invalid sha256 '{raw}'"),
            None => None,
        };

        Ok(Self {
            app_name: fields[0].to_string(),
            platform: fields[1].to_string(),
            version,
            version_str: fields[2].to_string(),
            from_versions,
            url: fields[4].to_string(),
            size,
            sha256,
        })
    }

    pub fn is_full(&self) -> bool {
        VersionNumber::blank().in_any(&self.from_versions)
    }

    pub fn upgrades_from(&self, version: &VersionNumber) -> bool {
        version.in_any(&self.from_versions)
    }

    pub fn is_for(&self, app_name: &str, platform: &str) -> bool {
        self.app_name.eq_ignore_ascii_case(app_name) && self.platform.eq_ignore_ascii_case(platform)
    }

    /// Last path segment of the URL, which names the local download.
    pub fn file_name(&self) -> Result<String> {
        let without_query = self.url.split(['?', '#']).next().unwrap_or_default();
        let name = without_query
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or_default();
        if name.is_empty() || name == "." || name == ".." {
            return Err(anyhow!("artifact URL has no file name: {}", self.url));
        }
        Ok(name.to_string())
    }

    pub fn download_path(&self, layout: &AppLayout) -> Result<PathBuf> {
        Ok(layout.download_path(&self.file_name()?))
    }

    /// Checks the local download as well as the summary allows: by sha256
    /// when given, by size otherwise, and by being non-empty as a last resort.
    ///
    /// Junk past the expected size is truncated before hashing.
    pub fn is_verified(&self, path: &Path) -> Result<bool> {
        let actual = match fs::metadata(path) {
            Ok(metadata) => metadata.len(),
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to stat {}", path.display()))
            }
        };

        match (&self.sha256, self.size) {
            (Some(expected), size) => {
                if let Some(size) = size.filter(|size| actual > *size) {
                    OpenOptions::new()
                        .write(true)
                        .open(path)
                        .and_then(|file| file.set_len(size))
                        .with_context(|| format!("failed to truncate {}", path.display()))?;
                }
                Ok(sha256_file(path)?.eq_ignore_ascii_case(expected))
            }
            (None, Some(size)) => Ok(actual == size),
            (None, None) => Ok(actual != 0),
        }
    }

    /// Path cost used by the upgrade planner. Already-verified downloads are
    /// nearly free but still scale with size.
    pub fn cost(&self, verified: bool) -> u64 {
        let size = self.size.unwrap_or(if self.is_full() {
            FULL_INSTALL_GUESS
        } else {
            PATCH_GUESS
        });
        if verified {
            (size / 1024).max(1)
        } else {
            size
        }
    }
}

/// Parses a summary file. Blank lines and `#` comments are skipped; malformed
/// lines are logged and skipped so one bad entry cannot hide the rest.
pub fn parse_summary(text: &str) -> Vec<KnownFile> {
    let mut files = Vec::new();
    for (index, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match KnownFile::parse_line(line) {
            Ok(file) => files.push(file),
            Err(err) => {
                warn!(line = index + 1, error = %format!("{err:#}"), "skipping malformed summary line");
            }
        }
    }
    files
}

/// Resolves a summary entry's URL against the summary's own location, so
/// summaries may list artifacts by bare file name.
pub(crate) fn resolve_url(summary_url: &str, url: &str) -> String {
    if url.contains("://") || Path::new(url).is_absolute() {
        return url.to_string();
    }
    match summary_url.rfind('/') {
        Some(idx) => format!("{}{}", &summary_url[..=idx], url),
        None => url.to_string(),
    }
}
