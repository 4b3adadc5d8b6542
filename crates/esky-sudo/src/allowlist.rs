use std::fmt;

use anyhow::Result;
use esky_core::{EskyError, VersionNumber};
use tracing::warn;

/// Log target for everything the privileged side refuses.
pub const SECURITY_TARGET: &str = "esky::security";

/// The operations an elevated helper will perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    HasRoot,
    FetchVersion { version: String },
    InstallVersion { version: String },
    UninstallVersion { version: String },
    Cleanup,
}

type Validator = fn(&[String]) -> std::result::Result<Operation, String>;

/// Operation name to argument validator. Anything not listed is refused.
static ALLOWED_CALLS: &[(&str, Validator)] = &[
    ("has_root", |args| no_args(args).map(|()| Operation::HasRoot)),
    ("fetch_version", |args| {
        one_version(args).map(|version| Operation::FetchVersion { version })
    }),
    ("install_version", |args| {
        one_version(args).map(|version| Operation::InstallVersion { version })
    }),
    ("uninstall_version", |args| {
        one_version(args).map(|version| Operation::UninstallVersion { version })
    }),
    ("cleanup", |args| no_args(args).map(|()| Operation::Cleanup)),
];

pub fn is_call_allowed(name: &str) -> bool {
    ALLOWED_CALLS.iter().any(|(allowed, _)| *allowed == name)
}

/// A call that passed the allow-list. The only way to get one is
/// [`PrivilegedCall::validate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrivilegedCall {
    name: &'static str,
    operation: Operation,
}

impl PrivilegedCall {
    /// Checks `name` and `args` against the allow-list. Refusals are logged
    /// under [`SECURITY_TARGET`] and returned as
    /// [`EskyError::PrivilegeRejected`].
    pub fn validate(name: &str, args: &[String]) -> Result<Self> {
        let Some((allowed, validator)) = ALLOWED_CALLS.iter().find(|(allowed, _)| *allowed == name)
        else {
            return Err(reject(name, args, "operation is not allowed".to_string()));
        };
        match validator(args) {
            Ok(operation) => Ok(Self {
                name: allowed,
                operation,
            }),
            Err(reason) => Err(reject(name, args, reason)),
        }
    }

    pub fn has_root() -> Self {
        Self {
            name: "has_root",
            operation: Operation::HasRoot,
        }
    }

    pub fn cleanup() -> Self {
        Self {
            name: "cleanup",
            operation: Operation::Cleanup,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn operation(&self) -> &Operation {
        &self.operation
    }

    /// Arguments as they travel on the wire.
    pub fn args(&self) -> Vec<String> {
        match &self.operation {
            Operation::HasRoot | Operation::Cleanup => Vec::new(),
            Operation::FetchVersion { version }
            | Operation::InstallVersion { version }
            | Operation::UninstallVersion { version } => vec![version.clone()],
        }
    }
}

impl fmt::Display for PrivilegedCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.args().join(", "))
    }
}

fn reject(name: &str, args: &[String], reason: String) -> anyhow::Error {
    warn!(
        target: SECURITY_TARGET,
        operation = %name.escape_debug(),
        args = ?args,
        reason = %reason,
        "rejected privileged call"
    );
    EskyError::PrivilegeRejected {
        operation: name.escape_debug().to_string(),
        reason,
    }
    .into()
}

fn no_args(args: &[String]) -> std::result::Result<(), String> {
    if args.is_empty() {
        Ok(())
    } else {
        Err(format!("expected no arguments, got {}", args.len()))
    }
}

/// Exactly one concrete version number with nothing path-like in it.
fn one_version(args: &[String]) -> std::result::Result<String, String> {
    let [version] = args else {
        return Err(format!("expected one version argument, got {}", args.len()));
    };
    if version.is_empty()
        || version.contains(['/', '\\'])
        || version.contains("..")
        || version.chars().any(|c| c.is_whitespace() || c.is_control())
    {
        return Err(format!("'{}' is not a plain version", version.escape_debug()));
    }
    let parsed = VersionNumber::parse(version)
        .map_err(|err| format!("'{}' is not a version: {err}", version.escape_debug()))?;
    if parsed.is_wildcard() || parsed.is_blank() {
        return Err(format!("'{version}' must be a concrete version"));
    }
    Ok(version.clone())
}
