use std::path::PathBuf;

use thiserror::Error;

/// Failure taxonomy shared by every esky crate.
///
/// Public functions return `anyhow::Result`; these values travel either as the
/// root error or as a context layer, so callers should look them up with
/// [`EskyError::find`] rather than a plain downcast.
#[derive(Debug, Error)]
pub enum EskyError {
    #[error("path {} resolves outside transaction root {}", path.display(), root.display())]
    ScopeViolation { path: PathBuf, root: PathBuf },

    #[error("transaction step {step} ({op}) failed: {reason}")]
    TransactionFailure {
        step: usize,
        op: String,
        reason: String,
    },

    #[error("version '{version}' is locked")]
    VersionLocked { version: String },

    #[error("lock for version '{version}' is held by another process")]
    LockContention { version: String },

    #[error("corrupt artifact {}: {detail}", path.display())]
    CorruptArtifact { path: PathBuf, detail: String },

    #[error("privileged call '{operation}' rejected: {reason}")]
    PrivilegeRejected { operation: String, reason: String },

    #[error("platform file {} missing for platform '{platform}'", path.display())]
    PlatformMismatch { path: PathBuf, platform: String },

    #[error("elevated helper did not become ready within {seconds}s")]
    ElevationTimeout { seconds: u64 },

    #[error("no update path from {from} to {to}")]
    NoUpdatePath { from: String, to: String },

    #[error("version '{version}' is not installed")]
    VersionNotFound { version: String },
}

impl EskyError {
    /// Returns the outermost taxonomy error, whether it was attached as
    /// context or sits at the root of the chain.
    pub fn find(err: &anyhow::Error) -> Option<&EskyError> {
        err.downcast_ref::<EskyError>()
            .or_else(|| err.chain().find_map(|cause| cause.downcast_ref::<EskyError>()))
    }

    /// Retrying these cannot succeed without operator involvement.
    pub fn is_security_relevant(&self) -> bool {
        matches!(
            self,
            Self::ScopeViolation { .. } | Self::PrivilegeRejected { .. }
        )
    }
}
