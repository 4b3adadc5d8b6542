pub mod bootstrap;
mod control;
mod install;
mod lock;
mod manager;
mod types;
mod uninstall;

pub use control::{migrate_legacy_layout, parse_manifest, ControlFiles, ControlLayout};
pub use lock::{inspect_version_lock, lock_version, unlock_version, LockState};
pub use manager::{list_prepared_versions, scan_versions, VersionManager};
pub use types::{
    CleanupReport, InstallSource, InstalledVersion, LockMode, LockWait, SkipReason, VersionStatus,
};
