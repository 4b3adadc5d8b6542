mod error;
mod layout;
mod name;
mod version;

pub use error::EskyError;
pub use layout::{
    AppLayout, BOOTSTRAP_DIR, CONTROL_DIR, LEGACY_MANIFEST_FILE, LOCK_FILE, MANIFEST_FILE,
};
pub use name::{host_platform, VersionName};
pub use version::VersionNumber;
