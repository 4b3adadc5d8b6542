//! What the bootstrap stub in the app root does before the application
//! proper starts: pick a version, pin it with a shared lock, exec it.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{bail, Context, Result};
use esky_core::{host_platform, AppLayout, EskyError, VersionName};
use tracing::{debug, warn};

use crate::control::ControlFiles;
use crate::lock::{lock_version_keyed, unlock_key, with_held_file};
use crate::manager::scan_versions;
use crate::types::{LockMode, LockWait};

/// Tells the chainloaded process which version directory it runs from.
pub const ESKY_VERSION_ENV: &str = "ESKY_VERSION";

/// Newest complete version of `app_name`, preferring the host platform.
pub fn resolve_active_version(layout: &AppLayout, app_name: &str) -> Result<VersionName> {
    newest_complete(&scan_versions(layout, app_name)?, host_platform()).ok_or_else(|| {
        EskyError::VersionNotFound {
            version: format!("any complete {app_name} version"),
        }
        .into()
    })
}

pub(crate) fn newest_complete(
    scanned: &[(VersionName, PathBuf)],
    platform: &str,
) -> Option<VersionName> {
    let mut fallback = None;
    for (name, path) in scanned {
        if !ControlFiles::detect(path).is_complete() {
            continue;
        }
        if name.platform.eq_ignore_ascii_case(platform) {
            return Some(name.clone());
        }
        fallback.get_or_insert_with(|| name.clone());
    }
    fallback
}

/// Shared lock on the version being executed, released on drop.
#[derive(Debug)]
pub struct ExecutionLock {
    layout: AppLayout,
    version: VersionName,
    key: PathBuf,
}

/// Blocks until `version` can be locked shared, so no cleanup removes it
/// underneath the process that is about to run it.
pub fn lock_for_execution(layout: &AppLayout, version: &VersionName) -> Result<ExecutionLock> {
    let key = lock_version_keyed(layout, version, LockMode::Shared, LockWait::Block)?;
    Ok(ExecutionLock {
        layout: layout.clone(),
        version: version.clone(),
        key,
    })
}

impl ExecutionLock {
    pub fn version(&self) -> &VersionName {
        &self.version
    }

    /// Clears close-on-exec on the lock descriptor so the exec'd program
    /// keeps holding the lock.
    #[cfg(unix)]
    pub fn inherit_across_exec(&self) -> Result<()> {
        use nix::fcntl::{fcntl, FcntlArg, FdFlag};
        use std::os::unix::io::AsRawFd;

        let cleared = with_held_file(&self.key, |file| {
            fcntl(file.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::empty()))
        });
        match cleared {
            Some(Ok(_)) => Ok(()),
            Some(Err(errno)) => Err(errno).with_context(|| {
                format!("failed to keep lock of '{}' across exec", self.version)
            }),
            None => bail!("version '{}' is not locked by this process", self.version),
        }
    }

    #[cfg(not(unix))]
    pub fn inherit_across_exec(&self) -> Result<()> {
        Ok(())
    }
}

impl Drop for ExecutionLock {
    fn drop(&mut self) {
        if let Err(err) = unlock_key(&self.key, &self.version) {
            warn!(version = %self.version, error = %format!("{err:#}"), "failed to release execution lock");
        }
    }
}

/// The file in the version directory named like the running stub.
pub fn entry_point(layout: &AppLayout, version: &VersionName, stub: &Path) -> Result<PathBuf> {
    let file_name = stub
        .file_name()
        .with_context(|| format!("bootstrap stub has no file name: {}", stub.display()))?;
    let entry = layout.version_dir(version).join(file_name);
    if !entry.is_file() {
        bail!("{version} has no entry point {}", entry.display());
    }
    Ok(entry)
}

/// Runs `version`'s entry point with `args`.
///
/// On unix the current process is replaced and this only returns on
/// failure. Elsewhere the entry point runs as a child and its exit code is
/// returned.
pub fn chainload(
    lock: &ExecutionLock,
    stub: &Path,
    args: impl IntoIterator<Item = OsString>,
) -> Result<i32> {
    let entry = entry_point(&lock.layout, &lock.version, stub)?;
    let mut command = Command::new(&entry);
    command
        .args(args)
        .env(ESKY_VERSION_ENV, lock.version.dir_name());
    debug!(entry = %entry.display(), version = %lock.version, "chainloading");

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;

        lock.inherit_across_exec()?;
        let err = command.exec();
        Err(err).with_context(|| format!("failed to exec {}", entry.display()))
    }

    #[cfg(not(unix))]
    {
        let status = command
            .status()
            .with_context(|| format!("failed to run {}", entry.display()))?;
        Ok(status.code().unwrap_or(1))
    }
}

/// The whole bootstrap sequence for the stub at `stub` in `layout`.
///
/// A version removed between resolving and locking it is resolved again.
pub fn run_bootstrap(
    layout: &AppLayout,
    app_name: &str,
    stub: &Path,
    args: impl IntoIterator<Item = OsString>,
) -> Result<i32> {
    const ATTEMPTS: usize = 3;
    for _ in 0..ATTEMPTS {
        let version = resolve_active_version(layout, app_name)?;
        let lock = match lock_for_execution(layout, &version) {
            Ok(lock) => lock,
            Err(err) => {
                debug!(version = %version, error = %format!("{err:#}"), "version vanished before locking");
                continue;
            }
        };
        if ControlFiles::detect(&layout.version_dir(&version)).is_complete() {
            return chainload(&lock, stub, args);
        }
    }
    bail!("no {app_name} version stayed installed long enough to start")
}
