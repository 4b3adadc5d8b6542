use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};

use anyhow::{bail, Context, Result};
use esky_core::{AppLayout, EskyError, VersionName};
use fs2::FileExt;
use tracing::debug;

use crate::control::ControlFiles;
use crate::types::{LockMode, LockWait};

/// One open handle per lock file for the whole process, so nested locks
/// share it instead of conflicting with it.
struct HeldLock {
    file: File,
    count: usize,
    mode: LockMode,
}

static HELD_LOCKS: OnceLock<Mutex<HashMap<PathBuf, HeldLock>>> = OnceLock::new();

fn held_locks() -> MutexGuard<'static, HashMap<PathBuf, HeldLock>> {
    HELD_LOCKS
        .get_or_init(Default::default)
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Free,
    HeldHere(LockMode),
    HeldElsewhere,
}

impl LockState {
    pub fn is_locked(self) -> bool {
        self != Self::Free
    }

    pub fn describe(self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::HeldHere(_) => "held by this process",
            Self::HeldElsewhere => "held by another process",
        }
    }
}

/// Locks `version` for this process. Nested calls only bump a counter,
/// except that asking for `Exclusive` while holding `Shared` converts the
/// underlying lock.
pub fn lock_version(
    layout: &AppLayout,
    version: &VersionName,
    mode: LockMode,
    wait: LockWait,
) -> Result<()> {
    lock_at(&lock_key(layout, version)?, version, mode, wait)
}

/// Drops one level of nesting; the OS lock is released with the last one.
pub fn unlock_version(layout: &AppLayout, version: &VersionName) -> Result<()> {
    unlock_key(&lock_key(layout, version)?, version)
}

/// Like [`lock_version`], returning the registry key so the caller can
/// release it even after the version directory is gone.
pub(crate) fn lock_version_keyed(
    layout: &AppLayout,
    version: &VersionName,
    mode: LockMode,
    wait: LockWait,
) -> Result<PathBuf> {
    let key = lock_key(layout, version)?;
    lock_at(&key, version, mode, wait)?;
    Ok(key)
}

/// Waits on the OS lock without holding the registry guard, so a blocked
/// caller does not stall locks on other versions.
fn lock_at(key: &Path, version: &VersionName, mode: LockMode, wait: LockWait) -> Result<()> {
    let duplicate = {
        let mut held = held_locks();
        match held.get_mut(key) {
            Some(entry) => {
                // The reserved level keeps the entry alive while converting.
                entry.count += 1;
                if mode <= entry.mode {
                    return Ok(());
                }
                Some(entry.file.try_clone())
            }
            None => None,
        }
    };

    match duplicate {
        None => lock_fresh(key, version, mode, wait),
        Some(Ok(file)) => convert(key, file, version, mode, wait),
        Some(Err(err)) => {
            unlock_key(key, version)?;
            Err(err).with_context(|| format!("failed to duplicate lock on '{version}'"))
        }
    }
}

/// A duplicated handle shares the open file, so locking it converts the
/// lock already held.
fn convert(
    key: &Path,
    file: File,
    version: &VersionName,
    mode: LockMode,
    wait: LockWait,
) -> Result<()> {
    if let Err(err) = acquire(&file, mode, wait, version) {
        // flock may release the shared lock while converting.
        let restored = FileExt::lock_shared(&file)
            .with_context(|| format!("failed to restore shared lock on '{version}'"));
        unlock_key(key, version)?;
        restored?;
        return Err(err);
    }
    if let Some(entry) = held_locks().get_mut(key) {
        entry.mode = entry.mode.max(mode);
    }
    debug!(version = %version, mode = mode.as_str(), "converted version lock");
    Ok(())
}

fn lock_fresh(key: &Path, version: &VersionName, mode: LockMode, wait: LockWait) -> Result<()> {
    let file = open_lock_file(key)?;
    acquire(&file, mode, wait, version)?;

    let mut held = held_locks();
    match held.get_mut(key) {
        // Another thread locked it meanwhile; our handle only adds a level.
        Some(entry) => {
            if mode > entry.mode {
                entry.file = file;
                entry.mode = mode;
            }
            entry.count += 1;
        }
        None => {
            held.insert(
                key.to_path_buf(),
                HeldLock {
                    file,
                    count: 1,
                    mode,
                },
            );
            debug!(version = %version, mode = mode.as_str(), "locked version");
        }
    }
    Ok(())
}

pub(crate) fn unlock_key(key: &Path, version: &VersionName) -> Result<()> {
    let mut held = held_locks();
    let Some(entry) = held.get_mut(key) else {
        bail!("version '{version}' is not locked by this process");
    };
    entry.count -= 1;
    if entry.count == 0 {
        if let Some(entry) = held.remove(key) {
            FileExt::unlock(&entry.file)
                .with_context(|| format!("failed to unlock {}", key.display()))?;
        }
        debug!(version = %version, "unlocked version");
    }
    Ok(())
}

/// Looks at a version's lock without taking it.
pub fn inspect_version_lock(layout: &AppLayout, version: &VersionName) -> Result<LockState> {
    let lock_path = ControlFiles::detect(&existing_version_dir(layout, version)?)
        .lock_path()
        .to_path_buf();
    if !lock_path.exists() {
        return Ok(LockState::Free);
    }
    inspect_lock_file(&canonical_lock_path(&lock_path)?)
}

fn inspect_lock_file(key: &Path) -> Result<LockState> {
    if let Some(entry) = held_locks().get(key) {
        return Ok(LockState::HeldHere(entry.mode));
    }
    let file = match File::open(key) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(LockState::Free),
        Err(err) => return Err(err).with_context(|| format!("failed to open {}", key.display())),
    };
    match file.try_lock_exclusive() {
        Ok(()) => {
            FileExt::unlock(&file).with_context(|| format!("failed to unlock {}", key.display()))?;
            Ok(LockState::Free)
        }
        Err(err) if is_contended(&err) => Ok(LockState::HeldElsewhere),
        Err(err) => Err(err).with_context(|| format!("failed to inspect {}", key.display())),
    }
}

/// Exclusive lock held only for the duration of a removal or migration.
///
/// It bypasses the registry: a version this process already holds is
/// refused, and anyone locking it meanwhile contends on the OS lock.
pub(crate) struct RemovalLock {
    _file: File,
}

impl RemovalLock {
    pub(crate) fn acquire(lock_path: &Path, version: &VersionName) -> Result<Self> {
        let key = canonical_lock_path(lock_path)?;
        let locked = || EskyError::VersionLocked {
            version: version.to_string(),
        };
        if held_locks().contains_key(&key) {
            return Err(locked().into());
        }
        let file = open_lock_file(&key)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Self { _file: file }),
            Err(err) if is_contended(&err) => Err(locked().into()),
            Err(err) => Err(err).with_context(|| format!("failed to lock {}", key.display())),
        }
    }
}

/// Runs `f` against this process's handle for `key`, if it holds one.
pub(crate) fn with_held_file<R>(key: &Path, f: impl FnOnce(&File) -> R) -> Option<R> {
    held_locks().get(key).map(|entry| f(&entry.file))
}

fn lock_key(layout: &AppLayout, version: &VersionName) -> Result<PathBuf> {
    let version_dir = existing_version_dir(layout, version)?;
    canonical_lock_path(ControlFiles::detect(&version_dir).lock_path())
}

fn existing_version_dir(layout: &AppLayout, version: &VersionName) -> Result<PathBuf> {
    let version_dir = layout.version_dir(version);
    if !version_dir.is_dir() {
        return Err(EskyError::VersionNotFound {
            version: version.to_string(),
        }
        .into());
    }
    Ok(version_dir)
}

fn canonical_lock_path(lock_path: &Path) -> Result<PathBuf> {
    let parent = lock_path
        .parent()
        .with_context(|| format!("lock path has no parent: {}", lock_path.display()))?;
    let file_name = lock_path
        .file_name()
        .with_context(|| format!("lock path has no file name: {}", lock_path.display()))?;
    let parent = parent
        .canonicalize()
        .with_context(|| format!("failed to resolve {}", parent.display()))?;
    Ok(parent.join(file_name))
}

fn open_lock_file(path: &Path) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .with_context(|| format!("failed to open lock file {}", path.display()))
}

fn acquire(file: &File, mode: LockMode, wait: LockWait, version: &VersionName) -> Result<()> {
    let result = match (mode, wait) {
        (LockMode::Shared, LockWait::Block) => FileExt::lock_shared(file),
        (LockMode::Shared, LockWait::FailFast) => FileExt::try_lock_shared(file),
        (LockMode::Exclusive, LockWait::Block) => file.lock_exclusive(),
        (LockMode::Exclusive, LockWait::FailFast) => file.try_lock_exclusive(),
    };
    match result {
        Ok(()) => Ok(()),
        Err(err) if is_contended(&err) => Err(EskyError::LockContention {
            version: version.to_string(),
        }
        .into()),
        Err(err) => Err(err).with_context(|| format!("failed to lock version '{version}'")),
    }
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}
