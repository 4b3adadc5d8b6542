use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::fs_utils::remove_path;
use crate::transaction::{JOURNAL_FILE, OWNER_LOCK_FILE, SCRATCH_PREFIX};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JournalState {
    Applying,
    Applied,
    Committed,
    RolledBack,
}

/// How to put one step back. Written before the step runs, so every variant
/// must tolerate a step that was interrupted half way.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UndoRecord {
    Placed {
        target: PathBuf,
        backup: Option<PathBuf>,
        temp: Option<PathBuf>,
        created_dirs: Vec<PathBuf>,
    },
    Moved {
        src: PathBuf,
        dst: PathBuf,
        backup: Option<PathBuf>,
        created_dirs: Vec<PathBuf>,
    },
    Deleted {
        target: PathBuf,
        backup: PathBuf,
    },
    Nothing,
}

impl UndoRecord {
    pub(crate) fn undo(&self) -> io::Result<()> {
        match self {
            Self::Placed {
                target,
                backup,
                temp,
                created_dirs,
            } => {
                if let Some(temp) = temp {
                    remove_path(temp)?;
                }
                match backup {
                    Some(backup) if exists(backup) => {
                        remove_path(target)?;
                        fs::rename(backup, target)?;
                    }
                    Some(_) => {}
                    None => remove_path(target)?,
                }
                remove_created_dirs(created_dirs);
            }
            Self::Moved {
                src,
                dst,
                backup,
                created_dirs,
            } => {
                if exists(dst) && !exists(src) {
                    fs::rename(dst, src)?;
                }
                if let Some(backup) = backup {
                    if exists(backup) {
                        fs::rename(backup, dst)?;
                    }
                }
                remove_created_dirs(created_dirs);
            }
            Self::Deleted { target, backup } => {
                if exists(backup) {
                    fs::rename(backup, target)?;
                }
            }
            Self::Nothing => {}
        }
        Ok(())
    }
}

fn exists(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok()
}

fn remove_created_dirs(created_dirs: &[PathBuf]) {
    for dir in created_dirs.iter().rev() {
        let _ = fs::remove_dir(dir);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionJournalEntry {
    pub seq: u64,
    pub step: String,
    pub state: JournalState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub undo: Option<UndoRecord>,
}

pub(crate) fn append_journal_entry(path: &Path, entry: &TransactionJournalEntry) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open transaction journal: {}", path.display()))?;
    let mut line =
        serde_json::to_vec(entry).context("failed to serialize transaction journal entry")?;
    line.push(b'\n');
    file.write_all(&line)
        .with_context(|| format!("failed to append transaction journal: {}", path.display()))?;
    file.sync_data()
        .with_context(|| format!("failed to sync transaction journal: {}", path.display()))?;
    Ok(())
}

/// A crash can leave a torn last line; everything before it is still usable.
pub(crate) fn read_journal(path: &Path) -> Result<Vec<TransactionJournalEntry>> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read transaction journal: {}", path.display()))
        }
    };

    Ok(raw
        .lines()
        .map_while(|line| serde_json::from_str::<TransactionJournalEntry>(line).ok())
        .collect())
}

/// Rolls back or finishes transactions whose owning process died.
///
/// A scratch directory whose owner lock can be taken has no live owner. If
/// its journal reached `committed` only the scratch is removed, otherwise
/// every journaled step is undone in reverse first. Returns the scratch
/// directories that were handled.
pub fn recover_stale_transactions(root: &Path) -> Result<Vec<PathBuf>> {
    let mut recovered = Vec::new();
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(recovered),
        Err(err) => return Err(err).with_context(|| format!("failed to read {}", root.display())),
    };

    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if !name.starts_with(SCRATCH_PREFIX) || !entry.file_type()?.is_dir() {
            continue;
        }

        let scratch = entry.path();
        let lock_path = scratch.join(OWNER_LOCK_FILE);
        let lock_file = File::options()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .with_context(|| format!("failed to open {}", lock_path.display()))?;
        match lock_file.try_lock_exclusive() {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::WouldBlock => continue,
            Err(err) => {
                return Err(err).with_context(|| format!("failed to lock {}", lock_path.display()))
            }
        }

        let journal = read_journal(&scratch.join(JOURNAL_FILE))?;
        let committed = journal
            .iter()
            .any(|entry| entry.state == JournalState::Committed);
        if !committed {
            let mut undone = std::collections::HashSet::new();
            for entry in journal.iter().rev() {
                let Some(undo) = &entry.undo else {
                    continue;
                };
                if !undone.insert(entry.seq) {
                    continue;
                }
                if let Err(err) = undo.undo() {
                    warn!(scratch = %scratch.display(), seq = entry.seq, error = %err, "failed to undo interrupted step");
                }
            }
        }

        drop(lock_file);
        fs::remove_dir_all(&scratch)
            .with_context(|| format!("failed to remove {}", scratch.display()))?;
        info!(scratch = %scratch.display(), committed, "recovered interrupted transaction");
        recovered.push(scratch);
    }

    Ok(recovered)
}
