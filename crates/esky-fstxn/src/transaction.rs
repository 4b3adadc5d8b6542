use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, bail, Context, Result};
use esky_core::EskyError;
use esky_security::{sha256_file, sha256_hex, verify_sha256_file};
use fs2::FileExt;
use tracing::{debug, error, info, warn};

use crate::detect::{detect_strategy, TxnStrategy};
use crate::journal::{append_journal_entry, JournalState, TransactionJournalEntry, UndoRecord};
use crate::scope::resolve_in_scope;

pub const SCRATCH_PREFIX: &str = ".esky-txn-";
pub(crate) const JOURNAL_FILE: &str = "journal";
pub(crate) const OWNER_LOCK_FILE: &str = "owner.lock";
const STAGE_DIR: &str = "stage";
const BACKUP_DIR: &str = "backup";
const WORK_DIR: &str = "work";

static TXN_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug)]
enum Payload {
    Bytes(Vec<u8>),
    CopyOf(PathBuf),
    Staged { path: PathBuf, sha256: String },
}

#[derive(Debug)]
enum PendingOp {
    Add { target: PathBuf, payload: Payload },
    AddDir { target: PathBuf },
    Move {
        src: PathBuf,
        dst: PathBuf,
        replace: bool,
    },
    Delete { target: PathBuf },
}

impl PendingOp {
    fn name(&self) -> &'static str {
        match self {
            Self::Add { .. } => "add",
            Self::AddDir { .. } => "add_dir",
            Self::Move { .. } => "move",
            Self::Delete { .. } => "delete",
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::Add { target, .. } | Self::AddDir { target } | Self::Delete { target } => {
                format!("{} {}", self.name(), target.display())
            }
            Self::Move { src, dst, .. } => format!("move {} -> {}", src.display(), dst.display()),
        }
    }
}

#[derive(Debug)]
struct Poisoned {
    step: usize,
    op: String,
    reason: String,
}

/// An ordered set of filesystem mutations under one root, applied all or
/// nothing.
///
/// Operations are only validated and queued until [`Transaction::commit`].
/// Dropping an uncommitted transaction aborts it.
#[derive(Debug)]
pub struct Transaction {
    root: PathBuf,
    scratch: PathBuf,
    strategy: TxnStrategy,
    pending: Vec<PendingOp>,
    applied: Vec<UndoRecord>,
    poisoned: Option<Poisoned>,
    owner_lock: Option<File>,
    next_stage: u64,
    finished: bool,
}

impl Transaction {
    pub fn begin(root: &Path) -> Result<Self> {
        Self::begin_with(root, TxnStrategy::Auto)
    }

    pub fn begin_with(root: &Path, requested: TxnStrategy) -> Result<Self> {
        let root = root
            .canonicalize()
            .with_context(|| format!("transaction root does not exist: {}", root.display()))?;
        let scratch = root.join(format!("{SCRATCH_PREFIX}{}", next_transaction_id()));
        for dir in [
            scratch.join(STAGE_DIR),
            scratch.join(BACKUP_DIR),
            scratch.join(WORK_DIR),
        ] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }

        let lock_path = scratch.join(OWNER_LOCK_FILE);
        let owner_lock = File::create(&lock_path)
            .with_context(|| format!("failed to create {}", lock_path.display()))?;
        owner_lock
            .lock_exclusive()
            .with_context(|| format!("failed to lock {}", lock_path.display()))?;

        let strategy = detect_strategy(requested, &root, &scratch.join(WORK_DIR));
        debug!(root = %root.display(), strategy = strategy.as_str(), "transaction started");

        Ok(Self {
            root,
            scratch,
            strategy,
            pending: Vec::new(),
            applied: Vec::new(),
            poisoned: None,
            owner_lock: Some(owner_lock),
            next_stage: 0,
            finished: false,
        })
    }

    /// Canonical root every operation is scoped to.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn strategy(&self) -> TxnStrategy {
        self.strategy
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Writes `bytes` to `path`, replacing whatever is there.
    pub fn add(&mut self, path: impl AsRef<Path>, bytes: impl Into<Vec<u8>>) -> Result<()> {
        self.ensure_usable()?;
        let target = self.resolve("add", path.as_ref())?;
        let bytes = bytes.into();
        let payload = match self.strategy {
            TxnStrategy::Staged => {
                let result = self.stage_bytes(&bytes);
                self.poison_on_error("add", &target, result)?
            }
            _ => Payload::Bytes(bytes),
        };
        self.push(PendingOp::Add { target, payload });
        Ok(())
    }

    /// Like [`Transaction::add`] with the contents of an existing file.
    ///
    /// `src` may live anywhere; only `dst` is scope-checked.
    pub fn copy_file(&mut self, src: impl AsRef<Path>, dst: impl AsRef<Path>) -> Result<()> {
        self.ensure_usable()?;
        let src = src.as_ref().to_path_buf();
        let target = self.resolve("copy", dst.as_ref())?;
        let result = if !src.is_file() {
            Err(anyhow!("copy source is not a file: {}", src.display()))
        } else if self.strategy == TxnStrategy::Staged {
            self.stage_copy(&src)
        } else {
            Ok(Payload::CopyOf(src))
        };
        let payload = self.poison_on_error("copy", &target, result)?;
        self.push(PendingOp::Add { target, payload });
        Ok(())
    }

    pub fn add_dir(&mut self, path: impl AsRef<Path>) -> Result<()> {
        self.ensure_usable()?;
        let target = self.resolve("add_dir", path.as_ref())?;
        self.push(PendingOp::AddDir { target });
        Ok(())
    }

    /// Renames `src` to `dst`, replacing an existing `dst`.
    ///
    /// `src` may be a directory handed out by [`Transaction::staging_dir`].
    pub fn move_path(&mut self, src: impl AsRef<Path>, dst: impl AsRef<Path>) -> Result<()> {
        self.ensure_usable()?;
        let src = self.resolve("move", src.as_ref())?;
        let dst = self.resolve("move", dst.as_ref())?;
        self.push(PendingOp::Move {
            src,
            dst,
            replace: true,
        });
        Ok(())
    }

    /// Renames `src` to `dst`; the step fails if `dst` exists when it runs.
    pub fn move_new(&mut self, src: impl AsRef<Path>, dst: impl AsRef<Path>) -> Result<()> {
        self.ensure_usable()?;
        let src = self.resolve("move", src.as_ref())?;
        let dst = self.resolve("move", dst.as_ref())?;
        self.push(PendingOp::Move {
            src,
            dst,
            replace: false,
        });
        Ok(())
    }

    pub fn delete(&mut self, path: impl AsRef<Path>) -> Result<()> {
        self.ensure_usable()?;
        let target = self.resolve("delete", path.as_ref())?;
        self.push(PendingOp::Delete { target });
        Ok(())
    }

    /// A fresh directory inside this transaction's scratch space.
    ///
    /// It is removed together with the scratch directory on commit or abort,
    /// so anything that should survive must be moved out with
    /// [`Transaction::move_path`].
    pub fn staging_dir(&mut self, name: &str) -> Result<PathBuf> {
        self.ensure_usable()?;
        if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
            bail!("invalid staging directory name '{name}'");
        }
        self.next_stage += 1;
        let dir = self
            .scratch
            .join(WORK_DIR)
            .join(format!("{name}-{}", self.next_stage));
        fs::create_dir_all(&dir).with_context(|| format!("failed to create {}", dir.display()))?;
        Ok(dir)
    }

    pub fn commit(mut self) -> Result<()> {
        if let Some(poisoned) = self.poisoned.take() {
            self.finish(false);
            return Err(EskyError::TransactionFailure {
                step: poisoned.step,
                op: poisoned.op,
                reason: poisoned.reason,
            }
            .into());
        }

        let pending = std::mem::take(&mut self.pending);
        if self.strategy == TxnStrategy::Staged {
            for (index, op) in pending.iter().enumerate() {
                if let Err(err) = verify_staged_op(op) {
                    self.finish(false);
                    return Err(step_failure(err, index + 1, op));
                }
            }
        }

        for (index, op) in pending.iter().enumerate() {
            let step = index + 1;
            debug!(step, op = %op.describe(), "applying transaction step");
            if let Err(err) = self.apply(step, op) {
                error!(step, op = %op.describe(), error = %err, "transaction step failed, rolling back");
                self.finish(false);
                return Err(step_failure(err, step, op));
            }
        }

        self.journal(0, "commit", JournalState::Committed, None)?;
        info!(root = %self.root.display(), steps = pending.len(), "transaction committed");
        self.finish(true);
        Ok(())
    }

    /// Discards queued operations and undoes anything already applied.
    pub fn abort(mut self) {
        self.finish(false);
    }

    fn ensure_usable(&self) -> Result<()> {
        match &self.poisoned {
            Some(poisoned) => Err(EskyError::TransactionFailure {
                step: poisoned.step,
                op: poisoned.op.clone(),
                reason: poisoned.reason.clone(),
            }
            .into()),
            None => Ok(()),
        }
    }

    fn resolve(&mut self, op: &str, path: &Path) -> Result<PathBuf> {
        let resolved = resolve_in_scope(&self.root, path);
        self.poison_on_error(op, path, resolved)
    }

    fn poison_on_error<T>(&mut self, op: &str, path: &Path, result: Result<T>) -> Result<T> {
        result.inspect_err(|err| {
            warn!(op, path = %path.display(), error = %err, "transaction operation rejected");
            self.poisoned = Some(Poisoned {
                step: self.pending.len() + 1,
                op: format!("{op} {}", path.display()),
                reason: err.to_string(),
            });
        })
    }

    fn push(&mut self, op: PendingOp) {
        debug!(op = %op.describe(), "queued transaction operation");
        self.pending.push(op);
    }

    fn stage_bytes(&mut self, bytes: &[u8]) -> Result<Payload> {
        let path = self.next_stage_path();
        fs::write(&path, bytes).with_context(|| format!("failed to stage {}", path.display()))?;
        Ok(Payload::Staged {
            path,
            sha256: sha256_hex(bytes),
        })
    }

    fn stage_copy(&mut self, src: &Path) -> Result<Payload> {
        let path = self.next_stage_path();
        fs::copy(src, &path).with_context(|| {
            format!("failed to stage {} as {}", src.display(), path.display())
        })?;
        let sha256 = sha256_file(&path)?;
        Ok(Payload::Staged { path, sha256 })
    }

    fn next_stage_path(&mut self) -> PathBuf {
        self.next_stage += 1;
        self.scratch
            .join(STAGE_DIR)
            .join(format!("{}.new", self.next_stage))
    }

    fn backup_path(&self, step: usize) -> PathBuf {
        self.scratch.join(BACKUP_DIR).join(step.to_string())
    }

    fn journal(
        &mut self,
        step: usize,
        name: &str,
        state: JournalState,
        undo: Option<&UndoRecord>,
    ) -> Result<()> {
        let entry = TransactionJournalEntry {
            seq: step as u64,
            step: name.to_string(),
            state,
            undo: undo.cloned(),
        };
        append_journal_entry(&self.scratch.join(JOURNAL_FILE), &entry)
    }

    fn apply(&mut self, step: usize, op: &PendingOp) -> Result<()> {
        let undo = match op {
            PendingOp::Add { target, payload } => {
                let existing = fs::symlink_metadata(target).ok();
                let temp = match payload {
                    Payload::Staged { .. } => None,
                    _ => Some(sibling_temp_path(target, step)?),
                };
                UndoRecord::Placed {
                    target: target.clone(),
                    backup: existing.as_ref().map(|_| self.backup_path(step)),
                    temp,
                    created_dirs: missing_parents(target),
                }
            }
            PendingOp::AddDir { target } => match fs::symlink_metadata(target) {
                Ok(metadata) if metadata.is_dir() => UndoRecord::Nothing,
                Ok(_) => bail!("{} exists and is not a directory", target.display()),
                Err(_) => {
                    let mut created_dirs = missing_parents(target);
                    created_dirs.push(target.clone());
                    UndoRecord::Placed {
                        target: target.clone(),
                        backup: None,
                        temp: None,
                        created_dirs,
                    }
                }
            },
            PendingOp::Move { src, dst, replace } => {
                fs::symlink_metadata(src)
                    .with_context(|| format!("move source is missing: {}", src.display()))?;
                let existing = fs::symlink_metadata(dst).ok();
                if existing.is_some() && !replace {
                    bail!("move destination already exists: {}", dst.display());
                }
                UndoRecord::Moved {
                    src: src.clone(),
                    dst: dst.clone(),
                    backup: existing.map(|_| self.backup_path(step)),
                    created_dirs: missing_parents(dst),
                }
            }
            PendingOp::Delete { target } => {
                fs::symlink_metadata(target)
                    .with_context(|| format!("delete target is missing: {}", target.display()))?;
                UndoRecord::Deleted {
                    target: target.clone(),
                    backup: self.backup_path(step),
                }
            }
        };

        self.journal(step, op.name(), JournalState::Applying, Some(&undo))?;
        self.applied.push(undo.clone());
        run_step(op, &undo)?;
        self.journal(step, op.name(), JournalState::Applied, None)
    }

    fn rollback(&mut self) {
        while let Some(undo) = self.applied.pop() {
            if let Err(err) = undo.undo() {
                error!(undo = ?undo, error = %err, "failed to undo transaction step");
            }
        }
    }

    fn finish(&mut self, committed: bool) {
        if self.finished {
            return;
        }
        self.finished = true;
        if !committed {
            self.rollback();
            if let Err(err) = self.journal(0, "rollback", JournalState::RolledBack, None) {
                debug!(error = %err, "failed to journal rollback");
            }
            debug!(root = %self.root.display(), "transaction rolled back");
        }
        self.owner_lock.take();
        if let Err(err) = fs::remove_dir_all(&self.scratch) {
            warn!(scratch = %self.scratch.display(), error = %err, "failed to remove transaction scratch");
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        self.finish(false);
    }
}

fn run_step(op: &PendingOp, undo: &UndoRecord) -> Result<()> {
    match (op, undo) {
        (PendingOp::Add { target, payload }, UndoRecord::Placed { backup, temp, .. }) => {
            create_parent(target)?;
            match (payload, temp) {
                (Payload::Staged { path, .. }, _) => {
                    if let Some(backup) = backup {
                        rename(target, backup)?;
                    }
                    rename(path, target)
                }
                (Payload::Bytes(bytes), Some(temp)) => {
                    fs::write(temp, bytes)
                        .with_context(|| format!("failed to write {}", temp.display()))?;
                    replace_with_temp(target, temp, backup.as_deref())
                }
                (Payload::CopyOf(src), Some(temp)) => {
                    fs::copy(src, temp).with_context(|| {
                        format!("failed to copy {} to {}", src.display(), temp.display())
                    })?;
                    replace_with_temp(target, temp, backup.as_deref())
                }
                (_, None) => bail!("no temporary path for {}", target.display()),
            }
        }
        (PendingOp::AddDir { .. }, UndoRecord::Nothing) => Ok(()),
        (PendingOp::AddDir { target }, _) => fs::create_dir_all(target)
            .with_context(|| format!("failed to create {}", target.display())),
        (PendingOp::Move { src, dst, .. }, UndoRecord::Moved { backup, .. }) => {
            create_parent(dst)?;
            if let Some(backup) = backup {
                rename(dst, backup)?;
            }
            rename(src, dst)
        }
        (PendingOp::Delete { target }, UndoRecord::Deleted { backup, .. }) => {
            rename(target, backup)
        }
        _ => bail!("transaction step does not match its undo record"),
    }
}

fn replace_with_temp(target: &Path, temp: &Path, backup: Option<&Path>) -> Result<()> {
    if let Some(backup) = backup {
        backup_in_place(target, backup)?;
    }
    rename(temp, target)
}

/// Keeps the old file visible at `target` until the replacement is renamed
/// over it: regular files are hard-linked (or copied) into the backup,
/// anything else is moved aside.
fn backup_in_place(target: &Path, backup: &Path) -> Result<()> {
    let metadata = fs::symlink_metadata(target)
        .with_context(|| format!("failed to stat {}", target.display()))?;
    if !metadata.is_file() {
        return rename(target, backup);
    }
    if fs::hard_link(target, backup).is_ok() {
        return Ok(());
    }
    fs::copy(target, backup).with_context(|| {
        format!(
            "failed to back up {} to {}",
            target.display(),
            backup.display()
        )
    })?;
    Ok(())
}

fn verify_staged_op(op: &PendingOp) -> Result<()> {
    match op {
        PendingOp::Add {
            payload: Payload::Staged { path, sha256 },
            ..
        } => {
            if !verify_sha256_file(path, sha256)? {
                return Err(EskyError::CorruptArtifact {
                    path: path.clone(),
                    detail: "staged content changed before commit".to_string(),
                }
                .into());
            }
        }
        PendingOp::Add { .. } | PendingOp::AddDir { .. } => {}
        PendingOp::Move { src, .. } => {
            fs::symlink_metadata(src)
                .with_context(|| format!("move source is missing: {}", src.display()))?;
        }
        PendingOp::Delete { target } => {
            fs::symlink_metadata(target)
                .with_context(|| format!("delete target is missing: {}", target.display()))?;
        }
    }
    Ok(())
}

fn step_failure(err: anyhow::Error, step: usize, op: &PendingOp) -> anyhow::Error {
    let reason = format!("{err:#}");
    err.context(EskyError::TransactionFailure {
        step,
        op: op.describe(),
        reason,
    })
}

fn rename(from: &Path, to: &Path) -> Result<()> {
    fs::rename(from, to)
        .with_context(|| format!("failed to rename {} to {}", from.display(), to.display()))
}

fn create_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    Ok(())
}

/// Ancestors of `path` that do not exist yet, outermost first.
fn missing_parents(path: &Path) -> Vec<PathBuf> {
    let mut missing = Vec::new();
    let mut current = path.parent();
    while let Some(dir) = current {
        if dir.exists() {
            break;
        }
        missing.push(dir.to_path_buf());
        current = dir.parent();
    }
    missing.reverse();
    missing
}

fn sibling_temp_path(target: &Path, step: usize) -> Result<PathBuf> {
    let file_name = target
        .file_name()
        .with_context(|| format!("path has no file name: {}", target.display()))?;
    Ok(target.with_file_name(format!(
        ".{}.esky-new-{step}",
        file_name.to_string_lossy()
    )))
}

fn next_transaction_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_nanos())
        .unwrap_or(0);
    let counter = TXN_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{}-{nanos}-{counter}", std::process::id())
}
