use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use esky_core::EskyError;
use esky_fstxn::{copy_dir_recursive, Transaction};
use tracing::{debug, info};

use crate::container::ZipTree;
use crate::delta::apply_delta;
use crate::ops::{PatchOp, PatchSet};
use crate::tree::{DirTree, TreeOps};

/// Builds `target_dir` from `source` plus `patch`.
///
/// The patched copy is assembled inside a transaction rooted at the parent
/// of `target_dir` and only moved into place once every op applied, so a
/// failing patch leaves nothing behind.
pub fn apply_patch(patch: &PatchSet, source: &Path, target_dir: &Path) -> Result<()> {
    if target_dir.exists() {
        bail!("patch target already exists: {}", target_dir.display());
    }
    let parent = match target_dir.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let name = target_dir
        .file_name()
        .with_context(|| format!("patch target has no name: {}", target_dir.display()))?;

    let mut txn = Transaction::begin(parent)?;
    let work = txn.staging_dir("patch")?;
    copy_dir_recursive(source, &work)?;
    apply_patch_in_place(patch, &work)?;
    txn.move_path(&work, name)?;
    txn.commit()?;
    info!(target = %target_dir.display(), ops = patch.len(), "applied patch");
    Ok(())
}

/// Replays `patch` directly against `dir`. Callers own atomicity, usually by
/// pointing this at a transaction staging directory.
pub fn apply_patch_in_place(patch: &PatchSet, dir: &Path) -> Result<()> {
    let mut tree = DirTree::new(dir);
    run_ops(&mut tree, patch.ops()).with_context(|| EskyError::CorruptArtifact {
        path: dir.to_path_buf(),
        detail: "patch does not apply to this tree".to_string(),
    })
}

pub(crate) fn run_ops(base: &mut dyn TreeOps, ops: &[PatchOp]) -> Result<()> {
    let mut containers: Vec<(String, ZipTree)> = Vec::new();

    for (index, op) in ops.iter().enumerate() {
        let result = match op {
            PatchOp::EnterContainer { path } => current(base, &mut containers)
                .read(path)
                .and_then(|bytes| ZipTree::from_bytes(&bytes))
                .map(|(tree, _)| containers.push((path.clone(), tree))),
            PatchOp::LeaveContainer { layout } => match containers.pop() {
                Some((path, tree)) => tree
                    .to_bytes(layout)
                    .and_then(|bytes| current(base, &mut containers).write(&path, bytes, None)),
                None => Err(anyhow!("leave-container without a matching enter")),
            },
            other => apply_op(current(base, &mut containers), other),
        };
        result.with_context(|| format!("patch op {} ({}) failed", index + 1, op.kind()))?;
    }

    if let Some((path, _)) = containers.last() {
        bail!("patch never leaves container {path}");
    }
    debug!(ops = ops.len(), "replayed patch ops");
    Ok(())
}

fn current<'a>(
    base: &'a mut dyn TreeOps,
    containers: &'a mut [(String, ZipTree)],
) -> &'a mut dyn TreeOps {
    match containers.last_mut() {
        Some((_, tree)) => tree,
        None => base,
    }
}

fn apply_op(tree: &mut dyn TreeOps, op: &PatchOp) -> Result<()> {
    match op {
        PatchOp::Add { path, data, mode } => tree.write(path, data.clone(), *mode),
        PatchOp::AddDir { path } => tree.add_dir(path),
        PatchOp::Delete { path } => tree.delete(path),
        PatchOp::Copy { from, to } => tree.copy(from, to),
        PatchOp::Delta { path, delta } => {
            let source = tree.read(path)?;
            let target = apply_delta(&source, delta)
                .with_context(|| format!("delta for {path} does not apply"))?;
            tree.write(path, target, None)
        }
        PatchOp::EnterContainer { .. } | PatchOp::LeaveContainer { .. } => {
            bail!("container op outside the container stack")
        }
    }
}
