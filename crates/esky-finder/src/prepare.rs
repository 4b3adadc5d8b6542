use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use esky_core::{EskyError, VersionName};
use esky_fstxn::{copy_dir_recursive, remove_path, Transaction, TxnStrategy};
use esky_installer::{lock_version, unlock_version, ControlFiles, LockMode, LockWait};
use esky_patch::{apply_patch_in_place, read_patch_file};
use tracing::{debug, info};
use walkdir::WalkDir;
use zip::ZipArchive;

use crate::summary::KnownFile;
use crate::types::FinderContext;

/// A failed preparation, blaming the artifact it tripped over when there is
/// one.
pub(crate) struct ArtifactFailure {
    pub(crate) file: Option<KnownFile>,
    pub(crate) error: anyhow::Error,
}

/// Builds `updates/ready/<target>` from the downloaded artifacts of `path`.
///
/// A path starting with a full install extracts that archive; otherwise the
/// current version is copied and the patches are applied to the copy. The
/// tree is assembled in transaction scratch space, so a failure leaves
/// nothing behind.
pub(crate) fn prepare_version(
    ctx: &FinderContext,
    target: &VersionName,
    path: &[KnownFile],
    strategy: TxnStrategy,
) -> std::result::Result<PathBuf, ArtifactFailure> {
    let Some(first) = path.first() else {
        return Err(ArtifactFailure {
            file: None,
            error: anyhow::anyhow!("{target} needs no artifacts to prepare"),
        });
    };
    let blame = |file: &KnownFile| {
        let file = file.clone();
        move |error: anyhow::Error| ArtifactFailure {
            file: Some(file),
            error,
        }
    };

    let updates = ctx.layout.updates_dir();
    let setup = || -> Result<(Transaction, PathBuf)> {
        ctx.layout.ensure_update_dirs()?;
        let mut txn = Transaction::begin_with(&updates, strategy)?;
        let work = txn.staging_dir("unpack")?;
        Ok((txn, work))
    };
    let (mut txn, work) = setup().map_err(blame(first))?;

    let patches = if first.is_full() {
        let archive = first.download_path(&ctx.layout).map_err(blame(first))?;
        extract_archive(&archive, &work).map_err(blame(first))?;
        &path[1..]
    } else {
        copy_current_version(ctx, &work).map_err(blame(first))?;
        path
    };

    for patch_file in patches {
        apply_downloaded_patch(ctx, patch_file, &work).map_err(blame(patch_file))?;
    }

    let last = path.last().unwrap_or(first);
    let ready = finish(ctx, target, &mut txn, &work).map_err(blame(last))?;
    txn.commit()
        .with_context(|| format!("failed to move {target} into the ready directory"))
        .map_err(blame(last))?;
    info!(version = %target, path = %ready.display(), "prepared version");
    Ok(ready)
}

fn apply_downloaded_patch(ctx: &FinderContext, file: &KnownFile, work: &Path) -> Result<()> {
    let patch_path = file.download_path(&ctx.layout)?;
    let patch = read_patch_file(&patch_path)?;
    debug!(patch = %patch_path.display(), ops = patch.len(), "applying patch");
    apply_patch_in_place(&patch, work)
        .with_context(|| format!("failed to apply {}", patch_path.display()))
}

/// Lays the current version out the way a full archive would: the version
/// directory plus its bootstrap files at the top level.
fn copy_current_version(ctx: &FinderContext, work: &Path) -> Result<()> {
    let Some(current) = &ctx.current else {
        bail!(EskyError::NoUpdatePath {
            from: "nothing installed".to_string(),
            to: "a patch-only version".to_string(),
        });
    };

    lock_version(&ctx.layout, current, LockMode::Shared, LockWait::FailFast)?;
    let copied = copy_locked_version(ctx, current, work);
    unlock_version(&ctx.layout, current)?;
    copied
}

fn copy_locked_version(ctx: &FinderContext, current: &VersionName, work: &Path) -> Result<()> {
    let source = ctx.layout.version_dir(current);
    let copy = work.join(current.dir_name());
    copy_dir_recursive(&source, &copy)?;

    let control = ControlFiles::detect(&source);
    for rel in control.bootstrap_files()? {
        let from = control.bootstrap_dir().join(&rel);
        let to = work.join(&rel);
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        fs::copy(&from, &to).with_context(|| {
            format!(
                "failed to copy bootstrap file {} to {}",
                from.display(),
                to.display()
            )
        })?;
    }

    let bootstrap_copy = copy.join(
        control
            .bootstrap_dir()
            .strip_prefix(&source)
            .with_context(|| format!("bootstrap dir outside {}", source.display()))?,
    );
    remove_path(&bootstrap_copy)
        .with_context(|| format!("failed to remove {}", bootstrap_copy.display()))?;
    Ok(())
}

/// Unpacks a zip archive. Entry names that would land outside `dest` are
/// refused.
pub fn extract_archive(archive_path: &Path, dest: &Path) -> Result<()> {
    let file = File::open(archive_path)
        .with_context(|| format!("failed to open {}", archive_path.display()))?;
    let mut archive = ZipArchive::new(file).map_err(|err| {
        anyhow::Error::new(err).context(EskyError::CorruptArtifact {
            path: archive_path.to_path_buf(),
            detail: "not a readable zip archive".to_string(),
        })
    })?;

    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .with_context(|| format!("failed to read entry {index} of {}", archive_path.display()))?;
        let Some(rel) = entry.enclosed_name() else {
            bail!(
                "archive {} has unsafe entry '{}'",
                archive_path.display(),
                entry.name()
            );
        };
        let out_path = dest.join(rel);
        if entry.is_dir() {
            fs::create_dir_all(&out_path)
                .with_context(|| format!("failed to create {}", out_path.display()))?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let mut out = File::create(&out_path)
            .with_context(|| format!("failed to create {}", out_path.display()))?;
        io::copy(&mut entry, &mut out)
            .with_context(|| format!("failed to extract {}", out_path.display()))?;

        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&out_path, fs::Permissions::from_mode(mode & 0o7777))
                .with_context(|| format!("failed to set mode on {}", out_path.display()))?;
        }
    }
    Ok(())
}

/// Folds everything beside the version directory into its bootstrap dir,
/// writes a manifest for it when the version has none, and queues the move
/// into the ready position.
fn finish(
    ctx: &FinderContext,
    target: &VersionName,
    txn: &mut Transaction,
    work: &Path,
) -> Result<PathBuf> {
    let version_dir = find_version_dir(ctx, target, work)?;
    let control = ControlFiles::detect(&version_dir);
    let bootstrap_dir = control.bootstrap_dir().to_path_buf();

    let mut moved = Vec::new();
    for entry in fs::read_dir(work).with_context(|| format!("failed to read {}", work.display()))? {
        let entry = entry.with_context(|| format!("failed to read {}", work.display()))?;
        let item = entry.path();
        if item == version_dir {
            continue;
        }
        fs::create_dir_all(&bootstrap_dir)
            .with_context(|| format!("failed to create {}", bootstrap_dir.display()))?;
        let dest = bootstrap_dir.join(entry.file_name());
        remove_path(&dest).with_context(|| format!("failed to replace {}", dest.display()))?;
        fs::rename(&item, &dest).with_context(|| {
            format!("failed to move {} to {}", item.display(), dest.display())
        })?;
        moved.push(dest);
    }

    if !control.is_complete() {
        let mut manifest = String::new();
        for top in &moved {
            for entry in WalkDir::new(top) {
                let entry = entry.with_context(|| format!("failed to walk {}", top.display()))?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let rel = entry
                    .path()
                    .strip_prefix(&bootstrap_dir)
                    .with_context(|| format!("{} escaped the bootstrap dir", entry.path().display()))?;
                let rel = rel
                    .components()
                    .map(|part| part.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                manifest.push_str(&rel);
                manifest.push('\n');
            }
        }
        let manifest_path = control.manifest_path();
        if let Some(parent) = manifest_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        fs::write(manifest_path, manifest)
            .with_context(|| format!("failed to write {}", manifest_path.display()))?;
    }

    let ready = ctx.layout.ready_path(target);
    txn.move_path(&version_dir, &ready)?;
    Ok(ready)
}

/// The top-level directory naming `target`, matched case-insensitively.
fn find_version_dir(ctx: &FinderContext, target: &VersionName, work: &Path) -> Result<PathBuf> {
    for entry in fs::read_dir(work).with_context(|| format!("failed to read {}", work.display()))? {
        let entry = entry.with_context(|| format!("failed to read {}", work.display()))?;
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        let Ok(parsed) = VersionName::parse(&name) else {
            continue;
        };
        if entry.path().is_dir()
            && parsed.same_app(&ctx.app_name, &ctx.platform)
            && parsed.version == target.version
        {
            return Ok(entry.path());
        }
    }
    Err(EskyError::CorruptArtifact {
        path: work.to_path_buf(),
        detail: format!("artifacts do not contain a {target} directory"),
    }
    .into())
}
