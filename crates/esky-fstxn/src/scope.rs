use std::path::{Component, Path, PathBuf};

use anyhow::Result;
use esky_core::EskyError;

/// Resolves `path` (relative to `root`, or absolute) to a path strictly inside
/// the canonical `root`.
///
/// `.`/`..` are folded lexically first, then the deepest existing ancestor is
/// canonicalized so a symlink inside the root cannot point the operation
/// somewhere else.
pub(crate) fn resolve_in_scope(root: &Path, path: &Path) -> Result<PathBuf> {
    let violation = || EskyError::ScopeViolation {
        path: path.to_path_buf(),
        root: root.to_path_buf(),
    };

    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    };

    let mut normalized = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::Prefix(prefix) => normalized.push(prefix.as_os_str()),
            Component::RootDir => normalized.push(Component::RootDir.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() {
                    return Err(violation().into());
                }
            }
            Component::Normal(part) => normalized.push(part),
        }
    }

    if normalized == root || !normalized.starts_with(root) {
        return Err(violation().into());
    }

    let mut ancestor = normalized.parent();
    while let Some(candidate) = ancestor {
        if candidate.exists() {
            let canonical = candidate
                .canonicalize()
                .map_err(|_| anyhow::Error::from(violation()))?;
            if !canonical.starts_with(root) {
                return Err(violation().into());
            }
            break;
        }
        ancestor = candidate.parent();
    }

    Ok(normalized)
}
