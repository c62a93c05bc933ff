//! Workspace confinement check.
//!
//! Resolves a workspace directory and, when a workspace root is configured,
//! rejects any directory that does not live under it. `..` segments are
//! resolved lexically first and symlinks are resolved by canonicalization,
//! so neither can be used to step outside the root.

use std::path::{Component, Path, PathBuf};

use crate::{AppError, Result};

/// Resolve `candidate` and confine it to `root` when one is given.
///
/// Returns the canonical path when the directory exists, otherwise the
/// lexically normalized one.
///
/// # Errors
///
/// Returns `AppError::PathOutsideRoot` if the resolved path is not under
/// `root`.
pub fn resolve_workspace_path(root: Option<&Path>, candidate: &Path) -> Result<PathBuf> {
    let normalized = normalize(candidate);
    let resolved = normalized.canonicalize().unwrap_or(normalized);

    let Some(root) = root else {
        return Ok(resolved);
    };

    let root = root.canonicalize().unwrap_or_else(|_| normalize(root));
    if resolved.starts_with(&root) {
        Ok(resolved)
    } else {
        Err(AppError::PathOutsideRoot(format!(
            "{} is not under {}",
            resolved.display(),
            root.display()
        )))
    }
}

fn normalize(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                normalized.pop();
            }
            Component::CurDir => {}
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}
