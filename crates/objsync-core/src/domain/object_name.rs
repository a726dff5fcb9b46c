//! Object-name rules
//!
//! Object names are relative, `/`-separated keys. Every name handed to the
//! object store goes through [`normalize_object_name`] first, and local paths
//! are derived from names with [`local_path_for`], which refuses names that
//! would escape the sync root.

use std::path::{Component, Path, PathBuf, MAIN_SEPARATOR};

use super::errors::DomainError;

/// Normalize an object name
///
/// The platform path separator becomes `/` and a single leading `/` is
/// stripped. Nothing else is touched: `//a` normalizes to `/a`. On Unix a
/// backslash is an ordinary filename character and is kept.
pub fn normalize_object_name(name: &str) -> String {
    let name = if MAIN_SEPARATOR == '/' {
        name.to_string()
    } else {
        name.replace(MAIN_SEPARATOR, "/")
    };
    match name.strip_prefix('/') {
        Some(rest) => rest.to_string(),
        None => name,
    }
}

/// Derive the object name for a local path under `root`
///
/// # Errors
/// Returns `PathNotInSyncRoot` if `path` is not under `root`, and
/// `InvalidObjectName` if the relative part is empty.
pub fn object_name_for(root: &Path, path: &Path) -> Result<String, DomainError> {
    let relative = path.strip_prefix(root).map_err(|_| {
        DomainError::PathNotInSyncRoot(format!(
            "{} is not within {}",
            path.display(),
            root.display()
        ))
    })?;

    let parts: Vec<String> = relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();

    if parts.is_empty() {
        return Err(DomainError::InvalidObjectName(path.display().to_string()));
    }

    Ok(normalize_object_name(&parts.join("/")))
}

/// Map an object name to its local path under `root`
///
/// # Errors
/// Returns `InvalidObjectName` for empty names and names containing `..`
/// segments.
pub fn local_path_for(root: &Path, name: &str) -> Result<PathBuf, DomainError> {
    let name = normalize_object_name(name);
    let mut path = root.to_path_buf();
    let mut pushed = false;

    for segment in name.split('/') {
        match segment {
            "" | "." => {}
            ".." => return Err(DomainError::InvalidObjectName(name.clone())),
            s => {
                path.push(s);
                pushed = true;
            }
        }
    }

    if !pushed {
        return Err(DomainError::InvalidObjectName(name));
    }

    Ok(path)
}
