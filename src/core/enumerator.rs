//! Builds the item set for one invocation.

use anyhow::{Context, Result, anyhow, bail};
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

use super::models::TransferItem;
use crate::store::{KEY_SEPARATOR, ObjectStore};

/// Normalize a user supplied model path into a listing prefix.
///
/// `"llama/7b"`, `"/llama/7b/"` and `"llama/7b/"` all become `"llama/7b/"`;
/// an empty path means the whole bucket.
pub fn normalize_prefix(model_path: &str) -> String {
    let trimmed = model_path.trim_matches(KEY_SEPARATOR);
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{}{}", trimmed, KEY_SEPARATOR)
    }
}

/// Map a remote key to its local destination under `local_root`.
///
/// Returns `None` for directory markers, keys that reduce to nothing once
/// the prefix is stripped, and keys that would climb out of `local_root`.
pub fn local_destination(prefix: &str, key: &str, local_root: &Path) -> Option<PathBuf> {
    if key.ends_with(KEY_SEPARATOR) {
        return None;
    }

    let relative = key.strip_prefix(prefix).unwrap_or(key);
    let relative = relative.trim_start_matches(KEY_SEPARATOR);
    if relative.is_empty() {
        return None;
    }

    let mut path = local_root.to_path_buf();
    for segment in relative.split(KEY_SEPARATOR) {
        match segment {
            "" | "." => continue,
            ".." => return None,
            segment => path.push(segment),
        }
    }
    Some(path)
}

/// Map a file below the upload root to its remote key.
pub fn remote_key(prefix: &str, relative: &Path) -> String {
    let relative = relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/");
    format!("{}{}", prefix, relative)
}

/// List everything under `prefix` and pair each object with a local path.
///
/// A listing failure is fatal for the whole run.
pub async fn enumerate_download(
    store: &dyn ObjectStore,
    bucket: &str,
    prefix: &str,
    local_root: &Path,
) -> Result<Vec<TransferItem>> {
    let entries = store
        .list(bucket, prefix)
        .await
        .with_context(|| format!("Failed to list store://{}/{}", bucket, prefix))?;

    let listed = entries.len();
    let mut items: Vec<TransferItem> = entries
        .into_iter()
        .filter(|entry| !entry.is_dir_marker)
        .filter_map(|entry| match local_destination(prefix, &entry.key, local_root) {
            Some(path) => Some(TransferItem::download(entry.key, path)),
            None => {
                debug!(key = %entry.key, "Skipping key with no local file");
                None
            }
        })
        .collect();
    items.sort_by(|a, b| a.remote_key.cmp(&b.remote_key));

    debug!(listed, items = items.len(), "Enumerated remote objects");
    Ok(items)
}

/// Walk `local_root` and pair each regular file with a remote key.
///
/// Symlinks and special files are skipped. A missing root is an error.
pub async fn enumerate_upload(local_root: &Path, prefix: &str) -> Result<Vec<TransferItem>> {
    let root = local_root.to_path_buf();
    let prefix = prefix.to_string();

    tokio::task::spawn_blocking(move || {
        if !root.is_dir() {
            bail!("Local path {} is not a directory", root.display());
        }

        let mut files = Vec::new();
        scan_directory_recursive(&root, &mut files)?;

        let mut items: Vec<TransferItem> = files
            .into_iter()
            .map(|path| {
                let relative = path.strip_prefix(&root).unwrap_or(&path).to_path_buf();
                let key = remote_key(&prefix, &relative);
                TransferItem::upload(path, key)
            })
            .collect();
        items.sort_by(|a, b| a.remote_key.cmp(&b.remote_key));

        debug!(items = items.len(), "Enumerated local files");
        Ok(items)
    })
    .await?
}

fn scan_directory_recursive(current: &Path, files: &mut Vec<PathBuf>) -> Result<()> {
    let entries = fs::read_dir(current)
        .map_err(|e| anyhow!("Failed to read directory {}: {}", current.display(), e))?;

    for entry in entries {
        let entry = entry.map_err(|e| anyhow!("Failed to read directory entry: {}", e))?;
        let path = entry.path();

        // Use symlink_metadata to avoid following symlinks
        let metadata = match path.symlink_metadata() {
            Ok(m) => m,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Skipping unreadable entry");
                continue;
            }
        };

        if metadata.is_dir() {
            scan_directory_recursive(&path, files)?;
        } else if metadata.is_file() {
            files.push(path);
        }
    }

    Ok(())
}
