use async_trait::async_trait;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::{
    KEY_SEPARATOR, ObjectEntry, ObjectStore, PARTIAL_SUFFIX, StoreError, StoreResult, partial_path,
    validate_key,
};

/// Object store backed by a local directory.
///
/// Every bucket is a directory directly under `root` and every key is a
/// `/`-separated path inside it. Empty directories are reported as directory
/// markers, mirroring how S3-compatible stores expose "folder" placeholders.
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn bucket_dir(&self, bucket: &str) -> StoreResult<PathBuf> {
        if bucket.is_empty() || bucket.contains(KEY_SEPARATOR) || bucket == ".." || bucket == "." {
            return Err(StoreError::NoSuchBucket(bucket.to_string()));
        }
        Ok(self.root.join(bucket))
    }

    fn object_path(&self, bucket: &str, key: &str) -> StoreResult<PathBuf> {
        validate_key(key)?;
        Ok(self.bucket_dir(bucket)?.join(key))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn list(&self, bucket: &str, prefix: &str) -> StoreResult<Vec<ObjectEntry>> {
        let bucket_dir = self.bucket_dir(bucket)?;
        let bucket_name = bucket.to_string();
        let prefix = prefix.to_string();

        tokio::task::spawn_blocking(move || {
            if !bucket_dir.is_dir() {
                return Err(StoreError::NoSuchBucket(bucket_name));
            }

            let mut entries = Vec::new();
            list_recursive(&bucket_dir, &bucket_dir, &mut entries)?;
            entries.retain(|entry| entry.key.starts_with(&prefix));
            entries.sort_by(|a, b| a.key.cmp(&b.key));

            debug!(
                bucket = %bucket_name,
                prefix = %prefix,
                count = entries.len(),
                "Listed objects"
            );
            Ok(entries)
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("listing task failed: {}", e)))?
    }

    async fn get(&self, bucket: &str, key: &str, local_path: &Path) -> StoreResult<()> {
        let source = self.object_path(bucket, key)?;

        if !tokio::fs::try_exists(&source).await.unwrap_or(false) {
            return Err(StoreError::NoSuchKey {
                bucket: bucket.to_string(),
                key: key.to_string(),
            });
        }

        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::io("create directory", parent, e))?;
        }

        copy_atomically(&source, local_path).await
    }

    async fn put(&self, bucket: &str, local_path: &Path, key: &str) -> StoreResult<()> {
        let bucket_dir = self.bucket_dir(bucket)?;
        if !tokio::fs::try_exists(&bucket_dir).await.unwrap_or(false) {
            return Err(StoreError::NoSuchBucket(bucket.to_string()));
        }

        let destination = self.object_path(bucket, key)?;
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::io("create directory", parent, e))?;
        }

        copy_atomically(local_path, &destination).await
    }

    async fn bucket_exists(&self, bucket: &str) -> StoreResult<bool> {
        let dir = self.bucket_dir(bucket)?;
        tokio::fs::try_exists(&dir)
            .await
            .map_err(|e| StoreError::io("stat bucket", &dir, e))
    }

    async fn create_bucket(&self, bucket: &str) -> StoreResult<()> {
        let dir = self.bucket_dir(bucket)?;
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| StoreError::io("create bucket", &dir, e))
    }
}

/// Copy into a hidden sibling first so readers never observe a torn file.
async fn copy_atomically(source: &Path, destination: &Path) -> StoreResult<()> {
    let partial = partial_path(destination)?;

    if let Err(e) = tokio::fs::copy(source, &partial).await {
        let _ = tokio::fs::remove_file(&partial).await;
        return Err(StoreError::io("copy", source, e));
    }

    tokio::fs::rename(&partial, destination)
        .await
        .map_err(|e| StoreError::io("rename", destination, e))
}

fn list_recursive(base: &Path, current: &Path, entries: &mut Vec<ObjectEntry>) -> StoreResult<()> {
    let dir = fs::read_dir(current).map_err(|e| StoreError::io("read directory", current, e))?;

    let mut saw_child = false;
    for entry in dir {
        let entry = entry.map_err(|e| StoreError::io("read directory entry", current, e))?;
        let path = entry.path();

        let metadata = match path.symlink_metadata() {
            Ok(m) => m,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Skipping unreadable entry");
                continue;
            }
        };

        if metadata.is_dir() {
            saw_child = true;
            list_recursive(base, &path, entries)?;
        } else if metadata.is_file() {
            if path
                .file_name()
                .is_some_and(|name| name.to_string_lossy().ends_with(PARTIAL_SUFFIX))
            {
                continue;
            }
            saw_child = true;
            entries.push(ObjectEntry::object(relative_key(base, &path)));
        }
    }

    if !saw_child && current != base {
        let mut key = relative_key(base, current);
        key.push(KEY_SEPARATOR);
        entries.push(ObjectEntry::dir_marker(key));
    }

    Ok(())
}

fn relative_key(base: &Path, path: &Path) -> String {
    path.strip_prefix(base)
        .unwrap_or(path)
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
