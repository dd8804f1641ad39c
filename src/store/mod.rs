//! Object store seam.
//!
//! The transfer engine only ever talks to an `Arc<dyn ObjectStore>`. The
//! production backend speaks the S3 API (MinIO and friends); a
//! directory-backed store and an in-memory simulated store cover local use,
//! dry runs and tests.

mod fs;
mod s3;
mod simulated;

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

use crate::config::{StoreBackend, StoreConfig};

pub use fs::FsObjectStore;
pub use s3::{S3ObjectStore, endpoint_url};
pub use simulated::{SimulatedObjectStore, StoreOp};

/// Separator used in object keys regardless of platform.
pub const KEY_SEPARATOR: char = '/';

/// Suffix for in-flight writes; such files are never listed.
pub(crate) const PARTIAL_SUFFIX: &str = ".bucketsync-partial";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("bucket '{0}' does not exist")]
    NoSuchBucket(String),

    #[error("object '{key}' not found in bucket '{bucket}'")]
    NoSuchKey { bucket: String, key: String },

    #[error("invalid object key '{0}'")]
    InvalidKey(String),

    #[error("{operation} failed for '{target}': {source}")]
    Io {
        operation: &'static str,
        target: String,
        #[source]
        source: std::io::Error,
    },

    #[error("object store unavailable: {0}")]
    Unavailable(String),

    #[error("{operation} failed for '{target}': {message}")]
    Remote {
        operation: &'static str,
        target: String,
        message: String,
    },

    #[error("object store is not configured: {0}")]
    Config(String),
}

impl StoreError {
    pub(crate) fn io(
        operation: &'static str,
        target: impl AsRef<Path>,
        source: std::io::Error,
    ) -> Self {
        Self::Io {
            operation,
            target: target.as_ref().display().to_string(),
            source,
        }
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// One entry from a recursive listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectEntry {
    pub key: String,
    pub is_dir_marker: bool,
}

impl ObjectEntry {
    pub fn object(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            is_dir_marker: false,
        }
    }

    pub fn dir_marker(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            is_dir_marker: true,
        }
    }
}

/// Capabilities the transfer engine needs from a bucket/key store.
///
/// Implementations must be safe to share across concurrently running
/// transfer tasks; the engine never mutates the handle itself.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Recursively list every key under `prefix`.
    async fn list(&self, bucket: &str, prefix: &str) -> StoreResult<Vec<ObjectEntry>>;

    /// Fetch `key` into `local_path`, creating parent directories.
    async fn get(&self, bucket: &str, key: &str, local_path: &Path) -> StoreResult<()>;

    /// Upload the file at `local_path` to `key`.
    async fn put(&self, bucket: &str, local_path: &Path, key: &str) -> StoreResult<()>;

    async fn bucket_exists(&self, bucket: &str) -> StoreResult<bool>;

    async fn create_bucket(&self, bucket: &str) -> StoreResult<()>;
}

/// Factory function to create a store based on config
pub fn create_store(config: &StoreConfig) -> anyhow::Result<Arc<dyn ObjectStore>> {
    match config.backend {
        StoreBackend::Fs => {
            let root = config
                .root
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("store.root is required for the fs backend"))?;
            Ok(Arc::new(FsObjectStore::new(root.clone())))
        }
        StoreBackend::Simulated => Ok(Arc::new(SimulatedObjectStore::default())),
        StoreBackend::S3 => Ok(Arc::new(S3ObjectStore::from_config(config)?)),
    }
}

/// Hidden sibling of `destination` that a write lands in before the rename.
pub(crate) fn partial_path(destination: &Path) -> StoreResult<PathBuf> {
    let file_name = destination
        .file_name()
        .ok_or_else(|| StoreError::InvalidKey(destination.display().to_string()))?;
    let mut partial_name = std::ffi::OsString::from(".");
    partial_name.push(file_name);
    partial_name.push(PARTIAL_SUFFIX);
    Ok(destination.with_file_name(partial_name))
}

/// Reject keys that would escape a bucket once mapped onto a filesystem.
pub(crate) fn validate_key(key: &str) -> StoreResult<()> {
    let bad = key.is_empty()
        || key.starts_with(KEY_SEPARATOR)
        || key
            .split(KEY_SEPARATOR)
            .any(|segment| segment == ".." || segment == ".");
    if bad {
        return Err(StoreError::InvalidKey(key.to_string()));
    }
    Ok(())
}
