use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::sleep;

use super::{ObjectEntry, ObjectStore, StoreError, StoreResult, validate_key};

/// Operations recorded by the simulated store, in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    List { bucket: String, prefix: String },
    Get { bucket: String, key: String },
    Put { bucket: String, key: String },
    BucketExists(String),
    CreateBucket(String),
}

#[derive(Default)]
struct State {
    buckets: HashMap<String, BTreeMap<String, Vec<u8>>>,
    failing_keys: HashSet<String>,
    unavailable: bool,
    ops: Vec<StoreOp>,
}

/// In-memory object store for dry runs and tests.
///
/// Keys registered with [`SimulatedObjectStore::fail_key`] fail on get/put,
/// and [`SimulatedObjectStore::set_unavailable`] makes every call fail as if
/// the endpoint could not be reached.
pub struct SimulatedObjectStore {
    latency: Duration,
    state: Mutex<State>,
}

impl Default for SimulatedObjectStore {
    fn default() -> Self {
        Self::with_latency(Duration::from_millis(20))
    }
}

impl SimulatedObjectStore {
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            state: Mutex::new(State::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn insert_object(&self, bucket: &str, key: &str, content: impl Into<Vec<u8>>) {
        self.state()
            .buckets
            .entry(bucket.to_string())
            .or_default()
            .insert(key.to_string(), content.into());
    }

    pub fn insert_bucket(&self, bucket: &str) {
        self.state().buckets.entry(bucket.to_string()).or_default();
    }

    pub fn fail_key(&self, key: &str) {
        self.state().failing_keys.insert(key.to_string());
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.state().unavailable = unavailable;
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        self.state().buckets.get(bucket)?.get(key).cloned()
    }

    pub fn operations(&self) -> Vec<StoreOp> {
        self.state().ops.clone()
    }

    fn record(&self, op: StoreOp) -> StoreResult<()> {
        let mut state = self.state();
        state.ops.push(op);
        if state.unavailable {
            return Err(StoreError::Unavailable("simulated endpoint is down".to_string()));
        }
        Ok(())
    }

    fn check_key(&self, key: &str) -> StoreResult<()> {
        validate_key(key)?;
        if self.state().failing_keys.contains(key) {
            return Err(StoreError::Unavailable(format!("injected failure for '{}'", key)));
        }
        Ok(())
    }

    async fn delay(&self) {
        if !self.latency.is_zero() {
            sleep(self.latency).await;
        }
    }
}

#[async_trait]
impl ObjectStore for SimulatedObjectStore {
    async fn list(&self, bucket: &str, prefix: &str) -> StoreResult<Vec<ObjectEntry>> {
        self.record(StoreOp::List {
            bucket: bucket.to_string(),
            prefix: prefix.to_string(),
        })?;
        self.delay().await;

        let state = self.state();
        let objects = state
            .buckets
            .get(bucket)
            .ok_or_else(|| StoreError::NoSuchBucket(bucket.to_string()))?;

        Ok(objects
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, content)| ObjectEntry {
                key: key.clone(),
                is_dir_marker: key.ends_with('/') && content.is_empty(),
            })
            .collect())
    }

    async fn get(&self, bucket: &str, key: &str, local_path: &Path) -> StoreResult<()> {
        self.record(StoreOp::Get {
            bucket: bucket.to_string(),
            key: key.to_string(),
        })?;
        self.check_key(key)?;
        self.delay().await;

        let content = self.object(bucket, key).ok_or_else(|| StoreError::NoSuchKey {
            bucket: bucket.to_string(),
            key: key.to_string(),
        })?;

        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::io("create directory", parent, e))?;
        }
        tokio::fs::write(local_path, content)
            .await
            .map_err(|e| StoreError::io("write", local_path, e))
    }

    async fn put(&self, bucket: &str, local_path: &Path, key: &str) -> StoreResult<()> {
        self.record(StoreOp::Put {
            bucket: bucket.to_string(),
            key: key.to_string(),
        })?;
        self.check_key(key)?;
        self.delay().await;

        let content = tokio::fs::read(local_path)
            .await
            .map_err(|e| StoreError::io("read", local_path, e))?;

        let mut state = self.state();
        let objects = state
            .buckets
            .get_mut(bucket)
            .ok_or_else(|| StoreError::NoSuchBucket(bucket.to_string()))?;
        objects.insert(key.to_string(), content);
        Ok(())
    }

    async fn bucket_exists(&self, bucket: &str) -> StoreResult<bool> {
        self.record(StoreOp::BucketExists(bucket.to_string()))?;
        Ok(self.state().buckets.contains_key(bucket))
    }

    async fn create_bucket(&self, bucket: &str) -> StoreResult<()> {
        self.record(StoreOp::CreateBucket(bucket.to_string()))?;
        self.insert_bucket(bucket);
        Ok(())
    }
}
