use super::{StatusError, StatusResult, StatusSink};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

/// Keeps each record as a JSON object at `<directory>/<namespace>/<name>.json`.
///
/// Useful outside a cluster: anything that can poll a file can follow
/// progress. Writes are serialized and land via rename.
pub struct FileStatusSink {
    directory: PathBuf,
    write_lock: Mutex<()>,
}

impl FileStatusSink {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn record_path(&self, namespace: &str, name: &str) -> PathBuf {
        self.directory.join(namespace).join(format!("{}.json", name))
    }

    /// Read a record back; `None` if it was never written.
    pub async fn read(
        &self,
        namespace: &str,
        name: &str,
    ) -> StatusResult<Option<BTreeMap<String, String>>> {
        read_record(&self.record_path(namespace, name)).await
    }
}

async fn read_record(path: &Path) -> StatusResult<Option<BTreeMap<String, String>>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(io_error(path, source)),
    }
}

fn io_error(path: &Path, source: std::io::Error) -> StatusError {
    StatusError::Io {
        path: path.display().to_string(),
        source,
    }
}

#[async_trait]
impl StatusSink for FileStatusSink {
    async fn upsert(
        &self,
        namespace: &str,
        name: &str,
        fields: &BTreeMap<String, String>,
    ) -> StatusResult<()> {
        let _guard = self.write_lock.lock().await;
        let path = self.record_path(namespace, name);

        let mut record = read_record(&path).await?.unwrap_or_default();
        record.extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(parent, e))?;
        }

        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(&record)?)
            .await
            .map_err(|e| io_error(&tmp, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| io_error(&path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn fields(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_upsert_creates_then_merges() {
        let temp = tempdir().unwrap();
        let sink = FileStatusSink::new(temp.path());

        let first = fields(&[("total_files", "3"), ("status", "uploading")]);
        sink.upsert("default", "progress", &first).await.unwrap();
        sink.upsert("default", "progress", &fields(&[("status", "completed")]))
            .await
            .unwrap();

        let record = sink.read("default", "progress").await.unwrap().unwrap();
        assert_eq!(record, fields(&[("status", "completed"), ("total_files", "3")]));
    }

    #[tokio::test]
    async fn test_repeated_upsert_is_idempotent() {
        let temp = tempdir().unwrap();
        let sink = FileStatusSink::new(temp.path());
        let update = fields(&[("completed_files", "2"), ("status", "failed")]);

        sink.upsert("ml", "run", &update).await.unwrap();
        let first = std::fs::read(sink.record_path("ml", "run")).unwrap();
        sink.upsert("ml", "run", &update).await.unwrap();
        let second = std::fs::read(sink.record_path("ml", "run")).unwrap();

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_read_missing_record() {
        let temp = tempdir().unwrap();
        let sink = FileStatusSink::new(temp.path());
        assert!(sink.read("ml", "absent").await.unwrap().is_none());
    }
}
