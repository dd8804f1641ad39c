//! End-to-end runs of the orchestrator against the simulated store.
//!
//! A recording sink captures every status upsert so the published sequence
//! can be checked, not just the final state.

use async_trait::async_trait;
use bucketsync::config::{FailureStatusPolicy, TransferConfig};
use bucketsync::core::{Direction, Orchestrator, TransferRequest};
use bucketsync::status::{FileStatusSink, StatusError, StatusPublisher, StatusResult, StatusSink};
use bucketsync::store::{SimulatedObjectStore, StoreOp};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::tempdir;

type Fields = BTreeMap<String, String>;

/// Records every upsert; fails the first `fail_first` calls and, if
/// `fail_terminal` is set, any call that carries a terminal status.
#[derive(Default)]
struct RecordingSink {
    calls: Mutex<Vec<Fields>>,
    attempts: AtomicUsize,
    fail_first: usize,
    fail_terminal: bool,
}

impl RecordingSink {
    fn failing_first(n: usize) -> Self {
        Self {
            fail_first: n,
            ..Default::default()
        }
    }

    fn failing_terminal() -> Self {
        Self {
            fail_terminal: true,
            ..Default::default()
        }
    }

    fn calls(&self) -> Vec<Fields> {
        self.calls.lock().unwrap().clone()
    }

    fn statuses(&self) -> Vec<String> {
        self.calls().iter().map(|f| f["status"].clone()).collect()
    }
}

#[async_trait]
impl StatusSink for RecordingSink {
    async fn upsert(&self, _namespace: &str, _name: &str, fields: &Fields) -> StatusResult<()> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        let terminal = matches!(fields["status"].as_str(), "completed" | "failed");
        if attempt < self.fail_first || (self.fail_terminal && terminal) {
            return Err(StatusError::Config("sink offline".to_string()));
        }
        self.calls.lock().unwrap().push(fields.clone());
        Ok(())
    }
}

fn transfer_config(workers: usize, failure_status: FailureStatusPolicy) -> TransferConfig {
    TransferConfig {
        workers,
        failure_status,
        progress_log_interval_ms: 0,
    }
}

fn terminal_policy(workers: usize) -> TransferConfig {
    transfer_config(workers, FailureStatusPolicy::Terminal)
}

fn seeded_store(keys: &[&str]) -> Arc<SimulatedObjectStore> {
    let store = Arc::new(SimulatedObjectStore::with_latency(Duration::from_millis(2)));
    store.insert_bucket("models");
    for key in keys {
        store.insert_object("models", key, format!("content of {}", key).into_bytes());
    }
    store
}

fn download(prefix: &str, local_root: &Path) -> TransferRequest {
    TransferRequest {
        direction: Direction::Download,
        prefix: prefix.to_string(),
        local_root: local_root.to_path_buf(),
    }
}

fn orchestrator(
    store: Arc<SimulatedObjectStore>,
    sink: Arc<dyn StatusSink>,
    config: TransferConfig,
) -> Orchestrator {
    let publisher = StatusPublisher::new(Some(sink), "default", "transfer-progress");
    Orchestrator::with_parts(store, "models", publisher, config)
}

#[tokio::test]
async fn all_items_succeed() {
    let temp = tempdir().unwrap();
    let store = seeded_store(&["llama/a.bin", "llama/b.bin", "llama/c.bin"]);
    let sink = Arc::new(RecordingSink::default());

    let report = orchestrator(store, sink.clone(), terminal_policy(10))
        .run(&download("llama/", temp.path()))
        .await
        .unwrap();

    assert!(report.overall_success);
    assert_eq!(report.total, 3);
    assert_eq!(report.completed, 3);
    assert!(report.failed_items.is_empty());

    let calls = sink.calls();
    // initial + one per item + terminal
    assert_eq!(calls.len(), 5);

    let terminal = calls.last().unwrap();
    assert_eq!(terminal["total_files"], "3");
    assert_eq!(terminal["completed_files"], "3");
    assert_eq!(terminal["status"], "completed");
    assert_eq!(terminal["eta"], "0.0");

    for name in ["a.bin", "b.bin", "c.bin"] {
        let content = std::fs::read_to_string(temp.path().join(name)).unwrap();
        assert_eq!(content, format!("content of llama/{}", name));
    }
}

#[tokio::test]
async fn one_failed_item_fails_the_batch() {
    let temp = tempdir().unwrap();
    let store = seeded_store(&["llama/a.bin", "llama/b.bin", "llama/c.bin"]);
    store.fail_key("llama/b.bin");
    let sink = Arc::new(RecordingSink::default());

    let report = orchestrator(store, sink.clone(), terminal_policy(10))
        .run(&download("llama/", temp.path()))
        .await
        .unwrap();

    assert!(!report.overall_success);
    assert_eq!(report.completed, 2);
    assert_eq!(report.failed_items.len(), 1);
    assert_eq!(report.failed_items[0].item.remote_key, "llama/b.bin");

    let terminal = sink.calls().last().cloned().unwrap();
    assert_eq!(terminal["status"], "failed");
    assert_eq!(terminal["completed_files"], "2");
    assert_eq!(terminal["total_files"], "3");

    // Siblings of the failed item still landed.
    assert!(temp.path().join("a.bin").exists());
    assert!(temp.path().join("c.bin").exists());
    assert!(!temp.path().join("b.bin").exists());
}

#[tokio::test]
async fn empty_prefix_publishes_nothing() {
    let temp = tempdir().unwrap();
    let store = seeded_store(&["mistral/a.bin"]);
    let sink = Arc::new(RecordingSink::default());

    let report = orchestrator(store.clone(), sink.clone(), terminal_policy(10))
        .run(&download("llama/", temp.path()))
        .await
        .unwrap();

    assert!(report.overall_success);
    assert_eq!(report.total, 0);
    assert!(sink.calls().is_empty());
    assert!(
        store
            .operations()
            .iter()
            .all(|op| !matches!(op, StoreOp::Get { .. }))
    );
}

#[tokio::test]
async fn directory_markers_are_not_transferred() {
    let temp = tempdir().unwrap();
    let store = seeded_store(&["llama/a.bin"]);
    store.insert_object("models", "llama/", Vec::new());
    store.insert_object("models", "llama/empty/", Vec::new());
    let sink = Arc::new(RecordingSink::default());

    let report = orchestrator(store.clone(), sink, terminal_policy(10))
        .run(&download("llama/", temp.path()))
        .await
        .unwrap();

    assert_eq!(report.total, 1);
    let gets: Vec<_> = store
        .operations()
        .into_iter()
        .filter_map(|op| match op {
            StoreOp::Get { key, .. } => Some(key),
            _ => None,
        })
        .collect();
    assert_eq!(gets, vec!["llama/a.bin".to_string()]);
}

#[tokio::test]
async fn upload_creates_missing_bucket_first() {
    let temp = tempdir().unwrap();
    std::fs::create_dir_all(temp.path().join("weights")).unwrap();
    std::fs::write(temp.path().join("config.json"), b"{}").unwrap();
    std::fs::write(temp.path().join("weights/0.bin"), b"0").unwrap();

    let store = Arc::new(SimulatedObjectStore::with_latency(Duration::ZERO));
    let sink = Arc::new(RecordingSink::default());

    let report = orchestrator(store.clone(), sink.clone(), terminal_policy(10))
        .run(&TransferRequest {
            direction: Direction::Upload,
            prefix: "llama/".to_string(),
            local_root: temp.path().to_path_buf(),
        })
        .await
        .unwrap();

    assert!(report.overall_success);
    assert_eq!(store.object("models", "llama/weights/0.bin").unwrap(), b"0");
    assert_eq!(store.object("models", "llama/config.json").unwrap(), b"{}");

    let ops = store.operations();
    let created = ops
        .iter()
        .position(|op| matches!(op, StoreOp::CreateBucket(b) if b == "models"))
        .expect("bucket should be created");
    let first_put = ops
        .iter()
        .position(|op| matches!(op, StoreOp::Put { .. }))
        .expect("files should be uploaded");
    assert!(created < first_put);

    assert_eq!(sink.statuses().first().unwrap(), "uploading");
    assert_eq!(sink.statuses().last().unwrap(), "completed");
}

#[tokio::test]
async fn upload_into_existing_bucket_skips_create() {
    let temp = tempdir().unwrap();
    std::fs::write(temp.path().join("a.txt"), b"a").unwrap();
    let store = seeded_store(&[]);

    let sink = Arc::new(RecordingSink::default());
    orchestrator(store.clone(), sink, terminal_policy(2))
        .run(&TransferRequest {
            direction: Direction::Upload,
            prefix: String::new(),
            local_root: temp.path().to_path_buf(),
        })
        .await
        .unwrap();

    assert!(
        store
            .operations()
            .iter()
            .all(|op| !matches!(op, StoreOp::CreateBucket(_)))
    );
    assert_eq!(store.object("models", "a.txt").unwrap(), b"a");
}

#[tokio::test]
async fn terminal_policy_keeps_running_label_mid_run() {
    let temp = tempdir().unwrap();
    let store = seeded_store(&["llama/a.bin", "llama/b.bin", "llama/c.bin"]);
    store.fail_key("llama/b.bin");
    let sink = Arc::new(RecordingSink::default());

    orchestrator(store, sink.clone(), terminal_policy(1))
        .run(&download("llama/", temp.path()))
        .await
        .unwrap();

    assert_eq!(
        sink.statuses(),
        vec!["downloading", "downloading", "downloading", "downloading", "failed"]
    );
}

#[tokio::test]
async fn sticky_policy_flips_on_first_failure() {
    let temp = tempdir().unwrap();
    let store = seeded_store(&["llama/a.bin", "llama/b.bin", "llama/c.bin"]);
    store.fail_key("llama/b.bin");
    let sink = Arc::new(RecordingSink::default());

    orchestrator(store, sink.clone(), transfer_config(1, FailureStatusPolicy::Sticky))
        .run(&download("llama/", temp.path()))
        .await
        .unwrap();

    assert_eq!(
        sink.statuses(),
        vec!["downloading", "downloading", "failed", "failed", "failed"]
    );
}

#[tokio::test]
async fn snapshots_are_monotonic_and_eta_non_negative() {
    let temp = tempdir().unwrap();
    let keys: Vec<String> = (0..25).map(|i| format!("llama/shard-{:02}.bin", i)).collect();
    let key_refs: Vec<&str> = keys.iter().map(String::as_str).collect();
    let store = seeded_store(&key_refs);
    store.fail_key("llama/shard-07.bin");
    let sink = Arc::new(RecordingSink::default());

    let report = orchestrator(store, sink.clone(), terminal_policy(4))
        .run(&download("llama/", temp.path()))
        .await
        .unwrap();

    let completed: Vec<u64> = sink
        .calls()
        .iter()
        .map(|f| f["completed_files"].parse().unwrap())
        .collect();
    assert!(completed.windows(2).all(|w| w[0] <= w[1]));
    assert!(completed.iter().all(|c| *c <= 25));

    assert!(
        sink.calls()
            .iter()
            .all(|f| f["eta"].parse::<f64>().unwrap() >= 0.0)
    );
    assert_eq!(report.completed, 24);
    assert_eq!(report.completed == report.total, report.overall_success);
}

#[tokio::test]
async fn mid_run_publish_failures_are_tolerated() {
    let temp = tempdir().unwrap();
    let store = seeded_store(&["llama/a.bin", "llama/b.bin"]);
    let sink = Arc::new(RecordingSink::failing_first(2));

    let report = orchestrator(store, sink.clone(), terminal_policy(10))
        .run(&download("llama/", temp.path()))
        .await
        .unwrap();

    assert!(report.overall_success);
    assert_eq!(sink.statuses().last().unwrap(), "completed");
}

#[tokio::test]
async fn terminal_publish_failure_is_an_error() {
    let temp = tempdir().unwrap();
    let store = seeded_store(&["llama/a.bin"]);
    let sink = Arc::new(RecordingSink::failing_terminal());

    let result = orchestrator(store, sink, terminal_policy(10))
        .run(&download("llama/", temp.path()))
        .await;

    assert!(result.is_err());
    // The data itself still moved.
    assert!(temp.path().join("a.bin").exists());
}

#[tokio::test]
async fn file_sink_ends_with_terminal_record() {
    let temp = tempdir().unwrap();
    let status_dir = temp.path().join("status");
    let local_root = temp.path().join("local");
    let store = seeded_store(&["llama/a.bin", "llama/b.bin", "llama/c.bin"]);
    let sink = Arc::new(FileStatusSink::new(&status_dir));

    orchestrator(store, sink.clone(), terminal_policy(3))
        .run(&download("llama/", &local_root))
        .await
        .unwrap();

    let record = sink.read("default", "transfer-progress").await.unwrap().unwrap();
    assert_eq!(record["total_files"], "3");
    assert_eq!(record["completed_files"], "3");
    assert_eq!(record["status"], "completed");
}
