use std::sync::Arc;
use tracing::{Instrument, debug, error, info_span};

use super::models::{Direction, TaskOutcome, TransferItem};
use super::progress::ProgressHandle;
use crate::store::{ObjectStore, StoreError};

/// Everything a task needs besides its item; shared read-only by all tasks.
#[derive(Clone)]
pub struct TransferContext {
    pub store: Arc<dyn ObjectStore>,
    pub bucket: Arc<str>,
}

impl TransferContext {
    pub fn new(store: Arc<dyn ObjectStore>, bucket: impl Into<Arc<str>>) -> Self {
        Self {
            store,
            bucket: bucket.into(),
        }
    }
}

/// Moves exactly one item and reports exactly one outcome.
pub struct TransferTask {
    ctx: TransferContext,
    item: TransferItem,
}

impl TransferTask {
    pub fn new(ctx: TransferContext, item: TransferItem) -> Self {
        Self { ctx, item }
    }

    /// Attempt the transfer once. Errors never escape: they become a failed
    /// outcome, which is both reported to `progress` and returned.
    pub async fn run(self, progress: &ProgressHandle) -> TaskOutcome {
        let span = info_span!(
            "transfer",
            direction = %self.item.direction,
            key = %self.item.remote_key,
        );

        async {
            let outcome = match self.transfer().await {
                Ok(()) => {
                    debug!(local = %self.item.local_path.display(), "Transfer finished");
                    TaskOutcome::success(self.item.clone())
                }
                Err(e) => {
                    error!(
                        error = %e,
                        "Error {}ing {}",
                        self.item.direction,
                        self.item.remote_key
                    );
                    TaskOutcome::failure(self.item.clone(), e.to_string())
                }
            };

            progress.report(outcome.clone()).await;
            outcome
        }
        .instrument(span)
        .await
    }

    async fn transfer(&self) -> Result<(), StoreError> {
        let store = &self.ctx.store;
        let bucket = &self.ctx.bucket;

        match self.item.direction {
            Direction::Download => {
                if let Some(parent) = self.item.local_path.parent() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .map_err(|e| StoreError::io("create directory", parent, e))?;
                }
                store
                    .get(bucket, &self.item.remote_key, &self.item.local_path)
                    .await
            }
            Direction::Upload => {
                store
                    .put(bucket, &self.item.local_path, &self.item.remote_key)
                    .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FailureStatusPolicy;
    use crate::core::progress::{ProgressAggregator, ProgressState};
    use crate::status::StatusPublisher;
    use crate::store::SimulatedObjectStore;
    use std::time::{Duration, Instant};
    use tempfile::tempdir;

    fn aggregator(total: u64) -> ProgressAggregator {
        let state = ProgressState::new(
            Direction::Download,
            total,
            FailureStatusPolicy::Terminal,
            Instant::now(),
        );
        ProgressAggregator::new(state, StatusPublisher::disabled(), Duration::ZERO)
    }

    #[tokio::test]
    async fn test_download_success_reports_once() {
        let temp = tempdir().unwrap();
        let store = Arc::new(SimulatedObjectStore::with_latency(Duration::ZERO));
        store.insert_object("models", "llama/config.json", b"{}".to_vec());

        let ctx = TransferContext::new(store, "models");
        let target = temp.path().join("llama/config.json");
        let task = TransferTask::new(ctx, TransferItem::download("llama/config.json", &target));

        let (handle, join) = aggregator(1).spawn(1);
        let outcome = task.run(&handle).await;
        drop(handle);

        assert!(outcome.succeeded);
        assert_eq!(std::fs::read(&target).unwrap(), b"{}");

        let summary = join.await.unwrap();
        assert_eq!(summary.state.completed(), 1);
    }

    #[tokio::test]
    async fn test_failure_is_captured_not_propagated() {
        let temp = tempdir().unwrap();
        let store = Arc::new(SimulatedObjectStore::with_latency(Duration::ZERO));
        store.insert_bucket("models");

        let ctx = TransferContext::new(store, "models");
        let task = TransferTask::new(
            ctx,
            TransferItem::download("missing.bin", temp.path().join("missing.bin")),
        );

        let (handle, join) = aggregator(1).spawn(1);
        let outcome = task.run(&handle).await;
        drop(handle);

        assert!(!outcome.succeeded);
        assert!(outcome.error.unwrap().contains("missing.bin"));

        let summary = join.await.unwrap();
        assert_eq!(summary.state.completed(), 0);
        assert_eq!(summary.state.failed(), 1);
    }
}
