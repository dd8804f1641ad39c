use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{Instrument, debug, error, info, info_span, warn};

use super::enumerator::{enumerate_download, enumerate_upload};
use super::models::{Direction, TransferBatch, TransferReport};
use super::progress::{ProgressAggregator, ProgressState};
use super::transfer_task::TransferContext;
use super::worker_pool::WorkerPool;
use crate::config::TransferConfig;
use crate::context::AppContext;
use crate::status::StatusPublisher;
use crate::store::ObjectStore;

/// One invocation: which way, which remote prefix, which local root.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub direction: Direction,
    /// Listing prefix, already normalized (empty or ending in `/`).
    pub prefix: String,
    pub local_root: PathBuf,
}

/// Lifecycle of a single invocation, logged as it advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Enumerating,
    EmptySuccess,
    Scheduling,
    Draining,
    Finalizing,
    Done,
}

/// Top-level control for both directions: enumerate, schedule, drain,
/// then publish the authoritative terminal status.
pub struct Orchestrator {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    publisher: StatusPublisher,
    transfer: TransferConfig,
}

impl Orchestrator {
    pub fn new(ctx: &AppContext) -> Self {
        Self::with_parts(
            ctx.store.clone(),
            ctx.config.store.bucket.clone(),
            ctx.publisher.clone(),
            ctx.config.transfer.clone(),
        )
    }

    pub fn with_parts(
        store: Arc<dyn ObjectStore>,
        bucket: impl Into<String>,
        publisher: StatusPublisher,
        transfer: TransferConfig,
    ) -> Self {
        Self {
            store,
            bucket: bucket.into(),
            publisher,
            transfer,
        }
    }

    /// Run one full pass.
    ///
    /// `Err` means the run could not start (enumeration, bucket setup) or the
    /// terminal status could not be published. Item failures are reported
    /// through `TransferReport::overall_success` instead.
    pub async fn run(&self, request: &TransferRequest) -> Result<TransferReport> {
        let span = info_span!(
            "sync",
            direction = %request.direction,
            bucket = %self.bucket,
            prefix = %request.prefix,
        );
        self.run_phases(request).instrument(span).await
    }

    async fn run_phases(&self, request: &TransferRequest) -> Result<TransferReport> {
        let mut phase = Phase::Idle;
        advance(&mut phase, Phase::Enumerating);

        match request.direction {
            Direction::Download => info!(
                "Starting download from bucket: {}, prefix: {} to {}",
                self.bucket,
                request.prefix,
                request.local_root.display()
            ),
            Direction::Upload => info!(
                "Uploading from: {} to store://{}/{}",
                request.local_root.display(),
                self.bucket,
                request.prefix
            ),
        }

        let batch = self.enumerate(request).await?;

        if batch.is_empty() {
            advance(&mut phase, Phase::EmptySuccess);
            info!("No files to {}", request.direction);
            advance(&mut phase, Phase::Done);
            return Ok(TransferReport::empty(request.direction));
        }

        advance(&mut phase, Phase::Scheduling);
        info!(total = batch.total(), "Found {} files to {}", batch.total(), request.direction);

        if !self.publisher.is_enabled() {
            debug!("Status reporting is disabled");
        }

        let started_at = Instant::now();
        let mut state = ProgressState::new(
            batch.direction,
            batch.total(),
            self.transfer.failure_status,
            started_at,
        );

        let initial = state.start(started_at);
        if let Err(e) = self.publisher.publish(&initial).await {
            warn!(error = %e, "Failed to publish initial status; continuing");
        }

        let workers = self.transfer.workers.max(1);
        let aggregator = ProgressAggregator::new(
            state,
            self.publisher.clone(),
            Duration::from_millis(self.transfer.progress_log_interval_ms),
        );
        let (progress, aggregator_handle) = aggregator.spawn(workers * 2);

        let ctx = TransferContext::new(self.store.clone(), self.bucket.as_str());

        advance(&mut phase, Phase::Draining);
        let outcomes = WorkerPool::new(workers).run(ctx, batch.items, progress).await;

        let summary = aggregator_handle
            .await
            .context("Progress aggregator task failed")?;

        advance(&mut phase, Phase::Finalizing);
        let overall_success = outcomes.iter().all(|o| o.succeeded);
        let mut state = summary.state;
        let terminal = state.finish(overall_success, Instant::now());

        let report = TransferReport {
            direction: request.direction,
            total: terminal.total,
            completed: terminal.completed,
            failed_items: outcomes.into_iter().filter(|o| !o.succeeded).collect(),
            overall_success,
            elapsed: terminal.elapsed,
        };

        if overall_success {
            info!(
                total = report.total,
                elapsed_secs = report.elapsed.as_secs_f64(),
                "{} completed successfully!",
                request.direction.title()
            );
        } else {
            for failed in &report.failed_items {
                debug!(
                    key = %failed.item.remote_key,
                    error = failed.error.as_deref().unwrap_or("unknown"),
                    "Item failed"
                );
            }
            error!(
                failed = report.failed_items.len(),
                completed = report.completed,
                total = report.total,
                "Failed to {} some files: store://{}/{}",
                request.direction,
                self.bucket,
                request.prefix
            );
        }

        if summary.publish_failures > 0 {
            warn!(
                failures = summary.publish_failures,
                "Some progress updates could not be published"
            );
        }

        self.publisher
            .publish(&terminal)
            .await
            .context("Failed to publish terminal status")?;

        advance(&mut phase, Phase::Done);
        Ok(report)
    }

    async fn enumerate(&self, request: &TransferRequest) -> Result<TransferBatch> {
        let items = match request.direction {
            Direction::Download => {
                enumerate_download(
                    self.store.as_ref(),
                    &self.bucket,
                    &request.prefix,
                    &request.local_root,
                )
                .await?
            }
            Direction::Upload => {
                self.ensure_bucket().await?;
                enumerate_upload(&request.local_root, &request.prefix).await?
            }
        };
        Ok(TransferBatch::new(request.direction, items))
    }

    async fn ensure_bucket(&self) -> Result<()> {
        let exists = self
            .store
            .bucket_exists(&self.bucket)
            .await
            .with_context(|| format!("Failed to check bucket {}", self.bucket))?;

        if !exists {
            self.store
                .create_bucket(&self.bucket)
                .await
                .with_context(|| format!("Failed to create bucket {}", self.bucket))?;
            info!("Created bucket: {}", self.bucket);
        }
        Ok(())
    }
}

fn advance(phase: &mut Phase, next: Phase) {
    debug!(from = ?*phase, to = ?next, "Phase transition");
    *phase = next;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AppConfig, FailureStatusPolicy};
    use crate::store::SimulatedObjectStore;
    use tempfile::tempdir;

    fn transfer_config() -> TransferConfig {
        TransferConfig {
            workers: 4,
            failure_status: FailureStatusPolicy::Terminal,
            progress_log_interval_ms: 0,
        }
    }

    #[tokio::test]
    async fn test_download_then_upload_round_trip() {
        let temp = tempdir().unwrap();
        let store = Arc::new(SimulatedObjectStore::with_latency(Duration::ZERO));
        store.insert_object("models", "llama/config.json", b"{}".to_vec());
        store.insert_object("models", "llama/weights/0.bin", b"weights".to_vec());

        let orchestrator = Orchestrator::with_parts(
            store.clone(),
            "models",
            StatusPublisher::disabled(),
            transfer_config(),
        );

        let local_root = temp.path().join("llama");
        let report = orchestrator
            .run(&TransferRequest {
                direction: Direction::Download,
                prefix: "llama/".to_string(),
                local_root: local_root.clone(),
            })
            .await
            .unwrap();
        assert!(report.overall_success);
        assert_eq!(report.completed, 2);
        assert_eq!(std::fs::read(local_root.join("weights/0.bin")).unwrap(), b"weights");

        let report = orchestrator
            .run(&TransferRequest {
                direction: Direction::Upload,
                prefix: "copy/".to_string(),
                local_root,
            })
            .await
            .unwrap();
        assert!(report.overall_success);
        assert_eq!(store.object("models", "copy/weights/0.bin").unwrap(), b"weights");
    }

    #[tokio::test]
    async fn test_listing_failure_aborts() {
        let temp = tempdir().unwrap();
        let store = Arc::new(SimulatedObjectStore::with_latency(Duration::ZERO));
        store.insert_bucket("models");
        store.set_unavailable(true);

        let orchestrator = Orchestrator::with_parts(
            store,
            "models",
            StatusPublisher::disabled(),
            transfer_config(),
        );
        let result = orchestrator
            .run(&TransferRequest {
                direction: Direction::Download,
                prefix: "llama/".to_string(),
                local_root: temp.path().to_path_buf(),
            })
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_new_reads_context() {
        let mut config = AppConfig::default();
        config.store.backend = crate::config::StoreBackend::Simulated;
        config.store.bucket = "weights".to_string();
        let ctx = AppContext::new(config).unwrap();

        let orchestrator = Orchestrator::new(&ctx);
        assert_eq!(orchestrator.bucket, "weights");
        assert_eq!(orchestrator.transfer.workers, 10);
    }
}
