//! Batch progress aggregation.
//!
//! Transfer tasks never touch the progress state directly. Each one sends its
//! [`TaskOutcome`] over a channel to a single [`ProgressAggregator`] task,
//! which is the only writer of [`ProgressState`]. For every message it
//! updates the counters, derives a snapshot, and publishes it before reading
//! the next message, so publish order always equals the order in which
//! completions were observed.

use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::models::{Direction, ProgressSnapshot, StatusLabel, TaskOutcome};
use crate::config::FailureStatusPolicy;
use crate::logging::LogThrottle;
use crate::status::StatusPublisher;

/// Linear ETA from cumulative throughput since the batch started.
///
/// Returns 0 when nothing has completed yet or no time has passed.
pub fn estimate_eta(total: u64, completed: u64, elapsed: Duration) -> f64 {
    let elapsed = elapsed.as_secs_f64();
    let rate = if elapsed > 0.0 {
        completed as f64 / elapsed
    } else {
        0.0
    };

    if rate > 0.0 {
        total.saturating_sub(completed) as f64 / rate
    } else {
        0.0
    }
}

/// Render seconds as `Xm Ys` for log lines.
pub fn format_eta(eta_seconds: f64) -> String {
    let secs = eta_seconds.max(0.0) as u64;
    format!("{}m {}s", secs / 60, secs % 60)
}

/// Mutable progress of one invocation.
#[derive(Debug, Clone)]
pub struct ProgressState {
    direction: Direction,
    total: u64,
    completed: u64,
    failed: u64,
    started_at: Instant,
    status: StatusLabel,
    policy: FailureStatusPolicy,
}

impl ProgressState {
    pub fn new(
        direction: Direction,
        total: u64,
        policy: FailureStatusPolicy,
        started_at: Instant,
    ) -> Self {
        Self {
            direction,
            total,
            completed: 0,
            failed: 0,
            started_at,
            status: StatusLabel::Pending,
            policy,
        }
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn completed(&self) -> u64 {
        self.completed
    }

    pub fn failed(&self) -> u64 {
        self.failed
    }

    pub fn status(&self) -> StatusLabel {
        self.status
    }

    /// Move from pending to running and describe the empty starting point.
    pub fn start(&mut self, now: Instant) -> ProgressSnapshot {
        if self.status == StatusLabel::Pending {
            self.status = StatusLabel::Running;
        }
        self.snapshot(now, None)
    }

    /// Fold one task outcome into the state.
    ///
    /// Success bumps `completed` and leaves the label alone. Failure only
    /// counts the failure; under [`FailureStatusPolicy::Sticky`] it also
    /// flips the label to failed for the rest of the run.
    pub fn record(&mut self, outcome: &TaskOutcome, now: Instant) -> ProgressSnapshot {
        if self.status == StatusLabel::Pending {
            self.status = StatusLabel::Running;
        }

        if outcome.succeeded {
            if self.completed < self.total {
                self.completed += 1;
            }
        } else {
            self.failed += 1;
            if self.policy == FailureStatusPolicy::Sticky && !self.status.is_terminal() {
                self.status = StatusLabel::Failed;
            }
        }

        self.snapshot(now, Some(outcome.item.remote_key.clone()))
    }

    /// Settle the terminal label. This always wins over a sticky failure.
    pub fn finish(&mut self, overall_success: bool, now: Instant) -> ProgressSnapshot {
        self.status = if overall_success {
            StatusLabel::Completed
        } else {
            StatusLabel::Failed
        };
        self.snapshot(now, None)
    }

    pub fn snapshot(&self, now: Instant, last_key: Option<String>) -> ProgressSnapshot {
        let elapsed = now.saturating_duration_since(self.started_at);
        ProgressSnapshot {
            direction: self.direction,
            total: self.total,
            completed: self.completed,
            failed: self.failed,
            elapsed,
            eta_seconds: estimate_eta(self.total, self.completed, elapsed),
            status: self.status,
            last_key,
        }
    }
}

/// Cheap, cloneable sender side handed to every transfer task.
#[derive(Clone)]
pub struct ProgressHandle {
    tx: mpsc::Sender<TaskOutcome>,
}

impl ProgressHandle {
    /// Report a finished task. Silently dropped if the aggregator is gone.
    pub async fn report(&self, outcome: TaskOutcome) {
        let _ = self.tx.send(outcome).await;
    }
}

/// What the aggregator hands back once every sender is gone.
#[derive(Debug)]
pub struct AggregatorSummary {
    pub state: ProgressState,
    pub snapshots_published: u64,
    pub publish_failures: u64,
}

/// Single consumer of task outcomes and sole writer of [`ProgressState`].
pub struct ProgressAggregator {
    state: ProgressState,
    publisher: StatusPublisher,
    throttle: LogThrottle,
    snapshots_published: u64,
    publish_failures: u64,
}

impl ProgressAggregator {
    pub fn new(state: ProgressState, publisher: StatusPublisher, log_interval: Duration) -> Self {
        Self {
            state,
            publisher,
            throttle: LogThrottle::new(log_interval),
            snapshots_published: 0,
            publish_failures: 0,
        }
    }

    /// Run the aggregator on its own task.
    ///
    /// The returned handle resolves once every [`ProgressHandle`] clone has
    /// been dropped and all queued outcomes have been published.
    pub fn spawn(self, capacity: usize) -> (ProgressHandle, JoinHandle<AggregatorSummary>) {
        let (tx, mut rx) = mpsc::channel(capacity.max(1));

        let handle = tokio::spawn(async move {
            let mut aggregator = self;
            while let Some(outcome) = rx.recv().await {
                aggregator.apply(outcome).await;
            }
            aggregator.into_summary()
        });

        (ProgressHandle { tx }, handle)
    }

    /// Update state for one outcome and publish the resulting snapshot.
    pub async fn apply(&mut self, outcome: TaskOutcome) -> ProgressSnapshot {
        let snapshot = self.state.record(&outcome, Instant::now());

        if outcome.succeeded && self.throttle.should_log() {
            info!(
                completed = snapshot.completed,
                total = snapshot.total,
                eta_secs = snapshot.eta_seconds,
                key = %outcome.item.remote_key,
                "Progress: {}/{} files ({:.1}%) - ETA: {} - {}: {}",
                snapshot.completed,
                snapshot.total,
                snapshot.percentage(),
                format_eta(snapshot.eta_seconds),
                snapshot.direction.past_tense(),
                outcome.item.remote_key,
            );
        }

        self.publish(&snapshot).await;
        snapshot
    }

    async fn publish(&mut self, snapshot: &ProgressSnapshot) {
        match self.publisher.publish(snapshot).await {
            Ok(()) => self.snapshots_published += 1,
            Err(e) => {
                self.publish_failures += 1;
                warn!(
                    error = %e,
                    completed = snapshot.completed,
                    total = snapshot.total,
                    "Failed to publish progress; continuing"
                );
            }
        }
    }

    pub fn into_summary(self) -> AggregatorSummary {
        AggregatorSummary {
            state: self.state,
            snapshots_published: self.snapshots_published,
            publish_failures: self.publish_failures,
        }
    }
}
