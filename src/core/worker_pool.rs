use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error};

use super::models::{TaskOutcome, TransferItem};
use super::progress::ProgressHandle;
use super::transfer_task::{TransferContext, TransferTask};
use crate::config::DEFAULT_WORKERS;

/// Runs transfer tasks with a fixed upper bound on concurrency.
///
/// Items start in the order given, each as soon as a slot frees up. One
/// item failing never affects the others and nothing is retried.
#[derive(Debug, Clone, Copy)]
pub struct WorkerPool {
    workers: usize,
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new(DEFAULT_WORKERS)
    }
}

impl WorkerPool {
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Run every item once and return one outcome per item, in input order.
    pub async fn run(
        &self,
        ctx: TransferContext,
        items: Vec<TransferItem>,
        progress: ProgressHandle,
    ) -> Vec<TaskOutcome> {
        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut set = JoinSet::new();
        let mut pending = HashMap::with_capacity(items.len());
        let mut outcomes: Vec<Option<TaskOutcome>> = vec![None; items.len()];

        debug!(items = items.len(), workers = self.workers, "Scheduling transfers");

        for (index, item) in items.iter().enumerate() {
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    let outcome =
                        TaskOutcome::failure(item.clone(), format!("scheduler closed: {}", e));
                    progress.report(outcome.clone()).await;
                    outcomes[index] = Some(outcome);
                    continue;
                }
            };

            let task = TransferTask::new(ctx.clone(), item.clone());
            let progress = progress.clone();
            let handle = set.spawn(async move {
                let outcome = task.run(&progress).await;
                drop(permit);
                outcome
            });
            pending.insert(handle.id(), index);
        }

        while let Some(joined) = set.join_next_with_id().await {
            match joined {
                Ok((id, outcome)) => {
                    if let Some(index) = pending.remove(&id) {
                        outcomes[index] = Some(outcome);
                    }
                }
                Err(e) => {
                    let Some(index) = pending.remove(&e.id()) else {
                        continue;
                    };
                    let item = items[index].clone();
                    error!(key = %item.remote_key, error = %e, "Transfer task aborted");
                    let outcome =
                        TaskOutcome::failure(item, format!("transfer task aborted: {}", e));
                    progress.report(outcome.clone()).await;
                    outcomes[index] = Some(outcome);
                }
            }
        }

        outcomes.into_iter().flatten().collect()
    }
}
