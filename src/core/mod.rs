pub mod enumerator;
pub mod models;
pub mod orchestrator;
pub mod progress;
pub mod transfer_task;
pub mod worker_pool;

pub use models::{
    Direction, ProgressSnapshot, StatusLabel, TaskOutcome, TransferBatch, TransferItem,
    TransferReport,
};
pub use orchestrator::{Orchestrator, TransferRequest};
pub use progress::{ProgressAggregator, ProgressHandle, ProgressState, estimate_eta};
pub use transfer_task::{TransferContext, TransferTask};
pub use worker_pool::WorkerPool;
