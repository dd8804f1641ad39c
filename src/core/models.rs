use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Which way bytes flow for one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Download,
    Upload,
}

impl Direction {
    /// Label published while the batch is running.
    pub fn running_label(&self) -> &'static str {
        match self {
            Self::Download => "downloading",
            Self::Upload => "uploading",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::Download => "Download",
            Self::Upload => "Upload",
        }
    }

    pub fn past_tense(&self) -> &'static str {
        match self {
            Self::Download => "Downloaded",
            Self::Upload => "Uploaded",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Download => f.write_str("download"),
            Self::Upload => f.write_str("upload"),
        }
    }
}

/// One file to move. `source_key`/`destination_path` follow the direction:
/// a download reads a remote key into a local path, an upload the reverse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferItem {
    pub remote_key: String,
    pub local_path: PathBuf,
    pub direction: Direction,
}

impl TransferItem {
    pub fn download(remote_key: impl Into<String>, local_path: impl Into<PathBuf>) -> Self {
        Self {
            remote_key: remote_key.into(),
            local_path: local_path.into(),
            direction: Direction::Download,
        }
    }

    pub fn upload(local_path: impl Into<PathBuf>, remote_key: impl Into<String>) -> Self {
        Self {
            remote_key: remote_key.into(),
            local_path: local_path.into(),
            direction: Direction::Upload,
        }
    }

    pub fn source_key(&self) -> String {
        match self.direction {
            Direction::Download => self.remote_key.clone(),
            Direction::Upload => self.local_path.display().to_string(),
        }
    }

    pub fn destination_path(&self) -> String {
        match self.direction {
            Direction::Download => self.local_path.display().to_string(),
            Direction::Upload => self.remote_key.clone(),
        }
    }
}

/// The enumerated item set for one invocation.
#[derive(Debug, Clone)]
pub struct TransferBatch {
    pub direction: Direction,
    pub items: Vec<TransferItem>,
}

impl TransferBatch {
    pub fn new(direction: Direction, items: Vec<TransferItem>) -> Self {
        Self { direction, items }
    }

    pub fn total(&self) -> u64 {
        self.items.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusLabel {
    Pending,
    Running,
    Completed,
    Failed,
}

impl StatusLabel {
    /// Wire value for the status sink. `Running` is rendered per direction.
    pub fn as_wire(&self, direction: Direction) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => direction.running_label(),
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Result of a single transfer attempt.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub item: TransferItem,
    pub succeeded: bool,
    pub error: Option<String>,
}

impl TaskOutcome {
    pub fn success(item: TransferItem) -> Self {
        Self {
            item,
            succeeded: true,
            error: None,
        }
    }

    pub fn failure(item: TransferItem, error: impl Into<String>) -> Self {
        Self {
            item,
            succeeded: false,
            error: Some(error.into()),
        }
    }
}

/// Point-in-time projection of the progress state.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSnapshot {
    pub direction: Direction,
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
    pub elapsed: Duration,
    pub eta_seconds: f64,
    pub status: StatusLabel,
    /// Key of the item whose completion produced this snapshot.
    pub last_key: Option<String>,
}

impl ProgressSnapshot {
    pub fn percentage(&self) -> f64 {
        if self.total == 0 {
            100.0
        } else {
            self.completed as f64 / self.total as f64 * 100.0
        }
    }

    /// Flatten into the string-keyed record stored by a status sink.
    ///
    /// `eta` always carries a decimal point (`"16.0"`, `"0.0"`).
    pub fn to_fields(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("total_files".to_string(), self.total.to_string()),
            ("completed_files".to_string(), self.completed.to_string()),
            ("eta".to_string(), format!("{:?}", self.eta_seconds)),
            (
                "status".to_string(),
                self.status.as_wire(self.direction).to_string(),
            ),
        ])
    }
}

/// Summary handed back to the caller once an invocation is done.
#[derive(Debug, Clone)]
pub struct TransferReport {
    pub direction: Direction,
    pub total: u64,
    pub completed: u64,
    pub failed_items: Vec<TaskOutcome>,
    pub overall_success: bool,
    pub elapsed: Duration,
}

impl TransferReport {
    pub fn empty(direction: Direction) -> Self {
        Self {
            direction,
            total: 0,
            completed: 0,
            failed_items: Vec::new(),
            overall_success: true,
            elapsed: Duration::ZERO,
        }
    }
}
