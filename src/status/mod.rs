//! Progress reporting to an external status record.
//!
//! A [`StatusSink`] persists a flat string map under a namespaced record
//! name. [`StatusPublisher`] is the only thing the transfer engine talks to:
//! it flattens snapshots and forwards them, or does nothing when reporting
//! is disabled.

mod file;
mod kubernetes;

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::config::{StatusConfig, StatusSinkType};
use crate::core::models::ProgressSnapshot;

pub use file::FileStatusSink;
pub use kubernetes::KubernetesStatusSink;

#[derive(Debug, Error)]
pub enum StatusError {
    #[error("status sink request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("status sink rejected {operation} of {namespace}/{name}: HTTP {status}: {body}")]
    Rejected {
        operation: &'static str,
        namespace: String,
        name: String,
        status: u16,
        body: String,
    },

    #[error("status sink I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("status record is malformed: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("status sink is not configured: {0}")]
    Config(String),
}

pub type StatusResult<T> = std::result::Result<T, StatusError>;

/// Trait for status record backends (Kubernetes ConfigMap, local file, ...)
#[async_trait]
pub trait StatusSink: Send + Sync {
    /// Create `namespace/name` if absent, otherwise merge `fields` into it.
    /// Repeating the same call must leave the record unchanged.
    async fn upsert(
        &self,
        namespace: &str,
        name: &str,
        fields: &BTreeMap<String, String>,
    ) -> StatusResult<()>;
}

/// Factory function to create a sink based on config. `None` disables reporting.
pub fn create_sink(config: &StatusConfig) -> StatusResult<Option<Arc<dyn StatusSink>>> {
    match config.sink {
        StatusSinkType::None => Ok(None),
        StatusSinkType::Kubernetes => {
            let timeout = Duration::from_secs(config.request_timeout_secs);
            Ok(Some(Arc::new(KubernetesStatusSink::in_cluster(timeout)?)))
        }
        StatusSinkType::File => {
            let directory = config
                .directory
                .clone()
                .ok_or_else(|| StatusError::Config("status.directory is not set".to_string()))?;
            Ok(Some(Arc::new(FileStatusSink::new(directory))))
        }
    }
}

/// Forwards progress snapshots to the configured record.
#[derive(Clone)]
pub struct StatusPublisher {
    sink: Option<Arc<dyn StatusSink>>,
    namespace: String,
    record_name: String,
}

impl StatusPublisher {
    pub fn new(
        sink: Option<Arc<dyn StatusSink>>,
        namespace: impl Into<String>,
        record_name: impl Into<String>,
    ) -> Self {
        Self {
            sink,
            namespace: namespace.into(),
            record_name: record_name.into(),
        }
    }

    /// A publisher that drops every snapshot.
    pub fn disabled() -> Self {
        Self::new(None, String::new(), String::new())
    }

    pub fn from_config(config: &StatusConfig) -> StatusResult<Self> {
        Ok(Self::new(
            create_sink(config)?,
            config.namespace.clone(),
            config.record_name.clone(),
        ))
    }

    pub fn is_enabled(&self) -> bool {
        self.sink.is_some()
    }

    pub async fn publish(&self, snapshot: &ProgressSnapshot) -> StatusResult<()> {
        let Some(sink) = &self.sink else {
            return Ok(());
        };

        let fields = snapshot.to_fields();
        debug!(
            namespace = %self.namespace,
            record = %self.record_name,
            completed = snapshot.completed,
            total = snapshot.total,
            status = %fields["status"],
            key = snapshot.last_key.as_deref().unwrap_or("-"),
            "Publishing status"
        );
        sink.upsert(&self.namespace, &self.record_name, &fields).await
    }
}
