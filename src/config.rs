//! Layered configuration.
//!
//! Precedence, lowest first: built-in defaults, the TOML config file, the
//! conventional `MINIO_*` connection variables, `BUCKETSYNC_*` environment
//! variables (nested keys split on `__`), then whatever the command line
//! explicitly set.

use anyhow::{Context, Result, bail};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const ENV_PREFIX: &str = "BUCKETSYNC_";
pub const DEFAULT_CONFIG_FILE: &str = "bucketsync.toml";
pub const DEFAULT_WORKERS: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    /// Local registry root; the model path is joined onto it.
    pub local_path: PathBuf,
    pub verbose: bool,
    pub json_logs: bool,
    pub store: StoreConfig,
    pub status: StatusConfig,
    pub transfer: TransferConfig,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Any S3-compatible endpoint, typically MinIO.
    S3,
    Fs,
    Simulated,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// Root directory holding one sub-directory per bucket (fs backend).
    pub root: Option<PathBuf>,
    pub bucket: String,
    /// `host:port` or a full URL (s3 backend).
    pub endpoint: Option<String>,
    /// Use https when `endpoint` carries no scheme.
    pub secure: bool,
    pub region: String,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    /// Accept any server certificate, e.g. a self-signed MinIO.
    pub skip_tls_verify: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StatusSinkType {
    None,
    Kubernetes,
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusConfig {
    pub sink: StatusSinkType,
    pub namespace: String,
    pub record_name: String,
    /// Output directory for the file sink.
    pub directory: Option<PathBuf>,
    pub request_timeout_secs: u64,
}

/// What mid-run snapshots report after an item has failed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum FailureStatusPolicy {
    /// Status stays running until the terminal snapshot decides.
    #[default]
    Terminal,
    /// The first failure flips status to failed for the rest of the run.
    Sticky,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransferConfig {
    pub workers: usize,
    pub failure_status: FailureStatusPolicy,
    /// Minimum gap between progress log lines; 0 logs every completion.
    pub progress_log_interval_ms: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            local_path: PathBuf::from("/data/models-registry"),
            verbose: false,
            json_logs: false,
            store: StoreConfig {
                backend: StoreBackend::S3,
                root: None,
                bucket: "models".to_string(),
                endpoint: None,
                secure: false,
                region: "us-east-1".to_string(),
                access_key: None,
                secret_key: None,
                skip_tls_verify: false,
            },
            status: StatusConfig {
                sink: StatusSinkType::None,
                namespace: "default".to_string(),
                record_name: "transfer-progress".to_string(),
                directory: None,
                request_timeout_secs: 10,
            },
            transfer: TransferConfig {
                workers: DEFAULT_WORKERS,
                failure_status: FailureStatusPolicy::Terminal,
                progress_log_interval_ms: 0,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from every layer and validate it.
    ///
    /// `config_file` falls back to `$BUCKETSYNC_CONFIG`, then to
    /// `bucketsync.toml` in the working directory. A missing file is fine.
    pub fn new<T: Serialize>(config_file: Option<&Path>, overrides: Option<&T>) -> Result<Self> {
        let path = config_file
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(format!("{}CONFIG", ENV_PREFIX)).map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(&path))
            .merge(minio_env())
            .merge(Env::prefixed(ENV_PREFIX).split("__").ignore(&["config"]));

        if let Some(overrides) = overrides {
            figment = figment.merge(Serialized::globals(overrides));
        }

        let config: AppConfig = figment
            .extract()
            .with_context(|| format!("Failed to load configuration (file: {})", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.transfer.workers == 0 {
            bail!("transfer.workers must be at least 1");
        }
        if self.store.bucket.trim().is_empty() {
            bail!("store.bucket must not be empty");
        }
        match self.store.backend {
            StoreBackend::Fs if self.store.root.is_none() => {
                bail!("store.root is required when store.backend = \"fs\"");
            }
            StoreBackend::S3 if self.store.endpoint.is_none() => {
                bail!("store.endpoint (or MINIO_ENDPOINT) is required when store.backend = \"s3\"");
            }
            StoreBackend::S3
                if self.store.access_key.is_none() || self.store.secret_key.is_none() =>
            {
                bail!("store.access_key and store.secret_key are required for the s3 backend");
            }
            _ => {}
        }
        if self.status.sink == StatusSinkType::File && self.status.directory.is_none() {
            bail!("status.directory is required when status.sink = \"file\"");
        }
        if self.status.sink != StatusSinkType::None
            && (self.status.namespace.is_empty() || self.status.record_name.is_empty())
        {
            bail!("status.namespace and status.record_name must be set when reporting is enabled");
        }
        Ok(())
    }
}

/// The connection variables MinIO clients conventionally read.
fn minio_env() -> Env {
    Env::raw().filter_map(|key| match key.as_str().to_ascii_lowercase().as_str() {
        "minio_endpoint" => Some("store.endpoint".into()),
        "minio_secure" => Some("store.secure".into()),
        "minio_access_key" => Some("store.access_key".into()),
        "minio_secret_key" => Some("store.secret_key".into()),
        "minio_bucket" => Some("store.bucket".into()),
        _ => None,
    })
}
