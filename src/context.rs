use crate::config::AppConfig;
use crate::status::StatusPublisher;
use crate::store::{self, ObjectStore};
use anyhow::{Context, Result};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub store: Arc<dyn ObjectStore>,
    pub publisher: StatusPublisher,
}

impl AppContext {
    pub fn new(config: AppConfig) -> Result<Self> {
        let store = store::create_store(&config.store)?;
        let publisher = StatusPublisher::from_config(&config.status)
            .context("Failed to set up status reporting")?;

        Ok(Self {
            config: Arc::new(config),
            store,
            publisher,
        })
    }
}
