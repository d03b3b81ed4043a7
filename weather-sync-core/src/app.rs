//! Wires the store, provider, refresher, query service and scheduler together.

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

use crate::{
    config::Config,
    merge::MergeEngine,
    provider::{WeatherProvider, default_provider_from_config},
    refresh::Refresher,
    scheduler::RefreshScheduler,
    service::QueryService,
    store::{MemoryStore, RecordStore},
};

/// One refresher shared by demand-driven reads and the scheduler, so both
/// paths go through the same in-flight registry.
#[derive(Debug, Clone)]
pub struct WeatherSync {
    pub store: Arc<dyn RecordStore>,
    pub refresher: Arc<Refresher>,
    pub service: QueryService,
    pub scheduler: Arc<RefreshScheduler>,
}

impl WeatherSync {
    /// Build from config: default provider, file-backed store.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let provider: Arc<dyn WeatherProvider> = Arc::from(default_provider_from_config(config)?);
        let path = config.store_path()?;
        let store = MemoryStore::open(&path)
            .await
            .with_context(|| format!("Failed to open record store: {}", path.display()))?;
        info!(path = %path.display(), provider = ?config.default_provider, "weather sync ready");

        Ok(Self::new(config, provider, Arc::new(store)))
    }

    pub fn new(
        config: &Config,
        provider: Arc<dyn WeatherProvider>,
        store: Arc<dyn RecordStore>,
    ) -> Self {
        let settings = &config.refresh;
        let merge = MergeEngine::new(Arc::clone(&store));
        let refresher = Arc::new(Refresher::new(provider, merge, settings.fetch_timeout()));
        let service = QueryService::new(
            Arc::clone(&store),
            Arc::clone(&refresher),
            settings.freshness_policy(),
            settings.request_timeout(),
        );
        let scheduler = Arc::new(RefreshScheduler::new(
            Arc::clone(&refresher),
            Arc::clone(&store),
            settings.schedule_periods(),
        ));

        Self { store, refresher, service, scheduler }
    }
}
