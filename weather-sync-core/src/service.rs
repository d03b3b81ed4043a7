//! Demand-driven reads.
//!
//! Current conditions and forecasts are served from the store while fresh and
//! refreshed through the shared [`Refresher`] otherwise. Alerts are read only;
//! fetching them is left to the scheduler.

use chrono::{DateTime, Utc};
use std::{future::Future, sync::Arc, time::Duration};
use tracing::{debug, warn};

use crate::{
    error::{ProviderError, ProviderFailure, RefreshError, ServiceError},
    freshness::FreshnessPolicy,
    model::{Alert, CurrentSnapshot, DataKind, ForecastEntry, normalize_location},
    refresh::Refresher,
    store::RecordStore,
};

pub type ServiceResult<T> = Result<T, ServiceError>;

#[derive(Debug, Clone)]
pub struct QueryService {
    store: Arc<dyn RecordStore>,
    refresher: Arc<Refresher>,
    policy: FreshnessPolicy,
    request_timeout: Duration,
}

impl QueryService {
    pub fn new(
        store: Arc<dyn RecordStore>,
        refresher: Arc<Refresher>,
        policy: FreshnessPolicy,
        request_timeout: Duration,
    ) -> Self {
        Self { store, refresher, policy, request_timeout }
    }

    /// Latest snapshot, refreshed first when stale. If the refresh fails the
    /// stale snapshot is served; without one the provider error is returned.
    pub async fn get_current(&self, location: &str) -> ServiceResult<CurrentSnapshot> {
        let location = validate(location)?;
        let cached = self.store.latest_current(&location).await?;

        if let Some(snapshot) = &cached {
            if !self.policy.is_stale(Some(snapshot.fetched_at), Utc::now(), DataKind::Current) {
                debug!(%location, kind = "current", "serving cached snapshot");
                return Ok(snapshot.clone());
            }
        }

        let refreshed = self
            .bounded(&location, DataKind::Current, self.refresher.refresh_current(&location))
            .await;

        match (refreshed, cached) {
            (Ok(snapshot), _) => Ok(snapshot),
            (Err(err), Some(stale)) => {
                warn!(%location, kind = "current", error = %err, "refresh failed, serving stale snapshot");
                Ok(stale)
            }
            (Err(err), None) => {
                warn!(%location, kind = "current", error = %err, "refresh failed");
                Err(err.into())
            }
        }
    }

    /// Every entry dated today or later, refreshed first when there are none.
    pub async fn get_forecast(&self, location: &str) -> ServiceResult<Vec<ForecastEntry>> {
        let location = validate(location)?;
        let now = Utc::now();
        let today = now.date_naive();
        let cached = self.store.forecasts_from(&location, today).await?;

        let latest = cached
            .last()
            .and_then(|e| e.forecast_date.and_hms_opt(0, 0, 0))
            .map(|dt| dt.and_utc());
        if !self.policy.is_stale(latest, now, DataKind::Forecast) {
            debug!(%location, kind = "forecast", entries = cached.len(), "serving cached forecast");
            return Ok(cached);
        }

        self.bounded(&location, DataKind::Forecast, self.refresher.refresh_forecast(&location))
            .await
            .inspect_err(|err| warn!(%location, kind = "forecast", error = %err, "refresh failed"))?;

        let entries = self.store.forecasts_from(&location, today).await?;
        if entries.is_empty() {
            warn!(%location, kind = "forecast", "provider returned no upcoming forecast days");
            return Err(ServiceError::NotFound { location, kind: DataKind::Forecast });
        }
        Ok(entries)
    }

    /// Active alerts from the store. Never triggers a fetch.
    pub async fn get_active_alerts(&self, location: &str) -> ServiceResult<Vec<Alert>> {
        let location = validate(location)?;
        Ok(self.store.active_alerts(&location, Utc::now()).await?)
    }

    /// Stored snapshots observed since `since`, newest first.
    pub async fn history(
        &self,
        location: &str,
        since: DateTime<Utc>,
    ) -> ServiceResult<Vec<CurrentSnapshot>> {
        let location = validate(location)?;
        Ok(self.store.current_since(&location, since).await?)
    }

    pub async fn all_alerts(&self) -> ServiceResult<Vec<Alert>> {
        Ok(self.store.all_alerts().await?)
    }

    pub async fn known_locations(&self) -> ServiceResult<Vec<String>> {
        Ok(self.store.known_locations().await?)
    }

    /// Wait for a shared refresh, at most `request_timeout`. Giving up here
    /// only ends this caller's wait; the refresh itself keeps running.
    async fn bounded<T>(
        &self,
        location: &str,
        kind: DataKind,
        refresh: impl Future<Output = Result<T, RefreshError>>,
    ) -> Result<T, RefreshError> {
        match tokio::time::timeout(self.request_timeout, refresh).await {
            Ok(result) => result,
            Err(_) => {
                warn!(location, %kind, timeout = ?self.request_timeout, "gave up waiting for refresh");
                Err(RefreshError::Provider(ProviderError::new(location, ProviderFailure::Timeout)))
            }
        }
    }
}

fn validate(location: &str) -> ServiceResult<String> {
    normalize_location(location).map_err(ServiceError::BadRequest)
}
