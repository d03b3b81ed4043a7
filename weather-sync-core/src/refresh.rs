//! Fetch-and-merge units shared by the query service and the scheduler.
//!
//! Each refresh runs under the [`DedupCoordinator`] key `(location, kind)`, so
//! an on-demand refresh and a scheduled one for the same key collapse into a
//! single provider call and a single write.
//!
//! Failures are returned, not logged. Callers decide how to report them.

use chrono::Utc;
use std::{sync::Arc, time::Duration};

use crate::{
    dedup::{DedupCoordinator, FetchKey, RefreshResult},
    merge::{MergeEngine, MergeReport},
    model::{CurrentSnapshot, DataKind},
    provider::WeatherProvider,
};

#[derive(Debug)]
pub struct Refresher {
    provider: Arc<dyn WeatherProvider>,
    merge: MergeEngine,
    current: DedupCoordinator<CurrentSnapshot>,
    forecast: DedupCoordinator<MergeReport>,
    alerts: DedupCoordinator<MergeReport>,
}

impl Refresher {
    pub fn new(
        provider: Arc<dyn WeatherProvider>,
        merge: MergeEngine,
        fetch_timeout: Duration,
    ) -> Self {
        Self {
            provider,
            merge,
            current: DedupCoordinator::new(fetch_timeout),
            forecast: DedupCoordinator::new(fetch_timeout),
            alerts: DedupCoordinator::new(fetch_timeout),
        }
    }

    pub fn merge_engine(&self) -> &MergeEngine {
        &self.merge
    }

    /// Fetch current conditions and append them. Returns the stored snapshot.
    pub async fn refresh_current(&self, location: &str) -> RefreshResult<CurrentSnapshot> {
        let key = FetchKey::new(location, DataKind::Current);
        let (provider, merge, owned) = self.parts(location);

        self.current
            .run_exclusive(key, move || fetch_current(provider, merge, owned))
            .await
    }

    pub async fn refresh_forecast(&self, location: &str) -> RefreshResult<MergeReport> {
        let key = FetchKey::new(location, DataKind::Forecast);
        let (provider, merge, owned) = self.parts(location);

        self.forecast
            .run_exclusive(key, move || fetch_forecast(provider, merge, owned))
            .await
    }

    pub async fn refresh_alerts(
        &self,
        location: &str,
        lat: f64,
        lon: f64,
    ) -> RefreshResult<MergeReport> {
        let key = FetchKey::new(location, DataKind::Alert);
        let (provider, merge, owned) = self.parts(location);

        self.alerts
            .run_exclusive(key, move || fetch_alerts(provider, merge, owned, lat, lon))
            .await
    }

    fn parts(&self, location: &str) -> (Arc<dyn WeatherProvider>, MergeEngine, String) {
        (Arc::clone(&self.provider), self.merge.clone(), location.to_string())
    }
}

async fn fetch_current(
    provider: Arc<dyn WeatherProvider>,
    merge: MergeEngine,
    location: String,
) -> RefreshResult<CurrentSnapshot> {
    let snapshot = provider.fetch_current(&location).await?;
    merge.insert_current(snapshot).await
}

async fn fetch_forecast(
    provider: Arc<dyn WeatherProvider>,
    merge: MergeEngine,
    location: String,
) -> RefreshResult<MergeReport> {
    let batch = provider.fetch_forecast(&location).await?;
    Ok(merge.upsert_forecasts(&location, batch).await?)
}

async fn fetch_alerts(
    provider: Arc<dyn WeatherProvider>,
    merge: MergeEngine,
    location: String,
    lat: f64,
    lon: f64,
) -> RefreshResult<MergeReport> {
    let batch = provider.fetch_alerts(&location, lat, lon).await?;
    Ok(merge.upsert_alerts(&location, batch, Utc::now()).await?)
}
