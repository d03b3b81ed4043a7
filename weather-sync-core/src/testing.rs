//! Test fixtures and a scripted provider.

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use crate::{
    error::{ProviderError, ProviderFailure},
    model::{Alert, Batch, CurrentSnapshot, ForecastEntry, Severity},
    provider::WeatherProvider,
};

pub fn snapshot(location: &str, fetched_at: DateTime<Utc>) -> CurrentSnapshot {
    CurrentSnapshot {
        location: location.to_string(),
        latitude: -1.2833,
        longitude: 36.8167,
        temperature: 21.0,
        humidity: 60,
        wind_speed: 3.5,
        wind_direction: Some(90),
        precipitation: 0.0,
        pressure: 1015,
        condition: "Clear".to_string(),
        icon: "01d".to_string(),
        observed_at: fetched_at,
        fetched_at,
    }
}

pub fn forecast(location: &str, date: NaiveDate) -> ForecastEntry {
    ForecastEntry {
        location: location.to_string(),
        latitude: -1.2833,
        longitude: 36.8167,
        forecast_date: date,
        min_temp: 12.0,
        max_temp: 24.0,
        humidity: 55,
        wind_speed: 4.0,
        precipitation_probability: 20,
        condition: "Clouds".to_string(),
        icon: "03d".to_string(),
        fetched_at: Utc::now(),
    }
}

pub fn alert(
    location: &str,
    alert_type: &str,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
) -> Alert {
    Alert {
        location: location.to_string(),
        alert_type: alert_type.to_string(),
        severity: Severity::Moderate,
        description: format!("{alert_type} expected"),
        start_time,
        end_time,
        is_active: true,
        fetched_at: Utc::now(),
    }
}

/// Provider double that counts calls, can be slowed down, and can be told
/// to fail for particular locations.
#[derive(Debug, Default)]
pub struct MockProvider {
    pub current_calls: AtomicUsize,
    pub forecast_calls: AtomicUsize,
    pub alert_calls: AtomicUsize,
    latency: Option<std::time::Duration>,
    failing: Mutex<Vec<String>>,
    forecast_days: Mutex<HashMap<String, Vec<NaiveDate>>>,
    alerts: Mutex<HashMap<String, Vec<Alert>>>,
}

impl MockProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_latency(latency: std::time::Duration) -> Arc<Self> {
        Arc::new(Self { latency: Some(latency), ..Self::default() })
    }

    pub fn fail_for(&self, location: &str) {
        self.failing.lock().unwrap().push(location.to_string());
    }

    pub fn set_forecast_days(&self, location: &str, days: Vec<NaiveDate>) {
        self.forecast_days.lock().unwrap().insert(location.to_string(), days);
    }

    pub fn set_alerts(&self, location: &str, alerts: Vec<Alert>) {
        self.alerts.lock().unwrap().insert(location.to_string(), alerts);
    }

    pub fn current_calls(&self) -> usize {
        self.current_calls.load(Ordering::SeqCst)
    }

    pub fn forecast_calls(&self) -> usize {
        self.forecast_calls.load(Ordering::SeqCst)
    }

    pub fn alert_calls(&self) -> usize {
        self.alert_calls.load(Ordering::SeqCst)
    }

    async fn call(&self, counter: &AtomicUsize, location: &str) -> Result<(), ProviderError> {
        counter.fetch_add(1, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if self.failing.lock().unwrap().iter().any(|l| l == location) {
            return Err(ProviderError::new(
                location,
                ProviderFailure::Status { status: 500, body: "upstream down".into() },
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl WeatherProvider for MockProvider {
    async fn fetch_current(&self, location: &str) -> Result<CurrentSnapshot, ProviderError> {
        self.call(&self.current_calls, location).await?;
        Ok(snapshot(location, Utc::now()))
    }

    async fn fetch_forecast(&self, location: &str) -> Result<Batch<ForecastEntry>, ProviderError> {
        self.call(&self.forecast_calls, location).await?;
        let days = self.forecast_days.lock().unwrap().get(location).cloned().unwrap_or_else(|| {
            let today = Utc::now().date_naive();
            (0..5).map(|d| today + Duration::days(d)).collect()
        });
        Ok(Batch::new(days.into_iter().map(|d| forecast(location, d)).collect()))
    }

    async fn fetch_alerts(
        &self,
        location: &str,
        _lat: f64,
        _lon: f64,
    ) -> Result<Batch<Alert>, ProviderError> {
        self.call(&self.alert_calls, location).await?;
        let alerts = self.alerts.lock().unwrap().get(location).cloned().unwrap_or_default();
        Ok(Batch::new(alerts))
    }
}
