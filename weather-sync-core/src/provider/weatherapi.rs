use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

use crate::{
    error::{ProviderError, ProviderFailure},
    model::{Alert, Batch, CurrentSnapshot, ForecastEntry, Rejected, Severity},
    provider::{build_http_client, truncate_body},
};

use super::WeatherProvider;

pub const DEFAULT_BASE_URL: &str = "https://api.weatherapi.com";

const FORECAST_DAYS: &str = "3";

#[derive(Debug, Clone)]
pub struct WeatherApiProvider {
    api_key: String,
    base_url: String,
    http: Client,
}

impl WeatherApiProvider {
    pub fn with_base_url(
        api_key: String,
        base_url: impl Into<String>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Ok(Self { api_key, base_url, http: build_http_client(timeout)? })
    }

    async fn get<T: for<'de> Deserialize<'de>>(
        &self,
        location: &str,
        path: &str,
        q: &str,
        extra: &[(&str, &str)],
    ) -> Result<T, ProviderError> {
        let url = format!("{}{}", self.base_url, path);
        debug!(location, %url, "requesting WeatherAPI");

        let res = self
            .http
            .get(&url)
            .query(&[("key", self.api_key.as_str()), ("q", q)])
            .query(extra)
            .send()
            .await
            .map_err(|e| ProviderError::from_reqwest(location, e))?;

        let status = res.status();
        let body = res.text().await.map_err(|e| ProviderError::from_reqwest(location, e))?;

        if !status.is_success() {
            return Err(ProviderError::new(
                location,
                ProviderFailure::Status { status: status.as_u16(), body: truncate_body(&body) },
            ));
        }

        serde_json::from_str(&body)
            .map_err(|e| ProviderError::new(location, ProviderFailure::Malformed(e.to_string())))
    }
}

fn kph_to_mps(kph: f64) -> f64 {
    kph / 3.6
}

#[derive(Debug, Deserialize)]
struct WaLocation {
    lat: f64,
    lon: f64,
}

#[derive(Debug, Deserialize)]
struct WaCondition {
    text: String,
    #[serde(default)]
    icon: String,
}

#[derive(Debug, Deserialize)]
struct WaCurrent {
    temp_c: f64,
    humidity: u8,
    wind_kph: f64,
    wind_degree: Option<u16>,
    pressure_mb: f64,
    #[serde(default)]
    precip_mm: f64,
    condition: WaCondition,
    last_updated_epoch: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct WaResponse {
    location: WaLocation,
    current: WaCurrent,
}

#[derive(Debug, Deserialize)]
struct WaDay {
    maxtemp_c: f64,
    mintemp_c: f64,
    maxwind_kph: f64,
    avghumidity: f64,
    #[serde(default)]
    daily_chance_of_rain: f64,
    condition: WaCondition,
}

#[derive(Debug, Deserialize)]
struct WaForecastDay {
    date: NaiveDate,
    day: WaDay,
}

#[derive(Debug, Deserialize)]
struct WaForecast {
    forecastday: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct WaForecastResponse {
    location: WaLocation,
    forecast: WaForecast,
}

#[derive(Debug, Deserialize)]
struct WaAlertList {
    #[serde(default)]
    alert: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct WaAlertsResponse {
    alerts: WaAlertList,
}

#[derive(Debug, Deserialize)]
struct WaAlert {
    event: String,
    severity: Option<String>,
    #[serde(default)]
    desc: String,
    effective: DateTime<Utc>,
    expires: DateTime<Utc>,
}

#[async_trait]
impl WeatherProvider for WeatherApiProvider {
    async fn fetch_current(&self, location: &str) -> Result<CurrentSnapshot, ProviderError> {
        let parsed: WaResponse = self.get(location, "/v1/current.json", location, &[]).await?;

        let fetched_at = Utc::now();
        let observed_at = parsed
            .current
            .last_updated_epoch
            .and_then(|ts| DateTime::from_timestamp(ts, 0))
            .unwrap_or(fetched_at)
            .min(fetched_at);

        Ok(CurrentSnapshot {
            location: location.to_string(),
            latitude: parsed.location.lat,
            longitude: parsed.location.lon,
            temperature: parsed.current.temp_c,
            humidity: parsed.current.humidity,
            wind_speed: kph_to_mps(parsed.current.wind_kph),
            wind_direction: parsed.current.wind_degree.map(|d| d % 360),
            precipitation: parsed.current.precip_mm,
            pressure: parsed.current.pressure_mb.round() as i32,
            condition: parsed.current.condition.text,
            icon: parsed.current.condition.icon,
            observed_at,
            fetched_at,
        })
    }

    async fn fetch_forecast(&self, location: &str) -> Result<Batch<ForecastEntry>, ProviderError> {
        let parsed: WaForecastResponse = self
            .get(
                location,
                "/v1/forecast.json",
                location,
                &[("days", FORECAST_DAYS), ("alerts", "no"), ("aqi", "no")],
            )
            .await?;

        let fetched_at = Utc::now();
        let mut batch = Batch::default();

        for (index, raw) in parsed.forecast.forecastday.into_iter().enumerate() {
            let day: WaForecastDay = match serde_json::from_value(raw) {
                Ok(day) => day,
                Err(e) => {
                    warn!(location, kind = "forecast", index, error = %e, "skipping malformed forecast day");
                    batch.rejected.push(Rejected::parse(index, e.to_string()));
                    continue;
                }
            };

            batch.items.push(ForecastEntry {
                location: location.to_string(),
                latitude: parsed.location.lat,
                longitude: parsed.location.lon,
                forecast_date: day.date,
                min_temp: day.day.mintemp_c,
                max_temp: day.day.maxtemp_c,
                humidity: day.day.avghumidity.round().clamp(0.0, 100.0) as u8,
                wind_speed: kph_to_mps(day.day.maxwind_kph),
                precipitation_probability: day.day.daily_chance_of_rain.round().clamp(0.0, 100.0)
                    as u8,
                condition: day.day.condition.text,
                icon: day.day.condition.icon,
                fetched_at,
            });
        }

        Ok(batch)
    }

    async fn fetch_alerts(
        &self,
        location: &str,
        lat: f64,
        lon: f64,
    ) -> Result<Batch<Alert>, ProviderError> {
        let q = format!("{lat},{lon}");
        let parsed: WaAlertsResponse = self.get(location, "/v1/alerts.json", &q, &[]).await?;

        let fetched_at = Utc::now();
        let mut batch = Batch::default();

        for (index, raw) in parsed.alerts.alert.into_iter().enumerate() {
            match serde_json::from_value::<WaAlert>(raw) {
                Ok(alert) => batch.items.push(Alert {
                    location: location.to_string(),
                    alert_type: alert.event,
                    severity: Severity::from_provider(alert.severity.as_deref()),
                    description: alert.desc,
                    start_time: alert.effective,
                    end_time: alert.expires,
                    is_active: alert.expires > fetched_at,
                    fetched_at,
                }),
                Err(e) => {
                    warn!(location, kind = "alert", index, error = %e, "skipping malformed alert");
                    batch.rejected.push(Rejected::parse(index, e.to_string()));
                }
            }
        }

        Ok(batch)
    }
}
