use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::{collections::BTreeMap, time::Duration};
use tracing::{debug, warn};

use crate::{
    error::{ProviderError, ProviderFailure},
    model::{Alert, Batch, CurrentSnapshot, ForecastEntry, LocationQuery, Rejected, Severity},
    provider::{build_http_client, probability_to_percent, truncate_body},
};

use super::WeatherProvider;

pub const DEFAULT_BASE_URL: &str = "https://api.openweathermap.org";

#[derive(Debug, Clone)]
pub struct OpenWeatherProvider {
    api_key: String,
    base_url: String,
    http: Client,
}

impl OpenWeatherProvider {
    pub fn with_base_url(
        api_key: String,
        base_url: impl Into<String>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Ok(Self { api_key, base_url, http: build_http_client(timeout)? })
    }

    fn location_params(&self, location: &str) -> Vec<(&'static str, String)> {
        let mut params = match LocationQuery::from_location(location) {
            LocationQuery::Name(name) => vec![("q", name)],
            LocationQuery::Coordinates { lat, lon } => {
                vec![("lat", lat.to_string()), ("lon", lon.to_string())]
            }
        };
        params.push(("appid", self.api_key.clone()));
        params.push(("units", "metric".to_string()));
        params
    }

    async fn get_body(
        &self,
        location: &str,
        path: &str,
        params: &[(&'static str, String)],
    ) -> Result<String, ProviderError> {
        let url = format!("{}{}", self.base_url, path);
        debug!(location, %url, "requesting OpenWeather");

        let res = self
            .http
            .get(&url)
            .query(params)
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

        Ok(body)
    }
}

fn parse<T: for<'de> Deserialize<'de>>(location: &str, body: &str) -> Result<T, ProviderError> {
    serde_json::from_str(body)
        .map_err(|e| ProviderError::new(location, ProviderFailure::Malformed(e.to_string())))
}

#[derive(Debug, Deserialize)]
struct OwCoord {
    lat: f64,
    lon: f64,
}

#[derive(Debug, Deserialize)]
struct OwWeather {
    main: String,
    #[serde(default)]
    icon: String,
}

#[derive(Debug, Deserialize)]
struct OwMain {
    temp: f64,
    humidity: u8,
    pressure: i32,
}

#[derive(Debug, Deserialize)]
struct OwWind {
    speed: f64,
    deg: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct OwRain {
    #[serde(rename = "1h")]
    one_hour: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct OwCurrentResponse {
    coord: OwCoord,
    dt: i64,
    main: OwMain,
    weather: Vec<OwWeather>,
    wind: OwWind,
    rain: Option<OwRain>,
}

#[derive(Debug, Deserialize)]
struct OwCity {
    coord: OwCoord,
}

#[derive(Debug, Deserialize)]
struct OwForecastResponse {
    city: OwCity,
    list: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct OwSlotMain {
    temp_min: f64,
    temp_max: f64,
    humidity: u8,
}

#[derive(Debug, Deserialize)]
struct OwForecastSlot {
    dt: i64,
    main: OwSlotMain,
    weather: Vec<OwWeather>,
    wind: OwWind,
    pop: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct OwOneCallResponse {
    #[serde(default)]
    alerts: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct OwAlert {
    event: String,
    start: i64,
    end: i64,
    #[serde(default)]
    description: String,
    severity: Option<String>,
}

fn condition_and_icon(weather: &[OwWeather]) -> (String, String) {
    weather
        .first()
        .map(|w| (w.main.clone(), w.icon.clone()))
        .unwrap_or_else(|| ("Unknown".to_string(), String::new()))
}

fn wind_direction(deg: Option<f64>) -> Option<u16> {
    deg.filter(|d| d.is_finite()).map(|d| (d.rem_euclid(360.0).round() as u16) % 360)
}

/// Fold 3-hourly slots into one entry per UTC date.
fn roll_up_slot(days: &mut BTreeMap<NaiveDate, ForecastEntry>, entry: ForecastEntry) {
    match days.get_mut(&entry.forecast_date) {
        Some(day) => {
            day.min_temp = day.min_temp.min(entry.min_temp);
            day.max_temp = day.max_temp.max(entry.max_temp);
            day.precipitation_probability =
                day.precipitation_probability.max(entry.precipitation_probability);
        }
        None => {
            days.insert(entry.forecast_date, entry);
        }
    }
}

#[async_trait]
impl WeatherProvider for OpenWeatherProvider {
    async fn fetch_current(&self, location: &str) -> Result<CurrentSnapshot, ProviderError> {
        let params = self.location_params(location);
        let body = self.get_body(location, "/data/2.5/weather", &params).await?;
        let parsed: OwCurrentResponse = parse(location, &body)?;

        let fetched_at = Utc::now();
        let observed_at = DateTime::from_timestamp(parsed.dt, 0)
            .unwrap_or(fetched_at)
            .min(fetched_at);
        let (condition, icon) = condition_and_icon(&parsed.weather);

        Ok(CurrentSnapshot {
            location: location.to_string(),
            latitude: parsed.coord.lat,
            longitude: parsed.coord.lon,
            temperature: parsed.main.temp,
            humidity: parsed.main.humidity,
            wind_speed: parsed.wind.speed,
            wind_direction: wind_direction(parsed.wind.deg),
            precipitation: parsed.rain.and_then(|r| r.one_hour).unwrap_or(0.0),
            pressure: parsed.main.pressure,
            condition,
            icon,
            observed_at,
            fetched_at,
        })
    }

    async fn fetch_forecast(&self, location: &str) -> Result<Batch<ForecastEntry>, ProviderError> {
        let params = self.location_params(location);
        let body = self.get_body(location, "/data/2.5/forecast", &params).await?;
        let parsed: OwForecastResponse = parse(location, &body)?;

        let fetched_at = Utc::now();
        let mut days = BTreeMap::new();
        let mut rejected = Vec::new();

        for (index, raw) in parsed.list.into_iter().enumerate() {
            let slot: OwForecastSlot = match serde_json::from_value(raw) {
                Ok(slot) => slot,
                Err(e) => {
                    warn!(location, kind = "forecast", index, error = %e, "skipping malformed forecast slot");
                    rejected.push(Rejected::parse(index, e.to_string()));
                    continue;
                }
            };

            let Some(at) = DateTime::from_timestamp(slot.dt, 0) else {
                rejected.push(Rejected::parse(index, format!("invalid timestamp {}", slot.dt)));
                continue;
            };

            let (condition, icon) = condition_and_icon(&slot.weather);
            roll_up_slot(
                &mut days,
                ForecastEntry {
                    location: location.to_string(),
                    latitude: parsed.city.coord.lat,
                    longitude: parsed.city.coord.lon,
                    forecast_date: at.date_naive(),
                    min_temp: slot.main.temp_min,
                    max_temp: slot.main.temp_max,
                    humidity: slot.main.humidity,
                    wind_speed: slot.wind.speed,
                    precipitation_probability: probability_to_percent(slot.pop.unwrap_or(0.0)),
                    condition,
                    icon,
                    fetched_at,
                },
            );
        }

        Ok(Batch { items: days.into_values().collect(), rejected })
    }

    async fn fetch_alerts(
        &self,
        location: &str,
        lat: f64,
        lon: f64,
    ) -> Result<Batch<Alert>, ProviderError> {
        let params = [
            ("lat", lat.to_string()),
            ("lon", lon.to_string()),
            ("appid", self.api_key.clone()),
            ("exclude", "current,minutely,hourly,daily".to_string()),
        ];
        let body = self.get_body(location, "/data/3.0/onecall", &params).await?;
        let parsed: OwOneCallResponse = parse(location, &body)?;

        let fetched_at = Utc::now();
        let mut batch = Batch::default();

        for (index, raw) in parsed.alerts.into_iter().enumerate() {
            let alert: OwAlert = match serde_json::from_value(raw) {
                Ok(alert) => alert,
                Err(e) => {
                    warn!(location, kind = "alert", index, error = %e, "skipping malformed alert");
                    batch.rejected.push(Rejected::parse(index, e.to_string()));
                    continue;
                }
            };

            let (Some(start_time), Some(end_time)) =
                (DateTime::from_timestamp(alert.start, 0), DateTime::from_timestamp(alert.end, 0))
            else {
                batch.rejected.push(Rejected::parse(
                    index,
                    format!("invalid alert window {}..{}", alert.start, alert.end),
                ));
                continue;
            };

            batch.items.push(Alert {
                location: location.to_string(),
                alert_type: alert.event,
                severity: Severity::from_provider(alert.severity.as_deref()),
                description: alert.description,
                start_time,
                end_time,
                is_active: end_time > fetched_at,
                fetched_at,
            });
        }

        Ok(batch)
    }
}
