use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The three kinds of data cached per location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataKind {
    Current,
    Forecast,
    Alert,
}

impl DataKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataKind::Current => "current",
            DataKind::Forecast => "forecast",
            DataKind::Alert => "alert",
        }
    }
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a location string is sent to a provider.
#[derive(Debug, Clone, PartialEq)]
pub enum LocationQuery {
    Name(String),
    Coordinates { lat: f64, lon: f64 },
}

impl LocationQuery {
    /// Interpret a location key. A `"lat,lon"` pair of in-range numbers becomes
    /// coordinates; anything else is treated as a place name.
    pub fn from_location(location: &str) -> Self {
        match parse_pair(location) {
            Some((lat, lon)) if coordinates_in_range(lat, lon) => {
                LocationQuery::Coordinates { lat, lon }
            }
            _ => LocationQuery::Name(location.trim().to_string()),
        }
    }
}

/// Normalizes a caller-supplied location key.
///
/// Returns the trimmed key, or a human-readable reason when the input cannot
/// identify a place: empty input, or a numeric pair outside valid lat/lon ranges.
pub fn normalize_location(raw: &str) -> Result<String, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err("location parameter is required".to_string());
    }

    if let Some((lat, lon)) = parse_pair(trimmed) {
        if !coordinates_in_range(lat, lon) {
            return Err(format!(
                "coordinates out of range in '{trimmed}': latitude must be within [-90, 90] \
                 and longitude within [-180, 180]"
            ));
        }
    }

    Ok(trimmed.to_string())
}

fn parse_pair(s: &str) -> Option<(f64, f64)> {
    let (lat, lon) = s.split_once(',')?;
    let lat = lat.trim().parse::<f64>().ok()?;
    let lon = lon.trim().parse::<f64>().ok()?;
    if lat.is_finite() && lon.is_finite() { Some((lat, lon)) } else { None }
}

fn coordinates_in_range(lat: f64, lon: f64) -> bool {
    (-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lon)
}

/// One observation of current conditions. Snapshots are append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentSnapshot {
    pub location: String,
    pub latitude: f64,
    pub longitude: f64,
    pub temperature: f64,
    pub humidity: u8,
    pub wind_speed: f64,
    /// Degrees; `None` when the provider omits it.
    pub wind_direction: Option<u16>,
    pub precipitation: f64,
    pub pressure: i32,
    pub condition: String,
    pub icon: String,
    pub observed_at: DateTime<Utc>,
    pub fetched_at: DateTime<Utc>,
}

/// Daily forecast, unique per `(location, forecast_date)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastEntry {
    pub location: String,
    pub latitude: f64,
    pub longitude: f64,
    pub forecast_date: NaiveDate,
    pub min_temp: f64,
    pub max_temp: f64,
    pub humidity: u8,
    pub wind_speed: f64,
    /// Percent, 0..=100.
    pub precipitation_probability: u8,
    pub condition: String,
    pub icon: String,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Moderate,
    High,
    Extreme,
}

impl Severity {
    /// Maps a provider severity label onto the internal scale.
    ///
    /// Only `"Extreme"` is singled out (as `High`); every other label, and a
    /// missing one, is `Moderate`. `Low` and `Extreme` are never produced here.
    pub fn from_provider(raw: Option<&str>) -> Self {
        match raw {
            Some("Extreme") => Severity::High,
            _ => Severity::Moderate,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Moderate => "moderate",
            Severity::High => "high",
            Severity::Extreme => "extreme",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severe-weather alert, unique per `(location, alert_type, start_time, end_time)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub location: String,
    pub alert_type: String,
    pub severity: Severity,
    pub description: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub is_active: bool,
    pub fetched_at: DateTime<Utc>,
}

impl Alert {
    pub fn same_window(&self, other: &Alert) -> bool {
        self.location == other.location
            && self.alert_type == other.alert_type
            && self.start_time == other.start_time
            && self.end_time == other.end_time
    }

    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.end_time > now
    }
}

/// Where a list item was turned away, which also says what `index` counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RejectStage {
    /// Decoding the provider response. `index` is the position in the raw
    /// provider list.
    Parse,
    /// Validation before merging. `index` is the position among the items
    /// that decoded.
    Validate,
}

impl RejectStage {
    pub fn as_str(self) -> &'static str {
        match self {
            RejectStage::Parse => "parse",
            RejectStage::Validate => "validate",
        }
    }
}

impl fmt::Display for RejectStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A list item the provider returned but that could not be used.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Rejected {
    pub stage: RejectStage,
    pub index: usize,
    pub reason: String,
}

impl Rejected {
    pub fn parse(index: usize, reason: impl Into<String>) -> Self {
        Self { stage: RejectStage::Parse, index, reason: reason.into() }
    }

    pub fn invalid(index: usize, reason: impl Into<String>) -> Self {
        Self { stage: RejectStage::Validate, index, reason: reason.into() }
    }
}

/// Result of a list-returning provider call: the items that parsed, plus the
/// ones that did not.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch<T> {
    pub items: Vec<T>,
    pub rejected: Vec<Rejected>,
}

impl<T> Batch<T> {
    pub fn new(items: Vec<T>) -> Self {
        Self { items, rejected: Vec::new() }
    }
}

impl<T> Default for Batch<T> {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}
