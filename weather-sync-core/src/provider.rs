use crate::{
    Config,
    error::ProviderError,
    model::{Alert, Batch, CurrentSnapshot, ForecastEntry},
    provider::{openweather::OpenWeatherProvider, weatherapi::WeatherApiProvider},
};
use async_trait::async_trait;
use std::{convert::TryFrom, fmt::Debug, time::Duration};

pub mod openweather;
pub mod weatherapi;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderId {
    OpenWeather,
    WeatherApi,
}

impl ProviderId {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderId::OpenWeather => "openweather",
            ProviderId::WeatherApi => "weatherapi",
        }
    }

    pub const fn all() -> &'static [ProviderId] {
        &[ProviderId::OpenWeather, ProviderId::WeatherApi]
    }
}

impl std::fmt::Display for ProviderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for ProviderId {
    type Error = anyhow::Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let lower = value.to_lowercase();

        match lower.as_str() {
            "openweather" => Ok(ProviderId::OpenWeather),
            "weatherapi" => Ok(ProviderId::WeatherApi),
            _ => Err(anyhow::anyhow!(
                "Unknown provider '{value}'. Supported providers: openweather, weatherapi."
            )),
        }
    }
}

/// The external weather API, normalized into internal records.
///
/// Implementations are the only place provider JSON is parsed. Every failure
/// comes back as a [`ProviderError`] naming the location.
#[async_trait]
pub trait WeatherProvider: Send + Sync + Debug {
    async fn fetch_current(&self, location: &str) -> Result<CurrentSnapshot, ProviderError>;

    async fn fetch_forecast(&self, location: &str) -> Result<Batch<ForecastEntry>, ProviderError>;

    async fn fetch_alerts(
        &self,
        location: &str,
        lat: f64,
        lon: f64,
    ) -> Result<Batch<Alert>, ProviderError>;
}

/// Construct a provider from config and explicit ProviderId.
pub fn provider_from_config(
    id: ProviderId,
    config: &Config,
) -> anyhow::Result<Box<dyn WeatherProvider>> {
    let provider_cfg = config.provider_config(id).ok_or_else(|| {
        anyhow::anyhow!(
            "No API key configured for provider '{id}'.\n\
                 Hint: run `weather-sync configure {id}` and enter your API key."
        )
    })?;

    let timeout = Duration::from_secs(config.refresh.fetch_timeout_secs);
    let api_key = provider_cfg.api_key.clone();
    let base_url = provider_cfg.base_url.clone();

    let boxed: Box<dyn WeatherProvider> = match id {
        ProviderId::OpenWeather => {
            let base = base_url.unwrap_or_else(|| openweather::DEFAULT_BASE_URL.to_string());
            Box::new(OpenWeatherProvider::with_base_url(api_key, base, timeout)?)
        }
        ProviderId::WeatherApi => {
            let base = base_url.unwrap_or_else(|| weatherapi::DEFAULT_BASE_URL.to_string());
            Box::new(WeatherApiProvider::with_base_url(api_key, base, timeout)?)
        }
    };

    Ok(boxed)
}

/// Construct the default provider from config, using `default_provider` field.
pub fn default_provider_from_config(config: &Config) -> anyhow::Result<Box<dyn WeatherProvider>> {
    let id = config.default_provider_id()?;
    provider_from_config(id, config)
}

pub(crate) fn build_http_client(timeout: Duration) -> anyhow::Result<reqwest::Client> {
    use anyhow::Context;

    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .context("Failed to build HTTP client")
}

pub(crate) fn truncate_body(body: &str) -> String {
    const MAX: usize = 200;
    if body.len() > MAX {
        let mut end = MAX;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &body[..end])
    } else {
        body.to_string()
    }
}

/// Precipitation probability as reported (0.0..=1.0) to whole percent.
pub(crate) fn probability_to_percent(pop: f64) -> u8 {
    (pop * 100.0).round().clamp(0.0, 100.0) as u8
}
