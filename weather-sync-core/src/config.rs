use anyhow::{Context, Result, anyhow};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{freshness::FreshnessPolicy, provider::ProviderId, scheduler::SchedulePeriods};

/// Credentials and endpoint for a single provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub api_key: String,

    /// Overrides the provider's public endpoint, e.g. for a proxy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

// Largest age in seconds a chrono duration can hold.
const MAX_AGE_LIMIT_SECS: u64 = (i64::MAX / 1000) as u64;

/// Timing of scheduled jobs and provider calls, all in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshSettings {
    pub current_interval_secs: u64,
    pub forecast_interval_secs: u64,
    pub alert_interval_secs: u64,
    pub current_max_age_secs: u64,
    pub fetch_timeout_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for RefreshSettings {
    fn default() -> Self {
        Self {
            current_interval_secs: 30 * 60,
            forecast_interval_secs: 3 * 60 * 60,
            alert_interval_secs: 15 * 60,
            current_max_age_secs: 30 * 60,
            fetch_timeout_secs: 30,
            request_timeout_secs: 10,
        }
    }
}

impl RefreshSettings {
    pub fn schedule_periods(&self) -> SchedulePeriods {
        SchedulePeriods {
            current: Duration::from_secs(self.current_interval_secs),
            forecast: Duration::from_secs(self.forecast_interval_secs),
            alerts: Duration::from_secs(self.alert_interval_secs),
        }
    }

    /// Ages beyond what chrono can represent saturate to its maximum.
    pub fn freshness_policy(&self) -> FreshnessPolicy {
        let max_age = i64::try_from(self.current_max_age_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .unwrap_or(chrono::Duration::MAX);
        FreshnessPolicy::new(max_age)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    fn validate(&self) -> Result<()> {
        let fields = [
            ("current_interval_secs", self.current_interval_secs),
            ("forecast_interval_secs", self.forecast_interval_secs),
            ("alert_interval_secs", self.alert_interval_secs),
            ("fetch_timeout_secs", self.fetch_timeout_secs),
            ("request_timeout_secs", self.request_timeout_secs),
        ];
        if let Some((name, _)) = fields.iter().find(|(_, v)| *v == 0) {
            return Err(anyhow!("[refresh] {name} must be greater than zero"));
        }
        if self.current_max_age_secs > MAX_AGE_LIMIT_SECS {
            return Err(anyhow!(
                "[refresh] current_max_age_secs must be at most {MAX_AGE_LIMIT_SECS}"
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    /// Where records are persisted. Defaults to `records.json` in the
    /// platform data directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

/// Top-level configuration stored on disk.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Optional default provider id, e.g. "openweather" or "weatherapi".
    pub default_provider: Option<String>,

    /// Example TOML:
    /// [providers.openweather]
    /// api_key = "..."
    pub providers: HashMap<String, ProviderConfig>,

    pub refresh: RefreshSettings,

    pub store: StoreSettings,
}

impl Config {
    /// Return the default provider as a strongly-typed ProviderId.
    pub fn default_provider_id(&self) -> Result<ProviderId> {
        let s = self.default_provider.as_ref().ok_or_else(|| {
            anyhow!(
                "No default provider configured.\n\
                 Hint: run `weather-sync configure <provider>` (e.g. `weather-sync configure openweather`) first."
            )
        })?;

        ProviderId::try_from(s.as_str())
    }

    pub fn provider_config(&self, id: ProviderId) -> Option<&ProviderConfig> {
        self.providers.get(id.as_str())
    }

    pub fn set_default_provider(&mut self, id: ProviderId) {
        self.default_provider = Some(id.as_str().to_string());
    }

    /// Load config from the platform config directory, or an empty default on
    /// first run.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_file_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let cfg: Config = toml::from_str(contents)?;
        cfg.refresh.validate()?;
        Ok(cfg)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_file_path()?)
    }

    /// Save config, creating parent directories as needed.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let toml =
            toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")?;

        fs::write(path, toml)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    pub fn config_file_path() -> Result<PathBuf> {
        Ok(project_dirs()?.config_dir().join("config.toml"))
    }

    /// Configured store path, or the default under the platform data directory.
    pub fn store_path(&self) -> Result<PathBuf> {
        match &self.store.path {
            Some(path) => Ok(path.clone()),
            None => Ok(project_dirs()?.data_dir().join("records.json")),
        }
    }

    /// Set/replace a provider API key, keeping any configured base URL. The
    /// first configured provider becomes the default.
    pub fn upsert_provider_api_key(&mut self, provider_id: ProviderId, api_key: String) {
        self.providers
            .entry(provider_id.as_str().to_string())
            .and_modify(|cfg| cfg.api_key = api_key.clone())
            .or_insert(ProviderConfig { api_key, base_url: None });

        if self.default_provider.is_none() {
            self.default_provider = Some(provider_id.to_string());
        }
    }

    pub fn provider_api_key(&self, provider_id: ProviderId) -> Option<&str> {
        self.providers.get(provider_id.as_str()).map(|cfg| cfg.api_key.as_str())
    }

    pub fn is_provider_configured(&self, provider_id: ProviderId) -> bool {
        self.provider_api_key(provider_id).is_some()
    }
}

fn project_dirs() -> Result<ProjectDirs> {
    ProjectDirs::from("dev", "weather-sync", "weather-sync")
        .ok_or_else(|| anyhow!("Could not determine platform config directory"))
}
