use anyhow::{Context, Result, bail};
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use inquire::Password;
use tracing::info;
use weather_sync_core::{Config, Job, JobRun, ProviderId, WeatherSync};

use crate::output;

/// Top-level CLI struct.
#[derive(Debug, Parser)]
#[command(name = "weather-sync", version, about = "Weather data sync service")]
pub struct Cli {
    /// Log debug output to stderr.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Configure credentials for a specific provider.
    Configure {
        /// Provider short name, e.g. "openweather" or "weatherapi".
        provider: String,

        /// Use a different endpoint than the provider's public one.
        #[arg(long)]
        base_url: Option<String>,

        /// Make this the default provider.
        #[arg(long)]
        default: bool,
    },

    /// Current conditions, refreshed if the stored snapshot is stale.
    Current {
        /// City name or "lat,lon".
        location: String,
    },

    /// Daily forecast from today on.
    Forecast { location: String },

    /// Active alerts for a location, as last fetched by the scheduler.
    Alerts {
        #[arg(required_unless_present = "all")]
        location: Option<String>,

        /// List every stored alert, active or not.
        #[arg(long, conflicts_with = "location")]
        all: bool,
    },

    /// Stored snapshots for a location.
    History {
        location: String,

        #[arg(long, default_value_t = 24)]
        hours: i64,
    },

    /// Every location with stored data.
    Locations,

    /// Run one scheduled job now, over all known locations.
    Refresh {
        #[arg(value_enum)]
        job: JobArg,
    },

    /// Fetch current conditions and forecast so the scheduler picks the
    /// location up.
    Track { location: String },

    /// Run the scheduler until interrupted.
    Serve,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum JobArg {
    Current,
    Forecast,
    Alerts,
}

impl From<JobArg> for Job {
    fn from(arg: JobArg) -> Self {
        match arg {
            JobArg::Current => Job::CurrentWeather,
            JobArg::Forecast => Job::Forecasts,
            JobArg::Alerts => Job::Alerts,
        }
    }
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        let mut config = Config::load()?;

        match self.command {
            Command::Configure { provider, base_url, default } => {
                configure(&mut config, &provider, base_url, default)?;
            }
            Command::Current { location } => {
                let app = WeatherSync::from_config(&config).await?;
                let snapshot = app.service.get_current(&location).await?;
                output::print_current(&snapshot);
            }
            Command::Forecast { location } => {
                let app = WeatherSync::from_config(&config).await?;
                let entries = app.service.get_forecast(&location).await?;
                output::print_forecast(&location, &entries);
            }
            Command::Alerts { location, all } => {
                let app = WeatherSync::from_config(&config).await?;
                match location {
                    Some(location) if !all => {
                        let alerts = app.service.get_active_alerts(&location).await?;
                        output::print_alerts(&alerts, &format!("No active alerts for {location}."));
                    }
                    _ => {
                        let alerts = app.service.all_alerts().await?;
                        output::print_alerts(&alerts, "No alerts stored.");
                    }
                }
            }
            Command::History { location, hours } => {
                if hours <= 0 {
                    bail!("--hours must be positive");
                }
                let app = WeatherSync::from_config(&config).await?;
                let since = Utc::now() - Duration::hours(hours);
                let snapshots = app.service.history(&location, since).await?;
                output::print_history(&location, &snapshots);
            }
            Command::Locations => {
                let app = WeatherSync::from_config(&config).await?;
                let locations = app.service.known_locations().await?;
                if locations.is_empty() {
                    println!("No locations tracked yet. Try `weather-sync track <location>`.");
                }
                for location in locations {
                    println!("{location}");
                }
            }
            Command::Refresh { job } => {
                let app = WeatherSync::from_config(&config).await?;
                match app.scheduler.run(job.into()).await {
                    JobRun::Completed(summary) => output::print_summary(job.into(), &summary),
                    JobRun::Overlapped => println!("Job is already running."),
                }
            }
            Command::Track { location } => {
                let app = WeatherSync::from_config(&config).await?;
                let snapshot = app.service.get_current(&location).await?;
                output::print_current(&snapshot);
                let entries = app.service.get_forecast(&location).await?;
                output::print_forecast(&snapshot.location, &entries);
            }
            Command::Serve => {
                let app = WeatherSync::from_config(&config).await?;
                serve(&app).await?;
            }
        }

        Ok(())
    }
}

fn configure(
    config: &mut Config,
    provider: &str,
    base_url: Option<String>,
    make_default: bool,
) -> Result<()> {
    let id = ProviderId::try_from(provider)?;

    let api_key = Password::new(&format!("API key for {id}:"))
        .without_confirmation()
        .prompt()
        .context("Failed to read API key")?;
    if api_key.trim().is_empty() {
        bail!("API key must not be empty");
    }

    config.upsert_provider_api_key(id, api_key.trim().to_string());
    if let Some(base_url) = base_url {
        if let Some(entry) = config.providers.get_mut(id.as_str()) {
            entry.base_url = Some(base_url);
        }
    }
    if make_default {
        config.set_default_provider(id);
    }
    config.save()?;

    println!("Saved {id} credentials to {}", Config::config_file_path()?.display());
    Ok(())
}

async fn serve(app: &WeatherSync) -> Result<()> {
    let periods = app.scheduler.periods();
    info!(
        current = ?periods.current,
        forecast = ?periods.forecast,
        alerts = ?periods.alerts,
        "scheduler running, press Ctrl-C to stop"
    );

    let handles = app.scheduler.spawn();
    tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?;

    info!("shutting down");
    for handle in handles {
        handle.abort();
    }
    Ok(())
}
