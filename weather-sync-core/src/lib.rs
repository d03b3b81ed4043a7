//! Core library for the `weather-sync` service.
//!
//! This crate defines:
//! - Configuration & credentials handling
//! - Abstraction over weather providers
//! - The record store and the merge rules applied to it
//! - Deduplicated refreshes shared by the query service and the scheduler
//!
//! It is used by `weather-sync-cli`, but can also be embedded by an HTTP host:
//! [`ServiceError::status_code`] maps every failure to a status.

pub mod app;
pub mod config;
pub mod dedup;
pub mod error;
pub mod freshness;
pub mod merge;
pub mod model;
pub mod provider;
pub mod refresh;
pub mod scheduler;
pub mod service;
pub mod store;

#[cfg(test)]
mod testing;

pub use app::WeatherSync;
pub use config::{Config, ProviderConfig, RefreshSettings, StoreSettings};
pub use error::{ProviderError, ProviderFailure, RefreshError, ServiceError, StoreError};
pub use freshness::FreshnessPolicy;
pub use merge::{MergeEngine, MergeReport};
pub use model::{Alert, CurrentSnapshot, DataKind, ForecastEntry, Severity};
pub use provider::{ProviderId, WeatherProvider};
pub use refresh::Refresher;
pub use scheduler::{Job, JobRun, JobSummary, RefreshScheduler};
pub use service::QueryService;
pub use store::{MemoryStore, RecordStore};
