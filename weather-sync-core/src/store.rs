//! Record storage for snapshots, forecasts and alerts.
//!
//! [`RecordStore`] is the seam to persistent storage. [`MemoryStore`] keeps
//! everything in memory and, when opened with a path, mirrors it to a JSON
//! file after every write.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fmt::Debug,
    path::{Path, PathBuf},
};
use tokio::sync::RwLock;
use tracing::debug;

use crate::{
    error::StoreError,
    model::{Alert, CurrentSnapshot, ForecastEntry},
};

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait RecordStore: Send + Sync + Debug {
    /// Newest snapshot for a location, by `fetched_at`.
    async fn latest_current(&self, location: &str) -> StoreResult<Option<CurrentSnapshot>>;

    /// Snapshots observed at or after `since`, newest first.
    async fn current_since(
        &self,
        location: &str,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<CurrentSnapshot>>;

    /// Appends a snapshot. Never replaces an existing one.
    async fn append_current(&self, snapshot: CurrentSnapshot) -> StoreResult<()>;

    /// Forecast entries dated `from` or later, ordered by date.
    async fn forecasts_from(&self, location: &str, from: NaiveDate)
    -> StoreResult<Vec<ForecastEntry>>;

    /// Inserts each entry whose `(location, forecast_date)` is not yet stored.
    /// Returns, per entry, whether it was inserted.
    async fn insert_forecasts_if_absent(&self, entries: Vec<ForecastEntry>)
    -> StoreResult<Vec<bool>>;

    /// Alerts with `is_active` set and `end_time > now`, newest start first.
    async fn active_alerts(&self, location: &str, now: DateTime<Utc>) -> StoreResult<Vec<Alert>>;

    /// Every stored alert, newest start first.
    async fn all_alerts(&self) -> StoreResult<Vec<Alert>>;

    /// Inserts each alert whose `(location, alert_type, start_time, end_time)`
    /// is not yet stored. Returns, per alert, whether it was inserted.
    async fn insert_alerts_if_absent(&self, alerts: Vec<Alert>) -> StoreResult<Vec<bool>>;

    /// Clears `is_active` on alerts that ended before `now`. Returns how many changed.
    async fn deactivate_expired_alerts(&self, now: DateTime<Utc>) -> StoreResult<usize>;

    /// Distinct locations that have any stored record, sorted.
    async fn known_locations(&self) -> StoreResult<Vec<String>>;

    /// Best known coordinates: newest snapshot first, then any forecast entry.
    async fn coordinates(&self, location: &str) -> StoreResult<Option<(f64, f64)>>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Tables {
    snapshots: HashMap<String, Vec<CurrentSnapshot>>,
    forecasts: HashMap<String, BTreeMap<NaiveDate, ForecastEntry>>,
    alerts: HashMap<String, Vec<Alert>>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    path: Option<PathBuf>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a store backed by `path`, loading existing records if the file exists.
    pub async fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();
        let tables = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Tables::default(),
            Err(err) => return Err(err.into()),
        };
        debug!(path = %path.display(), "opened record store");

        Ok(Self { tables: RwLock::new(tables), path: Some(path) })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Runs `change` against the tables under the write lock. `change`
    /// returns its result and whether anything was modified.
    ///
    /// With a backing file the change is made on a copy, and the copy only
    /// replaces the live tables once it has been written out. A failed write
    /// leaves memory as it was.
    async fn apply<R>(&self, change: impl FnOnce(&mut Tables) -> (R, bool)) -> StoreResult<R> {
        let mut tables = self.tables.write().await;
        let Some(path) = &self.path else {
            return Ok(change(&mut tables).0);
        };

        let mut staged = tables.clone();
        let (result, modified) = change(&mut staged);
        if modified {
            persist(path, &staged).await?;
            *tables = staged;
        }
        Ok(result)
    }
}

async fn persist(path: &Path, tables: &Tables) -> StoreResult<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let json = serde_json::to_vec(tables)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, json).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn latest_current(&self, location: &str) -> StoreResult<Option<CurrentSnapshot>> {
        let tables = self.tables.read().await;
        Ok(tables
            .snapshots
            .get(location)
            .and_then(|list| list.iter().max_by_key(|s| s.fetched_at))
            .cloned())
    }

    async fn current_since(
        &self,
        location: &str,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<CurrentSnapshot>> {
        let tables = self.tables.read().await;
        let mut found: Vec<CurrentSnapshot> = tables
            .snapshots
            .get(location)
            .map(|list| list.iter().filter(|s| s.observed_at >= since).cloned().collect())
            .unwrap_or_default();
        found.sort_by(|a, b| b.observed_at.cmp(&a.observed_at));
        Ok(found)
    }

    async fn append_current(&self, snapshot: CurrentSnapshot) -> StoreResult<()> {
        self.apply(|tables| {
            tables.snapshots.entry(snapshot.location.clone()).or_default().push(snapshot);
            ((), true)
        })
        .await
    }

    async fn forecasts_from(
        &self,
        location: &str,
        from: NaiveDate,
    ) -> StoreResult<Vec<ForecastEntry>> {
        let tables = self.tables.read().await;
        Ok(tables
            .forecasts
            .get(location)
            .map(|by_date| by_date.range(from..).map(|(_, e)| e.clone()).collect())
            .unwrap_or_default())
    }

    async fn insert_forecasts_if_absent(
        &self,
        entries: Vec<ForecastEntry>,
    ) -> StoreResult<Vec<bool>> {
        self.apply(|tables| {
            let mut inserted = Vec::with_capacity(entries.len());
            for entry in entries {
                let by_date = tables.forecasts.entry(entry.location.clone()).or_default();
                if by_date.contains_key(&entry.forecast_date) {
                    inserted.push(false);
                } else {
                    by_date.insert(entry.forecast_date, entry);
                    inserted.push(true);
                }
            }
            let modified = inserted.iter().any(|i| *i);
            (inserted, modified)
        })
        .await
    }

    async fn active_alerts(&self, location: &str, now: DateTime<Utc>) -> StoreResult<Vec<Alert>> {
        let tables = self.tables.read().await;
        let mut found: Vec<Alert> = tables
            .alerts
            .get(location)
            .map(|list| list.iter().filter(|a| a.is_active && a.end_time > now).cloned().collect())
            .unwrap_or_default();
        found.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        Ok(found)
    }

    async fn all_alerts(&self) -> StoreResult<Vec<Alert>> {
        let tables = self.tables.read().await;
        let mut found: Vec<Alert> = tables.alerts.values().flatten().cloned().collect();
        found.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        Ok(found)
    }

    async fn insert_alerts_if_absent(&self, alerts: Vec<Alert>) -> StoreResult<Vec<bool>> {
        self.apply(|tables| {
            let mut inserted = Vec::with_capacity(alerts.len());
            for alert in alerts {
                let list = tables.alerts.entry(alert.location.clone()).or_default();
                if list.iter().any(|existing| existing.same_window(&alert)) {
                    inserted.push(false);
                } else {
                    list.push(alert);
                    inserted.push(true);
                }
            }
            let modified = inserted.iter().any(|i| *i);
            (inserted, modified)
        })
        .await
    }

    async fn deactivate_expired_alerts(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        self.apply(|tables| {
            let mut changed = 0;
            for alert in tables.alerts.values_mut().flatten() {
                if alert.is_active && alert.end_time < now {
                    alert.is_active = false;
                    changed += 1;
                }
            }
            (changed, changed > 0)
        })
        .await
    }

    async fn known_locations(&self) -> StoreResult<Vec<String>> {
        let tables = self.tables.read().await;
        let locations: BTreeSet<&String> = tables
            .snapshots
            .iter()
            .filter(|(_, v)| !v.is_empty())
            .map(|(k, _)| k)
            .chain(tables.forecasts.iter().filter(|(_, v)| !v.is_empty()).map(|(k, _)| k))
            .chain(tables.alerts.iter().filter(|(_, v)| !v.is_empty()).map(|(k, _)| k))
            .collect();
        Ok(locations.into_iter().cloned().collect())
    }

    async fn coordinates(&self, location: &str) -> StoreResult<Option<(f64, f64)>> {
        let tables = self.tables.read().await;
        let from_snapshot = tables
            .snapshots
            .get(location)
            .and_then(|list| list.iter().max_by_key(|s| s.fetched_at))
            .map(|s| (s.latitude, s.longitude));
        let from_forecast = || {
            tables
                .forecasts
                .get(location)
                .and_then(|by_date| by_date.values().next_back())
                .map(|e| (e.latitude, e.longitude))
        };
        Ok(from_snapshot.or_else(from_forecast))
    }
}
