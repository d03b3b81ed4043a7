//! Reconciles fetched records with the store.
//!
//! Snapshots are appended. Forecast entries and alerts are inserted only when
//! their natural key is absent; stored rows are never updated in place, apart
//! from the alert expiry sweep clearing `is_active`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::{
    error::{RefreshError, StoreError},
    model::{Alert, Batch, CurrentSnapshot, DataKind, ForecastEntry, Rejected},
    store::RecordStore,
};

/// Outcome of merging one provider response.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MergeReport {
    pub inserted: usize,
    pub unchanged: usize,
    pub rejected: Vec<Rejected>,
}

#[derive(Debug, Clone)]
pub struct MergeEngine {
    store: Arc<dyn RecordStore>,
}

impl MergeEngine {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    pub async fn insert_current(
        &self,
        snapshot: CurrentSnapshot,
    ) -> Result<CurrentSnapshot, RefreshError> {
        if let Err(reason) = validate_snapshot(&snapshot) {
            warn!(location = %snapshot.location, kind = "current", %reason, "rejecting snapshot");
            return Err(RefreshError::Rejected {
                location: snapshot.location,
                kind: DataKind::Current,
                reason,
            });
        }

        self.store.append_current(snapshot.clone()).await?;
        info!(location = %snapshot.location, kind = "current", "stored snapshot");
        Ok(snapshot)
    }

    /// First write wins per `(location, forecast_date)`.
    pub async fn upsert_forecasts(
        &self,
        location: &str,
        batch: Batch<ForecastEntry>,
    ) -> Result<MergeReport, StoreError> {
        let (valid, rejected) = partition(batch, |entry| validate_forecast(location, entry));
        let outcome = self.store.insert_forecasts_if_absent(valid).await?;
        Ok(report(location, DataKind::Forecast, &outcome, rejected))
    }

    /// Inserts alerts whose `(location, alert_type, start_time, end_time)` is
    /// new. `is_active` is derived from `end_time` against `now`.
    pub async fn upsert_alerts(
        &self,
        location: &str,
        batch: Batch<Alert>,
        now: DateTime<Utc>,
    ) -> Result<MergeReport, StoreError> {
        let (mut valid, rejected) = partition(batch, |alert| validate_alert(location, alert));
        for alert in &mut valid {
            alert.is_active = alert.is_active_at(now);
        }
        let outcome = self.store.insert_alerts_if_absent(valid).await?;
        Ok(report(location, DataKind::Alert, &outcome, rejected))
    }

    pub async fn sweep_expired_alerts(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let changed = self.store.deactivate_expired_alerts(now).await?;
        if changed > 0 {
            info!(kind = "alert", deactivated = changed, "expired alerts swept");
        }
        Ok(changed)
    }
}

fn partition<T>(
    batch: Batch<T>,
    validate: impl Fn(&T) -> Result<(), String>,
) -> (Vec<T>, Vec<Rejected>) {
    let mut rejected = batch.rejected;
    let mut valid = Vec::with_capacity(batch.items.len());
    for (index, item) in batch.items.into_iter().enumerate() {
        match validate(&item) {
            Ok(()) => valid.push(item),
            Err(reason) => rejected.push(Rejected::invalid(index, reason)),
        }
    }
    (valid, rejected)
}

fn report(location: &str, kind: DataKind, outcome: &[bool], rejected: Vec<Rejected>) -> MergeReport {
    let inserted = outcome.iter().filter(|i| **i).count();
    let report = MergeReport { inserted, unchanged: outcome.len() - inserted, rejected };

    for r in &report.rejected {
        warn!(location, %kind, stage = %r.stage, index = r.index, reason = %r.reason, "skipped record");
    }
    info!(
        location,
        %kind,
        inserted = report.inserted,
        unchanged = report.unchanged,
        rejected = report.rejected.len(),
        "merged provider response"
    );
    report
}

fn validate_snapshot(s: &CurrentSnapshot) -> Result<(), String> {
    if s.observed_at > s.fetched_at {
        return Err(format!("observed_at {} is after fetched_at {}", s.observed_at, s.fetched_at));
    }
    if s.humidity > 100 {
        return Err(format!("humidity {} out of range", s.humidity));
    }
    if !s.temperature.is_finite() || !s.wind_speed.is_finite() {
        return Err("non-finite measurement".to_string());
    }
    Ok(())
}

fn validate_forecast(location: &str, e: &ForecastEntry) -> Result<(), String> {
    if e.location != location {
        return Err(format!("entry for '{}' in response for '{location}'", e.location));
    }
    if e.precipitation_probability > 100 {
        return Err(format!(
            "{}: precipitation probability {} out of range",
            e.forecast_date, e.precipitation_probability
        ));
    }
    if e.humidity > 100 {
        return Err(format!("{}: humidity {} out of range", e.forecast_date, e.humidity));
    }
    if !(e.min_temp.is_finite() && e.max_temp.is_finite()) || e.min_temp > e.max_temp {
        return Err(format!(
            "{}: invalid temperature range {}..{}",
            e.forecast_date, e.min_temp, e.max_temp
        ));
    }
    Ok(())
}

fn validate_alert(location: &str, a: &Alert) -> Result<(), String> {
    if a.location != location {
        return Err(format!("alert for '{}' in response for '{location}'", a.location));
    }
    if a.alert_type.trim().is_empty() {
        return Err("alert without type".to_string());
    }
    if a.start_time > a.end_time {
        return Err(format!(
            "{}: window starts {} after it ends {}",
            a.alert_type, a.start_time, a.end_time
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RejectStage;
    use crate::store::MemoryStore;
    use crate::testing::{alert, forecast, snapshot};
    use chrono::{Duration, TimeZone};

    fn engine() -> (Arc<MemoryStore>, MergeEngine) {
        let store = Arc::new(MemoryStore::new());
        let engine = MergeEngine::new(store.clone());
        (store, engine)
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 7, 20, 15, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn snapshots_are_appended_not_replaced() {
        let (store, engine) = engine();
        engine.insert_current(snapshot("Nairobi", now() - Duration::hours(1))).await.unwrap();
        engine.insert_current(snapshot("Nairobi", now())).await.unwrap();

        let history = store.current_since("Nairobi", now() - Duration::days(1)).await.unwrap();
        assert_eq!(history.len(), 2);
    }

    #[tokio::test]
    async fn snapshot_observed_after_fetch_is_rejected() {
        let (store, engine) = engine();
        let mut bad = snapshot("Nairobi", now());
        bad.observed_at = now() + Duration::minutes(5);

        let err = engine.insert_current(bad).await.unwrap_err();
        assert!(matches!(err, RefreshError::Rejected { kind: DataKind::Current, .. }));
        assert!(store.latest_current("Nairobi").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn forecast_upsert_is_idempotent() {
        let (store, engine) = engine();
        let today = now().date_naive();
        let batch = || Batch::new((0..5).map(|d| forecast("Kampala", today + Duration::days(d))).collect());

        let first = engine.upsert_forecasts("Kampala", batch()).await.unwrap();
        let count_after_first = store.forecasts_from("Kampala", today).await.unwrap().len();
        let second = engine.upsert_forecasts("Kampala", batch()).await.unwrap();
        let count_after_second = store.forecasts_from("Kampala", today).await.unwrap().len();

        assert_eq!(first.inserted, 5);
        assert_eq!(second.inserted, 0);
        assert_eq!(second.unchanged, 5);
        assert_eq!(count_after_first, count_after_second);
    }

    #[tokio::test]
    async fn forecast_merge_inserts_only_missing_dates() {
        let (store, engine) = engine();
        let today = now().date_naive();

        let mut existing_a = forecast("Kigali", today);
        existing_a.max_temp = 30.0;
        let existing_b = forecast("Kigali", today + Duration::days(2));
        engine.upsert_forecasts("Kigali", Batch::new(vec![existing_a, existing_b])).await.unwrap();

        let incoming = Batch::new((0..5).map(|d| forecast("Kigali", today + Duration::days(d))).collect());
        let report = engine.upsert_forecasts("Kigali", incoming).await.unwrap();

        assert_eq!(report.inserted, 3);
        assert_eq!(report.unchanged, 2);
        let stored = store.forecasts_from("Kigali", today).await.unwrap();
        assert_eq!(stored.len(), 5);
        assert_eq!(stored[0].max_temp, 30.0, "existing rows are left untouched");
    }

    #[tokio::test]
    async fn invalid_forecast_items_are_skipped_and_reported() {
        let (store, engine) = engine();
        let today = now().date_naive();
        let mut bad = forecast("Dakar", today + Duration::days(1));
        bad.precipitation_probability = 140;

        let mut batch = Batch::new(vec![
            forecast("Dakar", today),
            bad,
            forecast("Dakar", today + Duration::days(2)),
        ]);
        batch.rejected.push(Rejected::parse(7, "unparseable slot"));

        let report = engine.upsert_forecasts("Dakar", batch).await.unwrap();

        assert_eq!(report.inserted, 2);
        assert_eq!(report.rejected.len(), 2);
        assert_eq!(report.rejected[0].stage, RejectStage::Parse);
        assert_eq!(report.rejected[0].index, 7);
        assert_eq!(report.rejected[1].stage, RejectStage::Validate);
        assert_eq!(report.rejected[1].index, 1);
        assert_eq!(store.forecasts_from("Dakar", today).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn identical_alert_is_stored_once() {
        let (store, engine) = engine();
        let storm = alert("Miami", "Hurricane", now(), now() + Duration::hours(12));

        engine.upsert_alerts("Miami", Batch::new(vec![storm.clone()]), now()).await.unwrap();
        let report = engine.upsert_alerts("Miami", Batch::new(vec![storm]), now()).await.unwrap();

        assert_eq!(report.inserted, 0);
        assert_eq!(report.unchanged, 1);
        assert_eq!(store.all_alerts().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn alerts_with_different_windows_are_distinct() {
        let (store, engine) = engine();
        let first = alert("Miami", "Flood", now(), now() + Duration::hours(2));
        let second = alert("Miami", "Flood", now(), now() + Duration::hours(4));

        let report =
            engine.upsert_alerts("Miami", Batch::new(vec![first, second]), now()).await.unwrap();

        assert_eq!(report.inserted, 2);
        assert_eq!(store.all_alerts().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn already_ended_alert_is_stored_inactive() {
        let (store, engine) = engine();
        let past = alert("Miami", "Heat", now() - Duration::hours(5), now() - Duration::hours(1));

        engine.upsert_alerts("Miami", Batch::new(vec![past]), now()).await.unwrap();

        let all = store.all_alerts().await.unwrap();
        assert!(!all[0].is_active);
        assert!(store.active_alerts("Miami", now()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn sweep_deactivates_only_expired_alerts() {
        let (store, engine) = engine();
        let ended = alert("Perth", "Fire", now() - Duration::hours(3), now() - Duration::minutes(1));
        let ongoing = alert("Perth", "Wind", now() - Duration::hours(1), now() + Duration::hours(2));
        store.insert_alerts_if_absent(vec![ended, ongoing]).await.unwrap();

        let changed = engine.sweep_expired_alerts(now()).await.unwrap();

        assert_eq!(changed, 1);
        let all = store.all_alerts().await.unwrap();
        let fire = all.iter().find(|a| a.alert_type == "Fire").unwrap();
        let wind = all.iter().find(|a| a.alert_type == "Wind").unwrap();
        assert!(!fire.is_active);
        assert!(wind.is_active);

        assert_eq!(engine.sweep_expired_alerts(now()).await.unwrap(), 0);
    }
}
