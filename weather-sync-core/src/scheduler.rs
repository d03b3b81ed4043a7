//! Periodic background refresh.
//!
//! Three independent jobs, each `Idle -> Running -> Idle`. A trigger that
//! fires while the same job is still running is skipped. Every run walks all
//! known locations; a failure for one location is logged and recorded in the
//! run summary, and the run moves on to the next location.

use chrono::Utc;
use futures::{StreamExt, stream};
use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tracing::{error, info, warn};

use crate::{
    error::RefreshError,
    model::DataKind,
    refresh::Refresher,
    store::RecordStore,
};

/// Locations refreshed concurrently within one run.
const LOCATION_CONCURRENCY: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Job {
    CurrentWeather,
    Forecasts,
    Alerts,
}

impl Job {
    pub const fn all() -> &'static [Job] {
        &[Job::CurrentWeather, Job::Forecasts, Job::Alerts]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Job::CurrentWeather => "update-current-weather",
            Job::Forecasts => "update-forecasts",
            Job::Alerts => "check-alerts",
        }
    }

    pub fn kind(&self) -> DataKind {
        match self {
            Job::CurrentWeather => DataKind::Current,
            Job::Forecasts => DataKind::Forecast,
            Job::Alerts => DataKind::Alert,
        }
    }

    fn index(&self) -> usize {
        match self {
            Job::CurrentWeather => 0,
            Job::Forecasts => 1,
            Job::Alerts => 2,
        }
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Idle,
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulePeriods {
    pub current: Duration,
    pub forecast: Duration,
    pub alerts: Duration,
}

impl Default for SchedulePeriods {
    fn default() -> Self {
        Self {
            current: Duration::from_secs(30 * 60),
            forecast: Duration::from_secs(3 * 60 * 60),
            alerts: Duration::from_secs(15 * 60),
        }
    }
}

impl SchedulePeriods {
    pub fn period(&self, job: Job) -> Duration {
        match job {
            Job::CurrentWeather => self.current,
            Job::Forecasts => self.forecast,
            Job::Alerts => self.alerts,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LocationFailure {
    pub location: String,
    pub error: RefreshError,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobSummary {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: Vec<LocationFailure>,
    /// Locations not attempted, e.g. alerts for a place with no known coordinates.
    pub skipped: Vec<String>,
    /// Alerts deactivated by the expiry sweep.
    pub swept: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobRun {
    Completed(JobSummary),
    /// The previous run of the same job had not finished.
    Overlapped,
}

/// Marks a job as running for as long as it is held.
struct RunGuard<'a>(&'a AtomicBool);

impl<'a> RunGuard<'a> {
    fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RunGuard(flag))
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Debug)]
pub struct RefreshScheduler {
    refresher: Arc<Refresher>,
    store: Arc<dyn RecordStore>,
    periods: SchedulePeriods,
    running: [AtomicBool; 3],
}

impl RefreshScheduler {
    pub fn new(
        refresher: Arc<Refresher>,
        store: Arc<dyn RecordStore>,
        periods: SchedulePeriods,
    ) -> Self {
        Self {
            refresher,
            store,
            periods,
            running: [AtomicBool::new(false), AtomicBool::new(false), AtomicBool::new(false)],
        }
    }

    pub fn periods(&self) -> SchedulePeriods {
        self.periods
    }

    pub fn state(&self, job: Job) -> JobState {
        if self.running[job.index()].load(Ordering::Acquire) {
            JobState::Running
        } else {
            JobState::Idle
        }
    }

    /// Entry point for the current-weather job.
    pub async fn update_current_weather(&self) {
        self.run(Job::CurrentWeather).await;
    }

    /// Entry point for the forecast job.
    pub async fn update_forecasts(&self) {
        self.run(Job::Forecasts).await;
    }

    /// Entry point for the alert job: expiry sweep, then refetch.
    pub async fn check_alerts(&self) {
        self.run(Job::Alerts).await;
    }

    pub async fn run(&self, job: Job) -> JobRun {
        let Some(_guard) = RunGuard::try_acquire(&self.running[job.index()]) else {
            info!(%job, "previous run still in progress, skipping trigger");
            return JobRun::Overlapped;
        };

        info!(%job, "job started");
        let mut summary = JobSummary::default();

        if job == Job::Alerts {
            match self.refresher.merge_engine().sweep_expired_alerts(Utc::now()).await {
                Ok(swept) => summary.swept = swept,
                Err(e) => error!(%job, kind = "alert", error = %e, "expiry sweep failed"),
            }
        }

        let locations = match self.store.known_locations().await {
            Ok(locations) => locations,
            Err(e) => {
                error!(%job, kind = %job.kind(), error = %e, "could not list known locations");
                return JobRun::Completed(summary);
            }
        };

        let pending: Vec<_> = locations
            .into_iter()
            .map(|location| async move {
                let outcome = self.refresh_location(job, &location).await;
                (location, outcome)
            })
            .collect();
        let outcomes: Vec<(String, Outcome)> = stream::iter(pending)
            .buffer_unordered(LOCATION_CONCURRENCY)
            .collect()
            .await;

        for (location, outcome) in outcomes {
            match outcome {
                Outcome::Refreshed => {
                    summary.attempted += 1;
                    summary.succeeded += 1;
                }
                Outcome::Failed(error) => {
                    error!(%job, %location, kind = %job.kind(), %error, "location refresh failed");
                    summary.attempted += 1;
                    summary.failed.push(LocationFailure { location, error });
                }
                Outcome::Skipped => summary.skipped.push(location),
            }
        }

        info!(
            %job,
            attempted = summary.attempted,
            succeeded = summary.succeeded,
            failed = summary.failed.len(),
            skipped = summary.skipped.len(),
            swept = summary.swept,
            "job finished"
        );
        JobRun::Completed(summary)
    }

    async fn refresh_location(&self, job: Job, location: &str) -> Outcome {
        let result = match job {
            Job::CurrentWeather => self.refresher.refresh_current(location).await.map(|_| ()),
            Job::Forecasts => self.refresher.refresh_forecast(location).await.map(|_| ()),
            Job::Alerts => match self.store.coordinates(location).await {
                Ok(Some((lat, lon))) => {
                    self.refresher.refresh_alerts(location, lat, lon).await.map(|_| ())
                }
                Ok(None) => {
                    warn!(location, kind = "alert", "no coordinates known, skipping alert check");
                    return Outcome::Skipped;
                }
                Err(e) => Err(e.into()),
            },
        };

        match result {
            Ok(()) => Outcome::Refreshed,
            Err(e) => Outcome::Failed(e),
        }
    }

    /// Drive every job on its period. The first tick of each fires immediately.
    pub fn spawn(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        Job::all()
            .iter()
            .map(|&job| {
                let scheduler = Arc::clone(self);
                let period = self.periods.period(job);
                tokio::spawn(async move {
                    info!(%job, ?period, "scheduling job");
                    let mut ticker = tokio::time::interval(period);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                    loop {
                        ticker.tick().await;
                        let scheduler = Arc::clone(&scheduler);
                        tokio::spawn(async move {
                            scheduler.run(job).await;
                        });
                    }
                })
            })
            .collect()
    }
}

enum Outcome {
    Refreshed,
    Failed(RefreshError),
    Skipped,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::{ProviderError, ProviderFailure},
        merge::MergeEngine,
        store::MemoryStore,
        testing::{MockProvider, alert, snapshot},
    };
    use chrono::Duration as ChronoDuration;

    fn scheduler(provider: Arc<MockProvider>) -> (Arc<MemoryStore>, Arc<RefreshScheduler>) {
        scheduler_with_periods(provider, SchedulePeriods::default())
    }

    fn scheduler_with_periods(
        provider: Arc<MockProvider>,
        periods: SchedulePeriods,
    ) -> (Arc<MemoryStore>, Arc<RefreshScheduler>) {
        let store = Arc::new(MemoryStore::new());
        let merge = MergeEngine::new(store.clone());
        let refresher = Arc::new(Refresher::new(provider, merge, Duration::from_secs(5)));
        let scheduler = Arc::new(RefreshScheduler::new(refresher, store.clone(), periods));
        (store, scheduler)
    }

    fn completed(run: JobRun) -> JobSummary {
        match run {
            JobRun::Completed(summary) => summary,
            JobRun::Overlapped => panic!("expected the job to run"),
        }
    }

    #[test]
    fn default_periods() {
        let periods = SchedulePeriods::default();
        assert_eq!(periods.period(Job::CurrentWeather), Duration::from_secs(1800));
        assert_eq!(periods.period(Job::Forecasts), Duration::from_secs(10800));
        assert_eq!(periods.period(Job::Alerts), Duration::from_secs(900));
    }

    #[tokio::test]
    async fn one_failing_location_does_not_abort_the_job() {
        let provider = MockProvider::new();
        provider.fail_for("Bogota");
        let (store, scheduler) = scheduler(provider.clone());
        let old = Utc::now() - ChronoDuration::hours(2);
        for location in ["Bogota", "Lima", "Quito"] {
            store.append_current(snapshot(location, old)).await.unwrap();
        }

        let summary = completed(scheduler.run(Job::CurrentWeather).await);

        assert_eq!(summary.attempted, 3);
        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.failed[0].location, "Bogota");
        assert_eq!(
            summary.failed[0].error,
            RefreshError::Provider(ProviderError::new(
                "Bogota",
                ProviderFailure::Status { status: 500, body: "upstream down".into() },
            ))
        );
        assert_eq!(provider.current_calls(), 3);

        for location in ["Lima", "Quito"] {
            let latest = store.latest_current(location).await.unwrap().unwrap();
            assert!(latest.fetched_at > old);
        }
        let bogota = store.latest_current("Bogota").await.unwrap().unwrap();
        assert_eq!(bogota.fetched_at, old);
    }

    #[tokio::test]
    async fn overlapping_trigger_is_skipped() {
        let provider = MockProvider::with_latency(Duration::from_millis(100));
        let (store, scheduler) = scheduler(provider.clone());
        store.insert_forecasts_if_absent(vec![crate::testing::forecast("Oslo", Utc::now().date_naive())])
            .await
            .unwrap();

        let (first, second) = tokio::join!(scheduler.run(Job::Forecasts), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            assert_eq!(scheduler.state(Job::Forecasts), JobState::Running);
            scheduler.run(Job::Forecasts).await
        });

        assert!(matches!(first, JobRun::Completed(_)));
        assert_eq!(second, JobRun::Overlapped);
        assert_eq!(provider.forecast_calls(), 1);
        assert_eq!(scheduler.state(Job::Forecasts), JobState::Idle);
    }

    #[tokio::test]
    async fn different_jobs_may_run_at_the_same_time() {
        let provider = MockProvider::with_latency(Duration::from_millis(50));
        let (store, scheduler) = scheduler(provider.clone());
        store.append_current(snapshot("Oslo", Utc::now())).await.unwrap();

        let (current, forecast) =
            tokio::join!(scheduler.run(Job::CurrentWeather), scheduler.run(Job::Forecasts));

        assert!(matches!(current, JobRun::Completed(_)));
        assert!(matches!(forecast, JobRun::Completed(_)));
    }

    #[tokio::test]
    async fn alert_job_sweeps_then_refetches_where_coordinates_are_known() {
        let provider = MockProvider::new();
        let (store, scheduler) = scheduler(provider.clone());
        let now = Utc::now();

        store
            .insert_alerts_if_absent(vec![alert(
                "Darwin",
                "Cyclone",
                now - ChronoDuration::hours(10),
                now - ChronoDuration::hours(1),
            )])
            .await
            .unwrap();
        store.append_current(snapshot("Perth", now)).await.unwrap();
        provider.set_alerts(
            "Perth",
            vec![alert("Perth", "Fire Weather", now, now + ChronoDuration::hours(6))],
        );

        let summary = completed(scheduler.run(Job::Alerts).await);

        assert_eq!(summary.swept, 1);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.skipped, vec!["Darwin".to_string()]);
        assert_eq!(provider.alert_calls(), 1);
        assert_eq!(store.active_alerts("Perth", now).await.unwrap().len(), 1);
        assert!(store.active_alerts("Darwin", now).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn job_with_no_known_locations_is_a_no_op() {
        let provider = MockProvider::new();
        let (_store, scheduler) = scheduler(provider.clone());

        scheduler.update_current_weather().await;
        scheduler.update_forecasts().await;
        scheduler.check_alerts().await;

        assert_eq!(provider.current_calls(), 0);
        assert_eq!(provider.forecast_calls(), 0);
        assert_eq!(provider.alert_calls(), 0);
    }

    #[tokio::test]
    async fn spawned_jobs_tick_on_their_period() {
        let provider = MockProvider::new();
        let periods = SchedulePeriods {
            current: Duration::from_millis(40),
            forecast: Duration::from_secs(3600),
            alerts: Duration::from_secs(3600),
        };
        let (store, scheduler) = scheduler_with_periods(provider.clone(), periods);
        store.append_current(snapshot("Reykjavik", Utc::now())).await.unwrap();

        let handles = scheduler.spawn();
        tokio::time::sleep(Duration::from_millis(150)).await;
        for handle in handles {
            handle.abort();
        }

        assert!(provider.current_calls() >= 2, "calls: {}", provider.current_calls());
        assert_eq!(provider.forecast_calls(), 1, "first tick fires immediately");
    }
}
