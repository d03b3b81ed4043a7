//! Staleness rules per data kind.

use chrono::{DateTime, Duration, Utc};

use crate::model::DataKind;

pub const DEFAULT_CURRENT_MAX_AGE_MINUTES: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreshnessPolicy {
    pub current_max_age: Duration,
}

impl Default for FreshnessPolicy {
    fn default() -> Self {
        Self { current_max_age: Duration::minutes(DEFAULT_CURRENT_MAX_AGE_MINUTES) }
    }
}

impl FreshnessPolicy {
    pub fn new(current_max_age: Duration) -> Self {
        Self { current_max_age }
    }

    /// Decide whether cached data must be refetched.
    ///
    /// `latest` is the newest record time for the kind: `fetched_at` of the
    /// newest snapshot for `Current`, the furthest `forecast_date` (midnight
    /// UTC) for `Forecast`. `None` means nothing is cached.
    ///
    /// - `Current` is stale once it is at least `current_max_age` old.
    /// - `Forecast` is stale when no entry is dated today or later.
    /// - `Alert` is always due; alerts are polled on their own schedule and
    ///   on-demand reads never fetch them.
    pub fn is_stale(
        &self,
        latest: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        kind: DataKind,
    ) -> bool {
        match kind {
            DataKind::Current => match latest {
                Some(at) => now - at >= self.current_max_age,
                None => true,
            },
            DataKind::Forecast => match latest {
                Some(at) => at.date_naive() < now.date_naive(),
                None => true,
            },
            DataKind::Alert => true,
        }
    }
}
