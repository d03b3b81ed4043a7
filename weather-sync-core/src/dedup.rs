//! At most one in-flight fetch per `(location, kind)`.
//!
//! The first caller for a key spawns the work onto the runtime and registers
//! a shared handle to it; later callers for the same key attach to that handle
//! and all of them observe the same result. The spawned task removes its key
//! from the registry when it finishes, whether it succeeded, failed, panicked,
//! or hit the fetch timeout. Callers that stop waiting do not cancel the work.

use futures::{
    FutureExt,
    future::{BoxFuture, Shared},
};
use std::{collections::HashMap, fmt, future::Future, panic::AssertUnwindSafe, sync::Arc, time::Duration};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::{
    error::{ProviderError, ProviderFailure, RefreshError},
    model::DataKind,
};

pub type RefreshResult<T> = Result<T, RefreshError>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FetchKey {
    pub location: String,
    pub kind: DataKind,
}

impl FetchKey {
    pub fn new(location: impl Into<String>, kind: DataKind) -> Self {
        Self { location: location.into(), kind }
    }
}

impl fmt::Display for FetchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.location, self.kind)
    }
}

type InFlight<T> = Shared<BoxFuture<'static, RefreshResult<T>>>;
type Registry<T> = Arc<Mutex<HashMap<FetchKey, InFlight<T>>>>;

pub struct DedupCoordinator<T: Clone> {
    in_flight: Registry<T>,
    fetch_timeout: Duration,
}

impl<T: Clone> fmt::Debug for DedupCoordinator<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DedupCoordinator")
            .field("fetch_timeout", &self.fetch_timeout)
            .finish_non_exhaustive()
    }
}

impl<T> DedupCoordinator<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(fetch_timeout: Duration) -> Self {
        Self { in_flight: Arc::new(Mutex::new(HashMap::new())), fetch_timeout }
    }

    /// Run `fetch` for `key` unless a run for it is already in flight, in
    /// which case wait for that run's result instead. `fetch` is only called
    /// when a new run starts.
    pub async fn run_exclusive<F, Fut>(&self, key: FetchKey, fetch: F) -> RefreshResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = RefreshResult<T>> + Send + 'static,
    {
        let shared = {
            let mut in_flight = self.in_flight.lock().await;
            match in_flight.get(&key) {
                Some(existing) => {
                    debug!(location = %key.location, kind = %key.kind, "attaching to in-flight fetch");
                    existing.clone()
                }
                None => {
                    let shared = self.spawn(key.clone(), fetch());
                    in_flight.insert(key, shared.clone());
                    shared
                }
            }
        };

        shared.await
    }

    fn spawn<Fut>(&self, key: FetchKey, work: Fut) -> InFlight<T>
    where
        Fut: Future<Output = RefreshResult<T>> + Send + 'static,
    {
        let registry = Arc::clone(&self.in_flight);
        let timeout = self.fetch_timeout;
        let task_key = key.clone();

        let handle = tokio::spawn(async move {
            debug!(location = %task_key.location, kind = %task_key.kind, "starting fetch");
            let guarded = AssertUnwindSafe(tokio::time::timeout(timeout, work)).catch_unwind();
            let result = match guarded.await {
                Ok(Ok(result)) => result,
                Ok(Err(_elapsed)) => {
                    warn!(location = %task_key.location, kind = %task_key.kind, ?timeout, "fetch timed out");
                    Err(RefreshError::Provider(ProviderError::new(
                        task_key.location.clone(),
                        ProviderFailure::Timeout,
                    )))
                }
                Err(_panic) => Err(RefreshError::Aborted {
                    location: task_key.location.clone(),
                    kind: task_key.kind,
                    reason: "fetch task panicked".to_string(),
                }),
            };

            registry.lock().await.remove(&task_key);
            result
        });

        async move {
            handle.await.unwrap_or_else(|join_err| {
                Err(RefreshError::Aborted {
                    location: key.location,
                    kind: key.kind,
                    reason: join_err.to_string(),
                })
            })
        }
        .boxed()
        .shared()
    }

    pub async fn is_in_flight(&self, key: &FetchKey) -> bool {
        self.in_flight.lock().await.contains_key(key)
    }

    pub async fn in_flight_count(&self) -> usize {
        self.in_flight.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn key(location: &str) -> FetchKey {
        FetchKey::new(location, DataKind::Current)
    }

    async fn slow_value(calls: Arc<AtomicUsize>, value: u32) -> RefreshResult<u32> {
        calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        Ok(value)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_share_one_fetch() {
        let coordinator = Arc::new(DedupCoordinator::<u32>::new(Duration::from_secs(5)));
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..16 {
            let coordinator = coordinator.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                coordinator.run_exclusive(key("Nairobi"), || slow_value(calls, i)).await
            }));
        }

        let results: Vec<u32> =
            futures::future::join_all(handles).await.into_iter().map(|r| r.unwrap().unwrap()).collect();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(results.windows(2).all(|w| w[0] == w[1]), "all callers see one result");
        assert_eq!(coordinator.in_flight_count().await, 0);
    }

    #[tokio::test]
    async fn different_keys_run_independently() {
        let coordinator = DedupCoordinator::<u32>::new(Duration::from_secs(5));
        let calls = Arc::new(AtomicUsize::new(0));

        let (a, b) = tokio::join!(
            coordinator.run_exclusive(key("Lima"), || slow_value(calls.clone(), 1)),
            coordinator.run_exclusive(key("Quito"), || slow_value(calls.clone(), 2)),
        );

        assert_eq!((a.unwrap(), b.unwrap()), (1, 2));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn waiters_observe_the_same_error_and_key_is_released() {
        let coordinator = DedupCoordinator::<u32>::new(Duration::from_secs(5));
        let calls = Arc::new(AtomicUsize::new(0));

        let failing = |calls: Arc<AtomicUsize>| async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            Err::<u32, _>(RefreshError::Provider(ProviderError::new(
                "Accra",
                ProviderFailure::Transport("connection reset".into()),
            )))
        };

        let (a, b) = tokio::join!(
            coordinator.run_exclusive(key("Accra"), || failing(calls.clone())),
            coordinator.run_exclusive(key("Accra"), || failing(calls.clone())),
        );

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(a.unwrap_err(), b.unwrap_err());
        assert!(!coordinator.is_in_flight(&key("Accra")).await);

        let retry = coordinator.run_exclusive(key("Accra"), || slow_value(calls.clone(), 7)).await;
        assert_eq!(retry.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn hung_fetch_times_out_and_releases_key() {
        let coordinator = DedupCoordinator::<u32>::new(Duration::from_millis(50));

        let err = coordinator
            .run_exclusive(key("Hanoi"), || async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(1)
            })
            .await
            .unwrap_err();

        match err {
            RefreshError::Provider(e) => {
                assert_eq!(e.location, "Hanoi");
                assert_eq!(e.failure, ProviderFailure::Timeout);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!coordinator.is_in_flight(&key("Hanoi")).await);
    }

    #[tokio::test]
    async fn panicking_fetch_is_reported_and_releases_key() {
        let coordinator = DedupCoordinator::<u32>::new(Duration::from_secs(5));

        let err = coordinator
            .run_exclusive(key("Cairo"), || async {
                if true {
                    panic!("boom");
                }
                Ok(1)
            })
            .await
            .unwrap_err();

        assert!(matches!(err, RefreshError::Aborted { kind: DataKind::Current, .. }));
        assert!(!coordinator.is_in_flight(&key("Cairo")).await);
    }

    #[tokio::test]
    async fn caller_timeout_does_not_cancel_shared_fetch() {
        let coordinator = Arc::new(DedupCoordinator::<u32>::new(Duration::from_secs(5)));
        let calls = Arc::new(AtomicUsize::new(0));
        let completed = Arc::new(AtomicUsize::new(0));

        let work = {
            let calls = calls.clone();
            let completed = completed.clone();
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(150)).await;
                completed.fetch_add(1, Ordering::SeqCst);
                Ok(42)
            }
        };

        let impatient = tokio::time::timeout(
            Duration::from_millis(20),
            coordinator.run_exclusive(key("Tokyo"), work),
        )
        .await;
        assert!(impatient.is_err());

        let patient = coordinator
            .run_exclusive(key("Tokyo"), || async { Ok(0) })
            .await
            .unwrap();

        assert_eq!(patient, 42, "second caller attached to the original fetch");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(completed.load(Ordering::SeqCst), 1);
    }
}
