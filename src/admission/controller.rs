//! Admission controller: key derivation, store round trip, failure policy.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, trace, warn};

use super::decision::{evaluate, Verdict};
use super::key::KeyDeriver;
use super::limits::LimiterConfig;
use super::tracker::Tracker;
use crate::error::StorageError;
use crate::store::TrackerStore;

/// What the caller should do with a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Proceed.
    Admitted,
    /// Too soon after the previous accepted request.
    RejectedTooFast,
    /// The window's quota is used up.
    RejectedTooFrequent,
    /// The tracker store failed and the limiter is configured to fail closed.
    StorageFailed(StorageError),
}

impl Outcome {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Outcome::Admitted)
    }

    /// HTTP-class status code for this outcome: 200, 425 (Too Early),
    /// 429 (Too Many Requests) or 500.
    pub fn status_code(&self) -> u16 {
        match self {
            Outcome::Admitted => 200,
            Outcome::RejectedTooFast => 425,
            Outcome::RejectedTooFrequent => 429,
            Outcome::StorageFailed(_) => 500,
        }
    }

    /// Short machine-readable label.
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Admitted => "admitted",
            Outcome::RejectedTooFast => "too_fast",
            Outcome::RejectedTooFrequent => "too_frequent",
            Outcome::StorageFailed(_) => "storage_failed",
        }
    }
}

impl From<Verdict> for Outcome {
    fn from(verdict: Verdict) -> Self {
        match verdict {
            Verdict::Accepted => Outcome::Admitted,
            Verdict::TooFast => Outcome::RejectedTooFast,
            Verdict::TooFrequent => Outcome::RejectedTooFrequent,
        }
    }
}

impl Serialize for Outcome {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.label())
    }
}

/// Decides admission for (identity, resource) pairs against one store.
///
/// The store is injected and may be shared with other controllers; the
/// controller itself keeps no per-request state.
pub struct AdmissionController<S: TrackerStore> {
    store: Arc<S>,
    config: LimiterConfig,
    keys: KeyDeriver,
}

impl<S: TrackerStore> AdmissionController<S> {
    /// Create a controller with un-namespaced keys.
    pub fn new(store: Arc<S>, config: LimiterConfig) -> Self {
        Self::with_keys(store, config, KeyDeriver::new())
    }

    pub fn with_keys(store: Arc<S>, config: LimiterConfig, keys: KeyDeriver) -> Self {
        Self {
            store,
            config,
            keys,
        }
    }

    pub fn config(&self) -> &LimiterConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Decide whether `identity` may access `resource` at `now`.
    ///
    /// Dropping the returned future abandons the backend call; a transactional
    /// store then commits nothing.
    pub async fn admit(&self, identity: &str, resource: &str, now: DateTime<Utc>) -> Outcome {
        match self.round_trip(identity, resource, now).await {
            Ok(verdict) => verdict.into(),
            Err(e) => self.on_storage_failure(identity, resource, e),
        }
    }

    /// Like [`admit`](Self::admit), but gives up on the backend after `deadline`.
    ///
    /// An expired deadline is a storage failure and follows the configured
    /// failure policy.
    pub async fn admit_within(
        &self,
        identity: &str,
        resource: &str,
        now: DateTime<Utc>,
        deadline: Duration,
    ) -> Outcome {
        match tokio::time::timeout(deadline, self.round_trip(identity, resource, now)).await {
            Ok(Ok(verdict)) => verdict.into(),
            Ok(Err(e)) => self.on_storage_failure(identity, resource, e),
            Err(_) => self.on_storage_failure(identity, resource, StorageError::DeadlineExceeded),
        }
    }

    async fn round_trip(
        &self,
        identity: &str,
        resource: &str,
        now: DateTime<Utc>,
    ) -> Result<Verdict, StorageError> {
        let key = self.keys.derive(identity, resource);
        let now_millis = now.timestamp_millis();
        let fresh = Tracker::fresh(identity, resource, now_millis, &self.config);

        trace!(
            key = %key,
            identity = %identity,
            resource = %resource,
            "Checking admission"
        );

        // Replays after a conflict see the wall time that has passed since the first attempt.
        let started = Instant::now();
        let attempts = AtomicU32::new(0);
        let config = &self.config;
        let decide = move |tracker: Tracker| {
            let at = if attempts.fetch_add(1, Ordering::Relaxed) == 0 {
                now_millis
            } else {
                let elapsed = i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX);
                now_millis.saturating_add(elapsed)
            };
            evaluate(tracker, at, config)
        };

        let decision = self
            .store
            .load_and_commit(&key, &fresh, self.config.expiration(), &decide)
            .await?;

        match decision.verdict {
            Verdict::Accepted => trace!(
                key = %key,
                window_count = decision.tracker.window_count,
                window_index = decision.tracker.window_index,
                "Request admitted"
            ),
            Verdict::TooFast => debug!(
                key = %key,
                identity = %identity,
                resource = %resource,
                min_interval_ms = self.config.min_request_interval_millis(),
                "Request too fast"
            ),
            Verdict::TooFrequent => debug!(
                key = %key,
                identity = %identity,
                resource = %resource,
                window_count = decision.tracker.window_count,
                limit = self.config.max_requests_per_window(),
                "Request too frequent"
            ),
        }

        Ok(decision.verdict)
    }

    fn on_storage_failure(&self, identity: &str, resource: &str, e: StorageError) -> Outcome {
        if self.config.abort_on_storage_failure() {
            error!(
                identity = %identity,
                resource = %resource,
                error = %e,
                transient = e.is_transient(),
                "Tracker store failed, rejecting request"
            );
            Outcome::StorageFailed(e)
        } else {
            warn!(
                identity = %identity,
                resource = %resource,
                error = %e,
                transient = e.is_transient(),
                "Tracker store failed, admitting request"
            );
            Outcome::Admitted
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::limits::LimiterSettings;
    use crate::admission::Decision;
    use crate::store::{
        BestEffortStore, DecideFn, MemoryDocumentStore, MemoryHashStore, RetryPolicy,
        TransactionalStore,
    };
    use async_trait::async_trait;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_000).unwrap()
    }

    fn after(millis: i64) -> DateTime<Utc> {
        t0() + chrono::Duration::milliseconds(millis)
    }

    fn config(interval: i64, window: i64, max: i64, abort: bool) -> LimiterConfig {
        LimiterConfig::new(&LimiterSettings {
            min_request_interval_millis: interval,
            window_size_millis: window,
            max_requests_per_window: max,
            abort_on_storage_failure: abort,
            ..Default::default()
        })
        .unwrap()
    }

    fn transactional(
        config: LimiterConfig,
    ) -> AdmissionController<TransactionalStore<MemoryDocumentStore>> {
        AdmissionController::new(
            Arc::new(TransactionalStore::new(MemoryDocumentStore::new())),
            config,
        )
    }

    fn stored(
        controller: &AdmissionController<TransactionalStore<MemoryDocumentStore>>,
        identity: &str,
        resource: &str,
    ) -> serde_json::Value {
        let key = KeyDeriver::new().derive(identity, resource);
        controller.store().backend().document(key.as_str()).unwrap()
    }

    #[tokio::test]
    async fn test_first_request_admitted() {
        let controller = transactional(config(200, 60_000, 10, false));

        let outcome = controller.admit("u1", "/a", t0()).await;
        assert_eq!(outcome, Outcome::Admitted);

        let doc = stored(&controller, "u1", "/a");
        assert_eq!(doc["windowCount"], 1);
        assert_eq!(doc["lastAcceptedAtMillis"], t0().timestamp_millis());
    }

    #[tokio::test]
    async fn test_second_request_too_fast() {
        let controller = transactional(config(200, 60_000, 10, false));

        assert_eq!(controller.admit("u1", "/a", t0()).await, Outcome::Admitted);
        assert_eq!(
            controller.admit("u1", "/a", after(50)).await,
            Outcome::RejectedTooFast
        );

        let doc = stored(&controller, "u1", "/a");
        assert_eq!(doc["lastAcceptedAtMillis"], t0().timestamp_millis());
        assert_eq!(doc["windowCount"], 1);
    }

    #[tokio::test]
    async fn test_window_exceeded_then_rollover() {
        let controller = transactional(config(0, 10_000, 1, false));

        assert_eq!(controller.admit("u1", "/a", t0()).await, Outcome::Admitted);
        assert_eq!(
            controller.admit("u1", "/a", after(3_000)).await,
            Outcome::RejectedTooFrequent
        );
        let first_index = stored(&controller, "u1", "/a")["windowIndex"]
            .as_i64()
            .unwrap();

        assert_eq!(
            controller.admit("u1", "/a", after(10_500)).await,
            Outcome::Admitted
        );
        let doc = stored(&controller, "u1", "/a");
        assert_eq!(doc["windowCount"], 1);
        assert!(doc["windowIndex"].as_i64().unwrap() > first_index);
    }

    #[tokio::test]
    async fn test_quota_boundary() {
        let controller = transactional(config(0, 60_000, 5, false));

        for i in 0..5 {
            assert_eq!(
                controller.admit("u1", "/a", after(i)).await,
                Outcome::Admitted,
                "request {} should be admitted",
                i + 1
            );
        }
        assert_eq!(
            controller.admit("u1", "/a", after(5)).await,
            Outcome::RejectedTooFrequent
        );
    }

    #[tokio::test]
    async fn test_pairs_are_tracked_separately() {
        let controller = transactional(config(200, 60_000, 10, false));

        assert!(controller.admit("u1", "/a", t0()).await.is_admitted());
        assert!(controller.admit("u1", "/b", t0()).await.is_admitted());
        assert!(controller.admit("u2", "/a", t0()).await.is_admitted());
        assert_eq!(controller.store().backend().len(), 3);
    }

    #[tokio::test]
    async fn test_fail_open_by_default() {
        let backend = MemoryDocumentStore::new();
        backend.set_unavailable(true);
        let controller = AdmissionController::new(
            Arc::new(TransactionalStore::new(backend)),
            config(200, 60_000, 10, false),
        );

        assert_eq!(controller.admit("u1", "/a", t0()).await, Outcome::Admitted);
        assert_eq!(controller.admit("u1", "/a", after(1)).await, Outcome::Admitted);
    }

    #[tokio::test]
    async fn test_fail_closed_when_configured() {
        let backend = MemoryHashStore::new();
        backend.set_unavailable(true);
        let controller = AdmissionController::new(
            Arc::new(BestEffortStore::new(backend)),
            config(200, 60_000, 10, true),
        );

        let outcome = controller.admit("u1", "/a", t0()).await;
        assert!(matches!(outcome, Outcome::StorageFailed(StorageError::Unavailable(_))));
        assert_eq!(outcome.status_code(), 500);
    }

    #[tokio::test]
    async fn test_exhausted_conflicts_are_transient() {
        let backend = MemoryDocumentStore::new();
        backend.fail_next_commits(10);
        let controller = AdmissionController::new(
            Arc::new(TransactionalStore::with_retry(
                backend,
                RetryPolicy {
                    max_attempts: 2,
                    backoff_millis: 0,
                },
            )),
            config(200, 60_000, 10, true),
        );

        match controller.admit("u1", "/a", t0()).await {
            Outcome::StorageFailed(e) => assert!(e.is_transient()),
            other => panic!("expected storage failure, got {:?}", other),
        }
    }

    struct Stalled;

    #[async_trait]
    impl TrackerStore for Stalled {
        async fn load_and_commit(
            &self,
            _key: &crate::admission::TrackerKey,
            _fresh: &Tracker,
            _ttl: Duration,
            _decide: &DecideFn<'_>,
        ) -> Result<Decision, StorageError> {
            futures::future::pending().await
        }
    }

    /// Runs `decide` twice with a pause in between, as a store replaying a
    /// conflicted transaction would.
    #[derive(Default)]
    struct Replaying {
        decisions: parking_lot::Mutex<Vec<Decision>>,
    }

    #[async_trait]
    impl TrackerStore for Replaying {
        async fn load_and_commit(
            &self,
            _key: &crate::admission::TrackerKey,
            fresh: &Tracker,
            _ttl: Duration,
            decide: &DecideFn<'_>,
        ) -> Result<Decision, StorageError> {
            let first = decide(fresh.clone());
            tokio::time::sleep(Duration::from_millis(30)).await;
            let second = decide(fresh.clone());
            let mut decisions = self.decisions.lock();
            decisions.push(first);
            decisions.push(second.clone());
            Ok(second)
        }
    }

    #[tokio::test]
    async fn test_replay_sees_advanced_time() {
        let store = Arc::new(Replaying::default());
        let controller = AdmissionController::new(store.clone(), config(200, 60_000, 10, false));

        assert_eq!(controller.admit("u1", "/a", t0()).await, Outcome::Admitted);

        let decisions = store.decisions.lock();
        assert_eq!(decisions.len(), 2);
        assert_eq!(
            decisions[0].tracker.last_accepted_at_millis,
            t0().timestamp_millis()
        );
        assert!(decisions[1].tracker.last_accepted_at_millis >= after(30).timestamp_millis());
    }

    #[tokio::test]
    async fn test_deadline_follows_failure_policy() {
        let closed = AdmissionController::new(Arc::new(Stalled), config(200, 60_000, 10, true));
        let outcome = closed
            .admit_within("u1", "/a", t0(), Duration::from_millis(20))
            .await;
        assert_eq!(outcome, Outcome::StorageFailed(StorageError::DeadlineExceeded));

        let open = AdmissionController::new(Arc::new(Stalled), config(200, 60_000, 10, false));
        let outcome = open
            .admit_within("u1", "/a", t0(), Duration::from_millis(20))
            .await;
        assert_eq!(outcome, Outcome::Admitted);
    }

    #[tokio::test]
    async fn test_best_effort_controller_scenarios() {
        let controller = AdmissionController::new(
            Arc::new(BestEffortStore::new(MemoryHashStore::new())),
            config(0, 10_000, 1, false),
        );

        assert_eq!(controller.admit("u1", "/a", t0()).await, Outcome::Admitted);
        assert_eq!(
            controller.admit("u1", "/a", after(10)).await,
            Outcome::RejectedTooFrequent
        );
        assert_eq!(
            controller.admit("u1", "/a", after(10_010)).await,
            Outcome::Admitted
        );

        let key = KeyDeriver::new().derive("u1", "/a");
        let fields = controller.store().backend().fields(key.as_str()).unwrap();
        assert_eq!(fields["winReq"], "1");
    }

    #[tokio::test]
    async fn test_best_effort_ttl_follows_expiration() {
        let short = LimiterConfig::new(&LimiterSettings {
            expiration_seconds: 10,
            ..Default::default()
        })
        .unwrap();
        let store = Arc::new(BestEffortStore::new(MemoryHashStore::new()));
        let controller = AdmissionController::new(store.clone(), short);
        let long = AdmissionController::new(store.clone(), LimiterConfig::default());

        assert!(controller.admit("u1", "/a", t0()).await.is_admitted());
        assert!(long.admit("u1", "/b", t0()).await.is_admitted());

        let keys = KeyDeriver::new();
        let ttl = store.backend().ttl(keys.derive("u1", "/a").as_str()).unwrap();
        assert!(ttl <= Duration::from_secs(10));
        assert!(ttl > Duration::from_secs(9));

        let fields = store.backend().fields(keys.derive("u1", "/a").as_str()).unwrap();
        assert_eq!(fields["exp"], after(10_000).timestamp_millis().to_string());

        let ttl = store.backend().ttl(keys.derive("u1", "/b").as_str()).unwrap();
        assert!(ttl > Duration::from_secs(3590));
    }

    #[tokio::test]
    async fn test_concurrent_admissions_respect_quota() {
        let controller = Arc::new(AdmissionController::new(
            Arc::new(TransactionalStore::with_retry(
                MemoryDocumentStore::new(),
                RetryPolicy {
                    max_attempts: 20,
                    backoff_millis: 1,
                },
            )),
            config(0, 60_000, 5, true),
        ));

        let tasks = (0..20).map(|i| {
            let controller = controller.clone();
            tokio::spawn(async move { controller.admit("u1", "/a", after(i)).await })
        });
        let outcomes: Vec<Outcome> = futures::future::join_all(tasks)
            .await
            .into_iter()
            .map(|joined| joined.unwrap())
            .collect();

        let admitted = outcomes.iter().filter(|o| o.is_admitted()).count();
        assert!(admitted <= 5, "admitted {} requests", admitted);
        assert!(admitted >= 1);
    }

    #[test]
    fn test_outcome_mapping() {
        assert_eq!(Outcome::Admitted.status_code(), 200);
        assert_eq!(Outcome::RejectedTooFast.status_code(), 425);
        assert_eq!(Outcome::RejectedTooFrequent.status_code(), 429);
        assert_eq!(
            serde_json::to_string(&Outcome::RejectedTooFast).unwrap(),
            "\"too_fast\""
        );
        assert_eq!(Outcome::from(Verdict::TooFrequent), Outcome::RejectedTooFrequent);
    }
}
