//! Tracker store over a key-value backend without transactions.
//!
//! One read, one decision, one pipelined write. The write happens whatever the
//! verdict, so the rolled window and the incremented count of a rejected
//! request are kept, and the record's time-to-live is refreshed.
//!
//! # Known limitation
//!
//! Nothing serializes concurrent round trips on the same key. Two requests can
//! read the same snapshot, both be accepted, and both write; under high
//! concurrency the number of accepted requests in a window can exceed the
//! configured maximum by a small margin. Use [`TransactionalStore`] where the
//! limit must hold exactly.
//!
//! [`TransactionalStore`]: super::TransactionalStore

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{trace, warn};

use super::{DecideFn, TrackerStore};
use crate::admission::{Decision, Tracker, TrackerKey};
use crate::error::StorageError;

/// Field/value pairs of one hash record.
pub type HashFields = HashMap<String, String>;

const FIELD_IDENTITY: &str = "uid";
const FIELD_RESOURCE: &str = "url";
const FIELD_WINDOW_INDEX: &str = "winNum";
const FIELD_WINDOW_COUNT: &str = "winReq";
const FIELD_LAST_ACCEPTED: &str = "last";
const FIELD_EXPIRES_AT: &str = "exp";

/// Wire client for a key-value server with hash records.
#[async_trait]
pub trait HashBackend: Send + Sync {
    /// All fields stored under `key`; empty when the key does not exist.
    async fn get_all(&self, key: &str) -> Result<HashFields, StorageError>;

    /// Set `fields` under `key` and refresh its time-to-live in a single
    /// pipelined round trip. A zero `ttl` leaves the expiry unchanged.
    async fn set_all(&self, key: &str, fields: HashFields, ttl: Duration)
        -> Result<(), StorageError>;
}

/// A [`TrackerStore`] over a [`HashBackend`].
pub struct BestEffortStore<B: HashBackend> {
    backend: B,
}

impl<B: HashBackend> BestEffortStore<B> {
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }
}

fn encode(tracker: &Tracker) -> HashFields {
    HashFields::from([
        (FIELD_IDENTITY.to_string(), tracker.identity.clone()),
        (FIELD_RESOURCE.to_string(), tracker.resource.clone()),
        (FIELD_WINDOW_INDEX.to_string(), tracker.window_index.to_string()),
        (FIELD_WINDOW_COUNT.to_string(), tracker.window_count.to_string()),
        (
            FIELD_LAST_ACCEPTED.to_string(),
            tracker.last_accepted_at_millis.to_string(),
        ),
        (FIELD_EXPIRES_AT.to_string(), tracker.expires_at_millis.to_string()),
    ])
}

fn decode(fields: &HashFields) -> Option<Tracker> {
    Some(Tracker {
        identity: fields.get(FIELD_IDENTITY)?.clone(),
        resource: fields.get(FIELD_RESOURCE)?.clone(),
        window_index: fields.get(FIELD_WINDOW_INDEX)?.parse().ok()?,
        window_count: fields.get(FIELD_WINDOW_COUNT)?.parse().ok()?,
        last_accepted_at_millis: fields.get(FIELD_LAST_ACCEPTED)?.parse().ok()?,
        expires_at_millis: fields.get(FIELD_EXPIRES_AT)?.parse().ok()?,
    })
}

#[async_trait]
impl<B: HashBackend> TrackerStore for BestEffortStore<B> {
    async fn load_and_commit(
        &self,
        key: &TrackerKey,
        fresh: &Tracker,
        ttl: Duration,
        decide: &DecideFn<'_>,
    ) -> Result<Decision, StorageError> {
        let fields = self.backend.get_all(key.as_str()).await?;

        let tracker = if fields.is_empty() {
            trace!(key = %key, "Tracker not found, starting fresh");
            fresh.clone()
        } else {
            decode(&fields).unwrap_or_else(|| {
                warn!(key = %key, fields = fields.len(), "Tracker record unreadable, starting fresh");
                fresh.clone()
            })
        };

        let decision = decide(tracker);

        match self
            .backend
            .set_all(key.as_str(), encode(&decision.tracker), ttl)
            .await
        {
            Ok(()) => Ok(decision),
            Err(e) if decision.is_accepted() => Err(e),
            Err(e) => {
                warn!(
                    key = %key,
                    verdict = ?decision.verdict,
                    error = %e,
                    "Failed to record rejected request"
                );
                Ok(decision)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::{evaluate, KeyDeriver, LimiterConfig, LimiterSettings, Verdict};
    use crate::store::MemoryHashStore;
    use parking_lot::Mutex;
    use tokio_test::{assert_err, assert_ok};

    const T0: i64 = 1_700_000_000_000;

    fn config(interval: i64, window: i64, max: i64) -> LimiterConfig {
        LimiterConfig::new(&LimiterSettings {
            min_request_interval_millis: interval,
            window_size_millis: window,
            max_requests_per_window: max,
            ..Default::default()
        })
        .unwrap()
    }

    fn key() -> TrackerKey {
        KeyDeriver::new().derive("u1", "/a")
    }

    async fn round_trip<S: TrackerStore>(
        store: &S,
        now: i64,
        config: &LimiterConfig,
    ) -> Result<Decision, StorageError> {
        let fresh = Tracker::fresh("u1", "/a", now, config);
        let decide = |tracker: Tracker| evaluate(tracker, now, config);
        store
            .load_and_commit(&key(), &fresh, config.expiration(), &decide)
            .await
    }

    fn store() -> BestEffortStore<MemoryHashStore> {
        BestEffortStore::new(MemoryHashStore::new())
    }

    #[test]
    fn test_field_encoding() {
        let mut tracker = Tracker::fresh("u1", "/a", T0, &LimiterConfig::default());
        tracker.window_count = 3;
        let fields = encode(&tracker);
        assert_eq!(fields["uid"], "u1");
        assert_eq!(fields["winReq"], "3");
        assert_eq!(decode(&fields), Some(tracker));
    }

    #[tokio::test]
    async fn test_accept_is_persisted_with_ttl() {
        let store = store();
        let config = config(200, 60_000, 10);

        let decision = assert_ok!(round_trip(&store, T0, &config).await);
        assert_eq!(decision.verdict, Verdict::Accepted);

        let fields = store.backend().fields(key().as_str()).unwrap();
        assert_eq!(fields["winReq"], "1");
        assert_eq!(fields["last"], T0.to_string());
        let ttl = store.backend().ttl(key().as_str()).unwrap();
        assert!(ttl <= Duration::from_secs(3600));
        assert!(ttl > Duration::from_secs(3590));
    }

    #[tokio::test]
    async fn test_too_frequent_count_is_persisted() {
        let store = store();
        let config = config(0, 10_000, 1);

        assert_ok!(round_trip(&store, T0, &config).await);
        let decision = assert_ok!(round_trip(&store, T0 + 10, &config).await);
        assert_eq!(decision.verdict, Verdict::TooFrequent);

        let fields = store.backend().fields(key().as_str()).unwrap();
        assert_eq!(fields["winReq"], "2");
        assert_eq!(fields["last"], T0.to_string());

        let decision = assert_ok!(round_trip(&store, T0 + 20, &config).await);
        assert_eq!(decision.verdict, Verdict::TooFrequent);
        let fields = store.backend().fields(key().as_str()).unwrap();
        assert_eq!(fields["winReq"], "3");
    }

    #[tokio::test]
    async fn test_too_fast_rewrites_unchanged_tracker() {
        let store = store();
        let config = config(200, 60_000, 10);

        assert_ok!(round_trip(&store, T0, &config).await);
        let before = store.backend().fields(key().as_str());

        let decision = assert_ok!(round_trip(&store, T0 + 50, &config).await);
        assert_eq!(decision.verdict, Verdict::TooFast);
        assert_eq!(store.backend().fields(key().as_str()), before);
    }

    #[tokio::test]
    async fn test_unreadable_record_starts_fresh() {
        let store = store();
        store.backend().insert_raw(
            key().as_str(),
            HashFields::from([("winReq".to_string(), "lots".to_string())]),
        );
        let config = config(200, 60_000, 10);

        let decision = assert_ok!(round_trip(&store, T0, &config).await);
        assert!(decision.is_accepted());
        assert_eq!(decision.tracker.window_count, 1);
    }

    #[tokio::test]
    async fn test_write_failure_on_accept_is_an_error() {
        let store = store();
        store.backend().set_failing_writes(true);
        let config = config(200, 60_000, 10);

        assert_err!(round_trip(&store, T0, &config).await);
    }

    #[tokio::test]
    async fn test_write_failure_on_rejection_keeps_rejection() {
        let store = store();
        let config = config(200, 60_000, 10);
        assert_ok!(round_trip(&store, T0, &config).await);

        store.backend().set_failing_writes(true);
        let decision = assert_ok!(round_trip(&store, T0 + 10, &config).await);
        assert_eq!(decision.verdict, Verdict::TooFast);
    }

    /// Serves every read from a snapshot taken before any write, the way two
    /// racing requests both see the state preceding each other's write.
    struct StaleReads {
        inner: MemoryHashStore,
        snapshot: Mutex<Option<HashFields>>,
    }

    #[async_trait]
    impl HashBackend for StaleReads {
        async fn get_all(&self, key: &str) -> Result<HashFields, StorageError> {
            let current = self.inner.get_all(key).await?;
            Ok(self.snapshot.lock().get_or_insert(current).clone())
        }

        async fn set_all(
            &self,
            key: &str,
            fields: HashFields,
            ttl: Duration,
        ) -> Result<(), StorageError> {
            self.inner.set_all(key, fields, ttl).await
        }
    }

    #[tokio::test]
    async fn test_racing_requests_can_exceed_quota() {
        let store = BestEffortStore::new(StaleReads {
            inner: MemoryHashStore::new(),
            snapshot: Mutex::new(None),
        });
        let config = config(0, 60_000, 1);

        let first = assert_ok!(round_trip(&store, T0, &config).await);
        let second = assert_ok!(round_trip(&store, T0 + 1, &config).await);
        assert!(first.is_accepted());
        assert!(second.is_accepted());
    }
}
