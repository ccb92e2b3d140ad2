//! Tracker store over a transactional document backend.
//!
//! Every round trip runs inside one backend transaction. The updated tracker is
//! written only when the request is accepted; rejections roll back without a
//! write. Two concurrent round trips on the same key cannot both commit from
//! the same snapshot: the loser sees [`StorageError::Conflict`] and is replayed
//! from a fresh read, up to [`RetryPolicy::max_attempts`] times.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, trace, warn};

use super::{DecideFn, TrackerStore};
use crate::admission::{Decision, Tracker, TrackerKey};
use crate::error::StorageError;

/// Wire client for a document database with serializable transactions.
#[async_trait]
pub trait DocumentBackend: Send + Sync {
    type Transaction: DocumentTransaction;

    /// Begin a new transaction.
    async fn begin(&self) -> Result<Self::Transaction, StorageError>;
}

/// A single backend transaction.
///
/// Writes are buffered until [`commit`](Self::commit). A transaction dropped
/// before commit must leave the backend untouched.
#[async_trait]
pub trait DocumentTransaction: Send {
    /// Read the document stored under `key`, or `None` when there is none.
    async fn get(&mut self, key: &str) -> Result<Option<Value>, StorageError>;

    /// Stage a write of `document` under `key`, reclaimable after `expires_at_millis`.
    fn put(&mut self, key: &str, document: Value, expires_at_millis: i64);

    /// Apply staged writes atomically.
    ///
    /// Fails with [`StorageError::Conflict`] if anything this transaction read
    /// was changed by another committed transaction.
    async fn commit(&mut self) -> Result<(), StorageError>;

    /// Discard staged writes.
    async fn rollback(&mut self);
}

/// Replay policy for conflicting transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Base pause before a replay; grows linearly with the attempt number.
    pub backoff_millis: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_millis: 10,
        }
    }
}

impl RetryPolicy {
    /// A policy that never replays.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            backoff_millis: 0,
        }
    }

    /// Pause before replay number `attempt` (1-based), with up to 50% random jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.backoff_millis.saturating_mul(attempt as u64);
        if base == 0 {
            return Duration::ZERO;
        }
        let jitter = rand::thread_rng().gen_range(0..=base / 2);
        Duration::from_millis(base.saturating_add(jitter))
    }
}

/// Document encoding of a [`Tracker`].
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TrackerDocument {
    identity: String,
    resource: String,
    window_index: i64,
    window_count: u64,
    last_accepted_at_millis: i64,
    expires_at_millis: i64,
}

impl From<&Tracker> for TrackerDocument {
    fn from(tracker: &Tracker) -> Self {
        Self {
            identity: tracker.identity.clone(),
            resource: tracker.resource.clone(),
            window_index: tracker.window_index,
            window_count: tracker.window_count,
            last_accepted_at_millis: tracker.last_accepted_at_millis,
            expires_at_millis: tracker.expires_at_millis,
        }
    }
}

impl From<TrackerDocument> for Tracker {
    fn from(doc: TrackerDocument) -> Self {
        Self {
            identity: doc.identity,
            resource: doc.resource,
            window_index: doc.window_index,
            window_count: doc.window_count,
            last_accepted_at_millis: doc.last_accepted_at_millis,
            expires_at_millis: doc.expires_at_millis,
        }
    }
}

/// A [`TrackerStore`] over a [`DocumentBackend`].
pub struct TransactionalStore<B: DocumentBackend> {
    backend: B,
    retry: RetryPolicy,
}

impl<B: DocumentBackend> TransactionalStore<B> {
    /// Create a store with the default retry policy.
    pub fn new(backend: B) -> Self {
        Self::with_retry(backend, RetryPolicy::default())
    }

    pub fn with_retry(backend: B, retry: RetryPolicy) -> Self {
        Self {
            backend,
            retry: RetryPolicy {
                max_attempts: retry.max_attempts.max(1),
                ..retry
            },
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    async fn attempt(
        &self,
        key: &TrackerKey,
        fresh: &Tracker,
        decide: &DecideFn<'_>,
    ) -> Result<Decision, StorageError> {
        let mut tx = self.backend.begin().await?;

        let document = match tx.get(key.as_str()).await {
            Ok(document) => document,
            Err(e) => {
                tx.rollback().await;
                return Err(e);
            }
        };
        let tracker = decode(key, document, fresh);

        let decision = decide(tracker);
        if !decision.is_accepted() {
            tx.rollback().await;
            return Ok(decision);
        }

        let document = match serde_json::to_value(TrackerDocument::from(&decision.tracker)) {
            Ok(document) => document,
            Err(e) => {
                tx.rollback().await;
                return Err(StorageError::Backend(e.to_string()));
            }
        };
        tx.put(key.as_str(), document, decision.tracker.expires_at_millis);
        tx.commit().await?;

        Ok(decision)
    }
}

fn decode(key: &TrackerKey, document: Option<Value>, fresh: &Tracker) -> Tracker {
    match document {
        None => {
            trace!(key = %key, "Tracker not found, starting fresh");
            fresh.clone()
        }
        Some(document) => match serde_json::from_value::<TrackerDocument>(document) {
            Ok(doc) => doc.into(),
            Err(e) => {
                warn!(key = %key, error = %e, "Tracker document unreadable, starting fresh");
                fresh.clone()
            }
        },
    }
}

#[async_trait]
impl<B: DocumentBackend> TrackerStore for TransactionalStore<B> {
    async fn load_and_commit(
        &self,
        key: &TrackerKey,
        fresh: &Tracker,
        _ttl: Duration,
        decide: &DecideFn<'_>,
    ) -> Result<Decision, StorageError> {
        // Expiry travels inside the document as `expiresAtMillis`.
        let mut attempt = 1;
        loop {
            match self.attempt(key, fresh, decide).await {
                Err(StorageError::Conflict) if attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay(attempt);
                    debug!(
                        key = %key,
                        attempt = attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Tracker transaction conflicted, replaying"
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    attempt += 1;
                }
                Err(StorageError::Conflict) => {
                    warn!(key = %key, attempts = attempt, "Tracker transaction kept conflicting");
                    return Err(StorageError::Conflict);
                }
                result => return result,
            }
        }
    }
}
