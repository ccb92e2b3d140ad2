//! Tracker persistence.
//!
//! A [`TrackerStore`] runs one load-decide-store round trip against a shared
//! backend. Two strategies are provided: [`TransactionalStore`] serializes
//! concurrent round trips through the backend's transactions, while
//! [`BestEffortStore`] trades that guarantee for a single read and a pipelined
//! write.

mod best_effort;
mod memory;
mod transactional;

pub use best_effort::{BestEffortStore, HashBackend, HashFields};
pub use memory::{MemoryDocumentStore, MemoryHashStore, MemoryTransaction};
pub use transactional::{DocumentBackend, DocumentTransaction, RetryPolicy, TransactionalStore};

use std::time::Duration;

use async_trait::async_trait;

use crate::admission::{Decision, Tracker, TrackerKey};
use crate::error::StorageError;

/// The decision step a store runs between loading and storing a tracker.
///
/// A store may call it more than once when it has to replay a conflicting
/// transaction; every call receives freshly loaded state.
pub type DecideFn<'a> = dyn Fn(Tracker) -> Decision + Send + Sync + 'a;

/// Trait for tracker store implementations.
///
/// This trait abstracts over the transactional and best-effort strategies so
/// the admission controller is written once against either.
#[async_trait]
pub trait TrackerStore: Send + Sync {
    /// Load the tracker under `key`, run `decide` on it, and persist the result
    /// according to the strategy.
    ///
    /// A missing or unreadable record is replaced by `fresh`, never reported as
    /// an error. `ttl` is the lifetime of the written record in backends that
    /// expire keys themselves.
    async fn load_and_commit(
        &self,
        key: &TrackerKey,
        fresh: &Tracker,
        ttl: Duration,
        decide: &DecideFn<'_>,
    ) -> Result<Decision, StorageError>;
}
