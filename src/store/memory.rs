//! In-memory wire clients.
//!
//! These stand in for a document database and a key-value server in tests and
//! in the bundled binary. Both can be told to fail so that the admission
//! controller's failure policy can be exercised.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::trace;

use super::best_effort::{HashBackend, HashFields};
use super::transactional::{DocumentBackend, DocumentTransaction};
use crate::error::StorageError;

#[derive(Debug, Clone)]
struct StoredDocument {
    document: Value,
    version: u64,
    expires_at_millis: i64,
}

#[derive(Debug, Default)]
struct DocumentState {
    documents: Mutex<HashMap<String, StoredDocument>>,
    next_version: AtomicU64,
    unavailable: AtomicBool,
    forced_conflicts: AtomicU32,
}

/// An in-memory document database with optimistic serializable transactions.
///
/// Each committed write bumps the document's version. A transaction remembers
/// the version of every document it read and refuses to commit if any of them
/// moved in the meantime. Clones share the same data.
#[derive(Debug, Clone, Default)]
pub struct MemoryDocumentStore {
    state: Arc<DocumentState>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `begin` fail until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make the next `count` commits fail with a conflict.
    pub fn fail_next_commits(&self, count: u32) {
        self.state.forced_conflicts.store(count, Ordering::SeqCst);
    }

    /// The committed document under `key`.
    pub fn document(&self, key: &str) -> Option<Value> {
        self.state
            .documents
            .lock()
            .get(key)
            .map(|stored| stored.document.clone())
    }

    /// Store a document directly, bypassing transactions.
    pub fn insert_raw(&self, key: &str, document: Value) {
        let version = self.state.next_version.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.documents.lock().insert(
            key.to_string(),
            StoredDocument {
                document,
                version,
                expires_at_millis: i64::MAX,
            },
        );
    }

    /// Reclaim documents whose expiry is at or before `now_millis`.
    ///
    /// Returns the number of documents removed.
    pub fn purge_expired(&self, now_millis: i64) -> usize {
        let mut documents = self.state.documents.lock();
        let before = documents.len();
        documents.retain(|_, stored| stored.expires_at_millis > now_millis);
        before - documents.len()
    }

    pub fn len(&self) -> usize {
        self.state.documents.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A transaction against a [`MemoryDocumentStore`].
#[derive(Debug)]
pub struct MemoryTransaction {
    state: Arc<DocumentState>,
    /// Version observed for each key read, `None` when the key was absent.
    reads: HashMap<String, Option<u64>>,
    writes: Vec<(String, Value, i64)>,
}

#[async_trait]
impl DocumentBackend for MemoryDocumentStore {
    type Transaction = MemoryTransaction;

    async fn begin(&self) -> Result<MemoryTransaction, StorageError> {
        if self.state.unavailable.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable(
                "document store is unavailable".to_string(),
            ));
        }
        Ok(MemoryTransaction {
            state: self.state.clone(),
            reads: HashMap::new(),
            writes: Vec::new(),
        })
    }
}

#[async_trait]
impl DocumentTransaction for MemoryTransaction {
    async fn get(&mut self, key: &str) -> Result<Option<Value>, StorageError> {
        let documents = self.state.documents.lock();
        let stored = documents.get(key);
        self.reads
            .insert(key.to_string(), stored.map(|stored| stored.version));
        Ok(stored.map(|stored| stored.document.clone()))
    }

    fn put(&mut self, key: &str, document: Value, expires_at_millis: i64) {
        self.writes
            .push((key.to_string(), document, expires_at_millis));
    }

    async fn commit(&mut self) -> Result<(), StorageError> {
        let forced = self
            .state
            .forced_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if forced {
            self.writes.clear();
            return Err(StorageError::Conflict);
        }

        let mut documents = self.state.documents.lock();
        let stale = self.reads.iter().any(|(key, seen)| {
            documents.get(key).map(|stored| stored.version) != *seen
        });
        if stale {
            trace!(reads = self.reads.len(), "Memory transaction conflicted");
            self.writes.clear();
            return Err(StorageError::Conflict);
        }

        for (key, document, expires_at_millis) in self.writes.drain(..) {
            let version = self.state.next_version.fetch_add(1, Ordering::SeqCst) + 1;
            documents.insert(
                key,
                StoredDocument {
                    document,
                    version,
                    expires_at_millis,
                },
            );
        }
        Ok(())
    }

    async fn rollback(&mut self) {
        self.writes.clear();
    }
}

#[derive(Debug, Clone)]
struct HashEntry {
    fields: HashFields,
    expires_at: Option<Instant>,
}

/// An in-memory hash store with per-key time-to-live, shaped like a
/// key-value server's hash commands. Clones share the same data.
#[derive(Debug, Clone, Default)]
pub struct MemoryHashStore {
    entries: Arc<DashMap<String, HashEntry>>,
    unavailable: Arc<AtomicBool>,
    failing_writes: Arc<AtomicBool>,
}

impl MemoryHashStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every read and write fail until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make writes fail while reads keep working.
    pub fn set_failing_writes(&self, failing: bool) {
        self.failing_writes.store(failing, Ordering::SeqCst);
    }

    /// The fields stored under `key`.
    pub fn fields(&self, key: &str) -> Option<HashFields> {
        self.entries.get(key).map(|entry| entry.fields.clone())
    }

    /// Remaining time-to-live of `key`, `None` when absent or without expiry.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        self.entries
            .get(key)
            .and_then(|entry| entry.expires_at)
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// Store fields directly.
    pub fn insert_raw(&self, key: &str, fields: HashFields) {
        self.entries.insert(
            key.to_string(),
            HashEntry {
                fields,
                expires_at: None,
            },
        );
    }

    /// Reclaim entries whose time-to-live ran out at or before `now`.
    ///
    /// Returns the number of entries removed.
    pub fn purge_expired(&self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| entry.expires_at.map_or(true, |at| at > now));
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn check_available(&self) -> Result<(), StorageError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable(
                "hash store is unavailable".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl HashBackend for MemoryHashStore {
    async fn get_all(&self, key: &str) -> Result<HashFields, StorageError> {
        self.check_available()?;
        Ok(self.fields(key).unwrap_or_default())
    }

    async fn set_all(
        &self,
        key: &str,
        fields: HashFields,
        ttl: Duration,
    ) -> Result<(), StorageError> {
        self.check_available()?;
        if self.failing_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Backend("hash write rejected".to_string()));
        }

        let mut entry = self.entries.entry(key.to_string()).or_insert_with(|| HashEntry {
            fields: HashFields::new(),
            expires_at: None,
        });
        entry.fields.extend(fields);
        if !ttl.is_zero() {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }
}
