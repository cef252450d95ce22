//! Size- and TTL-bounded replicated store with rate-limited persistence.

use crate::errors::NetworkError;
use crate::record::{Record, RecordKey, DEFAULT_MAX_RECORDS};
use common::time::now_millis;
use persistence::{Persistence, PersistenceService, RateLimiter};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tracing::{debug, warn};

/// TTL- and size-bounded map of one record class.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ReplicatedStore {
    /// Live records by content key
    map: HashMap<RecordKey, Record>,
    /// Cached class bound, derived lazily from the first record seen
    #[serde(skip)]
    cached_max: Option<usize>,
}

impl ReplicatedStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// The class bound: derived from the first record encountered and cached
    /// for the life of the instance; an empty store falls back to
    /// [`DEFAULT_MAX_RECORDS`] without caching.
    pub fn max_records(&mut self) -> usize {
        if let Some(max) = self.cached_max {
            return max;
        }
        match self.map.values().next().map(|record| record.meta.max_records) {
            Some(max) => {
                self.cached_max = Some(max);
                max
            }
            None => DEFAULT_MAX_RECORDS,
        }
    }

    /// Drops expired records, then evicts beyond the class bound keeping the
    /// most recently created entries.
    ///
    /// Idempotent: pruning an already-pruned store changes nothing.
    pub fn prune(&mut self, now_ms: u64) {
        if self.map.is_empty() {
            return;
        }
        let max = self.max_records();
        self.map.retain(|_, record| !record.is_expired(now_ms));
        if self.map.len() <= max {
            return;
        }
        let mut by_age: Vec<(RecordKey, u64)> = self
            .map
            .iter()
            .map(|(key, record)| (*key, record.created_at_ms))
            .collect();
        by_age.sort_by(|a, b| b.1.cmp(&a.1));
        let keep: HashSet<RecordKey> = by_age.into_iter().take(max).map(|(key, _)| key).collect();
        self.map.retain(|key, _| keep.contains(key));
    }

    /// Inserts a record under its content key. Returns false on duplicates.
    pub fn insert(&mut self, record: Record) -> Result<bool, NetworkError> {
        let key = record.key()?;
        if self.map.contains_key(&key) {
            return Ok(false);
        }
        self.map.insert(key, record);
        Ok(true)
    }

    /// Removes a record by key.
    pub fn remove(&mut self, key: &RecordKey) -> Option<Record> {
        self.map.remove(key)
    }

    /// The record under `key`, if present.
    pub fn get(&self, key: &RecordKey) -> Option<&Record> {
        self.map.get(key)
    }

    /// Whether `key` is present.
    pub fn contains(&self, key: &RecordKey) -> bool {
        self.map.contains_key(key)
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Iterates over the live records.
    pub fn records(&self) -> impl Iterator<Item = &Record> {
        self.map.values()
    }
}

/// Outcome of offering a record to a store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddOutcome {
    /// Inserted and scheduled for persistence
    Added,
    /// Same content key already present
    Duplicate,
    /// TTL already elapsed on arrival
    Expired,
}

/// One record class's store plus its rate-limited persistence write-back.
///
/// Every mutation requests a persist, but actual writes are bounded to one
/// per interval; coalesced writes always persist the latest in-memory state.
pub struct StoreService {
    store_id: String,
    store: Mutex<ReplicatedStore>,
    persistence: Persistence<ReplicatedStore>,
    limiter: RateLimiter,
    self_ref: Weak<StoreService>,
}

impl StoreService {
    /// Creates the service, loading and pruning any persisted state.
    pub fn load(
        persistence_service: &PersistenceService,
        store_id: &str,
        write_interval: Duration,
    ) -> Arc<Self> {
        let persistence = persistence_service.get_or_create::<ReplicatedStore>(store_id);
        let mut store = match persistence.load() {
            Ok(Some(persisted)) => persisted,
            Ok(None) => ReplicatedStore::new(),
            Err(e) => {
                warn!("Could not load store {}, starting empty: {}", store_id, e);
                ReplicatedStore::new()
            }
        };
        let before = store.len();
        store.prune(now_millis());
        if store.len() < before {
            debug!(
                "Pruned store {}: {} -> {} records",
                store_id,
                before,
                store.len()
            );
        }
        Arc::new_cyclic(|self_ref| Self {
            store_id: store_id.to_string(),
            store: Mutex::new(store),
            persistence,
            limiter: RateLimiter::new(write_interval),
            self_ref: self_ref.clone(),
        })
    }

    /// The id this store persists under.
    pub fn store_id(&self) -> &str {
        &self.store_id
    }

    /// Offers a record: authenticity and expiry checks, insert, prune,
    /// schedule a persist. Duplicates and expired records are reported, not
    /// errors; a bad signature is.
    pub fn add(&self, record: Record) -> Result<AddOutcome, NetworkError> {
        record.verify()?;
        if record.is_expired(now_millis()) {
            return Ok(AddOutcome::Expired);
        }
        let inserted = {
            let mut store = self.store.lock().unwrap();
            let inserted = store.insert(record)?;
            if inserted {
                store.prune(now_millis());
            }
            inserted
        };
        if !inserted {
            return Ok(AddOutcome::Duplicate);
        }
        self.request_persist();
        Ok(AddOutcome::Added)
    }

    /// Removes a record and schedules a persist.
    pub fn remove(&self, key: &RecordKey) -> Option<Record> {
        let removed = self.store.lock().unwrap().remove(key);
        if removed.is_some() {
            self.request_persist();
        }
        removed
    }

    /// The record under `key`, if present.
    pub fn get(&self, key: &RecordKey) -> Option<Record> {
        self.store.lock().unwrap().get(key).cloned()
    }

    /// Whether `key` is present.
    pub fn contains(&self, key: &RecordKey) -> bool {
        self.store.lock().unwrap().contains(key)
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        self.store.lock().unwrap().len()
    }

    /// Whether the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.store.lock().unwrap().is_empty()
    }

    fn request_persist(&self) {
        if let Some(delay) = self.limiter.schedule() {
            let service = self.self_ref.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Some(service) = service.upgrade() {
                    if service.limiter.flush_pending() {
                        service.flush();
                    }
                }
            });
        }
    }

    /// Writes the current state now. A failure leaves the in-memory state
    /// authoritative; the next mutation retries.
    pub fn flush(&self) -> bool {
        let snapshot = self.store.lock().unwrap().clone();
        match self.persistence.save(&snapshot) {
            Ok(()) => {
                self.limiter.mark_flushed(true);
                true
            }
            Err(e) => {
                warn!("Persisting store {} failed: {}", self.store_id, e);
                self.limiter.mark_flushed(false);
                false
            }
        }
    }

    /// Final write at shutdown, bypassing the cooldown.
    pub fn shutdown(&self) -> bool {
        self.flush()
    }
}
