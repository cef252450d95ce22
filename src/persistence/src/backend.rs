//! Byte-level storage backends for persisted stores.

use crate::errors::PersistenceError;
use rocksdb::{Options, DB};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// A named byte store persisted state is written to and read from.
pub trait PersistenceBackend: Send + Sync {
    /// Writes the serialized store under `store_id`.
    fn save(&self, store_id: &str, bytes: &[u8]) -> Result<(), PersistenceError>;

    /// Reads the serialized store under `store_id`, if present.
    fn load(&self, store_id: &str) -> Result<Option<Vec<u8>>, PersistenceError>;
}

/// RocksDB-backed persistence, one key per store id.
#[derive(Clone)]
pub struct RocksDbBackend {
    db: Arc<Mutex<DB>>,
}

impl RocksDbBackend {
    /// Opens (or creates) the database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, PersistenceError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);

        let db = DB::open(&opts, path).map_err(|e| PersistenceError::Backend(e.to_string()))?;

        Ok(Self {
            db: Arc::new(Mutex::new(db)),
        })
    }
}

impl PersistenceBackend for RocksDbBackend {
    fn save(&self, store_id: &str, bytes: &[u8]) -> Result<(), PersistenceError> {
        self.db
            .lock()
            .unwrap()
            .put(store_id.as_bytes(), bytes)
            .map_err(|e| PersistenceError::Backend(e.to_string()))
    }

    fn load(&self, store_id: &str) -> Result<Option<Vec<u8>>, PersistenceError> {
        self.db
            .lock()
            .unwrap()
            .get(store_id.as_bytes())
            .map_err(|e| PersistenceError::Backend(e.to_string()))
    }
}

/// In-memory persistence for ephemeral runs and tests.
///
/// Tracks the number of completed writes so callers can observe
/// write amplification.
#[derive(Default)]
pub struct MemoryBackend {
    entries: Mutex<HashMap<String, Vec<u8>>>,
    writes: AtomicU64,
}

impl MemoryBackend {
    /// Creates an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of writes performed so far.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }
}

impl PersistenceBackend for MemoryBackend {
    fn save(&self, store_id: &str, bytes: &[u8]) -> Result<(), PersistenceError> {
        self.entries
            .lock()
            .unwrap()
            .insert(store_id.to_string(), bytes.to_vec());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn load(&self, store_id: &str) -> Result<Option<Vec<u8>>, PersistenceError> {
        Ok(self.entries.lock().unwrap().get(store_id).cloned())
    }
}
