//! Typed persistence handles resolved by store id.

use crate::backend::PersistenceBackend;
use crate::errors::PersistenceError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::sync::Arc;

/// Hands out typed persistence handles keyed by store id.
#[derive(Clone)]
pub struct PersistenceService {
    backend: Arc<dyn PersistenceBackend>,
}

impl PersistenceService {
    /// Creates a service over the given backend.
    pub fn new(backend: Arc<dyn PersistenceBackend>) -> Self {
        Self { backend }
    }

    /// Returns a typed handle for `store_id`.
    ///
    /// The underlying entry is created lazily on first save; loading a
    /// never-saved store yields `None`.
    pub fn get_or_create<T>(&self, store_id: &str) -> Persistence<T>
    where
        T: Serialize + DeserializeOwned,
    {
        Persistence {
            backend: self.backend.clone(),
            store_id: store_id.to_string(),
            _marker: PhantomData,
        }
    }
}

/// A typed handle to one persisted store.
pub struct Persistence<T> {
    backend: Arc<dyn PersistenceBackend>,
    store_id: String,
    _marker: PhantomData<T>,
}

impl<T> Clone for Persistence<T> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            store_id: self.store_id.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: Serialize + DeserializeOwned> Persistence<T> {
    /// The id this handle persists under.
    pub fn store_id(&self) -> &str {
        &self.store_id
    }

    /// Persists the given snapshot.
    pub fn save(&self, value: &T) -> Result<(), PersistenceError> {
        let bytes = bincode::serialize(value)
            .map_err(|e| PersistenceError::Serialization(e.to_string()))?;
        self.backend.save(&self.store_id, &bytes)
    }

    /// Loads the persisted snapshot, if any.
    pub fn load(&self) -> Result<Option<T>, PersistenceError> {
        match self.backend.load(&self.store_id)? {
            Some(bytes) => {
                let value = bincode::deserialize(&bytes)
                    .map_err(|e| PersistenceError::Serialization(e.to_string()))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }
}
