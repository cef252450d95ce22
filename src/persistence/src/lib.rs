//! Persistence layer: pluggable byte stores and rate-limited write-back.

pub mod backend;
pub mod errors;
pub mod rate_limit;
pub mod service;

pub use backend::{MemoryBackend, PersistenceBackend, RocksDbBackend};
pub use errors::PersistenceError;
pub use rate_limit::RateLimiter;
pub use service::{Persistence, PersistenceService};
