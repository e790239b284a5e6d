//! Counter storage backends.
//!
//! The quota engine keeps no counter state of its own; every value lives in a
//! [`CounterStore`]. Two backends are provided:
//!
//! - **Memory**: a process-local map (single instance only)
//! - **Redis**: a shared database, for running several instances side by side

mod memory;
mod redis;

pub use memory::MemoryStore;
pub use self::redis::RedisStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors returned by a counter store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The key has never been set. Expected, and not a storage failure.
    #[error("key not found: {key}")]
    KeyNotFound { key: String },

    /// The backend could not be reached or rejected the operation.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A stored value could not be read as a 64-bit integer.
    #[error("value stored at {key} is not an integer: {value:?}")]
    ValueParse { key: String, value: String },
}

impl StoreError {
    /// Whether this error only means the key is absent.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::KeyNotFound { .. })
    }
}

/// Which backend a store is.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StoreType {
    /// In-memory store (single instance only)
    #[default]
    Memory,
    /// Redis store (shared across instances)
    Redis,
}

impl std::fmt::Display for StoreType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreType::Memory => write!(f, "memory"),
            StoreType::Redis => write!(f, "redis"),
        }
    }
}

/// One counter to advance inside [`CounterStore::check_and_increment`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterStep {
    /// Key holding the provisioned total for this counter
    pub total_key: String,
    /// Key holding the running counter
    pub current_key: String,
    /// Total to use when `total_key` is absent
    pub default_total: i64,
    /// Amount to add to the running counter
    pub amount: i64,
}

/// Key-value storage for 64-bit counters.
///
/// Implementations must be safe to share between tasks; the reset scheduler
/// and request handlers call into the same store concurrently.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Read the integer stored at `key`.
    ///
    /// Returns [`StoreError::KeyNotFound`] when the key has never been set.
    async fn get_key(&self, key: &str) -> Result<i64, StoreError>;

    /// Create or overwrite the integer stored at `key`.
    async fn set_key(&self, key: &str, value: i64) -> Result<(), StoreError>;

    /// Remove every key this store manages.
    async fn flush_data(&self) -> Result<(), StoreError>;

    /// Atomically advance a group of counters, all or nothing.
    ///
    /// For each step the total is read (falling back to `default_total`) and
    /// the current value is read (falling back to 0). If any
    /// `current + amount` would exceed its total, nothing is written and
    /// `false` is returned. Otherwise every counter is advanced and `true` is
    /// returned. No other operation can observe the group half-applied.
    async fn check_and_increment(&self, steps: &[CounterStep]) -> Result<bool, StoreError>;

    /// Get the backend type, for logging.
    fn store_type(&self) -> StoreType;
}
