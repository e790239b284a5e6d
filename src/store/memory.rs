//! In-process counter store.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::trace;

use super::{CounterStep, CounterStore, StoreError, StoreType};

/// Counter store backed by a process-local map.
///
/// Counters are not shared between instances, so this backend only suits a
/// single deployment replica (and tests).
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<String, i64>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the number of stored keys.
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Whether the store holds no keys.
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn get_key(&self, key: &str) -> Result<i64, StoreError> {
        self.records
            .read()
            .get(key)
            .copied()
            .ok_or_else(|| StoreError::KeyNotFound {
                key: key.to_string(),
            })
    }

    async fn set_key(&self, key: &str, value: i64) -> Result<(), StoreError> {
        self.records.write().insert(key.to_string(), value);
        Ok(())
    }

    async fn flush_data(&self) -> Result<(), StoreError> {
        let mut records = self.records.write();
        trace!(keys = records.len(), "Flushing in-memory counters");
        *records = HashMap::new();
        Ok(())
    }

    async fn check_and_increment(&self, steps: &[CounterStep]) -> Result<bool, StoreError> {
        // One write guard covers every read and write of the group.
        let mut records = self.records.write();
        let mut updates = Vec::with_capacity(steps.len());

        for step in steps {
            let total = records
                .get(&step.total_key)
                .copied()
                .unwrap_or(step.default_total);
            let current = records.get(&step.current_key).copied().unwrap_or(0);
            match current.checked_add(step.amount) {
                Some(next) if next <= total => updates.push((step.current_key.clone(), next)),
                _ => return Ok(false),
            }
        }

        for (key, value) in updates {
            records.insert(key, value);
        }
        Ok(true)
    }

    fn store_type(&self) -> StoreType {
        StoreType::Memory
    }
}
