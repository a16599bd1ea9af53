//! Per-saga locking.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use common::SagaId;
use tokio::sync::Mutex as AsyncMutex;

/// Registry of per-saga mutexes.
///
/// Serializes the read-modify-write cycles that race within one process:
/// result callbacks, reconciliation passes, and manual compensation
/// requests against the same saga. Across processes the store's version
/// check is the arbiter. Entries are pruned once a saga is terminal.
#[derive(Clone, Default)]
pub struct SagaLocks {
    inner: Arc<Mutex<HashMap<SagaId, Arc<AsyncMutex<()>>>>>,
}

impl SagaLocks {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the mutex for a saga, creating it on first use.
    pub fn lock_for(&self, saga_id: SagaId) -> Arc<AsyncMutex<()>> {
        let mut map = self.inner.lock().unwrap();
        map.entry(saga_id).or_default().clone()
    }

    /// Drops the mutex entry for a saga.
    pub fn remove(&self, saga_id: SagaId) {
        self.inner.lock().unwrap().remove(&saga_id);
    }

    /// Returns how many sagas currently have a lock entry.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    /// Returns true when no saga has a lock entry.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }
}
