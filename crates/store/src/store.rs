use async_trait::async_trait;
use common::{CorrelationId, SagaId};
use model::{Saga, SagaStatus};

use crate::Result;

/// Filter for listing sagas.
#[derive(Debug, Clone, Default)]
pub struct SagaFilter {
    /// Only sagas with this status.
    pub status: Option<SagaStatus>,
    /// Only sagas for this correlation id (terminal ones included).
    pub correlation_id: Option<CorrelationId>,
}

impl SagaFilter {
    /// Creates an empty filter matching every saga.
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts the filter to the given status.
    pub fn status(mut self, status: SagaStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Restricts the filter to the given correlation id.
    pub fn correlation_id(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }
}

/// Pagination window for listing sagas.
#[derive(Debug, Clone, Copy)]
pub struct Page {
    pub offset: usize,
    pub limit: usize,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 50,
        }
    }
}

impl Page {
    /// Creates a page with the given offset and limit.
    pub fn new(offset: usize, limit: usize) -> Self {
        Self { offset, limit }
    }
}

/// Durable store for saga state.
///
/// A saga and its steps are always written and read together (atomic
/// visibility). All implementations must be thread-safe and must make
/// `update` safe under concurrent calls for the same saga id, here via an
/// optimistic version check: `update` succeeds only when the stored version
/// equals `saga.version()` and returns the incremented version.
#[async_trait]
pub trait SagaStore: Send + Sync {
    /// Persists a new saga with all of its steps.
    ///
    /// Fails with `DuplicateSaga` when a non-terminal saga already exists
    /// for the same correlation id (at-most-one-active-saga invariant).
    async fn create(&self, saga: &Saga) -> Result<()>;

    /// Loads a saga by id. Returns `None` if it does not exist.
    async fn get(&self, saga_id: SagaId) -> Result<Option<Saga>>;

    /// Loads the active (non-terminal) saga for a correlation id, if any.
    async fn get_by_correlation(&self, correlation_id: CorrelationId) -> Result<Option<Saga>>;

    /// Replaces the stored saga aggregate (steps included) atomically.
    ///
    /// Returns the new version on success, `ConcurrencyConflict` when the
    /// stored version differs from `saga.version()`.
    async fn update(&self, saga: &Saga) -> Result<u64>;

    /// Lists every non-terminal saga, oldest first. This is the
    /// reconciliation loop's working set.
    async fn list_non_terminal(&self) -> Result<Vec<Saga>>;

    /// Lists sagas matching a filter, newest first.
    async fn list(&self, filter: SagaFilter, page: Page) -> Result<Vec<Saga>>;
}
