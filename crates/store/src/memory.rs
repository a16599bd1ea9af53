use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use common::{CorrelationId, SagaId};
use model::Saga;
use tokio::sync::RwLock;

use crate::{
    Result, StoreError,
    store::{Page, SagaFilter, SagaStore},
};

/// In-memory saga store for testing and single-process deployments.
///
/// Provides the same interface and invariants as the PostgreSQL
/// implementation, including the optimistic version check on `update`.
#[derive(Clone, Default)]
pub struct InMemorySagaStore {
    sagas: Arc<RwLock<HashMap<SagaId, Saga>>>,
}

impl InMemorySagaStore {
    /// Creates a new empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the total number of sagas stored.
    pub async fn saga_count(&self) -> usize {
        self.sagas.read().await.len()
    }

    /// Clears all sagas.
    pub async fn clear(&self) {
        self.sagas.write().await.clear();
    }
}

#[async_trait]
impl SagaStore for InMemorySagaStore {
    async fn create(&self, saga: &Saga) -> Result<()> {
        let mut sagas = self.sagas.write().await;

        if sagas.contains_key(&saga.id()) {
            return Err(StoreError::DuplicateId(saga.id()));
        }
        let has_active = sagas
            .values()
            .any(|s| s.correlation_id() == saga.correlation_id() && !s.is_terminal());
        if has_active {
            return Err(StoreError::DuplicateSaga(saga.correlation_id()));
        }

        sagas.insert(saga.id(), saga.clone());
        Ok(())
    }

    async fn get(&self, saga_id: SagaId) -> Result<Option<Saga>> {
        let sagas = self.sagas.read().await;
        Ok(sagas.get(&saga_id).cloned())
    }

    async fn get_by_correlation(&self, correlation_id: CorrelationId) -> Result<Option<Saga>> {
        let sagas = self.sagas.read().await;
        Ok(sagas
            .values()
            .find(|s| s.correlation_id() == correlation_id && !s.is_terminal())
            .cloned())
    }

    async fn update(&self, saga: &Saga) -> Result<u64> {
        let mut sagas = self.sagas.write().await;
        let stored = sagas
            .get_mut(&saga.id())
            .ok_or(StoreError::NotFound(saga.id()))?;

        if stored.version() != saga.version() {
            return Err(StoreError::ConcurrencyConflict {
                saga_id: saga.id(),
                expected: saga.version(),
                actual: stored.version(),
            });
        }

        let new_version = saga.version() + 1;
        let mut updated = saga.clone();
        updated.set_version(new_version);
        *stored = updated;
        Ok(new_version)
    }

    async fn list_non_terminal(&self) -> Result<Vec<Saga>> {
        let sagas = self.sagas.read().await;
        let mut result: Vec<Saga> = sagas
            .values()
            .filter(|s| !s.is_terminal())
            .cloned()
            .collect();
        result.sort_by_key(|s| s.created_at());
        Ok(result)
    }

    async fn list(&self, filter: SagaFilter, page: Page) -> Result<Vec<Saga>> {
        let sagas = self.sagas.read().await;
        let mut result: Vec<Saga> = sagas
            .values()
            .filter(|s| {
                if let Some(status) = filter.status
                    && s.status() != status
                {
                    return false;
                }
                if let Some(correlation_id) = filter.correlation_id
                    && s.correlation_id() != correlation_id
                {
                    return false;
                }
                true
            })
            .cloned()
            .collect();
        result.sort_by(|a, b| b.created_at().cmp(&a.created_at()));
        Ok(result
            .into_iter()
            .skip(page.offset)
            .take(page.limit)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;
    use model::{SagaStatus, SagaType, StepDefinition, StepName, StepOutcome};

    use super::*;

    fn make_saga(correlation_id: CorrelationId) -> Saga {
        Saga::new(
            SagaType::OrderPayment,
            correlation_id,
            vec![
                StepDefinition::new(StepName::CreateOrder, serde_json::Value::Null),
                StepDefinition::new(StepName::ProcessPayment, serde_json::Value::Null),
            ],
            Duration::from_secs(30),
            3,
            Utc::now(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn create_and_get() {
        let store = InMemorySagaStore::new();
        let saga = make_saga(CorrelationId::new());

        store.create(&saga).await.unwrap();

        let loaded = store.get(saga.id()).await.unwrap().unwrap();
        assert_eq!(loaded.id(), saga.id());
        assert_eq!(loaded.steps().len(), 2);
        assert_eq!(loaded.version(), 0);
    }

    #[tokio::test]
    async fn rejects_second_active_saga_for_correlation() {
        let store = InMemorySagaStore::new();
        let correlation_id = CorrelationId::new();

        store.create(&make_saga(correlation_id)).await.unwrap();
        let result = store.create(&make_saga(correlation_id)).await;

        assert!(matches!(result, Err(StoreError::DuplicateSaga(_))));
    }

    #[tokio::test]
    async fn allows_new_saga_after_previous_is_terminal() {
        let store = InMemorySagaStore::new();
        let correlation_id = CorrelationId::new();
        let now = Utc::now();

        let mut saga = make_saga(correlation_id);
        store.create(&saga).await.unwrap();
        for _ in 0..2 {
            let id = saga.next_pending_step().unwrap().id();
            saga.record_dispatch(id, now).unwrap();
            saga.apply_step_result(id, StepOutcome::Completed, None, now)
                .unwrap();
        }
        assert_eq!(saga.status(), SagaStatus::Completed);
        store.update(&saga).await.unwrap();

        store.create(&make_saga(correlation_id)).await.unwrap();
    }

    #[tokio::test]
    async fn update_checks_version() {
        let store = InMemorySagaStore::new();
        let saga = make_saga(CorrelationId::new());
        store.create(&saga).await.unwrap();

        let mut first = store.get(saga.id()).await.unwrap().unwrap();
        let second = store.get(saga.id()).await.unwrap().unwrap();

        let v = store.update(&first).await.unwrap();
        assert_eq!(v, 1);
        first.set_version(v);

        // The second copy still carries version 0
        let result = store.update(&second).await;
        assert!(matches!(
            result,
            Err(StoreError::ConcurrencyConflict {
                expected: 0,
                actual: 1,
                ..
            })
        ));

        // The refreshed copy succeeds
        let v = store.update(&first).await.unwrap();
        assert_eq!(v, 2);
    }

    #[tokio::test]
    async fn update_unknown_saga_is_not_found() {
        let store = InMemorySagaStore::new();
        let saga = make_saga(CorrelationId::new());
        let result = store.update(&saga).await;
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn get_by_correlation_ignores_terminal_sagas() {
        let store = InMemorySagaStore::new();
        let correlation_id = CorrelationId::new();
        let now = Utc::now();

        let mut saga = make_saga(correlation_id);
        store.create(&saga).await.unwrap();
        assert!(
            store
                .get_by_correlation(correlation_id)
                .await
                .unwrap()
                .is_some()
        );

        for _ in 0..2 {
            let id = saga.next_pending_step().unwrap().id();
            saga.record_dispatch(id, now).unwrap();
            saga.apply_step_result(id, StepOutcome::Completed, None, now)
                .unwrap();
        }
        store.update(&saga).await.unwrap();

        assert!(
            store
                .get_by_correlation(correlation_id)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn list_non_terminal_excludes_completed() {
        let store = InMemorySagaStore::new();
        let now = Utc::now();

        let mut done = make_saga(CorrelationId::new());
        store.create(&done).await.unwrap();
        for _ in 0..2 {
            let id = done.next_pending_step().unwrap().id();
            done.record_dispatch(id, now).unwrap();
            done.apply_step_result(id, StepOutcome::Completed, None, now)
                .unwrap();
        }
        store.update(&done).await.unwrap();

        let active = make_saga(CorrelationId::new());
        store.create(&active).await.unwrap();

        let listed = store.list_non_terminal().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id(), active.id());
    }

    #[tokio::test]
    async fn list_with_filter_and_page() {
        let store = InMemorySagaStore::new();
        let correlation_id = CorrelationId::new();
        let saga = make_saga(correlation_id);
        store.create(&saga).await.unwrap();
        store.create(&make_saga(CorrelationId::new())).await.unwrap();

        let by_correlation = store
            .list(
                SagaFilter::new().correlation_id(correlation_id),
                Page::default(),
            )
            .await
            .unwrap();
        assert_eq!(by_correlation.len(), 1);
        assert_eq!(by_correlation[0].id(), saga.id());

        let by_status = store
            .list(
                SagaFilter::new().status(SagaStatus::Pending),
                Page::new(0, 1),
            )
            .await
            .unwrap();
        assert_eq!(by_status.len(), 1);

        let empty = store
            .list(SagaFilter::new(), Page::new(10, 10))
            .await
            .unwrap();
        assert!(empty.is_empty());
    }
}
