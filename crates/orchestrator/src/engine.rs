//! The orchestration engine's forward path.
//!
//! State is persisted before messages are published. A lost or failed
//! publish therefore never loses progress: the saga sits in a non-terminal
//! state and the reconciler re-dispatches it.

use std::sync::Arc;

use chrono::Utc;
use common::{CorrelationId, SagaId, StepId};
use model::{Saga, SagaStatus, SagaType, Step, StepDefinition, StepOutcome};
use store::{Page, SagaFilter, SagaStore, StoreError};
use transport::{
    COMPENSATION_RESULTS_TOPIC, MessageBus, MessageHandler, RESULTS_TOPIC, StepMessage,
    StepResultMessage, step_topic,
};

use crate::config::EngineConfig;
use crate::error::{OrchestratorError, Result};
use crate::lock::SagaLocks;

/// Coordinates sagas over a store and a message bus.
///
/// All state lives in the store; the orchestrator itself only holds the
/// per-saga lock registry, so any number of operations can run concurrently
/// as long as they touch different sagas.
pub struct SagaOrchestrator<S, B> {
    store: S,
    bus: B,
    config: EngineConfig,
    locks: SagaLocks,
}

impl<S: SagaStore, B: MessageBus> SagaOrchestrator<S, B> {
    /// Creates an orchestrator over the given gateways.
    pub fn new(store: S, bus: B, config: EngineConfig) -> Self {
        Self {
            store,
            bus,
            config,
            locks: SagaLocks::new(),
        }
    }

    /// Returns the engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub(crate) fn locks(&self) -> &SagaLocks {
        &self.locks
    }

    /// Starts a new saga and dispatches its first step.
    ///
    /// At most one non-terminal saga may exist per correlation id; a second
    /// start for the same id fails with `DuplicateSaga` and leaves the
    /// running saga untouched.
    #[tracing::instrument(skip(self, definitions), fields(saga_type = %saga_type, correlation_id = %correlation_id))]
    pub async fn start_saga(
        &self,
        saga_type: SagaType,
        correlation_id: CorrelationId,
        definitions: Vec<StepDefinition>,
    ) -> Result<Saga> {
        let now = Utc::now();
        let mut saga = Saga::new(
            saga_type,
            correlation_id,
            definitions,
            self.config.saga_timeout,
            self.config.max_retries,
            now,
        )?;

        // The store's unique-active-correlation constraint is the real
        // guard; relying on it alone avoids a check-then-act race.
        self.store.create(&saga).await.map_err(|e| match e {
            StoreError::DuplicateSaga(id) => OrchestratorError::DuplicateSaga(id),
            other => other.into(),
        })?;

        metrics::counter!("saga_started_total").increment(1);
        tracing::info!(saga_id = %saga.id(), steps = saga.steps().len(), "saga started");

        if let Some(first) = saga.next_pending_step().map(Step::id) {
            self.dispatch_step(&mut saga, first).await?;
        }
        Ok(saga)
    }

    /// Loads a saga by id.
    pub async fn get_saga(&self, saga_id: SagaId) -> Result<Saga> {
        self.store
            .get(saga_id)
            .await?
            .ok_or(OrchestratorError::SagaNotFound(saga_id))
    }

    /// Lists sagas matching the filter.
    pub async fn list_sagas(&self, filter: SagaFilter, page: Page) -> Result<Vec<Saga>> {
        Ok(self.store.list(filter, page).await?)
    }

    /// Applies a step executor's forward result.
    ///
    /// Duplicate and out-of-order deliveries are rejected by the saga's
    /// transition rules without mutating anything, which makes this safe to
    /// call any number of times for the same message.
    #[tracing::instrument(skip(self, error))]
    pub async fn apply_step_result(
        &self,
        saga_id: SagaId,
        step_id: StepId,
        outcome: StepOutcome,
        error: Option<String>,
    ) -> Result<()> {
        let lock = self.locks.lock_for(saga_id);
        let _guard = lock.lock().await;

        let mut saga = self.get_saga(saga_id).await?;
        let now = Utc::now();
        if let Err(e) = saga.apply_step_result(step_id, outcome, error, now) {
            tracing::warn!(error = %e, "step result dropped");
            return Err(e.into());
        }

        match saga.status() {
            SagaStatus::Processing => {
                // The result completed a step and a later one is pending.
                match saga.next_pending_step().map(Step::id) {
                    Some(next) => self.dispatch_step(&mut saga, next).await?,
                    None => self.persist(&mut saga).await?,
                }
            }
            SagaStatus::Completed => {
                self.persist(&mut saga).await?;
                self.record_completed(&saga);
            }
            SagaStatus::Failed => {
                tracing::warn!(
                    step = %step_id,
                    "step failed, compensating completed steps"
                );
                self.start_compensation(&mut saga).await?;
            }
            _ => self.persist(&mut saga).await?,
        }
        Ok(())
    }

    /// Sweeps every non-terminal saga once, re-dispatching stalled steps,
    /// failing timed-out sagas into compensation, and retrying compensating
    /// actions. Returns how many sagas were examined.
    pub async fn reconcile_once(&self) -> Result<usize> {
        metrics::counter!("saga_reconcile_runs_total").increment(1);
        let sagas = self.store.list_non_terminal().await?;
        let examined = sagas.len();

        for saga in sagas {
            let saga_id = saga.id();
            if let Err(e) = self.reconcile_saga(saga_id).await {
                // One stuck saga must not starve the rest of the sweep.
                tracing::warn!(%saga_id, error = %e, "reconciliation failed for saga");
            }
        }
        Ok(examined)
    }

    async fn reconcile_saga(&self, saga_id: SagaId) -> Result<()> {
        let lock = self.locks.lock_for(saga_id);
        let _guard = lock.lock().await;

        // Re-read under the lock; a result may have landed since the list.
        let Some(mut saga) = self.store.get(saga_id).await? else {
            return Ok(());
        };
        if saga.is_terminal() {
            self.locks.remove(saga_id);
            return Ok(());
        }

        let now = Utc::now();
        match saga.status() {
            SagaStatus::Pending | SagaStatus::Processing => {
                self.reconcile_forward(&mut saga, now).await
            }
            SagaStatus::Compensating => self.reconcile_compensation(&mut saga, now).await,
            _ => Ok(()),
        }
    }

    async fn reconcile_forward(
        &self,
        saga: &mut Saga,
        now: chrono::DateTime<Utc>,
    ) -> Result<()> {
        let Some(step) = saga.next_pending_step() else {
            // A result for the last step is in flight; nothing to drive.
            return Ok(());
        };
        let step_id = step.id();
        let attempts = step.retry_count();
        let last_touched = step.updated_at();

        if saga.is_timed_out(now) {
            tracing::warn!(saga_id = %saga.id(), step = %step_id, "saga timed out");
            metrics::counter!("saga_timeouts_total").increment(1);
            saga.fail_step(step_id, "timed out waiting for step result", now)?;
            return self.start_compensation(saga).await;
        }

        if attempts >= saga.max_retries() {
            tracing::warn!(
                saga_id = %saga.id(),
                step = %step_id,
                attempts,
                "dispatch retries exhausted"
            );
            metrics::counter!("saga_retries_exhausted_total").increment(1);
            saga.fail_step(step_id, "dispatch retries exhausted", now)?;
            return self.start_compensation(saga).await;
        }

        if attempts == 0 {
            // Created or crashed before the first dispatch was recorded.
            self.dispatch_step(saga, step_id).await?;
        } else if self.backoff_elapsed(last_touched, now) {
            metrics::counter!("saga_step_retries_total").increment(1);
            self.dispatch_step(saga, step_id).await?;
        }
        Ok(())
    }

    /// Records a dispatch attempt, persists, then publishes the step to its
    /// topic. Publish failures are logged and left to the next
    /// reconciliation pass.
    pub(crate) async fn dispatch_step(&self, saga: &mut Saga, step_id: StepId) -> Result<()> {
        let now = Utc::now();
        saga.record_dispatch(step_id, now)?;
        self.persist(saga).await?;

        let step = saga
            .step(step_id)
            .ok_or(model::ModelError::StepNotFound(step_id))?;
        let topic = step_topic(step.name());
        let message = StepMessage::for_step(saga, step);
        metrics::counter!("saga_step_dispatches_total").increment(1);
        tracing::debug!(
            saga_id = %saga.id(),
            step = %step.name(),
            attempt = step.retry_count(),
            "dispatching step"
        );
        self.publish(&topic, &message).await;
        Ok(())
    }

    /// Best-effort publish. Transient failures are absorbed here because
    /// persisted state already carries everything needed to re-drive.
    pub(crate) async fn publish(&self, topic: &str, message: &StepMessage) {
        let payload = match serde_json::to_vec(message) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(topic, error = %e, "failed to encode step message");
                return;
            }
        };
        if let Err(e) = self.bus.publish(topic, payload).await {
            metrics::counter!("saga_publish_failures_total").increment(1);
            tracing::warn!(topic, error = %e, "publish failed, reconciler will retry");
        }
    }

    /// Writes the saga through the optimistic version check and adopts the
    /// new version so later writes in the same flow keep succeeding.
    pub(crate) async fn persist(&self, saga: &mut Saga) -> Result<()> {
        let version = self.store.update(saga).await?;
        saga.set_version(version);
        Ok(())
    }

    pub(crate) fn record_completed(&self, saga: &Saga) {
        metrics::counter!("saga_completed_total").increment(1);
        let elapsed = saga
            .updated_at()
            .signed_duration_since(saga.created_at());
        metrics::histogram!("saga_duration_seconds")
            .record(elapsed.num_milliseconds() as f64 / 1000.0);
        tracing::info!(saga_id = %saga.id(), "saga completed");
        self.locks.remove(saga.id());
    }

    pub(crate) fn backoff_elapsed(
        &self,
        last_touched: chrono::DateTime<Utc>,
        now: chrono::DateTime<Utc>,
    ) -> bool {
        let backoff = chrono::TimeDelta::from_std(self.config.retry_backoff)
            .unwrap_or(chrono::TimeDelta::MAX);
        now.signed_duration_since(last_touched) >= backoff
    }
}

impl<S, B> SagaOrchestrator<S, B>
where
    S: SagaStore + 'static,
    B: MessageBus + 'static,
{
    /// Subscribes the orchestrator to the shared result topics so step
    /// executors can drive sagas by publishing `StepResultMessage`s.
    pub async fn subscribe_result_topics(self: Arc<Self>) -> Result<()> {
        let forward = Arc::clone(&self);
        let handler: MessageHandler = Arc::new(move |payload| {
            let orchestrator = Arc::clone(&forward);
            Box::pin(async move {
                orchestrator.handle_result_payload(&payload, false).await;
            })
        });
        self.bus.subscribe(RESULTS_TOPIC, handler).await?;

        let backward = Arc::clone(&self);
        let handler: MessageHandler = Arc::new(move |payload| {
            let orchestrator = Arc::clone(&backward);
            Box::pin(async move {
                orchestrator.handle_result_payload(&payload, true).await;
            })
        });
        self.bus.subscribe(COMPENSATION_RESULTS_TOPIC, handler).await?;
        Ok(())
    }

    async fn handle_result_payload(&self, payload: &[u8], compensation: bool) {
        let message: StepResultMessage = match serde_json::from_slice(payload) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(error = %e, "dropping malformed result message");
                return;
            }
        };

        let applied = if compensation {
            self.apply_compensation_result(
                message.saga_id,
                message.step_id,
                message.status,
                message.error,
            )
            .await
        } else {
            self.apply_step_result(
                message.saga_id,
                message.step_id,
                message.status,
                message.error,
            )
            .await
        };

        if let Err(e) = applied {
            // Redeliveries under at-least-once land here; already logged.
            tracing::debug!(saga_id = %message.saga_id, error = %e, "result not applied");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use model::{StepName, StepStatus};
    use store::InMemorySagaStore;
    use transport::{InMemoryMessageBus, compensation_topic};

    use super::*;

    fn definitions() -> Vec<StepDefinition> {
        vec![
            StepDefinition::new(StepName::CreateOrder, serde_json::json!({"order": 42})),
            StepDefinition::new(StepName::ProcessPayment, serde_json::json!({"cents": 999})),
            StepDefinition::new(StepName::UpdateInventory, serde_json::json!({"sku": "A-1"})),
        ]
    }

    fn engine(config: EngineConfig) -> SagaOrchestrator<InMemorySagaStore, InMemoryMessageBus> {
        SagaOrchestrator::new(InMemorySagaStore::new(), InMemoryMessageBus::new(), config)
    }

    fn bus_of(
        orchestrator: &SagaOrchestrator<InMemorySagaStore, InMemoryMessageBus>,
    ) -> InMemoryMessageBus {
        orchestrator.bus.clone()
    }

    async fn complete_step(
        orchestrator: &SagaOrchestrator<InMemorySagaStore, InMemoryMessageBus>,
        saga: &Saga,
        order: usize,
    ) {
        let saga = orchestrator.get_saga(saga.id()).await.unwrap();
        let step_id = saga.steps()[order].id();
        orchestrator
            .apply_step_result(saga.id(), step_id, StepOutcome::Completed, None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_start_dispatches_first_step_only() {
        let orchestrator = engine(EngineConfig::default());
        let bus = bus_of(&orchestrator);

        let saga = orchestrator
            .start_saga(SagaType::OrderPayment, CorrelationId::new(), definitions())
            .await
            .unwrap();

        assert_eq!(saga.status(), SagaStatus::Processing);
        assert_eq!(bus.published_on("saga.CREATE_ORDER").len(), 1);
        assert_eq!(bus.publish_count(), 1);

        let message: StepMessage =
            serde_json::from_slice(&bus.published_on("saga.CREATE_ORDER")[0]).unwrap();
        assert_eq!(message.saga_id, saga.id());
        assert_eq!(message.step.name, StepName::CreateOrder);
        assert_eq!(message.step.payload["order"], 42);
    }

    #[tokio::test]
    async fn test_happy_path_runs_steps_in_sequence() {
        let orchestrator = engine(EngineConfig::default());
        let bus = bus_of(&orchestrator);

        let saga = orchestrator
            .start_saga(SagaType::OrderPayment, CorrelationId::new(), definitions())
            .await
            .unwrap();

        complete_step(&orchestrator, &saga, 0).await;
        assert_eq!(bus.published_on("saga.PROCESS_PAYMENT").len(), 1);
        complete_step(&orchestrator, &saga, 1).await;
        assert_eq!(bus.published_on("saga.UPDATE_INVENTORY").len(), 1);
        complete_step(&orchestrator, &saga, 2).await;

        let finished = orchestrator.get_saga(saga.id()).await.unwrap();
        assert_eq!(finished.status(), SagaStatus::Completed);
        assert!(finished
            .steps()
            .iter()
            .all(|s| s.status() == StepStatus::Completed));
        assert_eq!(bus.publish_count(), 3);
        assert!(orchestrator.locks().is_empty());
    }

    #[tokio::test]
    async fn test_second_start_for_same_correlation_is_rejected() {
        let orchestrator = engine(EngineConfig::default());
        let correlation_id = CorrelationId::new();

        orchestrator
            .start_saga(SagaType::OrderPayment, correlation_id, definitions())
            .await
            .unwrap();
        let second = orchestrator
            .start_saga(SagaType::OrderPayment, correlation_id, definitions())
            .await;

        assert!(matches!(
            second,
            Err(OrchestratorError::DuplicateSaga(id)) if id == correlation_id
        ));
    }

    #[tokio::test]
    async fn test_duplicate_result_does_not_advance_twice() {
        let orchestrator = engine(EngineConfig::default());
        let bus = bus_of(&orchestrator);

        let saga = orchestrator
            .start_saga(SagaType::OrderPayment, CorrelationId::new(), definitions())
            .await
            .unwrap();
        let first = saga.steps()[0].id();

        orchestrator
            .apply_step_result(saga.id(), first, StepOutcome::Completed, None)
            .await
            .unwrap();
        // Redelivery of the same result message
        let dup = orchestrator
            .apply_step_result(saga.id(), first, StepOutcome::Completed, None)
            .await;

        assert!(matches!(dup, Err(OrchestratorError::Model(_))));
        assert_eq!(bus.published_on("saga.PROCESS_PAYMENT").len(), 1);
    }

    #[tokio::test]
    async fn test_failure_compensates_completed_steps_in_reverse() {
        let orchestrator = engine(EngineConfig::default());
        let bus = bus_of(&orchestrator);

        let saga = orchestrator
            .start_saga(SagaType::OrderPayment, CorrelationId::new(), definitions())
            .await
            .unwrap();
        complete_step(&orchestrator, &saga, 0).await;

        let second = saga.steps()[1].id();
        orchestrator
            .apply_step_result(
                saga.id(),
                second,
                StepOutcome::Failed,
                Some("card declined".into()),
            )
            .await
            .unwrap();

        let compensating = orchestrator.get_saga(saga.id()).await.unwrap();
        assert_eq!(compensating.status(), SagaStatus::Compensating);
        assert_eq!(compensating.steps()[0].status(), StepStatus::Compensating);
        assert_eq!(compensating.steps()[1].status(), StepStatus::Failed);
        assert_eq!(compensating.steps()[2].status(), StepStatus::Cancelled);
        assert_eq!(
            bus.published_on(&compensation_topic(StepName::CreateOrder))
                .len(),
            1
        );
        // Only the completed step gets a compensating action
        assert!(bus
            .published_on(&compensation_topic(StepName::ProcessPayment))
            .is_empty());

        orchestrator
            .apply_compensation_result(saga.id(), saga.steps()[0].id(), StepOutcome::Completed, None)
            .await
            .unwrap();
        let finished = orchestrator.get_saga(saga.id()).await.unwrap();
        assert_eq!(finished.status(), SagaStatus::Compensated);
        assert!(orchestrator.locks().is_empty());
    }

    #[tokio::test]
    async fn test_first_step_failure_goes_straight_to_failed() {
        let orchestrator = engine(EngineConfig::default());
        let saga = orchestrator
            .start_saga(SagaType::OrderPayment, CorrelationId::new(), definitions())
            .await
            .unwrap();

        orchestrator
            .apply_step_result(
                saga.id(),
                saga.steps()[0].id(),
                StepOutcome::Failed,
                Some("no such customer".into()),
            )
            .await
            .unwrap();

        let failed = orchestrator.get_saga(saga.id()).await.unwrap();
        assert_eq!(failed.status(), SagaStatus::Failed);
        assert!(failed.is_terminal());
        assert_eq!(failed.steps()[1].status(), StepStatus::Cancelled);
        assert_eq!(failed.steps()[2].status(), StepStatus::Cancelled);
        assert!(orchestrator.locks().is_empty());
    }

    #[tokio::test]
    async fn test_reconcile_redispatches_after_publish_failure() {
        let config = EngineConfig {
            retry_backoff: Duration::from_millis(0),
            ..EngineConfig::default()
        };
        let orchestrator = engine(config);
        let bus = bus_of(&orchestrator);

        bus.set_fail_on_publish(true);
        let saga = orchestrator
            .start_saga(SagaType::OrderPayment, CorrelationId::new(), definitions())
            .await
            .unwrap();
        assert_eq!(bus.publish_count(), 0);

        // Broker comes back; the sweep re-drives the stalled step.
        bus.set_fail_on_publish(false);
        tokio::time::sleep(Duration::from_millis(5)).await;
        let examined = orchestrator.reconcile_once().await.unwrap();

        assert_eq!(examined, 1);
        assert_eq!(bus.published_on("saga.CREATE_ORDER").len(), 1);
        let reloaded = orchestrator.get_saga(saga.id()).await.unwrap();
        assert_eq!(reloaded.steps()[0].retry_count(), 2);
    }

    #[tokio::test]
    async fn test_reconcile_exhausts_retries_then_compensates() {
        let config = EngineConfig {
            max_retries: 2,
            retry_backoff: Duration::from_millis(0),
            saga_timeout: Duration::from_secs(3600),
            ..EngineConfig::default()
        };
        let orchestrator = engine(config);
        let bus = bus_of(&orchestrator);

        let saga = orchestrator
            .start_saga(SagaType::OrderPayment, CorrelationId::new(), definitions())
            .await
            .unwrap();
        complete_step(&orchestrator, &saga, 0).await;

        // Step 1 never answers. First sweep retries (attempt 2), second
        // sweep sees the budget spent and fails it into compensation.
        tokio::time::sleep(Duration::from_millis(5)).await;
        orchestrator.reconcile_once().await.unwrap();
        let reloaded = orchestrator.get_saga(saga.id()).await.unwrap();
        assert_eq!(reloaded.steps()[1].retry_count(), 2);
        assert_eq!(reloaded.status(), SagaStatus::Processing);

        tokio::time::sleep(Duration::from_millis(5)).await;
        orchestrator.reconcile_once().await.unwrap();
        let compensating = orchestrator.get_saga(saga.id()).await.unwrap();
        assert_eq!(compensating.status(), SagaStatus::Compensating);
        assert_eq!(
            compensating.steps()[1].error_message(),
            Some("dispatch retries exhausted")
        );
        assert_eq!(
            bus.published_on(&compensation_topic(StepName::CreateOrder))
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_reconcile_times_out_stalled_saga() {
        let config = EngineConfig {
            saga_timeout: Duration::from_millis(20),
            // Generous backoff so the timeout path is what fires.
            retry_backoff: Duration::from_secs(3600),
            ..EngineConfig::default()
        };
        let orchestrator = engine(config);

        let saga = orchestrator
            .start_saga(SagaType::OrderPayment, CorrelationId::new(), definitions())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        orchestrator.reconcile_once().await.unwrap();

        // Nothing had completed, so there was nothing to compensate.
        let failed = orchestrator.get_saga(saga.id()).await.unwrap();
        assert_eq!(failed.status(), SagaStatus::Failed);
        assert_eq!(
            failed.steps()[0].error_message(),
            Some("timed out waiting for step result")
        );
    }

    #[tokio::test]
    async fn test_reconcile_skips_healthy_in_flight_saga() {
        let config = EngineConfig::default();
        let orchestrator = engine(config);
        let bus = bus_of(&orchestrator);

        orchestrator
            .start_saga(SagaType::OrderPayment, CorrelationId::new(), definitions())
            .await
            .unwrap();

        // Within both the timeout and the backoff window: no extra dispatch.
        orchestrator.reconcile_once().await.unwrap();
        assert_eq!(bus.publish_count(), 1);
    }

    #[tokio::test]
    async fn test_result_for_unknown_saga() {
        let orchestrator = engine(EngineConfig::default());
        let result = orchestrator
            .apply_step_result(SagaId::new(), StepId::new(), StepOutcome::Completed, None)
            .await;
        assert!(matches!(result, Err(OrchestratorError::SagaNotFound(_))));
    }

    #[tokio::test]
    async fn test_list_sagas_by_status() {
        let orchestrator = engine(EngineConfig::default());
        let saga = orchestrator
            .start_saga(SagaType::OrderPayment, CorrelationId::new(), definitions())
            .await
            .unwrap();

        let processing = orchestrator
            .list_sagas(
                SagaFilter::new().status(SagaStatus::Processing),
                Page::default(),
            )
            .await
            .unwrap();
        assert_eq!(processing.len(), 1);
        assert_eq!(processing[0].id(), saga.id());

        let completed = orchestrator
            .list_sagas(
                SagaFilter::new().status(SagaStatus::Completed),
                Page::default(),
            )
            .await
            .unwrap();
        assert!(completed.is_empty());
    }
}
