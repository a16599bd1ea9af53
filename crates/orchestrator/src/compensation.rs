//! The backward path: compensating completed steps after a failure.
//!
//! Compensation fans out: every completed step gets its compensating
//! action dispatched at once, in reverse step order. Compensating actions
//! must be idempotent (they can be redelivered) and the walk always
//! terminates: a compensating step whose retries run out is forced to
//! `Compensated` with the failure recorded on it, rather than wedging the
//! saga forever.

use chrono::{DateTime, Utc};
use common::{SagaId, StepId};
use model::{Saga, SagaStatus, StepOutcome, StepStatus};
use store::SagaStore;
use transport::{MessageBus, StepMessage, compensation_topic};

use crate::engine::SagaOrchestrator;
use crate::error::{OrchestratorError, Result};

impl<S: SagaStore, B: MessageBus> SagaOrchestrator<S, B> {
    /// Applies a step executor's result for a compensating action.
    ///
    /// A failed compensation leaves the step `Compensating` so the
    /// reconciler retries it; once every step settles the saga becomes
    /// terminal `Compensated`.
    #[tracing::instrument(skip(self, error))]
    pub async fn apply_compensation_result(
        &self,
        saga_id: SagaId,
        step_id: StepId,
        outcome: StepOutcome,
        error: Option<String>,
    ) -> Result<()> {
        let lock = self.locks().lock_for(saga_id);
        let _guard = lock.lock().await;

        let mut saga = self.get_saga(saga_id).await?;
        let now = Utc::now();
        if let Err(e) = saga.apply_compensation_result(step_id, outcome, error, now) {
            tracing::warn!(error = %e, "compensation result dropped");
            return Err(e.into());
        }

        self.persist(&mut saga).await?;
        if saga.status() == SagaStatus::Compensated {
            self.record_compensated(&saga);
        }
        Ok(())
    }

    /// Fails a saga from the outside and rolls back whatever completed.
    ///
    /// Used by operators and by executors that detect a business problem
    /// after reporting success. A saga already compensating is left alone;
    /// a terminal one is rejected.
    #[tracing::instrument(skip(self, reason))]
    pub async fn request_compensation(
        &self,
        saga_id: SagaId,
        step_id: StepId,
        reason: &str,
    ) -> Result<()> {
        let lock = self.locks().lock_for(saga_id);
        let _guard = lock.lock().await;

        let mut saga = self.get_saga(saga_id).await?;
        if saga.is_terminal() {
            return Err(OrchestratorError::AlreadyTerminal(saga_id));
        }
        if saga.status() == SagaStatus::Compensating {
            tracing::debug!("compensation already in progress");
            return Ok(());
        }

        saga.fail_step(step_id, reason, Utc::now())?;
        tracing::warn!(reason, "compensation requested");
        self.start_compensation(&mut saga).await
    }

    /// Cancels pending steps, flips completed ones to `Compensating`, and
    /// dispatches all compensating actions. Caller holds the saga lock.
    ///
    /// State is persisted in a single write before anything is published;
    /// lost publishes are retried by the reconciler.
    pub(crate) async fn start_compensation(&self, saga: &mut Saga) -> Result<()> {
        let now = Utc::now();
        let to_compensate = saga.begin_compensation(now);
        for step_id in &to_compensate {
            saga.record_dispatch(*step_id, now)?;
        }
        self.persist(saga).await?;

        if to_compensate.is_empty() {
            metrics::counter!("saga_failed_total").increment(1);
            tracing::warn!(saga_id = %saga.id(), "saga failed, nothing to compensate");
            self.locks().remove(saga.id());
            return Ok(());
        }

        metrics::counter!("saga_compensations_started_total").increment(1);
        tracing::warn!(
            saga_id = %saga.id(),
            steps = to_compensate.len(),
            "compensating completed steps"
        );
        for step_id in to_compensate {
            self.publish_compensation(saga, step_id).await;
        }
        Ok(())
    }

    /// Retries stalled compensating actions and force-settles those whose
    /// retry budget is spent. Caller holds the saga lock.
    pub(crate) async fn reconcile_compensation(
        &self,
        saga: &mut Saga,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let exhausted: Vec<StepId> = saga
            .steps()
            .iter()
            .filter(|s| {
                s.status() == StepStatus::Compensating && s.retry_count() >= saga.max_retries()
            })
            .map(|s| s.id())
            .collect();
        for step_id in exhausted {
            tracing::error!(
                saga_id = %saga.id(),
                step = %step_id,
                "compensation retries exhausted, forcing settlement"
            );
            metrics::counter!("saga_compensations_exhausted_total").increment(1);
            saga.force_compensated(step_id, "compensation retries exhausted", now)?;
        }

        let to_retry: Vec<StepId> = saga
            .steps()
            .iter()
            .filter(|s| {
                s.status() == StepStatus::Compensating
                    && self.backoff_elapsed(s.updated_at(), now)
            })
            .map(|s| s.id())
            .collect();
        for step_id in &to_retry {
            saga.record_dispatch(*step_id, now)?;
            metrics::counter!("saga_compensation_retries_total").increment(1);
        }

        self.persist(saga).await?;
        if saga.status() == SagaStatus::Compensated {
            self.record_compensated(saga);
            return Ok(());
        }
        for step_id in to_retry {
            self.publish_compensation(saga, step_id).await;
        }
        Ok(())
    }

    async fn publish_compensation(&self, saga: &Saga, step_id: StepId) {
        let Some(step) = saga.step(step_id) else {
            return;
        };
        let topic = compensation_topic(step.name());
        let message = StepMessage::for_step(saga, step);
        metrics::counter!("saga_compensation_dispatches_total").increment(1);
        tracing::debug!(
            saga_id = %saga.id(),
            step = %step.name(),
            attempt = step.retry_count(),
            "dispatching compensating action"
        );
        self.publish(&topic, &message).await;
    }

    pub(crate) fn record_compensated(&self, saga: &Saga) {
        metrics::counter!("saga_compensated_total").increment(1);
        tracing::info!(saga_id = %saga.id(), "saga compensated");
        self.locks().remove(saga.id());
    }
}
