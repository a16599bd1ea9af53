//! The saga aggregate and its state-transition rules.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use common::{CorrelationId, SagaId, StepId};
use serde::{Deserialize, Serialize};

use crate::error::ModelError;
use crate::status::{SagaStatus, StepStatus};
use crate::step::{Step, StepDefinition, StepOutcome};

/// The kind of business transaction a saga coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SagaType {
    OrderPayment,
}

impl SagaType {
    /// Returns the saga type as it appears in the store.
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaType::OrderPayment => "ORDER_PAYMENT",
        }
    }
}

impl std::fmt::Display for SagaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A multi-step business transaction coordinated with backward compensation.
///
/// The saga owns its steps exclusively; the step sequence is fixed at
/// creation and steps are only ever mutated in place. Exactly one step may
/// be in flight at a time, and `updated_at` moves forward on every mutation,
/// which is what timeout detection is based on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Saga {
    id: SagaId,
    correlation_id: CorrelationId,
    saga_type: SagaType,
    status: SagaStatus,
    steps: Vec<Step>,
    timeout: Duration,
    max_retries: u32,
    version: u64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl Saga {
    /// Creates a new saga in `Pending` with all steps `Pending`.
    ///
    /// Steps are assigned sequential zero-based `order` values in the order
    /// the definitions are given.
    pub fn new(
        saga_type: SagaType,
        correlation_id: CorrelationId,
        definitions: Vec<StepDefinition>,
        timeout: Duration,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> Result<Self, ModelError> {
        if definitions.is_empty() {
            return Err(ModelError::NoSteps);
        }

        let id = SagaId::new();
        let steps = definitions
            .into_iter()
            .enumerate()
            .map(|(order, def)| Step::new(id, order as u32, def, now))
            .collect();

        Ok(Self {
            id,
            correlation_id,
            saga_type,
            status: SagaStatus::Pending,
            steps,
            timeout,
            max_retries,
            version: 0,
            created_at: now,
            updated_at: now,
        })
    }

    /// Rebuilds a saga from persisted state. Used by store implementations.
    #[allow(clippy::too_many_arguments)]
    pub fn restore(
        id: SagaId,
        correlation_id: CorrelationId,
        saga_type: SagaType,
        status: SagaStatus,
        steps: Vec<Step>,
        timeout: Duration,
        max_retries: u32,
        version: u64,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            correlation_id,
            saga_type,
            status,
            steps,
            timeout,
            max_retries,
            version,
            created_at,
            updated_at,
        }
    }

    // --- Queries ---

    /// Returns the saga ID.
    pub fn id(&self) -> SagaId {
        self.id
    }

    /// Returns the business correlation ID.
    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    /// Returns the saga type.
    pub fn saga_type(&self) -> SagaType {
        self.saga_type
    }

    /// Returns the saga status.
    pub fn status(&self) -> SagaStatus {
        self.status
    }

    /// Returns the steps in `order` order.
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Returns the stall timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Returns the per-step dispatch retry ceiling.
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Returns the optimistic-concurrency version.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Sets the optimistic-concurrency version after a successful update.
    pub fn set_version(&mut self, version: u64) {
        self.version = version;
    }

    /// Returns when the saga was created.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Returns when the saga was last mutated.
    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Looks up a step by ID.
    pub fn step(&self, step_id: StepId) -> Option<&Step> {
        self.steps.iter().find(|s| s.id() == step_id)
    }

    /// Returns the lowest-`order` step still `Pending`, i.e. the step that is
    /// (or is about to be) in flight. `None` when the saga is complete or
    /// blocked.
    pub fn next_pending_step(&self) -> Option<&Step> {
        self.steps
            .iter()
            .find(|s| s.status() == StepStatus::Pending)
    }

    /// Returns true for `Completed`, `Failed`, and `Compensated`.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Returns true if the saga is non-terminal and has not been touched for
    /// longer than its timeout.
    pub fn is_timed_out(&self, now: DateTime<Utc>) -> bool {
        if self.is_terminal() {
            return false;
        }
        let timeout = TimeDelta::from_std(self.timeout).unwrap_or(TimeDelta::MAX);
        now.signed_duration_since(self.updated_at) > timeout
    }

    /// Returns true when every step that reached a success state has reached
    /// `Compensated`. Only meaningful while the saga is compensating.
    pub fn compensation_complete(&self) -> bool {
        !self.steps.iter().any(|s| {
            matches!(
                s.status(),
                StepStatus::Completed | StepStatus::Compensating
            )
        })
    }

    // --- Transitions ---

    /// Applies a step executor's result for the forward path.
    ///
    /// The step must be the current in-flight step; anything else is a
    /// duplicate or out-of-order delivery and is rejected with
    /// `InvalidStepOrder`, which is the idempotency guard under
    /// at-least-once delivery. On success the saga status is refolded from
    /// its step statuses.
    pub fn apply_step_result(
        &mut self,
        step_id: StepId,
        outcome: StepOutcome,
        error: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), ModelError> {
        if self.is_terminal() || self.status == SagaStatus::Compensating {
            return Err(ModelError::InvalidStepOrder {
                saga_id: self.id,
                step_id,
            });
        }

        let current_id = self.next_pending_step().map(Step::id);
        if current_id != Some(step_id) {
            return if self.step(step_id).is_none() {
                Err(ModelError::StepNotFound(step_id))
            } else {
                Err(ModelError::InvalidStepOrder {
                    saga_id: self.id,
                    step_id,
                })
            };
        }

        let step = self.step_mut(step_id)?;
        match outcome {
            StepOutcome::Completed => {
                step.set_status(StepStatus::Completed, now);
                step.clear_error();
            }
            StepOutcome::Failed => {
                step.set_status(StepStatus::Failed, now);
                step.set_error(error.unwrap_or_else(|| "step failed".to_string()));
            }
        }

        self.updated_at = now;
        self.refold_status();
        Ok(())
    }

    /// Applies a step executor's result for a compensating action.
    ///
    /// The step must be `Compensating`. A failure is recorded but leaves the
    /// step `Compensating` so the reconciler can retry it; compensation never
    /// fails the saga further. When every compensating step has settled the
    /// saga becomes terminal `Compensated`.
    pub fn apply_compensation_result(
        &mut self,
        step_id: StepId,
        outcome: StepOutcome,
        error: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), ModelError> {
        let saga_id = self.id;
        let step = self
            .steps
            .iter_mut()
            .find(|s| s.id() == step_id)
            .ok_or(ModelError::StepNotFound(step_id))?;

        if step.status() != StepStatus::Compensating {
            return Err(ModelError::InvalidStepOrder { saga_id, step_id });
        }

        match outcome {
            StepOutcome::Completed => {
                step.set_status(StepStatus::Compensated, now);
            }
            StepOutcome::Failed => {
                let message = error.unwrap_or_else(|| "compensation failed".to_string());
                step.set_error(message);
                step.set_status(StepStatus::Compensating, now);
            }
        }

        self.updated_at = now;
        self.settle_compensation();
        Ok(())
    }

    /// Marks a step failed with the given reason.
    ///
    /// Used by timeout and retry-exhaustion handling for the in-flight step.
    /// A step that already completed keeps its `Completed` status (it still
    /// needs compensating) but the reason is recorded on it.
    pub fn fail_step(
        &mut self,
        step_id: StepId,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), ModelError> {
        let step = self
            .steps
            .iter_mut()
            .find(|s| s.id() == step_id)
            .ok_or(ModelError::StepNotFound(step_id))?;

        match step.status() {
            StepStatus::Pending => {
                step.set_status(StepStatus::Failed, now);
                step.set_error(reason);
            }
            StepStatus::Completed => {
                step.set_error(reason);
            }
            actual => {
                return Err(ModelError::InvalidStepState {
                    step_id,
                    expected: "PENDING or COMPLETED",
                    actual,
                });
            }
        }

        self.updated_at = now;
        self.refold_status();
        Ok(())
    }

    /// Starts backward compensation after a failure.
    ///
    /// Steps still `Pending` never produced an effect and are `Cancelled`.
    /// Every `Completed` step flips to `Compensating` with a fresh retry
    /// budget. Returns the step IDs to dispatch compensating actions for, in
    /// descending `order`. When nothing ever completed the saga goes straight
    /// to terminal `Failed` and the list is empty.
    pub fn begin_compensation(&mut self, now: DateTime<Utc>) -> Vec<StepId> {
        for step in &mut self.steps {
            if step.status() == StepStatus::Pending {
                step.set_status(StepStatus::Cancelled, now);
            }
        }

        let mut to_compensate: Vec<StepId> = self
            .steps
            .iter()
            .filter(|s| s.status() == StepStatus::Completed)
            .map(Step::id)
            .collect();
        // steps are ordered ascending; compensation walks them in reverse
        to_compensate.reverse();

        for id in &to_compensate {
            if let Some(step) = self.steps.iter_mut().find(|s| s.id() == *id) {
                step.set_status(StepStatus::Compensating, now);
                step.reset_retries();
            }
        }

        self.status = if to_compensate.is_empty() {
            SagaStatus::Failed
        } else {
            SagaStatus::Compensating
        };
        self.updated_at = now;

        to_compensate
    }

    /// Forces a compensating step to `Compensated` with an error annotation
    /// after its retries are exhausted. Compensation must always terminate.
    pub fn force_compensated(
        &mut self,
        step_id: StepId,
        note: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), ModelError> {
        let step = self
            .steps
            .iter_mut()
            .find(|s| s.id() == step_id)
            .ok_or(ModelError::StepNotFound(step_id))?;

        if step.status() != StepStatus::Compensating {
            return Err(ModelError::InvalidStepState {
                step_id,
                expected: "COMPENSATING",
                actual: step.status(),
            });
        }

        step.set_error(note);
        step.set_status(StepStatus::Compensated, now);
        self.updated_at = now;
        self.settle_compensation();
        Ok(())
    }

    /// Records a dispatch attempt for a step (forward or compensating).
    ///
    /// Increments the step's retry count and touches both timestamps; a
    /// `Pending` saga moves to `Processing` on its first forward dispatch.
    pub fn record_dispatch(
        &mut self,
        step_id: StepId,
        now: DateTime<Utc>,
    ) -> Result<(), ModelError> {
        let step = self
            .steps
            .iter_mut()
            .find(|s| s.id() == step_id)
            .ok_or(ModelError::StepNotFound(step_id))?;

        match step.status() {
            StepStatus::Pending | StepStatus::Compensating => step.record_attempt(now),
            actual => {
                return Err(ModelError::InvalidStepState {
                    step_id,
                    expected: "PENDING or COMPENSATING",
                    actual,
                });
            }
        }

        if self.status == SagaStatus::Pending {
            self.status = SagaStatus::Processing;
        }
        self.updated_at = now;
        Ok(())
    }

    /// Recomputes the saga status by folding over step statuses.
    ///
    /// Priority: any `Failed` step fails the saga; else any step in a
    /// compensation state keeps it `Compensating`; else all `Completed`
    /// completes it; otherwise the forward status is unchanged.
    fn refold_status(&mut self) {
        if self
            .steps
            .iter()
            .any(|s| s.status() == StepStatus::Failed)
        {
            self.status = SagaStatus::Failed;
        } else if self.steps.iter().any(|s| {
            matches!(
                s.status(),
                StepStatus::Compensating | StepStatus::Compensated
            )
        }) {
            self.status = SagaStatus::Compensating;
        } else if self
            .steps
            .iter()
            .all(|s| s.status() == StepStatus::Completed)
        {
            self.status = SagaStatus::Completed;
        }
    }

    fn settle_compensation(&mut self) {
        if self.status == SagaStatus::Compensating && self.compensation_complete() {
            self.status = SagaStatus::Compensated;
        }
    }

    fn step_mut(&mut self, step_id: StepId) -> Result<&mut Step, ModelError> {
        self.steps
            .iter_mut()
            .find(|s| s.id() == step_id)
            .ok_or(ModelError::StepNotFound(step_id))
    }
}
