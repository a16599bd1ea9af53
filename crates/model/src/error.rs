//! Model error types.

use common::{SagaId, StepId};
use thiserror::Error;

use crate::status::StepStatus;

/// Errors raised by the pure state-transition rules.
#[derive(Debug, Error)]
pub enum ModelError {
    /// A saga needs at least one step.
    #[error("Saga must have at least one step")]
    NoSteps,

    /// The step does not belong to the saga.
    #[error("Step not found: {0}")]
    StepNotFound(StepId),

    /// A result was reported for a step that is not the current in-flight
    /// step. Duplicate and late deliveries land here; callers drop and log.
    #[error("Step {step_id} of saga {saga_id} is not the current in-flight step")]
    InvalidStepOrder { saga_id: SagaId, step_id: StepId },

    /// The step is in the wrong state for the requested transition.
    #[error("Step {step_id} is {actual}, expected {expected}")]
    InvalidStepState {
        step_id: StepId,
        expected: &'static str,
        actual: StepStatus,
    },
}

/// Convenience type alias for model results.
pub type Result<T> = std::result::Result<T, ModelError>;
