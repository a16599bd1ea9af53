//! Orchestrator error types.

use common::{CorrelationId, SagaId};
use model::ModelError;
use store::StoreError;
use thiserror::Error;
use transport::TransportError;

/// Errors surfaced by the orchestration engine.
///
/// Business-level terminal conditions (step failures, exhausted retries)
/// are never errors; they are recorded in saga state and drive the
/// compensation path instead.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// A non-terminal saga already exists for the correlation id.
    #[error("An active saga already exists for correlation id {0}")]
    DuplicateSaga(CorrelationId),

    /// The saga was not found.
    #[error("Saga not found: {0}")]
    SagaNotFound(SagaId),

    /// The saga already reached a terminal state.
    #[error("Saga {0} is already terminal")]
    AlreadyTerminal(SagaId),

    /// A state-transition rule rejected the operation (out-of-order or
    /// duplicate results land here and are dropped by callers).
    #[error(transparent)]
    Model(#[from] ModelError),

    /// The persistence gateway failed; the operation can be retried by the
    /// caller or by the next reconciliation pass.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The transport gateway failed.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Result type for orchestrator operations.
pub type Result<T> = std::result::Result<T, OrchestratorError>;
