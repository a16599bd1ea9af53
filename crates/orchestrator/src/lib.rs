//! Saga orchestration engine.
//!
//! The orchestrator drives the saga lifecycle over the persistence and
//! transport gateways: it starts sagas, advances to the next step on
//! success, routes failures into backward compensation, and periodically
//! reconciles sagas stuck in a non-terminal state (lost results, broker
//! outages, process restarts).
//!
//! Progress is re-derivable purely from persisted state: after a full
//! restart, repeatedly calling [`SagaOrchestrator::reconcile_once`]
//! converges every saga to a terminal state or to a legitimately
//! still-in-flight one.

pub mod compensation;
pub mod config;
pub mod engine;
pub mod error;
pub mod lock;
pub mod reconciler;

pub use config::EngineConfig;
pub use engine::SagaOrchestrator;
pub use error::OrchestratorError;
pub use reconciler::Reconciler;
