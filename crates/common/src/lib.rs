//! Shared identifier types used across the saga engine crates.

pub mod types;

pub use types::{CorrelationId, SagaId, StepId};
