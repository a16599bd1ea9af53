//! Pure saga/step data model.
//!
//! This crate holds the saga aggregate, its steps, and the state-transition
//! rules that drive sequencing and compensation. Everything here is pure:
//! no I/O, no async, every mutation takes an explicit `now` timestamp so the
//! rules are fully unit-testable.
//!
//! The lifecycle of a saga:
//! 1. Created `Pending` with all steps `Pending`.
//! 2. `Processing` once the first step is dispatched.
//! 3. `Completed` when every step completed, or
//! 4. `Failed` the instant a step fails, which routes into
//! 5. `Compensating` (completed steps undone in reverse order), ending in
//! 6. terminal `Compensated`.

pub mod error;
pub mod saga;
pub mod status;
pub mod step;

pub use error::ModelError;
pub use saga::{Saga, SagaType};
pub use status::{SagaStatus, StepStatus};
pub use step::{Step, StepDefinition, StepName, StepOutcome};
