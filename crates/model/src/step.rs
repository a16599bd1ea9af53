//! Saga steps and their definitions.

use chrono::{DateTime, Utc};
use common::{SagaId, StepId};
use serde::{Deserialize, Serialize};

use crate::status::StepStatus;

/// The business step a saga position refers to.
///
/// Step executors subscribe to exactly the topics derived from these names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepName {
    CreateOrder,
    ProcessPayment,
    UpdateInventory,
}

impl StepName {
    /// Returns the step name as it appears in topics and messages.
    pub fn as_str(&self) -> &'static str {
        match self {
            StepName::CreateOrder => "CREATE_ORDER",
            StepName::ProcessPayment => "PROCESS_PAYMENT",
            StepName::UpdateInventory => "UPDATE_INVENTORY",
        }
    }
}

impl std::fmt::Display for StepName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The result a step executor reports back for a dispatched action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepOutcome {
    /// The business effect (or its compensation) was applied.
    Completed,
    /// The business effect could not be applied.
    Failed,
}

/// Input describing one step of a saga to be created.
///
/// The payload is opaque to the engine; it is handed to the step executor
/// unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    pub name: StepName,
    pub payload: serde_json::Value,
}

impl StepDefinition {
    /// Creates a step definition with the given name and payload.
    pub fn new(name: StepName, payload: serde_json::Value) -> Self {
        Self { name, payload }
    }
}

/// One step of a saga.
///
/// Steps are created atomically with their saga and only ever mutated in
/// place; they are never reordered, inserted, or deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    id: StepId,
    saga_id: SagaId,
    order: u32,
    name: StepName,
    status: StepStatus,
    payload: serde_json::Value,
    error_message: Option<String>,
    retry_count: u32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl Step {
    pub(crate) fn new(
        saga_id: SagaId,
        order: u32,
        definition: StepDefinition,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: StepId::new(),
            saga_id,
            order,
            name: definition.name,
            status: StepStatus::Pending,
            payload: definition.payload,
            error_message: None,
            retry_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns the step ID.
    pub fn id(&self) -> StepId {
        self.id
    }

    /// Returns the owning saga's ID.
    pub fn saga_id(&self) -> SagaId {
        self.saga_id
    }

    /// Returns the step's position within the saga (zero-based).
    pub fn order(&self) -> u32 {
        self.order
    }

    /// Returns the step name.
    pub fn name(&self) -> StepName {
        self.name
    }

    /// Returns the step status.
    pub fn status(&self) -> StepStatus {
        self.status
    }

    /// Returns the opaque executor payload.
    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    /// Returns the error message recorded for this step, if any.
    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    /// Returns the number of dispatch attempts made so far.
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Returns when the step was created.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Returns when the step was last mutated (dispatch counts).
    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub(crate) fn set_status(&mut self, status: StepStatus, now: DateTime<Utc>) {
        self.status = status;
        self.updated_at = now;
    }

    pub(crate) fn set_error(&mut self, message: impl Into<String>) {
        self.error_message = Some(message.into());
    }

    pub(crate) fn clear_error(&mut self) {
        self.error_message = None;
    }

    pub(crate) fn record_attempt(&mut self, now: DateTime<Utc>) {
        self.retry_count += 1;
        self.updated_at = now;
    }

    pub(crate) fn reset_retries(&mut self) {
        self.retry_count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_name_wire_format() {
        assert_eq!(StepName::CreateOrder.as_str(), "CREATE_ORDER");
        assert_eq!(StepName::ProcessPayment.as_str(), "PROCESS_PAYMENT");
        assert_eq!(StepName::UpdateInventory.as_str(), "UPDATE_INVENTORY");

        let json = serde_json::to_string(&StepName::ProcessPayment).unwrap();
        assert_eq!(json, "\"PROCESS_PAYMENT\"");
    }

    #[test]
    fn test_step_outcome_serialization() {
        assert_eq!(
            serde_json::to_string(&StepOutcome::Completed).unwrap(),
            "\"COMPLETED\""
        );
        let outcome: StepOutcome = serde_json::from_str("\"FAILED\"").unwrap();
        assert_eq!(outcome, StepOutcome::Failed);
    }

    #[test]
    fn test_new_step_starts_pending() {
        let saga_id = SagaId::new();
        let now = Utc::now();
        let step = Step::new(
            saga_id,
            0,
            StepDefinition::new(StepName::CreateOrder, serde_json::json!({"sku": "A-1"})),
            now,
        );

        assert_eq!(step.saga_id(), saga_id);
        assert_eq!(step.order(), 0);
        assert_eq!(step.status(), StepStatus::Pending);
        assert_eq!(step.retry_count(), 0);
        assert!(step.error_message().is_none());
        assert_eq!(step.payload()["sku"], "A-1");
    }

    #[test]
    fn test_record_attempt_touches_step() {
        let now = Utc::now();
        let mut step = Step::new(
            SagaId::new(),
            0,
            StepDefinition::new(StepName::CreateOrder, serde_json::Value::Null),
            now,
        );

        let later = now + chrono::TimeDelta::seconds(5);
        step.record_attempt(later);

        assert_eq!(step.retry_count(), 1);
        assert_eq!(step.updated_at(), later);
    }
}
