//! Wire schema and topic naming convention.
//!
//! Forward dispatch publishes to `saga.<STEP_NAME>`, compensation to
//! `saga.compensation.<STEP_NAME>`. Step executors report back on the
//! shared result topics.

use common::{CorrelationId, SagaId, StepId};
use model::{Saga, Step, StepName, StepOutcome};
use serde::{Deserialize, Serialize};

/// Topic executors publish forward step results to.
pub const RESULTS_TOPIC: &str = "saga.results";

/// Topic executors publish compensation results to.
pub const COMPENSATION_RESULTS_TOPIC: &str = "saga.compensation.results";

/// Returns the forward dispatch topic for a step, e.g. `saga.CREATE_ORDER`.
pub fn step_topic(name: StepName) -> String {
    format!("saga.{}", name.as_str())
}

/// Returns the compensation topic for a step, e.g.
/// `saga.compensation.PROCESS_PAYMENT`.
pub fn compensation_topic(name: StepName) -> String {
    format!("saga.compensation.{}", name.as_str())
}

/// The step portion of a dispatch message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepEnvelope {
    pub id: StepId,
    pub name: StepName,
    pub payload: serde_json::Value,
}

/// Message published to a step's dispatch or compensation topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepMessage {
    pub saga_id: SagaId,
    pub correlation_id: CorrelationId,
    pub step: StepEnvelope,
}

impl StepMessage {
    /// Builds the dispatch message for one step of a saga.
    pub fn for_step(saga: &Saga, step: &Step) -> Self {
        Self {
            saga_id: saga.id(),
            correlation_id: saga.correlation_id(),
            step: StepEnvelope {
                id: step.id(),
                name: step.name(),
                payload: step.payload().clone(),
            },
        }
    }
}

/// Message a step executor publishes on a result topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResultMessage {
    pub saga_id: SagaId,
    pub step_id: StepId,
    pub status: StepOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StepResultMessage {
    /// Builds a success result for a step.
    pub fn success(saga_id: SagaId, step_id: StepId) -> Self {
        Self {
            saga_id,
            step_id,
            status: StepOutcome::Completed,
            error: None,
        }
    }

    /// Builds a failure result for a step.
    pub fn failure(saga_id: SagaId, step_id: StepId, error: impl Into<String>) -> Self {
        Self {
            saga_id,
            step_id,
            status: StepOutcome::Failed,
            error: Some(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_naming_convention() {
        assert_eq!(step_topic(StepName::CreateOrder), "saga.CREATE_ORDER");
        assert_eq!(
            compensation_topic(StepName::ProcessPayment),
            "saga.compensation.PROCESS_PAYMENT"
        );
    }

    #[test]
    fn test_step_message_wire_format() {
        let msg = StepMessage {
            saga_id: SagaId::new(),
            correlation_id: CorrelationId::new(),
            step: StepEnvelope {
                id: StepId::new(),
                name: StepName::UpdateInventory,
                payload: serde_json::json!({"sku": "A-1", "qty": 2}),
            },
        };

        let json = serde_json::to_value(&msg).unwrap();
        assert!(json["saga_id"].is_string());
        assert!(json["correlation_id"].is_string());
        assert_eq!(json["step"]["name"], "UPDATE_INVENTORY");
        assert_eq!(json["step"]["payload"]["qty"], 2);

        let back: StepMessage = serde_json::from_value(json).unwrap();
        assert_eq!(back.step.id, msg.step.id);
    }

    #[test]
    fn test_result_message_omits_absent_error() {
        let ok = StepResultMessage::success(SagaId::new(), StepId::new());
        let json = serde_json::to_value(&ok).unwrap();
        assert_eq!(json["status"], "COMPLETED");
        assert!(json.get("error").is_none());

        let failed = StepResultMessage::failure(SagaId::new(), StepId::new(), "card declined");
        let json = serde_json::to_value(&failed).unwrap();
        assert_eq!(json["status"], "FAILED");
        assert_eq!(json["error"], "card declined");
    }
}
