//! Saga and step status enums.

use serde::{Deserialize, Serialize};

/// The state of a saga in its lifecycle.
///
/// State transitions:
/// ```text
/// Pending ──► Processing ──┬──► Completed
///                          ├──► Failed (nothing to undo)
///                          └──► Compensating ──► Compensated
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SagaStatus {
    /// Saga created, first step not yet dispatched.
    #[default]
    Pending,

    /// A step is in flight.
    Processing,

    /// Every step completed successfully (terminal state).
    Completed,

    /// A step failed and there was nothing to compensate (terminal state).
    Failed,

    /// A step failed and compensating actions are in progress.
    Compensating,

    /// Every previously-completed step has a compensation result (terminal state).
    Compensated,
}

impl SagaStatus {
    /// Returns true if this is a terminal state.
    ///
    /// `Failed` is only ever persisted once compensation is settled, so it
    /// counts as terminal here.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SagaStatus::Completed | SagaStatus::Failed | SagaStatus::Compensated
        )
    }

    /// Returns the status name as it appears on the wire and in the store.
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaStatus::Pending => "PENDING",
            SagaStatus::Processing => "PROCESSING",
            SagaStatus::Completed => "COMPLETED",
            SagaStatus::Failed => "FAILED",
            SagaStatus::Compensating => "COMPENSATING",
            SagaStatus::Compensated => "COMPENSATED",
        }
    }
}

impl std::fmt::Display for SagaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The state of a single step.
///
/// Forward execution moves `Pending → Completed` or `Pending → Failed`.
/// Compensation moves `Completed → Compensating → Compensated`. Steps that
/// never ran when the saga failed are marked `Cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    /// Step not executed yet (may already be dispatched).
    #[default]
    Pending,

    /// Step executed successfully.
    Completed,

    /// Step reported a failure.
    Failed,

    /// A compensating action for this step is in flight.
    Compensating,

    /// The compensating action finished (or its retries were exhausted).
    Compensated,

    /// Step never ran; the saga failed before it was dispatched.
    Cancelled,
}

impl StepStatus {
    /// Returns the status name as it appears on the wire and in the store.
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "PENDING",
            StepStatus::Completed => "COMPLETED",
            StepStatus::Failed => "FAILED",
            StepStatus::Compensating => "COMPENSATING",
            StepStatus::Compensated => "COMPENSATED",
            StepStatus::Cancelled => "CANCELLED",
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_saga_status_is_pending() {
        assert_eq!(SagaStatus::default(), SagaStatus::Pending);
    }

    #[test]
    fn test_terminal_saga_statuses() {
        assert!(!SagaStatus::Pending.is_terminal());
        assert!(!SagaStatus::Processing.is_terminal());
        assert!(!SagaStatus::Compensating.is_terminal());
        assert!(SagaStatus::Completed.is_terminal());
        assert!(SagaStatus::Failed.is_terminal());
        assert!(SagaStatus::Compensated.is_terminal());
    }

    #[test]
    fn test_display_matches_wire_format() {
        assert_eq!(SagaStatus::Processing.to_string(), "PROCESSING");
        assert_eq!(StepStatus::Compensating.to_string(), "COMPENSATING");
    }

    #[test]
    fn test_serialization_uses_screaming_snake_case() {
        let json = serde_json::to_string(&SagaStatus::Compensated).unwrap();
        assert_eq!(json, "\"COMPENSATED\"");

        let status: StepStatus = serde_json::from_str("\"CANCELLED\"").unwrap();
        assert_eq!(status, StepStatus::Cancelled);
    }
}
