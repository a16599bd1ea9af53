//! Pub/sub gateway used to dispatch saga steps and receive results.
//!
//! Delivery is at-least-once: the broker may redeliver a message, so every
//! consumer, the orchestrator included, must be idempotent. The engine's
//! defense is the model-level in-flight-step guard; executors are expected
//! to guard on step id.

pub mod bus;
pub mod error;
pub mod memory;
pub mod message;

pub use bus::{MessageBus, MessageHandler};
pub use error::{Result, TransportError};
pub use memory::InMemoryMessageBus;
pub use message::{
    COMPENSATION_RESULTS_TOPIC, RESULTS_TOPIC, StepEnvelope, StepMessage, StepResultMessage,
    compensation_topic, step_topic,
};
