//! Transport error types.

use thiserror::Error;

/// Errors that can occur when talking to the message broker.
///
/// Publish failures are transient from the saga's point of view: the
/// reconciliation loop re-drives the dispatch, so they never fail a saga.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Publishing to a topic failed.
    #[error("Failed to publish to '{topic}': {reason}")]
    Publish { topic: String, reason: String },

    /// Subscribing to a topic failed.
    #[error("Failed to subscribe to '{topic}': {reason}")]
    Subscribe { topic: String, reason: String },
}

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;
