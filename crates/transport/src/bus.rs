use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;

use crate::Result;

/// Callback invoked with the raw payload of each delivered message.
pub type MessageHandler = Arc<dyn Fn(Vec<u8>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Abstract publish/subscribe contract over the message broker.
///
/// Publishing is fire-and-forget: the orchestrator never blocks on a step
/// executor's business logic; results arrive later as independent messages.
/// Concrete broker adapters (RabbitMQ, Kafka, NATS, ...) live behind this
/// trait and are outside the engine core.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publishes a payload to a topic.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()>;

    /// Registers a handler for every message delivered on a topic.
    ///
    /// Multiple handlers per topic are allowed; each delivered message is
    /// handed to all of them.
    async fn subscribe(&self, topic: &str, handler: MessageHandler) -> Result<()>;

    /// Drops all handlers for a topic. Unsubscribing an unknown topic is a
    /// no-op.
    async fn unsubscribe(&self, topic: &str) -> Result<()>;

    /// Returns true while the broker connection is usable.
    fn is_healthy(&self) -> bool;
}
