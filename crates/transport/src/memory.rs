use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::{
    Result, TransportError,
    bus::{MessageBus, MessageHandler},
};

#[derive(Default)]
struct BusState {
    handlers: HashMap<String, Vec<MessageHandler>>,
    published: Vec<(String, Vec<u8>)>,
    fail_on_publish: bool,
    healthy: bool,
}

/// In-memory message bus for testing and single-process deployments.
///
/// Handlers run on spawned tasks, so delivery is asynchronous just like a
/// real broker. Published messages are recorded for assertions and the bus
/// can be told to fail publishes to exercise the transient-error path.
#[derive(Clone)]
pub struct InMemoryMessageBus {
    state: Arc<RwLock<BusState>>,
}

impl Default for InMemoryMessageBus {
    fn default() -> Self {
        Self {
            state: Arc::new(RwLock::new(BusState {
                healthy: true,
                ..BusState::default()
            })),
        }
    }
}

impl InMemoryMessageBus {
    /// Creates a new in-memory bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Configures the bus to fail every publish.
    pub fn set_fail_on_publish(&self, fail: bool) {
        self.state.write().unwrap().fail_on_publish = fail;
    }

    /// Flips the health flag.
    pub fn set_healthy(&self, healthy: bool) {
        self.state.write().unwrap().healthy = healthy;
    }

    /// Returns every payload published to a topic, in publish order.
    pub fn published_on(&self, topic: &str) -> Vec<Vec<u8>> {
        self.state
            .read()
            .unwrap()
            .published
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    /// Returns the total number of published messages.
    pub fn publish_count(&self) -> usize {
        self.state.read().unwrap().published.len()
    }

    /// Redelivers the last message published to a topic, simulating the
    /// broker's at-least-once behavior.
    pub fn redeliver_last(&self, topic: &str) {
        let (payload, handlers) = {
            let state = self.state.read().unwrap();
            let payload = state
                .published
                .iter()
                .rev()
                .find(|(t, _)| t == topic)
                .map(|(_, p)| p.clone());
            let handlers = state.handlers.get(topic).cloned().unwrap_or_default();
            (payload, handlers)
        };
        if let Some(payload) = payload {
            for handler in handlers {
                tokio::spawn(handler(payload.clone()));
            }
        }
    }
}

#[async_trait]
impl MessageBus for InMemoryMessageBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        let handlers = {
            let mut state = self.state.write().unwrap();
            if state.fail_on_publish {
                return Err(TransportError::Publish {
                    topic: topic.to_string(),
                    reason: "broker unavailable".to_string(),
                });
            }
            state.published.push((topic.to_string(), payload.clone()));
            state.handlers.get(topic).cloned().unwrap_or_default()
        };

        tracing::debug!(topic, subscribers = handlers.len(), "message published");
        for handler in handlers {
            tokio::spawn(handler(payload.clone()));
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str, handler: MessageHandler) -> Result<()> {
        let mut state = self.state.write().unwrap();
        state
            .handlers
            .entry(topic.to_string())
            .or_default()
            .push(handler);
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<()> {
        let mut state = self.state.write().unwrap();
        state.handlers.remove(topic);
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        self.state.read().unwrap().healthy
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    fn counting_handler(counter: Arc<AtomicUsize>) -> MessageHandler {
        Arc::new(move |_payload| {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        })
    }

    #[tokio::test]
    async fn test_publish_delivers_to_subscribers() {
        let bus = InMemoryMessageBus::new();
        let counter = Arc::new(AtomicUsize::new(0));
        bus.subscribe("saga.CREATE_ORDER", counting_handler(counter.clone()))
            .await
            .unwrap();

        bus.publish("saga.CREATE_ORDER", b"{}".to_vec())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(bus.published_on("saga.CREATE_ORDER").len(), 1);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_recorded() {
        let bus = InMemoryMessageBus::new();
        bus.publish("saga.PROCESS_PAYMENT", b"{}".to_vec())
            .await
            .unwrap();
        assert_eq!(bus.publish_count(), 1);
    }

    #[tokio::test]
    async fn test_fail_on_publish() {
        let bus = InMemoryMessageBus::new();
        bus.set_fail_on_publish(true);

        let result = bus.publish("saga.CREATE_ORDER", b"{}".to_vec()).await;
        assert!(matches!(result, Err(TransportError::Publish { .. })));
        assert_eq!(bus.publish_count(), 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let bus = InMemoryMessageBus::new();
        let counter = Arc::new(AtomicUsize::new(0));
        bus.subscribe("saga.CREATE_ORDER", counting_handler(counter.clone()))
            .await
            .unwrap();
        bus.unsubscribe("saga.CREATE_ORDER").await.unwrap();

        bus.publish("saga.CREATE_ORDER", b"{}".to_vec())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_redeliver_last_duplicates_delivery() {
        let bus = InMemoryMessageBus::new();
        let counter = Arc::new(AtomicUsize::new(0));
        bus.subscribe("saga.CREATE_ORDER", counting_handler(counter.clone()))
            .await
            .unwrap();

        bus.publish("saga.CREATE_ORDER", b"{}".to_vec())
            .await
            .unwrap();
        bus.redeliver_last("saga.CREATE_ORDER");

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_health_flag() {
        let bus = InMemoryMessageBus::new();
        assert!(bus.is_healthy());
        bus.set_healthy(false);
        assert!(!bus.is_healthy());
    }
}
