//! Message bus collaborator.
//!
//! Publishing is fire-and-forget: a successful return means the bus accepted the payload,
//! nothing more. Broker-backed implementations live in companion crates
//! (`lifeguard-nats`).

use crate::error::PublishError;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Hands payloads to a message bus.
#[async_trait]
pub trait Publisher: Send + Sync + std::fmt::Debug {
    /// Publish `payload` on `topic`.
    async fn publish(&self, payload: Vec<u8>, topic: &str) -> Result<(), PublishError>;
}

#[async_trait]
impl<P: Publisher + ?Sized> Publisher for Arc<P> {
    async fn publish(&self, payload: Vec<u8>, topic: &str) -> Result<(), PublishError> {
        (**self).publish(payload, topic).await
    }
}

/// A message captured by [`MemoryPublisher`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    /// Destination topic.
    pub topic: String,
    /// Raw payload.
    pub payload: Vec<u8>,
}

/// In-process publisher that records every message. Clones share the record.
#[derive(Debug, Clone, Default)]
pub struct MemoryPublisher {
    messages: Arc<Mutex<Vec<PublishedMessage>>>,
    failing: Arc<AtomicBool>,
}

impl MemoryPublisher {
    /// Empty recorder that accepts every publish.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent publishes fail (`true`) or succeed (`false`).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Every accepted message, in order.
    pub fn messages(&self) -> Vec<PublishedMessage> {
        self.messages.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Accepted payloads for `topic`, in order.
    pub fn payloads(&self, topic: &str) -> Vec<Vec<u8>> {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|m| m.topic == topic)
            .map(|m| m.payload.clone())
            .collect()
    }

    /// Drop everything recorded so far.
    pub fn clear(&self) {
        self.messages.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

#[async_trait]
impl Publisher for MemoryPublisher {
    async fn publish(&self, payload: Vec<u8>, topic: &str) -> Result<(), PublishError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(PublishError::Failed {
                topic: topic.to_string(),
                message: "publisher unavailable".into(),
            });
        }
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(PublishedMessage { topic: topic.to_string(), payload });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_messages_by_topic() {
        let publisher = MemoryPublisher::new();
        publisher.publish(b"a".to_vec(), "discovery").await.unwrap();
        publisher.publish(b"b".to_vec(), "events").await.unwrap();
        assert_eq!(publisher.payloads("discovery"), vec![b"a".to_vec()]);
        assert_eq!(publisher.messages().len(), 2);
        publisher.clear();
        assert!(publisher.messages().is_empty());
    }

    #[tokio::test]
    async fn failing_publisher_reports_topic() {
        let publisher = MemoryPublisher::new();
        publisher.set_failing(true);
        let err = publisher.publish(b"x".to_vec(), "discovery").await.unwrap_err();
        assert!(matches!(err, PublishError::Failed { ref topic, .. } if topic == "discovery"));
        assert!(publisher.messages().is_empty());

        publisher.set_failing(false);
        let shared: Arc<dyn Publisher> = Arc::new(publisher.clone());
        shared.publish(b"y".to_vec(), "discovery").await.unwrap();
        assert_eq!(publisher.messages().len(), 1);
    }
}
