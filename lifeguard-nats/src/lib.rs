//! NATS publisher for `lifeguard` (optional companion crate).
//!
//! Enable the `client` feature to publish to a NATS server. Without it the publisher is
//! inert and every publish fails, so a misconfigured build shows up in the logs instead of
//! silently dropping heartbeats.
//!
//! ```toml
//! lifeguard-nats = { version = "0.1", features = ["client"] }
//! ```
//!
//! ```rust,no_run
//! # #[cfg(feature = "client")]
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! use std::sync::Arc;
//! use std::time::Duration;
//! use lifeguard::{DiscoveryToken, PresenceBroadcaster};
//! use lifeguard_nats::NatsPublisher;
//!
//! let publisher = NatsPublisher::connect("nats://127.0.0.1:4222").await?;
//! let presence = PresenceBroadcaster::new(Arc::new(publisher));
//! let handle = presence.start(DiscoveryToken::up("10.0.0.7"), Duration::from_secs(30))?;
//! # Ok(()) }
//! ```

use async_trait::async_trait;
use lifeguard::{PublishError, Publisher};

/// Publishes payloads to NATS subjects; the topic is used as the subject.
#[derive(Clone)]
pub struct NatsPublisher {
    #[cfg(feature = "client")]
    client: nats::asynk::Connection,
}

impl std::fmt::Debug for NatsPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NatsPublisher").field("client", &cfg!(feature = "client")).finish()
    }
}

impl NatsPublisher {
    /// Connect to the server at `url`.
    #[cfg(feature = "client")]
    pub async fn connect(url: &str) -> Result<Self, PublishError> {
        let client = nats::asynk::connect(url).await.map_err(|e| PublishError::Failed {
            topic: String::new(),
            message: format!("connect to {url}: {e}"),
        })?;
        tracing::info!(target: "lifeguard_nats", url, "connected to nats");
        Ok(Self { client })
    }

    /// Publish through an existing connection.
    #[cfg(feature = "client")]
    pub fn from_connection(client: nats::asynk::Connection) -> Self {
        Self { client }
    }

    /// Publisher that rejects every payload.
    #[cfg(not(feature = "client"))]
    pub fn disabled() -> Self {
        Self {}
    }
}

#[async_trait]
impl Publisher for NatsPublisher {
    async fn publish(&self, payload: Vec<u8>, topic: &str) -> Result<(), PublishError> {
        #[cfg(feature = "client")]
        {
            self.client.publish(topic, payload).await.map_err(|e| PublishError::Failed {
                topic: topic.to_string(),
                message: e.to_string(),
            })
        }

        #[cfg(not(feature = "client"))]
        {
            let _ = payload;
            tracing::debug!(target: "lifeguard_nats", topic, "nats client disabled, dropping payload");
            Err(PublishError::Failed {
                topic: topic.to_string(),
                message: "built without the `client` feature".into(),
            })
        }
    }
}

#[cfg(all(test, not(feature = "client")))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_publisher_fails_every_publish() {
        let publisher = NatsPublisher::disabled();
        let err = publisher.publish(b"{}".to_vec(), "discovery").await.unwrap_err();
        assert!(err.to_string().contains("client"));
    }
}
