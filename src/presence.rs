//! Fleet presence heartbeats.
//!
//! A [`PresenceBroadcaster`] announces this instance on the `"discovery"` topic: one `UP`
//! token per interval for as long as the process runs, and a single bounded `DOWN` publish
//! when [`PresenceHandle::stop`] is called during graceful shutdown. Publish failures are
//! logged and never propagated.
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//! use lifeguard::{DiscoveryToken, MemoryPublisher, PresenceBroadcaster};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let bus = MemoryPublisher::new();
//! let broadcaster = PresenceBroadcaster::new(Arc::new(bus.clone()));
//! let token = DiscoveryToken::up("10.0.0.7");
//! let handle = broadcaster.start(token.clone(), Duration::from_secs(30)).unwrap();
//! // ... serve traffic ...
//! handle.stop(token).await;
//! assert_eq!(bus.messages().last().unwrap().payload, br#"{"state":"DOWN","address":"10.0.0.7"}"#);
//! # }
//! ```

use crate::bus::Publisher;
use crate::error::PublishError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Topic heartbeats are published on.
pub const DISCOVERY_TOPIC: &str = "discovery";

/// Bound on the shutdown `DOWN` publish.
pub const DEFAULT_DEREGISTER_TIMEOUT: Duration = Duration::from_secs(5);

/// Availability announced by a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PresenceState {
    /// Accepting traffic.
    Up,
    /// Leaving the fleet.
    Down,
}

/// Presence announcement, encoded as `{"state": "UP"|"DOWN", "address": "<ip>"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryToken {
    /// Announced state.
    pub state: PresenceState,
    /// Address other fleet members should use.
    pub address: String,
}

impl DiscoveryToken {
    /// `UP` token for `address`.
    pub fn up(address: impl Into<String>) -> Self {
        Self { state: PresenceState::Up, address: address.into() }
    }

    /// `DOWN` token for `address`.
    pub fn down(address: impl Into<String>) -> Self {
        Self { state: PresenceState::Down, address: address.into() }
    }

    /// Same address, different state.
    pub fn with_state(&self, state: PresenceState) -> Self {
        Self { state, address: self.address.clone() }
    }

    /// JSON wire form.
    pub fn to_bytes(&self) -> Result<Vec<u8>, PublishError> {
        serde_json::to_vec(self).map_err(|e| PublishError::Encode(e.to_string()))
    }

    /// Decode the JSON wire form.
    pub fn from_slice(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}

/// Invalid broadcaster settings.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PresenceError {
    /// A zero interval would publish in a hot loop.
    #[error("heartbeat interval must be > 0")]
    ZeroInterval,
}

/// Publishes presence tokens on the message bus.
#[derive(Debug, Clone)]
pub struct PresenceBroadcaster {
    publisher: Arc<dyn Publisher>,
    topic: String,
    deregister_timeout: Duration,
}

impl PresenceBroadcaster {
    /// Broadcaster publishing on [`DISCOVERY_TOPIC`].
    pub fn new(publisher: Arc<dyn Publisher>) -> Self {
        Self {
            publisher,
            topic: DISCOVERY_TOPIC.to_string(),
            deregister_timeout: DEFAULT_DEREGISTER_TIMEOUT,
        }
    }

    /// Publish on `topic` instead.
    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    /// Bound for the shutdown publish.
    pub fn with_deregister_timeout(mut self, timeout: Duration) -> Self {
        self.deregister_timeout = timeout;
        self
    }

    /// Start heartbeating `token` (announced as `UP`) every `interval`.
    ///
    /// The first publish happens immediately. Must be called inside a tokio runtime.
    pub fn start(
        &self,
        token: DiscoveryToken,
        interval: Duration,
    ) -> Result<PresenceHandle, PresenceError> {
        if interval.is_zero() {
            return Err(PresenceError::ZeroInterval);
        }
        let up = token.with_state(PresenceState::Up);
        let (cancel, mut cancelled) = watch::channel(false);
        let publisher = self.publisher.clone();
        let topic = self.topic.clone();

        tracing::info!(
            target: "lifeguard::presence",
            address = %up.address,
            interval_ms = interval.as_millis() as u64,
            "starting presence heartbeat"
        );

        let task = tokio::spawn(async move {
            let beat = async {
                loop {
                    publish_logged(publisher.as_ref(), &up, &topic).await;
                    tokio::time::sleep(interval).await;
                }
            };
            // Cancellation also interrupts a publish that is still in flight.
            tokio::select! {
                _ = beat => {}
                _ = cancelled_signal(&mut cancelled) => {}
            }
        });

        Ok(PresenceHandle {
            cancel,
            task,
            publisher: self.publisher.clone(),
            topic: self.topic.clone(),
            deregister_timeout: self.deregister_timeout,
        })
    }
}

/// Running heartbeat. Dropping the handle leaves the heartbeat running.
#[derive(Debug)]
pub struct PresenceHandle {
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
    publisher: Arc<dyn Publisher>,
    topic: String,
    deregister_timeout: Duration,
}

impl PresenceHandle {
    /// Whether the heartbeat loop is still running.
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stop heartbeating, then publish `token` as `DOWN` once.
    ///
    /// The `DOWN` publish is bounded by the deregister timeout; failure is logged.
    pub async fn stop(self, token: DiscoveryToken) {
        let _ = self.cancel.send(true);
        if let Err(err) = self.task.await {
            tracing::warn!(target: "lifeguard::presence", error = %err, "heartbeat task ended abnormally");
        }

        let down = token.with_state(PresenceState::Down);
        match tokio::time::timeout(
            self.deregister_timeout,
            publish(self.publisher.as_ref(), &down, &self.topic),
        )
        .await
        {
            Ok(Ok(())) => {
                tracing::info!(target: "lifeguard::presence", address = %down.address, "deregistered");
            }
            Ok(Err(err)) => {
                tracing::warn!(target: "lifeguard::presence", error = %err, "deregistration publish failed");
            }
            Err(_) => {
                let err = PublishError::Timeout {
                    topic: self.topic.clone(),
                    timeout: self.deregister_timeout,
                };
                tracing::warn!(target: "lifeguard::presence", error = %err, "deregistration publish failed");
            }
        }
    }
}

/// Resolves once `stop` fires. A dropped handle never resolves it.
async fn cancelled_signal(cancelled: &mut watch::Receiver<bool>) {
    loop {
        match cancelled.changed().await {
            Ok(()) if *cancelled.borrow() => return,
            Ok(()) => continue,
            Err(_) => std::future::pending::<()>().await,
        }
    }
}

async fn publish(
    publisher: &dyn Publisher,
    token: &DiscoveryToken,
    topic: &str,
) -> Result<(), PublishError> {
    let payload = token.to_bytes()?;
    publisher.publish(payload, topic).await
}

async fn publish_logged(publisher: &dyn Publisher, token: &DiscoveryToken, topic: &str) {
    match publish(publisher, token, topic).await {
        Ok(()) => tracing::debug!(target: "lifeguard::presence", address = %token.address, "heartbeat published"),
        Err(err) => tracing::warn!(target: "lifeguard::presence", error = %err, "heartbeat publish failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryPublisher;

    #[test]
    fn token_wire_format() {
        let token = DiscoveryToken::up("172.17.0.4");
        assert_eq!(token.to_bytes().unwrap(), br#"{"state":"UP","address":"172.17.0.4"}"#.to_vec());
        let back = DiscoveryToken::from_slice(br#"{"state":"DOWN","address":"x"}"#).unwrap();
        assert_eq!(back, DiscoveryToken::down("x"));
    }

    #[tokio::test]
    async fn zero_interval_is_rejected() {
        let broadcaster = PresenceBroadcaster::new(Arc::new(MemoryPublisher::new()));
        let err = broadcaster.start(DiscoveryToken::up("a"), Duration::ZERO).unwrap_err();
        assert_eq!(err, PresenceError::ZeroInterval);
    }

    #[tokio::test(start_paused = true)]
    async fn start_forces_up_state() {
        let bus = MemoryPublisher::new();
        let broadcaster = PresenceBroadcaster::new(Arc::new(bus.clone())).with_topic("presence");
        let handle = broadcaster.start(DiscoveryToken::down("a"), Duration::from_secs(1)).unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(handle.is_running());
        let first = DiscoveryToken::from_slice(&bus.payloads("presence")[0]).unwrap();
        assert_eq!(first.state, PresenceState::Up);
        handle.stop(DiscoveryToken::up("a")).await;
        let last = DiscoveryToken::from_slice(&bus.payloads("presence")[1]).unwrap();
        assert_eq!(last.state, PresenceState::Down);
    }
}
