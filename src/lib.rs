#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # Lifeguard
//!
//! Resilience for outbound calls in async services: per-dependency circuit breakers,
//! retried protected calls, and fleet presence heartbeats.
//!
//! ## Features
//!
//! - **Backoff retrier** with a constant delay and retryable/fatal classification
//! - **Circuit breakers** per dependency with a rolling error-rate window and half-open probes
//! - **Concurrency limiting** per dependency, independent of the error-rate state
//! - **Call executor** composing retry, breaker and timeout with a caller-supplied fallback
//! - **Presence heartbeats** announcing this instance on a message bus
//! - **Live configuration** from TOML or in-memory sources, reloadable on refresh events
//!
//! ## Quick Start
//!
//! ```rust
//! use lifeguard::{RetryPolicy, InstantSleeper, CallError};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let policy = RetryPolicy::<CallError>::builder()
//!         .max_attempts(3)
//!         .delay(Duration::from_millis(100))
//!         .should_retry(CallError::is_retryable)
//!         .with_sleeper(InstantSleeper)
//!         .build();
//!
//!     let result = policy.execute(|| async {
//!         Ok::<_, CallError>(b"ok".to_vec())
//!     }).await;
//!     assert_eq!(result.unwrap(), b"ok");
//! }
//! ```

pub mod adaptive;
pub mod address;
pub mod bus;
pub mod circuit_breaker;
pub mod circuit_breaker_registry;
pub mod clock;
pub mod config;
pub mod error;
pub mod executor;
pub mod prelude;
pub mod presence;
pub mod property;
pub mod retry;
pub mod sleeper;
pub mod telemetry;
pub mod transport;

// Re-exports
pub use adaptive::DynamicConfig;
pub use address::AddressResolver;
pub use bus::{MemoryPublisher, PublishedMessage, Publisher};
pub use circuit_breaker::{
    Admission, BreakerConfig, BreakerConfigBuilder, BreakerConfigError, BreakerSnapshot,
    CircuitBreaker, CircuitState, Permit, Transition,
};
pub use circuit_breaker_registry::{CircuitBreakerRegistry, RegistryError};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::{ConfigSource, MapConfigSource, RefreshEvent, TomlConfigSource};
pub use error::{CallError, ConfigError, PublishError, Rejection};
pub use executor::CallExecutor;
pub use presence::{
    DiscoveryToken, PresenceBroadcaster, PresenceError, PresenceHandle, PresenceState,
    DISCOVERY_TOPIC,
};
pub use property::{BreakerProperty, PropertyResolver};
pub use retry::{run_with_retries, AttemptOutcome, CallAttempt, RetryPolicy, RetryPolicyBuilder};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use transport::{Transport, TransportResponse};

#[cfg(feature = "http")]
pub use transport::ReqwestTransport;
