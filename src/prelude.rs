//! Convenient re-exports for common Lifeguard types.
pub use crate::{
    bus::{MemoryPublisher, Publisher},
    circuit_breaker::{Admission, BreakerConfig, CircuitState},
    circuit_breaker_registry::CircuitBreakerRegistry,
    config::{ConfigSource, MapConfigSource, TomlConfigSource},
    error::{CallError, ConfigError, Rejection},
    executor::CallExecutor,
    presence::{DiscoveryToken, PresenceBroadcaster, DISCOVERY_TOPIC},
    property::PropertyResolver,
    retry::{run_with_retries, RetryPolicy},
    telemetry::{LogSink, MemorySink, PolicyEvent},
    transport::{Transport, TransportResponse},
};
