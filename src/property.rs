//! Resolution of per-dependency breaker tuning.
//!
//! Each of the five known properties is looked up under
//! `hystrix.command.<dependency>.<Property>` and falls back to a built-in default. The
//! property set is closed: asking for anything else is a [`ConfigError::UnknownProperty`],
//! which startup code is expected to treat as fatal.

use crate::circuit_breaker::BreakerConfig;
use crate::config::ConfigSource;
use crate::error::ConfigError;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Default per-call timeout, in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 1_000;
/// Default cap on in-flight calls per dependency.
pub const DEFAULT_MAX_CONCURRENT_REQUESTS: u64 = 10;
/// Default minimum sample size before error-rate tripping is evaluated.
pub const DEFAULT_REQUEST_VOLUME_THRESHOLD: u64 = 20;
/// Default time an open breaker waits before admitting a probe, in milliseconds.
pub const DEFAULT_SLEEP_WINDOW_MS: u64 = 5_000;
/// Default error percentage that trips the breaker.
pub const DEFAULT_ERROR_PERCENT_THRESHOLD: u64 = 50;

const KEY_PREFIX: &str = "hystrix.command";

/// The tunable breaker properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BreakerProperty {
    /// Per-call time budget (ms).
    Timeout,
    /// In-flight cap.
    MaxConcurrentRequests,
    /// Error percentage (0-100) that trips the breaker.
    ErrorPercentThreshold,
    /// Minimum requests in the window before tripping is considered.
    RequestVolumeThreshold,
    /// Open duration before a probe (ms).
    SleepWindow,
}

impl BreakerProperty {
    /// Every known property.
    pub const ALL: [BreakerProperty; 5] = [
        BreakerProperty::Timeout,
        BreakerProperty::MaxConcurrentRequests,
        BreakerProperty::ErrorPercentThreshold,
        BreakerProperty::RequestVolumeThreshold,
        BreakerProperty::SleepWindow,
    ];

    /// Name as it appears in configuration keys.
    pub fn as_str(self) -> &'static str {
        match self {
            BreakerProperty::Timeout => "Timeout",
            BreakerProperty::MaxConcurrentRequests => "MaxConcurrentRequests",
            BreakerProperty::ErrorPercentThreshold => "ErrorPercentThreshold",
            BreakerProperty::RequestVolumeThreshold => "RequestVolumeThreshold",
            BreakerProperty::SleepWindow => "SleepWindow",
        }
    }

    /// Built-in value used when nothing is configured.
    pub fn default_value(self) -> u64 {
        match self {
            BreakerProperty::Timeout => DEFAULT_TIMEOUT_MS,
            BreakerProperty::MaxConcurrentRequests => DEFAULT_MAX_CONCURRENT_REQUESTS,
            BreakerProperty::ErrorPercentThreshold => DEFAULT_ERROR_PERCENT_THRESHOLD,
            BreakerProperty::RequestVolumeThreshold => DEFAULT_REQUEST_VOLUME_THRESHOLD,
            BreakerProperty::SleepWindow => DEFAULT_SLEEP_WINDOW_MS,
        }
    }

    /// Configuration key for `dependency`.
    pub fn key(self, dependency: &str) -> String {
        format!("{KEY_PREFIX}.{dependency}.{}", self.as_str())
    }
}

impl fmt::Display for BreakerProperty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BreakerProperty {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BreakerProperty::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| ConfigError::UnknownProperty { property: s.to_string() })
    }
}

/// Looks up breaker properties in a [`ConfigSource`], falling back to defaults.
#[derive(Debug, Clone)]
pub struct PropertyResolver {
    source: Arc<dyn ConfigSource>,
}

impl PropertyResolver {
    /// Resolve against `source`.
    pub fn new<S: ConfigSource + 'static>(source: S) -> Self {
        Self { source: Arc::new(source) }
    }

    /// Resolve against an already shared source.
    pub fn from_shared(source: Arc<dyn ConfigSource>) -> Self {
        Self { source }
    }

    /// Underlying source.
    pub fn source(&self) -> &Arc<dyn ConfigSource> {
        &self.source
    }

    /// Configured override for `(dependency, property)` or the property's default.
    pub fn resolve(&self, dependency: &str, property: BreakerProperty) -> Result<u64, ConfigError> {
        let key = property.key(dependency);
        match self.source.get(&key) {
            Some(raw) => raw
                .trim()
                .parse::<u64>()
                .map_err(|_| ConfigError::InvalidValue { key, value: raw }),
            None => Ok(property.default_value()),
        }
    }

    /// Like [`resolve`](Self::resolve) with the property named by string.
    pub fn resolve_named(&self, dependency: &str, property: &str) -> Result<u64, ConfigError> {
        self.resolve(dependency, property.parse()?)
    }

    /// Resolve every property for `dependency` into a validated config.
    pub fn resolve_config(&self, dependency: &str) -> Result<BreakerConfig, ConfigError> {
        let config = BreakerConfig::builder()
            .timeout(Duration::from_millis(self.resolve(dependency, BreakerProperty::Timeout)?))
            .max_concurrent_requests(to_usize(
                dependency,
                BreakerProperty::MaxConcurrentRequests,
                self.resolve(dependency, BreakerProperty::MaxConcurrentRequests)?,
            )?)
            .error_percent_threshold(clamp_percent(
                dependency,
                self.resolve(dependency, BreakerProperty::ErrorPercentThreshold)?,
            )?)
            .request_volume_threshold(
                self.resolve(dependency, BreakerProperty::RequestVolumeThreshold)?,
            )
            .sleep_window(Duration::from_millis(
                self.resolve(dependency, BreakerProperty::SleepWindow)?,
            ))
            .build()
            .map_err(|reason| ConfigError::Invalid {
                name: dependency.to_string(),
                reason: reason.to_string(),
            })?;
        tracing::info!(
            target: "lifeguard::property",
            dependency,
            timeout_ms = config.timeout().as_millis() as u64,
            max_concurrent = config.max_concurrent_requests(),
            error_percent = config.error_percent_threshold(),
            volume = config.request_volume_threshold(),
            sleep_window_ms = config.sleep_window().as_millis() as u64,
            "circuit settings resolved"
        );
        Ok(config)
    }
}

fn to_usize(dependency: &str, property: BreakerProperty, value: u64) -> Result<usize, ConfigError> {
    usize::try_from(value).map_err(|_| ConfigError::InvalidValue {
        key: property.key(dependency),
        value: value.to_string(),
    })
}

fn clamp_percent(dependency: &str, value: u64) -> Result<u8, ConfigError> {
    u8::try_from(value).ok().filter(|v| *v <= 100).ok_or_else(|| ConfigError::InvalidValue {
        key: BreakerProperty::ErrorPercentThreshold.key(dependency),
        value: value.to_string(),
    })
}
