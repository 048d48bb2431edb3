//! Per-dependency circuit breaker with a rolling error-rate window and concurrency limiter.
//!
//! # States
//! - **Closed**: calls admitted subject to the concurrency limit; outcomes feed the window.
//! - **Open**: every call rejected until `sleep_window` has elapsed since opening.
//! - **HalfOpen**: exactly one probe admitted; its success closes the breaker, its failure
//!   reopens it with a fresh `opened_at`.
//!
//! Closed trips to Open when, within the current window, `request_count >=
//! request_volume_threshold` and the error percentage reaches `error_percent_threshold`.
//! The window resets on every transition to Closed and whenever `rolling_window` elapses.
//!
//! The concurrency limiter is independent of the error-rate machine: a Closed breaker
//! still rejects once `in_flight == max_concurrent_requests`.
//!
//! All counters for one dependency sit behind a single mutex; breakers for different
//! dependencies share nothing.

use crate::adaptive::DynamicConfig;
use crate::clock::{Clock, MonotonicClock};
use crate::error::Rejection;
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Default length of the rolling statistics window.
pub const DEFAULT_ROLLING_WINDOW: Duration = Duration::from_secs(10);

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CircuitState {
    /// Normal operating mode.
    Closed,
    /// Short-circuits calls until the sleep window elapses.
    Open,
    /// Probe mode admitting a single trial call.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => f.write_str("closed"),
            CircuitState::Open => f.write_str("open"),
            CircuitState::HalfOpen => f.write_str("half-open"),
        }
    }
}

/// State change produced by an admission or a recorded outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Closed → Open because the window crossed the error threshold.
    Opened {
        /// Error percentage observed when tripping.
        error_percent: u8,
        /// Requests in the window when tripping.
        request_count: u64,
    },
    /// Open → HalfOpen; the probe was admitted.
    HalfOpened,
    /// HalfOpen → Closed after a successful probe.
    Closed,
    /// HalfOpen → Open after a failed probe.
    Reopened,
}

/// Errors produced when validating breaker configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BreakerConfigError {
    /// Timeout must be > 0.
    #[error("timeout must be > 0")]
    ZeroTimeout,
    /// Concurrency cap must be > 0.
    #[error("max_concurrent_requests must be > 0")]
    ZeroConcurrency,
    /// Error threshold is a percentage.
    #[error("error_percent_threshold must be within 0..=100 (got {0})")]
    PercentOutOfRange(u8),
    /// Rolling window must be > 0.
    #[error("rolling_window must be > 0")]
    ZeroRollingWindow,
}

/// Validated tuning for one dependency. Immutable; a reload swaps in a new value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreakerConfig {
    timeout: Duration,
    max_concurrent_requests: usize,
    error_percent_threshold: u8,
    request_volume_threshold: u64,
    sleep_window: Duration,
    rolling_window: Duration,
}

impl BreakerConfig {
    /// Builder starting from the built-in defaults.
    pub fn builder() -> BreakerConfigBuilder {
        BreakerConfigBuilder::default()
    }

    /// Per-call time budget.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Cap on in-flight calls.
    pub fn max_concurrent_requests(&self) -> usize {
        self.max_concurrent_requests
    }

    /// Error percentage that trips the breaker.
    pub fn error_percent_threshold(&self) -> u8 {
        self.error_percent_threshold
    }

    /// Minimum window sample before tripping is evaluated.
    pub fn request_volume_threshold(&self) -> u64 {
        self.request_volume_threshold
    }

    /// Time an open breaker waits before admitting a probe.
    pub fn sleep_window(&self) -> Duration {
        self.sleep_window
    }

    /// Length of the statistics window.
    pub fn rolling_window(&self) -> Duration {
        self.rolling_window
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(crate::property::DEFAULT_TIMEOUT_MS),
            max_concurrent_requests: crate::property::DEFAULT_MAX_CONCURRENT_REQUESTS as usize,
            error_percent_threshold: crate::property::DEFAULT_ERROR_PERCENT_THRESHOLD as u8,
            request_volume_threshold: crate::property::DEFAULT_REQUEST_VOLUME_THRESHOLD,
            sleep_window: Duration::from_millis(crate::property::DEFAULT_SLEEP_WINDOW_MS),
            rolling_window: DEFAULT_ROLLING_WINDOW,
        }
    }
}

/// Builder for [`BreakerConfig`].
#[derive(Debug, Clone, Default)]
pub struct BreakerConfigBuilder {
    config: BreakerConfig,
}

impl BreakerConfigBuilder {
    /// Per-call time budget.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    /// Cap on in-flight calls.
    pub fn max_concurrent_requests(mut self, max: usize) -> Self {
        self.config.max_concurrent_requests = max;
        self
    }

    /// Error percentage (0-100) that trips the breaker.
    pub fn error_percent_threshold(mut self, percent: u8) -> Self {
        self.config.error_percent_threshold = percent;
        self
    }

    /// Minimum window sample before tripping is evaluated.
    pub fn request_volume_threshold(mut self, volume: u64) -> Self {
        self.config.request_volume_threshold = volume;
        self
    }

    /// Open duration before a probe is admitted.
    pub fn sleep_window(mut self, window: Duration) -> Self {
        self.config.sleep_window = window;
        self
    }

    /// Length of the statistics window.
    pub fn rolling_window(mut self, window: Duration) -> Self {
        self.config.rolling_window = window;
        self
    }

    /// Validate and build.
    pub fn build(self) -> Result<BreakerConfig, BreakerConfigError> {
        let c = self.config;
        if c.timeout.is_zero() {
            return Err(BreakerConfigError::ZeroTimeout);
        }
        if c.max_concurrent_requests == 0 {
            return Err(BreakerConfigError::ZeroConcurrency);
        }
        if c.error_percent_threshold > 100 {
            return Err(BreakerConfigError::PercentOutOfRange(c.error_percent_threshold));
        }
        if c.rolling_window.is_zero() {
            return Err(BreakerConfigError::ZeroRollingWindow);
        }
        Ok(c)
    }
}

#[derive(Debug, Clone)]
struct BreakerState {
    status: CircuitState,
    window_start: u64,
    request_count: u64,
    error_count: u64,
    in_flight: usize,
    opened_at: u64,
    probe_in_flight: bool,
}

impl BreakerState {
    fn new(now: u64) -> Self {
        Self {
            status: CircuitState::Closed,
            window_start: now,
            request_count: 0,
            error_count: 0,
            in_flight: 0,
            opened_at: 0,
            probe_in_flight: false,
        }
    }

    fn reset_window(&mut self, now: u64) {
        self.window_start = now;
        self.request_count = 0;
        self.error_count = 0;
    }

    fn roll(&mut self, now: u64, window: Duration) {
        if now.saturating_sub(self.window_start) >= duration_millis(window) {
            self.reset_window(now);
        }
    }

    fn error_percent(&self) -> u8 {
        if self.request_count == 0 {
            0
        } else {
            ((self.error_count * 100) / self.request_count).min(100) as u8
        }
    }

    fn open_for(&self, now: u64) -> Duration {
        Duration::from_millis(now.saturating_sub(self.opened_at))
    }
}

fn duration_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Point-in-time view of one breaker, for introspection and metrics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreakerSnapshot {
    /// Dependency name.
    pub name: String,
    /// Breaker state.
    pub status: CircuitState,
    /// Requests in the current window.
    pub request_count: u64,
    /// Failures in the current window.
    pub error_count: u64,
    /// Error percentage in the current window.
    pub error_percent: u8,
    /// Calls currently in flight.
    pub in_flight: usize,
    /// Configured cap on in-flight calls.
    pub max_concurrent_requests: usize,
}

/// Result of asking a breaker for admission.
#[derive(Debug)]
pub enum Admission {
    /// The call may proceed; the permit holds its concurrency slot.
    Allowed(Permit),
    /// The call must take its fallback path.
    Rejected(Rejection),
}

impl Admission {
    /// Whether the call was admitted.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed(_))
    }
}

/// Circuit breaker for a single named dependency.
pub struct CircuitBreaker {
    name: String,
    config: DynamicConfig<BreakerConfig>,
    state: Mutex<BreakerState>,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config.get())
            .field("state", &*self.lock())
            .finish()
    }
}

impl CircuitBreaker {
    /// Closed breaker on the monotonic clock.
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self::with_clock(name, config, Arc::new(MonotonicClock::default()))
    }

    /// Closed breaker on a caller-supplied clock.
    pub fn with_clock(
        name: impl Into<String>,
        config: BreakerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let now = clock.now_millis();
        Self {
            name: name.into(),
            config: DynamicConfig::new(config),
            state: Mutex::new(BreakerState::new(now)),
            clock,
        }
    }

    /// Dependency name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current tuning.
    pub fn config(&self) -> Arc<BreakerConfig> {
        self.config.get()
    }

    /// Swap in new tuning; counters and state are kept.
    pub fn reconfigure(&self, config: BreakerConfig) {
        tracing::info!(target: "lifeguard::circuit_breaker", name = %self.name, ?config, "circuit reconfigured");
        self.config.set(config);
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Ask for admission. Never blocks; a rejection is returned synchronously.
    pub fn try_acquire(self: &Arc<Self>) -> Admission {
        let config = self.config.get();
        let now = self.clock.now_millis();
        let mut st = self.lock();

        let mut probe = false;
        match st.status {
            CircuitState::Closed => st.roll(now, config.rolling_window),
            CircuitState::Open => {
                if now.saturating_sub(st.opened_at) < duration_millis(config.sleep_window) {
                    return Admission::Rejected(Rejection::CircuitOpen { open_for: st.open_for(now) });
                }
                st.status = CircuitState::HalfOpen;
                st.probe_in_flight = false;
                tracing::info!(target: "lifeguard::circuit_breaker", name = %self.name, "circuit → half-open");
                probe = true;
            }
            CircuitState::HalfOpen => {
                if st.probe_in_flight {
                    return Admission::Rejected(Rejection::CircuitOpen { open_for: st.open_for(now) });
                }
                probe = true;
            }
        }

        if st.in_flight >= config.max_concurrent_requests {
            tracing::debug!(
                target: "lifeguard::circuit_breaker",
                name = %self.name,
                in_flight = st.in_flight,
                max = config.max_concurrent_requests,
                "max concurrency reached"
            );
            return Admission::Rejected(Rejection::MaxConcurrency {
                in_flight: st.in_flight,
                max: config.max_concurrent_requests,
            });
        }

        st.in_flight += 1;
        if probe {
            st.probe_in_flight = true;
        }
        drop(st);

        Admission::Allowed(Permit { breaker: self.clone(), probe, settled: false })
    }

    /// Record an outcome that was not admitted through a [`Permit`]. In HalfOpen the outcome
    /// resolves the trial; in Open it is ignored.
    pub fn record_outcome(&self, success: bool) -> Option<Transition> {
        let mut st = self.lock();
        let probe = st.status == CircuitState::HalfOpen;
        self.apply_outcome(&mut st, success, probe)
    }

    /// Whether the breaker is refusing normal traffic (Open or HalfOpen).
    pub fn is_open(&self) -> bool {
        self.lock().status != CircuitState::Closed
    }

    /// Current state.
    pub fn state(&self) -> CircuitState {
        self.lock().status
    }

    /// Calls currently holding a permit.
    pub fn in_flight(&self) -> usize {
        self.lock().in_flight
    }

    /// Force Closed with fresh counters. In-flight accounting is preserved.
    pub fn reset(&self) {
        let now = self.clock.now_millis();
        let mut st = self.lock();
        st.status = CircuitState::Closed;
        st.probe_in_flight = false;
        st.opened_at = 0;
        st.reset_window(now);
        tracing::info!(target: "lifeguard::circuit_breaker", name = %self.name, "circuit reset");
    }

    /// Point-in-time view.
    pub fn snapshot(&self) -> BreakerSnapshot {
        let config = self.config.get();
        let st = self.lock();
        BreakerSnapshot {
            name: self.name.clone(),
            status: st.status,
            request_count: st.request_count,
            error_count: st.error_count,
            error_percent: st.error_percent(),
            in_flight: st.in_flight,
            max_concurrent_requests: config.max_concurrent_requests,
        }
    }

    fn settle(&self, probe: bool, outcome: Option<bool>) -> Option<Transition> {
        let mut st = self.lock();
        st.in_flight = st.in_flight.saturating_sub(1);
        match outcome {
            Some(success) => self.apply_outcome(&mut st, success, probe),
            None => {
                // Abandoned probe: let the next caller try.
                if probe && st.status == CircuitState::HalfOpen {
                    st.probe_in_flight = false;
                }
                None
            }
        }
    }

    fn apply_outcome(
        &self,
        st: &mut BreakerState,
        success: bool,
        probe: bool,
    ) -> Option<Transition> {
        let config = self.config.get();
        let now = self.clock.now_millis();

        match st.status {
            CircuitState::Closed => {
                st.roll(now, config.rolling_window);
                st.request_count += 1;
                if !success {
                    st.error_count += 1;
                }
                let tripped = st.request_count >= config.request_volume_threshold
                    && st.error_count * 100
                        >= u64::from(config.error_percent_threshold) * st.request_count;
                if !success && tripped {
                    let error_percent = st.error_percent();
                    let request_count = st.request_count;
                    st.status = CircuitState::Open;
                    st.opened_at = now;
                    st.probe_in_flight = false;
                    tracing::error!(
                        target: "lifeguard::circuit_breaker",
                        name = %self.name,
                        error_percent,
                        requests = request_count,
                        threshold = config.error_percent_threshold,
                        "circuit → open"
                    );
                    return Some(Transition::Opened { error_percent, request_count });
                }
                None
            }
            CircuitState::HalfOpen if probe => {
                st.probe_in_flight = false;
                if success {
                    st.status = CircuitState::Closed;
                    st.opened_at = 0;
                    st.reset_window(now);
                    tracing::info!(target: "lifeguard::circuit_breaker", name = %self.name, "circuit → closed");
                    Some(Transition::Closed)
                } else {
                    st.status = CircuitState::Open;
                    st.opened_at = now;
                    tracing::warn!(target: "lifeguard::circuit_breaker", name = %self.name, "probe failed, circuit → open");
                    Some(Transition::Reopened)
                }
            }
            // Late results from calls admitted before the breaker opened.
            CircuitState::HalfOpen | CircuitState::Open => None,
        }
    }
}

/// Admission ticket for one call. Holds a concurrency slot until settled or dropped.
///
/// Dropping a permit without settling it releases the slot and, for a probe, lets the next
/// caller probe instead; no outcome is recorded.
pub struct Permit {
    breaker: Arc<CircuitBreaker>,
    probe: bool,
    settled: bool,
}

impl fmt::Debug for Permit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Permit")
            .field("breaker", &self.breaker.name)
            .field("probe", &self.probe)
            .finish()
    }
}

impl Permit {
    /// Whether this call is the half-open trial.
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    /// Release the slot and record a success.
    pub fn succeed(self) -> Option<Transition> {
        self.complete(true)
    }

    /// Release the slot and record a failure.
    pub fn fail(self) -> Option<Transition> {
        self.complete(false)
    }

    /// Release the slot and record the outcome.
    pub fn complete(mut self, success: bool) -> Option<Transition> {
        self.settled = true;
        self.breaker.settle(self.probe, Some(success))
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.settle(self.probe, None);
        }
    }
}
