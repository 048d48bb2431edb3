//! Telemetry for protected calls and breaker transitions.
//!
//! The executor emits a [`PolicyEvent`] for every call outcome and every breaker
//! transition. Events flow into a `TelemetrySink`, which is a `tower::Service<PolicyEvent>`
//! so sinks compose with ordinary tower combinators.
//!
//! # Event Types
//!
//! - **Call**: `Succeeded`, `Failed`, `TimedOut`, `Rejected`
//! - **Breaker**: `Opened`, `HalfOpen`, `Closed`, `Reopened`
//!
//! ```rust
//! use lifeguard::telemetry::{BreakerEvent, CallEvent, PolicyEvent};
//!
//! let opened = PolicyEvent::Breaker(BreakerEvent::Opened {
//!     name: "quotes".into(),
//!     error_percent: 100,
//!     request_count: 20,
//! });
//! let rejected = PolicyEvent::Call(CallEvent::Rejected {
//!     name: "quotes".into(),
//!     reason: "circuit open".into(),
//! });
//! assert_eq!(opened.name(), rejected.name());
//! ```

use crate::bus::Publisher;
use crate::circuit_breaker::Transition;
use crate::error::PublishError;
use serde::Serialize;
use std::convert::Infallible;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tower::Service;

/// Topic [`BusSink`] publishes to unless told otherwise.
pub const DEFAULT_EVENTS_TOPIC: &str = "lifeguard.events";

/// A telemetry sink that consumes policy events.
///
/// # Implementing a Custom Sink
///
/// ```rust
/// use lifeguard::telemetry::{PolicyEvent, TelemetrySink};
/// use tower::Service;
/// use std::task::{Context, Poll};
/// use std::pin::Pin;
/// use std::future::Future;
///
/// #[derive(Clone)]
/// struct PrintSink;
///
/// impl Service<PolicyEvent> for PrintSink {
///     type Response = ();
///     type Error = std::convert::Infallible;
///     type Future = Pin<Box<dyn Future<Output = Result<(), Self::Error>> + Send>>;
///
///     fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
///         Poll::Ready(Ok(()))
///     }
///
///     fn call(&mut self, event: PolicyEvent) -> Self::Future {
///         println!("{event}");
///         Box::pin(async { Ok(()) })
///     }
/// }
///
/// impl TelemetrySink for PrintSink {
///     type SinkError = std::convert::Infallible;
/// }
/// ```
pub trait TelemetrySink:
    tower::Service<PolicyEvent, Response = (), Error = Self::SinkError> + Clone + Send + 'static
{
    /// The error type for this sink.
    type SinkError: std::error::Error + Send + 'static;
}

/// Best-effort emit helper that honors `poll_ready` and swallows errors.
pub async fn emit_best_effort<S>(sink: S, event: PolicyEvent)
where
    S: tower::Service<PolicyEvent, Response = ()> + Send + Clone + 'static,
    S::Error: std::error::Error + Send + 'static,
    S::Future: Send + 'static,
{
    use tower::ServiceExt;

    if let Ok(mut ready_sink) = sink.ready_oneshot().await {
        let _ = ready_sink.call(event).await;
    }
}

/// Events emitted while protecting calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "event", rename_all = "snake_case")]
pub enum PolicyEvent {
    /// Outcome of one `execute` call.
    Call(CallEvent),
    /// Breaker state change.
    Breaker(BreakerEvent),
}

impl PolicyEvent {
    /// Dependency the event concerns.
    pub fn name(&self) -> &str {
        match self {
            PolicyEvent::Call(e) => e.name(),
            PolicyEvent::Breaker(e) => e.name(),
        }
    }
}

/// How a protected call ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CallEvent {
    /// The call returned a body.
    Succeeded {
        /// Dependency name.
        name: String,
        /// Wall time spent, in milliseconds.
        duration_ms: u64,
    },
    /// Every attempt failed; the fallback ran.
    Failed {
        /// Dependency name.
        name: String,
        /// Wall time spent, in milliseconds.
        duration_ms: u64,
        /// Last failure.
        error: String,
    },
    /// The caller stopped waiting; the fallback ran.
    TimedOut {
        /// Dependency name.
        name: String,
        /// Limit that was exceeded, in milliseconds.
        timeout_ms: u64,
    },
    /// The breaker refused the call; the fallback ran.
    Rejected {
        /// Dependency name.
        name: String,
        /// Rejection reason.
        reason: String,
    },
}

impl CallEvent {
    /// Dependency the event concerns.
    pub fn name(&self) -> &str {
        match self {
            CallEvent::Succeeded { name, .. }
            | CallEvent::Failed { name, .. }
            | CallEvent::TimedOut { name, .. }
            | CallEvent::Rejected { name, .. } => name,
        }
    }
}

/// Breaker state changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BreakerEvent {
    /// Circuit tripped open.
    Opened {
        /// Dependency name.
        name: String,
        /// Error percentage when tripping.
        error_percent: u8,
        /// Requests in the window when tripping.
        request_count: u64,
    },
    /// Probe admitted.
    HalfOpen {
        /// Dependency name.
        name: String,
    },
    /// Probe succeeded; normal traffic resumes.
    Closed {
        /// Dependency name.
        name: String,
    },
    /// Probe failed; circuit open again.
    Reopened {
        /// Dependency name.
        name: String,
    },
}

impl BreakerEvent {
    /// Event describing `transition` of the breaker for `name`.
    pub fn from_transition(name: &str, transition: Transition) -> Self {
        let name = name.to_string();
        match transition {
            Transition::Opened { error_percent, request_count } => {
                BreakerEvent::Opened { name, error_percent, request_count }
            }
            Transition::HalfOpened => BreakerEvent::HalfOpen { name },
            Transition::Closed => BreakerEvent::Closed { name },
            Transition::Reopened => BreakerEvent::Reopened { name },
        }
    }

    /// Dependency the event concerns.
    pub fn name(&self) -> &str {
        match self {
            BreakerEvent::Opened { name, .. }
            | BreakerEvent::HalfOpen { name }
            | BreakerEvent::Closed { name }
            | BreakerEvent::Reopened { name } => name,
        }
    }
}

pub(crate) fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl fmt::Display for PolicyEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyEvent::Call(event) => write!(f, "Call::{}", event),
            PolicyEvent::Breaker(event) => write!(f, "Breaker::{}", event),
        }
    }
}

impl fmt::Display for CallEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallEvent::Succeeded { name, duration_ms } => {
                write!(f, "Succeeded({name}, {duration_ms}ms)")
            }
            CallEvent::Failed { name, duration_ms, error } => {
                write!(f, "Failed({name}, {duration_ms}ms, {error})")
            }
            CallEvent::TimedOut { name, timeout_ms } => {
                write!(f, "TimedOut({name}, limit={timeout_ms}ms)")
            }
            CallEvent::Rejected { name, reason } => write!(f, "Rejected({name}, {reason})"),
        }
    }
}

impl fmt::Display for BreakerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakerEvent::Opened { name, error_percent, request_count } => {
                write!(f, "Opened({name}, {error_percent}% of {request_count})")
            }
            BreakerEvent::HalfOpen { name } => write!(f, "HalfOpen({name})"),
            BreakerEvent::Closed { name } => write!(f, "Closed({name})"),
            BreakerEvent::Reopened { name } => write!(f, "Reopened({name})"),
        }
    }
}

// ============================================================================
// Built-in Telemetry Sinks
// ============================================================================

type SinkFuture<E> = Pin<Box<dyn Future<Output = Result<(), E>> + Send>>;

/// A no-op telemetry sink that discards all events.
#[derive(Clone, Debug, Default)]
pub struct NullSink;

impl Service<PolicyEvent> for NullSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture<Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _event: PolicyEvent) -> Self::Future {
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for NullSink {
    type SinkError = Infallible;
}

/// A telemetry sink that logs events through `tracing` at INFO.
#[derive(Clone, Debug, Default)]
pub struct LogSink;

impl Service<PolicyEvent> for LogSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture<Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: PolicyEvent) -> Self::Future {
        tracing::info!(target: "lifeguard::telemetry", name = event.name(), event = %event, "policy_event");
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for LogSink {
    type SinkError = Infallible;
}

/// A telemetry sink that stores events in memory, evicting the oldest past capacity.
///
/// ```rust
/// use lifeguard::telemetry::{CallEvent, MemorySink, PolicyEvent};
/// use tower::Service;
///
/// # #[tokio::main]
/// # async fn main() {
/// let mut sink = MemorySink::new();
/// let event = PolicyEvent::Call(CallEvent::TimedOut { name: "quotes".into(), timeout_ms: 1000 });
/// sink.call(event.clone()).await.unwrap();
/// assert_eq!(sink.events(), vec![event]);
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<PolicyEvent>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemorySink {
    /// Creates a bounded memory sink (default cap: 10,000).
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    /// Creates a bounded memory sink with explicit capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
            capacity: capacity.max(1),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<PolicyEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns a snapshot of all events received so far.
    pub fn events(&self) -> Vec<PolicyEvent> {
        self.lock().clone()
    }

    /// Clears all stored events.
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Returns the number of events stored.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns true if no events are stored.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Returns the number of evicted events.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<PolicyEvent> for MemorySink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture<Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: PolicyEvent) -> Self::Future {
        let mut guard = self.lock();
        if guard.len() >= self.capacity {
            guard.remove(0);
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        guard.push(event);
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for MemorySink {
    type SinkError = Infallible;
}

/// Broadcasts events to every subscriber. Slow subscribers miss events.
#[derive(Clone, Debug)]
pub struct StreamingSink {
    sender: Arc<tokio::sync::broadcast::Sender<PolicyEvent>>,
    dropped: Arc<AtomicU64>,
    last_drop_ns: Arc<AtomicU64>,
}

impl StreamingSink {
    /// Creates a new streaming sink with the specified buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity.max(1));
        Self {
            sender: Arc::new(sender),
            dropped: Arc::new(AtomicU64::new(0)),
            last_drop_ns: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Subscribe to future events.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<PolicyEvent> {
        self.sender.subscribe()
    }

    /// Returns number of events sent while nobody was listening.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Timestamp of last drop, if any.
    pub fn last_drop(&self) -> Option<SystemTime> {
        match self.last_drop_ns.load(Ordering::Relaxed) {
            0 => None,
            ns => UNIX_EPOCH.checked_add(Duration::from_nanos(ns)),
        }
    }
}

impl Service<PolicyEvent> for StreamingSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture<Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: PolicyEvent) -> Self::Future {
        if self.sender.send(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
            self.last_drop_ns
                .store(u64::try_from(now.as_nanos()).unwrap_or(u64::MAX), Ordering::Relaxed);
        }
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for StreamingSink {
    type SinkError = Infallible;
}

/// Offloads emission to a bounded channel drained by a worker task.
///
/// Must be created inside a tokio runtime.
#[derive(Clone)]
pub struct NonBlockingSink {
    tx: tokio::sync::mpsc::Sender<PolicyEvent>,
    dropped: Arc<AtomicU64>,
}

impl fmt::Debug for NonBlockingSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NonBlockingSink").field("dropped", &self.dropped()).finish()
    }
}

impl NonBlockingSink {
    /// Wrap `sink` behind a queue of `capacity` events.
    pub fn with_capacity<S>(sink: S, capacity: usize) -> Self
    where
        S: tower::Service<PolicyEvent, Response = ()> + Send + Clone + 'static,
        S::Error: std::error::Error + Send + 'static,
        S::Future: Send + 'static,
    {
        let (tx, mut rx) = tokio::sync::mpsc::channel(capacity.max(1));
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                emit_best_effort(sink.clone(), event).await;
            }
        });
        Self { tx, dropped: Arc::new(AtomicU64::new(0)) }
    }

    /// How many events were dropped because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Service<PolicyEvent> for NonBlockingSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture<Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: PolicyEvent) -> Self::Future {
        if self.tx.try_send(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for NonBlockingSink {
    type SinkError = Infallible;
}

/// Publishes events as JSON on the message bus.
#[derive(Clone, Debug)]
pub struct BusSink {
    publisher: Arc<dyn Publisher>,
    topic: String,
}

impl BusSink {
    /// Publish to [`DEFAULT_EVENTS_TOPIC`].
    pub fn new(publisher: Arc<dyn Publisher>) -> Self {
        Self::with_topic(publisher, DEFAULT_EVENTS_TOPIC)
    }

    /// Publish to `topic`.
    pub fn with_topic(publisher: Arc<dyn Publisher>, topic: impl Into<String>) -> Self {
        Self { publisher, topic: topic.into() }
    }
}

impl Service<PolicyEvent> for BusSink {
    type Response = ();
    type Error = PublishError;
    type Future = SinkFuture<Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: PolicyEvent) -> Self::Future {
        let publisher = self.publisher.clone();
        let topic = self.topic.clone();
        Box::pin(async move {
            let payload =
                serde_json::to_vec(&event).map_err(|e| PublishError::Encode(e.to_string()))?;
            publisher.publish(payload, &topic).await
        })
    }
}

impl TelemetrySink for BusSink {
    type SinkError = PublishError;
}

// ============================================================================
// Telemetry Sink Composition
// ============================================================================

/// Error type for composed telemetry sinks.
#[derive(Debug)]
pub struct ComposedSinkError(Box<dyn std::error::Error + Send + Sync>);

impl fmt::Display for ComposedSinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "telemetry sink error: {}", self.0)
    }
}

impl std::error::Error for ComposedSinkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&*self.0)
    }
}

/// Sends every event to both sinks concurrently.
///
/// ```rust
/// use lifeguard::telemetry::{LogSink, MemorySink, MulticastSink};
///
/// let memory = MemorySink::new();
/// let _combined = MulticastSink::new(LogSink, memory.clone());
/// ```
#[derive(Clone, Debug)]
pub struct MulticastSink<A, B> {
    sink_a: A,
    sink_b: B,
}

impl<A, B> MulticastSink<A, B> {
    /// Create a sink that forwards to `sink_a` and `sink_b`.
    pub fn new(sink_a: A, sink_b: B) -> Self {
        Self { sink_a, sink_b }
    }
}

impl<A, B> Service<PolicyEvent> for MulticastSink<A, B>
where
    A: tower::Service<PolicyEvent, Response = ()> + Clone + Send + 'static,
    A::Error: std::error::Error + Send + Sync + 'static,
    A::Future: Send + 'static,
    B: tower::Service<PolicyEvent, Response = ()> + Clone + Send + 'static,
    B::Error: std::error::Error + Send + Sync + 'static,
    B::Future: Send + 'static,
{
    type Response = ();
    type Error = ComposedSinkError;
    type Future = SinkFuture<Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: PolicyEvent) -> Self::Future {
        let mut sink_a = self.sink_a.clone();
        let mut sink_b = self.sink_b.clone();
        let event_clone = event.clone();

        Box::pin(async move {
            let (res_a, res_b) = tokio::join!(sink_a.call(event), sink_b.call(event_clone));
            res_a.map_err(|e| ComposedSinkError(Box::new(e)))?;
            res_b.map_err(|e| ComposedSinkError(Box::new(e)))?;
            Ok(())
        })
    }
}

impl<A, B> TelemetrySink for MulticastSink<A, B>
where
    A: tower::Service<PolicyEvent, Response = ()> + Clone + Send + 'static,
    A::Error: std::error::Error + Send + Sync + 'static,
    A::Future: Send + 'static,
    B: tower::Service<PolicyEvent, Response = ()> + Clone + Send + 'static,
    B::Error: std::error::Error + Send + Sync + 'static,
    B::Future: Send + 'static,
{
    type SinkError = ComposedSinkError;
}
