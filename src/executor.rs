//! Call executor: retry within a circuit.
//!
//! `execute` is the one place where the retrier, the breaker state machine and the
//! concurrency limiter meet:
//!
//! 1. Ask the dependency's breaker for a [`Permit`](crate::Permit). A rejection goes
//!    straight to the fallback; the transport is never contacted.
//! 2. Spawn the protected operation. Inside the task each attempt is bounded by the
//!    breaker's `timeout` and retried on retryable failures with a constant delay.
//! 3. Race the task against the same `timeout`. The task is not cancelled when the caller
//!    gives up; its late result is discarded.
//! 4. Settle the permit with the outcome and either return the body or the fallback's
//!    result.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use lifeguard::{CallExecutor, CircuitBreakerRegistry, MapConfigSource};
//! # use lifeguard::{CallError, Transport, TransportResponse};
//! # #[derive(Debug)] struct Http;
//! # #[async_trait::async_trait]
//! # impl Transport for Http {
//! #     async fn perform_request(&self, _: &str, _: &str) -> Result<TransportResponse, CallError> {
//! #         Ok(TransportResponse::new(200, "ok"))
//! #     }
//! # }
//!
//! # async fn demo() {
//! let registry = Arc::new(CircuitBreakerRegistry::from_source(MapConfigSource::new()));
//! let executor = CallExecutor::new(registry, Arc::new(Http));
//! let body = executor
//!     .execute("quotes", "http://quotes:8080/api/quote", "GET", |_err| Ok(b"cached".to_vec()))
//!     .await;
//! # }
//! ```

use crate::circuit_breaker::{Admission, Transition};
use crate::circuit_breaker_registry::{CircuitBreakerRegistry, RegistryError};
use crate::error::{CallError, ConfigError};
use crate::retry::{RetryPolicy, DEFAULT_RETRY_DELAY};
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::telemetry::{emit_best_effort, millis, BreakerEvent, CallEvent, NullSink, PolicyEvent};
use crate::transport::Transport;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Additional attempts after the first, by default.
pub const DEFAULT_RETRIES: u32 = 3;

/// Runs outbound calls under a per-dependency circuit breaker with retries.
#[derive(Debug, Clone)]
pub struct CallExecutor<S = NullSink> {
    registry: Arc<CircuitBreakerRegistry>,
    transport: Arc<dyn Transport>,
    retries: u32,
    retry_delay: Duration,
    sleeper: Arc<dyn Sleeper>,
    sink: S,
}

impl CallExecutor<NullSink> {
    /// Executor with the default retry budget and no telemetry.
    pub fn new(registry: Arc<CircuitBreakerRegistry>, transport: Arc<dyn Transport>) -> Self {
        Self {
            registry,
            transport,
            retries: DEFAULT_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
            sleeper: Arc::new(TokioSleeper),
            sink: NullSink,
        }
    }
}

impl<S> CallExecutor<S> {
    /// Additional attempts after the first failed one.
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Constant pause between attempts.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Sleeper used between attempts.
    pub fn with_sleeper<Z: Sleeper + 'static>(mut self, sleeper: Z) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    /// Route call and breaker events to `sink`.
    pub fn with_sink<T>(self, sink: T) -> CallExecutor<T> {
        CallExecutor {
            registry: self.registry,
            transport: self.transport,
            retries: self.retries,
            retry_delay: self.retry_delay,
            sleeper: self.sleeper,
            sink,
        }
    }

    /// Registry consulted for admission.
    pub fn registry(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.registry
    }

    /// Additional attempts after the first.
    pub fn retries(&self) -> u32 {
        self.retries
    }
}

impl<S> CallExecutor<S>
where
    S: tower::Service<PolicyEvent, Response = ()> + Clone + Send + 'static,
    S::Error: std::error::Error + Send + 'static,
    S::Future: Send + 'static,
{
    /// Perform `method` against `target` under the breaker for `name`.
    ///
    /// Returns the response body, or whatever `fallback` makes of the failure. Transport
    /// failures never reach the caller except through `fallback`.
    pub async fn execute<F>(
        &self,
        name: &str,
        target: &str,
        method: &str,
        fallback: F,
    ) -> Result<Vec<u8>, CallError>
    where
        F: FnOnce(CallError) -> Result<Vec<u8>, CallError>,
    {
        let breaker = match self.registry.breaker(name) {
            Ok(breaker) => breaker,
            Err(err) => return fallback(registry_error(err)),
        };
        let timeout = breaker.config().timeout();

        let permit = match breaker.try_acquire() {
            Admission::Allowed(permit) => permit,
            Admission::Rejected(rejection) => {
                debug!(target: "lifeguard::executor", name, reason = %rejection, "call rejected");
                self.emit(PolicyEvent::Call(CallEvent::Rejected {
                    name: name.to_string(),
                    reason: rejection.to_string(),
                }))
                .await;
                return fallback(CallError::Rejected(rejection));
            }
        };
        if permit.is_probe() {
            self.emit_transition(name, Some(Transition::HalfOpened)).await;
        }

        let started = Instant::now();
        let policy = RetryPolicy::<CallError>::builder()
            .max_attempts(self.retries.saturating_add(1))
            .delay(self.retry_delay)
            .should_retry(CallError::is_retryable)
            .with_shared_sleeper(self.sleeper.clone())
            .build();
        let transport = self.transport.clone();
        let method_owned = method.to_string();
        let url = target.to_string();
        let task = tokio::spawn(async move {
            policy
                .execute(|| {
                    let transport = transport.clone();
                    let method = method_owned.clone();
                    let url = url.clone();
                    async move { attempt(transport.as_ref(), &method, &url, timeout).await }
                })
                .await
        });

        let outcome = match tokio::time::timeout(timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(CallError::Aborted(join_err.to_string())),
            Err(_) => Err(CallError::Timeout { elapsed: started.elapsed(), timeout }),
        };

        match outcome {
            Ok(body) => {
                let transition = permit.succeed();
                self.emit_transition(name, transition).await;
                self.emit(PolicyEvent::Call(CallEvent::Succeeded {
                    name: name.to_string(),
                    duration_ms: millis(started.elapsed()),
                }))
                .await;
                Ok(body)
            }
            Err(err) => {
                let transition = permit.fail();
                warn!(target: "lifeguard::executor", name, target_url = target, error = %err, "protected call failed");
                self.emit_transition(name, transition).await;
                let event = match &err {
                    CallError::Timeout { timeout, .. } => CallEvent::TimedOut {
                        name: name.to_string(),
                        timeout_ms: millis(*timeout),
                    },
                    other => CallEvent::Failed {
                        name: name.to_string(),
                        duration_ms: millis(started.elapsed()),
                        error: other.to_string(),
                    },
                };
                self.emit(PolicyEvent::Call(event)).await;
                fallback(err)
            }
        }
    }

    /// [`execute`](Self::execute) with a fallback that logs the breaker state and returns
    /// the error unchanged.
    pub async fn call(&self, name: &str, target: &str, method: &str) -> Result<Vec<u8>, CallError> {
        let registry = self.registry.clone();
        self.execute(name, target, method, |err| {
            error!(
                target: "lifeguard::executor",
                name,
                state = ?registry.state(name),
                error = %err,
                "no fallback for failed call"
            );
            Err(err)
        })
        .await
    }

    async fn emit(&self, event: PolicyEvent) {
        emit_best_effort(self.sink.clone(), event).await;
    }

    async fn emit_transition(&self, name: &str, transition: Option<Transition>) {
        if let Some(transition) = transition {
            self.emit(PolicyEvent::Breaker(BreakerEvent::from_transition(name, transition)))
                .await;
        }
    }
}

async fn attempt(
    transport: &dyn Transport,
    method: &str,
    url: &str,
    timeout: Duration,
) -> Result<Vec<u8>, CallError> {
    let started = Instant::now();
    match tokio::time::timeout(timeout, transport.perform_request(method, url)).await {
        Ok(Ok(response)) if response.is_success() => Ok(response.body),
        Ok(Ok(response)) => Err(CallError::Status { status: response.status }),
        Ok(Err(err)) => Err(err),
        Err(_) => Err(CallError::Timeout { elapsed: started.elapsed(), timeout }),
    }
}

fn registry_error(err: RegistryError) -> CallError {
    match err {
        RegistryError::Config(config) => CallError::Config(config),
        RegistryError::NotFound { name } => CallError::Config(ConfigError::Invalid {
            name,
            reason: "no circuit breaker registered".into(),
        }),
    }
}
