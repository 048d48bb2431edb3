//! Registry of named circuit breakers, one per dependency.
//!
//! The registry is an explicitly constructed value owned by the composition root and shared
//! by reference (usually `Arc`). Breakers are created on first use with tuning resolved
//! through the [`PropertyResolver`]; [`configure`](CircuitBreakerRegistry::configure) does the
//! same eagerly at startup so a bad configuration fails fast.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::circuit_breaker::{Admission, BreakerSnapshot, CircuitBreaker, CircuitState, Transition};
use crate::clock::{Clock, MonotonicClock};
use crate::config::{ConfigSource, RefreshEvent};
use crate::error::ConfigError;
use crate::property::PropertyResolver;
use tracing::{info, warn};

/// Errors from breaker registries.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// The requested circuit breaker was never created.
    #[error("circuit breaker '{name}' not found")]
    NotFound {
        /// Dependency name that could not be located.
        name: String,
    },
    /// The breaker's configuration could not be resolved.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Process-wide set of breakers keyed by dependency name.
pub struct CircuitBreakerRegistry {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    resolver: PropertyResolver,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for CircuitBreakerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreakerRegistry")
            .field("breakers", &self.names())
            .field("resolver", &self.resolver)
            .finish()
    }
}

impl CircuitBreakerRegistry {
    /// Registry resolving tuning through `resolver`.
    pub fn new(resolver: PropertyResolver) -> Self {
        Self::with_clock(resolver, Arc::new(MonotonicClock::default()))
    }

    /// Registry resolving tuning from `source`.
    pub fn from_source<S: ConfigSource + 'static>(source: S) -> Self {
        Self::new(PropertyResolver::new(source))
    }

    /// Registry whose breakers time their windows on `clock`.
    pub fn with_clock(resolver: PropertyResolver, clock: Arc<dyn Clock>) -> Self {
        Self { breakers: RwLock::new(HashMap::new()), resolver, clock }
    }

    /// Property resolver backing this registry.
    pub fn resolver(&self) -> &PropertyResolver {
        &self.resolver
    }

    /// Resolve and create breakers for `names` up front.
    pub fn configure<I, S>(&self, names: I) -> Result<(), RegistryError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for name in names {
            self.breaker(name.as_ref())?;
        }
        Ok(())
    }

    /// Breaker for `name`, created with resolved tuning on first use.
    pub fn breaker(&self, name: &str) -> Result<Arc<CircuitBreaker>, RegistryError> {
        if let Some(existing) = self.get(name) {
            return Ok(existing);
        }
        let config = self.resolver.resolve_config(name)?;
        let mut map = self.breakers.write().unwrap_or_else(PoisonError::into_inner);
        let breaker = map
            .entry(name.to_string())
            .or_insert_with(|| {
                info!(target: "lifeguard::circuit_breaker_registry", name, "circuit breaker created");
                Arc::new(CircuitBreaker::with_clock(name, config, self.clock.clone()))
            })
            .clone();
        Ok(breaker)
    }

    /// Existing breaker for `name`, without creating one.
    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        let map = self.breakers.read().unwrap_or_else(PoisonError::into_inner);
        map.get(name).cloned()
    }

    /// Ask the breaker for `name` to admit a call.
    pub fn admit(&self, name: &str) -> Result<Admission, RegistryError> {
        Ok(self.breaker(name)?.try_acquire())
    }

    /// Feed an outcome to the breaker for `name`.
    pub fn record_outcome(
        &self,
        name: &str,
        success: bool,
    ) -> Result<Option<Transition>, RegistryError> {
        self.get(name)
            .map(|breaker| breaker.record_outcome(success))
            .ok_or_else(|| RegistryError::NotFound { name: name.to_string() })
    }

    /// Whether the breaker for `name` refuses normal traffic. Unknown names are closed.
    pub fn is_open(&self, name: &str) -> bool {
        self.get(name).map(|b| b.is_open()).unwrap_or(false)
    }

    /// State of the breaker for `name`, if it exists.
    pub fn state(&self, name: &str) -> Option<CircuitState> {
        self.get(name).map(|b| b.state())
    }

    /// Force the breaker for `name` closed, erroring if missing.
    pub fn reset(&self, name: &str) -> Result<(), RegistryError> {
        match self.get(name) {
            Some(breaker) => {
                breaker.reset();
                Ok(())
            }
            None => Err(RegistryError::NotFound { name: name.to_string() }),
        }
    }

    /// Names of all breakers, sorted.
    pub fn names(&self) -> Vec<String> {
        let map = self.breakers.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = map.keys().cloned().collect();
        names.sort();
        names
    }

    /// Snapshot breaker states sorted by name.
    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        let breakers: Vec<Arc<CircuitBreaker>> = {
            let map = self.breakers.read().unwrap_or_else(PoisonError::into_inner);
            map.values().cloned().collect()
        };
        let mut entries: Vec<BreakerSnapshot> = breakers.iter().map(|b| b.snapshot()).collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries
    }

    /// Reload the config source and re-resolve every breaker's tuning.
    ///
    /// All breakers are resolved before any is updated, so a bad value leaves every breaker
    /// on its previous tuning.
    pub fn reload(&self) -> Result<(), RegistryError> {
        self.resolver.source().reload()?;
        let breakers: Vec<Arc<CircuitBreaker>> = {
            let map = self.breakers.read().unwrap_or_else(PoisonError::into_inner);
            map.values().cloned().collect()
        };
        let resolved = breakers
            .iter()
            .map(|b| self.resolver.resolve_config(b.name()).map(|c| (b, c)))
            .collect::<Result<Vec<_>, _>>()?;
        for (breaker, config) in resolved {
            breaker.reconfigure(config);
        }
        info!(target: "lifeguard::circuit_breaker_registry", breakers = breakers.len(), "circuit configuration reloaded");
        Ok(())
    }

    /// Handle a refresh event payload from the config bus. Returns whether a reload ran.
    ///
    /// Payloads that do not decode are logged and ignored.
    pub fn handle_refresh_event(&self, payload: &[u8], service: &str) -> Result<bool, RegistryError> {
        let event = match RefreshEvent::from_slice(payload) {
            Ok(event) => event,
            Err(err) => {
                warn!(target: "lifeguard::circuit_breaker_registry", error = %err, "ignoring malformed refresh event");
                return Ok(false);
            }
        };
        if !event.targets(service) {
            return Ok(false);
        }
        info!(
            target: "lifeguard::circuit_breaker_registry",
            origin = %event.origin_service,
            id = %event.id,
            "refresh event received"
        );
        self.reload()?;
        Ok(true)
    }
}
