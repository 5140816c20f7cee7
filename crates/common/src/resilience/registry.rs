//! Name-keyed registries for breakers and limiters.
//!
//! A registry is an ordinary value owned by whoever composes the engine and
//! handed to the components that need it. Instances are created on first
//! lookup from the default config or a per-name override, and live as long as
//! the registry.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::debug;

use super::circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerMetrics, CircuitState, ConfigResult,
    TransitionObserver,
};
use super::clock::TokioClock;
use super::rate_limiter::{RateLimitInfo, RateLimiter, RateLimiterConfig};

/// Registry of circuit breakers keyed by dependency name
pub struct CircuitBreakerRegistry {
    default_config: CircuitBreakerConfig,
    overrides: HashMap<String, CircuitBreakerConfig>,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    observers: RwLock<Vec<TransitionObserver>>,
}

impl std::fmt::Debug for CircuitBreakerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreakerRegistry")
            .field("default_config", &self.default_config)
            .field("breakers", &self.breakers.len())
            .finish_non_exhaustive()
    }
}

impl CircuitBreakerRegistry {
    pub fn new(default_config: CircuitBreakerConfig) -> ConfigResult<Self> {
        default_config.validate()?;
        Ok(Self {
            default_config,
            overrides: HashMap::new(),
            breakers: DashMap::new(),
            observers: RwLock::new(Vec::new()),
        })
    }

    /// Use a dedicated config for breakers named `name`.
    pub fn with_override(
        mut self,
        name: impl Into<String>,
        config: CircuitBreakerConfig,
    ) -> ConfigResult<Self> {
        config.validate()?;
        self.overrides.insert(name.into(), config);
        Ok(self)
    }

    /// Observe transitions of every breaker, existing and future.
    pub fn add_observer(&self, observer: TransitionObserver) {
        for entry in &self.breakers {
            entry.value().add_observer(Arc::clone(&observer));
        }
        self.observers.write().push(observer);
    }

    /// Breaker for `name`, created on first use.
    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(name) {
            return Arc::clone(existing.value());
        }
        let breaker = self
            .breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                let config =
                    self.overrides.get(name).unwrap_or(&self.default_config).clone();
                let breaker = CircuitBreaker::from_validated(name.to_string(), config, TokioClock);
                for observer in self.observers.read().iter() {
                    breaker.add_observer(Arc::clone(observer));
                }
                debug!(breaker = name, "circuit.created");
                Arc::new(breaker)
            })
            .value()
            .clone();
        breaker
    }

    pub fn state(&self, name: &str) -> CircuitState {
        self.get(name).state()
    }

    /// Force a breaker closed. Returns `false` if no breaker has that name.
    pub fn reset(&self, name: &str) -> bool {
        let breaker = self.breakers.get(name).map(|entry| Arc::clone(entry.value()));
        match breaker {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }

    pub fn metrics(&self, name: &str) -> Option<CircuitBreakerMetrics> {
        let breaker = self.breakers.get(name).map(|entry| Arc::clone(entry.value()))?;
        Some(breaker.metrics())
    }

    /// Metrics for every known breaker, sorted by name.
    pub fn snapshot(&self) -> Vec<CircuitBreakerMetrics> {
        let breakers: Vec<_> =
            self.breakers.iter().map(|entry| Arc::clone(entry.value())).collect();
        let mut metrics: Vec<_> = breakers.iter().map(|b| b.metrics()).collect();
        metrics.sort_by(|a, b| a.name.cmp(&b.name));
        metrics
    }
}

/// Registry of rate limiters keyed by dependency name
pub struct RateLimiterRegistry {
    default_config: RateLimiterConfig,
    overrides: HashMap<String, RateLimiterConfig>,
    limiters: DashMap<String, Arc<RateLimiter>>,
}

impl std::fmt::Debug for RateLimiterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiterRegistry")
            .field("default_config", &self.default_config)
            .field("overrides", &self.overrides)
            .field("limiters", &self.limiters.len())
            .finish()
    }
}

impl RateLimiterRegistry {
    pub fn new(default_config: RateLimiterConfig) -> ConfigResult<Self> {
        default_config.validate()?;
        Ok(Self { default_config, overrides: HashMap::new(), limiters: DashMap::new() })
    }

    pub fn with_override(
        mut self,
        name: impl Into<String>,
        config: RateLimiterConfig,
    ) -> ConfigResult<Self> {
        config.validate()?;
        self.overrides.insert(name.into(), config);
        Ok(self)
    }

    /// Limiter for `name`, created on first use.
    pub fn get(&self, name: &str) -> Arc<RateLimiter> {
        if let Some(existing) = self.limiters.get(name) {
            return Arc::clone(existing.value());
        }
        let limiter = self
            .limiters
            .entry(name.to_string())
            .or_insert_with(|| {
                let config =
                    self.overrides.get(name).unwrap_or(&self.default_config).clone();
                debug!(limiter = name, capacity = config.capacity, "rate_limit.created");
                Arc::new(RateLimiter::from_validated(name.to_string(), config, TokioClock))
            })
            .value()
            .clone();
        limiter
    }

    pub fn limit_info(&self, name: &str) -> RateLimitInfo {
        self.get(name).limit_info()
    }

    pub fn reset(&self, name: &str) -> bool {
        let limiter = self.limiters.get(name).map(|entry| Arc::clone(entry.value()));
        match limiter {
            Some(limiter) => {
                limiter.reset();
                true
            }
            None => false,
        }
    }

    pub fn snapshot(&self) -> Vec<RateLimitInfo> {
        let limiters: Vec<_> =
            self.limiters.iter().map(|entry| Arc::clone(entry.value())).collect();
        let mut infos: Vec<_> = limiters.iter().map(|l| l.limit_info()).collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use parking_lot::Mutex;

    use super::*;
    use crate::error::CommonError;
    use crate::resilience::CircuitTransition;

    #[test]
    fn same_name_yields_same_instance() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig::default()).unwrap();
        let a = registry.get("shop");
        let b = registry.get("shop");
        let c = registry.get("erp");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn overrides_apply_per_name() {
        let strict = CircuitBreakerConfig::builder().failure_threshold(1).build().unwrap();
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig::default())
            .unwrap()
            .with_override("infrastructure", strict)
            .unwrap();

        assert_eq!(registry.get("infrastructure").config().failure_threshold, 1);
        assert_eq!(registry.get("shop").config().failure_threshold, 5);
    }

    #[tokio::test]
    async fn registry_observers_reach_later_breakers() {
        let strict = CircuitBreakerConfig::builder().failure_threshold(1).build().unwrap();
        let registry = CircuitBreakerRegistry::new(strict).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        registry.add_observer(Arc::new(move |t: &CircuitTransition| {
            sink.lock().push(t.name.clone());
        }));

        let breaker = registry.get("erp");
        let _ = breaker
            .execute(|| async { Err::<(), _>(CommonError::backend("erp", "down", true)) })
            .await;

        assert_eq!(*seen.lock(), vec!["erp".to_string()]);
        assert_eq!(registry.state("erp"), CircuitState::Open);
        assert!(registry.reset("erp"));
        assert_eq!(registry.state("erp"), CircuitState::Closed);
        assert!(!registry.reset("unknown"));
    }

    #[test]
    fn limiter_registry_reports_info_by_name() {
        let config = RateLimiterConfig::builder()
            .capacity(3)
            .window(Duration::from_secs(1))
            .build()
            .unwrap();
        let registry = RateLimiterRegistry::new(RateLimiterConfig::default())
            .unwrap()
            .with_override("erp", config)
            .unwrap();

        assert!(registry.get("erp").try_acquire());
        let info = registry.limit_info("erp");
        assert_eq!(info.capacity, 3);
        assert_eq!(info.acquired_total, 1);
        assert_eq!(registry.limit_info("shop").capacity, 40);

        let names: Vec<_> = registry.snapshot().into_iter().map(|i| i.name).collect();
        assert_eq!(names, vec!["erp".to_string(), "shop".to_string()]);
    }
}
