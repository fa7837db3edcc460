use super::breaker::{CircuitBreaker, Transition};
use super::types::{CircuitBreakerConfig, CircuitBreakerSnapshot, CircuitState};
use crate::metrics;
use crate::notify::{SecurityEvent, SecurityNotifier};
use std::collections::BTreeMap;
use std::sync::Arc;

/// One circuit breaker per registered service.
///
/// The set of breakers is fixed at construction; lookups for names that were
/// never registered are treated as closed and ignored.
pub struct CircuitBreakerBank {
    breakers: BTreeMap<String, Arc<CircuitBreaker>>,
    notifier: Arc<dyn SecurityNotifier>,
}

impl std::fmt::Debug for CircuitBreakerBank {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreakerBank")
            .field("services", &self.breakers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl CircuitBreakerBank {
    /// Create a bank with a breaker for each service name
    pub fn new<I, S>(
        services: I,
        config: &CircuitBreakerConfig,
        notifier: Arc<dyn SecurityNotifier>,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let breakers = services
            .into_iter()
            .map(|name| {
                let name = name.into();
                let breaker = Arc::new(CircuitBreaker::new(name.clone(), config.clone()));
                metrics::record_circuit_breaker_state(&name, CircuitState::Closed);
                (name, breaker)
            })
            .collect();

        Self { breakers, notifier }
    }

    /// Get the breaker for a service
    pub fn get(&self, service: &str) -> Option<&Arc<CircuitBreaker>> {
        self.breakers.get(service)
    }

    /// Check if a request for a service can proceed
    pub async fn allow(&self, service: &str) -> bool {
        let Some(breaker) = self.breakers.get(service) else {
            return true;
        };
        let (allowed, transition) = breaker.can_proceed().await;
        self.observe(service, transition);
        allowed
    }

    /// Record a successful outcome for a service
    pub async fn record_success(&self, service: &str) {
        if let Some(breaker) = self.breakers.get(service) {
            let transition = breaker.record_success().await;
            self.observe(service, transition);
        }
    }

    /// Record a failed outcome for a service
    pub async fn record_failure(&self, service: &str) {
        if let Some(breaker) = self.breakers.get(service) {
            let transition = breaker.record_failure().await;
            self.observe(service, transition);
        }
    }

    /// Get the state of a service's breaker (closed for unknown services)
    pub async fn state(&self, service: &str) -> CircuitState {
        match self.breakers.get(service) {
            Some(breaker) => breaker.state().await,
            None => CircuitState::Closed,
        }
    }

    /// Snapshot of one breaker
    pub async fn snapshot(&self, service: &str) -> Option<CircuitBreakerSnapshot> {
        match self.breakers.get(service) {
            Some(breaker) => Some(breaker.snapshot().await),
            None => None,
        }
    }

    /// Snapshots of every breaker, ordered by service name
    pub async fn snapshots(&self) -> Vec<CircuitBreakerSnapshot> {
        let mut results = Vec::with_capacity(self.breakers.len());
        for breaker in self.breakers.values() {
            results.push(breaker.snapshot().await);
        }
        results
    }

    /// Names of all services with breakers
    pub fn services(&self) -> Vec<String> {
        self.breakers.keys().cloned().collect()
    }

    fn observe(&self, service: &str, transition: Option<Transition>) {
        let Some(transition) = transition else {
            return;
        };

        metrics::record_circuit_breaker_state(service, transition.to);
        metrics::record_circuit_breaker_transition(service, transition.from, transition.to);

        if transition.to == CircuitState::Open {
            self.notifier.notify(SecurityEvent::CircuitOpened {
                service: service.to_string(),
            });
        }
    }
}
