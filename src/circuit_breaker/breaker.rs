use super::types::{
    CircuitBreakerConfig, CircuitBreakerMetrics, CircuitBreakerSnapshot, CircuitState,
};
use chrono::{DateTime, Utc};
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Circuit breaker for a single service
#[derive(Debug)]
pub struct CircuitBreaker {
    /// Configuration
    config: CircuitBreakerConfig,
    /// Current state, guarded as one unit so it is never torn
    state: RwLock<State>,
    /// Service name
    service: String,
}

#[derive(Debug)]
struct State {
    circuit_state: CircuitState,
    /// Failures net of success decay while closed
    failure_count: u32,
    /// Successful probes while half-open
    success_count: u32,
    /// Monotonic time of the last failure, drives the cooldown
    last_failure: Option<Instant>,
    /// Wall-clock time of the last failure, for reporting
    last_failure_at: Option<DateTime<Utc>>,
    metrics: CircuitBreakerMetrics,
}

/// A state change caused by a recorded outcome or an admission check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: CircuitState,
    pub to: CircuitState,
}

impl CircuitBreaker {
    /// Create a new circuit breaker in the closed state
    pub fn new(service: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let service = service.into();
        debug!(
            service = %service,
            failure_threshold = config.failure_threshold,
            success_threshold = config.success_threshold,
            cooldown_ms = config.cooldown_ms,
            "Creating circuit breaker"
        );

        Self {
            config,
            state: RwLock::new(State {
                circuit_state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure: None,
                last_failure_at: None,
                metrics: CircuitBreakerMetrics::default(),
            }),
            service,
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Check if a request may proceed.
    ///
    /// An open circuit whose cooldown has elapsed moves to half-open and admits
    /// the caller as the first probe. A rejection leaves the state untouched
    /// apart from the rejection counter.
    pub async fn can_proceed(&self) -> (bool, Option<Transition>) {
        let mut state = self.state.write().await;

        match state.circuit_state {
            CircuitState::Closed | CircuitState::HalfOpen => (true, None),
            CircuitState::Open => {
                let cooled_down = state
                    .last_failure
                    .map(|at| at.elapsed() >= self.config.cooldown())
                    .unwrap_or(true);

                if cooled_down {
                    let transition = self.transition_to_half_open(&mut state);
                    (true, Some(transition))
                } else {
                    state.metrics.rejected_requests += 1;
                    debug!(service = %self.service, "Circuit breaker open, rejecting request");
                    (false, None)
                }
            }
        }
    }

    /// Record a successful outcome
    pub async fn record_success(&self) -> Option<Transition> {
        let mut state = self.state.write().await;
        state.metrics.successful_requests += 1;

        match state.circuit_state {
            CircuitState::Closed => {
                state.failure_count = state.failure_count.saturating_sub(1);
                None
            }
            CircuitState::HalfOpen => {
                state.success_count += 1;

                debug!(
                    service = %self.service,
                    success_count = state.success_count,
                    threshold = self.config.success_threshold,
                    "Half-open probe succeeded"
                );

                if state.success_count >= self.config.success_threshold {
                    Some(self.transition_to_closed(&mut state))
                } else {
                    None
                }
            }
            // Only the health checker reaches an open breaker; cooldown alone reopens traffic.
            CircuitState::Open => None,
        }
    }

    /// Record a failed outcome (network error, timeout or 5xx)
    pub async fn record_failure(&self) -> Option<Transition> {
        let mut state = self.state.write().await;
        state.metrics.failed_requests += 1;
        state.last_failure = Some(Instant::now());
        state.last_failure_at = Some(Utc::now());

        match state.circuit_state {
            CircuitState::Closed => {
                state.failure_count += 1;

                debug!(
                    service = %self.service,
                    failure_count = state.failure_count,
                    threshold = self.config.failure_threshold,
                    "Failure recorded in closed state"
                );

                if state.failure_count >= self.config.failure_threshold {
                    Some(self.transition_to_open(&mut state))
                } else {
                    None
                }
            }
            CircuitState::HalfOpen => {
                warn!(service = %self.service, "Half-open probe failed, reopening circuit");
                Some(self.transition_to_open(&mut state))
            }
            CircuitState::Open => None,
        }
    }

    /// Get current state
    pub async fn state(&self) -> CircuitState {
        self.state.read().await.circuit_state
    }

    /// Get a consistent view of the breaker
    pub async fn snapshot(&self) -> CircuitBreakerSnapshot {
        let state = self.state.read().await;
        CircuitBreakerSnapshot {
            service: self.service.clone(),
            state: state.circuit_state,
            failure_count: state.failure_count,
            success_count: state.success_count,
            last_failure: state.last_failure_at,
            metrics: state.metrics.clone(),
        }
    }

    fn transition_to_open(&self, state: &mut State) -> Transition {
        let from = state.circuit_state;
        warn!(
            service = %self.service,
            failure_count = state.failure_count,
            cooldown_ms = self.config.cooldown_ms,
            "Circuit breaker opening"
        );

        state.circuit_state = CircuitState::Open;
        state.success_count = 0;
        state.metrics.circuit_opened_count += 1;
        Transition {
            from,
            to: CircuitState::Open,
        }
    }

    fn transition_to_half_open(&self, state: &mut State) -> Transition {
        info!(service = %self.service, "Circuit breaker transitioning to half-open");

        state.circuit_state = CircuitState::HalfOpen;
        state.success_count = 0;
        state.metrics.circuit_half_opened_count += 1;
        Transition {
            from: CircuitState::Open,
            to: CircuitState::HalfOpen,
        }
    }

    fn transition_to_closed(&self, state: &mut State) -> Transition {
        info!(
            service = %self.service,
            success_count = state.success_count,
            "Circuit breaker closing"
        );

        state.circuit_state = CircuitState::Closed;
        state.failure_count = 0;
        state.success_count = 0;
        state.metrics.circuit_closed_count += 1;
        Transition {
            from: CircuitState::HalfOpen,
            to: CircuitState::Closed,
        }
    }
}
