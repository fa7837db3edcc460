use crate::circuit_breaker::CircuitState;
use crate::error::{GatewayError, Result};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

/// Prometheus recorder installed for the whole process
#[derive(Clone)]
pub struct MetricsService {
    handle: PrometheusHandle,
}

impl MetricsService {
    /// Install the Prometheus recorder. Fails if a recorder is already installed.
    pub fn new() -> Result<Self> {
        let handle = PrometheusBuilder::new().install_recorder().map_err(|e| {
            GatewayError::Internal(format!("Failed to install metrics recorder: {}", e))
        })?;

        Self::register_metrics();

        info!("Metrics service initialized successfully");

        Ok(Self { handle })
    }

    fn register_metrics() {
        describe_counter!(
            "gateway_requests_total",
            "Total number of HTTP requests received"
        );
        describe_histogram!(
            "gateway_request_duration_seconds",
            "HTTP request latencies in seconds"
        );
        describe_counter!(
            "gateway_requests_errors_total",
            "Total number of HTTP requests that resulted in errors"
        );

        describe_counter!(
            "gateway_upstream_requests_total",
            "Total number of requests sent to downstream services"
        );
        describe_counter!(
            "gateway_upstream_failures_total",
            "Downstream calls that failed (network, timeout or 5xx)"
        );
        describe_histogram!(
            "gateway_upstream_duration_seconds",
            "Downstream call latencies in seconds"
        );
        describe_gauge!(
            "gateway_service_healthy",
            "Service health (1 = healthy, 0 = unhealthy)"
        );

        describe_gauge!(
            "gateway_circuit_breaker_state",
            "Circuit breaker state (0 = closed, 1 = open, 2 = half-open)"
        );
        describe_counter!(
            "gateway_circuit_breaker_transitions_total",
            "Total number of circuit breaker state transitions"
        );

        describe_counter!(
            "gateway_auth_failures_total",
            "Total number of authentication failures"
        );
        describe_counter!(
            "gateway_rate_limit_exceeded_total",
            "Total number of requests rejected due to rate limiting"
        );

        debug!("All metrics registered with descriptions");
    }

    pub fn handle(&self) -> PrometheusHandle {
        self.handle.clone()
    }
}

/// Record a completed inbound request
pub fn record_request(method: &str, path: &str, status: u16, duration: f64) {
    let labels = [
        ("method", method.to_string()),
        ("path", sanitize_path(path)),
        ("status", status.to_string()),
    ];

    counter!("gateway_requests_total", &labels).increment(1);
    histogram!("gateway_request_duration_seconds", &labels).record(duration);

    if status >= 400 {
        counter!("gateway_requests_errors_total", &labels).increment(1);
    }
}

/// Record a downstream call; `status` is None for network errors and timeouts
pub fn record_upstream(service: &str, method: &str, status: Option<u16>, duration: f64) {
    let labels = [
        ("service", service.to_string()),
        ("method", method.to_string()),
        (
            "status",
            status.map_or_else(|| "error".to_string(), |s| s.to_string()),
        ),
    ];

    counter!("gateway_upstream_requests_total", &labels).increment(1);
    histogram!("gateway_upstream_duration_seconds", &labels).record(duration);

    if status.map_or(true, |s| s >= 500) {
        counter!("gateway_upstream_failures_total", &labels).increment(1);
    }
}

pub fn record_service_health(service: &str, healthy: bool) {
    let labels = [("service", service.to_string())];
    gauge!("gateway_service_healthy", &labels).set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_circuit_breaker_state(service: &str, state: CircuitState) {
    let labels = [("service", service.to_string())];
    gauge!("gateway_circuit_breaker_state", &labels).set(state.as_gauge());
}

pub fn record_circuit_breaker_transition(service: &str, from: CircuitState, to: CircuitState) {
    let labels = [
        ("service", service.to_string()),
        ("from", from.to_string()),
        ("to", to.to_string()),
    ];
    counter!("gateway_circuit_breaker_transitions_total", &labels).increment(1);
}

pub fn record_auth_failure(service: &str, code: &str) {
    let labels = [("service", service.to_string()), ("code", code.to_string())];
    counter!("gateway_auth_failures_total", &labels).increment(1);
}

pub fn record_rate_limit_exceeded(policy: &str) {
    let labels = [("policy", policy.to_string())];
    counter!("gateway_rate_limit_exceeded_total", &labels).increment(1);
}

/// Replace ID-like path segments to keep label cardinality bounded
fn sanitize_path(path: &str) -> String {
    path.split('/')
        .map(|seg| {
            if !seg.is_empty() && is_likely_id(seg) {
                ":id"
            } else {
                seg
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

fn is_likely_id(segment: &str) -> bool {
    if segment.chars().all(|c| c.is_ascii_digit()) {
        return true;
    }

    // UUID
    if segment.len() >= 32 && segment.contains('-') {
        return segment.chars().all(|c| c.is_ascii_hexdigit() || c == '-');
    }

    // Opaque ids such as ObjectIds: long, mixed letters and digits
    if segment.len() > 10 && segment.chars().all(|c| c.is_ascii_alphanumeric()) {
        let has_numbers = segment.chars().any(|c| c.is_ascii_digit());
        let has_letters = segment.chars().any(|c| c.is_ascii_alphabetic());
        return has_numbers && has_letters;
    }

    false
}

/// In-process request counters backing the JSON metrics endpoint
#[derive(Debug, Default)]
pub struct GatewayStats {
    total_requests: AtomicU64,
    rate_limited: AtomicU64,
    circuit_rejected: AtomicU64,
    upstream_failures: AtomicU64,
    auth_failures: AtomicU64,
}

/// Point-in-time copy of [`GatewayStats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub total_requests: u64,
    pub rate_limited: u64,
    pub circuit_rejected: u64,
    pub upstream_failures: u64,
    pub auth_failures: u64,
}

impl GatewayStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_upstream_failure(&self) {
        self.upstream_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a request the gateway answered with an error
    pub fn record_rejection(&self, error: &GatewayError) {
        let counter = match error {
            GatewayError::RateLimitExceeded { .. } => &self.rate_limited,
            GatewayError::CircuitOpen(_) => &self.circuit_rejected,
            GatewayError::Unauthorized(_)
            | GatewayError::InvalidToken(_)
            | GatewayError::MissingCredentials
            | GatewayError::Forbidden(_) => &self.auth_failures,
            _ => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            circuit_rejected: self.circuit_rejected.load(Ordering::Relaxed),
            upstream_failures: self.upstream_failures.load(Ordering::Relaxed),
            auth_failures: self.auth_failures.load(Ordering::Relaxed),
        }
    }
}

/// Resident set size of this process, where the platform exposes it
pub fn resident_memory_bytes() -> Option<u64> {
    // Second field of statm is resident pages; 4 KiB pages assumed
    const PAGE_SIZE: u64 = 4096;
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(pages * PAGE_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_path() {
        assert_eq!(sanitize_path("/api/users/123"), "/api/users/:id");
        assert_eq!(sanitize_path("/api/loans/abc123def456"), "/api/loans/:id");
        assert_eq!(
            sanitize_path("/api/users/550e8400-e29b-41d4-a716-446655440000"),
            "/api/users/:id"
        );
        assert_eq!(sanitize_path("/api/users"), "/api/users");
        assert_eq!(sanitize_path("/api/users/profile"), "/api/users/profile");
    }

    #[test]
    fn test_is_likely_id() {
        assert!(is_likely_id("123456789"));
        assert!(is_likely_id("abc123def456ghi789jkl012"));
        assert!(!is_likely_id("documents"));
        assert!(!is_likely_id("api"));
    }

    #[test]
    fn test_stats_classify_rejections() {
        let stats = GatewayStats::new();
        stats.record_request();
        stats.record_request();
        stats.record_rejection(&GatewayError::CircuitOpen("loans".to_string()));
        stats.record_rejection(&GatewayError::MissingCredentials);
        stats.record_rejection(&GatewayError::RateLimitExceeded {
            policy: "burst".to_string(),
            limit: 20,
            reset_after_secs: 1,
            retry_hint: "1 second".to_string(),
        });
        stats.record_rejection(&GatewayError::RouteNotFound("/api/x".to_string()));
        stats.record_upstream_failure();

        assert_eq!(
            stats.snapshot(),
            StatsSnapshot {
                total_requests: 2,
                rate_limited: 1,
                circuit_rejected: 1,
                upstream_failures: 1,
                auth_failures: 1,
            }
        );
    }

    #[tokio::test]
    async fn test_metrics_service_creation() {
        // Only one recorder can be installed per process
        match MetricsService::new() {
            Ok(service) => {
                record_rate_limit_exceeded("auth");
                assert!(service.handle().render().contains("gateway_rate_limit_exceeded_total"));
            }
            Err(e) => assert!(e.to_string().contains("recorder")),
        }
    }

    #[test]
    fn test_record_functions_dont_panic() {
        record_request("GET", "/api/loans/42", 200, 0.123);
        record_upstream("loans", "POST", Some(502), 0.456);
        record_upstream("loans", "GET", None, 30.0);
        record_service_health("loans", true);
        record_circuit_breaker_state("loans", CircuitState::Open);
        record_circuit_breaker_transition("loans", CircuitState::Closed, CircuitState::Open);
        record_auth_failure("loans", "INVALID_TOKEN");
        record_rate_limit_exceeded("burst");
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_resident_memory_reported_on_linux() {
        assert!(resident_memory_bytes().unwrap_or(0) > 0);
    }
}
