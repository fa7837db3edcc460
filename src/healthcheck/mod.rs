use crate::circuit_breaker::CircuitBreakerBank;
use crate::metrics;
use crate::registry::{ServiceConfig, ServiceRegistry};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

/// Health check configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HealthCheckConfig {
    /// Enable health checks
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Interval between health checks in seconds
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
    /// Per-service check timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// HTTP path to check unless a service overrides it
    #[serde(default = "default_path")]
    pub path: String,
}

fn default_enabled() -> bool {
    true
}

fn default_interval() -> u64 {
    30
}

fn default_timeout_ms() -> u64 {
    5000
}

fn default_path() -> String {
    "/health".to_string()
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            interval_secs: default_interval(),
            timeout_ms: default_timeout_ms(),
            path: default_path(),
        }
    }
}

impl HealthCheckConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Unknown,
}

/// Latest health observation for one service
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthRecord {
    pub status: HealthStatus,
    pub last_checked: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HealthRecord {
    pub fn unknown() -> Self {
        Self {
            status: HealthStatus::Unknown,
            last_checked: None,
            latency_ms: None,
            error: None,
        }
    }

    fn healthy(latency: Duration) -> Self {
        Self {
            status: HealthStatus::Healthy,
            last_checked: Some(Utc::now()),
            latency_ms: Some(latency.as_millis() as u64),
            error: None,
        }
    }

    fn unhealthy(error: String) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            last_checked: Some(Utc::now()),
            latency_ms: None,
            error: Some(error),
        }
    }
}

/// Health records by service, each behind its own lock
#[derive(Debug, Default)]
pub struct HealthTable {
    records: BTreeMap<String, RwLock<HealthRecord>>,
}

impl HealthTable {
    /// Every service starts as unknown
    pub fn new<I, S>(services: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let records = services
            .into_iter()
            .map(|name| (name.into(), RwLock::new(HealthRecord::unknown())))
            .collect();
        Self { records }
    }

    pub async fn get(&self, service: &str) -> Option<HealthRecord> {
        match self.records.get(service) {
            Some(record) => Some(record.read().await.clone()),
            None => None,
        }
    }

    pub async fn set(&self, service: &str, record: HealthRecord) {
        if let Some(slot) = self.records.get(service) {
            *slot.write().await = record;
        }
    }

    pub async fn all(&self) -> BTreeMap<String, HealthRecord> {
        let mut result = BTreeMap::new();
        for (name, record) in &self.records {
            result.insert(name.clone(), record.read().await.clone());
        }
        result
    }

    /// Unknown services do not count as unhealthy
    pub async fn any_unhealthy(&self) -> bool {
        for record in self.records.values() {
            if record.read().await.status == HealthStatus::Unhealthy {
                return true;
            }
        }
        false
    }
}

/// Periodically probes every service and feeds the outcome to its breaker
#[derive(Clone)]
pub struct HealthChecker {
    config: HealthCheckConfig,
    services: Vec<Arc<ServiceConfig>>,
    table: Arc<HealthTable>,
    breakers: Arc<CircuitBreakerBank>,
    client: reqwest::Client,
}

impl std::fmt::Debug for HealthChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthChecker")
            .field("config", &self.config)
            .field("services", &self.services.len())
            .field("client", &"<reqwest::Client>")
            .finish()
    }
}

impl HealthChecker {
    pub fn new(
        config: HealthCheckConfig,
        registry: &ServiceRegistry,
        table: Arc<HealthTable>,
        breakers: Arc<CircuitBreakerBank>,
        client: reqwest::Client,
    ) -> Self {
        Self {
            config,
            services: registry.iter().cloned().collect(),
            table,
            breakers,
            client,
        }
    }

    /// Check every service concurrently and record the results
    pub async fn run_cycle(&self) {
        let checks = self.services.iter().map(|service| self.check_service(service));
        let results = join_all(checks).await;

        let healthy = results.iter().filter(|healthy| **healthy).count();
        debug!(
            healthy,
            total = results.len(),
            "Health check cycle completed"
        );
    }

    async fn check_service(&self, service: &ServiceConfig) -> bool {
        let url = service.health_url();
        let start = Instant::now();

        let outcome = self
            .client
            .get(&url)
            .timeout(self.config.timeout())
            .send()
            .await;

        let record = match outcome {
            Ok(response) if response.status().is_success() => {
                HealthRecord::healthy(start.elapsed())
            }
            Ok(response) => HealthRecord::unhealthy(format!(
                "Health endpoint returned {}",
                response.status()
            )),
            Err(e) if e.is_timeout() => HealthRecord::unhealthy(format!(
                "Health check timed out after {}ms",
                self.config.timeout_ms
            )),
            Err(e) => HealthRecord::unhealthy(format!("Health check failed: {}", e)),
        };

        let healthy = record.status == HealthStatus::Healthy;
        if healthy {
            debug!(service = %service.name, latency_ms = ?record.latency_ms, "Service healthy");
            self.breakers.record_success(&service.name).await;
        } else {
            warn!(
                service = %service.name,
                url = %url,
                error = record.error.as_deref().unwrap_or(""),
                "Service unhealthy"
            );
            self.breakers.record_failure(&service.name).await;
        }

        metrics::record_service_health(&service.name, healthy);
        self.table.set(&service.name, record).await;
        healthy
    }

    /// Run one cycle immediately, then one per interval, on a background task
    pub fn spawn(self) -> Option<JoinHandle<()>> {
        if !self.config.enabled {
            info!("Active health checks disabled");
            return None;
        }

        info!(
            interval_secs = self.config.interval_secs,
            services = self.services.len(),
            "Starting active health checks"
        );

        Some(tokio::spawn(async move {
            // First tick completes immediately
            let mut ticker = interval(self.config.interval());
            loop {
                ticker.tick().await;
                self.run_cycle().await;
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::{CircuitBreakerConfig, CircuitState};
    use crate::config::GatewayConfig;
    use crate::notify::NoopNotifier;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn checker(
        targets: &[(&str, String)],
        timeout_ms: u64,
    ) -> (HealthChecker, Arc<HealthTable>, Arc<CircuitBreakerBank>) {
        let services = targets
            .iter()
            .map(|(name, target)| {
                format!("  - name: {}\n    target: \"{}\"\n", name, target)
            })
            .collect::<String>();
        let yaml = if services.is_empty() {
            "services: []".to_string()
        } else {
            format!("services:\n{}", services)
        };
        let config = GatewayConfig::from_yaml(&yaml).unwrap();
        let registry = ServiceRegistry::from_config(&config).unwrap();

        let table = Arc::new(HealthTable::new(registry.names()));
        let breakers = Arc::new(CircuitBreakerBank::new(
            registry.names(),
            &CircuitBreakerConfig::default(),
            Arc::new(NoopNotifier),
        ));
        let health_config = HealthCheckConfig {
            timeout_ms,
            ..HealthCheckConfig::default()
        };
        let checker = HealthChecker::new(
            health_config,
            &registry,
            table.clone(),
            breakers.clone(),
            reqwest::Client::new(),
        );
        (checker, table, breakers)
    }

    #[test]
    fn test_default_config() {
        let config = HealthCheckConfig::default();
        assert!(config.enabled);
        assert_eq!(config.interval(), Duration::from_secs(30));
        assert_eq!(config.timeout(), Duration::from_millis(5000));
        assert_eq!(config.path, "/health");
    }

    #[tokio::test]
    async fn test_table_starts_unknown_and_not_unhealthy() {
        let table = HealthTable::new(["loans", "users"]);
        assert_eq!(table.get("loans").await.unwrap().status, HealthStatus::Unknown);
        assert!(!table.any_unhealthy().await);
        assert!(table.get("nope").await.is_none());
    }

    #[tokio::test]
    async fn test_cycle_records_healthy_and_unhealthy() {
        let up = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&up)
            .await;

        let down = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&down)
            .await;

        let (checker, table, breakers) =
            checker(&[("users", up.uri()), ("loans", down.uri())], 1000);
        checker.run_cycle().await;

        let users = table.get("users").await.unwrap();
        assert_eq!(users.status, HealthStatus::Healthy);
        assert!(users.latency_ms.is_some());
        assert!(users.last_checked.is_some());

        let loans = table.get("loans").await.unwrap();
        assert_eq!(loans.status, HealthStatus::Unhealthy);
        assert!(loans.error.unwrap().contains("503"));
        assert!(table.any_unhealthy().await);

        assert_eq!(breakers.snapshot("loans").await.unwrap().failure_count, 1);
    }

    #[tokio::test]
    async fn test_timeout_marks_unhealthy() {
        let slow = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&slow)
            .await;

        let (checker, table, _) = checker(&[("ai", slow.uri())], 50);
        checker.run_cycle().await;

        let record = table.get("ai").await.unwrap();
        assert_eq!(record.status, HealthStatus::Unhealthy);
        assert!(record.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_repeated_healthy_cycles_only_decay_failures() {
        let up = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&up)
            .await;

        let (checker, _, breakers) = checker(&[("users", up.uri())], 1000);
        breakers.record_failure("users").await;
        breakers.record_failure("users").await;

        checker.run_cycle().await;
        checker.run_cycle().await;

        let snapshot = breakers.snapshot("users").await.unwrap();
        assert_eq!(snapshot.state, CircuitState::Closed);
        assert_eq!(snapshot.failure_count, 0);

        checker.run_cycle().await;
        assert_eq!(breakers.snapshot("users").await.unwrap().failure_count, 0);
    }

    #[tokio::test]
    async fn test_disabled_checker_does_not_spawn() {
        let (mut checker, _, _) = checker(&[], 1000);
        checker.config.enabled = false;
        assert!(checker.spawn().is_none());
    }
}
