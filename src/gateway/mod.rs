//! The assembled gateway: every shared component, owned by one value that
//! axum handlers receive as `State<Arc<Gateway>>`.

use crate::auth::{self, Authenticator, Principal};
use crate::circuit_breaker::CircuitBreakerBank;
use crate::config::{default_api_key_header, GatewayConfig};
use crate::counter_store::{self, CounterStore};
use crate::error::{GatewayError, Result};
use crate::healthcheck::{HealthChecker, HealthTable};
use crate::metrics::GatewayStats;
use crate::notify::{NoopNotifier, SecurityNotifier};
use crate::observability::{self, RequestIds};
use crate::proxy::Chain;
use crate::rate_limit::RateLimiterSet;
use crate::registry::ServiceRegistry;
use axum::http::HeaderMap;
use axum::response::Response;
use metrics_exporter_prometheus::PrometheusHandle;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

pub struct Gateway {
    config: GatewayConfig,
    registry: ServiceRegistry,
    breakers: Arc<CircuitBreakerBank>,
    health: Arc<HealthTable>,
    limiters: Arc<RateLimiterSet>,
    authenticator: Arc<dyn Authenticator>,
    client: reqwest::Client,
    chains: HashMap<String, Chain>,
    stats: GatewayStats,
    started_at: Instant,
    prometheus: Option<PrometheusHandle>,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("services", &self.registry.names())
            .field("limiters", &self.limiters)
            .field("chains", &self.chains)
            .finish()
    }
}

impl Gateway {
    pub fn builder(config: GatewayConfig) -> GatewayBuilder {
        GatewayBuilder::new(config)
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerBank> {
        &self.breakers
    }

    pub fn health(&self) -> &Arc<HealthTable> {
        &self.health
    }

    pub fn limiters(&self) -> &Arc<RateLimiterSet> {
        &self.limiters
    }

    pub fn authenticator(&self) -> &Arc<dyn Authenticator> {
        &self.authenticator
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub fn stats(&self) -> &GatewayStats {
        &self.stats
    }

    /// Middleware chain of a registered service
    pub fn chain(&self, service: &str) -> Option<&Chain> {
        self.chains.get(service)
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn prometheus(&self) -> Option<&PrometheusHandle> {
        self.prometheus.as_ref()
    }

    /// Health checker sharing this gateway's breakers and health table
    pub fn health_checker(&self) -> HealthChecker {
        HealthChecker::new(
            self.config.health_check.clone(),
            &self.registry,
            self.health.clone(),
            self.breakers.clone(),
            self.client.clone(),
        )
    }

    pub fn client_ip<B>(&self, request: &axum::http::Request<B>) -> String {
        observability::client_ip(request, self.config.server.trust_forwarded_for)
    }

    /// Hashed identifier of the request's API key, if one was sent
    pub fn api_key_id(&self, headers: &HeaderMap) -> Option<String> {
        let header = self
            .config
            .auth
            .as_ref()
            .map(|auth| auth.api_key_header.clone())
            .unwrap_or_else(default_api_key_header);

        headers
            .get(header.as_str())
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(auth::api_key_id)
    }

    /// Caller identity if the request carries valid credentials
    pub async fn optional_principal(&self, headers: &HeaderMap) -> Option<Principal> {
        self.authenticator.identify(headers).await
    }

    /// Log, count and render an error for the client
    pub fn error_response(
        &self,
        err: &GatewayError,
        ids: &RequestIds,
        service: Option<&str>,
    ) -> Response {
        match err {
            GatewayError::Upstream { .. } | GatewayError::UpstreamTimeout { .. } => {
                error!(
                    service = service.unwrap_or("-"),
                    correlation_id = %ids.correlation_id,
                    error = %err,
                    "Upstream unavailable"
                );
            }
            GatewayError::Config(_)
            | GatewayError::CounterStore(_)
            | GatewayError::Internal(_)
            | GatewayError::Io(_) => {
                error!(
                    service = service.unwrap_or("-"),
                    request_id = %ids.request_id,
                    error = %err,
                    "Gateway fault"
                );
            }
            _ if err.is_admission_rejection() => {
                info!(
                    code = err.code(),
                    service = service.unwrap_or("-"),
                    request_id = %ids.request_id,
                    "Request shed"
                );
            }
            _ => {
                debug!(
                    code = err.code(),
                    request_id = %ids.request_id,
                    error = %err,
                    "Request rejected"
                );
            }
        }

        self.stats.record_rejection(err);
        err.to_response(Some(&ids.request_id))
    }
}

/// Assembles a [`Gateway`] from configuration plus injected collaborators
pub struct GatewayBuilder {
    config: GatewayConfig,
    counter_store: Option<Arc<dyn CounterStore>>,
    authenticator: Option<Arc<dyn Authenticator>>,
    notifier: Option<Arc<dyn SecurityNotifier>>,
    client: Option<reqwest::Client>,
    prometheus: Option<PrometheusHandle>,
}

impl GatewayBuilder {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            config,
            counter_store: None,
            authenticator: None,
            notifier: None,
            client: None,
            prometheus: None,
        }
    }

    /// Use this store instead of connecting to the configured one
    pub fn counter_store(mut self, store: Arc<dyn CounterStore>) -> Self {
        self.counter_store = Some(store);
        self
    }

    /// Use this authenticator instead of the one described by `auth`
    pub fn authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn SecurityNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn http_client(mut self, client: reqwest::Client) -> Self {
        self.client = Some(client);
        self
    }

    pub fn prometheus(mut self, handle: PrometheusHandle) -> Self {
        self.prometheus = Some(handle);
        self
    }

    pub async fn build(self) -> Result<Gateway> {
        let config = self.config;
        config.validate()?;

        let registry = ServiceRegistry::from_config(&config)?;
        let notifier = self
            .notifier
            .unwrap_or_else(|| Arc::new(NoopNotifier) as Arc<dyn SecurityNotifier>);
        let authenticator = match self.authenticator {
            Some(authenticator) => authenticator,
            None => auth::from_config(config.auth.as_ref())?,
        };
        let store = match self.counter_store {
            Some(store) => store,
            None => counter_store::connect(&config.counter_store).await,
        };
        let client = match self.client {
            Some(client) => client,
            None => reqwest::Client::builder()
                .pool_idle_timeout(Duration::from_secs(90))
                .build()
                .map_err(|e| {
                    GatewayError::Internal(format!("Failed to create HTTP client: {}", e))
                })?,
        };

        let limiters = Arc::new(RateLimiterSet::new(
            &config.rate_limiting,
            store,
            config.counter_store.key_prefix.clone(),
            notifier.clone(),
        ));
        let breakers = Arc::new(CircuitBreakerBank::new(
            registry.names(),
            &config.circuit_breaker,
            notifier.clone(),
        ));
        let health = Arc::new(HealthTable::new(registry.names()));

        let chains = registry
            .iter()
            .map(|service| {
                let chain =
                    Chain::for_service(service, &limiters, &authenticator, &breakers, &notifier);
                debug!(
                    service = %service.name,
                    stages = ?chain.stage_names(),
                    "Built middleware chain"
                );
                (service.name.clone(), chain)
            })
            .collect();

        info!(
            services = registry.len(),
            counter_store = limiters.backend_name(),
            "Gateway assembled"
        );

        Ok(Gateway {
            config,
            registry,
            breakers,
            health,
            limiters,
            authenticator,
            client,
            chains,
            stats: GatewayStats::new(),
            started_at: Instant::now(),
            prometheus: self.prometheus,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counter_store::MemoryCounterStore;
    use axum::http::HeaderValue;

    const CONFIG: &str = r#"
auth:
  api_key_header: X-Partner-Key
services:
  - name: auth
    target: "http://auth:3001"
    requires_auth: false
  - name: loans
    target: "http://loans:3003"
    allowed_roles: [borrower]
"#;

    async fn gateway() -> Gateway {
        GatewayBuilder::new(GatewayConfig::from_yaml(CONFIG).unwrap())
            .counter_store(Arc::new(MemoryCounterStore::new()))
            .build()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_build_registers_every_service() {
        let gateway = gateway().await;
        assert_eq!(gateway.registry().names(), vec!["auth", "loans"]);
        assert_eq!(gateway.breakers().services(), vec!["auth", "loans"]);
        assert!(gateway.chain("loans").is_some());
        assert!(gateway.chain("nope").is_none());
        assert_eq!(gateway.limiters().backend_name(), "memory");
        assert!(gateway.prometheus().is_none());
    }

    #[tokio::test]
    async fn test_build_rejects_invalid_config() {
        let config = GatewayConfig::from_yaml(
            "services:\n  - name: loans\n    target: \"not a url\"\n",
        )
        .unwrap();
        assert!(GatewayBuilder::new(config).build().await.is_err());
    }

    #[tokio::test]
    async fn test_api_key_id_uses_configured_header() {
        let gateway = gateway().await;
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("ignored"));
        assert_eq!(gateway.api_key_id(&headers), None);

        headers.insert("x-partner-key", HeaderValue::from_static("sk_live_1"));
        assert_eq!(gateway.api_key_id(&headers), Some(auth::api_key_id("sk_live_1")));
    }

    #[tokio::test]
    async fn test_error_response_counts_rejections() {
        let gateway = gateway().await;
        let ids = RequestIds {
            request_id: "req-1".to_string(),
            correlation_id: "req-1".to_string(),
        };

        let response = gateway.error_response(
            &GatewayError::CircuitOpen("loans".to_string()),
            &ids,
            Some("loans"),
        );
        assert_eq!(response.status(), 503);
        assert_eq!(gateway.stats().snapshot().circuit_rejected, 1);
    }
}
