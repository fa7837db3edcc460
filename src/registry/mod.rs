//! Service registry
//!
//! Resolves configured [`ServiceEntry`] values against the service defaults
//! into immutable [`ServiceConfig`]s, keyed by name.

use crate::circuit_breaker::RetryConfig;
use crate::config::{GatewayConfig, ServiceEntry};
use crate::error::{GatewayError, Result};
use axum::http::Method;
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Compiled path rewrite rule
#[derive(Debug, Clone)]
pub struct PathRewrite {
    pattern: Regex,
    replacement: String,
}

impl PathRewrite {
    pub fn new(pattern: &str, replacement: impl Into<String>) -> Result<Self> {
        let pattern = Regex::new(pattern).map_err(|e| {
            GatewayError::Config(format!("Invalid path rewrite '{}': {}", pattern, e))
        })?;
        Ok(Self {
            pattern,
            replacement: replacement.into(),
        })
    }

    /// Strip `/api/{service}` from the front of the path
    pub fn strip_service_prefix(service: &str) -> Result<Self> {
        Self::new(&format!("^/api/{}", regex::escape(service)), "")
    }

    /// Rewrite a path; an empty result becomes `/`
    pub fn apply(&self, path: &str) -> String {
        let rewritten = self.pattern.replace(path, self.replacement.as_str());
        if rewritten.is_empty() {
            "/".to_string()
        } else if rewritten.starts_with('/') {
            rewritten.into_owned()
        } else {
            format!("/{}", rewritten)
        }
    }

    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }
}

/// A registered downstream service. Immutable after registration.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfig {
    pub name: String,
    /// Base URL without trailing slash
    pub target: String,
    pub description: String,
    pub timeout_ms: u64,
    pub retry: RetryConfig,
    /// Upper-case method names eligible for retry
    pub retry_methods: Vec<String>,
    pub requires_auth: bool,
    pub allowed_roles: Vec<String>,
    pub allowed_permissions: Vec<String>,
    #[serde(serialize_with = "serialize_rewrite")]
    pub path_rewrite: PathRewrite,
    pub health_path: String,
    pub rate_limits: Vec<String>,
}

fn serialize_rewrite<S: serde::Serializer>(
    rewrite: &PathRewrite,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(rewrite.pattern())
}

impl ServiceConfig {
    /// Resolve an entry against the gateway-wide defaults
    pub fn resolve(entry: &ServiceEntry, config: &GatewayConfig) -> Result<Self> {
        let defaults = &config.defaults;

        let path_rewrite = match &entry.path_rewrite {
            Some(rewrite) => PathRewrite::new(&rewrite.pattern, rewrite.replacement.clone())?,
            None => PathRewrite::strip_service_prefix(&entry.name)?,
        };

        let retry_methods = entry
            .retry_methods
            .as_ref()
            .unwrap_or(&defaults.retry_methods)
            .iter()
            .map(|m| m.to_uppercase())
            .collect();

        Ok(Self {
            name: entry.name.clone(),
            target: entry.target.trim_end_matches('/').to_string(),
            description: entry.description.clone(),
            timeout_ms: entry.timeout_ms.unwrap_or(defaults.timeout_ms),
            retry: RetryConfig {
                max_retries: entry.retries.unwrap_or(defaults.retries),
                initial_backoff_ms: defaults.retry_backoff_ms,
                max_backoff_ms: defaults.max_backoff_ms,
                ..RetryConfig::default()
            },
            retry_methods,
            requires_auth: entry.requires_auth,
            allowed_roles: entry.allowed_roles.clone(),
            allowed_permissions: entry.allowed_permissions.clone(),
            path_rewrite,
            health_path: entry
                .health_path
                .clone()
                .unwrap_or_else(|| config.health_check.path.clone()),
            rate_limits: entry.rate_limits.clone(),
        })
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Whether a failed call with this method may be retried
    pub fn is_retryable(&self, method: &Method) -> bool {
        self.retry_methods.iter().any(|m| m == method.as_str())
    }

    /// Whether authorization constraints are configured
    pub fn requires_authorization(&self) -> bool {
        !self.allowed_roles.is_empty() || !self.allowed_permissions.is_empty()
    }

    /// Downstream URL for an inbound path and optional query string
    pub fn upstream_url(&self, path: &str, query: Option<&str>) -> String {
        let rewritten = self.path_rewrite.apply(path);
        match query {
            Some(q) if !q.is_empty() => format!("{}{}?{}", self.target, rewritten, q),
            _ => format!("{}{}", self.target, rewritten),
        }
    }

    pub fn health_url(&self) -> String {
        format!("{}{}", self.target, self.health_path)
    }
}

/// All registered services, by name
#[derive(Debug, Clone, Default)]
pub struct ServiceRegistry {
    services: BTreeMap<String, Arc<ServiceConfig>>,
}

impl ServiceRegistry {
    /// Register every configured service
    pub fn from_config(config: &GatewayConfig) -> Result<Self> {
        let mut services = BTreeMap::new();
        for entry in &config.services {
            let service = ServiceConfig::resolve(entry, config)?;
            if services
                .insert(service.name.clone(), Arc::new(service))
                .is_some()
            {
                return Err(GatewayError::Config(format!(
                    "Duplicate service name: {}",
                    entry.name
                )));
            }
        }
        Ok(Self { services })
    }

    pub fn get(&self, name: &str) -> Option<&Arc<ServiceConfig>> {
        self.services.get(name)
    }

    /// Look up a service or fail with `ROUTE_NOT_FOUND`
    pub fn resolve(&self, name: &str) -> Result<Arc<ServiceConfig>> {
        self.services
            .get(name)
            .cloned()
            .ok_or_else(|| GatewayError::RouteNotFound(format!("/api/{}", name)))
    }

    pub fn names(&self) -> Vec<String> {
        self.services.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ServiceConfig>> {
        self.services.values()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}
