use crate::circuit_breaker::CircuitBreakerConfig;
use crate::cors::CorsConfig;
use crate::counter_store::CounterStoreConfig;
use crate::error::{GatewayError, Result};
use crate::healthcheck::HealthCheckConfig;
use crate::rate_limit::RateLimitingConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// Prefix of environment variables that override file settings,
/// e.g. `GATEWAY__SERVER__PORT=9090`
pub const ENV_PREFIX: &str = "GATEWAY";

const VALID_METHODS: &[&str] = &["GET", "POST", "PUT", "DELETE", "PATCH", "HEAD", "OPTIONS"];

/// Main gateway configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// Defaults applied to services that leave a setting unset
    #[serde(default)]
    pub defaults: ServiceDefaults,
    /// Circuit breaker thresholds shared by every service
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    /// Active health checking
    #[serde(default)]
    pub health_check: HealthCheckConfig,
    /// Backing store for rate limit counters
    #[serde(default)]
    pub counter_store: CounterStoreConfig,
    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,
    /// Authentication configuration
    #[serde(default)]
    pub auth: Option<AuthConfig>,
    /// CORS configuration
    #[serde(default)]
    pub cors: CorsConfig,
    /// Downstream services
    #[serde(default)]
    pub services: Vec<ServiceEntry>,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Server host address
    #[serde(default = "default_host")]
    pub host: String,
    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Value of the `X-Gateway` response header
    #[serde(default = "default_gateway_name")]
    pub gateway_name: String,
    /// Take the client IP from `X-Forwarded-For` (only behind a trusted proxy)
    #[serde(default)]
    pub trust_forwarded_for: bool,
    /// Largest accepted request body
    #[serde(default = "default_body_limit")]
    pub body_limit_bytes: usize,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_gateway_name() -> String {
    "edge-gateway".to_string()
}

fn default_body_limit() -> usize {
    10 * 1024 * 1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            gateway_name: default_gateway_name(),
            trust_forwarded_for: false,
            body_limit_bytes: default_body_limit(),
        }
    }
}

/// Service defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceDefaults {
    /// Per-call upstream timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Retries after a network failure or timeout
    #[serde(default)]
    pub retries: u32,
    /// Methods eligible for retry
    #[serde(default = "default_retry_methods")]
    pub retry_methods: Vec<String>,
    /// First retry delay in milliseconds
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Ceiling on the retry delay in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_retry_methods() -> Vec<String> {
    vec!["GET".to_string(), "HEAD".to_string(), "OPTIONS".to_string()]
}

fn default_retry_backoff_ms() -> u64 {
    100
}

fn default_max_backoff_ms() -> u64 {
    2000
}

impl Default for ServiceDefaults {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            retries: 0,
            retry_methods: default_retry_methods(),
            retry_backoff_ms: default_retry_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

/// A downstream service as written in configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceEntry {
    /// Unique service name; also the `/api/{name}` path segment
    pub name: String,
    /// Base URL of the service
    pub target: String,
    /// Service description
    #[serde(default)]
    pub description: String,
    /// Overrides `defaults.timeout_ms`
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Overrides `defaults.retries`
    #[serde(default)]
    pub retries: Option<u32>,
    /// Overrides `defaults.retry_methods`
    #[serde(default)]
    pub retry_methods: Option<Vec<String>>,
    /// Whether callers must authenticate
    #[serde(default = "default_true")]
    pub requires_auth: bool,
    /// Roles allowed to call the service (empty: any)
    #[serde(default)]
    pub allowed_roles: Vec<String>,
    /// Permissions every caller must hold
    #[serde(default)]
    pub allowed_permissions: Vec<String>,
    /// Path rewrite applied before forwarding
    #[serde(default)]
    pub path_rewrite: Option<PathRewriteConfig>,
    /// Overrides `health_check.path`
    #[serde(default)]
    pub health_path: Option<String>,
    /// Route rate limit policies, by name
    #[serde(default)]
    pub rate_limits: Vec<String>,
}

/// Regex path rewrite
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PathRewriteConfig {
    /// Pattern matched against the inbound path
    pub pattern: String,
    /// Replacement (supports `$1` style captures)
    #[serde(default)]
    pub replacement: String,
}

/// Global authentication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
    /// JWT configuration
    #[serde(default)]
    pub jwt: Option<JwtConfig>,
    /// Header carrying an API key, used for rate limiting identity
    #[serde(default = "default_api_key_header")]
    pub api_key_header: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt: None,
            api_key_header: default_api_key_header(),
        }
    }
}

/// JWT authentication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JwtConfig {
    /// Secret key for HS256 (if using symmetric encryption)
    #[serde(default)]
    pub secret: Option<String>,
    /// Public key for RS256 (if using asymmetric encryption)
    #[serde(default)]
    pub public_key: Option<String>,
    /// Algorithm to use (HS256 or RS256)
    #[serde(default = "default_jwt_algorithm")]
    pub algorithm: String,
    /// Issuer to validate
    #[serde(default)]
    pub issuer: Option<String>,
    /// Audience to validate
    #[serde(default)]
    pub audience: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_jwt_algorithm() -> String {
    "HS256".to_string()
}

pub(crate) fn default_api_key_header() -> String {
    "X-API-Key".to_string()
}

impl GatewayConfig {
    /// Load a YAML file, then apply `GATEWAY__SECTION__KEY` environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let settings = config::Config::builder()
            .add_source(
                config::File::from(path)
                    .format(config::FileFormat::Yaml)
                    .required(true),
            )
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| {
                GatewayError::Config(format!("Failed to load {}: {}", path.display(), e))
            })?;

        settings
            .try_deserialize()
            .map_err(|e| GatewayError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Load configuration from a YAML file without environment overrides
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| GatewayError::Config(format!("Failed to read config file: {}", e)))?;

        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| GatewayError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let breaker = &self.circuit_breaker;
        if breaker.failure_threshold == 0 || breaker.success_threshold == 0 {
            return Err(GatewayError::Config(
                "Circuit breaker thresholds must be > 0".to_string(),
            ));
        }

        if self.health_check.enabled && self.health_check.interval_secs == 0 {
            return Err(GatewayError::Config(
                "Health check interval must be > 0".to_string(),
            ));
        }

        validate_methods(&self.defaults.retry_methods, "defaults")?;

        let policies = self.rate_limiting.resolved_policies();
        for (name, policy) in &policies {
            if policy.window_secs == 0 {
                return Err(GatewayError::Config(format!(
                    "Rate limit window must be > 0 for policy: {}",
                    name
                )));
            }
            if policy.max == 0 {
                return Err(GatewayError::Config(format!(
                    "Rate limit max must be > 0 for policy: {}",
                    name
                )));
            }
            validate_methods(&policy.methods, name)?;
        }

        for name in &self.rate_limiting.global_policies {
            if !policies.contains_key(name) {
                return Err(GatewayError::Config(format!(
                    "Unknown global rate limit policy: {}",
                    name
                )));
            }
        }

        let mut seen = HashSet::new();
        for service in &self.services {
            if service.name.is_empty() {
                return Err(GatewayError::Config(
                    "Service name cannot be empty".to_string(),
                ));
            }

            if !seen.insert(service.name.as_str()) {
                return Err(GatewayError::Config(format!(
                    "Duplicate service name: {}",
                    service.name
                )));
            }

            let target = url::Url::parse(&service.target).map_err(|e| {
                GatewayError::Config(format!(
                    "Invalid target URL for service {}: {}",
                    service.name, e
                ))
            })?;
            if target.scheme() != "http" && target.scheme() != "https" {
                return Err(GatewayError::Config(format!(
                    "Target URL must use http:// or https:// for service: {}",
                    service.name
                )));
            }

            if let Some(methods) = &service.retry_methods {
                validate_methods(methods, &service.name)?;
            }

            if let Some(rewrite) = &service.path_rewrite {
                regex::Regex::new(&rewrite.pattern).map_err(|e| {
                    GatewayError::Config(format!(
                        "Invalid path rewrite for service {}: {}",
                        service.name, e
                    ))
                })?;
            }

            for policy in &service.rate_limits {
                if !policies.contains_key(policy) {
                    return Err(GatewayError::Config(format!(
                        "Unknown rate limit policy '{}' for service: {}",
                        policy, service.name
                    )));
                }
            }
        }

        Ok(())
    }
}

fn validate_methods(methods: &[String], owner: &str) -> Result<()> {
    for method in methods {
        if !VALID_METHODS.contains(&method.to_uppercase().as_str()) {
            return Err(GatewayError::Config(format!(
                "Invalid HTTP method '{}' for: {}",
                method, owner
            )));
        }
    }
    Ok(())
}
