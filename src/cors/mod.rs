use crate::error::{GatewayError, Result};
use crate::observability::{CORRELATION_ID_HEADER, REQUEST_ID_HEADER};
use axum::http::{HeaderName, HeaderValue, Method};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use tower_http::cors::{AllowHeaders, AllowOrigin, CorsLayer};
use tracing::debug;

/// Cross-origin policy applied to every route
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CorsConfig {
    /// Allowed origins; `["*"]` allows any origin
    #[serde(default = "default_origins")]
    pub allowed_origins: Vec<String>,
    #[serde(default = "default_methods")]
    pub allowed_methods: Vec<String>,
    /// Allowed request headers; `["*"]` mirrors whatever the client asks for
    #[serde(default = "default_headers")]
    pub allowed_headers: Vec<String>,
    #[serde(default)]
    pub allow_credentials: bool,
    /// Preflight cache lifetime
    #[serde(default = "default_max_age")]
    pub max_age_secs: u64,
}

fn default_origins() -> Vec<String> {
    vec!["*".to_string()]
}

fn default_methods() -> Vec<String> {
    ["GET", "POST", "PUT", "PATCH", "DELETE", "OPTIONS"]
        .iter()
        .map(|m| m.to_string())
        .collect()
}

fn default_headers() -> Vec<String> {
    [
        "Content-Type",
        "Authorization",
        "X-API-Key",
        REQUEST_ID_HEADER,
        CORRELATION_ID_HEADER,
    ]
    .iter()
    .map(|h| h.to_string())
    .collect()
}

fn default_max_age() -> u64 {
    3600
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: default_origins(),
            allowed_methods: default_methods(),
            allowed_headers: default_headers(),
            allow_credentials: false,
            max_age_secs: default_max_age(),
        }
    }
}

impl CorsConfig {
    fn is_wildcard(values: &[String]) -> bool {
        values.len() == 1 && values[0] == "*"
    }

    /// Build the tower-http layer; the correlation headers are always exposed
    pub fn build_layer(&self) -> Result<CorsLayer> {
        let origins = if Self::is_wildcard(&self.allowed_origins) {
            if self.allow_credentials {
                return Err(GatewayError::Config(
                    "cors: allow_credentials cannot be combined with a wildcard origin".to_string(),
                ));
            }
            AllowOrigin::any()
        } else {
            AllowOrigin::list(parse_all::<HeaderValue>(&self.allowed_origins, "origin")?)
        };

        let headers = if Self::is_wildcard(&self.allowed_headers) {
            AllowHeaders::mirror_request()
        } else {
            AllowHeaders::list(parse_all::<HeaderName>(&self.allowed_headers, "header name")?)
        };

        let methods = parse_all::<Method>(&self.allowed_methods, "method")?;

        let layer = CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(methods)
            .allow_headers(headers)
            .expose_headers([
                HeaderName::from_static(REQUEST_ID_HEADER),
                HeaderName::from_static(CORRELATION_ID_HEADER),
            ])
            .allow_credentials(self.allow_credentials)
            .max_age(Duration::from_secs(self.max_age_secs));

        debug!(
            origins = ?self.allowed_origins,
            credentials = self.allow_credentials,
            max_age_secs = self.max_age_secs,
            "CORS layer configured"
        );
        Ok(layer)
    }
}

fn parse_all<T: FromStr>(values: &[String], what: &str) -> Result<Vec<T>> {
    values
        .iter()
        .map(|v| {
            T::from_str(v)
                .map_err(|_| GatewayError::Config(format!("Invalid CORS {}: {}", what, v)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_allows_any_origin() {
        let config = CorsConfig::default();
        assert_eq!(config.allowed_origins, vec!["*"]);
        assert!(config.allowed_headers.iter().any(|h| h == CORRELATION_ID_HEADER));
        assert!(config.build_layer().is_ok());
    }

    #[test]
    fn test_explicit_origins_with_credentials() {
        let config = CorsConfig {
            allowed_origins: vec![
                "https://app.example.com".to_string(),
                "https://admin.example.com".to_string(),
            ],
            allow_credentials: true,
            ..Default::default()
        };
        assert!(config.build_layer().is_ok());
    }

    #[test]
    fn test_wildcard_origin_with_credentials_rejected() {
        let config = CorsConfig {
            allow_credentials: true,
            ..Default::default()
        };
        assert!(matches!(config.build_layer(), Err(GatewayError::Config(_))));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let bad_header = CorsConfig {
            allowed_headers: vec!["not a header".to_string()],
            ..Default::default()
        };
        assert!(bad_header.build_layer().is_err());

        let bad_method = CorsConfig {
            allowed_methods: vec!["GE T".to_string()],
            ..Default::default()
        };
        assert!(bad_method.build_layer().is_err());
    }

    #[test]
    fn test_wildcard_headers() {
        let config = CorsConfig {
            allowed_headers: vec!["*".to_string()],
            ..Default::default()
        };
        assert!(config.build_layer().is_ok());
    }

    #[test]
    fn test_deserialize_partial() {
        let yaml = "allowed_origins: [\"https://app.example.com\"]\nmax_age_secs: 600\n";
        let config: CorsConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.max_age_secs, 600);
        assert_eq!(config.allowed_methods, default_methods());
        assert!(!config.allow_credentials);
    }
}
