use axum::{
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Result type for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Gateway error types
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Route not found: {0}")]
    RouteNotFound(String),

    #[error("Too many requests, please try again later")]
    RateLimitExceeded {
        /// Policy that rejected the request
        policy: String,
        /// Ceiling of the policy for this caller
        limit: u32,
        /// Seconds until the window resets
        reset_after_secs: u64,
        /// Human readable retry hint, e.g. "15 minutes"
        retry_hint: String,
    },

    #[error("Service temporarily unavailable: circuit breaker open for {0}")]
    CircuitOpen(String),

    #[error("Service unavailable: {service}: {message}")]
    Upstream { service: String, message: String },

    #[error("Upstream timed out: {service}")]
    UpstreamTimeout { service: String },

    #[error("Authentication failed: {0}")]
    Unauthorized(String),

    #[error("Invalid token: {0}")]
    InvalidToken(String),

    #[error("Missing authentication credentials")]
    MissingCredentials,

    #[error("Insufficient permissions: {0}")]
    Forbidden(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Counter store error: {0}")]
    CounterStore(String),

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<redis::RedisError> for GatewayError {
    fn from(err: redis::RedisError) -> Self {
        GatewayError::CounterStore(err.to_string())
    }
}

/// Uniform JSON error body
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub error: String,
    pub code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<String>,
}

impl GatewayError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::RouteNotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::CircuitOpen(_)
            | GatewayError::Upstream { .. }
            | GatewayError::UpstreamTimeout { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Unauthorized(_)
            | GatewayError::InvalidToken(_)
            | GatewayError::MissingCredentials => StatusCode::UNAUTHORIZED,
            GatewayError::Forbidden(_) => StatusCode::FORBIDDEN,
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::Config(_)
            | GatewayError::CounterStore(_)
            | GatewayError::Internal(_)
            | GatewayError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code clients can branch on
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::RouteNotFound(_) => "ROUTE_NOT_FOUND",
            GatewayError::RateLimitExceeded { .. } => "RATE_LIMIT_EXCEEDED",
            GatewayError::CircuitOpen(_) => "CIRCUIT_BREAKER_OPEN",
            GatewayError::Upstream { .. } => "SERVICE_UNAVAILABLE",
            GatewayError::UpstreamTimeout { .. } => "UPSTREAM_TIMEOUT",
            GatewayError::Unauthorized(_) | GatewayError::MissingCredentials => "UNAUTHORIZED",
            GatewayError::InvalidToken(_) => "INVALID_TOKEN",
            GatewayError::Forbidden(_) => "FORBIDDEN",
            GatewayError::BadRequest(_) => "BAD_REQUEST",
            GatewayError::Config(_)
            | GatewayError::CounterStore(_)
            | GatewayError::Internal(_)
            | GatewayError::Io(_) => "INTERNAL_ERROR",
        }
    }

    /// Human retry hint, present only for rate-limit rejections
    pub fn retry_after(&self) -> Option<String> {
        match self {
            GatewayError::RateLimitExceeded { retry_hint, .. } => Some(retry_hint.clone()),
            _ => None,
        }
    }

    /// Admission rejections are expected traffic shaping, not faults
    pub fn is_admission_rejection(&self) -> bool {
        matches!(
            self,
            GatewayError::RateLimitExceeded { .. } | GatewayError::CircuitOpen(_)
        )
    }

    /// Message shown to clients. Internal faults never leak their detail.
    fn public_message(&self) -> String {
        match self {
            GatewayError::Config(_)
            | GatewayError::CounterStore(_)
            | GatewayError::Internal(_)
            | GatewayError::Io(_) => "Internal gateway error".to_string(),
            other => other.to_string(),
        }
    }

    /// Render the uniform error response, tagging it with the request id when known
    pub fn to_response(&self, request_id: Option<&str>) -> Response {
        let status = self.status_code();
        let body = ErrorBody {
            error: self.public_message(),
            code: self.code(),
            request_id: request_id.map(str::to_string),
            retry_after: self.retry_after(),
        };

        let mut response = (status, Json(body)).into_response();

        if let GatewayError::RateLimitExceeded {
            limit,
            reset_after_secs,
            ..
        } = self
        {
            let headers = response.headers_mut();
            headers.insert("X-RateLimit-Limit", HeaderValue::from(*limit));
            headers.insert("X-RateLimit-Remaining", HeaderValue::from(0u32));
            headers.insert("X-RateLimit-Reset", HeaderValue::from(*reset_after_secs));
            headers.insert("Retry-After", HeaderValue::from(*reset_after_secs));
        }

        response
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        self.to_response(None)
    }
}
