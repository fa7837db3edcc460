use crate::error::{GatewayError, Result};
use crate::gateway::Gateway;
use crate::metrics;
use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, HeaderValue},
    middleware::Next,
    response::Response,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, info_span, warn, Instrument};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";

const DEFAULT_FILTER: &str = "edge_gateway=debug,tower_http=info";

/// Initialize the global tracing subscriber.
///
/// `RUST_LOG` selects the filter; `LOG_FORMAT=json` switches to JSON lines.
pub fn init_tracing() -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_FILTER.into());
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let builder = tracing_subscriber::fmt().with_env_filter(env_filter);
    let installed = if json {
        builder.json().with_current_span(true).try_init()
    } else {
        builder.with_target(true).compact().try_init()
    };
    installed.map_err(|e| GatewayError::Internal(format!("Failed to install subscriber: {}", e)))?;

    info!(json, "Tracing initialized");
    Ok(())
}

/// Request and correlation ids, stored in request extensions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestIds {
    pub request_id: String,
    pub correlation_id: String,
}

impl RequestIds {
    /// Take ids from inbound headers, generating a UUID v4 request id when absent.
    /// The correlation id defaults to the request id.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };

        let request_id = header(REQUEST_ID_HEADER).unwrap_or_else(|| Uuid::new_v4().to_string());
        let correlation_id = header(CORRELATION_ID_HEADER).unwrap_or_else(|| request_id.clone());

        Self {
            request_id,
            correlation_id,
        }
    }

    /// Write both ids onto a header map
    pub fn apply(&self, headers: &mut HeaderMap) {
        if let Ok(value) = HeaderValue::from_str(&self.request_id) {
            headers.insert(REQUEST_ID_HEADER, value);
        }
        if let Ok(value) = HeaderValue::from_str(&self.correlation_id) {
            headers.insert(CORRELATION_ID_HEADER, value);
        }
    }
}

/// Assign correlation ids, echo them on the response and log completion.
pub async fn correlation_middleware(
    State(gateway): State<Arc<Gateway>>,
    mut request: Request,
    next: Next,
) -> Response {
    let start = Instant::now();
    let ids = RequestIds::from_headers(request.headers());
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    gateway.stats().record_request();
    request.extensions_mut().insert(ids.clone());

    let span = info_span!(
        "request",
        method = %method,
        path = %path,
        request_id = %ids.request_id,
        correlation_id = %ids.correlation_id,
    );

    let mut response = next.run(request).instrument(span).await;
    ids.apply(response.headers_mut());

    let status = response.status();
    let latency = start.elapsed();
    metrics::record_request(method.as_str(), &path, status.as_u16(), latency.as_secs_f64());

    if status.is_server_error() {
        warn!(
            method = %method,
            path = %path,
            status = status.as_u16(),
            latency_ms = latency.as_millis() as u64,
            request_id = %ids.request_id,
            correlation_id = %ids.correlation_id,
            "Request completed with server error"
        );
    } else {
        info!(
            method = %method,
            path = %path,
            status = status.as_u16(),
            latency_ms = latency.as_millis() as u64,
            request_id = %ids.request_id,
            correlation_id = %ids.correlation_id,
            "Request completed"
        );
    }

    response
}

/// Client address: the first `X-Forwarded-For` hop when trusted, else the peer address
pub fn client_ip<B>(request: &axum::http::Request<B>, trust_forwarded_for: bool) -> String {
    if trust_forwarded_for {
        let forwarded = request
            .headers()
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty());
        if let Some(ip) = forwarded {
            return ip.to_string();
        }
    }

    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    #[test]
    fn test_ids_generated_when_absent() {
        let ids = RequestIds::from_headers(&HeaderMap::new());
        assert_eq!(ids.request_id.len(), 36);
        assert_eq!(ids.correlation_id, ids.request_id);
        assert!(Uuid::parse_str(&ids.request_id).is_ok());
    }

    #[test]
    fn test_inbound_ids_preserved() {
        let mut headers = HeaderMap::new();
        headers.insert(REQUEST_ID_HEADER, HeaderValue::from_static("req-1"));
        headers.insert(CORRELATION_ID_HEADER, HeaderValue::from_static("corr-9"));

        let ids = RequestIds::from_headers(&headers);
        assert_eq!(ids.request_id, "req-1");
        assert_eq!(ids.correlation_id, "corr-9");
    }

    #[test]
    fn test_correlation_defaults_to_inbound_request_id() {
        let mut headers = HeaderMap::new();
        headers.insert(REQUEST_ID_HEADER, HeaderValue::from_static("req-1"));

        let ids = RequestIds::from_headers(&headers);
        assert_eq!(ids.correlation_id, "req-1");
    }

    #[test]
    fn test_apply_writes_headers() {
        let ids = RequestIds {
            request_id: "a".to_string(),
            correlation_id: "b".to_string(),
        };
        let mut headers = HeaderMap::new();
        ids.apply(&mut headers);
        assert_eq!(headers[REQUEST_ID_HEADER], "a");
        assert_eq!(headers[CORRELATION_ID_HEADER], "b");
    }

    #[test]
    fn test_client_ip_sources() {
        let mut request = axum::http::Request::builder()
            .uri("/api/users")
            .header("x-forwarded-for", "203.0.113.7, 10.0.0.1")
            .body(Body::empty())
            .unwrap();
        assert_eq!(client_ip(&request, false), "unknown");
        assert_eq!(client_ip(&request, true), "203.0.113.7");

        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([192, 168, 1, 5], 40000))));
        assert_eq!(client_ip(&request, false), "192.168.1.5");
    }
}
