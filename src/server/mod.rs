//! HTTP surface: operational endpoints, the `/api` proxy routes and the
//! layer stack around them.

use crate::error::{GatewayError, Result};
use crate::gateway::Gateway;
use crate::healthcheck::{HealthRecord, HealthStatus};
use crate::metrics::resident_memory_bytes;
use crate::observability::{correlation_middleware, RequestIds};
use crate::proxy::proxy_handler;
use crate::rate_limit::global_rate_limit;
use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    middleware::from_fn_with_state,
    response::{IntoResponse, Response},
    routing::{any, get},
    Extension, Json, Router,
};
use chrono::Utc;
use serde_json::json;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};
use tracing::{info, warn};

const ADMIN_ROLE: &str = "admin";

/// Build the application router.
///
/// Layer order, outermost first: body limit, CORS, trace, correlation ids,
/// global rate limits, then the routes.
pub fn build_app(gateway: Arc<Gateway>) -> Result<Router> {
    let cors = gateway.config().cors.build_layer()?;
    let body_limit = gateway.config().server.body_limit_bytes;

    let router = Router::new()
        .route("/health", get(health))
        .route("/health/detailed", get(health_detailed))
        .route("/metrics", get(metrics_summary))
        .route("/metrics/prometheus", get(prometheus))
        .route("/services", get(services))
        .route("/api/:service", any(proxy_handler))
        .route("/api/:service/", any(proxy_handler))
        .route("/api/:service/*rest", any(proxy_handler))
        .fallback(not_found)
        .layer(from_fn_with_state(gateway.clone(), global_rate_limit))
        .layer(from_fn_with_state(gateway.clone(), correlation_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(RequestBodyLimitLayer::new(body_limit))
        .with_state(gateway);

    Ok(router)
}

/// Serve until Ctrl-C or SIGTERM
pub async fn run(gateway: Arc<Gateway>) -> Result<()> {
    let app = build_app(gateway.clone())?;
    let server = &gateway.config().server;
    let addr = format!("{}:{}", server.host, server.port);
    let listener = TcpListener::bind(&addr).await?;

    let checker = gateway.health_checker().spawn();

    info!(
        address = %addr,
        services = gateway.registry().len(),
        gateway = %server.gateway_name,
        "Gateway listening"
    );

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .map_err(|e| GatewayError::Internal(format!("Server error: {}", e)))?;

    if let Some(handle) = checker {
        handle.abort();
    }
    info!("Gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received, draining connections");
}

fn overall_status(records: &BTreeMap<String, HealthRecord>) -> (StatusCode, &'static str) {
    if records.values().any(|r| r.status == HealthStatus::Unhealthy) {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    } else {
        (StatusCode::OK, "healthy")
    }
}

async fn health(State(gateway): State<Arc<Gateway>>) -> Response {
    let records = gateway.health().all().await;
    let (code, status) = overall_status(&records);
    let services: BTreeMap<_, _> = records
        .iter()
        .map(|(name, record)| (name.clone(), record.status))
        .collect();

    let body = json!({
        "status": status,
        "timestamp": Utc::now(),
        "uptimeSecs": gateway.uptime().as_secs(),
        "services": services,
    });
    (code, Json(body)).into_response()
}

async fn health_detailed(State(gateway): State<Arc<Gateway>>) -> Response {
    let records = gateway.health().all().await;
    let (code, status) = overall_status(&records);

    let mut services = serde_json::Map::new();
    for (name, record) in &records {
        let breaker = gateway.breakers().snapshot(name).await;
        services.insert(
            name.clone(),
            json!({
                "health": record,
                "circuitBreaker": breaker,
            }),
        );
    }

    let body = json!({
        "status": status,
        "timestamp": Utc::now(),
        "uptimeSecs": gateway.uptime().as_secs(),
        "services": services,
    });
    (code, Json(body)).into_response()
}

async fn metrics_summary(State(gateway): State<Arc<Gateway>>) -> Json<serde_json::Value> {
    let breakers: BTreeMap<_, _> = gateway
        .breakers()
        .snapshots()
        .await
        .into_iter()
        .map(|s| {
            (
                s.service.clone(),
                json!({ "state": s.state, "failureCount": s.failure_count }),
            )
        })
        .collect();

    Json(json!({
        "uptimeSecs": gateway.uptime().as_secs(),
        "requests": gateway.stats().snapshot(),
        "memory": { "residentBytes": resident_memory_bytes() },
        "circuitBreakers": breakers,
        "rateLimitBackend": gateway.limiters().backend_name(),
    }))
}

async fn prometheus(State(gateway): State<Arc<Gateway>>) -> Response {
    match gateway.prometheus() {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "Prometheus recorder not installed").into_response(),
    }
}

/// Registry dump for administrators
async fn services(
    State(gateway): State<Arc<Gateway>>,
    Extension(ids): Extension<RequestIds>,
    headers: HeaderMap,
) -> Response {
    let principal = match gateway.authenticator().authenticate(&headers).await {
        Ok(principal) => principal,
        Err(e) => return gateway.error_response(&e, &ids, None),
    };

    let admins = [ADMIN_ROLE.to_string()];
    if !gateway.authenticator().authorize(&principal, &admins, &[]) {
        warn!(
            target: "security",
            user = %principal.id,
            role = %principal.role,
            request_id = %ids.request_id,
            "Non-admin requested service registry"
        );
        let e = GatewayError::Forbidden("admin role required".to_string());
        return gateway.error_response(&e, &ids, None);
    }

    let services: Vec<_> = gateway.registry().iter().map(|s| s.as_ref()).collect();
    Json(json!({ "count": services.len(), "services": services })).into_response()
}

async fn not_found(
    State(gateway): State<Arc<Gateway>>,
    Extension(ids): Extension<RequestIds>,
    uri: axum::http::Uri,
) -> Response {
    let e = GatewayError::RouteNotFound(uri.path().to_string());
    gateway.error_response(&e, &ids, None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(status: HealthStatus) -> HealthRecord {
        HealthRecord {
            status,
            ..HealthRecord::unknown()
        }
    }

    #[test]
    fn test_unknown_is_not_degraded() {
        let mut records = BTreeMap::new();
        records.insert("auth".to_string(), record(HealthStatus::Healthy));
        records.insert("loans".to_string(), record(HealthStatus::Unknown));
        assert_eq!(overall_status(&records), (StatusCode::OK, "healthy"));
    }

    #[test]
    fn test_any_unhealthy_degrades() {
        let mut records = BTreeMap::new();
        records.insert("auth".to_string(), record(HealthStatus::Healthy));
        records.insert("loans".to_string(), record(HealthStatus::Unhealthy));
        assert_eq!(
            overall_status(&records),
            (StatusCode::SERVICE_UNAVAILABLE, "degraded")
        );
    }

    #[test]
    fn test_no_services_is_healthy() {
        assert_eq!(overall_status(&BTreeMap::new()).1, "healthy");
    }
}
