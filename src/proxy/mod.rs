//! Request forwarding
//!
//! The `/api/{service}` handler resolves the service, runs its middleware
//! [`Chain`], forwards the request and annotates the response. Responses are
//! buffered in full before anything is written to the client.

pub mod chain;

pub use chain::{
    Authenticate, Authorize, Chain, CircuitGate, Middleware, RequestContext, RouteRateLimit,
};

use crate::circuit_breaker::{RetryConfig, RetryExecutor};
use crate::error::{GatewayError, Result};
use crate::gateway::Gateway;
use crate::metrics;
use crate::observability::RequestIds;
use axum::{
    body::Body,
    extract::{Path, Request, State},
    http::{header, request::Parts, HeaderMap, HeaderName, HeaderValue, Method},
    response::Response,
};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

const X_GATEWAY_SERVICE: &str = "x-gateway-service";
const X_USER_ID: &str = "x-user-id";
const X_USER_ROLE: &str = "x-user-role";
const X_USER_PERMISSIONS: &str = "x-user-permissions";
const X_SERVICE: &str = "x-service";
const X_GATEWAY: &str = "x-gateway";

/// Handler for `/api/:service` and `/api/:service/*rest`
pub async fn proxy_handler(
    State(gateway): State<Arc<Gateway>>,
    Path(params): Path<HashMap<String, String>>,
    request: Request,
) -> Response {
    let ids = request
        .extensions()
        .get::<RequestIds>()
        .cloned()
        .unwrap_or_else(|| RequestIds::from_headers(request.headers()));

    let name = params.get("service").map(String::as_str).unwrap_or_default();
    let service = match gateway.registry().resolve(name) {
        Ok(service) => service,
        Err(e) => return gateway.error_response(&e, &ids, None),
    };
    let Some(chain) = gateway.chain(&service.name) else {
        let e = GatewayError::Internal(format!("no middleware chain for {}", service.name));
        return gateway.error_response(&e, &ids, Some(service.name.as_str()));
    };

    let client_ip = gateway.client_ip(&request);
    let api_key_id = gateway.api_key_id(request.headers());
    let (parts, body) = request.into_parts();
    let mut ctx = RequestContext::new(ids, client_ip, api_key_id, service);

    let (completed, admitted) = chain.run_before(&mut ctx, &parts).await;
    let response = match admitted {
        Ok(()) => match forward(&gateway, &ctx, parts, body).await {
            Ok(response) => response,
            Err(e) => gateway.error_response(&e, &ctx.ids, Some(ctx.service.name.as_str())),
        },
        Err(e) => gateway.error_response(&e, &ctx.ids, Some(ctx.service.name.as_str())),
    };

    chain.run_after(&ctx, completed, response.status()).await;
    response
}

/// Forward an admitted request and record the outcome in the service's breaker
async fn forward(
    gateway: &Gateway,
    ctx: &RequestContext,
    parts: Parts,
    body: Body,
) -> Result<Response> {
    let service = &ctx.service;
    let body = axum::body::to_bytes(body, gateway.config().server.body_limit_bytes)
        .await
        .map_err(|e| GatewayError::BadRequest(format!("Failed to read request body: {}", e)))?;

    let url = service.upstream_url(parts.uri.path(), parts.uri.query());
    let headers = upstream_headers(&parts.headers, ctx);
    let method = parts.method;

    // Non-idempotent verbs are never retried
    let retry = if service.is_retryable(&method) {
        service.retry.clone()
    } else {
        RetryConfig {
            max_retries: 0,
            ..service.retry.clone()
        }
    };
    let executor = RetryExecutor::new(retry);

    debug!(
        service = %service.name,
        method = %method,
        url = %url,
        correlation_id = %ctx.ids.correlation_id,
        "Forwarding request"
    );

    let start = Instant::now();
    let outcome = executor
        .execute_with_predicate(
            || {
                send_request(
                    gateway.client(),
                    method.clone(),
                    &url,
                    headers.clone(),
                    body.clone(),
                    service.timeout(),
                )
            },
            |e: &reqwest::Error| e.is_timeout() || e.is_connect(),
        )
        .await;
    let elapsed = start.elapsed().as_secs_f64();

    let (status, upstream_headers, bytes) = match outcome {
        Ok(parts) => parts,
        Err(e) => {
            metrics::record_upstream(&service.name, method.as_str(), None, elapsed);
            gateway.stats().record_upstream_failure();
            gateway.breakers().record_failure(&service.name).await;

            return Err(if e.is_timeout() {
                GatewayError::UpstreamTimeout {
                    service: service.name.clone(),
                }
            } else {
                GatewayError::Upstream {
                    service: service.name.clone(),
                    message: e.to_string(),
                }
            });
        }
    };

    metrics::record_upstream(&service.name, method.as_str(), Some(status.as_u16()), elapsed);
    if status.is_server_error() {
        warn!(
            service = %service.name,
            status = status.as_u16(),
            correlation_id = %ctx.ids.correlation_id,
            "Upstream returned server error"
        );
        gateway.stats().record_upstream_failure();
        gateway.breakers().record_failure(&service.name).await;
    } else {
        gateway.breakers().record_success(&service.name).await;
    }

    let mut response = Response::builder()
        .status(status)
        .body(Body::from(bytes))
        .map_err(|e| GatewayError::Internal(format!("Failed to build response: {}", e)))?;

    let response_headers = response.headers_mut();
    for (name, value) in upstream_headers.iter() {
        if !is_hop_by_hop_header(name.as_str()) && name != header::CONTENT_LENGTH {
            response_headers.append(name.clone(), value.clone());
        }
    }
    annotate_response(response_headers, &service.name, &gateway.config().server.gateway_name);
    ctx.ids.apply(response_headers);

    Ok(response)
}

/// Send one upstream call and buffer the whole response
async fn send_request(
    client: &reqwest::Client,
    method: Method,
    url: &str,
    headers: HeaderMap,
    body: Bytes,
    timeout: Duration,
) -> std::result::Result<(axum::http::StatusCode, HeaderMap, Bytes), reqwest::Error> {
    let response = client
        .request(method, url)
        .headers(headers)
        .body(body)
        .timeout(timeout)
        .send()
        .await?;

    let status = response.status();
    let headers = response.headers().clone();
    let bytes = response.bytes().await?;
    Ok((status, headers, bytes))
}

/// End-to-end inbound headers plus the gateway's identity headers
fn upstream_headers(inbound: &HeaderMap, ctx: &RequestContext) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(inbound.len() + 6);
    for (name, value) in inbound.iter() {
        let name_str = name.as_str();
        // Identity headers are only ever set by the gateway
        if is_hop_by_hop_header(name_str)
            || name == header::HOST
            || name == header::CONTENT_LENGTH
            || name_str.starts_with("x-user-")
        {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    ctx.ids.apply(&mut headers);
    insert_header(&mut headers, X_GATEWAY_SERVICE, &ctx.service.name);
    if let Some(principal) = &ctx.principal {
        insert_header(&mut headers, X_USER_ID, &principal.id);
        insert_header(&mut headers, X_USER_ROLE, &principal.role);
        insert_header(&mut headers, X_USER_PERMISSIONS, &principal.permissions.join(","));
    }
    headers
}

fn annotate_response(headers: &mut HeaderMap, service: &str, gateway_name: &str) {
    insert_header(headers, X_SERVICE, service);
    insert_header(headers, X_GATEWAY, gateway_name);
}

fn insert_header(headers: &mut HeaderMap, name: &'static str, value: &str) {
    match HeaderValue::from_str(value) {
        Ok(value) => {
            headers.insert(HeaderName::from_static(name), value);
        }
        Err(_) => error!(header = name, "Dropping header with invalid value"),
    }
}

fn is_hop_by_hop_header(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}
