use axum::{
    body::Body,
    extract::ConnectInfo,
    http::{Request, StatusCode},
    response::Response,
    Router,
};
use edge_gateway::{
    auth::jwt::Claims, build_app, config::GatewayConfig, Gateway, GatewayBuilder,
};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use tower::ServiceExt;
use wiremock::{
    matchers::{header, method, path},
    Mock, MockServer, ResponseTemplate,
};

const SECRET: &str = "integration-test-secret";

fn test_config(backend: &str) -> GatewayConfig {
    let yaml = format!(
        r#"
server:
  gateway_name: test-gateway
defaults:
  timeout_ms: 20000
circuit_breaker:
  failure_threshold: 5
  success_threshold: 3
  cooldown_ms: 60000
health_check:
  timeout_ms: 500
rate_limiting:
  global_policies: [global]
auth:
  jwt:
    secret: "{secret}"
services:
  - name: auth
    target: "{backend}"
    requires_auth: false
    rate_limits: [auth]
  - name: loans
    target: "{backend}"
    requires_auth: false
  - name: users
    target: "{backend}"
  - name: payments
    target: "{backend}"
    allowed_roles: [borrower]
  - name: ai
    target: "{backend}"
    requires_auth: false
    timeout_ms: 200
    retries: 2
"#,
        secret = SECRET,
        backend = backend,
    );
    GatewayConfig::from_yaml(&yaml).unwrap()
}

async fn setup(backend: &MockServer) -> (Arc<Gateway>, Router) {
    setup_with(test_config(&backend.uri())).await
}

async fn setup_with(config: GatewayConfig) -> (Arc<Gateway>, Router) {
    let gateway = Arc::new(GatewayBuilder::new(config).build().await.unwrap());
    let app = build_app(gateway.clone()).unwrap();
    (gateway, app)
}

/// Address of a local port with nothing listening on it
fn closed_port_url() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    format!("http://127.0.0.1:{}", port)
}

fn token(sub: &str, role: &str) -> String {
    let claims = Claims {
        sub: sub.to_string(),
        role: role.to_string(),
        permissions: vec!["loans:read".to_string()],
        verified: true,
        flagged: false,
        iss: None,
        exp: (chrono::Utc::now().timestamp() + 3600) as usize,
        iat: None,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .unwrap()
}

fn request(method: &str, uri: &str) -> axum::http::request::Builder {
    Request::builder()
        .method(method)
        .uri(uri)
        .extension(ConnectInfo(SocketAddr::from(([10, 0, 0, 1], 40000))))
}

fn empty(method: &str, uri: &str) -> Request<Body> {
    request(method, uri).body(Body::empty()).unwrap()
}

fn json_request(method: &str, uri: &str) -> Request<Body> {
    request(method, uri)
        .header("content-type", "application/json")
        .body(Body::from("{}"))
        .unwrap()
}

async fn send(app: &Router, request: Request<Body>) -> Response {
    app.clone().oneshot(request).await.unwrap()
}

async fn json_body(response: Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn calls_to(server: &MockServer, verb: &str, route: &str) -> usize {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|r| r.method.as_str() == verb && r.url.path() == route)
        .count()
}

#[tokio::test]
async fn test_breaker_opens_after_threshold_failures() {
    let backend = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/applications"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&backend)
        .await;
    let (gateway, app) = setup(&backend).await;

    for _ in 0..5 {
        let response = send(&app, empty("GET", "/api/loans/applications")).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    for _ in 0..2 {
        let response = send(&app, empty("GET", "/api/loans/applications")).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = json_body(response).await;
        assert_eq!(body["code"], "CIRCUIT_BREAKER_OPEN");
        assert!(body["requestId"].is_string());
    }

    assert_eq!(calls_to(&backend, "GET", "/applications").await, 5);
    assert_eq!(gateway.stats().snapshot().circuit_rejected, 2);
    assert_eq!(gateway.stats().snapshot().upstream_failures, 5);
}

#[tokio::test]
async fn test_unreachable_service_opens_breaker() {
    let (gateway, app) = setup_with(test_config(&closed_port_url())).await;

    for attempt in 1..=5 {
        let response = send(&app, empty("GET", "/api/loans/applications")).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json_body(response).await["code"], "SERVICE_UNAVAILABLE");

        let snapshot = gateway.breakers().snapshot("loans").await.unwrap();
        assert_eq!(snapshot.failure_count, attempt);
    }

    let response = send(&app, empty("GET", "/api/loans/applications")).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json_body(response).await["code"], "CIRCUIT_BREAKER_OPEN");

    let response = send(&app, empty("GET", "/health/detailed")).await;
    let body = json_body(response).await;
    let breaker = &body["services"]["loans"]["circuitBreaker"];
    assert_eq!(breaker["state"], "OPEN");
    assert_eq!(breaker["failureCount"], 5);
    assert!(breaker["lastFailure"].is_string());
    assert_eq!(body["services"]["users"]["circuitBreaker"]["state"], "CLOSED");

    let stats = gateway.stats().snapshot();
    assert_eq!(stats.upstream_failures, 5);
    assert_eq!(stats.circuit_rejected, 1);
}

#[tokio::test]
async fn test_trailing_slash_reaches_service() {
    let backend = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200))
        .expect(2)
        .mount(&backend)
        .await;
    let (_, app) = setup(&backend).await;

    let response = send(&app, empty("GET", "/api/loans")).await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = send(&app, empty("GET", "/api/loans/")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-service"], "loans");
}

#[tokio::test]
async fn test_auth_policy_limits_failed_logins() {
    let backend = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/login"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&backend)
        .await;
    let (_, app) = setup(&backend).await;

    for _ in 0..5 {
        let response = send(&app, json_request("POST", "/api/auth/login")).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    let response = send(&app, json_request("POST", "/api/auth/login")).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(response.headers().contains_key("retry-after"));
    let body = json_body(response).await;
    assert_eq!(body["code"], "RATE_LIMIT_EXCEEDED");
    assert_eq!(body["retryAfter"], "15 minutes");

    assert_eq!(calls_to(&backend, "POST", "/login").await, 5);
}

#[tokio::test]
async fn test_successful_logins_are_not_counted() {
    let backend = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/login"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"token": "t"})))
        .mount(&backend)
        .await;
    let (_, app) = setup(&backend).await;

    for _ in 0..8 {
        let response = send(&app, empty("POST", "/api/auth/login")).await;
        assert_eq!(response.status(), StatusCode::OK);
    }
}

#[tokio::test]
async fn test_health_reports_healthy_and_degraded() {
    let backend = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&backend)
        .await;
    let (gateway, app) = setup(&backend).await;

    gateway.health_checker().run_cycle().await;
    let response = send(&app, empty("GET", "/health")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["services"]["loans"], "healthy");

    backend.reset().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&backend)
        .await;

    gateway.health_checker().run_cycle().await;
    let response = send(&app, empty("GET", "/health")).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = json_body(response).await;
    assert_eq!(body["status"], "degraded");
    assert_eq!(body["services"]["auth"], "unhealthy");
}

#[tokio::test]
async fn test_health_before_first_cycle_is_healthy() {
    let backend = MockServer::start().await;
    let (_, app) = setup(&backend).await;

    let response = send(&app, empty("GET", "/health")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["services"]["users"], "unknown");
}

#[tokio::test]
async fn test_identity_and_correlation_headers() {
    let backend = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/profile"))
        .and(header("x-user-id", "u42"))
        .and(header("x-user-role", "borrower"))
        .and(header("x-gateway-service", "users"))
        .and(header("x-request-id", "req-abc"))
        .and(header("x-correlation-id", "corr-xyz"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": "u42"})))
        .expect(1)
        .mount(&backend)
        .await;
    let (_, app) = setup(&backend).await;

    let response = send(
        &app,
        request("GET", "/api/users/profile")
            .header("authorization", format!("Bearer {}", token("u42", "borrower")))
            .header("x-request-id", "req-abc")
            .header("x-correlation-id", "corr-xyz")
            .header("x-user-id", "spoofed")
            .body(Body::empty())
            .unwrap(),
    )
    .await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-service"], "users");
    assert_eq!(response.headers()["x-gateway"], "test-gateway");
    assert_eq!(response.headers()["x-request-id"], "req-abc");
    assert_eq!(response.headers()["x-correlation-id"], "corr-xyz");
}

#[tokio::test]
async fn test_missing_and_invalid_credentials() {
    let backend = MockServer::start().await;
    let (gateway, app) = setup(&backend).await;

    let response = send(&app, empty("GET", "/api/users/profile")).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(json_body(response).await["code"], "UNAUTHORIZED");

    let response = send(
        &app,
        request("GET", "/api/users/profile")
            .header("authorization", "Bearer not-a-jwt")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(json_body(response).await["code"], "INVALID_TOKEN");

    assert_eq!(gateway.stats().snapshot().auth_failures, 2);
    assert_eq!(calls_to(&backend, "GET", "/profile").await, 0);
}

#[tokio::test]
async fn test_role_restricted_service() {
    let backend = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/history"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&backend)
        .await;
    let (_, app) = setup(&backend).await;

    let response = send(
        &app,
        request("GET", "/api/payments/history")
            .header("authorization", format!("Bearer {}", token("u1", "lender")))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(json_body(response).await["code"], "FORBIDDEN");

    let response = send(
        &app,
        request("GET", "/api/payments/history")
            .header("authorization", format!("Bearer {}", token("u2", "borrower")))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_unknown_routes() {
    let backend = MockServer::start().await;
    let (gateway, app) = setup(&backend).await;

    let response = send(&app, empty("GET", "/api/nonexistent/thing")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(json_body(response).await["code"], "ROUTE_NOT_FOUND");

    let response = send(&app, empty("GET", "/not/under/api")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(response.headers().contains_key("x-request-id"));
    assert_eq!(json_body(response).await["code"], "ROUTE_NOT_FOUND");

    // Unknown routes never touch a breaker
    assert!(gateway
        .breakers()
        .snapshots()
        .await
        .iter()
        .all(|s| s.failure_count == 0));
}

#[tokio::test]
async fn test_services_endpoint_requires_admin() {
    let backend = MockServer::start().await;
    let (_, app) = setup(&backend).await;

    let response = send(&app, empty("GET", "/services")).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = send(
        &app,
        request("GET", "/services")
            .header("authorization", format!("Bearer {}", token("u1", "borrower")))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = send(
        &app,
        request("GET", "/services")
            .header("authorization", format!("Bearer {}", token("root", "admin")))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["count"], 5);
    assert_eq!(body["services"][0]["name"], "ai");
    assert_eq!(body["services"][0]["timeoutMs"], 200);
}

#[tokio::test]
async fn test_idempotent_requests_are_retried_on_timeout() {
    let backend = MockServer::start().await;
    Mock::given(path("/score"))
        .respond_with(ResponseTemplate::new(200).set_delay(std::time::Duration::from_secs(2)))
        .mount(&backend)
        .await;
    let (_, app) = setup(&backend).await;

    let response = send(&app, empty("GET", "/api/ai/score")).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json_body(response).await["code"], "UPSTREAM_TIMEOUT");
    assert_eq!(calls_to(&backend, "GET", "/score").await, 3);

    let response = send(&app, json_request("POST", "/api/ai/score")).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(calls_to(&backend, "POST", "/score").await, 1);
}

#[tokio::test]
async fn test_metrics_summary() {
    let backend = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/applications"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&backend)
        .await;
    let (_, app) = setup(&backend).await;

    send(&app, empty("GET", "/api/loans/applications")).await;

    let response = send(&app, empty("GET", "/metrics")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["requests"]["totalRequests"], 2);
    assert_eq!(body["circuitBreakers"]["loans"]["state"], "CLOSED");
    assert_eq!(body["rateLimitBackend"], "memory");

    let response = send(&app, empty("GET", "/metrics/prometheus")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
