use crate::auth::{Authenticator, Principal};
use crate::circuit_breaker::CircuitBreakerBank;
use crate::error::{GatewayError, Result};
use crate::metrics;
use crate::notify::{SecurityEvent, SecurityNotifier};
use crate::observability::RequestIds;
use crate::rate_limit::{Admission, RateLimitSubject, RateLimiterSet};
use crate::registry::ServiceConfig;
use async_trait::async_trait;
use axum::http::{request::Parts, StatusCode};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Request-scoped state threaded through a service's middleware chain
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub ids: RequestIds,
    pub client_ip: String,
    pub api_key_id: Option<String>,
    pub principal: Option<Principal>,
    pub service: Arc<ServiceConfig>,
    pub started: Instant,
    /// Route rate limit counts awaiting the response status
    pub admissions: Vec<Admission>,
}

impl RequestContext {
    pub fn new(
        ids: RequestIds,
        client_ip: String,
        api_key_id: Option<String>,
        service: Arc<ServiceConfig>,
    ) -> Self {
        Self {
            ids,
            client_ip,
            api_key_id,
            principal: None,
            service,
            started: Instant::now(),
            admissions: Vec::new(),
        }
    }
}

/// One stage of a service's middleware chain
#[async_trait]
pub trait Middleware: Send + Sync {
    fn name(&self) -> &'static str;

    /// Runs before the request is forwarded; an error short-circuits the chain
    async fn before(&self, ctx: &mut RequestContext, parts: &Parts) -> Result<()>;

    /// Runs once the response status is known, for every stage whose `before` ran
    async fn after(&self, _ctx: &RequestContext, _status: StatusCode) {}
}

/// Route rate limit policies
pub struct RouteRateLimit {
    limiters: Arc<RateLimiterSet>,
    authenticator: Arc<dyn Authenticator>,
    policies: Vec<String>,
}

impl RouteRateLimit {
    pub fn new(
        limiters: Arc<RateLimiterSet>,
        authenticator: Arc<dyn Authenticator>,
        policies: Vec<String>,
    ) -> Self {
        Self {
            limiters,
            authenticator,
            policies,
        }
    }
}

#[async_trait]
impl Middleware for RouteRateLimit {
    fn name(&self) -> &'static str {
        "rate_limit"
    }

    async fn before(&self, ctx: &mut RequestContext, parts: &Parts) -> Result<()> {
        // Authentication has not run yet; principal-keyed policies need a best-effort identity
        let identified = match &ctx.principal {
            Some(_) => None,
            None => self.authenticator.identify(&parts.headers).await,
        };

        let subject = RateLimitSubject {
            method: &parts.method,
            path: parts.uri.path(),
            client_ip: &ctx.client_ip,
            principal: ctx.principal.as_ref().or(identified.as_ref()),
            api_key_id: ctx.api_key_id.as_deref(),
            request_id: Some(&ctx.ids.request_id),
        };

        let admissions = self.limiters.admit(&self.policies, &subject).await?;
        ctx.admissions.extend(admissions);
        Ok(())
    }

    async fn after(&self, ctx: &RequestContext, status: StatusCode) {
        self.limiters.release(&ctx.admissions, status).await;
    }
}

/// Resolve the caller; rejects unauthenticated requests
pub struct Authenticate {
    authenticator: Arc<dyn Authenticator>,
    notifier: Arc<dyn SecurityNotifier>,
}

impl Authenticate {
    pub fn new(authenticator: Arc<dyn Authenticator>, notifier: Arc<dyn SecurityNotifier>) -> Self {
        Self {
            authenticator,
            notifier,
        }
    }
}

#[async_trait]
impl Middleware for Authenticate {
    fn name(&self) -> &'static str {
        "authenticate"
    }

    async fn before(&self, ctx: &mut RequestContext, parts: &Parts) -> Result<()> {
        match self.authenticator.authenticate(&parts.headers).await {
            Ok(principal) => {
                debug!(
                    user_id = %principal.id,
                    role = %principal.role,
                    service = %ctx.service.name,
                    "Authentication successful"
                );
                ctx.principal = Some(principal);
                Ok(())
            }
            Err(e) => {
                warn!(
                    target: "security",
                    service = %ctx.service.name,
                    client_ip = %ctx.client_ip,
                    request_id = %ctx.ids.request_id,
                    error = %e,
                    "Authentication failed"
                );
                metrics::record_auth_failure(&ctx.service.name, e.code());
                self.notifier.notify(SecurityEvent::AuthenticationFailed {
                    service: ctx.service.name.clone(),
                    reason: e.to_string(),
                    client_ip: ctx.client_ip.clone(),
                    request_id: Some(ctx.ids.request_id.clone()),
                });
                Err(e)
            }
        }
    }
}

/// Enforce the service's allowed roles and required permissions
pub struct Authorize {
    authenticator: Arc<dyn Authenticator>,
}

impl Authorize {
    pub fn new(authenticator: Arc<dyn Authenticator>) -> Self {
        Self { authenticator }
    }
}

#[async_trait]
impl Middleware for Authorize {
    fn name(&self) -> &'static str {
        "authorize"
    }

    async fn before(&self, ctx: &mut RequestContext, parts: &Parts) -> Result<()> {
        if ctx.principal.is_none() {
            ctx.principal = self.authenticator.identify(&parts.headers).await;
        }
        let principal = ctx.principal.as_ref().ok_or(GatewayError::MissingCredentials)?;

        let service = &ctx.service;
        if self.authenticator.authorize(
            principal,
            &service.allowed_roles,
            &service.allowed_permissions,
        ) {
            return Ok(());
        }

        warn!(
            target: "security",
            user_id = %principal.id,
            role = %principal.role,
            service = %service.name,
            request_id = %ctx.ids.request_id,
            "Authorization denied"
        );
        metrics::record_auth_failure(&service.name, "FORBIDDEN");
        Err(GatewayError::Forbidden(format!(
            "role '{}' may not access {}",
            principal.role, service.name
        )))
    }
}

/// Reject requests while the service's circuit is open
pub struct CircuitGate {
    breakers: Arc<CircuitBreakerBank>,
}

impl CircuitGate {
    pub fn new(breakers: Arc<CircuitBreakerBank>) -> Self {
        Self { breakers }
    }
}

#[async_trait]
impl Middleware for CircuitGate {
    fn name(&self) -> &'static str {
        "circuit_breaker"
    }

    async fn before(&self, ctx: &mut RequestContext, _parts: &Parts) -> Result<()> {
        let service = &ctx.service.name;
        if self.breakers.allow(service).await {
            return Ok(());
        }

        warn!(
            service = %service,
            correlation_id = %ctx.ids.correlation_id,
            "Circuit breaker open, rejecting request"
        );
        Err(GatewayError::CircuitOpen(service.clone()))
    }
}

/// Ordered middleware stages for one service, built once at startup
#[derive(Clone)]
pub struct Chain {
    stages: Vec<Arc<dyn Middleware>>,
}

impl std::fmt::Debug for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.stage_names()).finish()
    }
}

impl Chain {
    pub fn new(stages: Vec<Arc<dyn Middleware>>) -> Self {
        Self { stages }
    }

    /// Rate limit, then authenticate and authorize as configured, then the circuit gate
    pub fn for_service(
        service: &ServiceConfig,
        limiters: &Arc<RateLimiterSet>,
        authenticator: &Arc<dyn Authenticator>,
        breakers: &Arc<CircuitBreakerBank>,
        notifier: &Arc<dyn SecurityNotifier>,
    ) -> Self {
        let mut stages: Vec<Arc<dyn Middleware>> = Vec::new();

        if !service.rate_limits.is_empty() {
            stages.push(Arc::new(RouteRateLimit::new(
                limiters.clone(),
                authenticator.clone(),
                service.rate_limits.clone(),
            )));
        }
        if service.requires_auth {
            stages.push(Arc::new(Authenticate::new(
                authenticator.clone(),
                notifier.clone(),
            )));
        }
        if service.requires_authorization() {
            stages.push(Arc::new(Authorize::new(authenticator.clone())));
        }
        stages.push(Arc::new(CircuitGate::new(breakers.clone())));

        Self { stages }
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|stage| stage.name()).collect()
    }

    /// Run every `before` hook in order.
    ///
    /// Returns how many stages completed, which bounds the `after` hooks, and
    /// the first error if a stage short-circuited.
    pub async fn run_before(
        &self,
        ctx: &mut RequestContext,
        parts: &Parts,
    ) -> (usize, Result<()>) {
        for (index, stage) in self.stages.iter().enumerate() {
            if let Err(e) = stage.before(ctx, parts).await {
                debug!(stage = stage.name(), error = %e, "Middleware short-circuited");
                return (index, Err(e));
            }
        }
        (self.stages.len(), Ok(()))
    }

    /// Run the `after` hooks of the first `completed` stages
    pub async fn run_after(&self, ctx: &RequestContext, completed: usize, status: StatusCode) {
        for stage in self.stages.iter().take(completed) {
            stage.after(ctx, status).await;
        }
    }
}
