use super::policy::RateLimitSubject;
use crate::gateway::Gateway;
use crate::observability::RequestIds;
use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;

/// Apply the global rate limit policies to every request.
///
/// Runs inside the correlation middleware so rejections carry the request id.
pub async fn global_rate_limit(
    State(gateway): State<Arc<Gateway>>,
    request: Request,
    next: Next,
) -> Response {
    let ids = request.extensions().get::<RequestIds>().cloned();
    let client_ip = gateway.client_ip(&request);
    let principal = gateway.optional_principal(request.headers()).await;
    let api_key_id = gateway.api_key_id(request.headers());

    let subject = RateLimitSubject {
        method: request.method(),
        path: request.uri().path(),
        client_ip: &client_ip,
        principal: principal.as_ref(),
        api_key_id: api_key_id.as_deref(),
        request_id: ids.as_ref().map(|ids| ids.request_id.as_str()),
    };

    let policies = &gateway.config().rate_limiting.global_policies;
    let admissions = match gateway.limiters().admit(policies, &subject).await {
        Ok(admissions) => admissions,
        Err(e) => {
            gateway.stats().record_rejection(&e);
            return e.to_response(ids.as_ref().map(|ids| ids.request_id.as_str()));
        }
    };

    let response = next.run(request).await;
    gateway
        .limiters()
        .release(&admissions, response.status())
        .await;
    response
}
