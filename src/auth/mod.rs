pub mod jwt;

pub use jwt::JwtAuthenticator;

use crate::config::AuthConfig;
use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use axum::http::HeaderMap;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// Authenticated caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Principal {
    /// User identifier
    pub id: String,
    /// Primary role
    pub role: String,
    /// Granted permissions
    pub permissions: Vec<String>,
    /// Identity verified (KYC passed); raises adaptive rate limits
    pub verified: bool,
    /// Flagged for review; lowers adaptive rate limits
    pub flagged: bool,
}

impl Principal {
    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.iter().any(|p| p == permission)
    }
}

/// Authentication capability used by the gateway
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Resolve the caller from request headers
    async fn authenticate(&self, headers: &HeaderMap) -> Result<Principal>;

    /// Best-effort identification for rate limiting; never fails the request
    async fn identify(&self, headers: &HeaderMap) -> Option<Principal> {
        if !headers.contains_key(axum::http::header::AUTHORIZATION) {
            return None;
        }
        self.authenticate(headers).await.ok()
    }

    /// Check a principal against allowed roles and required permissions.
    ///
    /// Empty lists impose no constraint. When roles are listed the principal's
    /// role must be one of them; every listed permission must be held.
    fn authorize(&self, principal: &Principal, roles: &[String], permissions: &[String]) -> bool {
        let role_ok = roles.is_empty() || roles.iter().any(|r| *r == principal.role);
        let permissions_ok = permissions.iter().all(|p| principal.has_permission(p));
        role_ok && permissions_ok
    }
}

/// Authenticator used when no credentials source is configured
#[derive(Debug, Default, Clone, Copy)]
pub struct DenyAllAuthenticator;

#[async_trait]
impl Authenticator for DenyAllAuthenticator {
    async fn authenticate(&self, _headers: &HeaderMap) -> Result<Principal> {
        Err(GatewayError::Unauthorized(
            "no authentication method configured".to_string(),
        ))
    }
}

/// Build the authenticator described by configuration
pub fn from_config(config: Option<&AuthConfig>) -> Result<Arc<dyn Authenticator>> {
    match config.and_then(|c| c.jwt.as_ref()) {
        Some(jwt_config) => Ok(Arc::new(JwtAuthenticator::new(jwt_config)?)),
        None => Ok(Arc::new(DenyAllAuthenticator)),
    }
}

/// Stable, non-reversible identifier for an API key
pub fn api_key_id(api_key: &str) -> String {
    let digest = Sha256::digest(api_key.as_bytes());
    digest.iter().take(8).map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn principal(role: &str, permissions: &[&str]) -> Principal {
        Principal {
            id: "u1".to_string(),
            role: role.to_string(),
            permissions: permissions.iter().map(|p| p.to_string()).collect(),
            verified: false,
            flagged: false,
        }
    }

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[tokio::test]
    async fn test_deny_all_authenticator() {
        let result = DenyAllAuthenticator.authenticate(&HeaderMap::new()).await;
        assert!(matches!(result, Err(GatewayError::Unauthorized(_))));
    }

    #[test]
    fn test_authorize_without_constraints() {
        let p = principal("borrower", &[]);
        assert!(DenyAllAuthenticator.authorize(&p, &[], &[]));
    }

    #[test]
    fn test_authorize_roles() {
        let p = principal("borrower", &[]);
        assert!(DenyAllAuthenticator.authorize(&p, &strings(&["borrower", "lender"]), &[]));
        assert!(!DenyAllAuthenticator.authorize(&p, &strings(&["admin"]), &[]));
    }

    #[test]
    fn test_authorize_requires_every_permission() {
        let p = principal("lender", &["loans:read"]);
        assert!(DenyAllAuthenticator.authorize(&p, &[], &strings(&["loans:read"])));
        assert!(!DenyAllAuthenticator.authorize(
            &p,
            &[],
            &strings(&["loans:read", "loans:write"])
        ));
    }

    #[test]
    fn test_api_key_id_is_stable_and_short() {
        let a = api_key_id("sk_live_123");
        assert_eq!(a, api_key_id("sk_live_123"));
        assert_ne!(a, api_key_id("sk_live_124"));
        assert_eq!(a.len(), 16);
        assert!(!a.contains("sk_live"));
    }

    #[test]
    fn test_from_config_without_jwt_denies() {
        assert!(from_config(None).is_ok());
    }
}
