use super::types::{KeyStrategy, RateLimitPolicyConfig};
use crate::auth::Principal;
use axum::http::Method;

/// What a policy sees of a request
#[derive(Debug, Clone, Copy)]
pub struct RateLimitSubject<'a> {
    pub method: &'a Method,
    pub path: &'a str,
    pub client_ip: &'a str,
    pub principal: Option<&'a Principal>,
    pub api_key_id: Option<&'a str>,
    pub request_id: Option<&'a str>,
}

/// A named, resolved rate limit policy
#[derive(Debug, Clone)]
pub struct RateLimitPolicy {
    name: String,
    config: RateLimitPolicyConfig,
}

impl RateLimitPolicy {
    pub fn new(name: impl Into<String>, config: RateLimitPolicyConfig) -> Self {
        Self {
            name: name.into(),
            config,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &RateLimitPolicyConfig {
        &self.config
    }

    /// Whether this policy counts the request at all
    pub fn applies_to(&self, subject: &RateLimitSubject<'_>) -> bool {
        let config = &self.config;

        if config
            .skip_paths
            .iter()
            .any(|prefix| subject.path.starts_with(prefix.as_str()))
        {
            return false;
        }

        if !config.paths.is_empty()
            && !config
                .paths
                .iter()
                .any(|prefix| subject.path.starts_with(prefix.as_str()))
        {
            return false;
        }

        if !config.methods.is_empty()
            && !config
                .methods
                .iter()
                .any(|m| m.eq_ignore_ascii_case(subject.method.as_str()))
        {
            return false;
        }

        !(config.authenticated_only && subject.principal.is_none())
    }

    /// Counter identity, or None when the key strategy has nothing to key on
    pub fn identity(&self, subject: &RateLimitSubject<'_>) -> Option<String> {
        let user = subject.principal.map(|p| format!("user:{}", p.id));
        let ip = || format!("ip:{}", subject.client_ip);

        match self.config.key {
            KeyStrategy::Ip => Some(ip()),
            KeyStrategy::Principal => user,
            KeyStrategy::PrincipalOrIp => Some(user.unwrap_or_else(ip)),
            KeyStrategy::ApiKey => subject.api_key_id.map(|id| format!("apikey:{}", id)),
        }
    }

    /// Ceiling for this caller after adaptive scaling; never below 1
    pub fn effective_max(&self, principal: Option<&Principal>) -> u32 {
        let base = self.config.max;
        let (Some(adaptive), Some(principal)) = (&self.config.adaptive, principal) else {
            return base;
        };

        let role = adaptive
            .role_multipliers
            .get(&principal.role)
            .copied()
            .unwrap_or(1.0);
        let verified = if principal.verified {
            adaptive.verified_multiplier
        } else {
            1.0
        };

        let multiplier = if principal.flagged {
            adaptive.flagged_multiplier
        } else {
            role.max(verified)
        };

        ((base as f64 * multiplier).floor() as u32).max(1)
    }
}
