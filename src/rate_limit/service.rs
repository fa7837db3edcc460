use super::policy::{RateLimitPolicy, RateLimitSubject};
use super::types::{humanize_window, RateLimitingConfig};
use crate::counter_store::CounterStore;
use crate::error::{GatewayError, Result};
use crate::metrics;
use crate::notify::{SecurityEvent, SecurityNotifier};
use axum::http::StatusCode;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A counted request, kept until the response status is known
#[derive(Debug, Clone)]
pub struct Admission {
    policy: Arc<RateLimitPolicy>,
    key: String,
    /// Requests left in the window after this one
    pub remaining: u32,
    /// Ceiling applied to this request
    pub limit: u32,
}

impl Admission {
    pub fn policy(&self) -> &str {
        self.policy.name()
    }
}

/// Outcome of checking a single policy
#[derive(Debug)]
enum Decision {
    /// Policy does not apply, or its key strategy found nothing to key on
    Skipped,
    Admitted(Admission),
    Rejected { limit: u32, reset_after_secs: u64 },
}

/// Every named rate limit policy, sharing one counter store
pub struct RateLimiterSet {
    policies: BTreeMap<String, Arc<RateLimitPolicy>>,
    store: Arc<dyn CounterStore>,
    key_prefix: String,
    enabled: bool,
    notifier: Arc<dyn SecurityNotifier>,
}

impl std::fmt::Debug for RateLimiterSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiterSet")
            .field("policies", &self.policies.keys().collect::<Vec<_>>())
            .field("backend", &self.store.backend_name())
            .field("enabled", &self.enabled)
            .finish()
    }
}

impl RateLimiterSet {
    /// Build the built-in policies overlaid with configured ones
    pub fn new(
        config: &RateLimitingConfig,
        store: Arc<dyn CounterStore>,
        key_prefix: impl Into<String>,
        notifier: Arc<dyn SecurityNotifier>,
    ) -> Self {
        let policies: BTreeMap<_, _> = config
            .resolved_policies()
            .into_iter()
            .map(|(name, policy)| {
                let resolved = Arc::new(RateLimitPolicy::new(name.clone(), policy));
                (name, resolved)
            })
            .collect();

        info!(
            policies = policies.len(),
            backend = store.backend_name(),
            enabled = config.enabled,
            "Initialized rate limiters"
        );

        Self {
            policies,
            store,
            key_prefix: key_prefix.into(),
            enabled: config.enabled,
            notifier,
        }
    }

    pub fn policy(&self, name: &str) -> Option<&Arc<RateLimitPolicy>> {
        self.policies.get(name)
    }

    pub fn backend_name(&self) -> &'static str {
        self.store.backend_name()
    }

    /// Counter key for a policy and identity
    pub fn counter_key(&self, policy: &str, identity: &str) -> String {
        format!("{}ratelimit:{}:{}", self.key_prefix, policy, identity)
    }

    /// Count the request against each named policy, in order.
    ///
    /// Returns the admissions to hand back to [`RateLimiterSet::release`] once
    /// the response status is known. Counter store failures admit the request.
    pub async fn admit(
        &self,
        policy_names: &[String],
        subject: &RateLimitSubject<'_>,
    ) -> Result<Vec<Admission>> {
        let mut admissions = Vec::new();
        if !self.enabled {
            return Ok(admissions);
        }

        for name in policy_names {
            let Some(policy) = self.policies.get(name) else {
                warn!(policy = %name, "Unknown rate limit policy, skipping");
                continue;
            };

            match self.check(policy, subject).await {
                Ok(Decision::Skipped) => {}
                Ok(Decision::Admitted(admission)) => {
                    debug!(
                        policy = %name,
                        remaining = admission.remaining,
                        "Rate limit check passed"
                    );
                    admissions.push(admission);
                }
                Ok(Decision::Rejected {
                    limit,
                    reset_after_secs,
                }) => {
                    return Err(self.reject(policy, subject, limit, reset_after_secs));
                }
                Err(e) => {
                    warn!(
                        policy = %name,
                        error = %e,
                        "Counter store unavailable, admitting request"
                    );
                }
            }
        }

        Ok(admissions)
    }

    /// Undo counts for skip-successful policies when the response succeeded
    pub async fn release(&self, admissions: &[Admission], status: StatusCode) {
        if status.as_u16() >= 400 {
            return;
        }

        for admission in admissions {
            if !admission.policy.config().skip_successful_requests {
                continue;
            }
            if let Err(e) = self.store.decrement(&admission.key).await {
                warn!(
                    policy = admission.policy.name(),
                    error = %e,
                    "Failed to release rate limit count"
                );
            }
        }
    }

    async fn check(
        &self,
        policy: &Arc<RateLimitPolicy>,
        subject: &RateLimitSubject<'_>,
    ) -> Result<Decision> {
        if !policy.applies_to(subject) {
            return Ok(Decision::Skipped);
        }
        let Some(identity) = policy.identity(subject) else {
            return Ok(Decision::Skipped);
        };

        let key = self.counter_key(policy.name(), &identity);
        let window_secs = policy.config().window_secs;

        let count = self.store.increment_in_window(&key, window_secs).await?;

        let limit = policy.effective_max(subject.principal);
        if count > i64::from(limit) {
            self.store.decrement(&key).await?;
            let reset_after_secs = self.store.ttl(&key).await?.unwrap_or(window_secs);
            return Ok(Decision::Rejected {
                limit,
                reset_after_secs,
            });
        }

        Ok(Decision::Admitted(Admission {
            policy: Arc::clone(policy),
            key,
            remaining: limit.saturating_sub(count as u32),
            limit,
        }))
    }

    fn reject(
        &self,
        policy: &RateLimitPolicy,
        subject: &RateLimitSubject<'_>,
        limit: u32,
        reset_after_secs: u64,
    ) -> GatewayError {
        let identity = policy
            .identity(subject)
            .unwrap_or_else(|| "unknown".to_string());

        warn!(
            target: "security",
            policy = policy.name(),
            identity = %identity,
            path = subject.path,
            request_id = subject.request_id,
            "Rate limit exceeded"
        );
        metrics::record_rate_limit_exceeded(policy.name());
        self.notifier.notify(SecurityEvent::RateLimitExceeded {
            policy: policy.name().to_string(),
            identity,
            path: subject.path.to_string(),
            request_id: subject.request_id.map(str::to_string),
        });

        GatewayError::RateLimitExceeded {
            policy: policy.name().to_string(),
            limit,
            reset_after_secs,
            retry_hint: humanize_window(policy.config().window_secs),
        }
    }
}
