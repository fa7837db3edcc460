use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// How a policy derives the identity it counts against
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum KeyStrategy {
    /// Client IP address
    Ip,
    /// Authenticated principal; requests without one are skipped
    Principal,
    /// Authenticated principal, falling back to the client IP
    PrincipalOrIp,
    /// API key identifier; requests without a key are skipped
    ApiKey,
}

/// Ceiling scaling for trusted or suspicious principals
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AdaptiveConfig {
    /// Multiplier for verified principals
    #[serde(default = "default_verified_multiplier")]
    pub verified_multiplier: f64,
    /// Multiplier for flagged principals (applied last, wins over everything)
    #[serde(default = "default_flagged_multiplier")]
    pub flagged_multiplier: f64,
    /// Multipliers by role; the largest of role and verified applies
    #[serde(default)]
    pub role_multipliers: HashMap<String, f64>,
}

fn default_verified_multiplier() -> f64 {
    3.0
}

fn default_flagged_multiplier() -> f64 {
    0.25
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            verified_multiplier: default_verified_multiplier(),
            flagged_multiplier: default_flagged_multiplier(),
            role_multipliers: HashMap::new(),
        }
    }
}

/// Rate limit policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitPolicyConfig {
    /// Length of the counting window in seconds
    pub window_secs: u64,
    /// Maximum requests allowed within a window
    pub max: u32,
    /// Identity the counter is keyed by
    #[serde(default = "default_key")]
    pub key: KeyStrategy,
    /// Decrement after responses with status < 400
    #[serde(default)]
    pub skip_successful_requests: bool,
    /// Only count authenticated requests
    #[serde(default)]
    pub authenticated_only: bool,
    /// Only apply to paths starting with one of these prefixes (empty: all)
    #[serde(default)]
    pub paths: Vec<String>,
    /// Never apply to paths starting with one of these prefixes
    #[serde(default)]
    pub skip_paths: Vec<String>,
    /// Only apply to these methods (empty: all)
    #[serde(default)]
    pub methods: Vec<String>,
    /// Scale the ceiling by principal trust
    #[serde(default)]
    pub adaptive: Option<AdaptiveConfig>,
}

fn default_key() -> KeyStrategy {
    KeyStrategy::Ip
}

impl RateLimitPolicyConfig {
    /// Minimal policy: `max` requests per `window_secs` keyed by `key`
    pub fn new(window_secs: u64, max: u32, key: KeyStrategy) -> Self {
        Self {
            window_secs,
            max,
            key,
            skip_successful_requests: false,
            authenticated_only: false,
            paths: vec![],
            skip_paths: vec![],
            methods: vec![],
            adaptive: None,
        }
    }
}

/// Top-level rate limiting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitingConfig {
    /// Enable rate limiting
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Policies applied to every request before routing
    #[serde(default = "default_global_policies")]
    pub global_policies: Vec<String>,
    /// Policy definitions; entries replace the built-in policy of the same name
    #[serde(default)]
    pub policies: BTreeMap<String, RateLimitPolicyConfig>,
}

fn default_true() -> bool {
    true
}

fn default_global_policies() -> Vec<String> {
    vec!["burst".to_string(), "global".to_string()]
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            global_policies: default_global_policies(),
            policies: BTreeMap::new(),
        }
    }
}

impl RateLimitingConfig {
    /// Built-in policies overlaid with configured ones
    pub fn resolved_policies(&self) -> BTreeMap<String, RateLimitPolicyConfig> {
        let mut policies = builtin_policies();
        for (name, policy) in &self.policies {
            policies.insert(name.clone(), policy.clone());
        }
        policies
    }
}

const MINUTE: u64 = 60;
const HOUR: u64 = 60 * MINUTE;

/// The platform's standard policy family
pub fn builtin_policies() -> BTreeMap<String, RateLimitPolicyConfig> {
    let health_paths = vec!["/health".to_string(), "/metrics".to_string()];

    let mut policies = BTreeMap::new();

    policies.insert(
        "global".to_string(),
        RateLimitPolicyConfig {
            skip_paths: health_paths.clone(),
            ..RateLimitPolicyConfig::new(15 * MINUTE, 1000, KeyStrategy::PrincipalOrIp)
        },
    );
    policies.insert(
        "auth".to_string(),
        RateLimitPolicyConfig {
            skip_successful_requests: true,
            paths: vec![
                "/api/auth/login".to_string(),
                "/api/auth/register".to_string(),
            ],
            ..RateLimitPolicyConfig::new(15 * MINUTE, 5, KeyStrategy::Ip)
        },
    );
    policies.insert(
        "password_reset".to_string(),
        RateLimitPolicyConfig {
            paths: vec![
                "/api/auth/forgot-password".to_string(),
                "/api/auth/reset-password".to_string(),
            ],
            ..RateLimitPolicyConfig::new(HOUR, 3, KeyStrategy::Ip)
        },
    );
    policies.insert(
        "loan_application".to_string(),
        RateLimitPolicyConfig {
            authenticated_only: true,
            methods: vec!["POST".to_string()],
            ..RateLimitPolicyConfig::new(24 * HOUR, 10, KeyStrategy::Principal)
        },
    );
    policies.insert(
        "upload".to_string(),
        RateLimitPolicyConfig {
            authenticated_only: true,
            paths: vec!["/api/users/documents".to_string()],
            methods: vec!["POST".to_string(), "PUT".to_string()],
            ..RateLimitPolicyConfig::new(HOUR, 20, KeyStrategy::Principal)
        },
    );
    policies.insert(
        "api_key".to_string(),
        RateLimitPolicyConfig::new(HOUR, 5000, KeyStrategy::ApiKey),
    );
    policies.insert(
        "burst".to_string(),
        RateLimitPolicyConfig {
            skip_paths: health_paths,
            ..RateLimitPolicyConfig::new(1, 20, KeyStrategy::Ip)
        },
    );
    policies.insert(
        "role_adaptive".to_string(),
        RateLimitPolicyConfig {
            adaptive: Some(AdaptiveConfig {
                role_multipliers: HashMap::from([("admin".to_string(), 10.0)]),
                ..AdaptiveConfig::default()
            }),
            ..RateLimitPolicyConfig::new(15 * MINUTE, 300, KeyStrategy::Principal)
        },
    );

    policies
}

/// Render a window as a retry hint, e.g. "15 minutes" or "1 hour"
pub fn humanize_window(window_secs: u64) -> String {
    fn plural(n: u64, unit: &str) -> String {
        if n == 1 {
            format!("1 {}", unit)
        } else {
            format!("{} {}s", n, unit)
        }
    }

    if window_secs >= HOUR && window_secs % HOUR == 0 {
        plural(window_secs / HOUR, "hour")
    } else if window_secs >= MINUTE && window_secs % MINUTE == 0 {
        plural(window_secs / MINUTE, "minute")
    } else {
        plural(window_secs, "second")
    }
}
