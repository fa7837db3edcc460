//! Rate limiting
//!
//! Fixed-window counters over a shared [`CounterStore`](crate::counter_store::CounterStore).
//! Policies are named; a set of built-in policies covers the platform's
//! standard limits and any of them can be replaced by name from configuration.
//!
//! - Global policies run for every request as an axum middleware layer
//! - Route policies run inside a service's middleware chain
//! - Counter store failures admit the request and log a warning
//!
//! Rejections render as `429` with `Retry-After` and `X-RateLimit-*` headers.

pub mod middleware;
pub mod policy;
pub mod service;
pub mod types;

pub use middleware::global_rate_limit;
pub use policy::{RateLimitPolicy, RateLimitSubject};
pub use service::{Admission, RateLimiterSet};
pub use types::{
    builtin_policies, humanize_window, AdaptiveConfig, KeyStrategy, RateLimitPolicyConfig,
    RateLimitingConfig,
};
