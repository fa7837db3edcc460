//! Edge gateway
//!
//! Routes `/api/{service}` requests to registered backend services behind
//! per-service circuit breakers, layered rate limits, authentication and
//! active health checks.

pub mod auth;
pub mod circuit_breaker;
pub mod config;
pub mod cors;
pub mod counter_store;
pub mod error;
pub mod gateway;
pub mod healthcheck;
pub mod metrics;
pub mod notify;
pub mod observability;
pub mod proxy;
pub mod rate_limit;
pub mod registry;
pub mod server;

pub use config::GatewayConfig;
pub use error::{GatewayError, Result};
pub use gateway::{Gateway, GatewayBuilder};
pub use observability::init_tracing;
pub use server::{build_app, run};
