pub mod breaker;
pub mod retry;
pub mod service;
pub mod types;

pub use breaker::{CircuitBreaker, Transition};
pub use retry::RetryExecutor;
pub use service::CircuitBreakerBank;
pub use types::{
    CircuitBreakerConfig, CircuitBreakerMetrics, CircuitBreakerSnapshot, CircuitState, RetryConfig,
};
