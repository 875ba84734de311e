//! Retry and circuit-breaker layer wrapped around every external call.
//!
//! Calls are grouped two ways: by operation class (`llm_call`, `api_call`,
//! `web_search`, `report`), which selects the retry configuration, and by
//! channel, which selects the circuit breaker.

mod breaker;
mod invoker;
mod retry;

pub use breaker::{BreakerConfig, BreakerSnapshot, CircuitBreaker, CircuitState};
pub use invoker::ResilientInvoker;
pub use retry::{RetryConfig, RetryPolicy};
