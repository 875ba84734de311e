//! Retry and circuit breaking around a single external call.
//!
//! Each attempt first asks the channel's breaker for admission. Transient
//! errors count against the breaker and are retried with backoff until the
//! class's attempts run out. Permanent and system errors return at once and
//! leave the breaker's failure count alone.

use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

use super::breaker::{BreakerConfig, CircuitBreaker};
use super::retry::RetryPolicy;
use crate::errors::{CallError, ErrorClass, InvokeError};

/// Runs external calls under the retry policy of their operation class and
/// the circuit breaker of their channel.
#[derive(Debug, Clone)]
pub struct ResilientInvoker {
    policy: Arc<RetryPolicy>,
    breaker: Arc<CircuitBreaker>,
}

impl Default for ResilientInvoker {
    fn default() -> Self {
        Self::new(
            RetryPolicy::default(),
            Arc::new(CircuitBreaker::new(BreakerConfig::default())),
        )
    }
}

impl ResilientInvoker {
    /// `breaker` may be shared with other invokers so that every pipeline in
    /// the process sees the same channel health.
    pub fn new(policy: RetryPolicy, breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            policy: Arc::new(policy),
            breaker,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Invoke `op` until it succeeds, fails non-transiently, runs out of
    /// attempts, or the channel's circuit rejects it.
    ///
    /// `op` receives the 1-based attempt number.
    pub async fn invoke<T, F, Fut>(
        &self,
        class: &str,
        channel: &str,
        mut op: F,
    ) -> Result<T, InvokeError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, CallError>>,
    {
        let config = self.policy.for_class(class);
        let max_attempts = config.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            self.breaker.acquire(channel)?;
            let err = match op(attempt).await {
                Ok(value) => {
                    self.breaker.record_success(channel);
                    return Ok(value);
                }
                Err(err) => err,
            };

            match err.class() {
                ErrorClass::Permanent => {
                    self.breaker.record_neutral(channel);
                    debug!(class, channel, error = %err, "permanent failure, not retrying");
                    return Err(InvokeError::Permanent(err));
                }
                ErrorClass::System => {
                    self.breaker.record_neutral(channel);
                    warn!(class, channel, error = %err, "system failure");
                    return Err(InvokeError::System(err));
                }
                ErrorClass::Transient => self.breaker.record_failure(channel),
            }

            if attempt >= max_attempts {
                warn!(class, channel, attempts = attempt, error = %err, "retries exhausted");
                return Err(InvokeError::RetryExhausted {
                    attempts: attempt,
                    last: err,
                });
            }

            let delay = config.delay_for(attempt, &err);
            debug!(
                class,
                channel,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "transient failure, retrying"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::{CircuitState, RetryConfig};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tokio::time::Instant;

    fn invoker(config: RetryConfig) -> ResilientInvoker {
        ResilientInvoker::new(
            RetryPolicy::uniform(config),
            Arc::new(CircuitBreaker::new(BreakerConfig::default())),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_then_success() {
        let inv = invoker(RetryConfig::new(3, 1_000, 30_000));
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let start = Instant::now();
        let value = inv
            .invoke("api_call", "data", move |_| async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(CallError::network("reset"))
                } else {
                    Ok(42)
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(750) && waited <= Duration::from_millis(1_250));
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_is_not_retried() {
        let inv = invoker(RetryConfig::new(3, 1_000, 30_000));
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let err = inv
            .invoke("api_call", "data", move |_| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(CallError::auth("bad key"))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, InvokeError::Permanent(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_system_error_is_fatal() {
        let inv = invoker(RetryConfig::new(3, 1_000, 30_000));
        let err = inv
            .invoke("api_call", "data", |_| async {
                Err::<(), _>(CallError::storage("disk full"))
            })
            .await
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_wraps_last_error() {
        let inv = invoker(RetryConfig::new(3, 100, 1_000));
        let err = inv
            .invoke("api_call", "data", |attempt| async move {
                Err::<(), _>(CallError::timeout(format!("attempt {}", attempt)))
            })
            .await
            .unwrap_err();
        match err {
            InvokeError::RetryExhausted { attempts, last } => {
                assert_eq!(attempts, 3);
                assert_eq!(last.message, "attempt 3");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_waits_retry_after() {
        let inv = invoker(RetryConfig::new(2, 100, 1_000));
        let start = Instant::now();
        let _ = inv
            .invoke("api_call", "data", |attempt| async move {
                if attempt == 1 {
                    Err(CallError::rate_limited("429", Some(Duration::from_secs(7))))
                } else {
                    Ok(())
                }
            })
            .await;
        assert_eq!(start.elapsed().as_secs(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_fails_fast_without_calling() {
        let inv = invoker(RetryConfig::new(1, 10, 10));
        for _ in 0..5 {
            let _ = inv
                .invoke("web_search", "research", |_| async {
                    Err::<(), _>(CallError::unavailable("503"))
                })
                .await;
        }
        assert_eq!(inv.breaker().state("research"), CircuitState::Open);

        let counter = AtomicU32::new(0);
        let calls = &counter;
        let err = inv
            .invoke("web_search", "research", move |_| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, InvokeError::CircuitOpen { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_opening_mid_retry_stops_attempts() {
        let inv = invoker(RetryConfig::new(10, 10, 10));
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let err = inv
            .invoke("api_call", "data", move |_| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(CallError::timeout("slow"))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, InvokeError::CircuitOpen { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }
}
