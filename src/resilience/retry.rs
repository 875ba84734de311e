//! Retry configuration per operation class and backoff computation.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::errors::{CallError, CallErrorKind};

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_exponential_base() -> f64 {
    2.0
}

fn default_jitter_fraction() -> f64 {
    0.25
}

fn default_rate_limit_delay_ms() -> u64 {
    10_000
}

/// Backoff parameters for one operation class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts including the first one
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_exponential_base")]
    pub exponential_base: f64,
    /// Symmetric jitter: the delay is scaled by a factor in `[1 - j, 1 + j]`
    #[serde(default = "default_jitter_fraction")]
    pub jitter_fraction: f64,
    /// Wait after a rate limit when the error carries no `retry_after`
    #[serde(default = "default_rate_limit_delay_ms")]
    pub rate_limit_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            exponential_base: default_exponential_base(),
            jitter_fraction: default_jitter_fraction(),
            rate_limit_delay_ms: default_rate_limit_delay_ms(),
        }
    }
}

impl RetryConfig {
    pub fn new(max_attempts: u32, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_attempts,
            base_delay_ms,
            max_delay_ms,
            ..Default::default()
        }
    }

    pub fn with_rate_limit_delay(mut self, ms: u64) -> Self {
        self.rate_limit_delay_ms = ms;
        self
    }

    pub fn with_jitter(mut self, fraction: f64) -> Self {
        self.jitter_fraction = fraction;
        self
    }

    /// `min(max_delay, base_delay * exponential_base^(attempt-1))`, before jitter.
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let raw = self.base_delay_ms as f64 * self.exponential_base.powi(exponent);
        let capped = raw.min(self.max_delay_ms as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }

    /// Delay to wait after `attempt` failed with `error`.
    ///
    /// Rate limits honour the server hint verbatim; everything else backs off
    /// exponentially with jitter.
    pub fn delay_for(&self, attempt: u32, error: &CallError) -> Duration {
        if error.kind == CallErrorKind::RateLimited {
            return error
                .retry_after
                .unwrap_or_else(|| Duration::from_millis(self.rate_limit_delay_ms));
        }
        jittered(self.base_delay_for(attempt), self.jitter_fraction)
    }
}

fn jittered(delay: Duration, fraction: f64) -> Duration {
    let fraction = fraction.clamp(0.0, 1.0);
    if fraction == 0.0 || delay.is_zero() {
        return delay;
    }
    let factor = 1.0 + rand::rng().random_range(-fraction..=fraction);
    delay.mul_f64(factor)
}

/// Retry configuration for every known operation class.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    classes: BTreeMap<String, RetryConfig>,
    fallback: RetryConfig,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        let mut classes = BTreeMap::new();
        classes.insert(
            "llm_call".to_string(),
            RetryConfig::new(3, 2_000, 60_000).with_rate_limit_delay(30_000),
        );
        classes.insert(
            "api_call".to_string(),
            RetryConfig::new(3, 1_000, 30_000).with_rate_limit_delay(10_000),
        );
        classes.insert(
            "web_search".to_string(),
            RetryConfig::new(2, 1_000, 10_000).with_rate_limit_delay(5_000),
        );
        classes.insert(
            "report".to_string(),
            RetryConfig::new(2, 2_000, 30_000).with_rate_limit_delay(30_000),
        );
        Self {
            classes,
            fallback: RetryConfig::default(),
        }
    }
}

impl RetryPolicy {
    /// Policy with no named classes; every class uses `fallback`.
    pub fn uniform(fallback: RetryConfig) -> Self {
        Self {
            classes: BTreeMap::new(),
            fallback,
        }
    }

    pub fn with_class(mut self, class: &str, config: RetryConfig) -> Self {
        self.classes.insert(class.to_string(), config);
        self
    }

    pub fn set_class(&mut self, class: &str, config: RetryConfig) {
        self.classes.insert(class.to_string(), config);
    }

    /// Unknown classes fall back to the default configuration.
    pub fn for_class(&self, class: &str) -> &RetryConfig {
        self.classes.get(class).unwrap_or(&self.fallback)
    }

    pub fn classes(&self) -> impl Iterator<Item = (&String, &RetryConfig)> {
        self.classes.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_delays_before_jitter() {
        let config = RetryConfig::new(5, 1_000, 30_000);
        assert_eq!(config.base_delay_for(1), Duration::from_millis(1_000));
        assert_eq!(config.base_delay_for(2), Duration::from_millis(2_000));
        assert_eq!(config.base_delay_for(3), Duration::from_millis(4_000));
        assert_eq!(config.base_delay_for(6), Duration::from_millis(30_000));
    }

    #[test]
    fn test_jitter_stays_within_quarter() {
        let config = RetryConfig::new(5, 4_000, 60_000);
        let err = CallError::timeout("slow");
        for _ in 0..200 {
            let d = config.delay_for(2, &err).as_secs_f64();
            assert!((6.0..=10.0).contains(&d), "delay {} out of bounds", d);
        }
    }

    #[test]
    fn test_rate_limit_prefers_retry_after() {
        let config = RetryConfig::new(3, 1_000, 30_000).with_rate_limit_delay(10_000);
        let hinted = CallError::rate_limited("429", Some(Duration::from_secs(7)));
        assert_eq!(config.delay_for(1, &hinted), Duration::from_secs(7));
        let bare = CallError::rate_limited("429", None);
        assert_eq!(config.delay_for(1, &bare), Duration::from_secs(10));
    }

    #[test]
    fn test_unknown_class_uses_fallback() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.for_class("llm_call").base_delay_ms, 2_000);
        assert_eq!(policy.for_class("web_search").max_attempts, 2);
        assert_eq!(policy.for_class("carrier_pigeon"), &RetryConfig::default());
    }

    #[test]
    fn test_zero_jitter_is_exact() {
        let config = RetryConfig::new(3, 500, 10_000).with_jitter(0.0);
        let err = CallError::network("reset");
        assert_eq!(config.delay_for(3, &err), Duration::from_millis(2_000));
    }
}
