//! Per-channel circuit breakers.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::errors::InvokeError;

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout_secs() -> u64 {
    60
}

fn default_half_open_max_calls() -> u32 {
    3
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_recovery_timeout_secs")]
    pub recovery_timeout_secs: u64,
    /// Probes admitted while half-open; this many successes close the circuit
    #[serde(default = "default_half_open_max_calls")]
    pub half_open_max_calls: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_secs: default_recovery_timeout_secs(),
            half_open_max_calls: default_half_open_max_calls(),
        }
    }
}

impl BreakerConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.recovery_timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug)]
struct CircuitChannelState {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure_time: Option<Instant>,
    half_open_probe_count: u32,
    half_open_successes: u32,
}

impl Default for CircuitChannelState {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure_time: None,
            half_open_probe_count: 0,
            half_open_successes: 0,
        }
    }
}

impl CircuitChannelState {
    fn open(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.last_failure_time = Some(now);
        self.half_open_probe_count = 0;
        self.half_open_successes = 0;
    }
}

/// Point-in-time view of one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreakerSnapshot {
    pub channel: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub half_open_probe_count: u32,
    pub half_open_successes: u32,
}

/// Circuit state for every channel, shared by all callers of the same channel.
///
/// Each channel is guarded by its own lock, so unrelated channels never
/// contend. Wrap in an `Arc` to share one registry between pipelines.
#[derive(Debug, Default)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    channels: DashMap<String, Arc<Mutex<CircuitChannelState>>>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            channels: DashMap::new(),
        }
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    fn channel(&self, channel: &str) -> Arc<Mutex<CircuitChannelState>> {
        self.channels
            .entry(channel.to_string())
            .or_default()
            .value()
            .clone()
    }

    fn guard(state: &Mutex<CircuitChannelState>) -> MutexGuard<'_, CircuitChannelState> {
        // The state is plain counters; a panic mid-update cannot leave it unusable.
        state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Admit or reject one attempt on `channel`.
    pub fn acquire(&self, channel: &str) -> Result<(), InvokeError> {
        let slot = self.channel(channel);
        let mut state = Self::guard(&slot);
        let now = Instant::now();

        if state.state == CircuitState::Open {
            let elapsed = state
                .last_failure_time
                .map(|t| now.duration_since(t))
                .unwrap_or_default();
            if elapsed < self.config.recovery_timeout() {
                return Err(InvokeError::CircuitOpen {
                    channel: channel.to_string(),
                });
            }
            state.state = CircuitState::HalfOpen;
            state.half_open_probe_count = 0;
            state.half_open_successes = 0;
            info!(channel = %channel, "circuit half-open, admitting probes");
        }

        if state.state == CircuitState::HalfOpen {
            if state.half_open_probe_count >= self.config.half_open_max_calls {
                return Err(InvokeError::CircuitOpen {
                    channel: channel.to_string(),
                });
            }
            state.half_open_probe_count += 1;
        }
        Ok(())
    }

    pub fn record_success(&self, channel: &str) {
        let slot = self.channel(channel);
        let mut state = Self::guard(&slot);
        match state.state {
            CircuitState::Closed => state.consecutive_failures = 0,
            CircuitState::HalfOpen => {
                state.half_open_successes += 1;
                if state.half_open_successes >= self.config.half_open_max_calls {
                    *state = CircuitChannelState::default();
                    info!(channel = %channel, "circuit closed");
                }
            }
            // A call admitted before the circuit opened; it says nothing about recovery.
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self, channel: &str) {
        let slot = self.channel(channel);
        let mut state = Self::guard(&slot);
        let now = Instant::now();
        match state.state {
            CircuitState::Closed => {
                state.consecutive_failures += 1;
                state.last_failure_time = Some(now);
                if state.consecutive_failures >= self.config.failure_threshold {
                    state.open(now);
                    warn!(
                        channel = %channel,
                        failures = state.consecutive_failures,
                        "circuit opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                state.consecutive_failures += 1;
                state.open(now);
                warn!(channel = %channel, "probe failed, circuit reopened");
            }
            CircuitState::Open => {}
        }
    }

    /// Release a half-open probe whose outcome says nothing about channel health
    /// (a permanent or system error).
    pub fn record_neutral(&self, channel: &str) {
        let slot = self.channel(channel);
        let mut state = Self::guard(&slot);
        if state.state == CircuitState::HalfOpen {
            state.half_open_probe_count = state.half_open_probe_count.saturating_sub(1);
        }
    }

    pub fn state(&self, channel: &str) -> CircuitState {
        match self.channels.get(channel) {
            Some(slot) => {
                let state = Self::guard(slot.value());
                state.state
            }
            None => CircuitState::Closed,
        }
    }

    pub fn snapshot(&self, channel: &str) -> Option<BreakerSnapshot> {
        self.channels.get(channel).map(|slot| {
            let state = Self::guard(slot.value());
            BreakerSnapshot {
                channel: channel.to_string(),
                state: state.state,
                consecutive_failures: state.consecutive_failures,
                half_open_probe_count: state.half_open_probe_count,
                half_open_successes: state.half_open_successes,
            }
        })
    }

    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let mut channels: Vec<String> = self.channels.iter().map(|e| e.key().clone()).collect();
        channels.sort();
        channels
            .iter()
            .filter_map(|channel| self.snapshot(channel))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(BreakerConfig::default())
    }

    fn trip(breaker: &CircuitBreaker, channel: &str) {
        for _ in 0..5 {
            breaker.acquire(channel).unwrap();
            breaker.record_failure(channel);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_at_threshold() {
        let b = breaker();
        for _ in 0..4 {
            b.acquire("research").unwrap();
            b.record_failure("research");
        }
        assert_eq!(b.state("research"), CircuitState::Closed);
        b.acquire("research").unwrap();
        b.record_failure("research");
        assert_eq!(b.state("research"), CircuitState::Open);
        assert!(matches!(
            b.acquire("research"),
            Err(InvokeError::CircuitOpen { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failure_count() {
        let b = breaker();
        for _ in 0..4 {
            b.record_failure("data");
        }
        b.record_success("data");
        b.record_failure("data");
        assert_eq!(b.state("data"), CircuitState::Closed);
        assert_eq!(b.snapshot("data").unwrap().consecutive_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_limited_probes() {
        let b = breaker();
        trip(&b, "research");
        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(b.acquire("research").is_err());

        tokio::time::advance(Duration::from_secs(1)).await;
        for _ in 0..3 {
            b.acquire("research").unwrap();
        }
        assert_eq!(b.state("research"), CircuitState::HalfOpen);
        assert!(b.acquire("research").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_successes_close() {
        let b = breaker();
        trip(&b, "research");
        tokio::time::advance(Duration::from_secs(60)).await;
        for _ in 0..3 {
            b.acquire("research").unwrap();
            b.record_success("research");
        }
        let snap = b.snapshot("research").unwrap();
        assert_eq!(snap.state, CircuitState::Closed);
        assert_eq!(snap.consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens_and_restarts_timer() {
        let b = breaker();
        trip(&b, "research");
        tokio::time::advance(Duration::from_secs(60)).await;
        b.acquire("research").unwrap();
        b.record_success("research");
        b.acquire("research").unwrap();
        b.record_failure("research");
        assert_eq!(b.state("research"), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(b.acquire("research").is_err());
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(b.acquire("research").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_channels_are_independent() {
        let b = breaker();
        trip(&b, "research");
        assert!(b.acquire("data").is_ok());
        let channels: Vec<_> = b.snapshots().into_iter().map(|s| s.channel).collect();
        assert_eq!(channels, vec!["data".to_string(), "research".to_string()]);
    }
}
