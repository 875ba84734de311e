//! Configuration loaded from `.delve/delve.toml`.
//!
//! Layered: file, then environment, then CLI flags. Every section is optional
//! and falls back to the built-in defaults.
//!
//! # Configuration File Format
//!
//! ```toml
//! [pipeline]
//! max_rounds = 10
//! max_tasks_per_round = 10
//! max_tasks_per_session = 100
//! coverage_target_percent = 80.0
//! diminishing_returns_round = 3
//! round_timeout_secs = 300
//! max_brief_revisions = 3
//!
//! [store]
//! dir = ".delve/sessions"
//! max_concurrent_sessions = 8
//!
//! [circuit_breaker]
//! failure_threshold = 5
//! recovery_timeout_secs = 60
//! half_open_max_calls = 3
//!
//! [retry.llm_call]
//! max_attempts = 3
//! base_delay_ms = 2000
//! max_delay_ms = 60000
//!
//! [logging]
//! json = false
//! dir = ".delve/logs"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::model::DEFAULT_COVERAGE_TARGET;
use crate::pipeline::PipelineConfig;
use crate::resilience::{BreakerConfig, RetryConfig, RetryPolicy};
use crate::store::DEFAULT_MAX_CONCURRENT_SESSIONS;

/// Directory holding `delve.toml`, sessions and logs, relative to the project.
pub const DELVE_DIR: &str = ".delve";
pub const CONFIG_FILE: &str = "delve.toml";

pub const ENV_MAX_ROUNDS: &str = "DELVE_MAX_ROUNDS";
pub const ENV_ROUND_TIMEOUT_SECS: &str = "DELVE_ROUND_TIMEOUT_SECS";
pub const ENV_STORE_DIR: &str = "DELVE_STORE_DIR";

fn default_max_rounds() -> u32 {
    10
}

fn default_max_tasks_per_round() -> usize {
    10
}

fn default_max_tasks_per_session() -> usize {
    100
}

fn default_coverage_target() -> f64 {
    DEFAULT_COVERAGE_TARGET
}

fn default_diminishing_returns_round() -> u32 {
    3
}

fn default_round_timeout_secs() -> u64 {
    300
}

fn default_max_brief_revisions() -> u32 {
    3
}

fn default_max_concurrent_sessions() -> usize {
    DEFAULT_MAX_CONCURRENT_SESSIONS
}

/// Round and task quotas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineSection {
    #[serde(default = "default_max_rounds")]
    pub max_rounds: u32,
    #[serde(default = "default_max_tasks_per_round")]
    pub max_tasks_per_round: usize,
    #[serde(default = "default_max_tasks_per_session")]
    pub max_tasks_per_session: usize,
    /// Used for scope items that do not set their own target
    #[serde(default = "default_coverage_target")]
    pub coverage_target_percent: f64,
    /// Medium-relevance questions spawn tasks only before this round
    #[serde(default = "default_diminishing_returns_round")]
    pub diminishing_returns_round: u32,
    #[serde(default = "default_round_timeout_secs")]
    pub round_timeout_secs: u64,
    #[serde(default = "default_max_brief_revisions")]
    pub max_brief_revisions: u32,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            max_rounds: default_max_rounds(),
            max_tasks_per_round: default_max_tasks_per_round(),
            max_tasks_per_session: default_max_tasks_per_session(),
            coverage_target_percent: default_coverage_target(),
            diminishing_returns_round: default_diminishing_returns_round(),
            round_timeout_secs: default_round_timeout_secs(),
            max_brief_revisions: default_max_brief_revisions(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreSection {
    /// Session directory. Relative paths resolve against the project directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
    #[serde(default = "default_max_concurrent_sessions")]
    pub max_concurrent_sessions: usize,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            dir: None,
            max_concurrent_sessions: default_max_concurrent_sessions(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LoggingSection {
    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
    /// Also write a daily-rotated log file here
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

/// The complete delve.toml configuration structure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelveToml {
    #[serde(default)]
    pub pipeline: PipelineSection,
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub circuit_breaker: BreakerConfig,
    /// Per operation class; classes not listed keep their built-in values
    #[serde(default)]
    pub retry: BTreeMap<String, RetryConfig>,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl Default for DelveToml {
    fn default() -> Self {
        let retry = RetryPolicy::default()
            .classes()
            .map(|(class, config)| (class.clone(), config.clone()))
            .collect();
        Self {
            pipeline: PipelineSection::default(),
            store: StoreSection::default(),
            circuit_breaker: BreakerConfig::default(),
            retry,
            logging: LoggingSection::default(),
        }
    }
}

impl DelveToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse delve.toml")
    }

    /// Load `delve.toml` from `delve_dir`, or defaults if the file doesn't exist.
    pub fn load_or_default(delve_dir: &Path) -> Result<Self> {
        let config_path = delve_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize delve.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply `DELVE_*` environment overrides on top of the file values.
    pub fn with_env(mut self) -> Result<Self> {
        if let Ok(value) = std::env::var(ENV_MAX_ROUNDS) {
            self.pipeline.max_rounds = value
                .trim()
                .parse()
                .with_context(|| format!("{} must be a whole number, got '{}'", ENV_MAX_ROUNDS, value))?;
        }
        if let Ok(value) = std::env::var(ENV_ROUND_TIMEOUT_SECS) {
            self.pipeline.round_timeout_secs = value.trim().parse().with_context(|| {
                format!("{} must be a whole number, got '{}'", ENV_ROUND_TIMEOUT_SECS, value)
            })?;
        }
        if let Ok(value) = std::env::var(ENV_STORE_DIR)
            && !value.trim().is_empty()
        {
            self.store.dir = Some(PathBuf::from(value));
        }
        Ok(self)
    }

    /// Resolve the session directory for a project.
    pub fn store_dir(&self, project_dir: &Path) -> PathBuf {
        match &self.store.dir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => project_dir.join(dir),
            None => project_dir.join(DELVE_DIR).join("sessions"),
        }
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        let p = &self.pipeline;
        PipelineConfig {
            max_rounds: p.max_rounds,
            max_tasks_per_round: p.max_tasks_per_round,
            max_tasks_per_session: p.max_tasks_per_session,
            coverage_target_percent: p.coverage_target_percent,
            diminishing_returns_round: p.diminishing_returns_round,
            round_timeout: Duration::from_secs(p.round_timeout_secs),
            max_brief_revisions: p.max_brief_revisions,
        }
    }

    /// Built-in classes overlaid with the `[retry.*]` tables.
    pub fn retry_policy(&self) -> RetryPolicy {
        let mut policy = RetryPolicy::default();
        for (class, config) in &self.retry {
            policy.set_class(class, config.clone());
        }
        policy
    }

    pub fn breaker_config(&self) -> BreakerConfig {
        self.circuit_breaker.clone()
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        let p = &self.pipeline;

        if p.max_rounds == 0 {
            warnings.push("pipeline.max_rounds is 0: no round can run".to_string());
        }
        if p.max_tasks_per_round == 0 {
            warnings.push("pipeline.max_tasks_per_round is 0: no task can be issued".to_string());
        }
        if p.max_tasks_per_session < p.max_tasks_per_round {
            warnings.push(format!(
                "pipeline.max_tasks_per_session ({}) is below max_tasks_per_round ({})",
                p.max_tasks_per_session, p.max_tasks_per_round
            ));
        }
        if !(p.coverage_target_percent > 0.0 && p.coverage_target_percent <= 100.0) {
            warnings.push(format!(
                "pipeline.coverage_target_percent {} is outside (0, 100]",
                p.coverage_target_percent
            ));
        }
        if p.diminishing_returns_round > p.max_rounds {
            warnings.push(format!(
                "pipeline.diminishing_returns_round ({}) is after max_rounds ({}); medium questions are never cut off",
                p.diminishing_returns_round, p.max_rounds
            ));
        }
        if p.round_timeout_secs == 0 {
            warnings.push("pipeline.round_timeout_secs is 0: every task will time out".to_string());
        }
        if self.store.max_concurrent_sessions == 0 {
            warnings.push("store.max_concurrent_sessions is 0: no session can write".to_string());
        }

        let cb = &self.circuit_breaker;
        if cb.failure_threshold == 0 {
            warnings.push("circuit_breaker.failure_threshold is 0".to_string());
        }
        if cb.half_open_max_calls == 0 {
            warnings.push(
                "circuit_breaker.half_open_max_calls is 0: an open circuit never closes".to_string(),
            );
        }

        for (class, r) in &self.retry {
            if r.max_attempts == 0 {
                warnings.push(format!("retry.{}.max_attempts is 0", class));
            }
            if r.max_delay_ms < r.base_delay_ms {
                warnings.push(format!(
                    "retry.{}.max_delay_ms ({}) is below base_delay_ms ({})",
                    class, r.max_delay_ms, r.base_delay_ms
                ));
            }
            if r.exponential_base < 1.0 {
                warnings.push(format!(
                    "retry.{}.exponential_base {} shrinks delays",
                    class, r.exponential_base
                ));
            }
            if !(0.0..1.0).contains(&r.jitter_fraction) {
                warnings.push(format!(
                    "retry.{}.jitter_fraction {} is outside [0, 1)",
                    class, r.jitter_fraction
                ));
            }
        }

        warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::tempdir;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    fn clear_env() {
        unsafe {
            std::env::remove_var(ENV_MAX_ROUNDS);
            std::env::remove_var(ENV_ROUND_TIMEOUT_SECS);
            std::env::remove_var(ENV_STORE_DIR);
        }
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = DelveToml::parse("").unwrap();
        assert_eq!(config.pipeline, PipelineSection::default());
        assert_eq!(config.circuit_breaker, BreakerConfig::default());
        assert!(config.retry.is_empty());
        assert_eq!(config.retry_policy(), RetryPolicy::default());
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_partial_sections() {
        let config = DelveToml::parse(
            r#"
            [pipeline]
            max_rounds = 4
            round_timeout_secs = 30

            [circuit_breaker]
            failure_threshold = 2

            [retry.web_search]
            max_attempts = 5
            "#,
        )
        .unwrap();

        let pipeline = config.pipeline_config();
        assert_eq!(pipeline.max_rounds, 4);
        assert_eq!(pipeline.max_tasks_per_round, 10);
        assert_eq!(pipeline.round_timeout, Duration::from_secs(30));
        assert_eq!(config.breaker_config().failure_threshold, 2);
        assert_eq!(config.breaker_config().recovery_timeout_secs, 60);

        let policy = config.retry_policy();
        assert_eq!(policy.for_class("web_search").max_attempts, 5);
        assert_eq!(policy.for_class("web_search").base_delay_ms, 1_000);
        // Classes not mentioned keep their built-in tuning.
        assert_eq!(policy.for_class("llm_call").base_delay_ms, 2_000);
    }

    #[test]
    fn test_invalid_toml_is_an_error() {
        let err = DelveToml::parse("[pipeline\nmax_rounds = 1").unwrap_err();
        assert!(err.to_string().contains("delve.toml"));
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        let mut config = DelveToml::default();
        config.pipeline.max_rounds = 6;
        config.store.dir = Some(PathBuf::from("research/sessions"));
        config.save(&path).unwrap();

        let loaded = DelveToml::load_or_default(dir.path()).unwrap();
        assert_eq!(loaded, config);
        assert!(loaded.retry.contains_key("report"));
    }

    #[test]
    fn test_load_or_default_without_file() {
        let dir = tempdir().unwrap();
        let config = DelveToml::load_or_default(dir.path()).unwrap();
        assert_eq!(config, DelveToml::default());
    }

    #[test]
    fn test_store_dir_resolution() {
        let project = Path::new("/work/project");
        let mut config = DelveToml::default();
        assert_eq!(
            config.store_dir(project),
            PathBuf::from("/work/project/.delve/sessions")
        );
        config.store.dir = Some(PathBuf::from("data"));
        assert_eq!(config.store_dir(project), PathBuf::from("/work/project/data"));
        config.store.dir = Some(PathBuf::from("/var/delve"));
        assert_eq!(config.store_dir(project), PathBuf::from("/var/delve"));
    }

    #[test]
    fn test_validate_reports_problems() {
        let mut config = DelveToml::default();
        config.pipeline.max_rounds = 2;
        config.pipeline.coverage_target_percent = 120.0;
        config.pipeline.max_tasks_per_session = 5;
        config.circuit_breaker.half_open_max_calls = 0;
        config
            .retry
            .insert("api_call".into(), RetryConfig::default().with_jitter(1.5));

        let warnings = config.validate();
        assert_eq!(warnings.len(), 5, "{:?}", warnings);
        assert!(warnings.iter().any(|w| w.contains("coverage_target_percent")));
        assert!(warnings.iter().any(|w| w.contains("diminishing_returns_round")));
        assert!(warnings.iter().any(|w| w.contains("max_tasks_per_session")));
        assert!(warnings.iter().any(|w| w.contains("half_open_max_calls")));
        assert!(warnings.iter().any(|w| w.contains("retry.api_call.jitter_fraction")));
    }

    #[test]
    fn test_env_overrides() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env();
        unsafe {
            std::env::set_var(ENV_MAX_ROUNDS, "3");
            std::env::set_var(ENV_ROUND_TIMEOUT_SECS, " 45 ");
            std::env::set_var(ENV_STORE_DIR, "/tmp/delve-sessions");
        }
        let config = DelveToml::default().with_env();
        clear_env();

        let config = config.unwrap();
        assert_eq!(config.pipeline.max_rounds, 3);
        assert_eq!(config.pipeline.round_timeout_secs, 45);
        assert_eq!(
            config.store_dir(Path::new("/elsewhere")),
            PathBuf::from("/tmp/delve-sessions")
        );
    }

    #[test]
    fn test_bad_env_value_is_an_error() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env();
        unsafe { std::env::set_var(ENV_MAX_ROUNDS, "many") };
        let result = DelveToml::default().with_env();
        clear_env();

        let err = result.unwrap_err();
        assert!(err.to_string().contains(ENV_MAX_ROUNDS));
    }
}
