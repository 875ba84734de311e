//! Typed error hierarchy for the delve orchestrator.
//!
//! Four layers cover the subsystems:
//! - `CallError`: a single failed external call, as reported by a collaborator
//! - `InvokeError`: the outcome of the resilience layer (retry + circuit breaker)
//! - `StoreError`: session persistence failures
//! - `PipelineError`: anything that escapes the state machine and forces `Failed`
//!
//! `TaskError` and `SessionError` are the serialisable forms persisted in the
//! session log.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Retry classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Worth retrying: timeouts, network faults, unavailable services, rate limits.
    Transient,
    /// Retrying cannot help: bad input, auth, quota, missing resources.
    Permanent,
    /// Fatal to the whole session: storage or configuration failure.
    System,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::Permanent => write!(f, "permanent"),
            Self::System => write!(f, "system"),
        }
    }
}

/// What went wrong in an external call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallErrorKind {
    Timeout,
    Network,
    ServiceUnavailable,
    RateLimited,
    InvalidInput,
    Auth,
    QuotaExceeded,
    NotFound,
    Storage,
    Config,
    /// The callee panicked or broke its contract.
    Internal,
}

impl CallErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Network => "network",
            Self::ServiceUnavailable => "service_unavailable",
            Self::RateLimited => "rate_limited",
            Self::InvalidInput => "invalid_input",
            Self::Auth => "auth",
            Self::QuotaExceeded => "quota_exceeded",
            Self::NotFound => "not_found",
            Self::Storage => "storage",
            Self::Config => "config",
            Self::Internal => "internal",
        }
    }

    /// Map the kind onto the retry taxonomy.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Timeout | Self::Network | Self::ServiceUnavailable | Self::RateLimited => {
                ErrorClass::Transient
            }
            Self::InvalidInput
            | Self::Auth
            | Self::QuotaExceeded
            | Self::NotFound
            | Self::Internal => ErrorClass::Permanent,
            Self::Storage | Self::Config => ErrorClass::System,
        }
    }
}

/// A failed external call (LLM, API, search, worker).
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{}: {}", .kind.as_str(), .message)]
pub struct CallError {
    pub kind: CallErrorKind,
    pub message: String,
    /// Server-provided wait hint, only meaningful for rate limits.
    pub retry_after: Option<Duration>,
}

impl CallError {
    pub fn new(kind: CallErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(CallErrorKind::Timeout, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(CallErrorKind::Network, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(CallErrorKind::ServiceUnavailable, message)
    }

    pub fn rate_limited(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self {
            retry_after,
            ..Self::new(CallErrorKind::RateLimited, message)
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(CallErrorKind::InvalidInput, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(CallErrorKind::Auth, message)
    }

    pub fn quota_exceeded(message: impl Into<String>) -> Self {
        Self::new(CallErrorKind::QuotaExceeded, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(CallErrorKind::NotFound, message)
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::new(CallErrorKind::Storage, message)
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(CallErrorKind::Config, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(CallErrorKind::Internal, message)
    }

    pub fn class(&self) -> ErrorClass {
        self.kind.class()
    }
}

/// Outcome of a call that went through the resilience layer and still failed.
#[derive(Debug, Clone, Error)]
pub enum InvokeError {
    #[error("circuit open for channel '{channel}'")]
    CircuitOpen { channel: String },

    #[error("permanent failure: {0}")]
    Permanent(#[source] CallError),

    #[error("system failure: {0}")]
    System(#[source] CallError),

    #[error("retries exhausted after {attempts} attempts: {last}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        last: CallError,
    },
}

impl InvokeError {
    /// `CircuitOpen` behaves like a transient failure: the dependency may recover.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::CircuitOpen { .. } | Self::RetryExhausted { .. } => ErrorClass::Transient,
            Self::Permanent(_) => ErrorClass::Permanent,
            Self::System(_) => ErrorClass::System,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.class() == ErrorClass::System
    }

    /// Short machine-readable code used in persisted errors.
    pub fn code(&self) -> &'static str {
        match self {
            Self::CircuitOpen { .. } => "circuit_open",
            Self::RetryExhausted { .. } => "retry_exhausted",
            Self::Permanent(e) | Self::System(e) => e.kind.as_str(),
        }
    }
}

/// Error attached to a failed or partial `TaskResult`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskError {
    pub code: String,
    pub class: ErrorClass,
    pub message: String,
}

impl TaskError {
    pub fn round_timeout(deadline: Duration) -> Self {
        Self {
            code: CallErrorKind::Timeout.as_str().to_string(),
            class: ErrorClass::Transient,
            message: format!("round deadline of {}s elapsed", deadline.as_secs_f64()),
        }
    }

    pub fn no_worker(kind: &str) -> Self {
        Self {
            code: CallErrorKind::NotFound.as_str().to_string(),
            class: ErrorClass::Permanent,
            message: format!("no worker registered for task kind '{}'", kind),
        }
    }

    pub fn panicked(message: impl Into<String>) -> Self {
        Self {
            code: "panicked".to_string(),
            class: ErrorClass::Permanent,
            message: message.into(),
        }
    }
}

impl From<&CallError> for TaskError {
    fn from(err: &CallError) -> Self {
        Self {
            code: err.kind.as_str().to_string(),
            class: err.class(),
            message: err.message.clone(),
        }
    }
}

impl From<&InvokeError> for TaskError {
    fn from(err: &InvokeError) -> Self {
        Self {
            code: err.code().to_string(),
            class: err.class(),
            message: err.to_string(),
        }
    }
}

/// Structured error recorded on a `Failed` session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionError {
    pub code: String,
    pub message: String,
    /// Whether calling `resume()` can make progress.
    pub recoverable: bool,
}

/// Session persistence failures. Always system-class.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to encode or decode record: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Session {id} not found")]
    SessionNotFound { id: String },

    #[error("Session {id} already exists")]
    SessionExists { id: String },

    #[error("Session {id} log is corrupt at record {seq}: {message}")]
    Corrupt { id: String, seq: u64, message: String },

    #[error("Store lock poisoned")]
    LockPoisoned,
}

impl StoreError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Errors that escape the orchestrator. Each one forces the session into `Failed`.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Invalid transition: {event} is not allowed from {from}")]
    InvalidTransition { from: String, event: String },

    #[error("Invariant violated: {0}")]
    InvariantViolation(String),

    #[error("Invalid brief: {0}")]
    InvalidBrief(String),

    #[error("{stage} failed: {source}")]
    Collaborator {
        stage: &'static str,
        #[source]
        source: InvokeError,
    },

    #[error("Task {task_id} hit a system error: {source}")]
    TaskFatal {
        task_id: String,
        #[source]
        source: InvokeError,
    },

    #[error("Session {id} is already {phase}")]
    SessionTerminal { id: String, phase: String },

    #[error("Session {id} failed with a non-recoverable error: {message}")]
    NotResumable { id: String, message: String },
}

impl PipelineError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Store(_) => "storage",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::InvariantViolation(_) => "invariant_violation",
            Self::InvalidBrief(_) => "invalid_brief",
            Self::Collaborator { .. } => "collaborator",
            Self::TaskFatal { .. } => "system",
            Self::SessionTerminal { .. } => "session_terminal",
            Self::NotResumable { .. } => "not_resumable",
        }
    }

    /// Only collaborator failures that were not permanent leave room for `resume()`.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Collaborator { source, .. } => source.class() == ErrorClass::Transient,
            _ => false,
        }
    }

    pub fn to_session_error(&self) -> SessionError {
        SessionError {
            code: self.code().to_string(),
            message: self.to_string(),
            recoverable: self.is_recoverable(),
        }
    }
}
