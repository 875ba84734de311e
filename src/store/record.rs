//! Persisted record and header formats.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::SessionError;
use crate::model::{Session, TaskResult};
use crate::pipeline::{Phase, PipelineEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    /// First record of every log; payload is the initial `Session`.
    SessionCreated,
    /// A phase transition; payload is the `PipelineEvent`.
    Transition,
    /// A terminal task result; payload is the `TaskResult`.
    TaskResult,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SessionCreated => "session_created",
            Self::Transition => "transition",
            Self::TaskResult => "task_result",
        }
    }
}

/// One immutable line of a session's append log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreRecord {
    /// 1-based, strictly increasing within a session
    pub seq: u64,
    pub session_id: String,
    pub kind: RecordKind,
    /// Phase after this record was applied
    pub phase: Phase,
    pub round: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// Input to [`super::SessionStore::save`].
#[derive(Debug, Clone)]
pub struct RecordDraft {
    pub kind: RecordKind,
    pub phase: Phase,
    pub round: u32,
    pub task_id: Option<String>,
    pub payload: serde_json::Value,
    /// Error to expose on the header when this record moves the session to `Failed`.
    pub error: Option<SessionError>,
}

impl RecordDraft {
    pub fn session_created(session: &Session) -> Result<Self, serde_json::Error> {
        Ok(Self {
            kind: RecordKind::SessionCreated,
            phase: session.phase,
            round: session.current_round,
            task_id: None,
            payload: serde_json::to_value(session)?,
            error: None,
        })
    }

    pub fn transition(
        event: &PipelineEvent,
        to: Phase,
        round: u32,
    ) -> Result<Self, serde_json::Error> {
        let error = match event {
            PipelineEvent::Failed { error, .. } => Some(error.clone()),
            _ => None,
        };
        Ok(Self {
            kind: RecordKind::Transition,
            phase: to,
            round,
            task_id: None,
            payload: serde_json::to_value(event)?,
            error,
        })
    }

    pub fn task_result(
        result: &TaskResult,
        phase: Phase,
        round: u32,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            kind: RecordKind::TaskResult,
            phase,
            round,
            task_id: Some(result.task_id.clone()),
            payload: serde_json::to_value(result)?,
            error: None,
        })
    }
}

/// Mutable summary of a session, rewritten after every append.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionHeader {
    pub id: String,
    pub phase: Phase,
    pub current_round: u32,
    pub max_rounds: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<SessionError>,
    pub record_count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SessionHeader {
    pub fn new(session: &Session) -> Self {
        Self {
            id: session.id.clone(),
            phase: session.phase,
            current_round: session.current_round,
            max_rounds: session.max_rounds,
            error: None,
            record_count: 0,
            created_at: session.created_at,
            updated_at: session.updated_at,
        }
    }

    /// Fold a freshly appended record into the header.
    pub fn advance(&mut self, record: &StoreRecord, error: Option<SessionError>) {
        self.record_count = record.seq;
        self.updated_at = record.timestamp;
        if record.kind == RecordKind::Transition {
            self.phase = record.phase;
            self.current_round = record.round;
            self.error = error;
        }
    }
}
