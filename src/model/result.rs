//! Task results, payloads and follow-up questions.

use serde::{Deserialize, Serialize};

use super::task::{Task, TaskKind, TaskStatus};
use crate::errors::TaskError;

/// Structured output of a data task.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DataPayload {
    pub summary: String,
    #[serde(default)]
    pub records: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

/// Narrative output of a research task.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ResearchPayload {
    pub summary: String,
    #[serde(default)]
    pub findings: Vec<String>,
    #[serde(default)]
    pub sources: Vec<String>,
}

/// Kind-tagged task output. The orchestrator never looks inside.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    Data(DataPayload),
    Research(ResearchPayload),
}

impl Payload {
    pub fn kind(&self) -> TaskKind {
        match self {
            Self::Data(_) => TaskKind::Data,
            Self::Research(_) => TaskKind::Research,
        }
    }

    pub fn summary(&self) -> &str {
        match self {
            Self::Data(p) => &p.summary,
            Self::Research(p) => &p.summary,
        }
    }
}

/// Relevance tier of a follow-up question, assigned by the semantic evaluator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Relevance {
    High,
    Medium,
    Low,
}

impl std::str::FromStr for Relevance {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "high" => Ok(Self::High),
            "medium" => Ok(Self::Medium),
            "low" => Ok(Self::Low),
            _ => Err(format!("Invalid relevance: {}", s)),
        }
    }
}

/// A gap discovered while executing a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FollowUpQuestion {
    pub text: String,
    pub origin_task_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relevance: Option<Relevance>,
}

impl FollowUpQuestion {
    pub fn new(text: &str, origin_task_id: &str) -> Self {
        Self {
            text: text.to_string(),
            origin_task_id: origin_task_id.to_string(),
            relevance: None,
        }
    }
}

/// Outcome of one dispatched task. Exactly one per task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub scope_item_id: String,
    pub kind: TaskKind,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Payload>,
    #[serde(default)]
    pub follow_ups: Vec<FollowUpQuestion>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
}

impl TaskResult {
    pub fn done(task: &Task, payload: Payload, follow_ups: Vec<FollowUpQuestion>) -> Self {
        Self {
            task_id: task.id.clone(),
            scope_item_id: task.scope_item_id.clone(),
            kind: task.kind,
            status: TaskStatus::Done,
            payload: Some(payload),
            follow_ups,
            error: None,
        }
    }

    /// Usable output with a recorded problem (e.g. truncated source).
    pub fn partial(
        task: &Task,
        payload: Payload,
        follow_ups: Vec<FollowUpQuestion>,
        error: Option<TaskError>,
    ) -> Self {
        Self {
            status: TaskStatus::Partial,
            error,
            ..Self::done(task, payload, follow_ups)
        }
    }

    pub fn failed(task: &Task, error: TaskError) -> Self {
        Self {
            task_id: task.id.clone(),
            scope_item_id: task.scope_item_id.clone(),
            kind: task.kind,
            status: TaskStatus::Failed,
            payload: None,
            follow_ups: Vec::new(),
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.has_output()
    }
}
