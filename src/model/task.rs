//! Tasks: the atomic unit of work handed to a worker.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

use super::brief::ScopeKind;

/// Which worker implementation runs a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Data,
    Research,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Data => "data",
            Self::Research => "research",
        }
    }

    /// Single-letter id prefix ("d3", "r5").
    pub fn prefix(&self) -> char {
        match self {
            Self::Data => 'd',
            Self::Research => 'r',
        }
    }

    pub fn from_prefix(c: char) -> Option<Self> {
        match c {
            'd' => Some(Self::Data),
            'r' => Some(Self::Research),
            _ => None,
        }
    }

    /// Task kinds a scope item needs.
    pub fn for_scope(kind: ScopeKind) -> &'static [TaskKind] {
        match kind {
            ScopeKind::Data => &[TaskKind::Data],
            ScopeKind::Research => &[TaskKind::Research],
            ScopeKind::Both => &[TaskKind::Data, TaskKind::Research],
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Dispatch priority. Ordering puts `High` first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Done,
    Failed,
    Partial,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Partial)
    }

    /// Whether the task produced usable output.
    pub fn has_output(&self) -> bool {
        matches!(self, Self::Done | Self::Partial)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Partial => "partial",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Kind-prefixed id, e.g. "d3"
    pub id: String,
    pub scope_item_id: String,
    pub description: String,
    pub kind: TaskKind,
    pub priority: Priority,
    #[serde(default)]
    pub status: TaskStatus,
}

impl Task {
    pub fn new(
        id: String,
        scope_item_id: &str,
        description: &str,
        kind: TaskKind,
        priority: Priority,
    ) -> Self {
        Self {
            id,
            scope_item_id: scope_item_id.to_string(),
            description: description.to_string(),
            kind,
            priority,
            status: TaskStatus::Pending,
        }
    }

    pub fn fingerprint(&self) -> String {
        fingerprint(&self.scope_item_id, &self.description)
    }
}

/// Stable identity of a (scope item, description) pair, insensitive to case and whitespace.
pub fn fingerprint(scope_item_id: &str, description: &str) -> String {
    let normalized = description
        .split_whitespace()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ");
    let mut hasher = Sha256::new();
    hasher.update(scope_item_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(normalized.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Issues kind-prefixed, monotonically increasing task ids.
#[derive(Debug, Clone, Default)]
pub struct TaskIdAllocator {
    last: HashMap<TaskKind, u32>,
}

impl TaskIdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the counters from ids that were already issued.
    pub fn from_issued<'a>(ids: impl IntoIterator<Item = &'a str>) -> Self {
        let mut allocator = Self::new();
        for id in ids {
            let mut chars = id.chars();
            let Some(kind) = chars.next().and_then(TaskKind::from_prefix) else {
                continue;
            };
            if let Ok(n) = chars.as_str().parse::<u32>() {
                let last = allocator.last.entry(kind).or_insert(0);
                *last = (*last).max(n);
            }
        }
        allocator
    }

    pub fn next_id(&mut self, kind: TaskKind) -> String {
        let last = self.last.entry(kind).or_insert(0);
        *last += 1;
        format!("{}{}", kind.prefix(), last)
    }
}
