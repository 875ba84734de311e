//! The research brief and its scope items.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::errors::PipelineError;

/// Default per-item coverage target, in percent.
pub const DEFAULT_COVERAGE_TARGET: f64 = 80.0;

/// Which kind of work a scope item needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeKind {
    Data,
    Research,
    Both,
}

impl ScopeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Data => "data",
            Self::Research => "research",
            Self::Both => "both",
        }
    }
}

impl std::str::FromStr for ScopeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "data" => Ok(Self::Data),
            "research" => Ok(Self::Research),
            "both" => Ok(Self::Both),
            _ => Err(format!("Invalid scope kind: {}", s)),
        }
    }
}

/// One topic of the brief that must be researched to a target coverage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeItem {
    /// Unique within the brief
    pub id: String,
    pub topic: String,
    pub kind: ScopeKind,
    /// Coverage target in percent; the pipeline-wide target applies when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coverage_target: Option<f64>,
}

impl ScopeItem {
    pub fn new(id: &str, topic: &str, kind: ScopeKind) -> Self {
        Self {
            id: id.to_string(),
            topic: topic.to_string(),
            kind,
            coverage_target: None,
        }
    }

    pub fn with_target(mut self, target: f64) -> Self {
        self.coverage_target = Some(target);
        self
    }

    /// The item's own target, or `default` when it has none.
    pub fn target_or(&self, default: f64) -> f64 {
        self.coverage_target.unwrap_or(default)
    }
}

/// The research brief. Immutable once approved; revisions before approval bump `version`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Brief {
    pub goal: String,
    pub scope: Vec<ScopeItem>,
    #[serde(default)]
    pub output_formats: Vec<String>,
    #[serde(default)]
    pub constraints: Vec<String>,
    #[serde(default = "first_version")]
    pub version: u32,
}

fn first_version() -> u32 {
    1
}

impl Brief {
    pub fn new(goal: &str, scope: Vec<ScopeItem>) -> Self {
        Self {
            goal: goal.to_string(),
            scope,
            output_formats: Vec::new(),
            constraints: Vec::new(),
            version: 1,
        }
    }

    pub fn with_output_formats(mut self, formats: Vec<String>) -> Self {
        self.output_formats = formats;
        self
    }

    pub fn with_constraints(mut self, constraints: Vec<String>) -> Self {
        self.constraints = constraints;
        self
    }

    pub fn scope_item(&self, id: &str) -> Option<&ScopeItem> {
        self.scope.iter().find(|item| item.id == id)
    }

    /// Produce the next version of a draft from a reviewer's edit.
    pub fn revised(&self, mut edited: Brief) -> Brief {
        edited.version = self.version + 1;
        edited
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.goal.trim().is_empty() {
            return Err(PipelineError::InvalidBrief("goal is empty".to_string()));
        }
        if self.scope.is_empty() {
            return Err(PipelineError::InvalidBrief(
                "brief has no scope items".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for item in &self.scope {
            if item.id.trim().is_empty() {
                return Err(PipelineError::InvalidBrief(format!(
                    "scope item '{}' has an empty id",
                    item.topic
                )));
            }
            if !seen.insert(item.id.as_str()) {
                return Err(PipelineError::InvalidBrief(format!(
                    "duplicate scope item id '{}'",
                    item.id
                )));
            }
            if let Some(target) = item.coverage_target
                && !(target > 0.0 && target <= 100.0)
            {
                return Err(PipelineError::InvalidBrief(format!(
                    "scope item '{}' has coverage target {} outside (0, 100]",
                    item.id, target
                )));
            }
        }
        Ok(())
    }
}
