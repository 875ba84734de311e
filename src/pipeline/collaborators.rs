//! Collaborators the state machine calls outside of round execution.

use async_trait::async_trait;
use std::collections::HashSet;
use tracing::info;

use crate::errors::CallError;
use crate::model::{Aggregation, Brief, Priority, Task, TaskIdAllocator, TaskKind};

/// Reviewer's answer to a draft brief.
#[derive(Debug, Clone, PartialEq)]
pub enum BriefVerdict {
    Approve,
    /// Replace the draft with this edit; it becomes the next version.
    Revise(Brief),
}

/// Shapes the brief before it is frozen.
#[async_trait]
pub trait BriefReviewer: Send + Sync {
    /// Background notes gathered before the brief is reviewed.
    async fn initial_research(&self, _brief: &Brief) -> Result<Vec<String>, CallError> {
        Ok(Vec::new())
    }

    async fn review(&self, brief: &Brief, notes: &[String]) -> Result<BriefVerdict, CallError>;
}

/// Approves every draft as-is.
#[derive(Debug, Default, Clone, Copy)]
pub struct AutoApprove;

#[async_trait]
impl BriefReviewer for AutoApprove {
    async fn review(&self, _brief: &Brief, _notes: &[String]) -> Result<BriefVerdict, CallError> {
        Ok(BriefVerdict::Approve)
    }
}

/// Derives the first round of tasks from an approved brief.
pub trait Planner: Send + Sync {
    fn plan(&self, brief: &Brief, ids: &mut TaskIdAllocator) -> Vec<Task>;
}

/// One task per scope item and kind; `both` items get a data and a research task.
#[derive(Debug, Default, Clone, Copy)]
pub struct ScopePlanner;

impl Planner for ScopePlanner {
    fn plan(&self, brief: &Brief, ids: &mut TaskIdAllocator) -> Vec<Task> {
        let mut seen = HashSet::new();
        let mut tasks = Vec::new();
        for item in &brief.scope {
            for &kind in TaskKind::for_scope(item.kind) {
                if !seen.insert((item.id.as_str(), kind)) {
                    continue;
                }
                let description = match kind {
                    TaskKind::Data => format!("Collect data on {}", item.topic),
                    TaskKind::Research => format!("Research {}", item.topic),
                };
                tasks.push(Task::new(
                    ids.next_id(kind),
                    &item.id,
                    &description,
                    kind,
                    Priority::High,
                ));
            }
        }
        tasks
    }
}

/// Receives the final aggregation exactly once, in the Reporting phase.
#[async_trait]
pub trait ReportCollaborator: Send + Sync {
    async fn consume(&self, session_id: &str, aggregation: &Aggregation) -> Result<(), CallError>;
}

/// Report collaborator that only logs a summary.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReport;

#[async_trait]
impl ReportCollaborator for LogReport {
    async fn consume(&self, session_id: &str, aggregation: &Aggregation) -> Result<(), CallError> {
        info!(
            session = %session_id,
            overall_coverage = aggregation.overall_coverage,
            rounds = aggregation.rounds,
            termination = aggregation.termination.as_str(),
            "research complete"
        );
        Ok(())
    }
}
