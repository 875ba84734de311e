//! Pipeline phases, transition events and the fixed transition table.

use serde::{Deserialize, Serialize};

use crate::errors::{PipelineError, SessionError};
use crate::model::{Aggregation, Brief, RoundRecord, Task};

/// Lifecycle phase of a research session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Created,
    InitialResearch,
    BriefDraft,
    BriefApproved,
    Planning,
    Executing,
    Review,
    Aggregating,
    Reporting,
    Done,
    Failed,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::InitialResearch => "initial_research",
            Self::BriefDraft => "brief_draft",
            Self::BriefApproved => "brief_approved",
            Self::Planning => "planning",
            Self::Executing => "executing",
            Self::Review => "review",
            Self::Aggregating => "aggregating",
            Self::Reporting => "reporting",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "initial_research" => Ok(Self::InitialResearch),
            "brief_draft" => Ok(Self::BriefDraft),
            "brief_approved" => Ok(Self::BriefApproved),
            "planning" => Ok(Self::Planning),
            "executing" => Ok(Self::Executing),
            "review" => Ok(Self::Review),
            "aggregating" => Ok(Self::Aggregating),
            "reporting" => Ok(Self::Reporting),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid phase: {}", s)),
        }
    }
}

/// A phase transition together with the data it commits.
///
/// Each event is persisted as a single record, so the payload and the new
/// phase become durable together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    Started {
        brief: Brief,
    },
    ResearchCompleted {
        notes: Vec<String>,
    },
    BriefRevised {
        brief: Brief,
    },
    BriefApproved {
        brief: Brief,
    },
    PlanningStarted,
    TasksPlanned {
        round: u32,
        tasks: Vec<Task>,
    },
    RoundExecuted {
        round: u32,
        had_timeout: bool,
    },
    Continue {
        record: Box<RoundRecord>,
        next_round: u32,
        tasks: Vec<Task>,
    },
    Completed {
        record: Box<RoundRecord>,
    },
    Aggregated {
        aggregation: Box<Aggregation>,
    },
    Reported,
    Failed {
        error: SessionError,
        from: Phase,
    },
    Resumed {
        to: Phase,
    },
}

impl PipelineEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Started { .. } => "started",
            Self::ResearchCompleted { .. } => "research_completed",
            Self::BriefRevised { .. } => "brief_revised",
            Self::BriefApproved { .. } => "brief_approved",
            Self::PlanningStarted => "planning_started",
            Self::TasksPlanned { .. } => "tasks_planned",
            Self::RoundExecuted { .. } => "round_executed",
            Self::Continue { .. } => "continue",
            Self::Completed { .. } => "completed",
            Self::Aggregated { .. } => "aggregated",
            Self::Reported => "reported",
            Self::Failed { .. } => "failed",
            Self::Resumed { .. } => "resumed",
        }
    }

    /// Look up the transition table. Returns the target phase or `InvalidTransition`.
    pub fn target(&self, from: Phase) -> Result<Phase, PipelineError> {
        use Phase::*;
        let to = match (from, self) {
            (Created, Self::Started { .. }) => Some(InitialResearch),
            (InitialResearch, Self::ResearchCompleted { .. }) => Some(BriefDraft),
            (BriefDraft, Self::BriefRevised { .. }) => Some(BriefDraft),
            (BriefDraft, Self::BriefApproved { .. }) => Some(BriefApproved),
            (BriefApproved, Self::PlanningStarted) => Some(Planning),
            (Planning, Self::TasksPlanned { .. }) => Some(Executing),
            (Executing, Self::RoundExecuted { .. }) => Some(Review),
            (Review, Self::Continue { .. }) => Some(Executing),
            (Review, Self::Completed { .. }) => Some(Aggregating),
            (Aggregating, Self::Aggregated { .. }) => Some(Reporting),
            (Reporting, Self::Reported) => Some(Done),
            (from, Self::Failed { .. }) if !from.is_terminal() => Some(Failed),
            (Failed, Self::Resumed { to }) if !to.is_terminal() => Some(*to),
            _ => None,
        };
        to.ok_or_else(|| PipelineError::InvalidTransition {
            from: from.to_string(),
            event: self.name().to_string(),
        })
    }
}
