//! Session lifecycle: the transition table, the state machine that drives it,
//! and the collaborators it calls between rounds.

mod collaborators;
mod machine;
mod transitions;

pub use collaborators::{
    AutoApprove, BriefReviewer, BriefVerdict, LogReport, Planner, ReportCollaborator, ScopePlanner,
};
pub use machine::{PipelineBuilder, PipelineConfig, PipelineStateMachine};
pub use transitions::{Phase, PipelineEvent};
