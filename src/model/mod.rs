//! Domain types shared by every stage of the pipeline.

mod brief;
mod result;
mod round;
mod session;
mod task;

pub use brief::{Brief, DEFAULT_COVERAGE_TARGET, ScopeItem, ScopeKind};
pub use result::{DataPayload, FollowUpQuestion, Payload, Relevance, ResearchPayload, TaskResult};
pub use round::{
    CoverageAssessment, Decision, DecisionReason, RoundRecord, clamp_percent, overall_coverage,
};
pub use session::{Aggregation, Session};
pub use task::{Priority, Task, TaskIdAllocator, TaskKind, TaskStatus, fingerprint};
