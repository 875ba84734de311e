//! The model-backed judgments coverage review depends on.

use async_trait::async_trait;

use crate::errors::CallError;
use crate::model::{
    Brief, CoverageAssessment, FollowUpQuestion, Relevance, ScopeItem, TaskKind, TaskResult,
};

/// Semantic judgment the orchestrator delegates to a model.
///
/// Implementations are called through the resilience layer under the
/// `llm_call` operation class, so they should report transport problems as
/// transient `CallError`s rather than retrying themselves.
#[async_trait]
pub trait SemanticEvaluator: Send + Sync {
    /// Judge how well `results` cover one side (`side`) of a scope item.
    ///
    /// Called once per scope item and side instead of once for the whole
    /// scope, so a `both` item gets two independent judgments and one bad
    /// answer only affects its own side. `CoverageEvaluator::review` assembles
    /// the per-item assessments for a round from these calls.
    ///
    /// `results` only contains successful results of that item and kind. The
    /// returned percent is clamped to [0, 100] by the caller.
    async fn assess_coverage(
        &self,
        item: &ScopeItem,
        side: TaskKind,
        results: &[TaskResult],
    ) -> Result<CoverageAssessment, CallError>;

    async fn classify_question_relevance(
        &self,
        question: &FollowUpQuestion,
        brief: &Brief,
    ) -> Result<Relevance, CallError>;
}
