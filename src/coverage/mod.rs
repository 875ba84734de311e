//! Coverage evaluation and the continue/done policy.

mod evaluator;
mod semantic;

pub use evaluator::{CoverageEvaluator, CoveragePolicy, Review};
pub use semantic::SemanticEvaluator;
