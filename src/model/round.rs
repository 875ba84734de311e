//! Coverage assessments and per-round records.

use serde::{Deserialize, Serialize};

use super::result::TaskResult;
use super::task::Task;

/// How completely one scope item has been answered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverageAssessment {
    pub scope_item_id: String,
    /// Always within [0, 100]
    pub percent: f64,
    #[serde(default)]
    pub covered_aspects: Vec<String>,
    #[serde(default)]
    pub missing_aspects: Vec<String>,
}

impl CoverageAssessment {
    /// Build an assessment, clamping `percent` into [0, 100]. NaN counts as 0.
    pub fn new(scope_item_id: &str, percent: f64) -> Self {
        Self {
            scope_item_id: scope_item_id.to_string(),
            percent: clamp_percent(percent),
            covered_aspects: Vec::new(),
            missing_aspects: Vec::new(),
        }
    }

    pub fn with_aspects(mut self, covered: Vec<String>, missing: Vec<String>) -> Self {
        self.covered_aspects = covered;
        self.missing_aspects = missing;
        self
    }

    /// Re-apply the clamp after deserialising foreign input.
    pub fn normalized(mut self) -> Self {
        self.percent = clamp_percent(self.percent);
        self
    }
}

pub fn clamp_percent(percent: f64) -> f64 {
    if percent.is_nan() {
        0.0
    } else {
        percent.clamp(0.0, 100.0)
    }
}

/// Mean coverage across scope items; 0 when there are none.
pub fn overall_coverage(assessments: &[CoverageAssessment]) -> f64 {
    if assessments.is_empty() {
        return 0.0;
    }
    assessments.iter().map(|a| a.percent).sum::<f64>() / assessments.len() as f64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Continue,
    Done,
}

/// Why a review reached its decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionReason {
    /// At least one scope item is below target and rounds remain.
    CoverageBelowTarget,
    /// Every scope item reached its target.
    CoverageMet,
    /// The round limit forced termination regardless of coverage.
    MaxRoundsReached,
    /// The per-session task quota leaves no room for another round.
    TaskBudgetExhausted,
    /// Coverage is short but every candidate task was filtered or already asked.
    NoNewTasks,
}

impl DecisionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CoverageBelowTarget => "coverage_below_target",
            Self::CoverageMet => "coverage_met",
            Self::MaxRoundsReached => "max_rounds_reached",
            Self::TaskBudgetExhausted => "task_budget_exhausted",
            Self::NoNewTasks => "no_new_tasks",
        }
    }
}

/// Append-only record of a completed round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundRecord {
    pub round: u32,
    pub tasks: Vec<Task>,
    pub results: Vec<TaskResult>,
    pub coverage: Vec<CoverageAssessment>,
    pub decision: Decision,
    pub reason: DecisionReason,
    pub had_timeout: bool,
}

impl RoundRecord {
    pub fn min_coverage(&self) -> Option<f64> {
        self.coverage
            .iter()
            .map(|a| a.percent)
            .reduce(f64::min)
    }

    pub fn failed_count(&self) -> usize {
        self.results.iter().filter(|r| !r.is_success()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent_is_clamped() {
        assert_eq!(CoverageAssessment::new("a", 140.0).percent, 100.0);
        assert_eq!(CoverageAssessment::new("a", -3.0).percent, 0.0);
        assert_eq!(CoverageAssessment::new("a", f64::NAN).percent, 0.0);
        assert_eq!(CoverageAssessment::new("a", 42.5).percent, 42.5);
    }

    #[test]
    fn test_normalized_reclamps_deserialized_values() {
        let json = r#"{"scope_item_id":"a","percent":250.0}"#;
        let a: CoverageAssessment = serde_json::from_str(json).unwrap();
        assert_eq!(a.normalized().percent, 100.0);
    }

    #[test]
    fn test_overall_coverage_is_mean() {
        let items = vec![
            CoverageAssessment::new("item1", 90.0),
            CoverageAssessment::new("item2", 85.0),
        ];
        assert_eq!(overall_coverage(&items), 87.5);
        assert_eq!(overall_coverage(&[]), 0.0);
    }

    #[test]
    fn test_decision_reason_serialization() {
        let json = serde_json::to_string(&DecisionReason::MaxRoundsReached).unwrap();
        assert_eq!(json, r#""max_rounds_reached""#);
    }
}
