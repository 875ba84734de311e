//! The research session and its replayable state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use tracing::warn;

use super::brief::Brief;
use super::result::TaskResult;
use super::round::{CoverageAssessment, DecisionReason, RoundRecord};
use super::task::{Task, TaskIdAllocator, TaskStatus};
use crate::errors::SessionError;
use crate::pipeline::{Phase, PipelineEvent};

/// Final research bundle handed to the report collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Aggregation {
    pub overall_coverage: f64,
    pub coverage: Vec<CoverageAssessment>,
    pub termination: DecisionReason,
    pub rounds: u32,
    pub total_tasks: usize,
    pub failed_tasks: usize,
    /// Successful results, in task dispatch order
    pub results: Vec<TaskResult>,
}

/// State of one research session.
///
/// Mutated only through [`Session::apply`] (phase transitions) and
/// [`Session::record_result`], which is also how a restored session is
/// rebuilt from the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub phase: Phase,
    /// 0 until planning issues round 1
    pub current_round: u32,
    pub max_rounds: u32,
    pub error: Option<SessionError>,
    /// Phase the session was in when it failed; the resume target.
    pub failed_from: Option<Phase>,
    pub brief: Brief,
    #[serde(default)]
    pub research_notes: Vec<String>,
    /// Tasks issued per round
    pub planned: BTreeMap<u32, Vec<Task>>,
    /// Results keyed by task id
    pub results: BTreeMap<String, TaskResult>,
    pub rounds: Vec<RoundRecord>,
    /// Rounds whose deadline passed before every task finished
    #[serde(default)]
    pub timed_out_rounds: BTreeSet<u32>,
    pub aggregation: Option<Aggregation>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(id: &str, brief: Brief, max_rounds: u32, now: DateTime<Utc>) -> Self {
        Self {
            id: id.to_string(),
            phase: Phase::Created,
            current_round: 0,
            max_rounds,
            error: None,
            failed_from: None,
            brief,
            research_notes: Vec::new(),
            planned: BTreeMap::new(),
            results: BTreeMap::new(),
            rounds: Vec::new(),
            timed_out_rounds: BTreeSet::new(),
            aggregation: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply a transition that has already been validated against the table.
    pub fn apply(&mut self, event: &PipelineEvent, to: Phase, at: DateTime<Utc>) {
        match event {
            PipelineEvent::Started { brief }
            | PipelineEvent::BriefRevised { brief }
            | PipelineEvent::BriefApproved { brief } => {
                self.brief = brief.clone();
            }
            PipelineEvent::ResearchCompleted { notes } => {
                self.research_notes = notes.clone();
            }
            PipelineEvent::TasksPlanned { round, tasks } => {
                self.current_round = *round;
                self.planned.insert(*round, tasks.clone());
            }
            PipelineEvent::Continue {
                record,
                next_round,
                tasks,
            } => {
                self.push_round(record.as_ref().clone());
                self.current_round = *next_round;
                self.planned.insert(*next_round, tasks.clone());
            }
            PipelineEvent::Completed { record } => {
                self.push_round(record.as_ref().clone());
            }
            PipelineEvent::Aggregated { aggregation } => {
                self.aggregation = Some(aggregation.as_ref().clone());
            }
            PipelineEvent::Failed { error, from } => {
                self.error = Some(error.clone());
                self.failed_from = Some(*from);
            }
            PipelineEvent::Resumed { .. } => {
                self.error = None;
                self.failed_from = None;
            }
            PipelineEvent::RoundExecuted { round, had_timeout } => {
                if *had_timeout {
                    self.timed_out_rounds.insert(*round);
                }
            }
            PipelineEvent::PlanningStarted | PipelineEvent::Reported => {}
        }
        self.phase = to;
        self.updated_at = at;
    }

    fn push_round(&mut self, record: RoundRecord) {
        // A record for the same round replaces the earlier one.
        self.rounds.retain(|r| r.round != record.round);
        self.rounds.push(record);
    }

    /// Record a terminal task result. The first result for a task wins.
    pub fn record_result(&mut self, result: TaskResult) -> bool {
        if self.results.contains_key(&result.task_id) {
            warn!(
                session = %self.id,
                task = %result.task_id,
                "ignoring duplicate result for task"
            );
            return false;
        }
        for tasks in self.planned.values_mut() {
            if let Some(task) = tasks.iter_mut().find(|t| t.id == result.task_id) {
                task.status = result.status;
            }
        }
        self.results.insert(result.task_id.clone(), result);
        true
    }

    pub fn tasks_for_round(&self, round: u32) -> &[Task] {
        self.planned.get(&round).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Tasks of the current round that have no persisted result yet.
    pub fn outstanding_tasks(&self) -> Vec<Task> {
        self.tasks_for_round(self.current_round)
            .iter()
            .filter(|t| !self.results.contains_key(&t.id))
            .cloned()
            .collect()
    }

    pub fn results_for_round(&self, round: u32) -> Vec<TaskResult> {
        self.tasks_for_round(round)
            .iter()
            .filter_map(|t| self.results.get(&t.id).cloned())
            .collect()
    }

    /// Every result collected so far, in dispatch order.
    pub fn cumulative_results(&self) -> Vec<TaskResult> {
        self.planned
            .values()
            .flatten()
            .filter_map(|t| self.results.get(&t.id).cloned())
            .collect()
    }

    pub fn all_tasks(&self) -> impl Iterator<Item = &Task> {
        self.planned.values().flatten()
    }

    pub fn total_tasks(&self) -> usize {
        self.planned.values().map(Vec::len).sum()
    }

    pub fn issued_fingerprints(&self) -> HashSet<String> {
        self.all_tasks().map(Task::fingerprint).collect()
    }

    pub fn id_allocator(&self) -> TaskIdAllocator {
        TaskIdAllocator::from_issued(self.all_tasks().map(|t| t.id.as_str()))
    }

    pub fn task(&self, id: &str) -> Option<&Task> {
        self.all_tasks().find(|t| t.id == id)
    }

    /// Coverage snapshots, one per completed round.
    pub fn coverage_history(&self) -> Vec<(u32, Vec<CoverageAssessment>)> {
        self.rounds
            .iter()
            .map(|r| (r.round, r.coverage.clone()))
            .collect()
    }

    pub fn round_timed_out(&self, round: u32) -> bool {
        self.timed_out_rounds.contains(&round)
    }

    pub fn task_status(&self, id: &str) -> Option<TaskStatus> {
        self.task(id).map(|t| t.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::TaskError;
    use crate::model::brief::{ScopeItem, ScopeKind};
    use crate::model::result::{Payload, ResearchPayload};
    use crate::model::task::{Priority, TaskKind};

    fn session() -> Session {
        let brief = Brief::new(
            "goal",
            vec![ScopeItem::new("item1", "Topic", ScopeKind::Research)],
        );
        Session::new("s1", brief, 10, Utc::now())
    }

    fn task(id: &str) -> Task {
        Task::new(id.into(), "item1", id, TaskKind::Research, Priority::High)
    }

    #[test]
    fn test_tasks_planned_sets_round() {
        let mut s = session();
        let event = PipelineEvent::TasksPlanned {
            round: 1,
            tasks: vec![task("r1"), task("r2")],
        };
        s.apply(&event, Phase::Executing, Utc::now());
        assert_eq!(s.phase, Phase::Executing);
        assert_eq!(s.current_round, 1);
        assert_eq!(s.total_tasks(), 2);
        assert_eq!(s.outstanding_tasks().len(), 2);
    }

    #[test]
    fn test_first_result_wins() {
        let mut s = session();
        s.apply(
            &PipelineEvent::TasksPlanned {
                round: 1,
                tasks: vec![task("r1")],
            },
            Phase::Executing,
            Utc::now(),
        );
        let t = task("r1");
        let ok = TaskResult::done(
            &t,
            Payload::Research(ResearchPayload::default()),
            vec![],
        );
        assert!(s.record_result(ok));
        assert!(!s.record_result(TaskResult::failed(&t, TaskError::panicked("late"))));
        assert_eq!(s.task_status("r1"), Some(TaskStatus::Done));
        assert!(s.outstanding_tasks().is_empty());
    }

    #[test]
    fn test_failed_then_resumed_clears_error() {
        let mut s = session();
        let err = SessionError {
            code: "collaborator".into(),
            message: "llm down".into(),
            recoverable: true,
        };
        s.apply(
            &PipelineEvent::Failed {
                error: err,
                from: Phase::Review,
            },
            Phase::Failed,
            Utc::now(),
        );
        assert_eq!(s.failed_from, Some(Phase::Review));
        s.apply(
            &PipelineEvent::Resumed { to: Phase::Review },
            Phase::Review,
            Utc::now(),
        );
        assert!(s.error.is_none());
        assert_eq!(s.phase, Phase::Review);
    }

    #[test]
    fn test_allocator_continues_from_planned_tasks() {
        let mut s = session();
        s.apply(
            &PipelineEvent::TasksPlanned {
                round: 1,
                tasks: vec![task("r1"), task("r3")],
            },
            Phase::Executing,
            Utc::now(),
        );
        assert_eq!(s.id_allocator().next_id(TaskKind::Research), "r4");
    }
}
