//! Coverage review: assess scope items, filter follow-up questions, and
//! decide whether another round is worth running.

use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::semantic::SemanticEvaluator;
use crate::errors::PipelineError;
use crate::model::{
    CoverageAssessment, DEFAULT_COVERAGE_TARGET, Decision, DecisionReason, FollowUpQuestion,
    Priority, Relevance, ScopeItem, ScopeKind, Session, Task, TaskKind, TaskResult, fingerprint,
};
use crate::resilience::ResilientInvoker;

const OPERATION_CLASS: &str = "llm_call";
const CHANNEL: &str = "semantic";

/// Quotas and thresholds applied on top of the semantic judgment.
#[derive(Debug, Clone, PartialEq)]
pub struct CoveragePolicy {
    pub max_rounds: u32,
    pub max_tasks_per_round: usize,
    pub max_tasks_per_session: usize,
    /// Target for scope items that do not set their own
    pub coverage_target_percent: f64,
    /// From this round on, medium-relevance questions are dropped
    pub diminishing_returns_round: u32,
}

impl Default for CoveragePolicy {
    fn default() -> Self {
        Self {
            max_rounds: 10,
            max_tasks_per_round: 10,
            max_tasks_per_session: 100,
            coverage_target_percent: DEFAULT_COVERAGE_TARGET,
            diminishing_returns_round: 3,
        }
    }
}

impl CoveragePolicy {
    pub fn target_for(&self, item: &ScopeItem) -> f64 {
        item.target_or(self.coverage_target_percent)
    }

    /// Whether a question of this relevance may become a task in `round`.
    pub fn admits(&self, relevance: Relevance, round: u32) -> bool {
        match relevance {
            Relevance::High => true,
            Relevance::Medium => round < self.diminishing_returns_round,
            Relevance::Low => false,
        }
    }
}

/// Outcome of reviewing one round.
#[derive(Debug, Clone, PartialEq)]
pub struct Review {
    pub round: u32,
    /// One assessment per scope item, in brief order
    pub coverage: Vec<CoverageAssessment>,
    pub decision: Decision,
    pub reason: DecisionReason,
    /// Tasks for the next round; empty unless `decision` is `Continue`
    pub next_tasks: Vec<Task>,
}

/// Coverage of one scope item, with the per-side breakdown for `both` items.
#[derive(Debug, Clone)]
struct ItemCoverage {
    assessment: CoverageAssessment,
    sides: Vec<(TaskKind, CoverageAssessment)>,
}

/// A task that has not been given an id yet.
#[derive(Debug, Clone)]
struct Candidate {
    scope_item_id: String,
    description: String,
    kind: TaskKind,
    priority: Priority,
}

impl Candidate {
    fn fingerprint(&self) -> String {
        fingerprint(&self.scope_item_id, &self.description)
    }
}

pub struct CoverageEvaluator {
    semantic: Arc<dyn SemanticEvaluator>,
    invoker: ResilientInvoker,
    policy: CoveragePolicy,
}

impl CoverageEvaluator {
    pub fn new(
        semantic: Arc<dyn SemanticEvaluator>,
        invoker: ResilientInvoker,
        policy: CoveragePolicy,
    ) -> Self {
        Self {
            semantic,
            invoker,
            policy,
        }
    }

    pub fn policy(&self) -> &CoveragePolicy {
        &self.policy
    }

    /// Review the session's current round.
    ///
    /// Coverage is assessed over the cumulative successful results of every
    /// round so far; follow-up questions come from the current round only.
    pub async fn review(&self, session: &Session) -> Result<Review, PipelineError> {
        let round = session.current_round;
        if round > self.policy.max_rounds {
            return Err(PipelineError::InvariantViolation(format!(
                "round {} exceeds max_rounds {}",
                round, self.policy.max_rounds
            )));
        }

        let successes: Vec<TaskResult> = session
            .cumulative_results()
            .into_iter()
            .filter(TaskResult::is_success)
            .collect();
        let items = self.assess(session, &successes).await?;
        let coverage: Vec<CoverageAssessment> =
            items.iter().map(|c| c.assessment.clone()).collect();

        let short: Vec<(&ScopeItem, &ItemCoverage)> = session
            .brief
            .scope
            .iter()
            .zip(items.iter())
            .filter(|(item, c)| c.assessment.percent < self.policy.target_for(item))
            .collect();

        let done = |reason: DecisionReason| Review {
            round,
            coverage: coverage.clone(),
            decision: Decision::Done,
            reason,
            next_tasks: Vec::new(),
        };

        if short.is_empty() {
            info!(session = %session.id, round, "all scope items reached target");
            return Ok(done(DecisionReason::CoverageMet));
        }
        if round >= self.policy.max_rounds {
            info!(session = %session.id, round, "max rounds reached with coverage short");
            return Ok(done(DecisionReason::MaxRoundsReached));
        }
        let remaining = self
            .policy
            .max_tasks_per_session
            .saturating_sub(session.total_tasks());
        if remaining == 0 {
            info!(session = %session.id, round, "session task budget exhausted");
            return Ok(done(DecisionReason::TaskBudgetExhausted));
        }

        let mut issued = session.issued_fingerprints();
        let questions = self.question_candidates(session, round).await;
        let mut admitted = dedup(questions, &mut issued);
        let gaps = self.gap_candidates(session, &admitted, &short, &issued, round);
        admitted.extend(dedup(gaps, &mut issued));
        admitted.sort_by_key(|c| c.priority);
        admitted.truncate(self.policy.max_tasks_per_round.min(remaining));

        if admitted.is_empty() {
            info!(session = %session.id, round, "coverage short but no new tasks to issue");
            return Ok(done(DecisionReason::NoNewTasks));
        }

        let mut ids = session.id_allocator();
        let next_tasks: Vec<Task> = admitted
            .into_iter()
            .map(|c| {
                Task::new(
                    ids.next_id(c.kind),
                    &c.scope_item_id,
                    &c.description,
                    c.kind,
                    c.priority,
                )
            })
            .collect();
        info!(
            session = %session.id,
            round,
            short_items = short.len(),
            next_tasks = next_tasks.len(),
            "continuing to next round"
        );
        Ok(Review {
            round,
            coverage,
            decision: Decision::Continue,
            reason: DecisionReason::CoverageBelowTarget,
            next_tasks,
        })
    }

    async fn assess(
        &self,
        session: &Session,
        successes: &[TaskResult],
    ) -> Result<Vec<ItemCoverage>, PipelineError> {
        let mut items = Vec::with_capacity(session.brief.scope.len());
        for item in &session.brief.scope {
            let mut sides = Vec::new();
            for &side in TaskKind::for_scope(item.kind) {
                let results: Vec<TaskResult> = successes
                    .iter()
                    .filter(|r| r.scope_item_id == item.id && r.kind == side)
                    .cloned()
                    .collect();
                sides.push((side, self.assess_side(item, side, &results).await?));
            }
            items.push(ItemCoverage {
                assessment: combine(item, &sides),
                sides,
            });
        }
        Ok(items)
    }

    async fn assess_side(
        &self,
        item: &ScopeItem,
        side: TaskKind,
        results: &[TaskResult],
    ) -> Result<CoverageAssessment, PipelineError> {
        if results.is_empty() {
            return Ok(CoverageAssessment::new(&item.id, 0.0));
        }
        let semantic = &self.semantic;
        let mut assessment = self
            .invoker
            .invoke(OPERATION_CLASS, CHANNEL, |_| {
                semantic.assess_coverage(item, side, results)
            })
            .await
            .map_err(|source| PipelineError::Collaborator {
                stage: "coverage assessment",
                source,
            })?
            .normalized();
        assessment.scope_item_id = item.id.clone();
        debug!(
            scope_item = %item.id,
            side = side.as_str(),
            percent = assessment.percent,
            "assessed coverage"
        );
        Ok(assessment)
    }

    /// Turn this round's follow-up questions into candidate tasks.
    async fn question_candidates(&self, session: &Session, round: u32) -> Vec<Candidate> {
        let questions: Vec<FollowUpQuestion> = session
            .results_for_round(round)
            .into_iter()
            .filter(TaskResult::is_success)
            .flat_map(|r| r.follow_ups)
            .collect();

        let mut candidates = Vec::new();
        for question in questions {
            let Some(origin) = session.task(&question.origin_task_id) else {
                warn!(task = %question.origin_task_id, "follow-up from unknown task, dropping");
                continue;
            };
            let relevance = match question.relevance {
                Some(relevance) => relevance,
                None => match self.classify(&question, session).await {
                    Some(relevance) => relevance,
                    None => continue,
                },
            };
            if !self.policy.admits(relevance, round) {
                debug!(question = %question.text, ?relevance, round, "question filtered out");
                continue;
            }
            candidates.push(Candidate {
                scope_item_id: origin.scope_item_id.clone(),
                description: question.text.clone(),
                kind: origin.kind,
                priority: match relevance {
                    Relevance::High => Priority::High,
                    Relevance::Medium => Priority::Medium,
                    Relevance::Low => Priority::Low,
                },
            });
        }
        candidates
    }

    /// Classification failures drop the question instead of failing the review.
    async fn classify(&self, question: &FollowUpQuestion, session: &Session) -> Option<Relevance> {
        let semantic = &self.semantic;
        let brief = &session.brief;
        match self
            .invoker
            .invoke(OPERATION_CLASS, CHANNEL, |_| {
                semantic.classify_question_relevance(question, brief)
            })
            .await
        {
            Ok(relevance) => Some(relevance),
            Err(err) => {
                warn!(question = %question.text, error = %err, "could not classify question, dropping");
                None
            }
        }
    }

    /// Gap tasks for short sides that no question already addresses.
    ///
    /// A gap that was already asked is asked again only when every earlier
    /// attempt failed; an answered gap is not re-issued.
    fn gap_candidates(
        &self,
        session: &Session,
        questions: &[Candidate],
        short: &[(&ScopeItem, &ItemCoverage)],
        issued: &HashSet<String>,
        round: u32,
    ) -> Vec<Candidate> {
        let mut gaps = Vec::new();
        for (item, coverage) in short {
            let target = self.policy.target_for(item);
            for (side, assessment) in &coverage.sides {
                if assessment.percent >= target {
                    continue;
                }
                let addressed = questions
                    .iter()
                    .any(|c| c.scope_item_id == item.id && c.kind == *side);
                if addressed {
                    continue;
                }
                let description = gap_description(item, *side, assessment);
                let mut candidate = Candidate {
                    scope_item_id: item.id.clone(),
                    description,
                    kind: *side,
                    priority: if assessment.percent < target / 2.0 {
                        Priority::High
                    } else {
                        Priority::Medium
                    },
                };
                if issued.contains(&candidate.fingerprint()) {
                    if !all_attempts_failed(session, &candidate) {
                        debug!(
                            scope_item = %item.id,
                            description = %candidate.description,
                            "gap already answered, not re-issuing"
                        );
                        continue;
                    }
                    candidate.description = retry_description(&candidate.description, round);
                }
                gaps.push(candidate);
            }
        }
        gaps
    }
}

fn retry_description(base: &str, round: u32) -> String {
    format!("{} (retry after round {})", base, round)
}

/// True when the gap was attempted and every attempt, retries included, ended failed.
fn all_attempts_failed(session: &Session, candidate: &Candidate) -> bool {
    let base = candidate.fingerprint();
    let retry_prefix = format!("{} (retry after round ", candidate.description);
    let mut attempts = session.all_tasks().filter(|t| {
        t.scope_item_id == candidate.scope_item_id
            && t.kind == candidate.kind
            && (t.fingerprint() == base || t.description.starts_with(&retry_prefix))
    });
    attempts.all(|t| {
        session
            .results
            .get(&t.id)
            .is_some_and(|r| !r.is_success())
    })
}

/// Drop candidates whose fingerprint was already issued, recording the rest.
fn dedup(candidates: Vec<Candidate>, issued: &mut HashSet<String>) -> Vec<Candidate> {
    candidates
        .into_iter()
        .filter(|c| {
            let fresh = issued.insert(c.fingerprint());
            if !fresh {
                debug!(
                    scope_item = %c.scope_item_id,
                    description = %c.description,
                    "dropping duplicate task"
                );
            }
            fresh
        })
        .collect()
}

fn gap_description(item: &ScopeItem, side: TaskKind, assessment: &CoverageAssessment) -> String {
    let subject = match (item.kind, side) {
        (ScopeKind::Both, TaskKind::Data) => format!("{} (data)", item.topic),
        (ScopeKind::Both, TaskKind::Research) => format!("{} (research)", item.topic),
        _ => item.topic.clone(),
    };
    let mut missing: Vec<&str> = Vec::new();
    let mut seen = HashSet::new();
    for aspect in &assessment.missing_aspects {
        let aspect = aspect.trim();
        if !aspect.is_empty() && seen.insert(aspect.to_lowercase()) {
            missing.push(aspect);
        }
    }
    if missing.is_empty() {
        if assessment.percent == 0.0 {
            format!("Cover {}", subject)
        } else {
            format!("Deepen coverage of {}", subject)
        }
    } else {
        format!("Cover {}: {}", subject, missing.join("; "))
    }
}

/// Fold per-side assessments into the item's assessment.
///
/// Single-sided items pass through. A `both` item is only as covered as its
/// weaker side.
fn combine(item: &ScopeItem, sides: &[(TaskKind, CoverageAssessment)]) -> CoverageAssessment {
    let percent = sides
        .iter()
        .map(|(_, a)| a.percent)
        .reduce(f64::min)
        .unwrap_or(0.0);
    let mut covered = Vec::new();
    let mut missing = Vec::new();
    for (_, a) in sides {
        covered.extend(a.covered_aspects.iter().cloned());
        missing.extend(a.missing_aspects.iter().cloned());
    }
    CoverageAssessment::new(&item.id, percent).with_aspects(covered, missing)
}
