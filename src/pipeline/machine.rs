//! The pipeline state machine.
//!
//! Every phase change goes through [`PipelineStateMachine::transition`]:
//! validate against the table, persist as one record, then apply to the
//! in-memory session. A handler error is the only way into `Failed`.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::collaborators::{
    AutoApprove, BriefReviewer, BriefVerdict, LogReport, Planner, ReportCollaborator, ScopePlanner,
};
use super::transitions::{Phase, PipelineEvent};
use crate::coverage::{CoverageEvaluator, CoveragePolicy, SemanticEvaluator};
use crate::errors::{PipelineError, StoreError};
use crate::model::{
    Aggregation, Brief, DEFAULT_COVERAGE_TARGET, Decision, RoundRecord, Session, Task, TaskResult,
    overall_coverage,
};
use crate::resilience::{CircuitBreaker, ResilientInvoker, RetryPolicy};
use crate::round::{ResultSink, RoundEvent, RoundExecutor, WorkerRegistry};
use crate::store::{RecordDraft, SessionStore};

/// Quotas and timeouts for one pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub max_rounds: u32,
    pub max_tasks_per_round: usize,
    pub max_tasks_per_session: usize,
    pub coverage_target_percent: f64,
    pub diminishing_returns_round: u32,
    pub round_timeout: Duration,
    pub max_brief_revisions: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_rounds: 10,
            max_tasks_per_round: 10,
            max_tasks_per_session: 100,
            coverage_target_percent: DEFAULT_COVERAGE_TARGET,
            diminishing_returns_round: 3,
            round_timeout: Duration::from_secs(300),
            max_brief_revisions: 3,
        }
    }
}

impl PipelineConfig {
    pub fn coverage_policy(&self) -> CoveragePolicy {
        CoveragePolicy {
            max_rounds: self.max_rounds,
            max_tasks_per_round: self.max_tasks_per_round,
            max_tasks_per_session: self.max_tasks_per_session,
            coverage_target_percent: self.coverage_target_percent,
            diminishing_returns_round: self.diminishing_returns_round,
        }
    }
}

/// Assembles a [`PipelineStateMachine`] from its collaborators.
pub struct PipelineBuilder {
    store: Arc<SessionStore>,
    workers: WorkerRegistry,
    semantic: Arc<dyn SemanticEvaluator>,
    reviewer: Arc<dyn BriefReviewer>,
    planner: Arc<dyn Planner>,
    report: Arc<dyn ReportCollaborator>,
    config: PipelineConfig,
    retry: RetryPolicy,
    breaker: Option<Arc<CircuitBreaker>>,
    event_tx: Option<mpsc::Sender<RoundEvent>>,
}

impl PipelineBuilder {
    pub fn new(
        store: Arc<SessionStore>,
        workers: WorkerRegistry,
        semantic: Arc<dyn SemanticEvaluator>,
    ) -> Self {
        Self {
            store,
            workers,
            semantic,
            reviewer: Arc::new(AutoApprove),
            planner: Arc::new(ScopePlanner),
            report: Arc::new(LogReport),
            config: PipelineConfig::default(),
            retry: RetryPolicy::default(),
            breaker: None,
            event_tx: None,
        }
    }

    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn reviewer(mut self, reviewer: Arc<dyn BriefReviewer>) -> Self {
        self.reviewer = reviewer;
        self
    }

    pub fn planner(mut self, planner: Arc<dyn Planner>) -> Self {
        self.planner = planner;
        self
    }

    pub fn report(mut self, report: Arc<dyn ReportCollaborator>) -> Self {
        self.report = report;
        self
    }

    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Share circuit state with other pipelines. Without this each pipeline
    /// gets its own breaker registry.
    pub fn breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    pub fn event_channel(mut self, tx: mpsc::Sender<RoundEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn build(self) -> PipelineStateMachine {
        let breaker = self.breaker.unwrap_or_default();
        let invoker = ResilientInvoker::new(self.retry, breaker);
        let mut executor = RoundExecutor::new(Arc::new(self.workers), invoker.clone())
            .with_max_tasks(self.config.max_tasks_per_round);
        if let Some(tx) = self.event_tx {
            executor = executor.with_event_channel(tx);
        }
        let coverage =
            CoverageEvaluator::new(self.semantic, invoker.clone(), self.config.coverage_policy());
        PipelineStateMachine {
            store: self.store,
            executor,
            coverage,
            reviewer: self.reviewer,
            planner: self.planner,
            report: self.report,
            invoker,
            config: self.config,
        }
    }
}

/// Persists each task result the moment the executor finalises it.
struct StoreSink<'a> {
    store: &'a SessionStore,
    session_id: &'a str,
    round: u32,
}

#[async_trait]
impl ResultSink for StoreSink<'_> {
    async fn accept(&self, result: &TaskResult) -> Result<(), PipelineError> {
        let draft = RecordDraft::task_result(result, Phase::Executing, self.round)
            .map_err(StoreError::from)?;
        self.store.save(self.session_id, draft).await?;
        Ok(())
    }
}

pub struct PipelineStateMachine {
    store: Arc<SessionStore>,
    executor: RoundExecutor,
    coverage: CoverageEvaluator,
    reviewer: Arc<dyn BriefReviewer>,
    planner: Arc<dyn Planner>,
    report: Arc<dyn ReportCollaborator>,
    invoker: ResilientInvoker,
    config: PipelineConfig,
}

impl PipelineStateMachine {
    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn invoker(&self) -> &ResilientInvoker {
        &self.invoker
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Validate the brief and persist a new session in `Created`.
    pub async fn start(&self, brief: Brief) -> Result<Session, PipelineError> {
        brief.validate()?;
        let id = Uuid::new_v4().to_string();
        let session = Session::new(&id, brief, self.config.max_rounds, Utc::now());
        self.store.create(&session).await?;
        info!(session = %id, scope_items = session.brief.scope.len(), "session created");
        Ok(session)
    }

    /// Drive a session to `Done` or `Failed`.
    ///
    /// Returns the final session either way; `Err` means the session could not
    /// be loaded or its failure could not be persisted.
    pub async fn run(&self, session_id: &str) -> Result<Session, PipelineError> {
        let mut session = self.store.restore(session_id).await?;
        if session.phase.is_terminal() {
            return Ok(session);
        }
        self.drive(&mut session).await?;
        Ok(session)
    }

    /// Continue a session after a crash or a recoverable failure.
    ///
    /// Re-enters the interrupted phase; task results already persisted are
    /// never produced again.
    pub async fn resume(&self, session_id: &str) -> Result<Session, PipelineError> {
        let mut session = self.store.restore(session_id).await?;
        match session.phase {
            Phase::Done => {
                return Err(PipelineError::SessionTerminal {
                    id: session.id,
                    phase: Phase::Done.to_string(),
                });
            }
            Phase::Failed => {
                let recoverable = session.error.as_ref().is_some_and(|e| e.recoverable);
                let Some(to) = session.failed_from.filter(|_| recoverable) else {
                    let message = session
                        .error
                        .as_ref()
                        .map(|e| e.message.clone())
                        .unwrap_or_else(|| "no error recorded".to_string());
                    return Err(PipelineError::NotResumable {
                        id: session.id,
                        message,
                    });
                };
                info!(session = %session.id, to = %to, "resuming failed session");
                self.transition(&mut session, PipelineEvent::Resumed { to })
                    .await?;
            }
            phase => {
                info!(session = %session.id, phase = %phase, "resuming interrupted session");
            }
        }
        self.drive(&mut session).await?;
        Ok(session)
    }

    /// Validate, persist, then apply one event.
    pub async fn transition(
        &self,
        session: &mut Session,
        event: PipelineEvent,
    ) -> Result<(), PipelineError> {
        let from = session.phase;
        let to = event.target(from)?;
        let round = match &event {
            PipelineEvent::TasksPlanned { round, .. } => *round,
            PipelineEvent::Continue { next_round, .. } => *next_round,
            _ => session.current_round,
        };
        let draft = RecordDraft::transition(&event, to, round).map_err(StoreError::from)?;
        self.store.save(&session.id, draft).await?;
        session.apply(&event, to, Utc::now());
        info!(
            session = %session.id,
            event = event.name(),
            from = %from,
            to = %to,
            round = session.current_round,
            "transition"
        );
        Ok(())
    }

    async fn drive(&self, session: &mut Session) -> Result<(), PipelineError> {
        if let Err(err) = self.advance(session).await {
            self.fail(session, err).await?;
        }
        Ok(())
    }

    async fn fail(&self, session: &mut Session, err: PipelineError) -> Result<(), PipelineError> {
        error!(
            session = %session.id,
            phase = %session.phase,
            code = err.code(),
            recoverable = err.is_recoverable(),
            error = %err,
            "session failed"
        );
        if session.phase.is_terminal() {
            return Err(err);
        }
        let event = PipelineEvent::Failed {
            error: err.to_session_error(),
            from: session.phase,
        };
        self.transition(session, event).await
    }

    async fn advance(&self, session: &mut Session) -> Result<(), PipelineError> {
        while matches!(
            session.phase,
            Phase::Created
                | Phase::InitialResearch
                | Phase::BriefDraft
                | Phase::BriefApproved
                | Phase::Planning
        ) {
            self.prepare(session).await?;
        }

        let first = session.current_round.max(1);
        for round in first..=self.config.max_rounds {
            if session.current_round != round {
                return Err(PipelineError::InvariantViolation(format!(
                    "session is at round {} but the loop expected {}",
                    session.current_round, round
                )));
            }
            if session.phase == Phase::Executing {
                self.execute_round(session).await?;
            }
            if session.phase == Phase::Review {
                self.review_round(session).await?;
            }
            if session.phase != Phase::Executing {
                break;
            }
        }
        if matches!(session.phase, Phase::Executing | Phase::Review) {
            return Err(PipelineError::InvariantViolation(format!(
                "round loop ended in {} after {} rounds",
                session.phase, self.config.max_rounds
            )));
        }

        if session.phase == Phase::Aggregating {
            self.aggregate(session).await?;
        }
        if session.phase == Phase::Reporting {
            self.report(session).await?;
        }
        Ok(())
    }

    /// One step of the phases before the round loop.
    async fn prepare(&self, session: &mut Session) -> Result<(), PipelineError> {
        let event = match session.phase {
            Phase::Created => PipelineEvent::Started {
                brief: session.brief.clone(),
            },
            Phase::InitialResearch => {
                let reviewer = &self.reviewer;
                let brief = &session.brief;
                let notes = self
                    .invoker
                    .invoke("llm_call", "reviewer", |_| reviewer.initial_research(brief))
                    .await
                    .map_err(|source| PipelineError::Collaborator {
                        stage: "initial research",
                        source,
                    })?;
                PipelineEvent::ResearchCompleted { notes }
            }
            Phase::BriefDraft => self.review_brief(session).await?,
            Phase::BriefApproved => PipelineEvent::PlanningStarted,
            Phase::Planning => {
                let tasks = self.plan(session)?;
                PipelineEvent::TasksPlanned { round: 1, tasks }
            }
            phase => {
                return Err(PipelineError::InvariantViolation(format!(
                    "no preparation step for {}",
                    phase
                )));
            }
        };
        self.transition(session, event).await
    }

    async fn review_brief(&self, session: &Session) -> Result<PipelineEvent, PipelineError> {
        let reviewer = &self.reviewer;
        let brief = &session.brief;
        let notes = &session.research_notes;
        let verdict = self
            .invoker
            .invoke("llm_call", "reviewer", |_| reviewer.review(brief, notes))
            .await
            .map_err(|source| PipelineError::Collaborator {
                stage: "brief review",
                source,
            })?;
        match verdict {
            BriefVerdict::Approve => {
                brief.validate()?;
                Ok(PipelineEvent::BriefApproved {
                    brief: brief.clone(),
                })
            }
            BriefVerdict::Revise(edited) => {
                let revisions = brief.version.saturating_sub(1);
                if revisions >= self.config.max_brief_revisions {
                    return Err(PipelineError::InvariantViolation(format!(
                        "brief still unapproved after {} revisions",
                        revisions
                    )));
                }
                let next = brief.revised(edited);
                next.validate()?;
                info!(session = %session.id, version = next.version, "brief revised");
                Ok(PipelineEvent::BriefRevised { brief: next })
            }
        }
    }

    fn plan(&self, session: &Session) -> Result<Vec<Task>, PipelineError> {
        let mut ids = session.id_allocator();
        let mut seen = HashSet::new();
        let mut tasks: Vec<Task> = self
            .planner
            .plan(&session.brief, &mut ids)
            .into_iter()
            .filter(|t| session.brief.scope_item(&t.scope_item_id).is_some())
            .filter(|t| seen.insert(t.fingerprint()))
            .collect();
        tasks.sort_by_key(|t| t.priority);
        let limit = self
            .config
            .max_tasks_per_round
            .min(self.config.max_tasks_per_session);
        if tasks.len() > limit {
            warn!(
                session = %session.id,
                planned = tasks.len(),
                limit,
                "initial plan exceeds the round quota, truncating"
            );
            tasks.truncate(limit);
        }
        if tasks.is_empty() {
            return Err(PipelineError::InvariantViolation(
                "planner produced no tasks".to_string(),
            ));
        }
        Ok(tasks)
    }

    async fn execute_round(&self, session: &mut Session) -> Result<(), PipelineError> {
        let round = session.current_round;
        if round == 0 || round > self.config.max_rounds {
            return Err(PipelineError::InvariantViolation(format!(
                "round {} outside 1..={}",
                round, self.config.max_rounds
            )));
        }
        let outstanding = session.outstanding_tasks();
        let mut had_timeout = false;
        if outstanding.is_empty() {
            info!(session = %session.id, round, "all results already persisted");
        } else {
            if outstanding.len() < session.tasks_for_round(round).len() {
                info!(
                    session = %session.id,
                    round,
                    outstanding = outstanding.len(),
                    "re-running only tasks without a persisted result"
                );
            }
            let sink = StoreSink {
                store: &self.store,
                session_id: &session.id,
                round,
            };
            let outcome = match self
                .executor
                .run_round_with(
                    &session.id,
                    round,
                    &outstanding,
                    self.config.round_timeout,
                    &sink,
                )
                .await
            {
                Ok(outcome) => outcome,
                Err(err @ PipelineError::TaskFatal { .. }) => {
                    // Every result of the round already reached the store.
                    *session = self.store.restore(&session.id).await?;
                    return Err(err);
                }
                Err(err) => return Err(err),
            };
            had_timeout = outcome.had_timeout;
            for result in outcome.results {
                session.record_result(result);
            }
        }
        self.transition(session, PipelineEvent::RoundExecuted { round, had_timeout })
            .await
    }

    async fn review_round(&self, session: &mut Session) -> Result<(), PipelineError> {
        let round = session.current_round;
        let review = self.coverage.review(session).await?;
        let record = Box::new(RoundRecord {
            round,
            tasks: session.tasks_for_round(round).to_vec(),
            results: session.results_for_round(round),
            coverage: review.coverage,
            decision: review.decision,
            reason: review.reason,
            had_timeout: session.round_timed_out(round),
        });
        let event = match review.decision {
            Decision::Continue => {
                let next_round = round + 1;
                if next_round > self.config.max_rounds {
                    return Err(PipelineError::InvariantViolation(format!(
                        "round {} exceeds max_rounds {}",
                        next_round, self.config.max_rounds
                    )));
                }
                let total = session.total_tasks() + review.next_tasks.len();
                if review.next_tasks.len() > self.config.max_tasks_per_round
                    || total > self.config.max_tasks_per_session
                {
                    return Err(PipelineError::InvariantViolation(format!(
                        "round {} would issue {} tasks ({} in session)",
                        next_round,
                        review.next_tasks.len(),
                        total
                    )));
                }
                PipelineEvent::Continue {
                    record,
                    next_round,
                    tasks: review.next_tasks,
                }
            }
            Decision::Done => PipelineEvent::Completed { record },
        };
        self.transition(session, event).await
    }

    async fn aggregate(&self, session: &mut Session) -> Result<(), PipelineError> {
        let last = session.rounds.last().ok_or_else(|| {
            PipelineError::InvariantViolation("aggregating without a reviewed round".to_string())
        })?;
        let cumulative = session.cumulative_results();
        let failed_tasks = cumulative.iter().filter(|r| !r.is_success()).count();
        let aggregation = Aggregation {
            overall_coverage: overall_coverage(&last.coverage),
            coverage: last.coverage.clone(),
            termination: last.reason,
            rounds: last.round,
            total_tasks: session.total_tasks(),
            failed_tasks,
            results: cumulative.into_iter().filter(TaskResult::is_success).collect(),
        };
        info!(
            session = %session.id,
            overall_coverage = aggregation.overall_coverage,
            rounds = aggregation.rounds,
            termination = aggregation.termination.as_str(),
            "research aggregated"
        );
        self.transition(
            session,
            PipelineEvent::Aggregated {
                aggregation: Box::new(aggregation),
            },
        )
        .await
    }

    async fn report(&self, session: &mut Session) -> Result<(), PipelineError> {
        let aggregation = session.aggregation.as_ref().ok_or_else(|| {
            PipelineError::InvariantViolation("reporting without an aggregation".to_string())
        })?;
        let report = &self.report;
        let id = session.id.as_str();
        self.invoker
            .invoke("report", "report", |_| report.consume(id, aggregation))
            .await
            .map_err(|source| PipelineError::Collaborator {
                stage: "report",
                source,
            })?;
        self.transition(session, PipelineEvent::Reported).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::CallError;
    use crate::model::{
        CoverageAssessment, DataPayload, DecisionReason, FollowUpQuestion, Payload, Priority,
        Relevance, ResearchPayload, ScopeItem, ScopeKind, TaskKind,
    };
    use crate::resilience::RetryConfig;
    use crate::round::{TaskContext, Worker, WorkerOutput};
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct RecordingWorker {
        kind: TaskKind,
        failing: Vec<&'static str>,
        calls: Mutex<Vec<String>>,
    }

    impl RecordingWorker {
        fn new(kind: TaskKind, failing: Vec<&'static str>) -> Arc<Self> {
            Arc::new(Self {
                kind,
                failing,
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Worker for RecordingWorker {
        fn kind(&self) -> TaskKind {
            self.kind
        }

        async fn execute(&self, task: &Task, _ctx: &TaskContext) -> Result<WorkerOutput, CallError> {
            self.calls.lock().unwrap().push(task.id.clone());
            if self.failing.contains(&task.id.as_str()) {
                return Err(CallError::invalid_input("source rejected the query"));
            }
            let payload = match self.kind {
                TaskKind::Data => Payload::Data(DataPayload {
                    summary: task.description.clone(),
                    ..Default::default()
                }),
                TaskKind::Research => Payload::Research(ResearchPayload {
                    summary: task.description.clone(),
                    ..Default::default()
                }),
            };
            Ok(WorkerOutput::new(payload))
        }
    }

    /// Scores each scope item from a fixed table; `broken` makes every call fail.
    struct TableEvaluator {
        percents: HashMap<&'static str, f64>,
        broken: AtomicBool,
        failure: fn() -> CallError,
    }

    impl TableEvaluator {
        fn new(percents: &[(&'static str, f64)]) -> Arc<Self> {
            Arc::new(Self {
                percents: percents.iter().copied().collect(),
                broken: AtomicBool::new(false),
                failure: || CallError::network("connection reset"),
            })
        }

        fn failing_with(percents: &[(&'static str, f64)], failure: fn() -> CallError) -> Arc<Self> {
            Arc::new(Self {
                percents: percents.iter().copied().collect(),
                broken: AtomicBool::new(true),
                failure,
            })
        }
    }

    #[async_trait]
    impl SemanticEvaluator for TableEvaluator {
        async fn assess_coverage(
            &self,
            item: &ScopeItem,
            _side: TaskKind,
            _results: &[TaskResult],
        ) -> Result<CoverageAssessment, CallError> {
            if self.broken.load(Ordering::SeqCst) {
                return Err((self.failure)());
            }
            let percent = self.percents.get(item.id.as_str()).copied().unwrap_or(0.0);
            Ok(CoverageAssessment::new(&item.id, percent))
        }

        async fn classify_question_relevance(
            &self,
            _question: &FollowUpQuestion,
            _brief: &Brief,
        ) -> Result<Relevance, CallError> {
            Ok(Relevance::Low)
        }
    }

    struct AlwaysRevise;

    #[async_trait]
    impl BriefReviewer for AlwaysRevise {
        async fn review(&self, brief: &Brief, _notes: &[String]) -> Result<BriefVerdict, CallError> {
            Ok(BriefVerdict::Revise(brief.clone()))
        }
    }

    struct CountingReport(Mutex<Vec<f64>>);

    #[async_trait]
    impl ReportCollaborator for CountingReport {
        async fn consume(&self, _session_id: &str, aggregation: &Aggregation) -> Result<(), CallError> {
            self.0.lock().unwrap().push(aggregation.overall_coverage);
            Ok(())
        }
    }

    fn two_item_brief() -> Brief {
        Brief::new(
            "Assess the market",
            vec![
                ScopeItem::new("size", "Market size", ScopeKind::Data),
                ScopeItem::new("rules", "Regulation", ScopeKind::Research),
            ],
        )
    }

    struct Fixture {
        machine: PipelineStateMachine,
        data: Arc<RecordingWorker>,
        research: Arc<RecordingWorker>,
    }

    fn fixture(
        failing: Vec<&'static str>,
        semantic: Arc<dyn SemanticEvaluator>,
        configure: impl FnOnce(PipelineBuilder) -> PipelineBuilder,
    ) -> Fixture {
        let data = RecordingWorker::new(TaskKind::Data, failing.clone());
        let research = RecordingWorker::new(TaskKind::Research, failing);
        let workers = WorkerRegistry::new()
            .with(data.clone())
            .with(research.clone());
        let builder = PipelineBuilder::new(Arc::new(SessionStore::in_memory()), workers, semantic)
            .retry_policy(RetryPolicy::uniform(RetryConfig::new(1, 1, 1)));
        Fixture {
            machine: configure(builder).build(),
            data,
            research,
        }
    }

    #[tokio::test]
    async fn test_two_item_scenario_reaches_done() {
        let report = Arc::new(CountingReport(Mutex::new(Vec::new())));
        let fx = fixture(
            vec!["r1"],
            TableEvaluator::new(&[("size", 90.0), ("rules", 85.0)]),
            |b| b.report(report.clone()),
        );
        let session = fx.machine.start(two_item_brief()).await.unwrap();
        let session = fx.machine.run(&session.id).await.unwrap();

        assert_eq!(session.phase, Phase::Done);
        assert_eq!(session.current_round, 2);
        assert_eq!(session.rounds.len(), 2);

        let first = &session.rounds[0];
        assert_eq!(first.decision, Decision::Continue);
        assert_eq!(first.min_coverage(), Some(0.0));
        let round_two: Vec<_> = session
            .tasks_for_round(2)
            .iter()
            .map(|t| (t.id.as_str(), t.scope_item_id.as_str()))
            .collect();
        assert_eq!(round_two, vec![("r2", "rules")]);

        let aggregation = session.aggregation.as_ref().unwrap();
        assert_eq!(aggregation.overall_coverage, 87.5);
        assert_eq!(aggregation.termination, DecisionReason::CoverageMet);
        assert_eq!(aggregation.total_tasks, 3);
        assert_eq!(aggregation.failed_tasks, 1);
        assert_eq!(aggregation.results.len(), 2);
        assert_eq!(*report.0.lock().unwrap(), vec![87.5]);

        assert_eq!(fx.data.calls(), vec!["d1"]);
        assert_eq!(fx.research.calls(), vec!["r1", "r2"]);
    }

    #[tokio::test]
    async fn test_store_matches_in_memory_session() {
        let fx = fixture(
            vec!["r1"],
            TableEvaluator::new(&[("size", 90.0), ("rules", 85.0)]),
            |b| b,
        );
        let session = fx.machine.start(two_item_brief()).await.unwrap();
        let session = fx.machine.run(&session.id).await.unwrap();

        let header = fx.machine.store().header(&session.id).await.unwrap();
        assert_eq!(header.phase, Phase::Done);
        assert_eq!(header.current_round, 2);

        let restored = fx.machine.store().restore(&session.id).await.unwrap();
        assert_eq!(restored.phase, session.phase);
        assert_eq!(restored.planned, session.planned);
        assert_eq!(restored.results, session.results);
        assert_eq!(restored.coverage_history(), session.coverage_history());
    }

    #[tokio::test]
    async fn test_resume_skips_persisted_results() {
        let fx = fixture(
            vec![],
            TableEvaluator::new(&[("size", 90.0), ("rules", 85.0)]),
            |b| b,
        );
        let brief = two_item_brief();
        let mut session = fx.machine.start(brief.clone()).await.unwrap();
        let d1 = Task::new("d1".into(), "size", "Collect data on Market size", TaskKind::Data, Priority::High);
        let r1 = Task::new("r1".into(), "rules", "Research Regulation", TaskKind::Research, Priority::High);
        for event in [
            PipelineEvent::Started { brief: brief.clone() },
            PipelineEvent::ResearchCompleted { notes: vec![] },
            PipelineEvent::BriefApproved { brief },
            PipelineEvent::PlanningStarted,
            PipelineEvent::TasksPlanned {
                round: 1,
                tasks: vec![d1.clone(), r1],
            },
        ] {
            fx.machine.transition(&mut session, event).await.unwrap();
        }
        // d1 finished before the process went away.
        let earlier = TaskResult::done(
            &d1,
            Payload::Data(DataPayload {
                summary: "persisted before the crash".into(),
                ..Default::default()
            }),
            vec![],
        );
        let draft = RecordDraft::task_result(&earlier, Phase::Executing, 1).unwrap();
        fx.machine.store().save(&session.id, draft).await.unwrap();

        let session = fx.machine.resume(&session.id).await.unwrap();
        assert_eq!(session.phase, Phase::Done);
        assert!(fx.data.calls().is_empty());
        assert_eq!(fx.research.calls(), vec!["r1"]);
        let kept = &session.results["d1"];
        assert_eq!(
            kept.payload.as_ref().map(Payload::summary),
            Some("persisted before the crash")
        );
    }

    #[tokio::test]
    async fn test_transient_collaborator_failure_is_resumable() {
        let semantic = TableEvaluator::failing_with(&[("size", 90.0), ("rules", 85.0)], || {
            CallError::network("connection reset")
        });
        let fx = fixture(vec![], semantic.clone(), |b| b);
        let session = fx.machine.start(two_item_brief()).await.unwrap();
        let failed = fx.machine.run(&session.id).await.unwrap();

        assert_eq!(failed.phase, Phase::Failed);
        assert_eq!(failed.failed_from, Some(Phase::Review));
        let error = failed.error.as_ref().unwrap();
        assert_eq!(error.code, "collaborator");
        assert!(error.recoverable);
        assert_eq!(
            fx.machine.store().header(&session.id).await.unwrap().error,
            failed.error
        );

        semantic.broken.store(false, Ordering::SeqCst);
        let resumed = fx.machine.resume(&session.id).await.unwrap();
        assert_eq!(resumed.phase, Phase::Done);
        assert!(resumed.error.is_none());
        // The round was already executed; resuming only re-ran the review.
        assert_eq!(fx.data.calls(), vec!["d1"]);
        assert_eq!(fx.research.calls(), vec!["r1"]);
    }

    #[tokio::test]
    async fn test_permanent_collaborator_failure_is_not_resumable() {
        let fx = fixture(
            vec![],
            TableEvaluator::failing_with(&[], || CallError::auth("key revoked")),
            |b| b,
        );
        let session = fx.machine.start(two_item_brief()).await.unwrap();
        let failed = fx.machine.run(&session.id).await.unwrap();
        assert_eq!(failed.phase, Phase::Failed);
        assert!(!failed.error.as_ref().unwrap().recoverable);

        let err = fx.machine.resume(&session.id).await.unwrap_err();
        assert!(matches!(err, PipelineError::NotResumable { .. }));
    }

    struct FullDiskWorker;

    #[async_trait]
    impl Worker for FullDiskWorker {
        fn kind(&self) -> TaskKind {
            TaskKind::Data
        }

        async fn execute(&self, _task: &Task, _ctx: &TaskContext) -> Result<WorkerOutput, CallError> {
            Err(CallError::storage("no space left on device"))
        }
    }

    #[tokio::test]
    async fn test_worker_system_error_fails_session() {
        let research = RecordingWorker::new(TaskKind::Research, vec![]);
        let workers = WorkerRegistry::new()
            .with(Arc::new(FullDiskWorker))
            .with(research.clone());
        let machine = PipelineBuilder::new(
            Arc::new(SessionStore::in_memory()),
            workers,
            TableEvaluator::new(&[("size", 90.0), ("rules", 90.0)]),
        )
        .retry_policy(RetryPolicy::uniform(RetryConfig::new(3, 1, 1)))
        .build();

        let session = machine.start(two_item_brief()).await.unwrap();
        let failed = machine.run(&session.id).await.unwrap();

        assert_eq!(failed.phase, Phase::Failed);
        assert_eq!(failed.failed_from, Some(Phase::Executing));
        let error = failed.error.as_ref().unwrap();
        assert_eq!(error.code, "system");
        assert!(!error.recoverable);
        // The healthy task still ran and both results were kept.
        assert_eq!(research.calls(), vec!["r1"]);
        assert!(failed.results["r1"].is_success());
        assert!(!failed.results["d1"].is_success());

        let restored = machine.store().restore(&session.id).await.unwrap();
        assert_eq!(restored.results, failed.results);
        let err = machine.resume(&session.id).await.unwrap_err();
        assert!(matches!(err, PipelineError::NotResumable { .. }));
    }

    #[tokio::test]
    async fn test_max_rounds_forces_done() {
        let config = PipelineConfig {
            max_rounds: 2,
            ..Default::default()
        };
        let fx = fixture(
            vec![],
            TableEvaluator::new(&[("size", 10.0), ("rules", 10.0)]),
            |b| b.config(config),
        );
        let session = fx.machine.start(two_item_brief()).await.unwrap();
        let session = fx.machine.run(&session.id).await.unwrap();

        assert_eq!(session.phase, Phase::Done);
        assert_eq!(session.current_round, 2);
        let aggregation = session.aggregation.as_ref().unwrap();
        assert_eq!(aggregation.termination, DecisionReason::MaxRoundsReached);
        assert_eq!(aggregation.overall_coverage, 10.0);
        assert!(session.tasks_for_round(3).is_empty());
    }

    #[tokio::test]
    async fn test_brief_revisions_are_bounded() {
        let fx = fixture(vec![], TableEvaluator::new(&[]), |b| {
            b.reviewer(Arc::new(AlwaysRevise))
        });
        let session = fx.machine.start(two_item_brief()).await.unwrap();
        let session = fx.machine.run(&session.id).await.unwrap();

        assert_eq!(session.phase, Phase::Failed);
        assert_eq!(session.failed_from, Some(Phase::BriefDraft));
        assert_eq!(session.brief.version, 4);
        assert_eq!(session.error.as_ref().unwrap().code, "invariant_violation");
        assert!(fx.data.calls().is_empty());
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_brief() {
        let fx = fixture(vec![], TableEvaluator::new(&[]), |b| b);
        let err = fx.machine.start(Brief::new("goal", vec![])).await.unwrap_err();
        assert!(matches!(err, PipelineError::InvalidBrief(_)));
        assert!(fx.machine.store().list_sessions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_done_session_cannot_resume() {
        let fx = fixture(
            vec![],
            TableEvaluator::new(&[("size", 90.0), ("rules", 90.0)]),
            |b| b,
        );
        let session = fx.machine.start(two_item_brief()).await.unwrap();
        let done = fx.machine.run(&session.id).await.unwrap();
        assert_eq!(done.phase, Phase::Done);
        assert_eq!(done.rounds.len(), 1);
        let records = fx.machine.store().header(&session.id).await.unwrap().record_count;

        let err = fx.machine.resume(&session.id).await.unwrap_err();
        assert!(matches!(err, PipelineError::SessionTerminal { .. }));
        // Running a finished session is a no-op.
        let again = fx.machine.run(&session.id).await.unwrap();
        assert_eq!(again.phase, Phase::Done);
        let header = fx.machine.store().header(&session.id).await.unwrap();
        assert_eq!(header.record_count, records);
    }

    #[tokio::test]
    async fn test_transition_rejects_illegal_event() {
        let fx = fixture(vec![], TableEvaluator::new(&[]), |b| b);
        let mut session = fx.machine.start(two_item_brief()).await.unwrap();
        let err = fx
            .machine
            .transition(&mut session, PipelineEvent::Reported)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidTransition { .. }));
        assert_eq!(session.phase, Phase::Created);
        let header = fx.machine.store().header(&session.id).await.unwrap();
        assert_eq!(header.record_count, 1);
    }
}
