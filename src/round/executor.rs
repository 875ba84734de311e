//! Concurrent execution of one round of tasks under a deadline.
//!
//! Every task runs in its own tokio task, wrapped independently in the
//! resilience layer with the worker kind as the breaker channel. A failure,
//! panic or timeout only ever affects the task it happened in. The executor
//! fails on invariant violations, when the result sink (the session store)
//! fails, or when a worker reports a system-class error; in the last case
//! every other task is still finalised first.

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::worker::{TaskContext, WorkerRegistry};
use crate::errors::{InvokeError, PipelineError, TaskError};
use crate::model::{Task, TaskResult, TaskStatus};
use crate::resilience::ResilientInvoker;

/// Default per-round task quota.
pub const DEFAULT_MAX_TASKS_PER_ROUND: usize = 10;

/// Progress events emitted while a round runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RoundEvent {
    Started {
        round: u32,
        task_ids: Vec<String>,
    },
    TaskFinished {
        round: u32,
        task_id: String,
        status: TaskStatus,
    },
    DeadlinePassed {
        round: u32,
        outstanding: Vec<String>,
    },
    Finished {
        round: u32,
        succeeded: usize,
        failed: usize,
        had_timeout: bool,
    },
}

/// Receives each task result as soon as it is final.
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn accept(&self, result: &TaskResult) -> Result<(), PipelineError>;
}

/// Sink that keeps nothing; results are still returned in the outcome.
pub struct DiscardSink;

#[async_trait]
impl ResultSink for DiscardSink {
    async fn accept(&self, _result: &TaskResult) -> Result<(), PipelineError> {
        Ok(())
    }
}

/// Results of a round, one per submitted task, in submission order.
#[derive(Debug, Clone, PartialEq)]
pub struct RoundOutcome {
    pub round: u32,
    pub results: Vec<TaskResult>,
    pub had_timeout: bool,
}

impl RoundOutcome {
    pub fn result(&self, task_id: &str) -> Option<&TaskResult> {
        self.results.iter().find(|r| r.task_id == task_id)
    }

    pub fn failed_count(&self) -> usize {
        self.results.iter().filter(|r| !r.is_success()).count()
    }
}

pub struct RoundExecutor {
    workers: Arc<WorkerRegistry>,
    invoker: ResilientInvoker,
    max_tasks_per_round: usize,
    event_tx: Option<mpsc::Sender<RoundEvent>>,
}

impl RoundExecutor {
    pub fn new(workers: Arc<WorkerRegistry>, invoker: ResilientInvoker) -> Self {
        Self {
            workers,
            invoker,
            max_tasks_per_round: DEFAULT_MAX_TASKS_PER_ROUND,
            event_tx: None,
        }
    }

    pub fn with_max_tasks(mut self, max: usize) -> Self {
        self.max_tasks_per_round = max;
        self
    }

    /// Set the event channel for progress updates.
    pub fn with_event_channel(mut self, tx: mpsc::Sender<RoundEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    async fn emit_event(&self, event: RoundEvent) {
        if let Some(ref tx) = self.event_tx {
            tx.send(event).await.ok();
        }
    }

    fn check_tasks(&self, round: u32, tasks: &[Task]) -> Result<(), PipelineError> {
        if tasks.len() > self.max_tasks_per_round {
            return Err(PipelineError::InvariantViolation(format!(
                "round {} has {} tasks, limit is {}",
                round,
                tasks.len(),
                self.max_tasks_per_round
            )));
        }
        let mut seen = HashSet::new();
        for task in tasks {
            if !seen.insert(task.id.as_str()) {
                return Err(PipelineError::InvariantViolation(format!(
                    "task id {} submitted twice in round {}",
                    task.id, round
                )));
            }
        }
        Ok(())
    }

    /// Run `tasks` concurrently and return their results once all are final
    /// or `timeout` has passed.
    pub async fn run_round(
        &self,
        session_id: &str,
        round: u32,
        tasks: &[Task],
        timeout: Duration,
    ) -> Result<RoundOutcome, PipelineError> {
        self.run_round_with(session_id, round, tasks, timeout, &DiscardSink)
            .await
    }

    /// Like [`run_round`](Self::run_round), handing every result to `sink`
    /// the moment it is final.
    pub async fn run_round_with(
        &self,
        session_id: &str,
        round: u32,
        tasks: &[Task],
        timeout: Duration,
        sink: &dyn ResultSink,
    ) -> Result<RoundOutcome, PipelineError> {
        self.check_tasks(round, tasks)?;
        let deadline = Instant::now() + timeout;
        let cancel = CancellationToken::new();

        info!(
            session = %session_id,
            round,
            tasks = tasks.len(),
            timeout_secs = timeout.as_secs(),
            "round started"
        );
        self.emit_event(RoundEvent::Started {
            round,
            task_ids: tasks.iter().map(|t| t.id.clone()).collect(),
        })
        .await;

        let mut set = JoinSet::new();
        let mut pending: HashMap<tokio::task::Id, &Task> = HashMap::new();
        for task in tasks {
            let ctx = TaskContext {
                session_id: session_id.to_string(),
                round,
                cancel: cancel.child_token(),
            };
            let handle = set.spawn(run_task(
                self.workers.clone(),
                self.invoker.clone(),
                task.clone(),
                ctx,
            ));
            pending.insert(handle.id(), task);
        }

        let mut finished: HashMap<String, TaskResult> = HashMap::with_capacity(tasks.len());
        let mut fatal: Option<(String, InvokeError)> = None;
        let mut had_timeout = false;
        loop {
            let joined = match tokio::time::timeout_at(deadline, set.join_next_with_id()).await {
                Ok(Some(joined)) => joined,
                Ok(None) => break,
                Err(_) => {
                    had_timeout = true;
                    break;
                }
            };
            let result = match joined {
                Ok((id, run)) => {
                    pending.remove(&id);
                    if let Some(err) = run.fatal
                        && fatal.is_none()
                    {
                        fatal = Some((run.result.task_id.clone(), err));
                    }
                    run.result
                }
                Err(join_err) => {
                    // run_task catches panics itself; this only triggers if the
                    // tokio task was torn down some other way.
                    let Some(task) = pending.remove(&join_err.id()) else {
                        continue;
                    };
                    TaskResult::failed(task, TaskError::panicked(join_err.to_string()))
                }
            };
            self.finish(session_id, round, result, sink, &mut finished)
                .await?;
        }

        if had_timeout {
            let outstanding: Vec<&Task> = pending.values().copied().collect();
            warn!(
                session = %session_id,
                round,
                outstanding = outstanding.len(),
                "round deadline passed, cancelling outstanding tasks"
            );
            self.emit_event(RoundEvent::DeadlinePassed {
                round,
                outstanding: outstanding.iter().map(|t| t.id.clone()).collect(),
            })
            .await;
            cancel.cancel();
            set.abort_all();
            while set.join_next().await.is_some() {}

            let unfinished: Vec<&Task> = tasks
                .iter()
                .filter(|t| !finished.contains_key(&t.id))
                .collect();
            for task in unfinished {
                let result = TaskResult::failed(task, TaskError::round_timeout(timeout));
                self.finish(session_id, round, result, sink, &mut finished)
                    .await?;
            }
        }

        let results: Vec<TaskResult> = tasks
            .iter()
            .filter_map(|t| finished.remove(&t.id))
            .collect();
        let outcome = RoundOutcome {
            round,
            results,
            had_timeout,
        };
        let failed = outcome.failed_count();
        info!(
            session = %session_id,
            round,
            succeeded = outcome.results.len() - failed,
            failed,
            had_timeout,
            "round finished"
        );
        self.emit_event(RoundEvent::Finished {
            round,
            succeeded: outcome.results.len() - failed,
            failed,
            had_timeout,
        })
        .await;

        if let Some((task_id, source)) = fatal {
            return Err(PipelineError::TaskFatal { task_id, source });
        }
        Ok(outcome)
    }

    async fn finish(
        &self,
        session_id: &str,
        round: u32,
        result: TaskResult,
        sink: &dyn ResultSink,
        finished: &mut HashMap<String, TaskResult>,
    ) -> Result<(), PipelineError> {
        debug!(
            session = %session_id,
            round,
            task = %result.task_id,
            status = result.status.as_str(),
            "task finished"
        );
        sink.accept(&result).await?;
        self.emit_event(RoundEvent::TaskFinished {
            round,
            task_id: result.task_id.clone(),
            status: result.status,
        })
        .await;
        finished.insert(result.task_id.clone(), result);
        Ok(())
    }
}

/// Terminal result of one task, plus the error when it must fail the session.
struct TaskRun {
    result: TaskResult,
    fatal: Option<InvokeError>,
}

impl From<TaskResult> for TaskRun {
    fn from(result: TaskResult) -> Self {
        Self {
            result,
            fatal: None,
        }
    }
}

async fn run_task(
    workers: Arc<WorkerRegistry>,
    invoker: ResilientInvoker,
    task: Task,
    ctx: TaskContext,
) -> TaskRun {
    let Some(worker) = workers.get(task.kind) else {
        return TaskResult::failed(&task, TaskError::no_worker(task.kind.as_str())).into();
    };
    let call = invoker.invoke(worker.operation_class(), task.kind.as_str(), |_| {
        worker.execute(&task, &ctx)
    });
    match AssertUnwindSafe(call).catch_unwind().await {
        Ok(Ok(output)) => output.into_result(&task).into(),
        Ok(Err(err)) => {
            let result = TaskResult::failed(&task, TaskError::from(&err));
            if err.is_fatal() {
                warn!(task = %task.id, error = %err, "system error from worker");
                return TaskRun {
                    result,
                    fatal: Some(err),
                };
            }
            result.into()
        }
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "worker panicked".to_string());
            TaskResult::failed(&task, TaskError::panicked(message)).into()
        }
    }
}
