//! Worker collaborator interface and the per-kind registry.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::errors::{CallError, ErrorClass, TaskError};
use crate::model::{FollowUpQuestion, Payload, Task, TaskKind, TaskResult};

/// Per-task execution context handed to a worker.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub session_id: String,
    pub round: u32,
    /// Cancelled when the round deadline passes. Long-running workers should
    /// check it between steps.
    pub cancel: CancellationToken,
}

/// What a worker produced for a task.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerOutput {
    pub payload: Payload,
    pub follow_ups: Vec<FollowUpQuestion>,
    /// Set when the output is usable but incomplete.
    pub incomplete: Option<String>,
}

impl WorkerOutput {
    pub fn new(payload: Payload) -> Self {
        Self {
            payload,
            follow_ups: Vec::new(),
            incomplete: None,
        }
    }

    pub fn with_follow_ups(mut self, follow_ups: Vec<FollowUpQuestion>) -> Self {
        self.follow_ups = follow_ups;
        self
    }

    pub fn incomplete(mut self, reason: &str) -> Self {
        self.incomplete = Some(reason.to_string());
        self
    }

    /// Turn the output into the task's terminal result.
    pub(crate) fn into_result(self, task: &Task) -> TaskResult {
        if self.payload.kind() != task.kind {
            let err = CallError::internal(format!(
                "worker returned a {} payload for {} task {}",
                self.payload.kind(),
                task.kind,
                task.id
            ));
            return TaskResult::failed(task, TaskError::from(&err));
        }
        // Follow-ups always point back at the task that raised them.
        let follow_ups = self
            .follow_ups
            .into_iter()
            .map(|mut q| {
                q.origin_task_id = task.id.clone();
                q
            })
            .collect();
        match self.incomplete {
            None => TaskResult::done(task, self.payload, follow_ups),
            Some(reason) => TaskResult::partial(
                task,
                self.payload,
                follow_ups,
                Some(TaskError {
                    code: "incomplete".to_string(),
                    class: ErrorClass::Transient,
                    message: reason,
                }),
            ),
        }
    }
}

/// Executes tasks of one kind.
#[async_trait]
pub trait Worker: Send + Sync {
    fn kind(&self) -> TaskKind;

    /// Operation class used to pick the retry configuration.
    fn operation_class(&self) -> &str {
        match self.kind() {
            TaskKind::Data => "api_call",
            TaskKind::Research => "web_search",
        }
    }

    async fn execute(&self, task: &Task, ctx: &TaskContext) -> Result<WorkerOutput, CallError>;
}

/// Workers keyed by the task kind they serve.
#[derive(Default, Clone)]
pub struct WorkerRegistry {
    workers: HashMap<TaskKind, Arc<dyn Worker>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a worker, replacing any earlier worker of the same kind.
    pub fn register(&mut self, worker: Arc<dyn Worker>) -> &mut Self {
        self.workers.insert(worker.kind(), worker);
        self
    }

    pub fn with(mut self, worker: Arc<dyn Worker>) -> Self {
        self.register(worker);
        self
    }

    pub fn get(&self, kind: TaskKind) -> Option<Arc<dyn Worker>> {
        self.workers.get(&kind).cloned()
    }

    pub fn kinds(&self) -> Vec<TaskKind> {
        let mut kinds: Vec<_> = self.workers.keys().copied().collect();
        kinds.sort_by_key(|k| k.as_str());
        kinds
    }
}

impl std::fmt::Debug for WorkerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DataPayload, Priority, ResearchPayload, TaskStatus};

    fn task(kind: TaskKind) -> Task {
        Task::new("d1".into(), "item1", "pull prices", kind, Priority::High)
    }

    #[test]
    fn test_incomplete_output_is_partial() {
        let out = WorkerOutput::new(Payload::Data(DataPayload::default())).incomplete("page 2 missing");
        let result = out.into_result(&task(TaskKind::Data));
        assert_eq!(result.status, TaskStatus::Partial);
        assert!(result.is_success());
        assert_eq!(result.error.unwrap().message, "page 2 missing");
    }

    #[test]
    fn test_payload_kind_mismatch_fails_task() {
        let out = WorkerOutput::new(Payload::Research(ResearchPayload::default()));
        let result = out.into_result(&task(TaskKind::Data));
        assert_eq!(result.status, TaskStatus::Failed);
        assert_eq!(result.error.unwrap().code, "internal");
    }

    #[test]
    fn test_follow_ups_are_reattributed() {
        let out = WorkerOutput::new(Payload::Data(DataPayload::default()))
            .with_follow_ups(vec![FollowUpQuestion::new("what about 2019?", "")]);
        let result = out.into_result(&task(TaskKind::Data));
        assert_eq!(result.follow_ups[0].origin_task_id, "d1");
    }
}
