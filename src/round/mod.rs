//! Round execution: worker interface and the concurrent round executor.

mod executor;
mod worker;

pub use executor::{
    DEFAULT_MAX_TASKS_PER_ROUND, DiscardSink, ResultSink, RoundEvent, RoundExecutor, RoundOutcome,
};
pub use worker::{TaskContext, Worker, WorkerOutput, WorkerRegistry};
