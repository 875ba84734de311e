//! Orchestration core for a multi-phase research pipeline.
//!
//! A [`pipeline::PipelineStateMachine`] takes an approved brief through
//! bounded rounds of concurrent tasks ([`round::RoundExecutor`]), reviews
//! coverage after each round ([`coverage::CoverageEvaluator`]) and persists
//! every step in an append-only [`store::SessionStore`] so a crashed session
//! resumes where it stopped. Calls to external collaborators go through
//! [`resilience::ResilientInvoker`].

pub mod config;
pub mod coverage;
pub mod errors;
pub mod logging;
pub mod model;
pub mod pipeline;
pub mod resilience;
pub mod round;
pub mod store;
