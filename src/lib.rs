//! Slot Runner — bounded-concurrency execution of lazily produced async jobs.

pub mod config;
pub mod error;
pub mod runner;

pub use config::{FailurePolicy, RunnerConfig};
pub use error::{ConfigError, Error, JobError, Result, RunError};
pub use runner::{
    Completion, Job, JobFailure, JobSource, Outcome, RunEvent, RunStatistics, Runner, labeled,
    run_concurrent,
};
