//! Error types for the slot runner.

use std::time::Duration;

use crate::runner::JobFailure;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Run error: {0}")]
    Run(#[from] RunError),
}

/// Configuration-related errors. Always raised before any job is pulled.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse {key} from {value:?}")]
    ParseError { key: String, value: String },
}

/// A single job (or source) failure.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job {index} failed: {source}")]
    Failed {
        index: usize,
        #[source]
        source: anyhow::Error,
    },

    #[error("Job {index} timed out after {timeout:?}")]
    TimedOut { index: usize, timeout: Duration },

    #[error("Job {index} panicked: {message}")]
    Panicked { index: usize, message: String },

    #[error("Job source failed: {source}")]
    Source {
        #[source]
        source: anyhow::Error,
    },
}

impl JobError {
    /// Index of the job in pull order, if the failure belongs to a job.
    pub fn index(&self) -> Option<usize> {
        match self {
            Self::Failed { index, .. }
            | Self::TimedOut { index, .. }
            | Self::Panicked { index, .. } => Some(*index),
            Self::Source { .. } => None,
        }
    }

    /// Whether another attempt could succeed. Panics are never retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Failed { .. } | Self::TimedOut { .. })
    }
}

/// A run that did not succeed.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("{} job(s) failed", failures.len())]
    Failed { failures: Vec<JobFailure> },

    #[error("Run cancelled ({} failure(s) recorded)", failures.len())]
    Cancelled { failures: Vec<JobFailure> },
}

impl RunError {
    /// Failures captured before the run ended.
    pub fn failures(&self) -> &[JobFailure] {
        match self {
            Self::Failed { failures } | Self::Cancelled { failures } => failures,
        }
    }
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;
