//! Configuration types.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// What a run does when a job fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// The failing slot stops pulling; other slots keep going.
    #[default]
    SoftStop,
    /// The first failure stops every slot from pulling. In-flight jobs finish.
    FailFast,
    /// Failures are recorded and the slot keeps pulling.
    Continue,
}

impl FromStr for FailurePolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "soft_stop" | "soft-stop" => Ok(Self::SoftStop),
            "fail_fast" | "fail-fast" => Ok(Self::FailFast),
            "continue" => Ok(Self::Continue),
            _ => Err(ConfigError::ParseError {
                key: "failure_policy".to_string(),
                value: s.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::SoftStop => "soft_stop",
            Self::FailFast => "fail_fast",
            Self::Continue => "continue",
        };
        write!(f, "{s}")
    }
}

/// Runner configuration.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Number of worker slots, i.e. the maximum number of jobs in flight.
    pub concurrency: usize,
    /// Behaviour on job failure.
    pub failure_policy: FailurePolicy,
    /// Per-attempt timeout. `None` lets attempts run forever.
    pub job_timeout: Option<Duration>,
    /// Extra attempts after a failed or timed out one.
    pub max_retries: u32,
    /// Base delay between attempts, multiplied by the attempt number.
    pub retry_backoff: Duration,
    /// Capacity of the progress event channel.
    pub event_capacity: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            // Browsers cap fetches at 6 per host; most callers drive HTTP.
            concurrency: 6,
            failure_policy: FailurePolicy::SoftStop,
            job_timeout: None,
            max_retries: 0,
            retry_backoff: Duration::from_millis(250),
            event_capacity: 256,
        }
    }
}

impl RunnerConfig {
    /// Default config with the given number of slots.
    pub fn with_concurrency(concurrency: usize) -> Self {
        Self {
            concurrency,
            ..Default::default()
        }
    }

    pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = Some(timeout);
        self
    }

    pub fn retries(mut self, max_retries: u32, backoff: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_backoff = backoff;
        self
    }

    /// Check the config before any work starts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency < 1 {
            return Err(ConfigError::InvalidValue {
                key: "concurrency".to_string(),
                message: format!("must be at least 1, got {}", self.concurrency),
            });
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                key: "event_capacity".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.job_timeout == Some(Duration::ZERO) {
            return Err(ConfigError::InvalidValue {
                key: "job_timeout".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    /// Load from `SLOT_RUNNER_*` environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(v) = lookup("SLOT_RUNNER_CONCURRENCY") {
            config.concurrency = parse_var("SLOT_RUNNER_CONCURRENCY", &v)?;
        }
        if let Some(v) = lookup("SLOT_RUNNER_FAILURE_POLICY") {
            config.failure_policy = v.parse()?;
        }
        if let Some(v) = lookup("SLOT_RUNNER_JOB_TIMEOUT_MS") {
            let ms: u64 = parse_var("SLOT_RUNNER_JOB_TIMEOUT_MS", &v)?;
            config.job_timeout = Some(Duration::from_millis(ms));
        }
        if let Some(v) = lookup("SLOT_RUNNER_MAX_RETRIES") {
            config.max_retries = parse_var("SLOT_RUNNER_MAX_RETRIES", &v)?;
        }
        if let Some(v) = lookup("SLOT_RUNNER_RETRY_BACKOFF_MS") {
            let ms: u64 = parse_var("SLOT_RUNNER_RETRY_BACKOFF_MS", &v)?;
            config.retry_backoff = Duration::from_millis(ms);
        }

        config.validate()?;
        Ok(config)
    }
}

fn parse_var<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::ParseError {
        key: key.to_string(),
        value: value.to_string(),
    })
}
