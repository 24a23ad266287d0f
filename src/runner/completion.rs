//! Run outcome and statistics.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{JobError, RunError};

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Every pulled job succeeded and the source is exhausted.
    Succeeded,
    /// At least one job or source pull failed.
    Failed,
    /// The run was cancelled before the source was exhausted.
    Cancelled,
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Why a slot stopped pulling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotExit {
    /// The source had nothing left.
    Exhausted,
    /// The slot recorded a failure and stopped.
    StoppedAfterFailure,
    /// Another slot failed under `FailurePolicy::FailFast`.
    Halted,
    /// The run's cancellation token fired.
    Cancelled,
}

/// A failure captured during a run.
#[derive(Debug)]
pub struct JobFailure {
    /// Slot that observed the failure.
    pub slot: usize,
    /// Job label, if the job had one.
    pub label: Option<String>,
    /// Attempts made before giving up. Zero for source failures.
    pub attempts: u32,
    pub error: JobError,
}

impl JobFailure {
    /// Pull-order index of the failed job. `None` for source failures.
    pub fn index(&self) -> Option<usize> {
        self.error.index()
    }

    pub fn is_source_failure(&self) -> bool {
        matches!(self.error, JobError::Source { .. })
    }
}

impl std::fmt::Display for JobFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.label {
            Some(label) => write!(f, "[slot {}] {label}: {}", self.slot, self.error),
            None => write!(f, "[slot {}] {}", self.slot, self.error),
        }
    }
}

/// Per-slot counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotStatistics {
    pub slot: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub source_failures: usize,
    pub retries: u32,
    pub exit: SlotExit,
}

impl SlotStatistics {
    pub(crate) fn new(slot: usize) -> Self {
        Self {
            slot,
            succeeded: 0,
            failed: 0,
            source_failures: 0,
            retries: 0,
            exit: SlotExit::Exhausted,
        }
    }

    /// Jobs this slot ran to a final result.
    pub fn executed(&self) -> usize {
        self.succeeded + self.failed
    }
}

/// What happened during a run, slot by slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStatistics {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
    pub concurrency: usize,
    /// Highest number of jobs observed in flight at once.
    pub peak_in_flight: usize,
    pub slots: Vec<SlotStatistics>,
}

impl RunStatistics {
    pub fn succeeded(&self) -> usize {
        self.slots.iter().map(|s| s.succeeded).sum()
    }

    pub fn failed(&self) -> usize {
        self.slots.iter().map(|s| s.failed).sum()
    }

    pub fn source_failures(&self) -> usize {
        self.slots.iter().map(|s| s.source_failures).sum()
    }

    pub fn executed(&self) -> usize {
        self.slots.iter().map(SlotStatistics::executed).sum()
    }

    pub fn retries(&self) -> u32 {
        self.slots.iter().map(|s| s.retries).sum()
    }
}

/// Final result of a run.
#[derive(Debug)]
pub struct Completion {
    pub outcome: Outcome,
    /// Every failure captured, ordered by job index. Source failures last.
    pub failures: Vec<JobFailure>,
    pub stats: RunStatistics,
}

impl Completion {
    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Succeeded
    }

    /// Convert into a `Result`, keeping statistics only on success.
    pub fn into_result(self) -> Result<RunStatistics, RunError> {
        match self.outcome {
            Outcome::Succeeded => Ok(self.stats),
            Outcome::Failed => Err(RunError::Failed {
                failures: self.failures,
            }),
            Outcome::Cancelled => Err(RunError::Cancelled {
                failures: self.failures,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(slots: Vec<SlotStatistics>) -> RunStatistics {
        RunStatistics {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            elapsed: Duration::from_millis(5),
            concurrency: slots.len(),
            peak_in_flight: 1,
            slots,
        }
    }

    #[test]
    fn statistics_totals() {
        let mut a = SlotStatistics::new(0);
        a.succeeded = 3;
        a.retries = 2;
        let mut b = SlotStatistics::new(1);
        b.succeeded = 1;
        b.failed = 1;
        b.source_failures = 1;
        b.exit = SlotExit::StoppedAfterFailure;

        let stats = stats(vec![a, b]);
        assert_eq!(stats.succeeded(), 4);
        assert_eq!(stats.failed(), 1);
        assert_eq!(stats.executed(), 5);
        assert_eq!(stats.source_failures(), 1);
        assert_eq!(stats.retries(), 2);
    }

    #[test]
    fn failure_display_includes_label() {
        let failure = JobFailure {
            slot: 2,
            label: Some("chunk 9".to_string()),
            attempts: 3,
            error: JobError::Failed {
                index: 9,
                source: anyhow::anyhow!("503"),
            },
        };
        assert_eq!(failure.to_string(), "[slot 2] chunk 9: Job 9 failed: 503");
        assert_eq!(failure.index(), Some(9));
        assert!(!failure.is_source_failure());
    }

    #[test]
    fn into_result_by_outcome() {
        let ok = Completion {
            outcome: Outcome::Succeeded,
            failures: vec![],
            stats: stats(vec![SlotStatistics::new(0)]),
        };
        assert!(ok.is_success());
        assert!(ok.into_result().is_ok());

        let cancelled = Completion {
            outcome: Outcome::Cancelled,
            failures: vec![],
            stats: stats(vec![SlotStatistics::new(0)]),
        };
        assert!(matches!(
            cancelled.into_result(),
            Err(RunError::Cancelled { .. })
        ));
    }

    #[test]
    fn statistics_serialize() {
        let json = serde_json::to_string(&stats(vec![SlotStatistics::new(0)])).unwrap();
        assert!(json.contains("\"peak_in_flight\":1"));
        assert!(json.contains("\"exit\":\"exhausted\""));
    }
}
