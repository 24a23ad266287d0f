//! Bounded task runner.
//!
//! Runs a lazily produced sequence of async jobs with at most N in flight.
//! N worker slots share one `JobSource`; each slot pulls a job, awaits it,
//! and pulls again, so fast slots naturally take more jobs than slow ones.
//!
//! Core components:
//! - `job` — the `Job` trait and the `JobSource` slots pull from
//! - `slot` — one slot's pull/execute loop (retry, timeout, panic capture)
//! - `completion` — `Completion`, per-slot `RunStatistics`
//! - `events` — `RunEvent` progress broadcast
//!
//! Slots are polled together on the caller's task. Nothing is spawned, so a
//! run is cooperative and overlaps only at the jobs' own await points.

pub mod completion;
pub mod events;
pub mod job;
mod slot;

use std::future::Future;
use std::time::Instant;

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::RunnerConfig;
use crate::error::ConfigError;
use crate::runner::events::EventEmitter;
use crate::runner::slot::{RunShared, Slot};

pub use completion::{Completion, JobFailure, Outcome, RunStatistics, SlotExit, SlotStatistics};
pub use events::RunEvent;
pub use job::{BoxedJob, Job, JobSource, Labeled, labeled};

/// Runs job sources with a fixed number of worker slots.
///
/// A `Runner` is reusable: each call to `run` is an independent run with its
/// own ID and statistics.
pub struct Runner {
    config: RunnerConfig,
    events: broadcast::Sender<RunEvent>,
}

impl Runner {
    /// Create a runner. Fails if the config is invalid; no job is touched.
    pub fn new(config: RunnerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let (events, _) = broadcast::channel(config.event_capacity);
        Ok(Self { config, events })
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Receive progress events for every subsequent run.
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.events.subscribe()
    }

    /// Run every job in `source` and report the outcome.
    pub async fn run(&self, source: JobSource) -> Completion {
        self.run_with_cancel(source, CancellationToken::new()).await
    }

    /// Like `run`, but stops pulling new jobs once `cancel` fires.
    ///
    /// Jobs already in flight are allowed to finish their current attempt.
    pub async fn run_with_cancel(
        &self,
        source: JobSource,
        cancel: CancellationToken,
    ) -> Completion {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let start = Instant::now();
        let concurrency = self.config.concurrency;
        let policy = self.config.failure_policy;

        let emitter = EventEmitter::new(run_id, self.events.clone());
        let shared = RunShared::new(source, self.config.clone(), emitter.clone(), cancel);

        tracing::info!(
            run_id = %run_id,
            concurrency,
            policy = %policy,
            "Run starting"
        );
        emitter.emit(|run_id| RunEvent::RunStarted {
            run_id,
            concurrency,
            failure_policy: policy,
        });

        let reports = join_all((0..concurrency).map(|id| Slot::new(id, &shared).run())).await;

        let mut slots = Vec::with_capacity(reports.len());
        let mut failures = Vec::new();
        for report in reports {
            slots.push(report.stats);
            failures.extend(report.failures);
        }
        failures.sort_by_key(|f| f.index().unwrap_or(usize::MAX));

        let outcome = if slots.iter().any(|s| s.exit == SlotExit::Cancelled) {
            Outcome::Cancelled
        } else if !failures.is_empty() {
            Outcome::Failed
        } else {
            Outcome::Succeeded
        };

        let stats = RunStatistics {
            run_id,
            started_at,
            elapsed: start.elapsed(),
            concurrency,
            peak_in_flight: shared.in_flight.peak(),
            slots,
        };

        tracing::info!(
            run_id = %run_id,
            outcome = %outcome,
            succeeded = stats.succeeded(),
            failed = failures.len(),
            elapsed_ms = u64::try_from(stats.elapsed.as_millis()).unwrap_or(u64::MAX),
            "Run finished"
        );
        emitter.emit(|run_id| RunEvent::RunFinished {
            run_id,
            outcome,
            succeeded: stats.succeeded(),
            failed: failures.len(),
        });

        Completion {
            outcome,
            failures,
            stats,
        }
    }
}

/// Run `source` with `concurrency` slots and the default policy.
///
/// The limit is checked here, before the returned future pulls anything, so
/// an invalid limit is reported without touching the source.
pub fn run_concurrent(
    source: JobSource,
    concurrency: usize,
) -> Result<impl Future<Output = Completion>, ConfigError> {
    let runner = Runner::new(RunnerConfig::with_concurrency(concurrency))?;
    Ok(async move { runner.run(source).await })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::config::FailurePolicy;

    fn counting_jobs(n: usize, ran: &Arc<AtomicUsize>) -> JobSource {
        let ran = Arc::clone(ran);
        JobSource::from_jobs((0..n).map(move |_| {
            let ran = Arc::clone(&ran);
            move || {
                let ran = Arc::clone(&ran);
                async move {
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    ran.fetch_add(1, Ordering::SeqCst);
                    anyhow::Ok(())
                }
            }
        }))
    }

    #[tokio::test]
    async fn runs_everything() {
        let ran = Arc::new(AtomicUsize::new(0));
        let runner = Runner::new(RunnerConfig::with_concurrency(3)).unwrap();

        let completion = runner.run(counting_jobs(10, &ran)).await;
        assert!(completion.is_success());
        assert_eq!(ran.load(Ordering::SeqCst), 10);
        assert_eq!(completion.stats.executed(), 10);
        assert_eq!(completion.stats.slots.len(), 3);
        assert!(completion.stats.peak_in_flight <= 3);
    }

    #[tokio::test]
    async fn invalid_concurrency_rejected_up_front() {
        assert!(Runner::new(RunnerConfig::with_concurrency(0)).is_err());
        assert!(run_concurrent(JobSource::empty(), 0).is_err());
    }

    #[tokio::test]
    async fn events_follow_run_lifecycle() {
        let ran = Arc::new(AtomicUsize::new(0));
        let runner = Runner::new(RunnerConfig::with_concurrency(2)).unwrap();
        let mut rx = runner.subscribe();

        let completion = runner.run(counting_jobs(3, &ran)).await;

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert!(matches!(events.first(), Some(RunEvent::RunStarted { concurrency: 2, .. })));
        assert!(events.last().is_some_and(RunEvent::is_terminal));
        assert!(events.iter().all(|e| e.run_id() == completion.stats.run_id));

        let started = events
            .iter()
            .filter(|e| matches!(e, RunEvent::JobStarted { .. }))
            .count();
        let slots_finished = events
            .iter()
            .filter(|e| matches!(e, RunEvent::SlotFinished { .. }))
            .count();
        assert_eq!(started, 3);
        assert_eq!(slots_finished, 2);

        let completed: Vec<u64> = events
            .iter()
            .filter_map(|e| match e {
                RunEvent::JobCompleted { elapsed_ms, .. } => Some(*elapsed_ms),
                _ => None,
            })
            .collect();
        assert_eq!(completed.len(), 3);
        assert!(completed.iter().all(|ms| *ms < 5_000));
    }

    #[tokio::test]
    async fn fail_fast_outcome_is_failed() {
        let config = RunnerConfig::with_concurrency(2).failure_policy(FailurePolicy::FailFast);
        let runner = Runner::new(config).unwrap();
        let source = JobSource::from_jobs(vec![|| async {
            Err::<(), _>(anyhow::anyhow!("disk quota exceeded"))
        }]);

        let completion = runner.run(source).await;
        assert_eq!(completion.outcome, Outcome::Failed);
        assert_eq!(completion.failures.len(), 1);
    }

    #[tokio::test]
    async fn runner_is_reusable() {
        let ran = Arc::new(AtomicUsize::new(0));
        let runner = Runner::new(RunnerConfig::with_concurrency(2)).unwrap();

        let first = runner.run(counting_jobs(2, &ran)).await;
        let second = runner.run(counting_jobs(2, &ran)).await;
        assert_ne!(first.stats.run_id, second.stats.run_id);
        assert_eq!(ran.load(Ordering::SeqCst), 4);
    }
}
