//! A single worker slot: pull a job, run it, repeat.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use futures::FutureExt;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::{FailurePolicy, RunnerConfig};
use crate::error::JobError;
use crate::runner::completion::{JobFailure, SlotExit, SlotStatistics};
use crate::runner::events::{EventEmitter, RunEvent};
use crate::runner::job::{BoxedJob, Job, JobSource};

/// State shared by every slot of one run.
pub(crate) struct RunShared {
    pub source: Mutex<JobSource>,
    pub config: RunnerConfig,
    pub events: EventEmitter,
    /// Fired by the caller.
    pub cancel: CancellationToken,
    /// Child of `cancel`, also fired by the first failure under `FailFast`.
    pub halt: CancellationToken,
    pub in_flight: InFlight,
    next_index: AtomicUsize,
}

impl RunShared {
    pub(crate) fn new(
        source: JobSource,
        config: RunnerConfig,
        events: EventEmitter,
        cancel: CancellationToken,
    ) -> Self {
        let halt = cancel.child_token();
        Self {
            source: Mutex::new(source),
            config,
            events,
            cancel,
            halt,
            in_flight: InFlight::default(),
            next_index: AtomicUsize::new(0),
        }
    }

    /// Hand out the next job with its pull-order index.
    ///
    /// The index is assigned while the source lock is held, so indices follow
    /// the order the source yields jobs.
    async fn pull(&self) -> Option<anyhow::Result<(usize, BoxedJob)>> {
        let mut source = self.source.lock().await;
        let item = source.next_job().await?;
        Some(item.map(|job| (self.next_index.fetch_add(1, Ordering::SeqCst), job)))
    }
}

/// Tracks how many jobs are running right now and the highest count seen.
#[derive(Debug, Default)]
pub(crate) struct InFlight {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl InFlight {
    fn enter(&self) -> InFlightGuard<'_> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        InFlightGuard { counter: self }
    }

    pub(crate) fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

struct InFlightGuard<'a> {
    counter: &'a InFlight,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.counter.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// What a slot hands back when it stops.
pub(crate) struct SlotReport {
    pub stats: SlotStatistics,
    pub failures: Vec<JobFailure>,
}

/// One logical lane of a run.
pub(crate) struct Slot<'r> {
    id: usize,
    shared: &'r RunShared,
    stats: SlotStatistics,
    failures: Vec<JobFailure>,
}

impl<'r> Slot<'r> {
    pub(crate) fn new(id: usize, shared: &'r RunShared) -> Self {
        Self {
            id,
            shared,
            stats: SlotStatistics::new(id),
            failures: Vec::new(),
        }
    }

    /// Pull and run jobs until the source is exhausted or the slot must stop.
    pub(crate) async fn run(mut self) -> SlotReport {
        let exit = loop {
            if let Some(exit) = self.stop_reason() {
                break exit;
            }

            let pulled = tokio::select! {
                biased;
                _ = self.shared.halt.cancelled() => None,
                item = self.shared.pull() => Some(item),
            };

            let failure = match pulled {
                // Halted or cancelled while waiting on the source.
                None => continue,
                Some(None) => break SlotExit::Exhausted,
                Some(Some(Err(source))) => {
                    self.stats.source_failures += 1;
                    JobFailure {
                        slot: self.id,
                        label: None,
                        attempts: 0,
                        error: JobError::Source { source },
                    }
                }
                Some(Some(Ok((index, job)))) => match self.execute(index, job).await {
                    Ok(()) => continue,
                    Err(failure) => failure,
                },
            };

            tracing::warn!(
                run_id = %self.shared.events.run_id(),
                slot = self.id,
                "{}",
                failure
            );
            self.shared.events.emit(|run_id| RunEvent::JobFailed {
                run_id,
                slot: self.id,
                index: failure.index(),
                error: failure.error.to_string(),
            });
            self.failures.push(failure);

            if self.shared.cancel.is_cancelled() {
                break SlotExit::Cancelled;
            }
            match self.shared.config.failure_policy {
                FailurePolicy::Continue => {}
                FailurePolicy::SoftStop => break SlotExit::StoppedAfterFailure,
                FailurePolicy::FailFast => {
                    self.shared.halt.cancel();
                    break SlotExit::StoppedAfterFailure;
                }
            }
        };

        tracing::debug!(
            run_id = %self.shared.events.run_id(),
            slot = self.id,
            exit = ?exit,
            executed = self.stats.executed(),
            "Slot finished"
        );
        self.shared.events.emit(|run_id| RunEvent::SlotFinished {
            run_id,
            slot: self.id,
            exit,
        });

        self.stats.exit = exit;
        SlotReport {
            stats: self.stats,
            failures: self.failures,
        }
    }

    fn stop_reason(&self) -> Option<SlotExit> {
        if self.shared.cancel.is_cancelled() {
            Some(SlotExit::Cancelled)
        } else if self.shared.halt.is_cancelled() {
            Some(SlotExit::Halted)
        } else {
            None
        }
    }

    /// Run one job to a final result, retrying per config.
    async fn execute(&mut self, index: usize, mut job: BoxedJob) -> Result<(), JobFailure> {
        let label = job.label();
        let config = &self.shared.config;
        let _guard = self.shared.in_flight.enter();
        let started = Instant::now();

        tracing::debug!(
            run_id = %self.shared.events.run_id(),
            slot = self.id,
            job = index,
            label = label.as_deref().unwrap_or(""),
            "Job started"
        );
        self.shared.events.emit(|run_id| RunEvent::JobStarted {
            run_id,
            slot: self.id,
            index,
            label: label.clone(),
        });

        let mut attempt: u32 = 1;
        loop {
            let error = match Self::attempt(config, index, job.as_mut()).await {
                Ok(()) => {
                    let elapsed_ms =
                        u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
                    tracing::debug!(
                        run_id = %self.shared.events.run_id(),
                        slot = self.id,
                        job = index,
                        elapsed_ms,
                        "Job completed"
                    );
                    self.shared.events.emit(|run_id| RunEvent::JobCompleted {
                        run_id,
                        slot: self.id,
                        index,
                        elapsed_ms,
                    });
                    self.stats.succeeded += 1;
                    return Ok(());
                }
                Err(error) => error,
            };

            // No new attempts once the run is cancelled, even mid-backoff.
            let retry = error.is_retryable()
                && attempt <= config.max_retries
                && !self.shared.cancel.is_cancelled();
            let backoff_done = if retry {
                tokio::select! {
                    biased;
                    _ = self.shared.cancel.cancelled() => false,
                    _ = tokio::time::sleep(config.retry_backoff * attempt) => true,
                }
            } else {
                false
            };
            if !backoff_done {
                self.stats.failed += 1;
                return Err(JobFailure {
                    slot: self.id,
                    label,
                    attempts: attempt,
                    error,
                });
            }

            tracing::warn!(
                run_id = %self.shared.events.run_id(),
                slot = self.id,
                job = index,
                attempt,
                error = %error,
                "Job attempt failed, retrying"
            );
            self.shared.events.emit(|run_id| RunEvent::JobRetrying {
                run_id,
                slot: self.id,
                index,
                attempt,
                error: error.to_string(),
            });
            self.stats.retries += 1;

            attempt += 1;
        }
    }

    /// One attempt, with the configured timeout and panics captured.
    async fn attempt(
        config: &RunnerConfig,
        index: usize,
        job: &mut dyn Job,
    ) -> Result<(), JobError> {
        let run = AssertUnwindSafe(job.run()).catch_unwind();
        let result = match config.job_timeout {
            Some(timeout) => tokio::time::timeout(timeout, run)
                .await
                .map_err(|_| JobError::TimedOut { index, timeout })?,
            None => run.await,
        };

        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(source)) => Err(JobError::Failed { index, source }),
            Err(panic) => Err(JobError::Panicked {
                index,
                message: panic_message(panic.as_ref()),
            }),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
