//! Progress events for a run.
//!
//! Slots broadcast `RunEvent`s as they pull and finish jobs. Subscribers get
//! them through `Runner::subscribe`. A run with no subscribers still works;
//! events are simply dropped.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::config::FailurePolicy;
use crate::runner::completion::{Outcome, SlotExit};

/// Events emitted while a run is in progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    /// Slots are about to start pulling.
    RunStarted {
        run_id: Uuid,
        concurrency: usize,
        failure_policy: FailurePolicy,
    },
    /// A slot pulled a job and is running it.
    JobStarted {
        run_id: Uuid,
        slot: usize,
        index: usize,
        #[serde(skip_serializing_if = "Option::is_none")]
        label: Option<String>,
    },
    /// An attempt failed and another one will follow.
    JobRetrying {
        run_id: Uuid,
        slot: usize,
        index: usize,
        attempt: u32,
        error: String,
    },
    /// A job finished successfully.
    JobCompleted {
        run_id: Uuid,
        slot: usize,
        index: usize,
        elapsed_ms: u64,
    },
    /// A job, or a pull from the source, failed for good.
    JobFailed {
        run_id: Uuid,
        slot: usize,
        #[serde(skip_serializing_if = "Option::is_none")]
        index: Option<usize>,
        error: String,
    },
    /// A slot stopped pulling.
    SlotFinished {
        run_id: Uuid,
        slot: usize,
        exit: SlotExit,
    },
    /// Every slot has finished.
    RunFinished {
        run_id: Uuid,
        outcome: Outcome,
        succeeded: usize,
        failed: usize,
    },
}

impl RunEvent {
    /// Get the run ID from any variant.
    pub fn run_id(&self) -> Uuid {
        match self {
            Self::RunStarted { run_id, .. }
            | Self::JobStarted { run_id, .. }
            | Self::JobRetrying { run_id, .. }
            | Self::JobCompleted { run_id, .. }
            | Self::JobFailed { run_id, .. }
            | Self::SlotFinished { run_id, .. }
            | Self::RunFinished { run_id, .. } => *run_id,
        }
    }

    /// Slot that produced the event, if any.
    pub fn slot(&self) -> Option<usize> {
        match self {
            Self::JobStarted { slot, .. }
            | Self::JobRetrying { slot, .. }
            | Self::JobCompleted { slot, .. }
            | Self::JobFailed { slot, .. }
            | Self::SlotFinished { slot, .. } => Some(*slot),
            Self::RunStarted { .. } | Self::RunFinished { .. } => None,
        }
    }

    /// Whether this is the last event of a run.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::RunFinished { .. })
    }
}

/// Sending half shared by the slots of one run.
#[derive(Clone)]
pub(crate) struct EventEmitter {
    run_id: Uuid,
    tx: broadcast::Sender<RunEvent>,
}

impl EventEmitter {
    pub(crate) fn new(run_id: Uuid, tx: broadcast::Sender<RunEvent>) -> Self {
        Self { run_id, tx }
    }

    pub(crate) fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Broadcast an event built from the run ID. No subscribers is fine.
    pub(crate) fn emit(&self, build: impl FnOnce(Uuid) -> RunEvent) {
        if self.tx.receiver_count() == 0 {
            return;
        }
        let _ = self.tx.send(build(self.run_id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_event_serde_job_started() {
        let msg = RunEvent::JobStarted {
            run_id: Uuid::new_v4(),
            slot: 1,
            index: 7,
            label: Some("chunk 7".to_string()),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"job_started\""));
        assert!(json.contains("\"index\":7"));
        assert!(json.contains("\"label\":\"chunk 7\""));

        let parsed: RunEvent = serde_json::from_str(&json).unwrap();
        assert!(matches!(parsed, RunEvent::JobStarted { slot: 1, .. }));
    }

    #[test]
    fn run_event_serde_unlabeled_job_omits_label() {
        let msg = RunEvent::JobStarted {
            run_id: Uuid::new_v4(),
            slot: 0,
            index: 0,
            label: None,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(!json.contains("label"));
    }

    #[test]
    fn run_event_serde_slot_finished() {
        let msg = RunEvent::SlotFinished {
            run_id: Uuid::new_v4(),
            slot: 2,
            exit: SlotExit::StoppedAfterFailure,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"slot_finished\""));
        assert!(json.contains("\"exit\":\"stopped_after_failure\""));
    }

    #[test]
    fn run_event_terminal() {
        let id = Uuid::new_v4();
        let done = RunEvent::RunFinished {
            run_id: id,
            outcome: Outcome::Failed,
            succeeded: 3,
            failed: 1,
        };
        assert!(done.is_terminal());
        assert_eq!(done.run_id(), id);
        assert_eq!(done.slot(), None);

        let started = RunEvent::JobCompleted {
            run_id: id,
            slot: 0,
            index: 0,
            elapsed_ms: 12,
        };
        assert!(!started.is_terminal());
        assert_eq!(started.slot(), Some(0));
    }

    #[tokio::test]
    async fn emitter_without_subscribers_is_silent() {
        let (tx, _) = broadcast::channel(4);
        let emitter = EventEmitter::new(Uuid::new_v4(), tx.clone());
        emitter.emit(|run_id| RunEvent::RunFinished {
            run_id,
            outcome: Outcome::Succeeded,
            succeeded: 0,
            failed: 0,
        });

        let mut rx = tx.subscribe();
        emitter.emit(|run_id| RunEvent::RunFinished {
            run_id,
            outcome: Outcome::Succeeded,
            succeeded: 0,
            failed: 0,
        });
        let event = rx.recv().await.unwrap();
        assert_eq!(event.run_id(), emitter.run_id());
    }
}
