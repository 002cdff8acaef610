//! Guidance sequencer: fires pose instructions at fixed offsets from the
//! session start, then a single completion event.
//!
//! Purely time-driven. The only thing shared with the recorder is the start
//! instant passed to [`GuidanceSequencer::begin`].

use facecap_core::{GuidanceSequence, GuidanceStep};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuidanceEvent {
    StepChanged { index: usize, step: GuidanceStep },
    /// Fired exactly once per `begin`, at `sequence.total()`.
    SequenceComplete,
}

pub struct GuidanceSequencer {
    events: mpsc::UnboundedSender<GuidanceEvent>,
    task: Option<JoinHandle<()>>,
}

impl GuidanceSequencer {
    pub fn new(events: mpsc::UnboundedSender<GuidanceEvent>) -> Self {
        Self { events, task: None }
    }

    /// Schedule `sequence` relative to `started_at`. Anything scheduled by a
    /// previous `begin` is cancelled first.
    pub fn begin(&mut self, sequence: GuidanceSequence, started_at: Instant) {
        self.cancel();
        tracing::info!(
            steps = sequence.len(),
            total_ms = sequence.total().as_millis() as u64,
            "guidance sequence scheduled"
        );
        let events = self.events.clone();
        self.task = Some(tokio::spawn(async move {
            for (index, step) in sequence.steps().iter().enumerate() {
                sleep_until(started_at + step.offset).await;
                tracing::debug!(index, pose = ?step.pose, "guidance step");
                let event = GuidanceEvent::StepChanged {
                    index,
                    step: step.clone(),
                };
                if events.send(event).is_err() {
                    return;
                }
            }
            sleep_until(started_at + sequence.total()).await;
            let _ = events.send(GuidanceEvent::SequenceComplete);
        }));
    }

    /// Cancel all pending events. Idempotent.
    pub fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            if !task.is_finished() {
                tracing::debug!("guidance sequence cancelled");
            }
            task.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for GuidanceSequencer {
    fn drop(&mut self) {
        self.cancel();
    }
}
