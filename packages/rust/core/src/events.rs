//! Typed per-run event stream.
//!
//! Every [`PipelineRun`](crate::run::PipelineRun) owns one [`EventChannel`].
//! The registry's relay task and the CLI subscribe through [`EventStream`].

use std::collections::BTreeMap;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::warn;

use crate::executor::StepResult;

/// Lifecycle and progress events emitted by a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum PipelineEvent {
    /// Executor progress inside the current step.
    Progress {
        step_ordinal: u8,
        step_name: String,
        progress_percent: u8,
        items_processed: u64,
        total_items: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    StepCompleted {
        step_ordinal: u8,
        step_name: String,
        result: StepResult,
    },
    StepFailed {
        step_ordinal: u8,
        step_name: String,
        error: String,
    },
    /// All steps finished; carries the accumulated results.
    Completed {
        results: BTreeMap<String, StepResult>,
    },
    Failed {
        error: String,
    },
    Cancelled,
}

impl PipelineEvent {
    /// Wire name of the event (`progress`, `step_completed`, ...).
    pub fn name(&self) -> &'static str {
        match self {
            Self::Progress { .. } => "progress",
            Self::StepCompleted { .. } => "step_completed",
            Self::StepFailed { .. } => "step_failed",
            Self::Completed { .. } => "completed",
            Self::Failed { .. } => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether this event ends the run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed { .. } | Self::Failed { .. } | Self::Cancelled
        )
    }
}

/// Sending half of a run's event stream.
#[derive(Debug, Clone)]
pub struct EventChannel {
    tx: broadcast::Sender<PipelineEvent>,
}

impl EventChannel {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn emit(&self, event: PipelineEvent) {
        let _ = self.tx.send(event);
    }

    /// Open a new subscription. Only events emitted afterwards are observed.
    pub fn subscribe(&self) -> EventStream {
        EventStream {
            rx: self.tx.subscribe(),
        }
    }
}

/// Receiving half of a run's event stream.
#[derive(Debug)]
pub struct EventStream {
    rx: broadcast::Receiver<PipelineEvent>,
}

impl EventStream {
    /// Next event, or `None` once the run has been dropped.
    ///
    /// A subscriber that falls behind skips the overwritten events and keeps going.
    pub async fn next(&mut self) -> Option<PipelineEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event subscriber lagged, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_snake_case_tags() {
        let event = PipelineEvent::Progress {
            step_ordinal: 1,
            step_name: "parsing".into(),
            progress_percent: 50,
            items_processed: 2,
            total_items: 4,
            message: Some("src/lib.rs".into()),
        };
        let json = serde_json::to_value(&event).expect("serialize");
        assert_eq!(json["type"], "progress");
        assert_eq!(json["stepOrdinal"], 1);
        assert_eq!(json["progressPercent"], 50);

        let json = serde_json::to_value(PipelineEvent::Cancelled).expect("serialize");
        assert_eq!(json["type"], "cancelled");
    }

    #[test]
    fn terminal_events() {
        assert!(PipelineEvent::Cancelled.is_terminal());
        assert!(PipelineEvent::Failed { error: "x".into() }.is_terminal());
        assert!(
            !PipelineEvent::StepFailed {
                step_ordinal: 2,
                step_name: "dependency-analysis".into(),
                error: "x".into(),
            }
            .is_terminal()
        );
    }

    #[tokio::test]
    async fn subscribers_receive_events_in_order() {
        let channel = EventChannel::new(8);
        let mut stream = channel.subscribe();
        channel.emit(PipelineEvent::Failed { error: "a".into() });
        channel.emit(PipelineEvent::Cancelled);

        assert_eq!(stream.next().await.map(|e| e.name()), Some("failed"));
        assert_eq!(stream.next().await.map(|e| e.name()), Some("cancelled"));

        drop(channel);
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn lagged_subscriber_skips_ahead() {
        let channel = EventChannel::new(2);
        let mut stream = channel.subscribe();
        for i in 0..5 {
            channel.emit(PipelineEvent::Failed {
                error: i.to_string(),
            });
        }
        let first = stream.next().await.expect("event after lag");
        assert_eq!(first, PipelineEvent::Failed { error: "3".into() });
    }
}
