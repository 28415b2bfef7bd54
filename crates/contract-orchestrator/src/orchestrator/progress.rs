//! Progress notifications emitted while a run executes.
//!
//! The orchestrator only knows the [`ProgressSink`] interface. A transport
//! (WebSocket, SSE, a log) is plugged in by implementing it, or by
//! subscribing to a [`BroadcastProgressSink`].

use crate::agent::UnitKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressKind {
    WorkflowStarted,
    StageStarted,
    UnitStarted,
    UnitCompleted,
    UnitDegraded,
    UnitFailed,
    WorkflowFinished,
}

/// One progress notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub run_id: Uuid,
    pub kind: ProgressKind,
    pub unit: Option<UnitKind>,
    /// Zero-based stage index, when the event belongs to a stage.
    pub stage: Option<usize>,
    /// Share of units finished so far, 0 to 100.
    pub percentage: f64,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn new(
        run_id: Uuid,
        kind: ProgressKind,
        percentage: f64,
        message: impl Into<String>,
    ) -> Self {
        Self {
            run_id,
            kind,
            unit: None,
            stage: None,
            percentage: percentage.clamp(0.0, 100.0),
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_unit(mut self, unit: UnitKind) -> Self {
        self.unit = Some(unit);
        self
    }

    pub fn with_stage(mut self, stage: usize) -> Self {
        self.stage = Some(stage);
        self
    }
}

/// Receives progress events. Implementations must not block.
pub trait ProgressSink: Send + Sync {
    fn notify(&self, run_id: Uuid, event: ProgressEvent);
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopProgressSink;

impl ProgressSink for NoopProgressSink {
    fn notify(&self, _run_id: Uuid, _event: ProgressEvent) {}
}

/// Fans events out to any number of subscribers.
///
/// Slow subscribers miss events once the channel capacity is exceeded.
#[derive(Debug, Clone)]
pub struct BroadcastProgressSink {
    sender: broadcast::Sender<ProgressEvent>,
}

impl BroadcastProgressSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for BroadcastProgressSink {
    fn default() -> Self {
        Self::new(256)
    }
}

impl ProgressSink for BroadcastProgressSink {
    fn notify(&self, _run_id: Uuid, event: ProgressEvent) {
        // No subscribers is not an error.
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_broadcast_sink_delivers_to_subscribers() {
        let sink = BroadcastProgressSink::new(8);
        let mut first = sink.subscribe();
        let mut second = sink.subscribe();
        let run_id = Uuid::new_v4();

        sink.notify(
            run_id,
            ProgressEvent::new(run_id, ProgressKind::UnitStarted, 20.0, "analyzer started")
                .with_unit(UnitKind::Analyzer)
                .with_stage(0),
        );

        let event = first.recv().await.unwrap();
        assert_eq!(event.kind, ProgressKind::UnitStarted);
        assert_eq!(event.unit, Some(UnitKind::Analyzer));
        assert_eq!(second.recv().await.unwrap(), event);
    }

    #[test]
    fn test_notify_without_subscribers_is_silent() {
        let sink = BroadcastProgressSink::default();
        assert_eq!(sink.subscriber_count(), 0);
        sink.notify(
            Uuid::nil(),
            ProgressEvent::new(Uuid::nil(), ProgressKind::WorkflowStarted, 0.0, "start"),
        );
    }

    #[test]
    fn test_percentage_is_clamped() {
        let event = ProgressEvent::new(Uuid::nil(), ProgressKind::WorkflowFinished, 140.0, "done");
        assert_eq!(event.percentage, 100.0);
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["kind"], "workflow_finished");
    }
}
