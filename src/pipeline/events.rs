//! Progress notifications for transports that want to relay them.

use serde::Serialize;
use tokio::sync::broadcast;

use super::types::{DocumentId, Stage};

/// Stage progress of one document.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ProgressEvent {
    /// Document being processed.
    pub document_id: DocumentId,
    /// Stage the event refers to.
    pub stage: Stage,
    /// Overall progress, 0 to 100.
    pub progress: u8,
    /// Short human-readable message.
    pub message: String,
}

/// Fan-out channel for [`ProgressEvent`]s. Emitting never blocks; slow subscribers lag.
#[derive(Clone, Debug)]
pub struct EventSink {
    sender: broadcast::Sender<ProgressEvent>,
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventSink {
    /// Channel retaining up to `capacity` undelivered events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn emit(&self, event: ProgressEvent) {
        tracing::trace!(document_id = %event.document_id, stage = %event.stage, progress = event.progress, "{}", event.message);
        let _ = self.sender.send(event);
    }

    /// New receiver for events emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(stage: Stage) -> ProgressEvent {
        ProgressEvent {
            document_id: DocumentId::new(),
            stage,
            progress: stage.progress(),
            message: "done".into(),
        }
    }

    #[test]
    fn emitting_without_subscribers_is_silent() {
        EventSink::default().emit(event(Stage::Classification));
    }

    #[tokio::test]
    async fn subscribers_receive_events_in_order() {
        let sink = EventSink::new(8);
        let mut receiver = sink.subscribe();
        sink.emit(event(Stage::Structure));
        sink.emit(event(Stage::Markup));
        assert_eq!(receiver.recv().await.expect("first").stage, Stage::Structure);
        assert_eq!(receiver.recv().await.expect("second").stage, Stage::Markup);
    }
}
