//! The completion-wide event bus.
//!
//! Grounded on `rlm-core::trajectory::TrajectoryEvent`: a tagged event with
//! a depth, a timestamp, and a free-form metadata bag, published to a
//! multi-subscriber bus that is shut down last during teardown so that
//! subscribers observe terminal events.

use crate::ids::{CallId, CompletionId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::broadcast;

/// A scheduler-level warning code. Warnings never escalate to a terminal
/// failure of another call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WarningCode {
    StaleCommandDropped,
    QueueClosed,
    CallScopeCleanup,
}

/// Events published on the completion-wide bus (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventKind {
    CallStarted,
    IterationStarted { iteration: u32, iterations_remaining: i64 },
    ModelResponse { text: String, usage_tokens: Option<u64> },
    CodeExecutionStarted { code: String },
    CodeExecutionCompleted { output: String },
    BridgeCallReceived { method: String },
    CallFinalized { answer: String },
    CallFailed { error: String },
    SchedulerWarning {
        code: WarningCode,
        message: String,
        call_id: Option<CallId>,
        command_tag: Option<String>,
    },
}

/// One event on the bus: every event carries the owning completion id, and
/// most carry a call id and depth.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub completion_id: CompletionId,
    pub call_id: Option<CallId>,
    pub depth: Option<u32>,
    pub kind: EventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, Value>>,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(completion_id: CompletionId, call_id: Option<CallId>, depth: Option<u32>, kind: EventKind) -> Self {
        Self {
            completion_id,
            call_id,
            depth,
            kind,
            metadata: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value.into());
        self
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.kind, EventKind::CallFinalized { .. } | EventKind::CallFailed { .. })
    }
}

/// Multi-subscriber publish bus for one completion tree.
///
/// Backed by `tokio::sync::broadcast`, bounded by `eventBufferCapacity`. A
/// slow subscriber that falls behind the buffer capacity will observe a
/// `Lagged` error on `recv` and can resynchronize by continuing to poll;
/// this is surfaced to callers of [`EventBus::subscribe`] as-is rather than
/// papered over, matching the teacher's preference for explicit `Result`
/// propagation over silently dropping data.
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Publish an event. Returns the number of active subscribers that
    /// received it (zero if there are none -- this is not an error, the
    /// caller may be running `complete()` without `stream()`).
    pub fn publish(&self, event: Event) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    /// Drop the bus's own sender reference; existing receivers continue to
    /// drain buffered events and then observe `RecvError::Closed`. Called
    /// last during completion teardown per spec §4.1.
    pub fn shutdown(self) {
        drop(self.sender);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_observes_published_events_in_order() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let completion_id = CompletionId::new();

        bus.publish(Event::new(completion_id.clone(), Some(CallId::root()), Some(0), EventKind::CallStarted));
        bus.publish(Event::new(
            completion_id.clone(),
            Some(CallId::root()),
            Some(0),
            EventKind::CallFinalized { answer: "4".into() },
        ));

        let first = rx.recv().await.unwrap();
        assert!(matches!(first.kind, EventKind::CallStarted));
        let second = rx.recv().await.unwrap();
        assert!(second.is_terminal());
    }

    #[test]
    fn publish_without_subscribers_is_not_an_error() {
        let bus = EventBus::new(4);
        let n = bus.publish(Event::new(CompletionId::new(), None, None, EventKind::CallStarted));
        assert_eq!(n, 0);
    }

    #[test]
    fn metadata_roundtrips_through_serde() {
        let event = Event::new(CompletionId::new(), Some(CallId::root()), Some(0), EventKind::CallStarted)
            .with_metadata("note", "hello");
        let json = serde_json::to_string(&event).unwrap();
        let parsed: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(
            parsed.metadata.unwrap().get("note"),
            Some(&Value::String("hello".into()))
        );
    }
}
