//! In-process event bus backed by a `tokio::sync::broadcast` channel.
//!
//! [`EventBus`] fans [`FleetEvent`]s out to any number of subscribers. It
//! is shared via `Arc<EventBus>` between the health registry, the
//! validate-and-fix workflow and the worker's reporter.

use chrono::{DateTime, Utc};
use reelforge_core::types::SlotId;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

// ---------------------------------------------------------------------------
// FleetEventKind
// ---------------------------------------------------------------------------

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FleetEventKind {
    AgentRegistered,
    AgentUnregistered,
    ErrorThresholdReached,
    AgentRestarted,
    RestartFailed,
    RestartCeilingReached,
    /// A validate-and-fix status was persisted for an item.
    WorkflowStatus,
    JobStarted,
    JobFinished,
}

impl FleetEventKind {
    /// Dot-separated event name.
    pub fn as_str(&self) -> &'static str {
        match self {
            FleetEventKind::AgentRegistered => "agent.registered",
            FleetEventKind::AgentUnregistered => "agent.unregistered",
            FleetEventKind::ErrorThresholdReached => "agent.error_threshold",
            FleetEventKind::AgentRestarted => "agent.restarted",
            FleetEventKind::RestartFailed => "agent.restart_failed",
            FleetEventKind::RestartCeilingReached => "agent.restart_ceiling",
            FleetEventKind::WorkflowStatus => "workflow.status",
            FleetEventKind::JobStarted => "job.started",
            FleetEventKind::JobFinished => "job.finished",
        }
    }

    /// Whether the event signals degraded capacity.
    pub fn is_alert(&self) -> bool {
        matches!(
            self,
            FleetEventKind::ErrorThresholdReached
                | FleetEventKind::RestartFailed
                | FleetEventKind::RestartCeilingReached
        )
    }
}

// ---------------------------------------------------------------------------
// FleetEvent
// ---------------------------------------------------------------------------

/// Envelope published on the bus.
///
/// Built with [`FleetEvent::new`] and the `with_*` builders.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetEvent {
    pub kind: FleetEventKind,
    /// Agent slot the event concerns, if any.
    pub slot: Option<SlotId>,
    /// Project code, if any.
    pub code: Option<String>,
    /// Manifest item id, if any.
    pub item: Option<String>,
    /// Event-specific data.
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl FleetEvent {
    pub fn new(kind: FleetEventKind) -> Self {
        Self {
            kind,
            slot: None,
            code: None,
            item: None,
            payload: serde_json::Value::Object(Default::default()),
            timestamp: Utc::now(),
        }
    }

    pub fn with_slot(mut self, slot: SlotId) -> Self {
        self.slot = Some(slot);
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_item(mut self, item: impl Into<String>) -> Self {
        self.item = Some(item.into());
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Default buffer capacity for the broadcast channel.
const DEFAULT_CAPACITY: usize = 256;

/// In-process fan-out event bus.
///
/// ```rust
/// use reelforge_events::bus::{EventBus, FleetEvent, FleetEventKind};
///
/// let bus = EventBus::default();
/// let mut rx = bus.subscribe();
///
/// bus.publish(FleetEvent::new(FleetEventKind::AgentRegistered).with_slot(0));
/// ```
pub struct EventBus {
    sender: broadcast::Sender<FleetEvent>,
}

impl EventBus {
    /// Create a bus with a specific channel capacity.
    ///
    /// Slow receivers past `capacity` observe `RecvError::Lagged`.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish to all current subscribers. Dropped if nobody listens.
    pub fn publish(&self, event: FleetEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_and_receive() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.publish(
            FleetEvent::new(FleetEventKind::AgentRestarted)
                .with_slot(2)
                .with_payload(serde_json::json!({"restart_count": 1})),
        );

        let got = rx.recv().await.unwrap();
        assert_eq!(got.kind, FleetEventKind::AgentRestarted);
        assert_eq!(got.slot, Some(2));
        assert_eq!(got.payload["restart_count"], 1);
    }

    #[tokio::test]
    async fn every_subscriber_sees_every_event() {
        let bus = EventBus::default();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(FleetEvent::new(FleetEventKind::JobStarted).with_code("AR1-0001"));

        assert_eq!(a.recv().await.unwrap().code.as_deref(), Some("AR1-0001"));
        assert_eq!(b.recv().await.unwrap().code.as_deref(), Some("AR1-0001"));
    }

    #[test]
    fn publish_without_subscribers_is_silent() {
        let bus = EventBus::new(4);
        bus.publish(FleetEvent::new(FleetEventKind::JobFinished));
    }

    #[test]
    fn alert_kinds() {
        assert!(FleetEventKind::RestartCeilingReached.is_alert());
        assert!(FleetEventKind::ErrorThresholdReached.is_alert());
        assert!(!FleetEventKind::AgentRestarted.is_alert());
        assert_eq!(FleetEventKind::WorkflowStatus.as_str(), "workflow.status");
    }

    #[test]
    fn event_serializes_kind_snake_case() {
        let event = FleetEvent::new(FleetEventKind::RestartFailed).with_item("loc1");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "restart_failed");
        assert_eq!(json["item"], "loc1");
    }
}
