//! Event bus for broadcasting session events to WebSocket clients

use super::{EventEmitter, SessionEvent};
use tokio::sync::broadcast;
use tracing::debug;

/// Default broadcast channel capacity
const DEFAULT_CAPACITY: usize = 1024;

/// Event bus that distributes SessionEvents via `tokio::sync::broadcast`
///
/// Fire-and-forget: emitting never blocks, never panics.
/// If no session is connected, events are silently dropped.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SessionEvent>,
}

impl EventBus {
    /// Create a new EventBus with the given channel capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to receive events (for WebSocket sessions)
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }

    /// Number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl EventEmitter for EventBus {
    fn emit(&self, event: SessionEvent) {
        let action = format!("{:?}", event.action);
        let event_key = event.event_key.clone();
        if let Ok(n) = self.sender.send(event) {
            debug!(
                event_key = %event_key,
                action = %action,
                subscribers = n,
                "SessionEvent emitted"
            );
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{ChangeAction, Notification, SubscriptionRef};
    use serde_json::json;

    fn event(session: &str) -> SessionEvent {
        let notification = Notification {
            subscription: SubscriptionRef {
                id: "sub1".into(),
                event_key: session.into(),
            },
            action: ChangeAction::Create,
            data: json!({"id": "c1"}),
        };
        SessionEvent::new(&notification, json!({"id": "c1", "name": "Ann"}))
    }

    #[test]
    fn test_emit_without_subscriber_no_panic() {
        let bus = EventBus::default();
        bus.emit(event("s1"));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_emit_reaches_every_subscriber() {
        let bus = EventBus::default();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        bus.emit(event("s1"));

        assert_eq!(rx1.try_recv().unwrap().event_key, "s1");
        assert_eq!(rx2.try_recv().unwrap().data["name"], "Ann");
    }

    #[test]
    fn test_clone_shares_channel() {
        let bus = EventBus::default();
        let bus2 = bus.clone();
        let mut rx = bus.subscribe();

        bus2.emit(event("s2"));

        let received = rx.try_recv().unwrap();
        assert_eq!(received.event_key, "s2");
        assert_eq!(received.action, ChangeAction::Create);
    }
}
