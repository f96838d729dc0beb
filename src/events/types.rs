//! Change notification types

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The change a notification reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeAction {
    Create,
    Update,
    Delete,
}

/// Subscription descriptor carried by a request
///
/// `id` names the subscription, `event_key` the client session receiving
/// events, `node_id` the server node whose channel delivers them. With
/// `merge` the new objects are added to the subscription instead of
/// replacing what it watched before.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionRequest {
    #[serde(default)]
    pub node_id: String,
    #[serde(default)]
    pub event_key: String,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub merge: bool,
}

impl SubscriptionRequest {
    pub fn new(
        node_id: impl Into<String>,
        event_key: impl Into<String>,
        id: impl Into<String>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            event_key: event_key.into(),
            id: id.into(),
            merge: false,
        }
    }

    pub fn merged(mut self) -> Self {
        self.merge = true;
        self
    }
}

/// Subscription reference inside a row notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionRef {
    pub id: String,
    pub event_key: String,
}

/// Row change received on a node channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub subscription: SubscriptionRef,
    pub action: ChangeAction,
    #[serde(default)]
    pub data: Value,
}

impl Notification {
    /// Id of the changed record
    pub fn record_id(&self) -> Option<&str> {
        self.data.get("id").and_then(Value::as_str)
    }
}

/// Change delivered to a client session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEvent {
    /// Session the event is addressed to
    pub event_key: String,
    pub subscription_id: String,
    pub action: ChangeAction,
    /// Current record for create/update, `{id}` for delete
    pub data: Value,
    /// ISO 8601 timestamp
    pub timestamp: String,
}

impl SessionEvent {
    pub fn new(notification: &Notification, data: Value) -> Self {
        Self {
            event_key: notification.subscription.event_key.clone(),
            subscription_id: notification.subscription.id.clone(),
            action: notification.action,
            data,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Sink for session events
pub trait EventEmitter: Send + Sync {
    fn emit(&self, event: SessionEvent);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_notification_from_trigger_payload() {
        let notification: Notification = serde_json::from_value(json!({
            "subscription": {"id": "sub1", "eventKey": "s1"},
            "action": "update",
            "data": {"id": "c1", "firstName": "Ann"}
        }))
        .unwrap();
        assert_eq!(notification.action, ChangeAction::Update);
        assert_eq!(notification.subscription.event_key, "s1");
        assert_eq!(notification.record_id(), Some("c1"));
    }

    #[test]
    fn test_subscription_request_defaults() {
        let request: SubscriptionRequest =
            serde_json::from_value(json!({"eventKey": "s1", "id": "sub1"})).unwrap();
        assert!(request.node_id.is_empty());
        assert!(!request.merge);
    }

    #[test]
    fn test_session_event_shape() {
        let notification = Notification {
            subscription: SubscriptionRef {
                id: "sub1".into(),
                event_key: "s1".into(),
            },
            action: ChangeAction::Delete,
            data: json!({"id": "c1"}),
        };
        let event = SessionEvent::new(&notification, json!({"id": "c1"}));
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["eventKey"], "s1");
        assert_eq!(value["subscriptionId"], "sub1");
        assert_eq!(value["action"], "delete");
    }
}
