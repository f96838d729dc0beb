//! Fan-out of row notifications to client sessions
//!
//! The receiver listens on the node's channel. Create and update events are
//! re-read so sessions get the full record with relations, then published as
//! [`SessionEvent`]s.

use super::Datasource;
use crate::error::Result;
use crate::events::{listen, ChangeAction, EventEmitter, Notification, NotificationHandler, SessionEvent};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

pub struct Receiver {
    datasource: Arc<Datasource>,
    emitter: Arc<dyn EventEmitter>,
}

impl Receiver {
    pub fn new(datasource: Arc<Datasource>, emitter: Arc<dyn EventEmitter>) -> Self {
        Self {
            datasource,
            emitter,
        }
    }

    /// Current state of the record a notification reports on
    async fn current(&self, notification: &Notification) -> Result<Option<Value>> {
        let Some(id) = notification.record_id() else {
            return Ok(None);
        };
        let conn = self.datasource.store().begin().await?;
        let crud = self.datasource.crud();
        let feather = match notification.data.get("objectType").and_then(Value::as_str) {
            Some(name) => Some(name.to_string()),
            None => crud.authorizer().record_feather(conn.as_ref(), id).await?,
        };
        let record = match feather {
            Some(name) if crud.catalog().get_feather(&name, false).is_some() => {
                crud.fetch(conn.as_ref(), &name, id).await?
            }
            _ => None,
        };
        conn.rollback().await?;
        Ok(record)
    }
}

#[async_trait]
impl NotificationHandler for Receiver {
    async fn handle(&self, notification: Notification) -> Result<()> {
        let data = match notification.action {
            ChangeAction::Create | ChangeAction::Update => self
                .current(&notification)
                .await?
                .unwrap_or_else(|| notification.data.clone()),
            ChangeAction::Delete => notification.data.clone(),
        };
        debug!(
            subscription = %notification.subscription.id,
            action = ?notification.action,
            id = ?notification.record_id(),
            "Publishing session event"
        );
        self.emitter.emit(SessionEvent::new(&notification, data));
        Ok(())
    }
}

/// Listen on the datasource's node channel and publish every notification to
/// `emitter`
pub async fn start(
    datasource: Arc<Datasource>,
    emitter: Arc<dyn EventEmitter>,
) -> Result<JoinHandle<()>> {
    let store = datasource.store().clone();
    let node_id = datasource.node_id().to_string();
    let handle = listen(
        store,
        &node_id,
        Arc::new(Receiver::new(datasource, emitter)),
    )
    .await?;
    info!(node = %node_id, "Listening for change notifications");
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasource::Request;
    use crate::events::{EventBus, SubscriptionRequest};
    use crate::test_helpers::{contact_feather, datasource, define};
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_update_event_carries_current_record() {
        let (store, ds) = datasource().await;
        define(&store, ds.crud(), vec![contact_feather()]).await;
        let ds = Arc::new(ds);
        let bus = Arc::new(EventBus::new(16));
        let mut events = bus.subscribe();
        let _task = start(ds.clone(), bus.clone()).await.unwrap();

        ds.request(Request::post(
            "Contact",
            "ann",
            json!({"id": "c1", "firstName": "Ann", "lastName": "Lee"}),
        ))
        .await
        .unwrap();
        ds.request(
            Request::get("Contact", "ann")
                .id("c1")
                .session("s1")
                .subscription(SubscriptionRequest::new("", "s1", "sub1")),
        )
        .await
        .unwrap();
        ds.request(Request::patch(
            "Contact",
            "ann",
            "c1",
            json!([{"op": "replace", "path": "/firstName", "value": "Annie"}]),
        ))
        .await
        .unwrap();

        let event = timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.event_key, "s1");
        assert_eq!(event.subscription_id, "sub1");
        assert_eq!(event.action, ChangeAction::Update);
        assert_eq!(event.data["firstName"], "Annie");
        assert_eq!(event.data["lastName"], "Lee");
        assert_eq!(event.data["objectType"], "Contact");
    }
}
