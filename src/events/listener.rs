//! Long-lived listening on a node notification channel

use super::Notification;
use crate::error::{DataError, Result};
use crate::store::Store;
use crate::tools::case::camelize;
use async_trait::async_trait;
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Receives notifications from a channel
#[async_trait]
pub trait NotificationHandler: Send + Sync {
    async fn handle(&self, notification: Notification) -> Result<()>;
}

#[async_trait]
impl NotificationHandler for mpsc::UnboundedSender<Notification> {
    async fn handle(&self, notification: Notification) -> Result<()> {
        self.send(notification)
            .map_err(|_| DataError::Internal(anyhow::anyhow!("notification receiver dropped")))
    }
}

/// Start listening on `channel`. Returns once the channel is being listened
/// to; notifications are then handed to `handler` from a background task
/// until the store closes the stream.
pub async fn listen(
    store: Arc<dyn Store>,
    channel: &str,
    handler: Arc<dyn NotificationHandler>,
) -> Result<JoinHandle<()>> {
    let mut stream = store.listen(channel).await?;
    let channel = channel.to_string();
    Ok(tokio::spawn(async move {
        while let Some(item) = stream.next().await {
            let payload = match item {
                Ok(n) => n.payload,
                Err(e) => {
                    error!(channel = %channel, error = %e, "Notification stream error");
                    continue;
                }
            };
            match serde_json::from_value::<Notification>(camelize(payload)) {
                Ok(notification) => {
                    if let Err(e) = handler.handle(notification).await {
                        warn!(channel = %channel, error = %e, "Notification handler failed");
                    }
                }
                Err(e) => warn!(channel = %channel, error = %e, "Malformed notification"),
            }
        }
        info!(channel = %channel, "Notification stream closed");
    }))
}
