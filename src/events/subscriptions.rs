//! Subscription bookkeeping in the `$subscription` table
//!
//! A row says: node `node_id` wants changes of `object_id` delivered to
//! session `session_id` under subscription `subscription_id`. The object id
//! is a record id, or a table name to watch inserts.

use super::SubscriptionRequest;
use crate::error::{DataError, Result};
use crate::store::Connection;
use crate::tools::{ColumnDef, ColumnRef, ColumnType, ColumnValue, Condition, Statement};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

pub const SUBSCRIPTION_TABLE: &str = "$subscription";

const COLUMNS: [&str; 4] = ["node_id", "session_id", "subscription_id", "object_id"];

pub fn define_table() -> Statement {
    Statement::DefineTable {
        table: SUBSCRIPTION_TABLE.to_string(),
        inherits: None,
        columns: COLUMNS
            .iter()
            .map(|c| ColumnDef::new(*c, ColumnType::Text))
            .collect(),
        unique: COLUMNS.iter().map(|c| c.to_string()).collect(),
        notify: false,
    }
}

/// Which key an unsubscribe matches on
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnsubscribeBy {
    /// A single subscription
    #[default]
    Subscription,
    /// Every subscription of a client session
    Instance,
    /// Every subscription served by a node
    Node,
}

impl UnsubscribeBy {
    fn column(&self) -> &'static str {
        match self {
            UnsubscribeBy::Subscription => "subscription_id",
            UnsubscribeBy::Instance => "session_id",
            UnsubscribeBy::Node => "node_id",
        }
    }
}

fn require(value: &str, name: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(DataError::validation(format!(
            "Subscription requires \"{}\"",
            name
        )));
    }
    Ok(())
}

/// Watch `object_ids` under `subscription`. Unless the subscription merges,
/// whatever it watched before is dropped first.
pub async fn subscribe(
    conn: &dyn Connection,
    subscription: &SubscriptionRequest,
    object_ids: &[String],
) -> Result<()> {
    require(&subscription.node_id, "nodeId")?;
    require(&subscription.event_key, "eventKey")?;
    require(&subscription.id, "id")?;

    if !subscription.merge {
        unsubscribe(conn, &subscription.id, UnsubscribeBy::Subscription).await?;
    }
    for object_id in object_ids {
        conn.execute(&Statement::Insert {
            table: SUBSCRIPTION_TABLE.to_string(),
            values: vec![
                ColumnValue::new(
                    "node_id",
                    Value::from(subscription.node_id.as_str()),
                    ColumnType::Text,
                ),
                ColumnValue::new(
                    "session_id",
                    Value::from(subscription.event_key.as_str()),
                    ColumnType::Text,
                ),
                ColumnValue::new(
                    "subscription_id",
                    Value::from(subscription.id.as_str()),
                    ColumnType::Text,
                ),
                ColumnValue::new("object_id", Value::from(object_id.as_str()), ColumnType::Text),
            ],
            ignore_conflict: true,
        })
        .await?;
    }
    debug!(
        subscription = %subscription.id,
        count = object_ids.len(),
        merge = subscription.merge,
        "Subscribed"
    );
    Ok(())
}

/// Remove subscriptions matching `key`; returns the number of rows removed
pub async fn unsubscribe(conn: &dyn Connection, key: &str, by: UnsubscribeBy) -> Result<u64> {
    let removed = conn
        .execute(&Statement::Delete {
            table: SUBSCRIPTION_TABLE.to_string(),
            condition: Condition::eq(ColumnRef::text(by.column()), key),
        })
        .await?;
    debug!(key, by = ?by, removed, "Unsubscribed");
    Ok(removed)
}

/// Object ids watched by a subscription, sorted
pub async fn subscribed(conn: &dyn Connection, subscription_id: &str) -> Result<Vec<String>> {
    let rows = conn
        .query(&Statement::select(
            SUBSCRIPTION_TABLE,
            &["object_id"],
            Condition::eq(ColumnRef::text("subscription_id"), subscription_id),
        ))
        .await?;
    let mut ids: Vec<String> = rows
        .iter()
        .filter_map(|r| r.get("object_id").and_then(Value::as_str).map(str::to_string))
        .collect();
    ids.sort();
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, Store};

    fn ids(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_replace_versus_merge() {
        let store = MemoryStore::new();
        let conn = store.begin().await.unwrap();
        conn.execute(&define_table()).await.unwrap();

        let sub = SubscriptionRequest::new("n1", "s1", "sub1");
        subscribe(conn.as_ref(), &sub, &ids(&["a", "b"])).await.unwrap();
        subscribe(conn.as_ref(), &sub, &ids(&["c"])).await.unwrap();
        assert_eq!(subscribed(conn.as_ref(), "sub1").await.unwrap(), ids(&["c"]));

        let merged = sub.clone().merged();
        subscribe(conn.as_ref(), &merged, &ids(&["d", "c"])).await.unwrap();
        assert_eq!(
            subscribed(conn.as_ref(), "sub1").await.unwrap(),
            ids(&["c", "d"])
        );
    }

    #[tokio::test]
    async fn test_unsubscribe_by_instance_and_node() {
        let store = MemoryStore::new();
        let conn = store.begin().await.unwrap();
        conn.execute(&define_table()).await.unwrap();

        subscribe(conn.as_ref(), &SubscriptionRequest::new("n1", "s1", "a"), &ids(&["x"]))
            .await
            .unwrap();
        subscribe(conn.as_ref(), &SubscriptionRequest::new("n1", "s1", "b"), &ids(&["y"]))
            .await
            .unwrap();
        subscribe(conn.as_ref(), &SubscriptionRequest::new("n2", "s2", "c"), &ids(&["z"]))
            .await
            .unwrap();

        assert_eq!(
            unsubscribe(conn.as_ref(), "s1", UnsubscribeBy::Instance)
                .await
                .unwrap(),
            2
        );
        assert_eq!(
            unsubscribe(conn.as_ref(), "n2", UnsubscribeBy::Node).await.unwrap(),
            1
        );
        assert!(subscribed(conn.as_ref(), "c").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_fields_rejected() {
        let store = MemoryStore::new();
        let conn = store.begin().await.unwrap();
        conn.execute(&define_table()).await.unwrap();
        let incomplete = SubscriptionRequest::new("n1", "", "sub1");
        let result = subscribe(conn.as_ref(), &incomplete, &ids(&["a"])).await;
        assert!(matches!(result, Err(DataError::Validation(_))));
    }
}
