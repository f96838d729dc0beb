//! Relational store abstraction
//!
//! The engine talks to a [`Store`] through transactional [`Connection`]s and
//! only ever hands them [`Statement`]s. Two backends exist: Postgres (sqlx)
//! and an in-process store used for tests and zero-config runs.

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

use crate::error::Result;
use crate::tools::Statement;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

/// A result row keyed by column name
pub type Row = Map<String, Value>;

/// Stream of notifications received on a channel
pub type NotificationStream = BoxStream<'static, Result<StoreNotification>>;

/// Payload delivered by the store's row-change triggers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreNotification {
    pub channel: String,
    pub payload: Value,
}

/// A transaction on the store.
///
/// Connections are shared between concurrently running cascade branches, so
/// every method takes `&self`. Dropping a connection without committing
/// rolls it back.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Run a statement that returns rows
    async fn query(&self, statement: &Statement) -> Result<Vec<Row>>;

    /// Run a statement and return the number of affected rows
    async fn execute(&self, statement: &Statement) -> Result<u64>;

    async fn commit(&self) -> Result<()>;

    async fn rollback(&self) -> Result<()>;
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Open a connection with a fresh transaction
    async fn begin(&self) -> Result<Arc<dyn Connection>>;

    /// Subscribe to notifications on `channel` using a dedicated connection
    async fn listen(&self, channel: &str) -> Result<NotificationStream>;

    /// Install store-level objects (sequences, trigger functions)
    async fn migrate(&self) -> Result<()> {
        Ok(())
    }
}

/// First row of a result, if any
pub async fn query_one(conn: &dyn Connection, statement: &Statement) -> Result<Option<Row>> {
    Ok(conn.query(statement).await?.into_iter().next())
}

/// Next value of a sequence
pub async fn next_val(conn: &dyn Connection, sequence: &str) -> Result<i64> {
    let row = query_one(
        conn,
        &Statement::NextVal {
            sequence: sequence.to_string(),
        },
    )
    .await?;
    row.and_then(|r| r.get("value").and_then(Value::as_i64))
        .ok_or_else(|| anyhow::anyhow!("sequence \"{}\" returned no value", sequence).into())
}
