//! Postgres backend on sqlx
//!
//! Statements are rendered by [`crate::tools::sql`]; DDL runs inside the
//! request transaction like any other statement. Row-change notifications
//! come from the `notify_subscribers()` trigger installed by [`Store::migrate`]
//! and are received with a dedicated `PgListener` connection.

use super::{Connection, NotificationStream, Row, Store, StoreNotification};
use crate::error::{DataError, Result};
use crate::tools::sql::{self, ident, SqlParam};
use crate::tools::types::ColumnType;
use crate::tools::Statement;
use anyhow::anyhow;
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use sqlx::postgres::{PgArguments, PgListener, PgPool, PgPoolOptions};
use sqlx::{Postgres, Row as _, Transaction};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Row-change trigger: inserts notify watchers of the table or any table it
/// inherits from, updates and deletes notify watchers of the record id. Oversized payloads carry only
/// the id; listeners re-fetch the record anyway.
const NOTIFY_FUNCTION: &str = r#"
CREATE OR REPLACE FUNCTION notify_subscribers() RETURNS trigger AS $$
DECLARE
  sub record;
  rec jsonb;
  act text;
  keys text[];
  payload text;
BEGIN
  IF TG_OP = 'INSERT' THEN
    rec := to_jsonb(NEW) - '_pk';
    act := 'create';
    keys := ARRAY(
      WITH RECURSIVE lineage(relid) AS (
        SELECT TG_RELID
        UNION ALL
        SELECT i.inhparent FROM pg_inherits i JOIN lineage l ON i.inhrelid = l.relid
      )
      SELECT c.relname::text FROM lineage JOIN pg_class c ON c.oid = lineage.relid);
  ELSIF TG_OP = 'UPDATE' THEN
    rec := to_jsonb(NEW) - '_pk';
    keys := ARRAY[NEW.id];
    IF NEW.is_deleted AND NOT COALESCE(OLD.is_deleted, false) THEN
      act := 'delete';
    ELSE
      act := 'update';
    END IF;
  ELSE
    rec := jsonb_build_object('id', OLD.id);
    act := 'delete';
    keys := ARRAY[OLD.id];
  END IF;

  IF octet_length(rec::text) > 7000 THEN
    rec := jsonb_build_object('id', rec->>'id');
  END IF;

  FOR sub IN
    SELECT DISTINCT node_id, subscription_id, session_id
    FROM "$subscription" WHERE object_id = ANY(keys)
  LOOP
    payload := jsonb_build_object(
      'subscription', jsonb_build_object('id', sub.subscription_id, 'eventKey', sub.session_id),
      'action', act,
      'data', rec)::text;
    PERFORM pg_notify(sub.node_id, payload);
  END LOOP;
  RETURN NULL;
END;
$$ LANGUAGE plpgsql;
"#;

type PgQuery<'q> = sqlx::query::Query<'q, Postgres, PgArguments>;

/// Postgres-backed store
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        info!(max_connections, "Connected to Postgres");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Store for PostgresStore {
    async fn begin(&self) -> Result<Arc<dyn Connection>> {
        let tx = self.pool.begin().await?;
        Ok(Arc::new(PgConnection {
            tx: Mutex::new(Some(tx)),
        }))
    }

    async fn listen(&self, channel: &str) -> Result<NotificationStream> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(channel).await?;
        info!(channel, "Listening for row notifications");
        let stream = listener.into_stream().map(|item| -> Result<StoreNotification> {
            let notification = item?;
            let payload: Value = serde_json::from_str(notification.payload())
                .map_err(|e| anyhow!("malformed notification payload: {}", e))?;
            Ok(StoreNotification {
                channel: notification.channel().to_string(),
                payload,
            })
        });
        Ok(stream.boxed())
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::raw_sql(NOTIFY_FUNCTION).execute(&self.pool).await?;
        debug!("Installed notify_subscribers()");
        Ok(())
    }
}

struct PgConnection {
    tx: Mutex<Option<Transaction<'static, Postgres>>>,
}

fn finished() -> DataError {
    anyhow!("transaction already finished").into()
}

fn bind_param<'q>(query: PgQuery<'q>, param: &SqlParam) -> PgQuery<'q> {
    match (param.kind, &param.value) {
        (_, Value::Null) => query.bind(Option::<String>::None),
        (ColumnType::Json, value) => query.bind(sqlx::types::Json(value.clone())),
        (ColumnType::Integer | ColumnType::BigInt, Value::Number(n)) if n.is_i64() => {
            query.bind(n.as_i64())
        }
        (ColumnType::Boolean, Value::Bool(b)) => query.bind(*b),
        (_, Value::String(s)) => query.bind(s.clone()),
        (_, other) => query.bind(other.to_string()),
    }
}

impl PgConnection {
    async fn define(&self, statement: &Statement) -> Result<()> {
        let mut guard = self.tx.lock().await;
        let tx = guard.as_mut().ok_or_else(finished)?;
        for command in sql::ddl(statement) {
            debug!(sql = %command, "DDL");
            sqlx::query(&command).execute(&mut **tx).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Connection for PgConnection {
    async fn query(&self, statement: &Statement) -> Result<Vec<Row>> {
        if let Statement::NextVal { sequence } = statement {
            let mut guard = self.tx.lock().await;
            let tx = guard.as_mut().ok_or_else(finished)?;
            let create = format!("CREATE SEQUENCE IF NOT EXISTS {}", ident(sequence));
            sqlx::query(&create).execute(&mut **tx).await?;
        }
        let Some(rendered) = sql::render(statement) else {
            self.define(statement).await?;
            return Ok(Vec::new());
        };
        let mut guard = self.tx.lock().await;
        let tx = guard.as_mut().ok_or_else(finished)?;
        let query = rendered
            .params
            .iter()
            .fold(sqlx::query(&rendered.sql), bind_param);
        let rows = query.fetch_all(&mut **tx).await?;
        rows.into_iter()
            .map(|row| -> Result<Row> {
                match row.try_get::<Value, _>("result")? {
                    Value::Object(map) => Ok(map),
                    other => Err(anyhow!("unexpected row shape: {}", other).into()),
                }
            })
            .collect()
    }

    async fn execute(&self, statement: &Statement) -> Result<u64> {
        let Some(rendered) = sql::render(statement) else {
            self.define(statement).await?;
            return Ok(0);
        };
        if matches!(statement, Statement::NextVal { .. }) {
            return Ok(self.query(statement).await?.len() as u64);
        }
        let mut guard = self.tx.lock().await;
        let tx = guard.as_mut().ok_or_else(finished)?;
        let query = rendered
            .params
            .iter()
            .fold(sqlx::query(&rendered.sql), bind_param);
        Ok(query.execute(&mut **tx).await?.rows_affected())
    }

    async fn commit(&self) -> Result<()> {
        let tx = self.tx.lock().await.take().ok_or_else(finished)?;
        tx.commit().await?;
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        if let Some(tx) = self.tx.lock().await.take() {
            tx.rollback().await?;
        }
        Ok(())
    }
}
