//! Advisory record locks
//!
//! A lock is a value in the `lock` column owned by a client session. It has
//! no expiry; sessions release their locks explicitly or in bulk when they
//! disconnect.

use super::values::now;
use super::{CallContext, Crud};
use crate::auth::Target;
use crate::error::{DataError, Result};
use crate::feather::{Lock, OBJECT};
use crate::store::Connection;
use crate::tools::case::table_name;
use crate::tools::{Action, ColumnRef, ColumnType, ColumnValue, Condition, Statement};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

/// Which locks to release; every given criterion must match
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnlockCriteria {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
}

impl UnlockCriteria {
    pub fn id(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::default()
        }
    }

    pub fn session(session_id: impl Into<String>) -> Self {
        Self {
            session_id: Some(session_id.into()),
            ..Self::default()
        }
    }

    pub fn node(node_id: impl Into<String>) -> Self {
        Self {
            node_id: Some(node_id.into()),
            ..Self::default()
        }
    }

    fn is_empty(&self) -> bool {
        self.id.is_none()
            && self.username.is_none()
            && self.session_id.is_none()
            && self.node_id.is_none()
    }
}

fn lock_column() -> ColumnRef {
    ColumnRef::new("lock", ColumnType::Json)
}

impl Crud {
    /// Lock record `id` for the caller's session. Locking a record the
    /// session already holds succeeds without change.
    pub async fn lock(&self, conn: &dyn Connection, ctx: &CallContext, id: &str) -> Result<bool> {
        let session = ctx
            .session_id
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| DataError::validation("Locking a record requires a session id"))?;
        let located = self
            .locate(conn, OBJECT, id)
            .await?
            .filter(|l| !l.is_deleted)
            .ok_or_else(|| DataError::not_found(format!("Record \"{}\" not found", id)))?;
        self.authorize(
            conn,
            ctx,
            Target::Record {
                id,
                feather: &located.object_type,
            },
            Action::CanUpdate,
        )
        .await?;

        if let Some(lock) = &located.lock {
            if lock.session_id == session {
                return Ok(true);
            }
            return Err(DataError::conflict(format!(
                "Record \"{}\" is locked by {}",
                id, lock.username
            )));
        }

        let lock = Lock {
            username: ctx.user.clone(),
            created: now(),
            node_id: ctx.node_id.clone(),
            session_id: session.to_string(),
        };
        let locked = conn
            .execute(&Statement::Update {
                table: table_name(OBJECT),
                values: vec![ColumnValue::new(
                    "lock",
                    serde_json::to_value(&lock)?,
                    ColumnType::Json,
                )],
                condition: Condition::pk(located.pk).and(Condition::is_null(lock_column())),
            })
            .await?;
        if locked == 0 {
            return Err(DataError::conflict(format!(
                "Record \"{}\" was locked concurrently",
                id
            )));
        }
        info!(id, session, user = %ctx.user, "Locked record");
        Ok(true)
    }

    /// Release every lock matching `criteria`; returns how many were released.
    /// Users other than super users only release their own locks.
    pub async fn unlock(
        &self,
        conn: &dyn Connection,
        ctx: &CallContext,
        criteria: &UnlockCriteria,
    ) -> Result<u64> {
        if criteria.is_empty() {
            return Err(DataError::validation(
                "Unlock requires an id, username, sessionId or nodeId",
            ));
        }
        let mut condition = Condition::is_not_null(lock_column());
        if let Some(id) = &criteria.id {
            condition = condition.and(Condition::id(id.as_str()));
        }
        for (field, value) in [
            ("username", &criteria.username),
            ("sessionId", &criteria.session_id),
            ("nodeId", &criteria.node_id),
        ] {
            if let Some(value) = value {
                condition = condition.and(Condition::eq(
                    ColumnRef::json_field("lock", field),
                    value.as_str(),
                ));
            }
        }
        if ctx.checks_authorization() {
            condition = condition.and(Condition::eq(
                ColumnRef::json_field("lock", "username"),
                ctx.user.as_str(),
            ));
        }
        let released = conn
            .execute(&Statement::Update {
                table: table_name(OBJECT),
                values: vec![ColumnValue::new("lock", Value::Null, ColumnType::Json)],
                condition,
            })
            .await?;
        debug!(criteria = ?criteria, released, "Released locks");
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::UnlockCriteria;
    use crate::crud::{CallContext, Query};
    use crate::error::DataError;
    use crate::store::Store;
    use crate::test_helpers::{admin, contact_feather, define, engine};
    use crate::tools::patch;
    use serde_json::json;

    #[tokio::test]
    async fn test_lock_excludes_other_sessions() {
        let (store, crud) = engine().await;
        define(&store, &crud, vec![contact_feather()]).await;
        let conn = store.begin().await.unwrap();
        crud.insert(conn.as_ref(), &admin(), "Contact", json!({"id": "c1", "firstName": "Ann"}))
            .await
            .unwrap();

        let a = CallContext::new("ann").session("s1").node("n1");
        let b = CallContext::new("bob").session("s2").node("n1");
        assert!(crud.lock(conn.as_ref(), &a, "c1").await.unwrap());
        assert!(crud.lock(conn.as_ref(), &a, "c1").await.unwrap());
        assert!(matches!(
            crud.lock(conn.as_ref(), &b, "c1").await,
            Err(DataError::Conflict(_))
        ));

        let record = crud
            .select(conn.as_ref(), &a, "Contact", Some("c1"), &Query::default())
            .await
            .unwrap();
        assert_eq!(record["lock"]["sessionId"], "s1");
        assert_eq!(record["lock"]["username"], "ann");
        assert_eq!(record["lock"]["nodeId"], "n1");

        let ops = patch::parse(&json!([{"op": "replace", "path": "/firstName", "value": "X"}]))
            .unwrap();
        assert!(matches!(
            crud.update(conn.as_ref(), &b, "Contact", "c1", &ops).await,
            Err(DataError::Conflict(_))
        ));
        assert!(matches!(
            crud.delete(conn.as_ref(), &b, "Contact", "c1", false).await,
            Err(DataError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_lock_requires_session() {
        let (store, crud) = engine().await;
        define(&store, &crud, vec![contact_feather()]).await;
        let conn = store.begin().await.unwrap();
        crud.insert(conn.as_ref(), &admin(), "Contact", json!({"id": "c1"}))
            .await
            .unwrap();
        assert!(matches!(
            crud.lock(conn.as_ref(), &CallContext::new("ann"), "c1").await,
            Err(DataError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_unlock_by_criteria() {
        let (store, crud) = engine().await;
        define(&store, &crud, vec![contact_feather()]).await;
        let conn = store.begin().await.unwrap();
        for id in ["c1", "c2", "c3"] {
            crud.insert(conn.as_ref(), &admin(), "Contact", json!({ "id": id }))
                .await
                .unwrap();
        }
        let a = CallContext::new("ann").session("s1").node("n1");
        let b = CallContext::new("bob").session("s2").node("n2");
        crud.lock(conn.as_ref(), &a, "c1").await.unwrap();
        crud.lock(conn.as_ref(), &a, "c2").await.unwrap();
        crud.lock(conn.as_ref(), &b, "c3").await.unwrap();

        assert!(matches!(
            crud.unlock(conn.as_ref(), &a, &UnlockCriteria::default()).await,
            Err(DataError::Validation(_))
        ));
        // ann can not release bob's lock
        assert_eq!(
            crud.unlock(conn.as_ref(), &a, &UnlockCriteria::id("c3"))
                .await
                .unwrap(),
            0
        );
        assert_eq!(
            crud.unlock(conn.as_ref(), &a, &UnlockCriteria::session("s1"))
                .await
                .unwrap(),
            2
        );
        assert_eq!(
            crud.unlock(conn.as_ref(), &a, &UnlockCriteria::session("s1"))
                .await
                .unwrap(),
            0
        );
        assert_eq!(
            crud.unlock(conn.as_ref(), &admin(), &UnlockCriteria::node("n2"))
                .await
                .unwrap(),
            1
        );
    }
}
