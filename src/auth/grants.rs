//! Role membership and grant evaluation
//!
//! Grants live in `$auth`, keyed by an object id that is either a record id
//! or a feather name. A decision checks the record first, then each feather
//! from the record's own up to `Object`. At every level a grant of `true`
//! from any of the user's roles allows, otherwise a `false` denies, and a
//! level with no opinion falls through. No opinion anywhere denies.

use crate::error::{DataError, Result};
use crate::feather::{Catalog, Grant, OBJECT};
use crate::store::{query_one, Connection};
use crate::tools::case::table_name;
use crate::tools::sql::AUTH_TABLE;
use crate::tools::statement::Operator;
use crate::tools::{Action, ColumnDef, ColumnRef, ColumnType, ColumnValue, Condition, Statement};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

pub const ROLE_MEMBER_TABLE: &str = "$role_member";

/// Role every user belongs to
pub const EVERYONE: &str = "everyone";

/// Role whose members bypass grant checks unless configured otherwise
pub const DEFAULT_SUPER_ROLE: &str = "administrator";

/// What a permission check is about
#[derive(Debug, Clone, Copy)]
pub enum Target<'a> {
    Feather(&'a str),
    Record { id: &'a str, feather: &'a str },
}

pub fn define_tables() -> Vec<Statement> {
    let flag = |name: &str| ColumnDef::new(name, ColumnType::Boolean);
    vec![
        Statement::DefineTable {
            table: AUTH_TABLE.to_string(),
            inherits: None,
            columns: vec![
                ColumnDef::new("object_id", ColumnType::Text),
                ColumnDef::new("role", ColumnType::Text),
                flag("can_create"),
                flag("can_read"),
                flag("can_update"),
                flag("can_delete"),
            ],
            unique: vec!["object_id".to_string(), "role".to_string()],
            notify: false,
        },
        Statement::DefineTable {
            table: ROLE_MEMBER_TABLE.to_string(),
            inherits: None,
            columns: vec![
                ColumnDef::new("role", ColumnType::Text),
                ColumnDef::new("member", ColumnType::Text),
            ],
            unique: vec!["role".to_string(), "member".to_string()],
            notify: false,
        },
    ]
}

fn by_object(object_id: &str) -> Condition {
    Condition::eq(ColumnRef::text("object_id"), object_id)
}

fn flag(value: Option<bool>) -> Value {
    value.map(Value::Bool).unwrap_or(Value::Null)
}

/// Replace the grant of `role` on `object_id`
pub async fn write_grant(
    conn: &dyn Connection,
    object_id: &str,
    role: &str,
    grant: &Grant,
) -> Result<()> {
    conn.execute(&Statement::Delete {
        table: AUTH_TABLE.to_string(),
        condition: by_object(object_id).and(Condition::eq(ColumnRef::text("role"), role)),
    })
    .await?;
    conn.execute(&Statement::Insert {
        table: AUTH_TABLE.to_string(),
        values: vec![
            ColumnValue::new("object_id", Value::from(object_id), ColumnType::Text),
            ColumnValue::new("role", Value::from(role), ColumnType::Text),
            ColumnValue::new("can_create", flag(grant.can_create), ColumnType::Boolean),
            ColumnValue::new("can_read", flag(grant.can_read), ColumnType::Boolean),
            ColumnValue::new("can_update", flag(grant.can_update), ColumnType::Boolean),
            ColumnValue::new("can_delete", flag(grant.can_delete), ColumnType::Boolean),
        ],
        ignore_conflict: false,
    })
    .await?;
    debug!(object_id, role, "Wrote grant");
    Ok(())
}

/// Remove every grant on `object_id`
pub async fn remove_grants(conn: &dyn Connection, object_id: &str) -> Result<()> {
    conn.execute(&Statement::Delete {
        table: AUTH_TABLE.to_string(),
        condition: by_object(object_id),
    })
    .await?;
    Ok(())
}

/// Authorization gate
#[derive(Clone)]
pub struct Authorizer {
    catalog: Arc<Catalog>,
    super_role: String,
}

impl Authorizer {
    pub fn new(catalog: Arc<Catalog>, super_role: impl Into<String>) -> Self {
        Self {
            catalog,
            super_role: super_role.into(),
        }
    }

    pub fn super_role(&self) -> &str {
        &self.super_role
    }

    /// The user, `everyone`, and every role reachable through membership
    pub async fn roles(&self, conn: &dyn Connection, user: &str) -> Result<Vec<String>> {
        let mut roles = vec![user.to_string(), EVERYONE.to_string()];
        let mut frontier = roles.clone();
        while !frontier.is_empty() {
            let rows = conn
                .query(&Statement::select(
                    ROLE_MEMBER_TABLE,
                    &["role"],
                    Condition::Compare {
                        column: ColumnRef::text("member"),
                        op: Operator::In,
                        value: Value::from(frontier.clone()),
                    },
                ))
                .await?;
            frontier = Vec::new();
            for role in rows
                .iter()
                .filter_map(|r| r.get("role").and_then(Value::as_str))
            {
                if !roles.iter().any(|r| r == role) {
                    roles.push(role.to_string());
                    frontier.push(role.to_string());
                }
            }
        }
        Ok(roles)
    }

    pub async fn is_super_user(&self, conn: &dyn Connection, user: &str) -> Result<bool> {
        Ok(self
            .roles(conn, user)
            .await?
            .iter()
            .any(|r| *r == self.super_role))
    }

    async fn level(
        &self,
        conn: &dyn Connection,
        object_id: &str,
        roles: &[String],
        action: Action,
    ) -> Result<Option<bool>> {
        let rows = conn
            .query(&Statement::select(
                AUTH_TABLE,
                &[action.column()],
                by_object(object_id).and(Condition::Compare {
                    column: ColumnRef::text("role"),
                    op: Operator::In,
                    value: Value::from(roles.to_vec()),
                }),
            ))
            .await?;
        let values: Vec<bool> = rows
            .iter()
            .filter_map(|r| r.get(action.column()).and_then(Value::as_bool))
            .collect();
        Ok(if values.contains(&true) {
            Some(true)
        } else if values.contains(&false) {
            Some(false)
        } else {
            None
        })
    }

    async fn decide(
        &self,
        conn: &dyn Connection,
        roles: &[String],
        target: Target<'_>,
        action: Action,
    ) -> Result<bool> {
        let feather = match target {
            Target::Feather(name) => name,
            Target::Record { id, feather } => {
                if let Some(decision) = self.level(conn, id, roles, action).await? {
                    return Ok(decision);
                }
                feather
            }
        };
        for name in self.catalog.ancestry(feather) {
            if let Some(decision) = self.level(conn, &name, roles, action).await? {
                return Ok(decision);
            }
        }
        Ok(false)
    }

    pub async fn is_authorized(
        &self,
        conn: &dyn Connection,
        user: &str,
        target: Target<'_>,
        action: Action,
    ) -> Result<bool> {
        let roles = self.roles(conn, user).await?;
        if roles.iter().any(|r| *r == self.super_role) {
            return Ok(true);
        }
        self.decide(conn, &roles, target, action).await
    }

    /// Row filter restricting a select on `feather` to records `user` may
    /// read. Rows of descendant feathers are judged by their own feather.
    pub async fn read_condition(
        &self,
        conn: &dyn Connection,
        user: &str,
        feather: &str,
    ) -> Result<Condition> {
        let roles = self.roles(conn, user).await?;
        if roles.iter().any(|r| *r == self.super_role) {
            return Ok(Condition::All);
        }
        let mut readable = Vec::new();
        for name in self.catalog.descendants(feather) {
            if self
                .decide(conn, &roles, Target::Feather(&name), Action::CanRead)
                .await?
            {
                readable.push(name);
            }
        }
        Ok(Condition::Authorized {
            roles,
            action: Action::CanRead,
            readable,
        })
    }

    /// Feather of a stored record
    pub async fn record_feather(&self, conn: &dyn Connection, id: &str) -> Result<Option<String>> {
        let row = query_one(
            conn,
            &Statement::select(table_name(OBJECT), &["object_type"], Condition::id(id)),
        )
        .await?;
        Ok(row.and_then(|r| r.get("object_type").and_then(Value::as_str).map(str::to_string)))
    }

    /// Write a grant on a feather (super users only) or on a record (users
    /// who may update it)
    pub async fn save_authorization(
        &self,
        conn: &dyn Connection,
        actor: &str,
        object_id: &str,
        role: &str,
        grant: &Grant,
    ) -> Result<()> {
        if self.catalog.get_feather(object_id, false).is_none() {
            let feather = self
                .record_feather(conn, object_id)
                .await?
                .ok_or_else(|| DataError::not_found(format!("Object \"{}\" not found", object_id)))?;
            return self
                .save_record_authorization(conn, actor, object_id, &feather, role, grant)
                .await;
        }
        if !self.is_super_user(conn, actor).await? {
            return Err(DataError::unauthorized(format!(
                "Only {} may change authorization on feather \"{}\"",
                self.super_role, object_id
            )));
        }
        write_grant(conn, object_id, role, grant).await?;
        info!(object_id, role, "Saved feather authorization");
        Ok(())
    }

    async fn save_record_authorization(
        &self,
        conn: &dyn Connection,
        actor: &str,
        id: &str,
        feather: &str,
        role: &str,
        grant: &Grant,
    ) -> Result<()> {
        let allowed = self
            .is_authorized(conn, actor, Target::Record { id, feather }, Action::CanUpdate)
            .await?;
        if !allowed {
            return Err(DataError::unauthorized(format!(
                "Not authorized to change authorization on \"{}\"",
                id
            )));
        }
        write_grant(conn, id, role, grant).await?;
        info!(object_id = id, role, "Saved record authorization");
        Ok(())
    }

    /// Add `member` (a user or another role) to `role`
    pub async fn grant_role(
        &self,
        conn: &dyn Connection,
        actor: &str,
        role: &str,
        member: &str,
    ) -> Result<()> {
        if !self.is_super_user(conn, actor).await? {
            return Err(DataError::unauthorized(format!(
                "Only {} may grant roles",
                self.super_role
            )));
        }
        conn.execute(&Statement::Insert {
            table: ROLE_MEMBER_TABLE.to_string(),
            values: vec![
                ColumnValue::new("role", Value::from(role), ColumnType::Text),
                ColumnValue::new("member", Value::from(member), ColumnType::Text),
            ],
            ignore_conflict: true,
        })
        .await?;
        info!(role, member, "Granted role");
        Ok(())
    }
}
