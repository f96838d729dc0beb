//! CRUD engine
//!
//! Reads and writes records of any feather against a [`Connection`]. The
//! engine owns the mapping between records (camelCase JSON with nested
//! relations) and rows (snake_case columns with internal keys), and the
//! cascades that keep compositions consistent. Trigger dispatch sits one
//! layer up, in the datasource.

mod context;
mod delete;
mod insert;
mod lock;
mod log;
mod select;
mod update;
pub mod values;

pub use context::{Authorization, CallContext};
pub use lock::UnlockCriteria;
pub use select::Query;

use crate::auth::{Authorizer, Target};
use crate::error::{DataError, Result};
use crate::feather::{Catalog, Feather, Lock, OBJECT};
use crate::store::{query_one, Connection, Row};
use crate::tools::case::table_name;
use crate::tools::statement::Operator;
use crate::tools::{Action, ColumnRef, Condition, Statement};
use serde_json::Value;
use std::sync::Arc;

/// Currency stamped on money defaults unless configured otherwise
pub const DEFAULT_CURRENCY: &str = "USD";

/// Where a stored record lives
#[derive(Debug, Clone)]
pub(crate) struct Located {
    pub pk: i64,
    pub object_type: String,
    pub is_deleted: bool,
    pub lock: Option<Lock>,
}

#[derive(Clone)]
pub struct Crud {
    catalog: Arc<Catalog>,
    authorizer: Authorizer,
    base_currency: String,
}

impl Crud {
    pub fn new(catalog: Arc<Catalog>, authorizer: Authorizer) -> Self {
        Self {
            catalog,
            authorizer,
            base_currency: DEFAULT_CURRENCY.to_string(),
        }
    }

    pub fn with_base_currency(mut self, currency: impl Into<String>) -> Self {
        self.base_currency = currency.into();
        self
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn authorizer(&self) -> &Authorizer {
        &self.authorizer
    }

    // ========================================================================
    // Shared checks
    // ========================================================================

    pub(crate) fn feather(&self, name: &str) -> Result<Feather> {
        self.catalog
            .get_feather(name, true)
            .ok_or_else(|| DataError::not_found(format!("Feather \"{}\" not found", name)))
    }

    /// Child feathers are only written through their parent
    fn check_child(&self, ctx: &CallContext, feather: &Feather, verb: &str) -> Result<()> {
        if feather.is_child && !ctx.cascade && !ctx.is_privileged() {
            return Err(DataError::validation(format!(
                "Can not {} \"{}\" directly because it is a child feather",
                verb, feather.name
            )));
        }
        Ok(())
    }

    fn check_read_only(&self, ctx: &CallContext, feather: &Feather) -> Result<()> {
        if feather.is_read_only && !ctx.is_privileged() {
            return Err(DataError::unauthorized(format!(
                "Feather \"{}\" is read only",
                feather.name
            )));
        }
        Ok(())
    }

    async fn authorize(
        &self,
        conn: &dyn Connection,
        ctx: &CallContext,
        target: Target<'_>,
        action: Action,
    ) -> Result<()> {
        if ctx.cascade || !ctx.checks_authorization() {
            return Ok(());
        }
        if !self
            .authorizer
            .is_authorized(conn, &ctx.user, target, action)
            .await?
        {
            let subject = match target {
                Target::Feather(name) => name.to_string(),
                Target::Record { id, .. } => id.to_string(),
            };
            let verb = match action {
                Action::CanCreate => "create",
                Action::CanRead => "read",
                Action::CanUpdate => "update",
                Action::CanDelete => "delete",
            };
            return Err(DataError::unauthorized(format!(
                "Not authorized to {} \"{}\"",
                verb, subject
            )));
        }
        Ok(())
    }

    /// Reject writes to a record locked by another session
    fn check_lock(&self, ctx: &CallContext, id: &str, lock: &Option<Lock>) -> Result<()> {
        if let Some(lock) = lock {
            if ctx.session_id.as_deref() != Some(lock.session_id.as_str()) {
                return Err(DataError::conflict(format!(
                    "Record \"{}\" is locked by {}",
                    id, lock.username
                )));
            }
        }
        Ok(())
    }

    // ========================================================================
    // Row access
    // ========================================================================

    /// Internal key, type and state of record `id` in `feather`'s table family
    pub(crate) async fn locate(
        &self,
        conn: &dyn Connection,
        feather: &str,
        id: &str,
    ) -> Result<Option<Located>> {
        let row = query_one(
            conn,
            &Statement::select(
                table_name(feather),
                &["_pk", "object_type", "is_deleted", "lock"],
                Condition::id(id),
            ),
        )
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let pk = row
            .get("_pk")
            .and_then(Value::as_i64)
            .ok_or_else(|| anyhow::anyhow!("record \"{}\" has no internal key", id))?;
        let lock = match row.get("lock") {
            None | Some(Value::Null) => None,
            Some(value) => Some(serde_json::from_value(value.clone())?),
        };
        Ok(Some(Located {
            pk,
            object_type: row
                .get("object_type")
                .and_then(Value::as_str)
                .unwrap_or(feather)
                .to_string(),
            is_deleted: row.get("is_deleted").and_then(Value::as_bool).unwrap_or(false),
            lock,
        }))
    }

    /// Every column of the row with internal key `pk`, read from `table`
    pub(crate) async fn fetch_row(
        &self,
        conn: &dyn Connection,
        table: &str,
        pk: i64,
    ) -> Result<Option<Row>> {
        query_one(conn, &Statement::select(table, &[], Condition::pk(pk))).await
    }

    /// Internal key of the live record `id` related through `feather`
    async fn relation_pk(&self, conn: &dyn Connection, feather: &str, id: &str) -> Result<i64> {
        let row = query_one(
            conn,
            &Statement::select(
                table_name(feather),
                &["_pk"],
                Condition::id(id).and(Condition::not_deleted()),
            ),
        )
        .await?;
        row.and_then(|r| r.get("_pk").and_then(Value::as_i64))
            .ok_or_else(|| {
                DataError::validation(format!(
                    "Related \"{}\" record \"{}\" not found",
                    feather, id
                ))
            })
    }

    /// Whether any record of any feather already uses `id`
    async fn id_exists(&self, conn: &dyn Connection, id: &str) -> Result<bool> {
        Ok(query_one(
            conn,
            &Statement::select(table_name(OBJECT), &["_pk"], Condition::id(id)),
        )
        .await?
        .is_some())
    }

    /// Conflict when another live record holds `value` in a unique property
    async fn check_unique(
        &self,
        conn: &dyn Connection,
        feather: &Feather,
        property: &str,
        column: ColumnRef,
        value: &Value,
        except: Option<i64>,
    ) -> Result<()> {
        let owner = feather
            .properties
            .get(property)
            .and_then(|p| p.inherited_from.clone())
            .unwrap_or_else(|| feather.name.clone());
        let mut condition =
            Condition::eq(column, value.clone()).and(Condition::not_deleted());
        if let Some(pk) = except {
            condition = condition.and(Condition::Compare {
                column: ColumnRef::pk(),
                op: Operator::NotEq,
                value: Value::from(pk),
            });
        }
        let taken = query_one(
            conn,
            &Statement::select(table_name(&owner), &["_pk"], condition),
        )
        .await?
        .is_some();
        if taken {
            return Err(DataError::conflict(format!(
                "Value {} for property \"{}\" on \"{}\" is already used",
                value, property, feather.name
            )));
        }
        Ok(())
    }
}
