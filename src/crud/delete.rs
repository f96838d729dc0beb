//! Record deletion, soft by default

use super::values::now;
use super::{CallContext, Crud};
use crate::auth::Target;
use crate::error::{DataError, Result};
use crate::feather::Feather;
use crate::store::Connection;
use crate::tools::case::{relation_column, table_name};
use crate::tools::{Action, ColumnRef, ColumnType, ColumnValue, Condition, Statement};
use futures::future::{try_join_all, BoxFuture};
use futures::FutureExt;
use serde_json::Value;
use tracing::debug;

impl Crud {
    /// Delete record `id` of feather `name` together with its children.
    ///
    /// Soft deletes flag the rows; hard deletes remove them.
    pub async fn delete(
        &self,
        conn: &dyn Connection,
        ctx: &CallContext,
        name: &str,
        id: &str,
        is_hard: bool,
    ) -> Result<bool> {
        let feather = self.feather(name)?;
        self.check_child(ctx, &feather, "delete")?;
        self.check_read_only(ctx, &feather)?;

        let located = self.locate(conn, &feather.name, id).await?.ok_or_else(|| {
            DataError::not_found(format!("Record \"{}\" of \"{}\" not found", id, feather.name))
        })?;
        if located.is_deleted {
            return Err(DataError::conflict(format!(
                "Record \"{}\" is already deleted",
                id
            )));
        }
        self.authorize(
            conn,
            ctx,
            Target::Record {
                id,
                feather: &located.object_type,
            },
            Action::CanDelete,
        )
        .await?;
        self.check_lock(ctx, id, &located.lock)?;

        let actual = self.feather(&located.object_type)?;
        self.delete_record(conn, ctx, &actual, located.pk, is_hard)
            .await?;
        if !ctx.cascade && !is_hard {
            self.write_log(conn, ctx, id, "DELETE", Value::Null).await?;
        }
        Ok(true)
    }

    /// Delete the row with internal key `pk` after its children and owned
    /// records
    pub(crate) fn delete_record<'a>(
        &'a self,
        conn: &'a dyn Connection,
        ctx: &'a CallContext,
        feather: &'a Feather,
        pk: i64,
        is_hard: bool,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            let table = table_name(&feather.name);
            let Some(row) = self.fetch_row(conn, &table, pk).await? else {
                return Ok(());
            };

            let mut dependents: Vec<(String, i64)> = Vec::new();
            for (key, spec) in &feather.properties {
                let Some(relation) = spec.relation_spec() else {
                    continue;
                };
                let condition = if let Some(back_reference) = relation.parent_of.as_deref() {
                    Condition::eq(
                        ColumnRef::new(relation_column(back_reference), ColumnType::BigInt),
                        pk,
                    )
                } else if spec.is_owned() {
                    match row.get(&relation_column(key)).and_then(Value::as_i64) {
                        Some(owned) => Condition::pk(owned),
                        None => continue,
                    }
                } else {
                    continue;
                };
                let rows = conn
                    .query(&Statement::select(
                        table_name(&relation.relation),
                        &["_pk", "object_type"],
                        condition.and(Condition::not_deleted()),
                    ))
                    .await?;
                dependents.extend(rows.iter().filter_map(|r| {
                    Some((
                        r.get("object_type")?.as_str()?.to_string(),
                        r.get("_pk")?.as_i64()?,
                    ))
                }));
            }

            let child_ctx = ctx.cascade();
            try_join_all(dependents.into_iter().map(|(object_type, child_pk)| {
                let child_ctx = &child_ctx;
                async move {
                    let child = self.feather(&object_type)?;
                    self.delete_record(conn, child_ctx, &child, child_pk, is_hard)
                        .await
                }
            }))
            .await?;

            if is_hard {
                conn.execute(&Statement::Delete {
                    table,
                    condition: Condition::pk(pk),
                })
                .await?;
            } else {
                conn.execute(&Statement::Update {
                    table,
                    values: vec![
                        ColumnValue::new("is_deleted", Value::Bool(true), ColumnType::Boolean),
                        ColumnValue::new("updated", Value::from(now()), ColumnType::Timestamp),
                        ColumnValue::new(
                            "updated_by",
                            Value::from(ctx.user.as_str()),
                            ColumnType::Text,
                        ),
                    ],
                    condition: Condition::pk(pk),
                })
                .await?;
            }
            debug!(feather = %feather.name, pk, hard = is_hard, "Deleted record");
            Ok(())
        }
        .boxed()
    }
}
