//! Record creation

use super::values::{check_known, check_value, column_of, default_value, is_blank, now, relation_id};
use super::{CallContext, Crud};
use crate::auth::Target;
use crate::error::{DataError, Result};
use crate::feather::{Feather, PropertySpec, LOG};
use crate::store::{next_val, Connection};
use crate::tools::case::table_name;
use crate::tools::statement::PK_SEQUENCE;
use crate::tools::{patch, Action, ColumnRef, ColumnType, ColumnValue, Statement};
use futures::future::{try_join_all, BoxFuture};
use futures::FutureExt;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use tracing::debug;
use uuid::Uuid;

/// Identity of a freshly inserted record
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Inserted {
    pub id: String,
    pub pk: i64,
}

impl Crud {
    /// Create a record of feather `name`.
    ///
    /// Returns the patch turning `data` into the stored record, which carries
    /// the generated id, system fields and defaults.
    pub async fn insert(
        &self,
        conn: &dyn Connection,
        ctx: &CallContext,
        name: &str,
        data: Value,
    ) -> Result<Value> {
        let Value::Object(map) = &data else {
            return Err(DataError::validation(format!(
                "Data for \"{}\" must be an object",
                name
            )));
        };
        let feather = self.feather(name)?;
        let inserted = self.insert_record(conn, ctx, &feather.name, map.clone()).await?;
        let record = self
            .fetch_record(conn, &feather, &inserted.id)
            .await?
            .map(Value::Object)
            .ok_or_else(|| anyhow::anyhow!("inserted record \"{}\" vanished", inserted.id))?;
        if !ctx.cascade && feather.name != LOG {
            self.write_log(conn, ctx, &inserted.id, "POST", record.clone())
                .await?;
        }
        Ok(patch::to_value(&patch::diff(&data, &record)))
    }

    pub(crate) fn insert_record<'a>(
        &'a self,
        conn: &'a dyn Connection,
        ctx: &'a CallContext,
        name: &'a str,
        data: Map<String, Value>,
    ) -> BoxFuture<'a, Result<Inserted>> {
        async move {
            let feather = self.feather(name)?;
            self.check_child(ctx, &feather, "create")?;
            self.check_read_only(ctx, &feather)?;
            check_known(&feather, &data)?;

            let mut id = data
                .get("id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            if id.is_empty() || self.id_exists(conn, &id).await? {
                id = Uuid::new_v4().to_string();
            }

            self.authorize(conn, ctx, Target::Feather(&feather.name), Action::CanCreate)
                .await?;

            let record = self.stamp_new(conn, ctx, &feather, &id, &data).await?;
            for (key, spec) in &feather.properties {
                if !spec.is_unique || spec.autonumber.is_some() || spec.relation_spec().is_some() {
                    continue;
                }
                let value = &record[key];
                if is_blank(value) {
                    continue;
                }
                if let Some((column, kind)) = column_of(key, spec) {
                    self.check_unique(conn, &feather, key, ColumnRef::new(column, kind), value, None)
                        .await?;
                }
            }

            let pk = next_val(conn, PK_SEQUENCE).await?;

            let to_one: Vec<(&String, &PropertySpec)> = feather
                .properties
                .iter()
                .filter(|(_, spec)| spec.is_to_one())
                .collect();
            let child_ctx = ctx.cascade();
            let keys = try_join_all(to_one.iter().map(|(key, spec)| {
                self.resolve_to_one(conn, &child_ctx, &feather, key, spec, data.get(key.as_str()))
            }))
            .await?;
            let keys: HashMap<&str, Value> = to_one
                .iter()
                .map(|(key, _)| key.as_str())
                .zip(keys)
                .collect();

            let mut values = vec![ColumnValue::new("_pk", Value::from(pk), ColumnType::BigInt)];
            for (key, spec) in &feather.properties {
                let Some((column, kind)) = column_of(key, spec) else {
                    continue;
                };
                let value = match keys.get(key.as_str()) {
                    Some(value) => value.clone(),
                    None => record.get(key).cloned().unwrap_or(Value::Null),
                };
                values.push(ColumnValue::new(column, value, kind));
            }
            conn.execute(&Statement::Insert {
                table: table_name(&feather.name),
                values,
                ignore_conflict: false,
            })
            .await?;

            let mut cascades = Vec::new();
            for (key, spec) in &feather.properties {
                let Some(relation) = spec.relation_spec().filter(|_| spec.is_to_many()) else {
                    continue;
                };
                let Some(back_reference) = relation.parent_of.as_deref() else {
                    continue;
                };
                let items = match data.get(key) {
                    None | Some(Value::Null) => continue,
                    Some(Value::Array(items)) => items,
                    Some(_) => {
                        return Err(DataError::validation(format!(
                            "Value of \"{}\" on \"{}\" must be an array",
                            key, feather.name
                        )))
                    }
                };
                for item in items {
                    let Value::Object(item) = item else {
                        return Err(DataError::validation(format!(
                            "Items of \"{}\" on \"{}\" must be objects",
                            key, feather.name
                        )));
                    };
                    let mut item = item.clone();
                    item.insert(back_reference.to_string(), json!({ "id": id }));
                    cascades.push(self.insert_record(conn, &child_ctx, &relation.relation, item));
                }
            }
            let children = try_join_all(cascades).await?;

            debug!(
                feather = %feather.name,
                id = %id,
                pk,
                children = children.len(),
                "Inserted record"
            );
            Ok(Inserted { id, pk })
        }
        .boxed()
    }

    /// Primitive values of a new record: system fields, supplied values,
    /// autonumbers and defaults, each type-checked
    async fn stamp_new(
        &self,
        conn: &dyn Connection,
        ctx: &CallContext,
        feather: &Feather,
        id: &str,
        data: &Map<String, Value>,
    ) -> Result<Map<String, Value>> {
        let stamp = now();
        let mut record = Map::new();
        for (key, spec) in &feather.properties {
            if spec.relation_spec().is_some() {
                continue;
            }
            let value = match key.as_str() {
                "id" => Value::from(id),
                "objectType" => Value::from(feather.name.as_str()),
                "created" | "updated" => Value::from(stamp.as_str()),
                "createdBy" | "updatedBy" => Value::from(ctx.user.as_str()),
                "isDeleted" => Value::Bool(false),
                "lock" => Value::Null,
                _ => {
                    let supplied = data.get(key).cloned().unwrap_or(Value::Null);
                    let value = match &spec.autonumber {
                        Some(autonumber) if is_blank(&supplied) => {
                            Value::from(autonumber.render(next_val(conn, &autonumber.sequence).await?))
                        }
                        _ if supplied.is_null() => default_value(spec, &self.base_currency),
                        _ => supplied,
                    };
                    check_value(feather, key, spec, value)?
                }
            };
            if spec.is_required && is_blank(&value) {
                return Err(DataError::validation(format!(
                    "Property \"{}\" is required on \"{}\"",
                    key, feather.name
                )));
            }
            record.insert(key.clone(), value);
        }
        Ok(record)
    }

    /// Internal key stored for a to-one relation, inserting owned records first
    async fn resolve_to_one(
        &self,
        conn: &dyn Connection,
        ctx: &CallContext,
        feather: &Feather,
        key: &str,
        spec: &PropertySpec,
        value: Option<&Value>,
    ) -> Result<Value> {
        let Some(relation) = spec.relation_spec() else {
            return Ok(Value::Null);
        };
        let value = match value {
            None | Some(Value::Null) => spec.default.clone().unwrap_or(Value::Null),
            Some(value) => value.clone(),
        };
        if value.is_null() {
            if spec.is_required {
                return Err(DataError::validation(format!(
                    "Property \"{}\" is required on \"{}\"",
                    key, feather.name
                )));
            }
            return Ok(Value::Null);
        }
        if spec.is_owned() {
            let Value::Object(owned) = value else {
                return Err(DataError::validation(format!(
                    "Value of \"{}\" on \"{}\" must be an object",
                    key, feather.name
                )));
            };
            let inserted = self
                .insert_record(conn, ctx, &relation.relation, owned)
                .await?;
            return Ok(Value::from(inserted.pk));
        }
        let id = relation_id(&value).ok_or_else(|| {
            DataError::validation(format!(
                "Relation \"{}\" on \"{}\" requires an id",
                key, feather.name
            ))
        })?;
        Ok(Value::from(self.relation_pk(conn, &relation.relation, id).await?))
    }
}
