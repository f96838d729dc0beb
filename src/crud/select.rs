//! Record reads

use super::{CallContext, Crud};
use crate::error::Result;
use crate::events::{subscribe, unsubscribe, SubscriptionRequest, UnsubscribeBy};
use crate::feather::{Feather, PropertySpec};
use crate::store::{query_one, Connection, Row};
use crate::tools::case::{relation_column, table_name, to_snake_case};
use crate::tools::filter::{build_condition, build_order};
use crate::tools::{ColumnRef, ColumnType, Condition, Filter, OrderBy, Statement};
use futures::future::{try_join_all, BoxFuture};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

/// Options of a read
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Query {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<Filter>,
    /// Properties to return; all when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription: Option<SubscriptionRequest>,
    #[serde(default)]
    pub show_deleted: bool,
}

impl Query {
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn properties(mut self, properties: &[&str]) -> Self {
        self.properties = Some(properties.iter().map(|p| p.to_string()).collect());
        self
    }

    pub fn subscription(mut self, subscription: SubscriptionRequest) -> Self {
        self.subscription = Some(subscription);
        self
    }

    pub fn show_deleted(mut self) -> Self {
        self.show_deleted = true;
        self
    }

    fn project(&self, record: Map<String, Value>) -> Value {
        let Some(properties) = &self.properties else {
            return Value::Object(record);
        };
        Value::Object(
            record
                .into_iter()
                .filter(|(key, _)| properties.iter().any(|p| p == key))
                .collect(),
        )
    }
}

impl Crud {
    /// Read record `id` of feather `name` (`null` when it does not exist or
    /// is not visible), or every matching record when `id` is `None`.
    ///
    /// With a subscription the returned records are watched for changes; an
    /// unfiltered list also watches the feather's table for inserts.
    pub async fn select(
        &self,
        conn: &dyn Connection,
        ctx: &CallContext,
        name: &str,
        id: Option<&str>,
        query: &Query,
    ) -> Result<Value> {
        let feather = self.feather(name)?;
        self.check_child(ctx, &feather, "query")?;

        let table = table_name(&feather.name);
        let mut condition = if query.show_deleted {
            Condition::All
        } else {
            Condition::not_deleted()
        };
        if ctx.checks_authorization() && !ctx.cascade {
            condition = condition.and(
                self.authorizer
                    .read_condition(conn, &ctx.user, &feather.name)
                    .await?,
            );
        }

        if let Some(id) = id {
            let row = query_one(
                conn,
                &Statement::select(&table, &[], Condition::id(id).and(condition)),
            )
            .await?;
            let Some(row) = row else {
                return Ok(Value::Null);
            };
            let record = self.build_record(conn, &feather, &row).await?;
            if let Some(subscription) = &query.subscription {
                subscribe(conn, subscription, &[id.to_string()]).await?;
            }
            return Ok(query.project(record));
        }

        let filter = query.filter.clone().unwrap_or_default();
        let rows = conn
            .query(&Statement::Select {
                table: table.clone(),
                columns: Vec::new(),
                condition: condition.and(build_condition(&feather, &filter)?),
                order_by: build_order(&feather, &filter)?,
                offset: filter.offset,
                limit: filter.limit,
            })
            .await?;
        let records = try_join_all(rows.iter().map(|row| self.build_record(conn, &feather, row))).await?;
        debug!(feather = %feather.name, count = records.len(), "Selected records");

        if let Some(subscription) = &query.subscription {
            if records.is_empty() && !filter.criteria.is_empty() {
                unsubscribe(conn, &subscription.id, UnsubscribeBy::Subscription).await?;
            } else {
                let mut watched: Vec<String> = records
                    .iter()
                    .filter_map(|r| r.get("id").and_then(Value::as_str).map(str::to_string))
                    .collect();
                if filter.criteria.is_empty() {
                    watched.push(table);
                }
                subscribe(conn, subscription, &watched).await?;
            }
        }
        Ok(Value::Array(
            records.into_iter().map(|r| query.project(r)).collect(),
        ))
    }

    /// Record `id` as feather `name` sees it, regardless of grants or deletion
    pub async fn fetch(
        &self,
        conn: &dyn Connection,
        name: &str,
        id: &str,
    ) -> Result<Option<Value>> {
        let feather = self.feather(name)?;
        Ok(self
            .fetch_record(conn, &feather, id)
            .await?
            .map(Value::Object))
    }

    pub(crate) async fn fetch_record(
        &self,
        conn: &dyn Connection,
        feather: &Feather,
        id: &str,
    ) -> Result<Option<Map<String, Value>>> {
        let row = query_one(
            conn,
            &Statement::select(table_name(&feather.name), &[], Condition::id(id)),
        )
        .await?;
        match row {
            Some(row) => Ok(Some(self.build_record(conn, feather, &row).await?)),
            None => Ok(None),
        }
    }

    /// Turn a row into a record: camelCase keys, relations expanded and
    /// internal keys dropped
    pub(crate) fn build_record<'a>(
        &'a self,
        conn: &'a dyn Connection,
        feather: &'a Feather,
        row: &'a Row,
    ) -> BoxFuture<'a, Result<Map<String, Value>>> {
        async move {
            let mut record = Map::new();
            for (key, spec) in &feather.properties {
                let value = if spec.is_to_many() {
                    self.children(conn, spec, row).await?
                } else if spec.is_to_one() {
                    self.related(conn, spec, row.get(&relation_column(key))).await?
                } else {
                    row.get(&to_snake_case(key)).cloned().unwrap_or(Value::Null)
                };
                record.insert(key.clone(), value);
            }
            Ok(record)
        }
        .boxed()
    }

    async fn related(
        &self,
        conn: &dyn Connection,
        spec: &PropertySpec,
        key: Option<&Value>,
    ) -> Result<Value> {
        let (Some(relation), Some(pk)) = (spec.relation_spec(), key.and_then(Value::as_i64)) else {
            return Ok(Value::Null);
        };
        let target = self.feather(&relation.relation)?;
        let table = table_name(&target.name);

        if spec.is_owned() {
            return Ok(match self.fetch_row(conn, &table, pk).await? {
                Some(row) => Value::Object(self.build_record(conn, &target, &row).await?),
                None => Value::Null,
            });
        }

        let shown: Vec<(&str, String)> = relation
            .properties
            .iter()
            .filter(|p| {
                target
                    .properties
                    .get(p.as_str())
                    .is_some_and(|s| s.relation_spec().is_none())
            })
            .map(|p| (p.as_str(), to_snake_case(p)))
            .collect();
        let mut columns = vec!["id"];
        columns.extend(shown.iter().map(|(_, column)| column.as_str()));
        let Some(row) = query_one(conn, &Statement::select(table, &columns, Condition::pk(pk))).await?
        else {
            return Ok(Value::Null);
        };
        let mut reference = Map::new();
        reference.insert("id".into(), row.get("id").cloned().unwrap_or(Value::Null));
        for (property, column) in &shown {
            reference.insert(
                property.to_string(),
                row.get(column).cloned().unwrap_or(Value::Null),
            );
        }
        Ok(Value::Object(reference))
    }

    /// Live children of a composition, oldest first, without their back-reference
    async fn children(&self, conn: &dyn Connection, spec: &PropertySpec, row: &Row) -> Result<Value> {
        let (Some(relation), Some(pk)) = (spec.relation_spec(), row.get("_pk").and_then(Value::as_i64))
        else {
            return Ok(Value::Array(Vec::new()));
        };
        let Some(back_reference) = relation.parent_of.as_deref() else {
            return Ok(Value::Array(Vec::new()));
        };
        let mut child = self.feather(&relation.relation)?;
        let rows = conn
            .query(&Statement::Select {
                table: table_name(&child.name),
                columns: Vec::new(),
                condition: Condition::eq(
                    ColumnRef::new(relation_column(back_reference), ColumnType::BigInt),
                    pk,
                )
                .and(Condition::not_deleted()),
                order_by: vec![OrderBy::asc(ColumnRef::pk())],
                offset: None,
                limit: None,
            })
            .await?;
        child.properties.shift_remove(back_reference);
        let items = try_join_all(rows.iter().map(|r| self.build_record(conn, &child, r))).await?;
        Ok(Value::Array(items.into_iter().map(Value::Object).collect()))
    }
}
