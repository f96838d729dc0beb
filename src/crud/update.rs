//! Record updates and composition reconciliation

use super::values::{check_known, check_value, column_of, is_blank, now, relation_id};
use super::{CallContext, Crud};
use crate::auth::Target;
use crate::error::{DataError, Result};
use crate::feather::{Feather, PropertySpec, Relation};
use crate::store::Connection;
use crate::tools::case::{relation_column, table_name};
use crate::tools::{patch, Action, ColumnRef, ColumnType, ColumnValue, Condition, PatchOp, Statement};
use futures::future::{try_join_all, BoxFuture};
use futures::FutureExt;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};
use tracing::debug;
use uuid::Uuid;

/// Fields a patch can never change
const IMMUTABLE: [&str; 5] = ["id", "objectType", "created", "createdBy", "isDeleted"];

impl Crud {
    /// Apply a JSON patch to record `id` of feather `name`.
    ///
    /// Returns the patch from the record the caller asked for to the record
    /// actually stored. A successful update always releases the lock.
    pub async fn update(
        &self,
        conn: &dyn Connection,
        ctx: &CallContext,
        name: &str,
        id: &str,
        patch: &[PatchOp],
    ) -> Result<Value> {
        let feather = self.feather(name)?;
        self.check_child(ctx, &feather, "update")?;
        self.check_read_only(ctx, &feather)?;

        let located = self
            .locate(conn, &feather.name, id)
            .await?
            .filter(|l| !l.is_deleted)
            .ok_or_else(|| {
                DataError::not_found(format!("Record \"{}\" of \"{}\" not found", id, feather.name))
            })?;
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
        self.check_lock(ctx, id, &located.lock)?;

        let actual = self.feather(&located.object_type)?;
        let old = self
            .fetch_record(conn, &actual, id)
            .await?
            .ok_or_else(|| DataError::not_found(format!("Record \"{}\" not found", id)))?;
        let intended = patch::apply(Value::Object(old.clone()), patch)?;
        let Value::Object(new) = intended.clone() else {
            return Err(DataError::validation("Patch must leave the record an object"));
        };

        self.update_record(conn, ctx, &actual, located.pk, old.clone(), new)
            .await?;

        let stored = self
            .fetch_record(conn, &actual, id)
            .await?
            .map(Value::Object)
            .ok_or_else(|| anyhow::anyhow!("updated record \"{}\" vanished", id))?;
        if !ctx.cascade {
            let change = patch::to_value(&patch::diff(&Value::Object(old), &stored));
            self.write_log(conn, ctx, id, "PATCH", change).await?;
        }
        Ok(patch::to_value(&patch::diff(&intended, &stored)))
    }

    /// Persist `new` over `old` for the row with internal key `pk`. Relation
    /// cascades run first; the row's own columns go out in one statement
    /// once they have all completed.
    pub(crate) fn update_record<'a>(
        &'a self,
        conn: &'a dyn Connection,
        ctx: &'a CallContext,
        feather: &'a Feather,
        pk: i64,
        old: Map<String, Value>,
        new: Map<String, Value>,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            let mut new = new;
            check_known(feather, &new)?;
            for key in IMMUTABLE {
                if let Some(value) = old.get(key) {
                    new.insert(key.to_string(), value.clone());
                }
            }
            new.insert("updated".into(), Value::from(now()));
            new.insert("updatedBy".into(), Value::from(ctx.user.as_str()));
            new.insert("lock".into(), Value::Null);
            if feather.has_etag() {
                new.insert("etag".into(), Value::from(Uuid::new_v4().to_string()));
            }
            let id = old
                .get("id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();

            let mut values = Vec::new();
            for (key, spec) in &feather.properties {
                if spec.relation_spec().is_some() {
                    continue;
                }
                let value = check_value(
                    feather,
                    key,
                    spec,
                    new.get(key).cloned().unwrap_or(Value::Null),
                )?;
                if spec.is_required && is_blank(&value) {
                    return Err(DataError::validation(format!(
                        "Property \"{}\" is required on \"{}\"",
                        key, feather.name
                    )));
                }
                if old.get(key) == Some(&value) {
                    continue;
                }
                let Some((column, kind)) = column_of(key, spec) else {
                    continue;
                };
                if spec.is_unique && !is_blank(&value) {
                    self.check_unique(
                        conn,
                        feather,
                        key,
                        ColumnRef::new(column.clone(), kind),
                        &value,
                        Some(pk),
                    )
                    .await?;
                }
                values.push(ColumnValue::new(column, value, kind));
            }

            let child_ctx = ctx.cascade();
            let mut cascades = Vec::new();
            for (key, spec) in &feather.properties {
                let Some(relation) = spec.relation_spec() else {
                    continue;
                };
                let before = old.get(key).cloned().unwrap_or(Value::Null);
                let after = new.get(key).cloned().unwrap_or(Value::Null);
                if spec.is_to_many() {
                    cascades.push(self.reconcile_children(conn, &child_ctx, relation, &id, before, after));
                    continue;
                }
                if after.is_null() && spec.is_required {
                    return Err(DataError::validation(format!(
                        "Property \"{}\" is required on \"{}\"",
                        key, feather.name
                    )));
                }
                if let Some(value) = self
                    .reconcile_to_one(conn, &child_ctx, feather, key, spec, before, after)
                    .await?
                {
                    values.push(value);
                }
            }
            try_join_all(cascades).await?;

            conn.execute(&Statement::Update {
                table: table_name(&feather.name),
                values,
                condition: Condition::pk(pk),
            })
            .await?;
            debug!(feather = %feather.name, id = %id, "Updated record");
            Ok(())
        }
        .boxed()
    }

    /// Insert, update or delete children so the composition matches `after`
    fn reconcile_children<'a>(
        &'a self,
        conn: &'a dyn Connection,
        ctx: &'a CallContext,
        relation: &'a Relation,
        parent_id: &'a str,
        before: Value,
        after: Value,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            let Some(back_reference) = relation.parent_of.as_deref() else {
                return Ok(());
            };
            let previous: HashMap<String, Map<String, Value>> = items(before, &relation.relation)?
                .into_iter()
                .filter_map(|item| {
                    let id = item.get("id")?.as_str()?.to_string();
                    Some((id, item))
                })
                .collect();
            let parent = json!({ "id": parent_id });

            let mut kept = HashSet::new();
            let mut operations: Vec<BoxFuture<'_, Result<()>>> = Vec::new();
            for mut item in items(after, &relation.relation)? {
                let existing = item
                    .get("id")
                    .and_then(Value::as_str)
                    .and_then(|id| previous.get_key_value(id));
                item.insert(back_reference.to_string(), parent.clone());
                match existing {
                    Some((id, old)) => {
                        kept.insert(id.clone());
                        let mut old = old.clone();
                        old.insert(back_reference.to_string(), parent.clone());
                        if old != item {
                            operations.push(self.update_child(conn, ctx, relation, id.clone(), old, item));
                        }
                    }
                    None => operations.push(
                        async move {
                            self.insert_record(conn, ctx, &relation.relation, item)
                                .await
                                .map(|_| ())
                        }
                        .boxed(),
                    ),
                }
            }
            for id in previous.keys().filter(|id| !kept.contains(*id)) {
                operations.push(self.delete_child(conn, ctx, &relation.relation, id.clone()));
            }
            try_join_all(operations).await?;
            Ok(())
        }
        .boxed()
    }

    fn update_child<'a>(
        &'a self,
        conn: &'a dyn Connection,
        ctx: &'a CallContext,
        relation: &'a Relation,
        id: String,
        old: Map<String, Value>,
        new: Map<String, Value>,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            let located = self
                .locate(conn, &relation.relation, &id)
                .await?
                .ok_or_else(|| DataError::not_found(format!("Record \"{}\" not found", id)))?;
            let feather = self.feather(&located.object_type)?;
            self.update_record(conn, ctx, &feather, located.pk, old, new)
                .await
        }
        .boxed()
    }

    pub(crate) fn delete_child<'a>(
        &'a self,
        conn: &'a dyn Connection,
        ctx: &'a CallContext,
        feather: &'a str,
        id: String,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            let Some(located) = self.locate(conn, feather, &id).await? else {
                return Ok(());
            };
            let actual = self.feather(&located.object_type)?;
            self.delete_record(conn, ctx, &actual, located.pk, false)
                .await
        }
        .boxed()
    }

    /// New internal key column value for a to-one relation, if it changed
    #[allow(clippy::too_many_arguments)]
    async fn reconcile_to_one(
        &self,
        conn: &dyn Connection,
        ctx: &CallContext,
        feather: &Feather,
        key: &str,
        spec: &PropertySpec,
        before: Value,
        after: Value,
    ) -> Result<Option<ColumnValue>> {
        let Some(relation) = spec.relation_spec() else {
            return Ok(None);
        };
        let column = relation_column(key);
        let set = |value: Value| Some(ColumnValue::new(column.clone(), value, ColumnType::BigInt));
        let before_id = relation_id(&before).map(str::to_string);
        let after_id = relation_id(&after).map(str::to_string);

        if !spec.is_owned() {
            if before_id == after_id {
                return Ok(None);
            }
            return match after_id {
                Some(id) => Ok(set(Value::from(
                    self.relation_pk(conn, &relation.relation, &id).await?,
                ))),
                None if after.is_null() => Ok(set(Value::Null)),
                None => Err(DataError::validation(format!(
                    "Relation \"{}\" on \"{}\" requires an id",
                    key, feather.name
                ))),
            };
        }

        match after {
            Value::Null => match before_id {
                Some(id) => {
                    self.delete_child(conn, ctx, &relation.relation, id).await?;
                    Ok(set(Value::Null))
                }
                None => Ok(None),
            },
            Value::Object(owned) => {
                if before_id.is_some() && before_id == after_id {
                    let Value::Object(previous) = before else {
                        return Ok(None);
                    };
                    if previous != owned {
                        let id = after_id.unwrap_or_default();
                        self.update_child(conn, ctx, relation, id, previous, owned)
                            .await?;
                    }
                    return Ok(None);
                }
                if let Some(id) = before_id {
                    self.delete_child(conn, ctx, &relation.relation, id).await?;
                }
                let inserted = self
                    .insert_record(conn, ctx, &relation.relation, owned)
                    .await?;
                Ok(set(Value::from(inserted.pk)))
            }
            _ => Err(DataError::validation(format!(
                "Value of \"{}\" on \"{}\" must be an object",
                key, feather.name
            ))),
        }
    }
}

fn items(value: Value, feather: &str) -> Result<Vec<Map<String, Value>>> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Value::Object(map) => Ok(map),
                _ => Err(DataError::validation(format!(
                    "Items of \"{}\" must be objects",
                    feather
                ))),
            })
            .collect(),
        _ => Err(DataError::validation(format!(
            "Composition of \"{}\" must be an array",
            feather
        ))),
    }
}

#[cfg(test)]
mod tests {
    use crate::crud::{CallContext, Query};
    use crate::error::DataError;
    use crate::feather::{Feather, PropertySpec};
    use crate::store::{Connection, Store};
    use crate::test_helpers::{admin, contact_feather, define, engine, order_feathers};
    use crate::tools::patch::{self, PatchOp};
    use serde_json::{json, Value};

    fn replace(path: &str, value: Value) -> Vec<PatchOp> {
        patch::parse(&json!([{"op": "replace", "path": path, "value": value}])).unwrap()
    }

    async fn logs(crud: &crate::crud::Crud, conn: &dyn Connection, id: &str) -> Vec<String> {
        let logs = crud
            .select(conn, &admin(), "Log", None, &Query::default())
            .await
            .unwrap();
        logs.as_array()
            .unwrap()
            .iter()
            .filter(|l| l["objectId"] == id)
            .filter_map(|l| l["action"].as_str().map(str::to_string))
            .collect()
    }

    #[tokio::test]
    async fn test_update_applies_patch_and_keeps_immutables() {
        let (store, crud) = engine().await;
        define(&store, &crud, vec![contact_feather()]).await;
        let conn = store.begin().await.unwrap();
        crud.insert(conn.as_ref(), &admin(), "Contact", json!({"id": "c1", "firstName": "Ann"}))
            .await
            .unwrap();
        let before = crud
            .select(conn.as_ref(), &admin(), "Contact", Some("c1"), &Query::default())
            .await
            .unwrap();

        let mut ops = replace("/firstName", json!("Annie"));
        ops.extend(replace("/createdBy", json!("mallory")));
        let result = crud
            .update(conn.as_ref(), &CallContext::new("bob"), "Contact", "c1", &ops)
            .await
            .unwrap();
        // the refused createdBy change comes back as a correction
        assert!(result
            .as_array()
            .unwrap()
            .iter()
            .any(|op| op["path"] == "/createdBy" && op["value"] == "admin"));

        let after = crud
            .select(conn.as_ref(), &admin(), "Contact", Some("c1"), &Query::default())
            .await
            .unwrap();
        assert_eq!(after["firstName"], "Annie");
        assert_eq!(after["createdBy"], "admin");
        assert_eq!(after["updatedBy"], "bob");
        assert_eq!(after["created"], before["created"]);
        assert_eq!(logs(&crud, conn.as_ref(), "c1").await, vec!["POST", "PATCH"]);
    }

    #[tokio::test]
    async fn test_update_rejects_blank_required_and_missing_record() {
        let (store, crud) = engine().await;
        define(
            &store,
            &crud,
            vec![Feather::new("Tag").property("label", PropertySpec::string().required())],
        )
        .await;
        let conn = store.begin().await.unwrap();
        crud.insert(conn.as_ref(), &admin(), "Tag", json!({"id": "t1", "label": "x"}))
            .await
            .unwrap();

        let err = crud
            .update(conn.as_ref(), &admin(), "Tag", "t1", &replace("/label", Value::Null))
            .await
            .unwrap_err();
        assert!(matches!(err, DataError::Validation(_)));

        let err = crud
            .update(conn.as_ref(), &admin(), "Tag", "nope", &replace("/label", json!("y")))
            .await
            .unwrap_err();
        assert!(matches!(err, DataError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_unique_change_conflicts() {
        let (store, crud) = engine().await;
        define(
            &store,
            &crud,
            vec![Feather::new("Account").property("code", PropertySpec::string().unique())],
        )
        .await;
        let conn = store.begin().await.unwrap();
        crud.insert(conn.as_ref(), &admin(), "Account", json!({"id": "a", "code": "A"}))
            .await
            .unwrap();
        crud.insert(conn.as_ref(), &admin(), "Account", json!({"id": "b", "code": "B"}))
            .await
            .unwrap();

        let err = crud
            .update(conn.as_ref(), &admin(), "Account", "b", &replace("/code", json!("A")))
            .await
            .unwrap_err();
        assert!(matches!(err, DataError::Conflict(_)));
        // unchanged unique value does not collide with itself
        crud.update(conn.as_ref(), &admin(), "Account", "a", &replace("/code", json!("A")))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_composition_reconciled_by_child_id() {
        let (store, crud) = engine().await;
        define(&store, &crud, order_feathers()).await;
        let conn = store.begin().await.unwrap();
        crud.insert(
            conn.as_ref(),
            &admin(),
            "Order",
            json!({"id": "o1", "lines": [
                {"id": "l1", "item": "pen", "quantity": 1},
                {"id": "l2", "item": "ink", "quantity": 1}
            ]}),
        )
        .await
        .unwrap();

        let ops = patch::parse(&json!([
            {"op": "remove", "path": "/lines/0"},
            {"op": "replace", "path": "/lines/0/quantity", "value": 5},
            {"op": "add", "path": "/lines/-", "value": {"id": "l3", "item": "pad", "quantity": 2}}
        ]))
        .unwrap();
        crud.update(conn.as_ref(), &admin(), "Order", "o1", &ops)
            .await
            .unwrap();

        let order = crud
            .select(conn.as_ref(), &admin(), "Order", Some("o1"), &Query::default())
            .await
            .unwrap();
        let lines = order["lines"].as_array().unwrap();
        let summary: Vec<(&str, i64)> = lines
            .iter()
            .map(|l| (l["id"].as_str().unwrap(), l["quantity"].as_i64().unwrap()))
            .collect();
        assert_eq!(summary, vec![("l2", 5), ("l3", 2)]);

        let removed = crud
            .select(
                conn.as_ref(),
                &admin(),
                "OrderLine",
                Some("l1"),
                &Query::default().show_deleted(),
            )
            .await
            .unwrap();
        assert_eq!(removed["isDeleted"], true);
    }

    #[tokio::test]
    async fn test_failed_cascade_rolls_back_everything() {
        let (store, crud) = engine().await;
        define(&store, &crud, order_feathers()).await;
        let conn = store.begin().await.unwrap();
        crud.insert(
            conn.as_ref(),
            &admin(),
            "Order",
            json!({"id": "o1", "lines": [{"id": "l1", "item": "pen", "quantity": 1}]}),
        )
        .await
        .unwrap();
        conn.commit().await.unwrap();

        let conn = store.begin().await.unwrap();
        let ops = patch::parse(&json!([
            {"op": "remove", "path": "/lines/0"},
            {"op": "add", "path": "/lines/-", "value": {"id": "l2", "quantity": "many"}}
        ]))
        .unwrap();
        assert!(crud
            .update(conn.as_ref(), &admin(), "Order", "o1", &ops)
            .await
            .is_err());
        conn.rollback().await.unwrap();

        let conn = store.begin().await.unwrap();
        let order = crud
            .select(conn.as_ref(), &admin(), "Order", Some("o1"), &Query::default())
            .await
            .unwrap();
        let lines = order["lines"].as_array().unwrap();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["id"], "l1");
    }

    #[tokio::test]
    async fn test_etag_regenerated() {
        let (store, crud) = engine().await;
        define(
            &store,
            &crud,
            vec![Feather::new("Doc")
                .property("etag", PropertySpec::string())
                .property("title", PropertySpec::string())],
        )
        .await;
        let conn = store.begin().await.unwrap();
        crud.insert(conn.as_ref(), &admin(), "Doc", json!({"id": "d1", "etag": "e0"}))
            .await
            .unwrap();
        crud.update(conn.as_ref(), &admin(), "Doc", "d1", &replace("/title", json!("T")))
            .await
            .unwrap();
        let doc = crud
            .select(conn.as_ref(), &admin(), "Doc", Some("d1"), &Query::default())
            .await
            .unwrap();
        assert_ne!(doc["etag"], "e0");
    }
}
