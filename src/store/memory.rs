//! In-process store evaluating statements directly
//!
//! Tables keep their inheritance parent so selects, updates and deletes on
//! an ancestor reach descendant rows, like Postgres table inheritance.
//! Transactions are serialised: `begin` takes the database lock and works on
//! a copy that replaces the shared state on commit. Tables created with
//! `notify` emulate the row-change trigger and publish after commit.

use super::{Connection, NotificationStream, Row, Store, StoreNotification};
use crate::error::{DataError, Result};
use crate::events::subscriptions::SUBSCRIPTION_TABLE;
use crate::tools::sql::AUTH_TABLE;
use crate::tools::statement::{ColumnRef, ColumnValue, Condition, Operator, OrderBy, Statement};
use anyhow::anyhow;
use async_trait::async_trait;
use futures::StreamExt;
use indexmap::IndexMap;
use regex::RegexBuilder;
use serde_json::{json, Value};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, OwnedMutexGuard};
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, warn};

const NOTIFY_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Default)]
struct Table {
    parent: Option<String>,
    columns: Vec<String>,
    unique: Vec<String>,
    notify: bool,
    rows: Vec<Row>,
}

#[derive(Debug, Clone, Default)]
struct Database {
    tables: IndexMap<String, Table>,
    sequences: HashMap<String, i64>,
}

enum RowEvent<'a> {
    Insert(&'a Row),
    Update(&'a Row, &'a Row),
    Delete(&'a Row),
}

impl Database {
    fn table(&self, name: &str) -> Result<&Table> {
        self.tables
            .get(name)
            .ok_or_else(|| anyhow!("relation \"{}\" does not exist", name).into())
    }

    fn inherits_from(&self, name: &str, ancestor: &str) -> bool {
        let mut current = Some(name);
        while let Some(table) = current {
            if table == ancestor {
                return true;
            }
            current = self.tables.get(table).and_then(|t| t.parent.as_deref());
        }
        false
    }

    /// The table and the tables it inherits from, nearest first
    fn lineage(&self, name: &str) -> Vec<Value> {
        let mut names = Vec::new();
        let mut current = Some(name);
        while let Some(table) = current {
            names.push(Value::String(table.to_string()));
            current = self.tables.get(table).and_then(|t| t.parent.as_deref());
        }
        names
    }

    /// The table and every table inheriting from it
    fn family(&self, name: &str) -> Vec<String> {
        self.tables
            .keys()
            .filter(|t| self.inherits_from(t, name))
            .cloned()
            .collect()
    }

    /// Columns of a table including inherited ones, root first
    fn columns(&self, name: &str) -> Vec<String> {
        let mut chain = Vec::new();
        let mut current = self.tables.get(name);
        while let Some(table) = current {
            chain.push(table);
            current = table.parent.as_deref().and_then(|p| self.tables.get(p));
        }
        chain
            .iter()
            .rev()
            .flat_map(|t| t.columns.iter().cloned())
            .collect()
    }

    // ========================================================================
    // Statements
    // ========================================================================

    fn define_table(
        &mut self,
        name: &str,
        inherits: Option<&str>,
        columns: &[String],
        unique: &[String],
        notify: bool,
    ) -> Result<()> {
        if let Some(parent) = inherits {
            self.table(parent)?;
        }
        let table = self.tables.entry(name.to_string()).or_insert_with(|| Table {
            parent: inherits.map(str::to_string),
            ..Table::default()
        });
        for column in columns {
            if !table.columns.contains(column) {
                table.columns.push(column.clone());
            }
        }
        if !unique.is_empty() {
            table.unique = unique.to_vec();
        }
        table.notify |= notify;
        Ok(())
    }

    fn drop_table(&mut self, name: &str) -> Result<()> {
        if let Some(child) = self
            .tables
            .iter()
            .find(|(_, t)| t.parent.as_deref() == Some(name))
        {
            return Err(anyhow!(
                "cannot drop table {} because table {} depends on it",
                name,
                child.0
            )
            .into());
        }
        self.tables.shift_remove(name);
        Ok(())
    }

    fn next_val(&mut self, sequence: &str) -> i64 {
        let value = self.sequences.entry(sequence.to_string()).or_insert(0);
        *value += 1;
        *value
    }

    fn check_columns(&self, table: &str, values: &[ColumnValue]) -> Result<()> {
        let columns = self.columns(table);
        for value in values {
            if !columns.contains(&value.column) {
                return Err(anyhow!(
                    "column \"{}\" of relation \"{}\" does not exist",
                    value.column,
                    table
                )
                .into());
            }
        }
        Ok(())
    }

    fn violates_unique(&self, table: &str, row: &Row, skip: Option<usize>) -> bool {
        let Some(t) = self.tables.get(table) else {
            return false;
        };
        if t.unique.is_empty() {
            return false;
        }
        t.rows.iter().enumerate().any(|(idx, other)| {
            Some(idx) != skip
                && t.unique
                    .iter()
                    .all(|c| row.get(c).unwrap_or(&Value::Null) == other.get(c).unwrap_or(&Value::Null))
        })
    }

    fn insert(
        &mut self,
        table: &str,
        values: &[ColumnValue],
        ignore_conflict: bool,
    ) -> Result<(u64, Vec<StoreNotification>)> {
        self.table(table)?;
        self.check_columns(table, values)?;
        let mut row: Row = self
            .columns(table)
            .into_iter()
            .map(|c| (c, Value::Null))
            .collect();
        for value in values {
            row.insert(value.column.clone(), value.value.clone());
        }
        if self.violates_unique(table, &row, None) {
            if ignore_conflict {
                return Ok((0, Vec::new()));
            }
            return Err(anyhow!(
                "duplicate key value violates unique constraint \"{}_unique\"",
                table
            )
            .into());
        }
        if let Some(t) = self.tables.get_mut(table) {
            t.rows.push(row.clone());
        }
        Ok((1, self.notifications(table, RowEvent::Insert(&row))))
    }

    fn select(
        &self,
        table: &str,
        columns: &[String],
        condition: &Condition,
        order_by: &[OrderBy],
        offset: Option<u64>,
        limit: Option<u64>,
    ) -> Result<Vec<Row>> {
        self.table(table)?;
        let mut rows = Vec::new();
        for name in self.family(table) {
            for row in &self.tables[&name].rows {
                if self.matches(row, condition)? {
                    rows.push(row.clone());
                }
            }
        }
        sort_rows(&mut rows, order_by);
        let projection = if columns.is_empty() {
            self.columns(table)
        } else {
            columns.to_vec()
        };
        Ok(rows
            .into_iter()
            .skip(offset.unwrap_or(0) as usize)
            .take(limit.map(|l| l as usize).unwrap_or(usize::MAX))
            .map(|row| {
                projection
                    .iter()
                    .map(|c| (c.clone(), row.get(c).cloned().unwrap_or(Value::Null)))
                    .collect()
            })
            .collect())
    }

    fn update(
        &mut self,
        table: &str,
        values: &[ColumnValue],
        condition: &Condition,
    ) -> Result<(u64, Vec<StoreNotification>)> {
        self.table(table)?;
        self.check_columns(table, values)?;
        let mut changes = Vec::new();
        for name in self.family(table) {
            for (idx, row) in self.tables[&name].rows.iter().enumerate() {
                if self.matches(row, condition)? {
                    let mut new = row.clone();
                    for value in values {
                        new.insert(value.column.clone(), value.value.clone());
                    }
                    changes.push((name.clone(), idx, row.clone(), new));
                }
            }
        }
        for (name, idx, _, new) in &changes {
            if self.violates_unique(name, new, Some(*idx)) {
                return Err(anyhow!(
                    "duplicate key value violates unique constraint \"{}_unique\"",
                    name
                )
                .into());
            }
            if let Some(t) = self.tables.get_mut(name) {
                t.rows[*idx] = new.clone();
            }
        }
        let mut pending = Vec::new();
        for (name, _, old, new) in &changes {
            pending.extend(self.notifications(name, RowEvent::Update(old, new)));
        }
        Ok((changes.len() as u64, pending))
    }

    fn delete(
        &mut self,
        table: &str,
        condition: &Condition,
    ) -> Result<(u64, Vec<StoreNotification>)> {
        self.table(table)?;
        let mut removed = Vec::new();
        for name in self.family(table) {
            let mut keep = Vec::new();
            for row in &self.tables[&name].rows {
                keep.push(!self.matches(row, condition)?);
            }
            if let Some(t) = self.tables.get_mut(&name) {
                let mut flags = keep.into_iter();
                let mut gone = Vec::new();
                t.rows.retain(|row| {
                    let kept = flags.next().unwrap_or(true);
                    if !kept {
                        gone.push(row.clone());
                    }
                    kept
                });
                removed.extend(gone.into_iter().map(|row| (name.clone(), row)));
            }
        }
        let mut pending = Vec::new();
        for (name, row) in &removed {
            pending.extend(self.notifications(name, RowEvent::Delete(row)));
        }
        Ok((removed.len() as u64, pending))
    }

    // ========================================================================
    // Conditions
    // ========================================================================

    fn matches(&self, row: &Row, condition: &Condition) -> Result<bool> {
        Ok(match condition {
            Condition::All => true,
            Condition::Compare { column, op, value } => compare(row, column, *op, value)?,
            Condition::Related { column, table, id } => {
                let Some(pk) = row.get(column).and_then(Value::as_i64) else {
                    return Ok(false);
                };
                self.family(table).iter().any(|name| {
                    self.tables[name].rows.iter().any(|r| {
                        r.get("id") == Some(id) && r.get("_pk").and_then(Value::as_i64) == Some(pk)
                    })
                })
            }
            Condition::Authorized {
                roles,
                action,
                readable,
            } => {
                let id = row.get("id");
                let grants: Vec<&Value> = self
                    .tables
                    .get(AUTH_TABLE)
                    .map(|t| {
                        t.rows
                            .iter()
                            .filter(|g| {
                                id.is_some()
                                    && g.get("object_id") == id
                                    && g.get("role")
                                        .and_then(Value::as_str)
                                        .is_some_and(|r| roles.iter().any(|x| x == r))
                            })
                            .filter_map(|g| g.get(action.column()).filter(|v| !v.is_null()))
                            .collect()
                    })
                    .unwrap_or_default();
                if grants.is_empty() {
                    row.get("object_type")
                        .and_then(Value::as_str)
                        .is_some_and(|t| readable.iter().any(|f| f == t))
                } else {
                    grants.iter().any(|v| v.as_bool() == Some(true))
                }
            }
            Condition::And(terms) => {
                for term in terms {
                    if !self.matches(row, term)? {
                        return Ok(false);
                    }
                }
                true
            }
            Condition::Or(terms) => {
                for term in terms {
                    if self.matches(row, term)? {
                        return Ok(true);
                    }
                }
                false
            }
        })
    }

    // ========================================================================
    // Notify trigger
    // ========================================================================

    fn notifications(&self, table: &str, event: RowEvent<'_>) -> Vec<StoreNotification> {
        if !self.tables.get(table).is_some_and(|t| t.notify) {
            return Vec::new();
        }
        // Inserts reach watchers of the table and of every table it inherits from
        let (keys, action, data) = match event {
            RowEvent::Insert(row) => (self.lineage(table), "create", public(row)),
            RowEvent::Update(old, new) => {
                let deleted = flag(new, "is_deleted") && !flag(old, "is_deleted");
                (
                    vec![new.get("id").cloned().unwrap_or(Value::Null)],
                    if deleted { "delete" } else { "update" },
                    public(new),
                )
            }
            RowEvent::Delete(old) => {
                let id = old.get("id").cloned().unwrap_or(Value::Null);
                (vec![id.clone()], "delete", json!({ "id": id }))
            }
        };
        let Some(subscriptions) = self.tables.get(SUBSCRIPTION_TABLE) else {
            return Vec::new();
        };
        let mut seen = HashSet::new();
        subscriptions
            .rows
            .iter()
            .filter(|s| s.get("object_id").is_some_and(|id| keys.contains(id)))
            .filter_map(|s| {
                let channel = s.get("node_id")?.as_str()?.to_string();
                let subscription = s.get("subscription_id").cloned().unwrap_or(Value::Null);
                let session = s.get("session_id").cloned().unwrap_or(Value::Null);
                if !seen.insert((channel.clone(), subscription.to_string(), session.to_string())) {
                    return None;
                }
                Some(StoreNotification {
                    channel,
                    payload: json!({
                        "subscription": { "id": subscription, "eventKey": session },
                        "action": action,
                        "data": data,
                    }),
                })
            })
            .collect()
    }
}

fn public(row: &Row) -> Value {
    let mut row = row.clone();
    row.remove("_pk");
    Value::Object(row)
}

fn flag(row: &Row, column: &str) -> bool {
    row.get(column).and_then(Value::as_bool).unwrap_or(false)
}

fn column_value(row: &Row, column: &ColumnRef) -> Value {
    let value = row.get(&column.name).cloned().unwrap_or(Value::Null);
    match &column.field {
        Some(field) => match value.get(field) {
            None | Some(Value::Null) => Value::Null,
            Some(Value::String(s)) => Value::String(s.clone()),
            Some(other) => Value::String(other.to_string()),
        },
        None => value,
    }
}

fn text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn order(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::Number(x), Value::String(y)) => x.as_f64()?.partial_cmp(&y.parse::<f64>().ok()?),
        (Value::String(x), Value::Number(y)) => x.parse::<f64>().ok()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn equal(a: &Value, b: &Value) -> bool {
    a == b || order(a, b) == Some(Ordering::Equal)
}

fn compare(row: &Row, column: &ColumnRef, op: Operator, value: &Value) -> Result<bool> {
    let actual = column_value(row, column);
    Ok(match (op, value) {
        (Operator::Eq, Value::Null) => actual.is_null(),
        (Operator::NotEq, Value::Null) => !actual.is_null(),
        _ if actual.is_null() => false,
        (Operator::In, Value::Array(items)) => items.iter().any(|v| equal(&actual, v)),
        (Operator::In, _) => {
            return Err(DataError::validation("IN comparison requires an array value"))
        }
        (op, pattern) if op.is_regex() => {
            let insensitive = matches!(
                op,
                Operator::MatchesInsensitive | Operator::NotMatchesInsensitive
            );
            let re = RegexBuilder::new(&text(pattern))
                .case_insensitive(insensitive)
                .build()
                .map_err(|e| DataError::validation(format!("Invalid regular expression: {}", e)))?;
            let hit = re.is_match(&text(&actual));
            if matches!(op, Operator::Matches | Operator::MatchesInsensitive) {
                hit
            } else {
                !hit
            }
        }
        (_, Value::Null) => false,
        (Operator::Eq, v) => equal(&actual, v),
        (Operator::NotEq, v) => !equal(&actual, v),
        (Operator::Lt, v) => order(&actual, v) == Some(Ordering::Less),
        (Operator::Gt, v) => order(&actual, v) == Some(Ordering::Greater),
        (Operator::Le, v) => matches!(order(&actual, v), Some(Ordering::Less | Ordering::Equal)),
        (Operator::Ge, v) => matches!(
            order(&actual, v),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        _ => false,
    })
}

/// Postgres ordering: nulls sort last ascending and first descending
fn sort_rows(rows: &mut [Row], order_by: &[OrderBy]) {
    rows.sort_by(|a, b| {
        for key in order_by {
            let x = column_value(a, &key.column);
            let y = column_value(b, &key.column);
            let ord = match (x.is_null(), y.is_null()) {
                (true, true) => Ordering::Equal,
                (true, false) => Ordering::Greater,
                (false, true) => Ordering::Less,
                _ => order(&x, &y).unwrap_or(Ordering::Equal),
            };
            let ord = if key.descending { ord.reverse() } else { ord };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
}

// ============================================================================
// Store and connection
// ============================================================================

/// Shared in-process store
#[derive(Clone)]
pub struct MemoryStore {
    db: Arc<Mutex<Database>>,
    notifier: broadcast::Sender<StoreNotification>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (notifier, _) = broadcast::channel(NOTIFY_CAPACITY);
        Self {
            db: Arc::new(Mutex::new(Database::default())),
            notifier,
        }
    }

    /// Committed rows of a single table, without descendants
    pub async fn rows(&self, table: &str) -> Vec<Row> {
        let db = self.db.lock().await;
        db.tables
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

struct Transaction {
    guard: OwnedMutexGuard<Database>,
    working: Database,
    pending: Vec<StoreNotification>,
}

struct MemoryConnection {
    state: Mutex<Option<Transaction>>,
    notifier: broadcast::Sender<StoreNotification>,
}

fn finished() -> DataError {
    anyhow!("transaction already finished").into()
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn query(&self, statement: &Statement) -> Result<Vec<Row>> {
        let mut state = self.state.lock().await;
        let tx = state.as_mut().ok_or_else(finished)?;
        match statement {
            Statement::Select {
                table,
                columns,
                condition,
                order_by,
                offset,
                limit,
            } => tx
                .working
                .select(table, columns, condition, order_by, *offset, *limit),
            Statement::NextVal { sequence } => {
                let value = tx.working.next_val(sequence);
                Ok(vec![Row::from_iter([("value".to_string(), json!(value))])])
            }
            _ => {
                drop(state);
                self.execute(statement).await?;
                Ok(Vec::new())
            }
        }
    }

    async fn execute(&self, statement: &Statement) -> Result<u64> {
        let mut state = self.state.lock().await;
        let tx = state.as_mut().ok_or_else(finished)?;
        let db = &mut tx.working;
        let (count, pending) = match statement {
            Statement::DefineTable {
                table,
                inherits,
                columns,
                unique,
                notify,
            } => {
                let names: Vec<String> = columns.iter().map(|c| c.name.clone()).collect();
                db.define_table(table, inherits.as_deref(), &names, unique, *notify)?;
                (0, Vec::new())
            }
            Statement::DropTable { table } => {
                db.drop_table(table)?;
                (0, Vec::new())
            }
            Statement::NextVal { sequence } => {
                db.next_val(sequence);
                (1, Vec::new())
            }
            Statement::Insert {
                table,
                values,
                ignore_conflict,
            } => db.insert(table, values, *ignore_conflict)?,
            Statement::Select {
                table,
                columns,
                condition,
                order_by,
                offset,
                limit,
            } => (
                db.select(table, columns, condition, order_by, *offset, *limit)?
                    .len() as u64,
                Vec::new(),
            ),
            Statement::Update {
                table,
                values,
                condition,
            } => db.update(table, values, condition)?,
            Statement::Delete { table, condition } => db.delete(table, condition)?,
        };
        tx.pending.extend(pending);
        Ok(count)
    }

    async fn commit(&self) -> Result<()> {
        let tx = self.state.lock().await.take().ok_or_else(finished)?;
        let Transaction {
            mut guard,
            working,
            pending,
        } = tx;
        *guard = working;
        drop(guard);
        for notification in pending {
            debug!(channel = %notification.channel, "Publishing row notification");
            // No listeners is fine
            let _ = self.notifier.send(notification);
        }
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        self.state.lock().await.take();
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self) -> Result<Arc<dyn Connection>> {
        let guard = self.db.clone().lock_owned().await;
        let working = guard.clone();
        Ok(Arc::new(MemoryConnection {
            state: Mutex::new(Some(Transaction {
                guard,
                working,
                pending: Vec::new(),
            })),
            notifier: self.notifier.clone(),
        }))
    }

    async fn listen(&self, channel: &str) -> Result<NotificationStream> {
        let channel = channel.to_string();
        let stream = BroadcastStream::new(self.notifier.subscribe()).filter_map(move |item| {
            let result = match item {
                Ok(n) if n.channel == channel => Some(Ok(n)),
                Ok(_) => None,
                Err(err) => {
                    warn!(error = %err, "Memory store listener lagged");
                    None
                }
            };
            futures::future::ready(result)
        });
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::statement::{Action, ColumnDef};
    use crate::tools::types::ColumnType;

    fn define(table: &str, inherits: Option<&str>, columns: &[&str]) -> Statement {
        Statement::DefineTable {
            table: table.into(),
            inherits: inherits.map(String::from),
            columns: columns
                .iter()
                .map(|c| ColumnDef::new(*c, ColumnType::Text))
                .collect(),
            unique: vec![],
            notify: false,
        }
    }

    fn insert(table: &str, values: &[(&str, Value)]) -> Statement {
        Statement::Insert {
            table: table.into(),
            values: values
                .iter()
                .map(|(c, v)| ColumnValue::new(*c, v.clone(), ColumnType::Text))
                .collect(),
            ignore_conflict: false,
        }
    }

    #[tokio::test]
    async fn test_select_on_parent_includes_descendants() {
        let store = MemoryStore::new();
        let conn = store.begin().await.unwrap();
        conn.execute(&define("object", None, &["_pk", "id"])).await.unwrap();
        conn.execute(&define("contact", Some("object"), &["name"])).await.unwrap();
        conn.execute(&insert("object", &[("_pk", json!(1)), ("id", json!("o1"))]))
            .await
            .unwrap();
        conn.execute(&insert(
            "contact",
            &[("_pk", json!(2)), ("id", json!("c1")), ("name", json!("Ann"))],
        ))
        .await
        .unwrap();

        let rows = conn
            .query(&Statement::select("object", &[], Condition::All))
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        // Projection is limited to the queried table's columns
        assert!(rows.iter().all(|r| !r.contains_key("name")));

        let rows = conn
            .query(&Statement::select("contact", &["name"], Condition::id("c1")))
            .await
            .unwrap();
        assert_eq!(rows[0]["name"], json!("Ann"));
    }

    #[tokio::test]
    async fn test_rollback_discards_changes() {
        let store = MemoryStore::new();
        let conn = store.begin().await.unwrap();
        conn.execute(&define("thing", None, &["id"])).await.unwrap();
        conn.commit().await.unwrap();

        let conn = store.begin().await.unwrap();
        conn.execute(&insert("thing", &[("id", json!("a"))])).await.unwrap();
        conn.rollback().await.unwrap();
        assert!(store.rows("thing").await.is_empty());

        let conn = store.begin().await.unwrap();
        conn.execute(&insert("thing", &[("id", json!("b"))])).await.unwrap();
        drop(conn);
        assert!(store.rows("thing").await.is_empty());
    }

    #[tokio::test]
    async fn test_unique_and_ignore_conflict() {
        let store = MemoryStore::new();
        let conn = store.begin().await.unwrap();
        conn.execute(&Statement::DefineTable {
            table: "pair".into(),
            inherits: None,
            columns: vec![
                ColumnDef::new("a", ColumnType::Text),
                ColumnDef::new("b", ColumnType::Text),
            ],
            unique: vec!["a".into(), "b".into()],
            notify: false,
        })
        .await
        .unwrap();
        let row = [("a", json!("x")), ("b", json!("y"))];
        assert_eq!(conn.execute(&insert("pair", &row)).await.unwrap(), 1);
        assert!(conn.execute(&insert("pair", &row)).await.is_err());
        let ignored = Statement::Insert {
            table: "pair".into(),
            values: row
                .iter()
                .map(|(c, v)| ColumnValue::new(*c, v.clone(), ColumnType::Text))
                .collect(),
            ignore_conflict: true,
        };
        assert_eq!(conn.execute(&ignored).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_regex_and_ordering() {
        let store = MemoryStore::new();
        let conn = store.begin().await.unwrap();
        conn.execute(&define("person", None, &["_pk", "name"])).await.unwrap();
        for (pk, name) in [(1, "Ann"), (2, "bob"), (3, "annie")] {
            conn.execute(&insert("person", &[("_pk", json!(pk)), ("name", json!(name))]))
                .await
                .unwrap();
        }
        let stmt = Statement::Select {
            table: "person".into(),
            columns: vec!["name".into()],
            condition: Condition::Compare {
                column: ColumnRef::text("name"),
                op: Operator::MatchesInsensitive,
                value: json!("^an"),
            },
            order_by: vec![OrderBy {
                column: ColumnRef::pk(),
                descending: true,
            }],
            offset: None,
            limit: None,
        };
        let rows = conn.query(&stmt).await.unwrap();
        let names: Vec<_> = rows.iter().map(|r| r["name"].clone()).collect();
        assert_eq!(names, vec![json!("annie"), json!("Ann")]);
    }

    #[tokio::test]
    async fn test_authorized_condition_prefers_object_grant() {
        let store = MemoryStore::new();
        let conn = store.begin().await.unwrap();
        conn.execute(&define("doc", None, &["id", "object_type"])).await.unwrap();
        conn.execute(&define(
            AUTH_TABLE,
            None,
            &["object_id", "role", "can_read"],
        ))
        .await
        .unwrap();
        for (id, kind) in [("d1", "Doc"), ("d2", "Doc"), ("m1", "Memo")] {
            conn.execute(&insert(
                "doc",
                &[("id", json!(id)), ("object_type", json!(kind))],
            ))
            .await
            .unwrap();
        }
        conn.execute(&insert(
            AUTH_TABLE,
            &[
                ("object_id", json!("d1")),
                ("role", json!("everyone")),
                ("can_read", json!(false)),
            ],
        ))
        .await
        .unwrap();
        let stmt = Statement::select(
            "doc",
            &["id"],
            Condition::Authorized {
                roles: vec!["ann".into(), "everyone".into()],
                action: Action::CanRead,
                readable: vec!["Doc".into()],
            },
        );
        let rows = conn.query(&stmt).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["id"], json!("d2"));
    }

    #[tokio::test]
    async fn test_notify_trigger_publishes_after_commit() {
        let store = MemoryStore::new();
        let mut stream = store.listen("node-a").await.unwrap();
        let conn = store.begin().await.unwrap();
        conn.execute(&Statement::DefineTable {
            table: "contact".into(),
            inherits: None,
            columns: vec![
                ColumnDef::new("_pk", ColumnType::BigInt),
                ColumnDef::new("id", ColumnType::Text),
            ],
            unique: vec![],
            notify: true,
        })
        .await
        .unwrap();
        conn.execute(&define(
            SUBSCRIPTION_TABLE,
            None,
            &["node_id", "session_id", "subscription_id", "object_id"],
        ))
        .await
        .unwrap();
        conn.execute(&insert(
            SUBSCRIPTION_TABLE,
            &[
                ("node_id", json!("node-a")),
                ("session_id", json!("s1")),
                ("subscription_id", json!("sub1")),
                ("object_id", json!("contact")),
            ],
        ))
        .await
        .unwrap();
        conn.execute(&insert("contact", &[("_pk", json!(1)), ("id", json!("c1"))]))
            .await
            .unwrap();
        conn.commit().await.unwrap();

        let n = stream.next().await.unwrap().unwrap();
        assert_eq!(n.channel, "node-a");
        assert_eq!(n.payload["action"], json!("create"));
        assert_eq!(n.payload["subscription"]["eventKey"], json!("s1"));
        assert_eq!(n.payload["data"]["id"], json!("c1"));
        assert!(n.payload["data"].get("_pk").is_none());
    }
}
