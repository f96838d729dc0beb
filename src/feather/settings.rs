//! Named JSON blobs with etag-based optimistic concurrency

use crate::error::{DataError, Result};
use crate::store::{query_one, Connection};
use crate::tools::{ColumnDef, ColumnRef, ColumnType, ColumnValue, Condition, Statement};
use dashmap::DashMap;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

pub const SETTINGS_TABLE: &str = "$settings";

/// A stored blob and its concurrency token
#[derive(Debug, Clone, PartialEq)]
pub struct Setting {
    pub data: Value,
    pub etag: String,
}

/// Settings store with a read-through cache validated by etag
#[derive(Debug, Default)]
pub struct Settings {
    cache: DashMap<String, Setting>,
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn define_table() -> Statement {
        Statement::DefineTable {
            table: SETTINGS_TABLE.to_string(),
            inherits: None,
            columns: vec![
                ColumnDef::new("name", ColumnType::Text),
                ColumnDef::new("data", ColumnType::Json),
                ColumnDef::new("etag", ColumnType::Text),
            ],
            unique: vec!["name".to_string()],
            notify: false,
        }
    }

    fn by_name(name: &str) -> Condition {
        Condition::eq(ColumnRef::text("name"), name)
    }

    /// Current etag in the store, without loading the blob
    pub async fn etag(&self, conn: &dyn Connection, name: &str) -> Result<Option<String>> {
        let row = query_one(
            conn,
            &Statement::select(SETTINGS_TABLE, &["etag"], Self::by_name(name)),
        )
        .await?;
        Ok(row.and_then(|r| r.get("etag").and_then(Value::as_str).map(str::to_string)))
    }

    /// Load a blob, serving it from cache when the stored etag is unchanged
    pub async fn get(&self, conn: &dyn Connection, name: &str) -> Result<Option<Setting>> {
        let Some(etag) = self.etag(conn, name).await? else {
            self.cache.remove(name);
            return Ok(None);
        };
        if let Some(cached) = self.cache.get(name) {
            if cached.etag == etag {
                return Ok(Some(cached.value().clone()));
            }
        }
        let row = query_one(
            conn,
            &Statement::select(SETTINGS_TABLE, &["data", "etag"], Self::by_name(name)),
        )
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let setting = Setting {
            data: row.get("data").cloned().unwrap_or(Value::Null),
            etag,
        };
        debug!(name, etag = %setting.etag, "Loaded settings");
        self.cache.insert(name.to_string(), setting.clone());
        Ok(Some(setting))
    }

    /// Persist a blob. `etag` must match the stored one when the blob
    /// already exists. Returns the new etag.
    pub async fn save(
        &self,
        conn: &dyn Connection,
        name: &str,
        data: Value,
        etag: Option<&str>,
    ) -> Result<String> {
        let current = self.etag(conn, name).await?;
        if let Some(current) = &current {
            if etag != Some(current.as_str()) {
                return Err(DataError::conflict(format!(
                    "Settings \"{}\" were changed by another user",
                    name
                )));
            }
        }
        let next = Uuid::new_v4().to_string();
        let values = vec![
            ColumnValue::new("data", data.clone(), ColumnType::Json),
            ColumnValue::new("etag", Value::String(next.clone()), ColumnType::Text),
        ];
        if current.is_some() {
            conn.execute(&Statement::Update {
                table: SETTINGS_TABLE.to_string(),
                values,
                condition: Self::by_name(name),
            })
            .await?;
        } else {
            let mut values = values;
            values.push(ColumnValue::new(
                "name",
                Value::String(name.to_string()),
                ColumnType::Text,
            ));
            conn.execute(&Statement::Insert {
                table: SETTINGS_TABLE.to_string(),
                values,
                ignore_conflict: false,
            })
            .await?;
        }
        self.cache.insert(
            name.to_string(),
            Setting {
                data,
                etag: next.clone(),
            },
        );
        Ok(next)
    }
}
