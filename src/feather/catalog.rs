//! Feather catalog: resolution, inheritance merging and schema changes
//!
//! The catalog is cached in process and persisted as a single settings blob.
//! Each request refreshes it when the stored etag moved, so several nodes
//! sharing a database converge on the same definitions.

use super::models::{
    log_feather, object_feather, Feather, Primitive, PropertyType, LOG, OBJECT, SYSTEM_PROPERTIES,
};
use super::settings::Settings;
use crate::auth;
use crate::error::{DataError, Result};
use crate::events::subscriptions;
use crate::store::Connection;
use crate::tools::case::{relation_column, table_name, to_snake_case};
use crate::tools::types::{column_type, FORMATS};
use crate::tools::{ColumnDef, ColumnType, Statement};
use anyhow::anyhow;
use dashmap::DashMap;
use indexmap::IndexMap;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Settings blob holding every user-defined feather
pub const CATALOG: &str = "catalog";

pub struct Catalog {
    feathers: DashMap<String, Feather>,
    settings: Settings,
    etag: RwLock<Option<String>>,
}

impl Default for Catalog {
    fn default() -> Self {
        Self::new()
    }
}

/// `DefineTable` statement for a feather's own (non-inherited) properties
pub fn table_definition(feather: &Feather) -> Statement {
    let mut columns = Vec::new();
    if feather.name == OBJECT {
        columns.push(ColumnDef::new("_pk", ColumnType::BigInt));
    }
    for (name, spec) in &feather.properties {
        if spec.inherited_from.is_some() {
            continue;
        }
        let Some(kind) = column_type(spec) else {
            continue;
        };
        let column = if spec.is_to_one() {
            relation_column(name)
        } else {
            to_snake_case(name)
        };
        columns.push(ColumnDef::new(column, kind));
    }
    Statement::DefineTable {
        table: table_name(&feather.name),
        inherits: feather.parent().map(table_name),
        columns,
        unique: Vec::new(),
        notify: true,
    }
}

pub fn is_builtin(name: &str) -> bool {
    name == OBJECT || name == LOG
}

impl Catalog {
    /// Catalog seeded with the built-in feathers
    pub fn new() -> Self {
        let feathers = DashMap::new();
        feathers.insert(OBJECT.to_string(), object_feather());
        feathers.insert(LOG.to_string(), log_feather());
        Self {
            feathers,
            settings: Settings::new(),
            etag: RwLock::new(None),
        }
    }

    // ========================================================================
    // Resolution
    // ========================================================================

    /// Feather by name. With `include_inherited` the ancestors' properties
    /// are merged in, root first, each tagged with the feather declaring it.
    /// Always returns a fresh copy.
    pub fn get_feather(&self, name: &str, include_inherited: bool) -> Option<Feather> {
        let own = self.feathers.get(name)?.value().clone();
        if !include_inherited {
            return Some(own);
        }
        let mut properties = IndexMap::new();
        for ancestor in self.chain(name).iter().rev() {
            for (key, spec) in &ancestor.properties {
                let mut spec = spec.clone();
                spec.inherited_from = (ancestor.name != own.name).then(|| ancestor.name.clone());
                properties.insert(key.clone(), spec);
            }
        }
        Some(Feather { properties, ..own })
    }

    fn chain(&self, name: &str) -> Vec<Feather> {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut current = Some(name.to_string());
        while let Some(next) = current {
            if !seen.insert(next.clone()) {
                warn!(feather = %name, "Inheritance cycle detected");
                break;
            }
            let Some(feather) = self.feathers.get(&next).map(|f| f.value().clone()) else {
                warn!(feather = %next, "Unknown ancestor");
                break;
            };
            current = feather.parent().map(str::to_string);
            chain.push(feather);
        }
        chain
    }

    /// Names from `name` up to `Object`, most-derived first
    pub fn ancestry(&self, name: &str) -> Vec<String> {
        self.chain(name).into_iter().map(|f| f.name).collect()
    }

    /// Feathers inheriting directly from `name`
    pub fn children(&self, name: &str) -> Vec<String> {
        self.feathers
            .iter()
            .filter(|f| f.value().parent() == Some(name))
            .map(|f| f.key().clone())
            .collect()
    }

    /// `name` followed by every feather inheriting from it, at any depth
    pub fn descendants(&self, name: &str) -> Vec<String> {
        let mut names = vec![name.to_string()];
        let mut idx = 0;
        while idx < names.len() {
            for child in self.children(&names[idx]) {
                if !names.contains(&child) {
                    names.push(child);
                }
            }
            idx += 1;
        }
        names
    }

    /// Resolve a feather by name or by plural
    pub fn resolve(&self, name_or_plural: &str) -> Option<Feather> {
        if let Some(feather) = self.get_feather(name_or_plural, true) {
            return Some(feather);
        }
        let name = self
            .feathers
            .iter()
            .find(|f| f.value().plural.as_deref() == Some(name_or_plural))
            .map(|f| f.key().clone())?;
        self.get_feather(&name, true)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.feathers.iter().map(|f| f.key().clone()).collect();
        names.sort();
        names
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    /// Create system tables and built-in feather tables, then load the catalog
    pub async fn init(&self, conn: &dyn Connection) -> Result<()> {
        conn.execute(&Settings::define_table()).await?;
        for statement in auth::define_tables() {
            conn.execute(&statement).await?;
        }
        conn.execute(&subscriptions::define_table()).await?;
        conn.execute(&table_definition(&object_feather())).await?;
        conn.execute(&table_definition(&log_feather())).await?;
        self.load(conn).await
    }

    /// Reload when the persisted catalog changed since it was last read
    pub async fn refresh(&self, conn: &dyn Connection) -> Result<()> {
        let stored = self.settings.etag(conn, CATALOG).await?;
        if stored != *self.etag.read().await {
            self.load(conn).await?;
        }
        Ok(())
    }

    /// Etag of the catalog blob as last loaded or written by this process
    pub async fn etag(&self) -> Option<String> {
        self.etag.read().await.clone()
    }

    /// Discard the cache and read the committed catalog again. Used after a
    /// rolled back transaction changed feathers.
    pub async fn reload(&self, conn: &dyn Connection) -> Result<()> {
        self.load(conn).await
    }

    async fn load(&self, conn: &dyn Connection) -> Result<()> {
        let (data, etag) = match self.settings.get(conn, CATALOG).await? {
            Some(setting) => (setting.data, Some(setting.etag)),
            None => (Value::Object(Map::new()), None),
        };
        let stored: HashMap<String, Feather> = serde_json::from_value(data)
            .map_err(|e| anyhow!("catalog blob is malformed: {}", e))?;
        let count = stored.len();
        let keep: HashSet<String> = stored.keys().cloned().collect();
        // Overwrite first, then drop stale entries: a live feather is never missing
        for (name, feather) in stored {
            self.feathers.insert(name, feather);
        }
        self.feathers
            .retain(|name, _| is_builtin(name) || keep.contains(name));
        *self.etag.write().await = etag;
        debug!(count, "Loaded feather catalog");
        Ok(())
    }

    async fn persist(&self, conn: &dyn Connection, changed: Option<&Feather>, removed: Option<&str>) -> Result<()> {
        let mut blob = Map::new();
        for entry in self.feathers.iter() {
            if is_builtin(entry.key()) || Some(entry.key().as_str()) == removed {
                continue;
            }
            blob.insert(entry.key().clone(), serde_json::to_value(entry.value())?);
        }
        if let Some(feather) = changed {
            blob.insert(feather.name.clone(), serde_json::to_value(feather)?);
        }
        let etag = self.etag.read().await.clone();
        let next = self
            .settings
            .save(conn, CATALOG, Value::Object(blob), etag.as_deref())
            .await?;
        *self.etag.write().await = Some(next);
        Ok(())
    }

    /// Create or replace a feather definition and its table
    pub async fn save_feather(&self, conn: &dyn Connection, feather: Feather) -> Result<()> {
        self.refresh(conn).await?;
        let mut feather = feather;
        feather
            .properties
            .retain(|_, spec| spec.inherited_from.is_none());
        self.validate(&feather)?;

        if let Some(existing) = self.feathers.get(&feather.name).map(|f| f.value().clone()) {
            if existing.parent() != feather.parent() {
                return Err(DataError::validation(format!(
                    "Can not change the parent of feather \"{}\"",
                    feather.name
                )));
            }
        }

        self.persist(conn, Some(&feather), None).await?;
        self.feathers.insert(feather.name.clone(), feather.clone());
        conn.execute(&table_definition(&feather)).await?;
        if let Some(authorization) = &feather.authorization {
            auth::write_grant(conn, &feather.name, &authorization.role, &authorization.grant)
                .await?;
        }
        info!(feather = %feather.name, "Saved feather");
        Ok(())
    }

    /// Remove a feather and drop its table. Refused while other feathers
    /// inherit from it.
    pub async fn delete_feather(&self, conn: &dyn Connection, name: &str) -> Result<()> {
        if is_builtin(name) {
            return Err(DataError::validation(format!(
                "Can not delete built-in feather \"{}\"",
                name
            )));
        }
        self.refresh(conn).await?;
        if !self.feathers.contains_key(name) {
            return Err(DataError::not_found(format!("Feather \"{}\" not found", name)));
        }
        let children = self.children(name);
        if !children.is_empty() {
            return Err(DataError::conflict(format!(
                "Can not delete feather \"{}\" because \"{}\" inherits from it",
                name,
                children.join("\", \"")
            )));
        }
        self.persist(conn, None, Some(name)).await?;
        self.feathers.remove(name);
        conn.execute(&Statement::DropTable {
            table: table_name(name),
        })
        .await?;
        auth::remove_grants(conn, name).await?;
        info!(feather = %name, "Deleted feather");
        Ok(())
    }

    fn validate(&self, feather: &Feather) -> Result<()> {
        let name = &feather.name;
        if name.trim().is_empty() {
            return Err(DataError::validation("Feather name is required"));
        }
        if is_builtin(name) {
            return Err(DataError::validation(format!(
                "Can not modify built-in feather \"{}\"",
                name
            )));
        }
        if let Some(parent) = feather.parent() {
            if !self.feathers.contains_key(parent) {
                return Err(DataError::validation(format!(
                    "Parent feather \"{}\" does not exist",
                    parent
                )));
            }
            if self.ancestry(parent).iter().any(|a| a == name) {
                return Err(DataError::validation(format!(
                    "Feather \"{}\" can not inherit from its own descendant \"{}\"",
                    name, parent
                )));
            }
        }

        for (key, spec) in &feather.properties {
            if SYSTEM_PROPERTIES.contains(&key.as_str()) {
                return Err(DataError::validation(format!(
                    "Property \"{}\" is reserved",
                    key
                )));
            }
            match &spec.kind {
                PropertyType::Primitive(primitive) => {
                    if let Some(format) = &spec.format {
                        if !FORMATS.contains(&format.as_str()) {
                            return Err(DataError::validation(format!(
                                "Unknown format \"{}\" on property \"{}\"",
                                format, key
                            )));
                        }
                    }
                    if spec.autonumber.is_some() && *primitive != Primitive::String {
                        return Err(DataError::validation(format!(
                            "Autonumber property \"{}\" must be a string",
                            key
                        )));
                    }
                }
                PropertyType::Relation(relation) => {
                    if spec.autonumber.is_some() {
                        return Err(DataError::validation(format!(
                            "Relation \"{}\" can not be an autonumber",
                            key
                        )));
                    }
                    let target_known = relation.relation == *name
                        || self.feathers.contains_key(&relation.relation);
                    match &relation.parent_of {
                        Some(back_reference) => {
                            if spec.default.is_some() {
                                return Err(DataError::validation(format!(
                                    "Composition \"{}\" can not have a default",
                                    key
                                )));
                            }
                            let child = self.get_feather(&relation.relation, true).ok_or_else(
                                || {
                                    DataError::validation(format!(
                                        "Feather \"{}\" related by \"{}\" does not exist",
                                        relation.relation, key
                                    ))
                                },
                            )?;
                            if !child
                                .properties
                                .get(back_reference)
                                .is_some_and(|p| p.is_to_one())
                            {
                                return Err(DataError::validation(format!(
                                    "Feather \"{}\" has no relation \"{}\" back to \"{}\"",
                                    relation.relation, back_reference, name
                                )));
                            }
                        }
                        // Back-references may be declared before their parent exists
                        None if relation.child_of.is_some() => {}
                        None if !target_known => {
                            return Err(DataError::validation(format!(
                                "Feather \"{}\" related by \"{}\" does not exist",
                                relation.relation, key
                            )));
                        }
                        None => {}
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feather::{PropertySpec, Relation};
    use crate::store::{MemoryStore, Store};

    async fn catalog() -> (MemoryStore, Catalog) {
        let store = MemoryStore::new();
        let catalog = Catalog::new();
        let conn = store.begin().await.unwrap();
        catalog.init(conn.as_ref()).await.unwrap();
        conn.commit().await.unwrap();
        (store, catalog)
    }

    #[tokio::test]
    async fn test_resolution_is_idempotent_and_fresh() {
        let (store, catalog) = catalog().await;
        let conn = store.begin().await.unwrap();
        catalog
            .save_feather(
                conn.as_ref(),
                Feather::new("Contact").property("firstName", PropertySpec::string()),
            )
            .await
            .unwrap();

        let mut first = catalog.get_feather("Contact", true).unwrap();
        let second = catalog.get_feather("Contact", true).unwrap();
        assert_eq!(first, second);

        first.properties.clear();
        assert_eq!(catalog.get_feather("Contact", true).unwrap(), second);
        assert!(catalog.get_feather("Nope", true).is_none());
    }

    #[tokio::test]
    async fn test_inherited_properties_root_first() {
        let (store, catalog) = catalog().await;
        let conn = store.begin().await.unwrap();
        catalog
            .save_feather(
                conn.as_ref(),
                Feather::new("Party").property("name", PropertySpec::string()),
            )
            .await
            .unwrap();
        catalog
            .save_feather(
                conn.as_ref(),
                Feather::new("Person")
                    .inherits("Party")
                    .plural("People")
                    .property("age", PropertySpec::integer()),
            )
            .await
            .unwrap();

        let person = catalog.get_feather("Person", true).unwrap();
        let keys: Vec<_> = person.properties.keys().cloned().collect();
        assert_eq!(keys.first().map(String::as_str), Some("id"));
        assert_eq!(keys.last().map(String::as_str), Some("age"));
        assert_eq!(
            person.properties["name"].inherited_from.as_deref(),
            Some("Party")
        );
        assert_eq!(person.properties["id"].inherited_from.as_deref(), Some(OBJECT));
        assert!(person.properties["age"].inherited_from.is_none());

        assert_eq!(catalog.ancestry("Person"), vec!["Person", "Party", OBJECT]);
        assert_eq!(catalog.resolve("People").unwrap().name, "Person");

        let own = catalog.get_feather("Person", false).unwrap();
        assert_eq!(own.properties.len(), 1);
    }

    #[tokio::test]
    async fn test_validation_rules() {
        let (store, catalog) = catalog().await;
        let conn = store.begin().await.unwrap();

        let orphan = Feather::new("Orphan").inherits("Missing");
        assert!(catalog.save_feather(conn.as_ref(), orphan).await.is_err());

        let reserved = Feather::new("Bad").property("id", PropertySpec::string());
        assert!(catalog.save_feather(conn.as_ref(), reserved).await.is_err());

        let bad_auto = Feather::new("Bad").property(
            "n",
            PropertySpec::integer().autonumber(crate::feather::Autonumber {
                prefix: String::new(),
                suffix: String::new(),
                length: 3,
                sequence: "n_seq".into(),
            }),
        );
        assert!(catalog.save_feather(conn.as_ref(), bad_auto).await.is_err());

        assert!(catalog
            .save_feather(conn.as_ref(), Feather::new(OBJECT))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_composition_requires_back_reference() {
        let (store, catalog) = catalog().await;
        let conn = store.begin().await.unwrap();
        catalog
            .save_feather(
                conn.as_ref(),
                Feather::new("OrderLine")
                    .child()
                    .property(
                        "parent",
                        PropertySpec::relation(Relation::to("Order").child_of("lines")),
                    )
                    .property("item", PropertySpec::string()),
            )
            .await
            .unwrap();

        let missing_back = Feather::new("Order").property(
            "lines",
            PropertySpec::relation(Relation::to("OrderLine").parent_of("owner")),
        );
        assert!(catalog
            .save_feather(conn.as_ref(), missing_back)
            .await
            .is_err());

        let order = Feather::new("Order").property(
            "lines",
            PropertySpec::relation(Relation::to("OrderLine").parent_of("parent")),
        );
        catalog.save_feather(conn.as_ref(), order).await.unwrap();
        assert!(catalog.get_feather("Order", true).unwrap().properties["lines"].is_to_many());
    }

    #[tokio::test]
    async fn test_delete_refused_with_descendants() {
        let (store, catalog) = catalog().await;
        let conn = store.begin().await.unwrap();
        catalog
            .save_feather(conn.as_ref(), Feather::new("Party"))
            .await
            .unwrap();
        catalog
            .save_feather(conn.as_ref(), Feather::new("Person").inherits("Party"))
            .await
            .unwrap();

        let refused = catalog.delete_feather(conn.as_ref(), "Party").await;
        assert!(matches!(refused, Err(DataError::Conflict(_))));

        catalog.delete_feather(conn.as_ref(), "Person").await.unwrap();
        catalog.delete_feather(conn.as_ref(), "Party").await.unwrap();
        assert!(catalog.get_feather("Party", true).is_none());
    }

    #[tokio::test]
    async fn test_reload_keeps_live_feathers_and_drops_stale_ones() {
        let (store, catalog) = catalog().await;
        let conn = store.begin().await.unwrap();
        catalog
            .save_feather(conn.as_ref(), Feather::new("Widget"))
            .await
            .unwrap();
        conn.commit().await.unwrap();
        let before = catalog.etag().await;

        let conn = store.begin().await.unwrap();
        catalog
            .save_feather(conn.as_ref(), Feather::new("Gadget").inherits("Widget"))
            .await
            .unwrap();
        assert_ne!(catalog.etag().await, before);
        conn.rollback().await.unwrap();

        let conn = store.begin().await.unwrap();
        catalog.reload(conn.as_ref()).await.unwrap();
        assert!(catalog.get_feather("Gadget", false).is_none());
        assert!(catalog.get_feather("Widget", false).is_some());
        assert!(catalog.get_feather(OBJECT, false).is_some());
        assert_eq!(catalog.etag().await, before);
        assert_eq!(catalog.descendants("Widget"), vec!["Widget"]);
    }

    #[tokio::test]
    async fn test_descendants_cover_every_depth() {
        let (store, catalog) = catalog().await;
        let conn = store.begin().await.unwrap();
        for feather in [
            Feather::new("Party"),
            Feather::new("Person").inherits("Party"),
            Feather::new("Employee").inherits("Person"),
            Feather::new("Company").inherits("Party"),
        ] {
            catalog.save_feather(conn.as_ref(), feather).await.unwrap();
        }
        let mut below = catalog.descendants("Party");
        assert_eq!(below.remove(0), "Party");
        below.sort();
        assert_eq!(below, vec!["Company", "Employee", "Person"]);
        assert_eq!(catalog.descendants("Employee"), vec!["Employee"]);
    }

    #[tokio::test]
    async fn test_refresh_picks_up_other_node_changes() {
        let (store, catalog) = catalog().await;
        let other = Catalog::new();
        let conn = store.begin().await.unwrap();
        other.refresh(conn.as_ref()).await.unwrap();
        catalog
            .save_feather(conn.as_ref(), Feather::new("Widget"))
            .await
            .unwrap();
        conn.commit().await.unwrap();

        assert!(other.get_feather("Widget", true).is_none());
        let conn = store.begin().await.unwrap();
        other.refresh(conn.as_ref()).await.unwrap();
        assert!(other.get_feather("Widget", true).is_some());
    }
}
