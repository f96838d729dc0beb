//! Test fixtures shared by unit tests
//!
//! Builds an engine over an in-memory store with the catalog initialised and
//! a super user `admin`, plus a few feathers most tests need.
#![allow(dead_code)]

use crate::auth::{Authorizer, DEFAULT_SUPER_ROLE, EVERYONE, ROLE_MEMBER_TABLE};
use crate::crud::{CallContext, Crud};
use crate::datasource::Datasource;
use crate::feather::{Catalog, DefaultAuthorization, Feather, Grant, PropertySpec, Relation};
use crate::store::{MemoryStore, Store};
use crate::tools::{ColumnType, ColumnValue, Statement};
use serde_json::Value;
use std::sync::Arc;

// ============================================================================
// Engine builders
// ============================================================================

/// In-memory store and engine with system tables in place
pub async fn engine() -> (Arc<MemoryStore>, Crud) {
    let store = Arc::new(MemoryStore::new());
    let catalog = Arc::new(Catalog::new());
    let conn = store.begin().await.unwrap();
    catalog.init(conn.as_ref()).await.unwrap();
    conn.execute(&Statement::Insert {
        table: ROLE_MEMBER_TABLE.to_string(),
        values: vec![
            ColumnValue::new("role", Value::from(DEFAULT_SUPER_ROLE), ColumnType::Text),
            ColumnValue::new("member", Value::from("admin"), ColumnType::Text),
        ],
        ignore_conflict: true,
    })
    .await
    .unwrap();
    conn.commit().await.unwrap();
    let authorizer = Authorizer::new(catalog.clone(), DEFAULT_SUPER_ROLE);
    (store, Crud::new(catalog, authorizer))
}

/// Datasource over [`engine`] serving node `test-node`
pub async fn datasource() -> (Arc<MemoryStore>, Datasource) {
    let (store, crud) = engine().await;
    let datasource = Datasource::new(store.clone(), crud, "test-node");
    (store, datasource)
}

/// Save feathers in their own committed transaction
pub async fn define(store: &MemoryStore, crud: &Crud, feathers: Vec<Feather>) {
    let conn = store.begin().await.unwrap();
    for feather in feathers {
        crud.catalog()
            .save_feather(conn.as_ref(), feather)
            .await
            .unwrap();
    }
    conn.commit().await.unwrap();
}

// ============================================================================
// Callers
// ============================================================================

pub fn admin() -> CallContext {
    CallContext::new("admin")
        .session("admin-session")
        .node("test-node")
        .super_user(true)
}

pub fn user(name: &str) -> CallContext {
    CallContext::new(name)
        .session(format!("{}-session", name))
        .node("test-node")
}

// ============================================================================
// Feathers
// ============================================================================

fn open_to_everyone(mut feather: Feather) -> Feather {
    feather.authorization = Some(DefaultAuthorization {
        role: EVERYONE.to_string(),
        grant: Grant::all(),
    });
    feather
}

pub fn contact_feather() -> Feather {
    open_to_everyone(
        Feather::new("Contact")
            .plural("Contacts")
            .property("firstName", PropertySpec::string())
            .property("lastName", PropertySpec::string()),
    )
}

/// `Order` composed of `OrderLine` children
pub fn order_feathers() -> Vec<Feather> {
    vec![
        open_to_everyone(
            Feather::new("OrderLine")
                .child()
                .property(
                    "order",
                    PropertySpec::relation(Relation::to("Order").child_of("lines")),
                )
                .property("item", PropertySpec::string())
                .property("quantity", PropertySpec::integer()),
        ),
        open_to_everyone(
            Feather::new("Order").plural("Orders").property(
                "lines",
                PropertySpec::relation(Relation::to("OrderLine").parent_of("order")),
            ),
        ),
    ]
}
