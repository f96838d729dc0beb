//! Shared setup for integration tests: an in-memory engine with `admin` as
//! super user

#![allow(dead_code)]

use featherbone::datasource::{Datasource, Request};
use featherbone::{build_datasource, grant_super_user, open_store, Config};
use serde_json::{json, Value};
use std::sync::Arc;

pub const ADMIN: &str = "admin";

pub fn memory_config(node_id: &str) -> Config {
    Config {
        server_port: 0,
        database_url: None,
        database_max_connections: 1,
        node_id: node_id.to_string(),
        base_currency: "USD".to_string(),
        super_role: "administrator".to_string(),
        event_capacity: 64,
    }
}

pub async fn engine() -> Arc<Datasource> {
    let config = memory_config("test_node");
    let store = open_store(&config).await.unwrap();
    let datasource = build_datasource(&config, store).await.unwrap();
    grant_super_user(&datasource, ADMIN).await.unwrap();
    Arc::new(datasource)
}

/// Save feather definitions given in wire format
pub async fn define(datasource: &Datasource, specs: Value) {
    datasource
        .request(Request::post("saveFeather", ADMIN, json!({ "specs": specs })))
        .await
        .unwrap();
}

/// Grant that lets every user do everything on a feather
pub fn open() -> Value {
    json!({
        "role": "everyone",
        "canCreate": true,
        "canRead": true,
        "canUpdate": true,
        "canDelete": true
    })
}

pub fn replace(path: &str, value: Value) -> Value {
    json!([{ "op": "replace", "path": path, "value": value }])
}
