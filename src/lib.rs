//! Featherbone
//!
//! A schema-driven relational data engine with:
//! - Feathers: declarative class definitions with single inheritance
//! - Generic CRUD over any feather, with child cascades and relations
//! - BEFORE/AFTER triggers walked along the inheritance chain
//! - Record locking and per-role authorization
//! - Live change notifications fanned out to client sessions

pub mod api;
pub mod auth;
pub mod crud;
pub mod datasource;
pub mod error;
pub mod events;
pub mod feather;
pub mod store;
pub mod tools;

#[cfg(test)]
pub(crate) mod test_helpers;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;

use auth::{Authorizer, DEFAULT_SUPER_ROLE, ROLE_MEMBER_TABLE};
use crud::{Crud, DEFAULT_CURRENCY};
use datasource::Datasource;
use events::EventBus;
use feather::Catalog;
use store::{MemoryStore, PostgresStore, Store};
use tools::{ColumnType, ColumnValue, Statement};

// ============================================================================
// YAML config structs (deserialization targets)
// ============================================================================

/// Top-level YAML configuration file structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct YamlConfig {
    pub server: ServerYamlConfig,
    pub database: DatabaseYamlConfig,
    pub engine: EngineYamlConfig,
}

/// Server configuration section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerYamlConfig {
    pub port: u16,
}

impl Default for ServerYamlConfig {
    fn default() -> Self {
        Self { port: 8080 }
    }
}

/// Database configuration section. Without a url (or with `memory`) the
/// engine runs on the in-process store.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseYamlConfig {
    pub url: Option<String>,
    pub max_connections: u32,
}

impl Default for DatabaseYamlConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
        }
    }
}

/// Engine configuration section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineYamlConfig {
    /// Channel this node listens on; generated when absent
    pub node_id: Option<String>,
    pub base_currency: String,
    pub super_role: String,
    /// Capacity of the in-process session event channel
    pub event_capacity: usize,
}

impl Default for EngineYamlConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            base_currency: DEFAULT_CURRENCY.into(),
            super_role: DEFAULT_SUPER_ROLE.into(),
            event_capacity: 1024,
        }
    }
}

// ============================================================================
// Runtime config (what the application actually uses)
// ============================================================================

#[derive(Debug, Clone)]
pub struct Config {
    pub server_port: u16,
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub node_id: String,
    pub base_currency: String,
    pub super_role: String,
    pub event_capacity: usize,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_yaml_and_env(None)
    }

    pub fn from_yaml_and_env(yaml_path: Option<&Path>) -> Result<Self> {
        // 1. Load YAML config (or defaults if file not found)
        let yaml = Self::load_yaml(yaml_path);

        // 2. Build Config with env var overrides
        Ok(Self {
            server_port: std::env::var("SERVER_PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(yaml.server.port),
            database_url: std::env::var("DATABASE_URL").ok().or(yaml.database.url),
            database_max_connections: std::env::var("DATABASE_MAX_CONNECTIONS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(yaml.database.max_connections),
            node_id: std::env::var("NODE_ID")
                .ok()
                .or(yaml.engine.node_id)
                .unwrap_or_else(generate_node_id),
            base_currency: std::env::var("BASE_CURRENCY").unwrap_or(yaml.engine.base_currency),
            super_role: std::env::var("SUPER_ROLE").unwrap_or(yaml.engine.super_role),
            event_capacity: yaml.engine.event_capacity,
        })
    }

    fn load_yaml(yaml_path: Option<&Path>) -> YamlConfig {
        let default_path = Path::new("config.yaml");
        let path = yaml_path.unwrap_or(default_path);

        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_yaml::from_str(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {}", path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!("Failed to parse {}: {}. Using defaults.", path.display(), e);
                    YamlConfig::default()
                }
            },
            Err(_) => {
                tracing::debug!(
                    "No config file at {}, using env vars / defaults",
                    path.display()
                );
                YamlConfig::default()
            }
        }
    }

    /// Whether the in-process store backs this configuration
    pub fn uses_memory_store(&self) -> bool {
        match self.database_url.as_deref().map(str::trim) {
            None | Some("") | Some("memory") => true,
            Some(_) => false,
        }
    }
}

fn generate_node_id() -> String {
    format!("node_{}", &uuid::Uuid::new_v4().simple().to_string()[..12])
}

// ============================================================================
// Engine assembly
// ============================================================================

/// Store selected by the configuration, migrated and ready
pub async fn open_store(config: &Config) -> Result<Arc<dyn Store>> {
    let store: Arc<dyn Store> = match config.database_url.as_deref() {
        Some(url) if !config.uses_memory_store() => Arc::new(
            PostgresStore::connect(url, config.database_max_connections)
                .await
                .context("connecting to the database")?,
        ),
        _ => {
            tracing::info!("Using the in-memory store");
            Arc::new(MemoryStore::new())
        }
    };
    store.migrate().await?;
    Ok(store)
}

/// Datasource over `store` with the system tables in place
pub async fn build_datasource(config: &Config, store: Arc<dyn Store>) -> Result<Datasource> {
    let catalog = Arc::new(Catalog::new());
    let conn = store.begin().await?;
    catalog.init(conn.as_ref()).await?;
    conn.commit().await?;

    let authorizer = Authorizer::new(catalog.clone(), config.super_role.as_str());
    let crud = Crud::new(catalog, authorizer).with_base_currency(config.base_currency.as_str());
    Ok(Datasource::new(store, crud, config.node_id.as_str()))
}

/// Make `user` a member of the super role. Used to bootstrap a database
/// that has no super user yet.
pub async fn grant_super_user(datasource: &Datasource, user: &str) -> Result<()> {
    let conn = datasource.store().begin().await?;
    conn.execute(&Statement::Insert {
        table: ROLE_MEMBER_TABLE.to_string(),
        values: vec![
            ColumnValue::new(
                "role",
                Value::from(datasource.crud().authorizer().super_role()),
                ColumnType::Text,
            ),
            ColumnValue::new("member", Value::from(user), ColumnType::Text),
        ],
        ignore_conflict: true,
    })
    .await?;
    conn.commit().await?;
    tracing::info!(user, "Granted super role");
    Ok(())
}

/// Run the HTTP server until the process is stopped
pub async fn start_server(config: Config) -> Result<()> {
    let store = open_store(&config).await?;
    let datasource = Arc::new(build_datasource(&config, store).await?);
    datasource.reset_node().await?;

    let event_bus = Arc::new(EventBus::new(config.event_capacity));
    let _receiver = datasource::receiver::start(datasource.clone(), event_bus.clone()).await?;

    let state = Arc::new(api::ServerState {
        datasource,
        event_bus,
    });
    let app = api::create_router(state);

    let addr = format!("0.0.0.0:{}", config.server_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    tracing::info!(node = %config.node_id, "Listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod config_tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_yaml_config_loading() {
        let yaml = r#"
server:
  port: 9090

database:
  url: postgres://db/featherbone
  max_connections: 4

engine:
  node_id: node_a
  base_currency: EUR
  super_role: root
"#;

        let config: YamlConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.server.port, 9090);
        assert_eq!(
            config.database.url.as_deref(),
            Some("postgres://db/featherbone")
        );
        assert_eq!(config.database.max_connections, 4);
        assert_eq!(config.engine.node_id.as_deref(), Some("node_a"));
        assert_eq!(config.engine.base_currency, "EUR");
        assert_eq!(config.engine.super_role, "root");
        assert_eq!(config.engine.event_capacity, 1024);
    }

    #[test]
    fn test_yaml_defaults() {
        let config = YamlConfig::default();
        assert_eq!(config.server.port, 8080);
        assert!(config.database.url.is_none());
        assert_eq!(config.database.max_connections, 10);
        assert_eq!(config.engine.base_currency, "USD");
        assert_eq!(config.engine.super_role, "administrator");
    }

    #[test]
    fn test_yaml_and_env_lifecycle() {
        fn clear_env() {
            for var in &[
                "SERVER_PORT",
                "DATABASE_URL",
                "DATABASE_MAX_CONNECTIONS",
                "NODE_ID",
                "BASE_CURRENCY",
                "SUPER_ROLE",
            ] {
                std::env::remove_var(var);
            }
        }

        // --- Phase 1: YAML values loaded correctly ---
        let yaml = r#"
server:
  port: 9999
database:
  url: postgres://yaml-host/db
engine:
  node_id: yaml_node
  base_currency: EUR
"#;
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("config.yaml");
        let mut file = std::fs::File::create(&file_path).unwrap();
        file.write_all(yaml.as_bytes()).unwrap();

        clear_env();

        let config = Config::from_yaml_and_env(Some(&file_path)).unwrap();
        assert_eq!(config.server_port, 9999);
        assert_eq!(config.database_url.as_deref(), Some("postgres://yaml-host/db"));
        assert!(!config.uses_memory_store());
        assert_eq!(config.node_id, "yaml_node");
        assert_eq!(config.base_currency, "EUR");
        assert_eq!(config.super_role, "administrator");

        // --- Phase 2: Env vars override YAML ---
        std::env::set_var("DATABASE_URL", "memory");
        std::env::set_var("SERVER_PORT", "7777");
        std::env::set_var("NODE_ID", "env_node");

        let config = Config::from_yaml_and_env(Some(&file_path)).unwrap();
        assert_eq!(config.server_port, 7777);
        assert!(config.uses_memory_store());
        assert_eq!(config.node_id, "env_node");
        // YAML value still used where no env override
        assert_eq!(config.base_currency, "EUR");

        clear_env();

        // --- Phase 3: No YAML file → defaults ---
        let nonexistent = Path::new("/tmp/nonexistent-featherbone-config-12345.yaml");
        let config = Config::from_yaml_and_env(Some(nonexistent)).unwrap();
        assert_eq!(config.server_port, 8080);
        assert!(config.uses_memory_store());
        assert!(config.node_id.starts_with("node_"));
        assert_eq!(config.database_max_connections, 10);
    }

    #[test]
    fn test_malformed_yaml_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("config.yaml");
        std::fs::write(&file_path, "server: [not, a, map").unwrap();
        let yaml = Config::load_yaml(Some(&file_path));
        assert_eq!(yaml.server.port, 8080);
    }

    #[tokio::test]
    async fn test_memory_engine_bootstrap() {
        let config = Config {
            server_port: 0,
            database_url: None,
            database_max_connections: 1,
            node_id: "n1".into(),
            base_currency: "USD".into(),
            super_role: "administrator".into(),
            event_capacity: 8,
        };
        let store = open_store(&config).await.unwrap();
        let datasource = build_datasource(&config, store).await.unwrap();
        grant_super_user(&datasource, "root").await.unwrap();

        let conn = datasource.store().begin().await.unwrap();
        assert!(datasource
            .crud()
            .authorizer()
            .is_super_user(conn.as_ref(), "root")
            .await
            .unwrap());
    }
}
