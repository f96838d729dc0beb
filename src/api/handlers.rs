//! API request handlers
//!
//! Every handler turns the HTTP call into a datasource [`Request`] on behalf
//! of the [`Actor`] named in the headers.

use crate::auth::Actor;
use crate::crud::Query as ReadQuery;
use crate::datasource::{Datasource, Request};
use crate::error::DataError;
use crate::events::EventBus;
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

/// Shared server state
pub struct ServerState {
    pub datasource: Arc<Datasource>,
    /// Session events published by the notification receiver
    pub event_bus: Arc<EventBus>,
}

pub type FeatherState = Arc<ServerState>;

impl ServerState {
    async fn run(&self, actor: Actor, request: Request) -> Result<Value, AppError> {
        let request = match actor.session_id {
            Some(session) => request.session(session),
            None => request,
        };
        Ok(self.datasource.request(request).await?)
    }
}

fn found(value: Value, what: &str) -> Result<Json<Value>, AppError> {
    if value.is_null() {
        return Err(AppError::NotFound(format!("{} not found", what)));
    }
    Ok(Json(value))
}

// ============================================================================
// Health check
// ============================================================================

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub node: String,
    pub version: String,
}

pub async fn health(State(state): State<FeatherState>) -> (StatusCode, Json<HealthResponse>) {
    let status = match state.datasource.store().begin().await {
        Ok(conn) => {
            let _ = conn.rollback().await;
            "ok"
        }
        Err(_) => "unhealthy",
    };
    let code = if status == "ok" {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        code,
        Json(HealthResponse {
            status: status.to_string(),
            node: state.datasource.node_id().to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }),
    )
}

// ============================================================================
// Records
// ============================================================================

/// Query string of a single-record read
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadParams {
    /// Comma-separated property names
    pub properties: Option<String>,
    #[serde(default)]
    pub show_deleted: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteParams {
    #[serde(default)]
    pub is_hard: bool,
}

pub async fn get_record(
    State(state): State<FeatherState>,
    actor: Actor,
    Path((name, id)): Path<(String, String)>,
    Query(params): Query<ReadParams>,
) -> Result<Json<Value>, AppError> {
    let mut request = Request::get(name, actor.user.as_str()).id(id.as_str());
    if let Some(properties) = params.properties {
        let names: Vec<&str> = properties
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .collect();
        request = request.properties(&names);
    }
    if params.show_deleted {
        request = request.show_deleted();
    }
    found(state.run(actor, request).await?, &format!("Record \"{}\"", id))
}

/// `POST /data/{name}/query`: filtered list read
pub async fn query_records(
    State(state): State<FeatherState>,
    actor: Actor,
    Path(name): Path<String>,
    Json(query): Json<ReadQuery>,
) -> Result<Json<Value>, AppError> {
    let mut request = Request::get(name, actor.user.as_str());
    request.filter = query.filter;
    request.properties = query.properties;
    request.subscription = query.subscription;
    request.show_deleted = query.show_deleted;
    Ok(Json(state.run(actor, request).await?))
}

pub async fn create_record(
    State(state): State<FeatherState>,
    actor: Actor,
    Path(name): Path<String>,
    Json(data): Json<Value>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let request = Request::post(name, actor.user.as_str(), data);
    let result = state.run(actor, request).await?;
    Ok((StatusCode::CREATED, Json(result)))
}

pub async fn patch_record(
    State(state): State<FeatherState>,
    actor: Actor,
    Path((name, id)): Path<(String, String)>,
    Json(patch): Json<Value>,
) -> Result<Json<Value>, AppError> {
    let request = Request::patch(name, actor.user.as_str(), id, patch);
    Ok(Json(state.run(actor, request).await?))
}

pub async fn delete_record(
    State(state): State<FeatherState>,
    actor: Actor,
    Path((name, id)): Path<(String, String)>,
    Query(params): Query<DeleteParams>,
) -> Result<Json<Value>, AppError> {
    let mut request = Request::delete(name, actor.user.as_str(), id);
    if params.is_hard {
        request = request.hard();
    }
    Ok(Json(state.run(actor, request).await?))
}

// ============================================================================
// Functions
// ============================================================================

pub async fn call_function(
    State(state): State<FeatherState>,
    actor: Actor,
    Path(function): Path<String>,
    body: Bytes,
) -> Result<Json<Value>, AppError> {
    let data = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| AppError::BadRequest(format!("Invalid JSON body: {}", e)))?
    };
    let request = Request::post(function, actor.user.as_str(), data);
    Ok(Json(state.run(actor, request).await?))
}

// ============================================================================
// Feathers
// ============================================================================

pub async fn get_feather(
    State(state): State<FeatherState>,
    actor: Actor,
    Path(name): Path<String>,
) -> Result<Json<Value>, AppError> {
    let request =
        Request::get("getFeather", actor.user.as_str()).data(json!({ "name": name.as_str() }));
    found(
        state.run(actor, request).await?,
        &format!("Feather \"{}\"", name),
    )
}

pub async fn save_feather(
    State(state): State<FeatherState>,
    actor: Actor,
    Path(name): Path<String>,
    Json(mut spec): Json<Value>,
) -> Result<Json<Value>, AppError> {
    let Some(fields) = spec.as_object_mut() else {
        return Err(AppError::BadRequest("Feather must be an object".to_string()));
    };
    fields.insert("name".to_string(), Value::String(name));
    let request = Request::post(
        "saveFeather",
        actor.user.as_str(),
        json!({ "specs": spec }),
    );
    Ok(Json(state.run(actor, request).await?))
}

pub async fn delete_feather(
    State(state): State<FeatherState>,
    actor: Actor,
    Path(name): Path<String>,
) -> Result<Json<Value>, AppError> {
    let request = Request::post("deleteFeather", actor.user.as_str(), json!({ "name": name }));
    Ok(Json(state.run(actor, request).await?))
}

// ============================================================================
// Error handling
// ============================================================================

#[derive(Debug)]
pub enum AppError {
    Internal(anyhow::Error),
    NotFound(String),
    BadRequest(String),
    Unauthorized(String),
    Conflict(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match self {
            AppError::Internal(e) => {
                tracing::error!(error = %e, "Request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg),
        };

        let body = Json(json!({
            "error": message
        }));

        (status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err)
    }
}

impl From<DataError> for AppError {
    fn from(err: DataError) -> Self {
        match err {
            DataError::Validation(msg) => AppError::BadRequest(msg),
            DataError::Unauthorized(msg) => AppError::Unauthorized(msg),
            DataError::Conflict(msg) => AppError::Conflict(msg),
            DataError::NotFound(msg) => AppError::NotFound(msg),
            DataError::Internal(e) => AppError::Internal(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_errors_map_to_status() {
        let status = |err: DataError| AppError::from(err).into_response().status();
        assert_eq!(status(DataError::validation("x")), StatusCode::BAD_REQUEST);
        assert_eq!(status(DataError::unauthorized("x")), StatusCode::UNAUTHORIZED);
        assert_eq!(status(DataError::conflict("x")), StatusCode::CONFLICT);
        assert_eq!(status(DataError::not_found("x")), StatusCode::NOT_FOUND);
        assert_eq!(
            status(DataError::Internal(anyhow::anyhow!("down"))),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_read_params_from_query_string() {
        let params: ReadParams =
            serde_json::from_value(json!({"properties": "firstName,lastName", "showDeleted": true}))
                .unwrap();
        assert_eq!(params.properties.as_deref(), Some("firstName,lastName"));
        assert!(params.show_deleted);
    }
}
