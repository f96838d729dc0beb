//! Actor extractor for Axum handlers.
//!
//! Identity is established upstream; the engine trusts the `x-username`
//! header and takes the client session from `x-session-id`.

use crate::api::handlers::AppError;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::HeaderMap;

pub const USERNAME_HEADER: &str = "x-username";
pub const SESSION_HEADER: &str = "x-session-id";

/// Who is calling over HTTP
///
/// ```rust,ignore
/// async fn my_handler(actor: Actor) -> impl IntoResponse {
///     format!("Hello, {}!", actor.user)
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub user: String,
    pub session_id: Option<String>,
}

impl Actor {
    fn from_headers(headers: &HeaderMap) -> Result<Self, AppError> {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };
        let user = header(USERNAME_HEADER).ok_or_else(|| {
            AppError::Unauthorized(format!("Missing {} header", USERNAME_HEADER))
        })?;
        Ok(Self {
            user,
            session_id: header(SESSION_HEADER),
        })
    }
}

impl<S: Send + Sync> FromRequestParts<S> for Actor {
    type Rejection = AppError;

    fn from_request_parts(
        parts: &mut Parts,
        _state: &S,
    ) -> impl std::future::Future<Output = Result<Self, Self::Rejection>> + Send {
        let actor = Self::from_headers(&parts.headers);
        async move { actor }
    }
}

// ============================================================================
// Tests
// ============================================================================
