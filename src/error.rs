//! Error taxonomy shared by every layer of the engine
//!
//! Each variant maps to one failure class a caller can react to:
//! validation and conflict errors are client-correctable, authorization and
//! not-found are distinguishable outcomes, and everything else is an
//! infrastructure failure. None of them is retried inside the engine.

/// Engine error
#[derive(Debug, thiserror::Error)]
pub enum DataError {
    /// Malformed request: unknown property, missing required value, bad filter
    #[error("{0}")]
    Validation(String),
    /// The acting identity is not permitted to perform the action
    #[error("{0}")]
    Unauthorized(String),
    /// Uniqueness violation, lock held by another session, already deleted
    #[error("{0}")]
    Conflict(String),
    /// Unknown feather or missing record
    #[error("{0}")]
    NotFound(String),
    /// Connection or statement execution failure
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type Result<T, E = DataError> = std::result::Result<T, E>;

impl DataError {
    pub fn validation(msg: impl Into<String>) -> Self {
        DataError::Validation(msg.into())
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        DataError::Unauthorized(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        DataError::Conflict(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        DataError::NotFound(msg.into())
    }

    /// HTTP-style status marker for the error class
    pub fn status_code(&self) -> u16 {
        match self {
            DataError::Validation(_) => 400,
            DataError::Unauthorized(_) => 401,
            DataError::NotFound(_) => 404,
            DataError::Conflict(_) => 409,
            DataError::Internal(_) => 500,
        }
    }
}

impl From<sqlx::Error> for DataError {
    fn from(err: sqlx::Error) -> Self {
        DataError::Internal(anyhow::Error::new(err))
    }
}

impl From<serde_json::Error> for DataError {
    fn from(err: serde_json::Error) -> Self {
        DataError::Validation(err.to_string())
    }
}
