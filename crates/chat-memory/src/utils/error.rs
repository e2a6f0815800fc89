use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Storage tier an error or outcome belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Cache,
    Archive,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Tier::Cache => "cache",
            Tier::Archive => "archive",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("{tier} unreachable: {message}")]
    Connectivity { tier: Tier, message: String },

    #[error("{tier} call timed out after {after:?}")]
    Timeout { tier: Tier, after: Duration },

    #[error("Summarization failed: {0}")]
    Summarization(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Merge conflict for {id} after {attempts} attempts")]
    MergeConflict { id: String, attempts: u32 },

    #[error("Precondition failed for {0}")]
    PreconditionFailed(String),

    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Session manager is closed")]
    Closed,
}

pub type SessionResult<T> = Result<T, SessionError>;

impl SessionError {
    pub fn connectivity(tier: Tier, message: impl fmt::Display) -> Self {
        SessionError::Connectivity {
            tier,
            message: message.to_string(),
        }
    }

    /// Only configuration errors are fatal; everything else leaves the
    /// subsystem usable at reduced durability or performance.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, SessionError::Config(_))
    }

    /// Errors worth retrying against the same tier
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SessionError::Connectivity { .. } | SessionError::Timeout { .. }
        )
    }
}

impl From<sqlx::Error> for SessionError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => SessionError::NotFound(err.to_string()),
            other => SessionError::connectivity(Tier::Archive, other),
        }
    }
}

impl From<redis::RedisError> for SessionError {
    fn from(err: redis::RedisError) -> Self {
        SessionError::connectivity(Tier::Cache, err)
    }
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::NotFound(msg) => ApiError::NotFound(msg),
            SessionError::InvalidRecord(msg) => ApiError::BadRequest(msg),
            e @ (SessionError::Connectivity { .. }
            | SessionError::Timeout { .. }
            | SessionError::MergeConflict { .. }
            | SessionError::PreconditionFailed(_)) => ApiError::StorageError(e.to_string()),
            other => ApiError::InternalError(other.to_string()),
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match self {
            ApiError::NotFound(msg) => {
                tracing::warn!("Not found: {}", msg);
                (StatusCode::NOT_FOUND, "NotFound", msg)
            }
            ApiError::BadRequest(msg) => {
                tracing::warn!("Bad request: {}", msg);
                (StatusCode::BAD_REQUEST, "BadRequest", msg)
            }
            ApiError::StorageError(msg) => {
                tracing::error!("Storage error: {}", msg);
                (StatusCode::SERVICE_UNAVAILABLE, "StorageError", msg)
            }
            ApiError::InternalError(msg) => {
                tracing::error!("Internal error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "InternalError", msg)
            }
        };

        let body = Json(ErrorResponse {
            error: error_type.to_string(),
            message,
        });

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        assert!(SessionError::connectivity(Tier::Archive, "down").is_recoverable());
        assert!(SessionError::Summarization("boom".into()).is_recoverable());
        assert!(!SessionError::Config("bad policy".into()).is_recoverable());
    }

    #[test]
    fn test_transient_classification() {
        assert!(SessionError::Timeout {
            tier: Tier::Cache,
            after: Duration::from_secs(1)
        }
        .is_transient());
        assert!(!SessionError::MergeConflict {
            id: "a".into(),
            attempts: 3
        }
        .is_transient());
    }

    #[test]
    fn test_tier_names_in_messages() {
        let err = SessionError::connectivity(Tier::Cache, "refused");
        assert_eq!(err.to_string(), "cache unreachable: refused");
        assert_eq!(Tier::Archive.to_string(), "archive");
    }

    #[test]
    fn test_api_error_mapping() {
        let api: ApiError = SessionError::connectivity(Tier::Archive, "refused").into();
        assert!(matches!(api, ApiError::StorageError(_)));

        let api: ApiError = SessionError::NotFound("chat-1".into()).into();
        assert!(matches!(api, ApiError::NotFound(_)));
    }
}
