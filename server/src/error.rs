//! Unified error handling for the server.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use pos_sync_engine::Error as EngineError;
use serde::Serialize;
use serde_json::Value;

use crate::db::DurableError;

/// Application error type.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Durable store failure: {0}")]
    Durable(#[from] DurableError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Machine-readable code sent to clients.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Database(_) | AppError::Durable(_) => "durable-store-failure",
            AppError::Engine(e) => e.code(),
            AppError::BadRequest(_) => "bad-request",
            AppError::NotFound(_) => "not-found",
            AppError::Internal(_) => "internal-error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Database(_) | AppError::Durable(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Engine(e) => match e {
                EngineError::VersionConflict(_)
                | EngineError::InsertOnlyViolation(_)
                | EngineError::ConcurrencyGuardFailed(_)
                | EngineError::RecordAlreadyExists { .. } => StatusCode::CONFLICT,
                EngineError::RecordNotFound { .. }
                | EngineError::ModuleNotFound(_)
                | EngineError::TableNotRegistered { .. } => StatusCode::NOT_FOUND,
                _ => StatusCode::BAD_REQUEST,
            },
        }
    }

    /// Structured payload a client needs to choose between retry and resync.
    pub fn details(&self) -> Option<Value> {
        match self {
            AppError::Engine(EngineError::VersionConflict(conflict)) => {
                serde_json::to_value(conflict).ok()
            }
            AppError::Engine(EngineError::InsertOnlyViolation(violation)) => {
                serde_json::to_value(violation).ok()
            }
            AppError::Engine(EngineError::ConcurrencyGuardFailed(conflict)) => {
                serde_json::to_value(conflict).ok()
            }
            AppError::Engine(
                EngineError::RecordNotFound { table, key }
                | EngineError::RecordAlreadyExists { table, key },
            ) => Some(serde_json::json!({"table": table, "key": key})),
            _ => None,
        }
    }

    pub fn requires_full_sync(&self) -> bool {
        match self {
            AppError::Engine(EngineError::ConcurrencyGuardFailed(conflict)) => {
                conflict.requires_full_sync()
            }
            AppError::Engine(EngineError::InsertOnlyViolation(_)) => true,
            _ => false,
        }
    }

    /// Message safe to show a client; storage internals stay in the logs.
    pub fn public_message(&self) -> String {
        match self {
            AppError::Database(_) | AppError::Durable(_) => "Durable store failure".to_string(),
            AppError::Internal(_) => "Internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

/// Error response body.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorResponse {
    error: String,
    code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<Value>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    requires_full_sync: bool,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        match &self {
            AppError::Database(e) => tracing::error!("Database error: {:?}", e),
            AppError::Durable(e) => tracing::error!("Durable store failure: {:?}", e),
            AppError::Internal(msg) => tracing::error!("Internal error: {}", msg),
            AppError::Engine(e) => tracing::warn!(code = e.code(), "Engine error: {}", e),
            _ => {}
        }

        let body = Json(ErrorResponse {
            error: self.public_message(),
            code: self.code(),
            details: self.details(),
            requires_full_sync: self.requires_full_sync(),
        });

        (status, body).into_response()
    }
}

/// Result type alias for handlers.
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;
    use pos_sync_engine::{ConflictReason, GuardConflict, VersionConflict};

    #[test]
    fn conflicts_map_to_409() {
        let err = AppError::from(EngineError::VersionConflict(VersionConflict {
            table: "order_header".into(),
            key: "o1".into(),
            expected_version: Some(2),
            current_version: 2,
            reason: ConflictReason::StaleVersion,
        }));
        assert_eq!(err.status(), StatusCode::CONFLICT);
        assert_eq!(err.code(), "version-conflict");
        let details = err.details().unwrap();
        assert_eq!(details["reason"], "stale-version");
        assert!(!err.requires_full_sync());
    }

    #[test]
    fn guard_failures_may_require_full_sync() {
        let err = AppError::from(EngineError::ConcurrencyGuardFailed(
            GuardConflict::SnapshotMismatch {
                expected: Some("2024-02-01".into()),
                actual: Some("2024-02-02".into()),
            },
        ));
        assert_eq!(err.status(), StatusCode::CONFLICT);
        assert!(err.requires_full_sync());
    }

    #[test]
    fn lookups_map_to_404() {
        let err = AppError::from(EngineError::ModuleNotFound("kitchen".into()));
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
        let err = AppError::from(EngineError::MissingRequiredField("item".into()));
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn durable_failures_hide_internals() {
        let err = AppError::from(DurableError::Unavailable("disk on fire".into()));
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.public_message(), "Durable store failure");
    }
}
