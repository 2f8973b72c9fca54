//! Error types for workflow synchronization

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WorkflowError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Search error: {0}")]
    Search(String),

    /// Missing workflow, step or action definition
    #[error("Workflow configuration error: {0}")]
    Configuration(String),

    /// Data that can never succeed as-is, e.g. an item without `relationship.type`
    #[error("Illegal argument: {0}")]
    IllegalArgument(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl WorkflowError {
    /// Infrastructure failures may succeed when the whole action is re-invoked.
    pub fn is_retryable(&self) -> bool {
        matches!(self, WorkflowError::Database(_) | WorkflowError::Search(_))
    }
}

impl IntoResponse for WorkflowError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            WorkflowError::Database(e) => {
                tracing::error!("Database error: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Database error".to_string())
            }
            WorkflowError::Migration(e) => {
                tracing::error!("Migration error: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Database error".to_string())
            }
            WorkflowError::Search(e) => {
                tracing::error!("Search error: {}", e);
                (StatusCode::SERVICE_UNAVAILABLE, format!("Search error: {}", e))
            }
            WorkflowError::Configuration(e) => {
                tracing::error!("Workflow configuration error: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, e.clone())
            }
            WorkflowError::IllegalArgument(e) => (StatusCode::UNPROCESSABLE_ENTITY, e.clone()),
            WorkflowError::InvalidState(e) => (StatusCode::CONFLICT, e.clone()),
            WorkflowError::NotFound(e) => (StatusCode::NOT_FOUND, e.clone()),
            WorkflowError::BadRequest(e) => (StatusCode::BAD_REQUEST, e.clone()),
            WorkflowError::Internal(e) => {
                tracing::error!("Internal error: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, e.clone())
            }
        };

        (status, message).into_response()
    }
}

pub type Result<T> = std::result::Result<T, WorkflowError>;
