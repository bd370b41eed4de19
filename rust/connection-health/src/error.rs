//! Error taxonomy for schedule management and execution.
//!
//! Validation and not-found errors are raised before any state change.
//! Per-connection test failures never surface here: the executor downgrades
//! them to failed [`ConnectionOutcome`](crate::scheduler::ConnectionOutcome)s.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

use crate::scheduler::cron::CronError;

/// Errors returned by the scheduling core.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Input rejected before any write.
    #[error("Invalid {field}: {message}")]
    Validation { field: String, message: String },

    /// Referenced application or schedule does not exist.
    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },

    /// Another run currently holds the schedule lease.
    #[error("Schedule '{schedule_id}' is already running")]
    AlreadyRunning { schedule_id: String },

    /// A scheduled run found its occurrence already consumed, or the
    /// schedule disabled or edited since it was selected.
    #[error("Schedule '{schedule_id}' is no longer due")]
    NotDue { schedule_id: String },

    /// The connection source could not be queried.
    #[error("Connection source error: {0}")]
    Source(String),

    /// A run result could not be written back after all retries.
    #[error("Failed to persist run result for schedule '{schedule_id}' after {attempts} attempts: {message}")]
    Persistence {
        schedule_id: String,
        attempts: u32,
        message: String,
    },

    /// Opaque store failure.
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Result alias for scheduler operations.
pub type SchedulerResult<T> = Result<T, SchedulerError>;

impl SchedulerError {
    /// Create a validation error for a request field.
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a not-found error for an application.
    pub fn application_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            entity: "Application",
            id: id.into(),
        }
    }

    /// Create a not-found error for a schedule.
    pub fn schedule_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            entity: "Schedule",
            id: id.into(),
        }
    }

    /// Machine readable error code used in HTTP responses.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation_error",
            Self::NotFound { .. } => "not_found",
            Self::AlreadyRunning { .. } => "already_running",
            Self::NotDue { .. } => "not_due",
            Self::Source(_) => "run_error",
            Self::Persistence { .. } => "persistence_error",
            Self::Storage(_) => "storage_error",
        }
    }

    /// HTTP status for this error.
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation { .. } => StatusCode::BAD_REQUEST,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::AlreadyRunning { .. } | Self::NotDue { .. } => StatusCode::CONFLICT,
            Self::Source(_) | Self::Persistence { .. } | Self::Storage(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<CronError> for SchedulerError {
    fn from(err: CronError) -> Self {
        Self::validation("cron_expression", err.to_string())
    }
}

/// JSON body of an error response.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

impl IntoResponse for SchedulerError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }
        let field = match &self {
            Self::Validation { field, .. } => Some(field.clone()),
            _ => None,
        };
        let body = ErrorBody {
            error: self.code(),
            message: self.to_string(),
            field,
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_display() {
        let err = SchedulerError::validation("cron_expression", "expected 5 fields, found 3");
        assert_eq!(
            err.to_string(),
            "Invalid cron_expression: expected 5 fields, found 3"
        );
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_not_found_is_distinct_from_validation() {
        let err = SchedulerError::application_not_found("app-9");
        assert_eq!(err.to_string(), "Application 'app-9' not found");
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(err.code(), "not_found");
    }

    #[test]
    fn test_cron_error_converts_to_validation() {
        let err: SchedulerError = CronError::FieldCount { found: 3 }.into();
        assert!(matches!(err, SchedulerError::Validation { ref field, .. } if field == "cron_expression"));
    }
}
