//! Application error types for the change request service.
//!
//! These errors are serializable so the HTTP layer can return them as
//! structured JSON, and each variant maps to a stable kind code.

use serde::Serialize;
use thiserror::Error;

/// Application-level errors returned by the lifecycle engine and its collaborators.
///
/// All variants serialize to a structured JSON object for API consumers.
#[derive(Debug, Error, Serialize)]
#[serde(tag = "type", content = "details")]
pub enum AppError {
    /// Caller identity is missing, or the caller lacks a required membership.
    #[error("Unauthorized: {message}")]
    Unauthorized { message: String },

    /// Caller is identified but does not hold the capability or ownership required.
    #[error("Forbidden: {message}")]
    Forbidden { message: String },

    /// Requested resource not found.
    #[error("Not found: {resource}")]
    NotFound {
        resource: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },

    /// Operation is not legal for the current workflow status.
    #[error("Invalid state: {message}")]
    InvalidState {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        current_status: Option<String>,
    },

    /// A field value was malformed or outside its allowed set.
    #[error("Invalid value: {message}")]
    InvalidValue {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        field: Option<String>,
    },

    /// Review decision was not `APPROVED` or `REJECTED`.
    #[error("Invalid decision: {message}")]
    InvalidDecision { message: String },

    /// Configuration changes payload is not valid structured data.
    #[error("Invalid payload: {message}")]
    InvalidPayload { message: String },

    /// Uniqueness violation, e.g. a duplicate role grant.
    #[error("Conflict: {message}")]
    Conflict { message: String },

    /// Database operation failed.
    #[error("Database error: {message}")]
    Database { message: String },

    /// Internal application error.
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl AppError {
    /// Create an unauthorized error.
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized {
            message: message.into(),
        }
    }

    /// Create a forbidden error.
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden {
            message: message.into(),
        }
    }

    /// Create a not found error with ID.
    pub fn not_found_with_id(resource: impl Into<String>, id: impl ToString) -> Self {
        Self::NotFound {
            resource: resource.into(),
            id: Some(id.to_string()),
        }
    }

    /// Create an invalid state error.
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
            current_status: None,
        }
    }

    /// Create an invalid state error carrying the status that blocked the operation.
    pub fn invalid_state_at(message: impl Into<String>, current_status: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
            current_status: Some(current_status.into()),
        }
    }

    /// Create an invalid value error with field name.
    pub fn invalid_value_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::InvalidValue {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create an invalid decision error.
    pub fn invalid_decision(message: impl Into<String>) -> Self {
        Self::InvalidDecision {
            message: message.into(),
        }
    }

    /// Create an invalid payload error.
    pub fn invalid_payload(message: impl Into<String>) -> Self {
        Self::InvalidPayload {
            message: message.into(),
        }
    }

    /// Create a conflict error.
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    /// Create a database error.
    pub fn database(message: impl Into<String>) -> Self {
        Self::Database {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Stable, machine-readable error kind.
    ///
    /// Storage failures are reported as `INTERNAL`; callers never see driver details
    /// in the kind code.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unauthorized { .. } => "UNAUTHORIZED",
            Self::Forbidden { .. } => "FORBIDDEN",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::InvalidState { .. } => "INVALID_STATE",
            Self::InvalidValue { .. } => "INVALID_VALUE",
            Self::InvalidDecision { .. } => "INVALID_DECISION",
            Self::InvalidPayload { .. } => "INVALID_PAYLOAD",
            Self::Conflict { .. } => "CONFLICT",
            Self::Database { .. } | Self::Internal { .. } => "INTERNAL",
        }
    }
}

// Conversions from common error types

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            if db_err.is_unique_violation() {
                return Self::conflict(db_err.message().to_string());
            }
        }
        Self::database(err.to_string())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::internal("Webhook request timed out")
        } else if err.is_connect() {
            Self::internal("Failed to connect to webhook endpoint")
        } else {
            Self::internal(format!("Webhook request failed: {}", err))
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::internal(format!("JSON error: {}", err))
    }
}

impl From<crate::db::DbError> for AppError {
    fn from(err: crate::db::DbError) -> Self {
        Self::database(err.to_string())
    }
}
