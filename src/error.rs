use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ResolverError {
    #[error("{message}: {detail}")]
    Validation { message: String, detail: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Capability unavailable: {0}")]
    CapabilityUnavailable(String),

    #[error("Unsupported property operator: {0}")]
    UnsupportedOperator(String),

    #[error("Columnar query exceeded deadline of {0:?}")]
    QueryTimeout(Duration),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Task queue error: {0}")]
    Queue(String),

    #[error("Capture error: {0}")]
    Capture(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Structured 4xx body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorBody {
    pub message: String,
    pub detail: String,
}

impl ResolverError {
    pub fn validation(message: impl Into<String>, detail: impl Into<String>) -> Self {
        ResolverError::Validation {
            message: message.into(),
            detail: detail.into(),
        }
    }

    pub fn missing_parameter(detail: impl Into<String>) -> Self {
        Self::validation("Missing parameter", detail)
    }

    pub fn status_code(&self) -> u16 {
        match self {
            ResolverError::Validation { .. }
            | ResolverError::CapabilityUnavailable(_)
            | ResolverError::UnsupportedOperator(_) => 400,
            ResolverError::NotFound(_) => 404,
            ResolverError::QueryTimeout(_) => 504,
            _ => 500,
        }
    }

    /// Body to return to the caller. 404s are bare and server errors never
    /// carry internal detail.
    pub fn error_body(&self) -> Option<ErrorBody> {
        match self {
            ResolverError::Validation { message, detail } => Some(ErrorBody {
                message: message.clone(),
                detail: detail.clone(),
            }),
            ResolverError::CapabilityUnavailable(detail) => Some(ErrorBody {
                message: "Capability unavailable".to_string(),
                detail: detail.clone(),
            }),
            ResolverError::UnsupportedOperator(op) => Some(ErrorBody {
                message: "Unsupported operator".to_string(),
                detail: format!("Property operator '{}' is not supported", op),
            }),
            ResolverError::NotFound(_) => None,
            ResolverError::QueryTimeout(_) => Some(ErrorBody {
                message: "Query timed out".to_string(),
                detail: "The query took too long to complete".to_string(),
            }),
            _ => Some(ErrorBody {
                message: "Server error".to_string(),
                detail: "An unexpected error occurred".to_string(),
            }),
        }
    }
}

impl From<sqlx::Error> for ResolverError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => ResolverError::NotFound("row not found".to_string()),
            other => ResolverError::Database(other.to_string()),
        }
    }
}

impl From<rusqlite::Error> for ResolverError {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::QueryReturnedNoRows => {
                ResolverError::NotFound("row not found".to_string())
            }
            other => ResolverError::Database(other.to_string()),
        }
    }
}

impl From<reqwest::Error> for ResolverError {
    fn from(err: reqwest::Error) -> Self {
        ResolverError::Execution(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ResolverError>;
