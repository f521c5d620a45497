//! Application error taxonomy and its HTTP mapping.
//!
//! Categories, not call sites: every fallible path in the crate funnels into
//! one of these variants. Validation is never retried; Conflict means the
//! caller raced something (duplicate attempt, running job, full lobby) and
//! decides its own retry policy; OracleTransient is retried once inside jobs
//! and only reaches HTTP if a synchronous path touches the oracle.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("oracle unavailable: {0}")]
    OracleTransient(String),

    #[error("{0}")]
    Internal(String),
}

impl AppError {
    pub fn validation(msg: impl Into<String>) -> Self {
        AppError::Validation(msg.into())
    }

    pub fn not_found(what: &str, id: impl std::fmt::Display) -> Self {
        AppError::NotFound(format!("{} {} not found", what, id))
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        AppError::Conflict(msg.into())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            AppError::OracleTransient(msg) => {
                tracing::warn!(target: "examroom", error = %msg, "oracle transient error reached http");
                (StatusCode::BAD_GATEWAY, msg)
            }
            AppError::Internal(msg) => {
                tracing::error!(target: "examroom", error = %msg, "internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Validation(err.to_string())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        AppError::OracleTransient(err.to_string())
    }
}
