//! API error handling
//!
//! Structured error responses with stable codes and request tracking. Every
//! synchronous failure carries a machine code and a short human-readable
//! message; internals never leak stack traces.

use crate::errors::{CrashError, EngineError, LedgerError};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Top-level API error response with request tracking
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub request_id: String,
    pub error: ErrorBody,
}

/// Error body with structured information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Stable machine code (validation, state, funds, not_found, internal)
    pub code: String,
    /// Human-readable error message
    pub message: String,
}

/// API error with request tracking
#[derive(Debug)]
pub struct ApiError {
    pub kind: ApiErrorKind,
    pub request_id: String,
}

#[derive(Debug)]
pub enum ApiErrorKind {
    Validation(String),
    State(String),
    Funds(String),
    NotFound(String),
    Internal(String),
    Unavailable(String),
}

impl ApiError {
    pub fn validation(request_id: String, message: String) -> Self {
        Self {
            kind: ApiErrorKind::Validation(message),
            request_id,
        }
    }

    pub fn not_found(request_id: String, message: String) -> Self {
        Self {
            kind: ApiErrorKind::NotFound(message),
            request_id,
        }
    }

    pub fn internal(request_id: String, message: String) -> Self {
        Self {
            kind: ApiErrorKind::Internal(message),
            request_id,
        }
    }

    /// Map a core error onto the caller-visible taxonomy
    pub fn from_crash(request_id: String, error: CrashError) -> Self {
        let kind = match &error {
            CrashError::Ledger(e) => match e {
                LedgerError::InsufficientBalance { .. } => ApiErrorKind::Funds(e.to_string()),
                LedgerError::PlayerNotFound(_) | LedgerError::RoundNotFound(_) => {
                    ApiErrorKind::NotFound(e.to_string())
                }
                LedgerError::DuplicatePlayer(_)
                | LedgerError::InvalidAmount(_)
                | LedgerError::InvalidPlayer(_) => ApiErrorKind::Validation(e.to_string()),
            },
            CrashError::Engine(e) => match e {
                EngineError::StakeOutOfRange { .. } => ApiErrorKind::Validation(e.to_string()),
                EngineError::Halted => {
                    ApiErrorKind::Unavailable("Service temporarily unavailable".to_string())
                }
                _ => ApiErrorKind::State(e.to_string()),
            },
            // Infrastructure details stay in the logs.
            CrashError::Storage(_) | CrashError::Configuration(_) | CrashError::Oracle(_) => {
                ApiErrorKind::Internal("Internal error".to_string())
            }
        };

        Self { kind, request_id }
    }
}

/// Stable code for a core error, shared with the stream surface
pub fn error_code(error: &CrashError) -> &'static str {
    match error {
        CrashError::Ledger(LedgerError::InsufficientBalance { .. }) => "funds",
        CrashError::Ledger(LedgerError::PlayerNotFound(_))
        | CrashError::Ledger(LedgerError::RoundNotFound(_)) => "not_found",
        CrashError::Ledger(_) => "validation",
        CrashError::Engine(EngineError::StakeOutOfRange { .. }) => "validation",
        CrashError::Engine(_) => "state",
        _ => "internal",
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ApiErrorKind::Validation(msg) => write!(f, "[{}] Validation: {}", self.request_id, msg),
            ApiErrorKind::State(msg) => write!(f, "[{}] State: {}", self.request_id, msg),
            ApiErrorKind::Funds(msg) => write!(f, "[{}] Funds: {}", self.request_id, msg),
            ApiErrorKind::NotFound(msg) => write!(f, "[{}] Not Found: {}", self.request_id, msg),
            ApiErrorKind::Internal(msg) => write!(f, "[{}] Internal: {}", self.request_id, msg),
            ApiErrorKind::Unavailable(msg) => {
                write!(f, "[{}] Unavailable: {}", self.request_id, msg)
            }
        }
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self.kind {
            ApiErrorKind::Validation(msg) => (StatusCode::BAD_REQUEST, "validation", msg.clone()),
            ApiErrorKind::State(msg) => (StatusCode::CONFLICT, "state", msg.clone()),
            ApiErrorKind::Funds(msg) => (StatusCode::PAYMENT_REQUIRED, "funds", msg.clone()),
            ApiErrorKind::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg.clone()),
            ApiErrorKind::Internal(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal", msg.clone())
            }
            ApiErrorKind::Unavailable(msg) => {
                (StatusCode::SERVICE_UNAVAILABLE, "internal", msg.clone())
            }
        };

        let body = Json(ErrorResponse {
            request_id: self.request_id.clone(),
            error: ErrorBody {
                code: code.to_string(),
                message,
            },
        });

        (status, body).into_response()
    }
}
