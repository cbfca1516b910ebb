use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::escrow::models::Coin;

/// Top-level error type for the entire application
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Record store error: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid address for {coin}: {address}")]
    InvalidAddress { coin: Coin, address: String },

    #[error("Unsupported coin pair: {from} -> {to}")]
    UnsupportedCoinPair { from: Coin, to: Coin },

    #[error("External error: {0}")]
    ExternalError(String),

    #[error("Bad request: {0}")]
    BadRequest(String),
}

/// Errors surfaced by a coin node's RPC interface
#[derive(Error, Debug)]
pub enum LedgerError {
    /// Transient: the node could not be reached in time. The affected
    /// escrow is skipped for the tick and re-read on the next one.
    #[error("Ledger unavailable for {coin}: {message}")]
    Unavailable { coin: Coin, message: String },

    /// The node rejected or failed an outbound payment. Persisted in the
    /// transaction log, never retried automatically within the same tick.
    #[error("Payment failed on {coin}: {message}")]
    PaymentFailed { coin: Coin, message: String },

    #[error("No ledger client registered for {0}")]
    UnknownCoin(Coin),
}

/// Errors from the escrow record store
#[derive(Error, Debug)]
pub enum StoreError {
    /// Concurrent-update detected: a conditional update matched zero rows.
    /// The caller retries exactly once with fresh state, then skips.
    #[error("Conflicting concurrent update on escrow {0}")]
    Conflict(uuid::Uuid),

    #[error("Escrow not found: {0}")]
    NotFound(uuid::Uuid),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// API error response structure
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_code, message, details) = match self {
            AppError::NotFound(what) => (
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                format!("Not found: {}", what),
                None,
            ),
            AppError::InvalidAddress { coin, address } => (
                StatusCode::BAD_REQUEST,
                "INVALID_ADDRESS",
                format!("Invalid {} address: {}", coin, address),
                Some(serde_json::json!({ "coin": coin })),
            ),
            AppError::UnsupportedCoinPair { from, to } => (
                StatusCode::BAD_REQUEST,
                "UNSUPPORTED_COIN_PAIR",
                format!("Coin pair {} -> {} is not supported", from, to),
                Some(serde_json::json!({ "from_coin": from, "to_coin": to })),
            ),
            AppError::InvalidInput(msg) | AppError::BadRequest(msg) => {
                (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg, None)
            }
            AppError::Store(StoreError::NotFound(id)) => (
                StatusCode::NOT_FOUND,
                "ESCROW_NOT_FOUND",
                format!("Escrow not found: {}", id),
                None,
            ),
            AppError::Store(StoreError::Conflict(id)) => (
                StatusCode::CONFLICT,
                "CONCURRENT_UPDATE",
                format!("Escrow {} was modified concurrently", id),
                None,
            ),
            AppError::Database(_) | AppError::Store(StoreError::Database(_)) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "DATABASE_ERROR",
                "A database error occurred".to_string(),
                None,
            ),
            AppError::Ledger(err) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "LEDGER_ERROR",
                err.to_string(),
                None,
            ),
            _ => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "An internal error occurred".to_string(),
                None,
            ),
        };

        let body = Json(ErrorResponse {
            error: message,
            error_code: error_code.to_string(),
            details,
        });

        (status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(error: anyhow::Error) -> Self {
        AppError::Internal(format!("Error converting: {:?}", error))
    }
}

impl From<rust_decimal::Error> for AppError {
    fn from(error: rust_decimal::Error) -> Self {
        AppError::InvalidInput(format!("Decimal conversion error: {:?}", error))
    }
}

impl From<reqwest::Error> for AppError {
    fn from(error: reqwest::Error) -> Self {
        AppError::ExternalError(format!("HTTP request error: {:?}", error))
    }
}

impl From<sqlx::migrate::MigrateError> for AppError {
    fn from(error: sqlx::migrate::MigrateError) -> Self {
        AppError::Internal(format!("Migration error: {:?}", error))
    }
}

/// Result type alias for the application
pub type AppResult<T> = Result<T, AppError>;
