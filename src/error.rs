use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use sqlx::migrate::MigrateError;
use thiserror::Error;
use uuid::Uuid;

use crate::ledger::models::{RevenueStatus, SourceType};

/// Top-level error type for the entire application
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Token vault error: {0}")]
    Vault(#[from] VaultError),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Payout blocked: revenue record is {status}")]
    PayoutBlocked { status: RevenueStatus },

    #[error("Invalid state: {current}, expected: {expected}")]
    InvalidState { current: String, expected: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Unauthorized")]
    Unauthorized,
}

impl AppError {
    /// Provider failures that require a fresh manual authorization
    pub fn is_credential_failure(&self) -> bool {
        match self {
            AppError::Provider(e) => e.is_auth_failure(),
            AppError::Vault(e) => e.is_credential_failure(),
            _ => false,
        }
    }
}

/// Credential lifecycle and token encryption errors
#[derive(Error, Debug)]
pub enum VaultError {
    #[error("Invalid encryption key: {0}")]
    InvalidKey(String),

    #[error("Token encryption failed")]
    Encryption,

    #[error("Token decryption failed: authentication tag mismatch")]
    Decryption,

    #[error("Malformed ciphertext: {0}")]
    MalformedCiphertext(String),

    #[error("Unsupported ciphertext version: {0}")]
    UnsupportedVersion(u8),

    #[error("Connection {0} has no stored access token")]
    MissingAccessToken(Uuid),

    #[error("Connection {0} has no refresh token; re-authorization required")]
    MissingRefreshToken(Uuid),

    #[error("Connection {0} is disconnected")]
    Disconnected(Uuid),

    #[error("No OAuth client registered for {0}")]
    NoOAuthClient(SourceType),

    #[error("Token refresh failed for connection {connection_id}: {reason}")]
    RefreshFailed { connection_id: Uuid, reason: String, auth_failure: bool },
}

impl VaultError {
    pub fn is_credential_failure(&self) -> bool {
        match self {
            VaultError::MissingAccessToken(_)
            | VaultError::MissingRefreshToken(_)
            | VaultError::Disconnected(_)
            | VaultError::Decryption
            | VaultError::MalformedCiphertext(_)
            | VaultError::UnsupportedVersion(_) => true,
            VaultError::RefreshFailed { auth_failure, .. } => *auth_failure,
            _ => false,
        }
    }
}

/// Errors talking to a third-party revenue provider
#[derive(Error, Debug, Clone)]
pub enum ProviderError {
    #[error("{provider} rejected credentials ({status}): {message}")]
    Unauthorized { provider: SourceType, status: u16, message: String },

    #[error("{provider} rate limited the request")]
    RateLimited { provider: SourceType },

    #[error("{provider} request timed out")]
    Timeout { provider: SourceType },

    #[error("{provider} transient failure: {message}")]
    Transient { provider: SourceType, message: String },

    #[error("{provider} rejected request ({status}): {message}")]
    Rejected { provider: SourceType, status: u16, message: String },

    #[error("{provider} returned a malformed payload: {message}")]
    MalformedPayload { provider: SourceType, message: String },
}

impl ProviderError {
    /// Transient failures are retried with backoff; everything else is not
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::RateLimited { .. }
                | ProviderError::Timeout { .. }
                | ProviderError::Transient { .. }
        )
    }

    pub fn is_auth_failure(&self) -> bool {
        matches!(self, ProviderError::Unauthorized { .. })
    }

    pub fn provider(&self) -> SourceType {
        match self {
            ProviderError::Unauthorized { provider, .. }
            | ProviderError::RateLimited { provider }
            | ProviderError::Timeout { provider }
            | ProviderError::Transient { provider, .. }
            | ProviderError::Rejected { provider, .. }
            | ProviderError::MalformedPayload { provider, .. } => *provider,
        }
    }

    pub fn from_reqwest(provider: SourceType, error: reqwest::Error) -> Self {
        if error.is_timeout() {
            ProviderError::Timeout { provider }
        } else if error.is_decode() {
            ProviderError::MalformedPayload {
                provider,
                message: error.to_string(),
            }
        } else {
            ProviderError::Transient {
                provider,
                message: error.to_string(),
            }
        }
    }
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
            AppError::InvalidInput(message) => (
                StatusCode::BAD_REQUEST,
                "INVALID_INPUT",
                message,
                None,
            ),
            AppError::InvalidState { current, expected } => (
                StatusCode::CONFLICT,
                "INVALID_STATE",
                format!("Invalid state: {}", current),
                Some(serde_json::json!({
                    "current": current,
                    "expected": expected,
                })),
            ),
            AppError::PayoutBlocked { status } => (
                StatusCode::CONFLICT,
                "PAYOUT_BLOCKED",
                format!("Revenue record is {}; payouts require VERIFIED", status),
                Some(serde_json::json!({ "status": status })),
            ),
            AppError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "UNAUTHORIZED",
                "Unauthorized".to_string(),
                None,
            ),
            AppError::Provider(e) => (
                StatusCode::BAD_GATEWAY,
                "PROVIDER_ERROR",
                e.to_string(),
                Some(serde_json::json!({ "provider": e.provider() })),
            ),
            AppError::Vault(VaultError::NoOAuthClient(source)) => (
                StatusCode::NOT_FOUND,
                "SOURCE_NOT_CONFIGURED",
                format!("No OAuth client configured for {}", source),
                None,
            ),
            AppError::Vault(e) if e.is_credential_failure() => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "REAUTHORIZATION_REQUIRED",
                e.to_string(),
                None,
            ),
            AppError::Database(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "DATABASE_ERROR",
                "A database error occurred".to_string(),
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

impl From<MigrateError> for AppError {
    fn from(error: MigrateError) -> Self {
        AppError::Internal(format!("Migration error: {:?}", error))
    }
}

impl From<reqwest::Error> for AppError {
    fn from(error: reqwest::Error) -> Self {
        AppError::Internal(format!("HTTP client error: {}", error))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(error: config::ConfigError) -> Self {
        AppError::Config(error.to_string())
    }
}

/// Result type alias for the application
pub type AppResult<T> = Result<T, AppError>;
