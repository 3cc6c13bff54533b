//! Error types for Fieldtrace
//!
//! One taxonomy shared by every component. Lifecycle/ordering violations are
//! terminal for the call and never retried automatically; infrastructure
//! transients are retried with backoff at the point of call before surfacing.

use hyper::StatusCode;

/// Main error type for Fieldtrace operations
#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    /// Stage 0 already exists for the tag
    #[error("Already registered: {0}")]
    AlreadyRegistered(String),

    /// No stage 0 exists for the tag
    #[error("Not registered: {0}")]
    NotRegistered(String),

    /// A final stage already exists for the tag
    #[error("Already finalized: {0}")]
    AlreadyFinalized(String),

    /// Lost the stage index race too many times
    #[error("Write conflict: {0}")]
    WriteConflict(String),

    /// Content, record, or media lookup miss
    #[error("Not found: {0}")]
    NotFound(String),

    /// Deleting actor did not register the record
    #[error("Not owner: {0}")]
    NotOwner(String),

    /// Content store backend unreachable or failing
    #[error("Content store unavailable: {0}")]
    StoreUnavailable(String),

    /// Ledger node unreachable or failing
    #[error("Ledger unavailable: {0}")]
    LedgerUnavailable(String),

    /// External call exceeded its deadline
    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TraceError {
    /// Convert error to HTTP status code for the front door
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::AlreadyRegistered(_) => StatusCode::CONFLICT,
            Self::AlreadyFinalized(_) => StatusCode::CONFLICT,
            Self::WriteConflict(_) => StatusCode::CONFLICT,
            Self::NotRegistered(_) => StatusCode::NOT_FOUND,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::NotOwner(_) => StatusCode::FORBIDDEN,
            Self::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::LedgerUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Database(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the caller may retry with backoff
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::StoreUnavailable(_) | Self::LedgerUnavailable(_) | Self::Timeout(_)
        )
    }
}

// From conversions for common error types

impl From<std::io::Error> for TraceError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for TraceError {
    fn from(err: serde_json::Error) -> Self {
        Self::BadRequest(format!("JSON error: {}", err))
    }
}

impl From<mongodb::error::Error> for TraceError {
    fn from(err: mongodb::error::Error) -> Self {
        Self::Database(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for TraceError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::LedgerUnavailable(err.to_string())
    }
}

/// Result type alias for Fieldtrace operations
pub type Result<T> = std::result::Result<T, TraceError>;
