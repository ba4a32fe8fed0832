use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::fmt;
use std::time::Duration;

/// Substring the SQLite driver uses when a write could not get the lock.
pub const STORE_CONTENTION_SIGNATURE: &str = "database is locked";

/// Seconds a client is told to wait after a `database_busy` rejection.
pub const DATABASE_BUSY_RETRY_AFTER_SECS: u64 = 2;

// SQLite primary result codes (extended codes carry these in the low byte).
const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;

/// Application-wide error type
#[derive(Debug)]
pub enum AppError {
    // Database errors
    Database(sqlx::Error),
    DatabaseMigration(sqlx::migrate::MigrateError),

    // Request protection
    RateLimitExceeded { limit: u32, retry_after: Duration },
    DuplicateRequest { window: Duration },
    DatabaseBusy,

    // Lead errors
    LeadNotFound(String),

    // Validation errors
    ValidationError(String),

    // Configuration errors
    Configuration(String),

    // Internal errors
    Internal(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Database(e) => write!(f, "Database error: {}", e),
            AppError::DatabaseMigration(e) => write!(f, "Database migration error: {}", e),
            AppError::RateLimitExceeded { limit, .. } => {
                write!(f, "Rate limit exceeded ({} requests per window)", limit)
            }
            AppError::DuplicateRequest { window } => write!(
                f,
                "Duplicate request within {}s window",
                window.as_secs_f64()
            ),
            AppError::DatabaseBusy => write!(f, "Database is busy"),
            AppError::LeadNotFound(whatsapp) => write!(f, "Lead not found: {}", whatsapp),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            AppError::Configuration(msg) => write!(f, "Configuration error: {}", msg),
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for AppError {}

// Convert from various error types
impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::Database(err)
    }
}

impl From<sqlx::migrate::MigrateError> for AppError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        AppError::DatabaseMigration(err)
    }
}

impl AppError {
    /// Whether this failure means the store was transiently contended.
    ///
    /// Driver errors are classified by SQLite result code; anything else
    /// falls back to matching the driver's contention message.
    pub fn is_store_contention(&self) -> bool {
        match self {
            AppError::Database(err) => is_sqlite_contention(err),
            AppError::DatabaseBusy => true,
            other => matches_contention_signature(&other.to_string()),
        }
    }

    /// Machine-readable reason for the rejections decided by the protection layer.
    pub fn reason(&self) -> Option<&'static str> {
        match self {
            AppError::RateLimitExceeded { .. } => Some("rate_limit"),
            AppError::DuplicateRequest { .. } => Some("duplicate"),
            AppError::DatabaseBusy => Some("database_busy"),
            _ => None,
        }
    }
}

/// Classify a sqlx error as SQLite BUSY/LOCKED contention.
pub fn is_sqlite_contention(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code().and_then(|c| c.parse::<i32>().ok()) {
            let primary = code & 0xff;
            if primary == SQLITE_BUSY || primary == SQLITE_LOCKED {
                return true;
            }
        }
    }

    matches_contention_signature(&err.to_string())
}

/// Fallback for opaque failures: match the contention signature in the description.
pub fn matches_contention_signature(description: &str) -> bool {
    description
        .to_lowercase()
        .contains(STORE_CONTENTION_SIGNATURE)
}

/// Attached to every error response produced from an [`AppError`] raised by a
/// handler, so outer middleware can inspect the failure after the fact.
#[derive(Debug, Clone)]
pub struct HandlerFailure {
    pub description: String,
    pub store_contention: bool,
}

// Implement IntoResponse for Axum
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match &self {
            AppError::RateLimitExceeded { limit, retry_after } => {
                let body = Json(json!({
                    "success": false,
                    "error": "Too many requests",
                    "reason": "rate_limit",
                    "retry_after": retry_after.as_secs_f64(),
                    "limit": limit,
                    "remaining": 0,
                }));
                let mut response = (StatusCode::TOO_MANY_REQUESTS, body).into_response();

                // Retry-After only accepts whole seconds
                let secs = retry_after.as_secs_f64().ceil().max(1.0) as u64;
                if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                    response.headers_mut().insert(header::RETRY_AFTER, value);
                }
                return response;
            }
            AppError::DuplicateRequest { window } => {
                let body = Json(json!({
                    "success": false,
                    "error": "Duplicate request",
                    "reason": "duplicate",
                    "message": format!(
                        "Same request received within {}s window",
                        window.as_secs_f64()
                    ),
                    "window_seconds": window.as_secs_f64(),
                }));
                return (StatusCode::CONFLICT, body).into_response();
            }
            AppError::DatabaseBusy => {
                let body = Json(json!({
                    "success": false,
                    "error": "Service temporarily unavailable",
                    "reason": "database_busy",
                    "message": "Database is busy, please retry in a few seconds",
                    "retry_after": DATABASE_BUSY_RETRY_AFTER_SECS,
                }));
                let mut response = (StatusCode::SERVICE_UNAVAILABLE, body).into_response();
                response.headers_mut().insert(
                    header::RETRY_AFTER,
                    HeaderValue::from(DATABASE_BUSY_RETRY_AFTER_SECS),
                );
                return response;
            }
            _ => {}
        }

        let (status, error_message) = match &self {
            AppError::Database(_) | AppError::DatabaseMigration(_) => {
                tracing::error!("Database error: {:?}", self);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
            AppError::LeadNotFound(_) => (StatusCode::NOT_FOUND, "Lead not found".to_string()),
            AppError::ValidationError(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Configuration(_) => {
                tracing::error!("Configuration error: {:?}", self);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
            _ => {
                tracing::error!("Internal error: {:?}", self);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
        };

        let failure = HandlerFailure {
            description: self.to_string(),
            store_contention: self.is_store_contention(),
        };

        let body = Json(json!({
            "success": false,
            "error": error_message,
            "status": status.as_u16(),
        }));

        let mut response = (status, body).into_response();
        response.extensions_mut().insert(failure);
        response
    }
}

/// Result type alias for the application
pub type Result<T> = std::result::Result<T, AppError>;
