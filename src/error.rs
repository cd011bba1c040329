//! Error types for the drive_facade crate.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while signing in or talking to Google Drive.
#[derive(Error, Debug)]
pub enum DriveError {
    #[error("Sign-in failed: {0}")]
    SignInFailed(String),

    #[error("OAuth state mismatch: expected {expected}, got {actual}")]
    StateMismatch { expected: String, actual: String },

    #[error("Token exchange failed: {0}")]
    TokenExchange(String),

    #[error("Invalid identity token: {0}")]
    IdToken(#[from] jsonwebtoken::errors::Error),

    #[error("Not signed in: no Drive service available")]
    NotAuthenticated,

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({status}): {message}")]
    ApiError { status: u16, message: String },

    #[error("Failed to parse JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Local file not found: {}", .0.display())]
    LocalFileNotFound(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Worker task failed: {0}")]
    TaskFailed(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl DriveError {
    /// Whether retrying the same call later could succeed.
    ///
    /// Timeouts, connection failures, rate limiting (429) and server errors
    /// (5xx) are transient. Everything else needs caller intervention.
    pub fn is_transient(&self) -> bool {
        match self {
            DriveError::Timeout(_) => true,
            DriveError::Http(e) => {
                e.is_timeout()
                    || e.is_connect()
                    || e.status().is_some_and(|s| s.as_u16() == 429 || s.is_server_error())
            }
            DriveError::ApiError { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

/// Result type alias for DriveError.
pub type Result<T> = std::result::Result<T, DriveError>;
