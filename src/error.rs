//! Unified error handling for the listing-map engine.
//!
//! Every fallible engine operation returns [`MapError`]. None of these escape the
//! orchestrator's control loop: they are turned into a [`crate::MapStatus`] so a
//! failure in the map never breaks the rest of the page.

use thiserror::Error;

/// Unified error type for map engine operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MapError {
    /// Viewport is not measurable yet (missing or non-finite corners).
    /// Callers wait for the next settle and retry.
    #[error("Viewport bounds are not available yet")]
    InvalidBounds,
    /// HTTP transport, status or body parse failure.
    #[error("Fetch failed{}: {message}", status_suffix(.status_code))]
    FetchFailed {
        status_code: Option<u16>,
        message: String,
    },
    /// Configuration error
    #[error("Configuration error: {message}")]
    Config { message: String },
    /// Generic internal error
    #[error("Internal error: {message}")]
    Internal { message: String },
}

fn status_suffix(status_code: &Option<u16>) -> String {
    match status_code {
        Some(code) => format!(" (HTTP {})", code),
        None => String::new(),
    }
}

impl MapError {
    /// Failure without an HTTP status (transport or parse error).
    pub fn fetch_failed(message: impl Into<String>) -> Self {
        MapError::FetchFailed {
            status_code: None,
            message: message.into(),
        }
    }

    /// Non-success HTTP status.
    pub fn http_status(status_code: u16) -> Self {
        MapError::FetchFailed {
            status_code: Some(status_code),
            message: format!("unexpected status {}", status_code),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        MapError::Config {
            message: message.into(),
        }
    }

    /// HTTP status code carried by a fetch failure, if any.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            MapError::FetchFailed { status_code, .. } => *status_code,
            _ => None,
        }
    }
}

/// Result type alias for map engine operations.
pub type Result<T> = std::result::Result<T, MapError>;

/// Extension trait for converting Option to MapError.
pub trait OptionExt<T> {
    /// Convert Option to Result with an invalid bounds error.
    fn ok_or_invalid_bounds(self) -> Result<T>;

    /// Convert Option to Result with generic internal error.
    fn ok_or_internal(self, message: &str) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_invalid_bounds(self) -> Result<T> {
        self.ok_or(MapError::InvalidBounds)
    }

    fn ok_or_internal(self, message: &str) -> Result<T> {
        self.ok_or_else(|| MapError::Internal {
            message: message.to_string(),
        })
    }
}
