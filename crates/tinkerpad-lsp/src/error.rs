//! Error types for the language-intelligence subsystem.

use thiserror::Error;

/// Result type for language server operations.
pub type LspResult<T> = Result<T, LspError>;

/// Errors that can occur while talking to the language server.
///
/// Nothing in this crate lets one of these cross the editor-facing boundary:
/// every public query degrades to an empty result and a log line instead.
#[derive(Debug, Error)]
pub enum LspError {
    /// Server executable missing or not executable.
    #[error("Failed to launch language server: {0}")]
    LaunchFailed(String),

    /// No response arrived within the configured deadline.
    #[error("Request timed out")]
    Timeout,

    /// The child process is gone, or was never attached.
    #[error("Language server disconnected")]
    Disconnected,

    /// The server understood the request and rejected it.
    #[error("Server error: {0}")]
    ServerError(String),

    /// Malformed framing or JSON on the wire.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Invalid document URI.
    #[error("Invalid URI: {0}")]
    InvalidUri(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl LspError {
    /// Create a launch failure error.
    pub fn launch_failed(message: impl Into<String>) -> Self {
        Self::LaunchFailed(message.into())
    }

    /// Create a server error.
    pub fn server_error(message: impl Into<String>) -> Self {
        Self::ServerError(message.into())
    }

    /// Create an invalid response error.
    pub fn invalid_response(message: impl Into<String>) -> Self {
        Self::InvalidResponse(message.into())
    }
}
