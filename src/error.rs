//! Error types for the collaboration coordinator
//!
//! Provides structured error handling with:
//! - Numeric error codes for machine parsing
//! - User-friendly messages with suggestions
//! - Retry / fatality classification
//! - Exit codes for CLI
//!
//! Transport and protocol faults are never surfaced to UI code; they are
//! logged and reflected in the connection state. These types mostly matter at
//! process start (configuration, IO) and inside the server.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for coordinator operations
pub type Result<T> = std::result::Result<T, Error>;

/// Numeric error codes for machine parsing and documentation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    // Configuration errors (1xx)
    ConfigNotFound = 100,
    ConfigParseError = 101,
    ConfigValidation = 102,

    // IO errors (2xx)
    IoRead = 200,
    IoWrite = 201,
    IoPermission = 202,
    IoNotFound = 203,

    // Connection errors (3xx)
    ConnectionFailed = 300,
    ConnectionTimeout = 301,
    ConnectionClosed = 302,
    ConnectionLost = 303,
    InvalidUrl = 304,

    // Protocol errors (4xx)
    ProtocolMalformed = 401,
    HandshakeRejected = 402,

    // Server errors (5xx)
    BindFailed = 500,
    ContextUnavailable = 501,

    // Internal errors (9xx)
    InternalError = 900,
}

impl ErrorCode {
    /// Get the string code (e.g., "E100")
    pub fn as_str(&self) -> String {
        format!("E{}", *self as u16)
    }

    /// Get the exit code for CLI (maps to 1-125 range)
    pub fn exit_code(&self) -> i32 {
        match *self as u16 {
            100..=199 => 10, // Config errors
            200..=299 => 20, // IO errors
            300..=399 => 30, // Connection errors
            400..=499 => 40, // Protocol errors
            500..=599 => 50, // Server errors
            900..=999 => 90, // Internal errors
            _ => 1,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Main error type for the coordinator
#[derive(Error, Debug)]
pub enum Error {
    // ─────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: PathBuf },

    /// Configuration parse error
    #[error("Failed to parse configuration: {message}")]
    ConfigParse {
        message: String,
        #[source]
        source: Option<toml::de::Error>,
    },

    /// Configuration validation error
    #[error("Configuration validation failed: {message}")]
    ConfigValidation { message: String, field: Option<String> },

    /// Generic configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    // ─────────────────────────────────────────────────────────────
    // IO Errors
    // ─────────────────────────────────────────────────────────────

    /// File read error
    #[error("Failed to read file: {path}")]
    IoRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// File write error
    #[error("Failed to write file: {path}")]
    IoWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML serialization error
    #[error("TOML serialization error: {0}")]
    Toml(#[from] toml::ser::Error),

    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    // ─────────────────────────────────────────────────────────────
    // Connection Errors
    // ─────────────────────────────────────────────────────────────

    /// Connection failed
    #[error("Failed to connect to {url}: {message}")]
    ConnectionFailed { url: String, message: String },

    /// Connection timeout
    #[error("Connection to {url} timed out after {timeout_ms}ms")]
    ConnectionTimeout { url: String, timeout_ms: u64 },

    /// Peer closed the connection
    #[error("Connection closed by peer")]
    ConnectionClosed,

    /// Connection declared dead (missed heartbeats, read error)
    #[error("Lost connection to coordinator: {message}")]
    ConnectionLost { message: String },

    /// Coordination endpoint URL could not be parsed
    #[error("Invalid coordinator URL '{url}': {message}")]
    InvalidUrl { url: String, message: String },

    // ─────────────────────────────────────────────────────────────
    // Protocol Errors
    // ─────────────────────────────────────────────────────────────

    /// Malformed message
    #[error("Malformed protocol message: {message}")]
    ProtocolMalformed { message: String },

    /// JSON (de)serialization failure
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The endpoint refused the WebSocket upgrade (HTTP 4xx/5xx)
    #[error("Handshake rejected: {message}")]
    HandshakeRejected { message: String },

    // ─────────────────────────────────────────────────────────────
    // Server Errors
    // ─────────────────────────────────────────────────────────────

    /// Could not bind the listening socket
    #[error("Failed to bind {addr}: {source}")]
    BindFailed {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// The task owning a coordination context is gone
    #[error("Coordination context '{context}' is unavailable")]
    ContextUnavailable { context: String },

    // ─────────────────────────────────────────────────────────────
    // Internal Errors
    // ─────────────────────────────────────────────────────────────

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    // ─────────────────────────────────────────────────────────────
    // Error Classification
    // ─────────────────────────────────────────────────────────────

    /// Get the numeric error code
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::ConfigNotFound { .. } => ErrorCode::ConfigNotFound,
            Error::ConfigParse { .. } => ErrorCode::ConfigParseError,
            Error::ConfigValidation { .. } => ErrorCode::ConfigValidation,
            Error::Config(_) => ErrorCode::ConfigValidation,

            Error::IoRead { .. } => ErrorCode::IoRead,
            Error::IoWrite { .. } => ErrorCode::IoWrite,
            Error::Io(e) => match e.kind() {
                std::io::ErrorKind::NotFound => ErrorCode::IoNotFound,
                std::io::ErrorKind::PermissionDenied => ErrorCode::IoPermission,
                _ => ErrorCode::IoRead,
            },
            Error::Toml(_) => ErrorCode::ConfigParseError,
            Error::WebSocket(_) => ErrorCode::ConnectionFailed,

            Error::ConnectionFailed { .. } => ErrorCode::ConnectionFailed,
            Error::ConnectionTimeout { .. } => ErrorCode::ConnectionTimeout,
            Error::ConnectionClosed => ErrorCode::ConnectionClosed,
            Error::ConnectionLost { .. } => ErrorCode::ConnectionLost,
            Error::InvalidUrl { .. } => ErrorCode::InvalidUrl,

            Error::ProtocolMalformed { .. } => ErrorCode::ProtocolMalformed,
            Error::Json(_) => ErrorCode::ProtocolMalformed,
            Error::HandshakeRejected { .. } => ErrorCode::HandshakeRejected,

            Error::BindFailed { .. } => ErrorCode::BindFailed,
            Error::ContextUnavailable { .. } => ErrorCode::ContextUnavailable,

            Error::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Check if the error is retryable (the session will reconnect)
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionFailed { .. }
                | Error::ConnectionTimeout { .. }
                | Error::ConnectionClosed
                | Error::ConnectionLost { .. }
                | Error::WebSocket(_)
                | Error::Io(_)
        )
    }

    /// Check if the error is fatal (the process should exit)
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::ConfigNotFound { .. }
                | Error::ConfigParse { .. }
                | Error::ConfigValidation { .. }
                | Error::Config(_)
                | Error::InvalidUrl { .. }
                | Error::BindFailed { .. }
                | Error::Internal(_)
        )
    }

    /// Get the exit code for CLI
    pub fn exit_code(&self) -> i32 {
        self.code().exit_code()
    }

    // ─────────────────────────────────────────────────────────────
    // User-Friendly Messages
    // ─────────────────────────────────────────────────────────────

    /// Get a user-friendly suggestion for how to fix this error
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Error::ConfigNotFound { .. } => Some(
                "Run 'collab-coordinator config init' to create a default configuration file."
            ),
            Error::ConfigParse { .. } => Some(
                "Check your configuration file syntax. Run 'collab-coordinator config validate' to see details."
            ),
            Error::ConfigValidation { .. } | Error::Config(_) => Some(
                "Review the configuration file and fix the invalid values."
            ),

            Error::ConnectionFailed { .. } => Some(
                "Check your network connection and verify the coordinator URL is correct."
            ),
            Error::ConnectionTimeout { .. } => Some(
                "The coordination endpoint may be down or unreachable. Check your firewall settings."
            ),
            Error::ConnectionLost { .. } | Error::ConnectionClosed => Some(
                "Connection was interrupted. The session reconnects automatically."
            ),
            Error::InvalidUrl { .. } => Some(
                "The coordinator URL must look like ws://host:port or wss://host:port."
            ),
            Error::HandshakeRejected { .. } => Some(
                "The endpoint refused the session. Check that user_id is set and the URL path is right."
            ),

            Error::BindFailed { .. } => Some(
                "Another process may already use this address. Change [server] bind_addr."
            ),

            _ => None,
        }
    }

    /// Format the error for terminal display with colors
    pub fn format_for_terminal(&self) -> String {
        let code = self.code();
        let suggestion = self.suggestion();

        let mut output = format!(
            "\x1b[31mError [{}]\x1b[0m: {}\n",
            code.as_str(),
            self
        );

        if let Some(hint) = suggestion {
            output.push_str(&format!("\n\x1b[33mHint\x1b[0m: {}\n", hint));
        }

        output
    }

    /// Format the error for logging (no colors)
    pub fn format_for_log(&self) -> String {
        format!("[{}] {}", self.code().as_str(), self)
    }
}

// ─────────────────────────────────────────────────────────────────
// Error Constructors
// ─────────────────────────────────────────────────────────────────

impl Error {
    /// Create a config not found error
    pub fn config_not_found(path: impl Into<PathBuf>) -> Self {
        Error::ConfigNotFound { path: path.into() }
    }

    /// Create a config validation error
    pub fn config_validation(message: impl Into<String>) -> Self {
        Error::ConfigValidation {
            message: message.into(),
            field: None,
        }
    }

    /// Create a config validation error with field name
    pub fn config_field_invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Error::ConfigValidation {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create a connection failed error
    pub fn connection_failed(url: impl Into<String>, message: impl Into<String>) -> Self {
        Error::ConnectionFailed {
            url: url.into(),
            message: message.into(),
        }
    }

    /// Create a malformed protocol message error
    pub fn malformed(message: impl Into<String>) -> Self {
        Error::ProtocolMalformed {
            message: message.into(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
