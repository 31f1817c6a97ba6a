//! Error types for the connector.
//!
//! This module defines the caller-visible error kinds, the script error value
//! carrying the engine's stack frames, and the main error type used
//! throughout the crate.

use serde::{Deserialize, Serialize};

/// Error codes for categorizing script failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// The engine returned the empty sentinel from `create`
    CreationFailure,
    /// The context was created but the script failed to load
    CompileFailure,
    /// `invoke` returned the fatal sentinel; the context was discarded
    FatalRuntimeError,
    /// The script raised an exception; the context is still valid
    RecoverableScriptError,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCode::CreationFailure => write!(f, "CREATION_FAILURE"),
            ErrorCode::CompileFailure => write!(f, "COMPILE_FAILURE"),
            ErrorCode::FatalRuntimeError => write!(f, "FATAL_RUNTIME_ERROR"),
            ErrorCode::RecoverableScriptError => write!(f, "RECOVERABLE_SCRIPT_ERROR"),
        }
    }
}

/// Failure reported for one script call, with the engine's frames verbatim
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptError {
    /// Error code
    pub code: ErrorCode,

    /// Human-readable message
    pub message: String,

    /// Engine stack frames, in the order the engine reported them
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub frames: Vec<String>,

    /// `locator/entry_point` of the script that failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,

    /// Status returned by `invoke`, if the failure came from an invocation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<i32>,
}

impl ScriptError {
    /// Create a new script error
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            frames: Vec::new(),
            identity: None,
            status: None,
        }
    }

    /// Create a creation failure error
    pub fn creation_failure(identity: impl std::fmt::Display) -> Self {
        Self::new(
            ErrorCode::CreationFailure,
            format!("Failed to create script runtime for {}", identity),
        )
        .with_identity(identity.to_string())
    }

    /// Create a compile failure error
    pub fn compile_failure(identity: impl std::fmt::Display, frames: Vec<String>) -> Self {
        Self::new(
            ErrorCode::CompileFailure,
            format!("Error while loading {}", identity),
        )
        .with_identity(identity.to_string())
        .with_frames(frames)
    }

    /// Create a fatal runtime error
    pub fn fatal(identity: impl std::fmt::Display, status: i32, frames: Vec<String>) -> Self {
        Self::new(
            ErrorCode::FatalRuntimeError,
            format!("Script runtime for {} failed with status {}", identity, status),
        )
        .with_identity(identity.to_string())
        .with_status(status)
        .with_frames(frames)
    }

    /// Create a recoverable script error
    pub fn recoverable(identity: impl std::fmt::Display, status: i32, frames: Vec<String>) -> Self {
        Self::new(
            ErrorCode::RecoverableScriptError,
            format!("Script {} raised an error (status {})", identity, status),
        )
        .with_identity(identity.to_string())
        .with_status(status)
        .with_frames(frames)
    }

    /// Add stack frames
    pub fn with_frames(mut self, frames: Vec<String>) -> Self {
        self.frames = frames;
        self
    }

    /// Add the script identity
    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    /// Add the engine status
    pub fn with_status(mut self, status: i32) -> Self {
        self.status = Some(status);
        self
    }

    /// Whether the execution context was discarded by this failure
    pub fn is_fatal(&self) -> bool {
        self.code == ErrorCode::FatalRuntimeError
    }

    /// Whether the context that produced this error is still cached, so an
    /// immediate retry runs against the same engine state
    pub fn handle_retained(&self) -> bool {
        self.code == ErrorCode::RecoverableScriptError
    }

    /// The frames joined in order, one per line
    pub fn trace(&self) -> String {
        self.frames.join("\n")
    }
}

impl std::fmt::Display for ScriptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        if !self.frames.is_empty() {
            write!(f, "\n{}", self.trace())?;
        }
        Ok(())
    }
}

impl std::error::Error for ScriptError {}

/// Main error type for the connector
#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    /// Script failure (creation, load, runtime)
    #[error("{0}")]
    Script(#[from] ScriptError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The handle registry has been shut down
    #[error("Shutdown: {0}")]
    Shutdown(String),

    /// General error
    #[error("{0}")]
    General(String),
}

impl ConnectorError {
    /// The script error inside, if this is one
    pub fn as_script_error(&self) -> Option<&ScriptError> {
        match self {
            ConnectorError::Script(e) => Some(e),
            _ => None,
        }
    }

    /// The error code, if this is a script error
    pub fn code(&self) -> Option<ErrorCode> {
        self.as_script_error().map(|e| e.code)
    }

    /// Whether the failing context was discarded
    pub fn is_fatal(&self) -> bool {
        self.as_script_error().map_or(false, ScriptError::is_fatal)
    }
}

impl From<String> for ConnectorError {
    fn from(s: String) -> Self {
        ConnectorError::General(s)
    }
}

impl From<&str> for ConnectorError {
    fn from(s: &str) -> Self {
        ConnectorError::General(s.to_string())
    }
}

/// Result type alias for connector operations
pub type Result<T> = std::result::Result<T, ConnectorError>;

/// Status codes at the engine boundary
pub mod status {
    /// Success with no values returned
    pub const OK: i32 = 0;
    /// The conventional fatal sentinel
    pub const FATAL: i32 = -1;
}
