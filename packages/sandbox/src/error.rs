// ABOUTME: Error types for config resolution and sandboxed execution
// ABOUTME: Separates configuration, engine connection, timeout and runtime failures

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for sandbox operations
#[derive(Error, Debug)]
pub enum SandboxError {
    /// Derived or proposed container config is missing required fields,
    /// or no config can be derived for the language
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Container engine is unreachable
    #[error("Container engine connection error: {0}")]
    Connection(String),

    /// Engine accepted the connection but rejected or failed the operation
    #[error("Container engine error: {0}")]
    Engine(String),

    /// Wall clock exceeded
    #[error("Execution timed out after {seconds} seconds")]
    Timeout { seconds: u64 },

    /// Setup command or run command exited non-zero
    #[error("Command exited with code {exit_code}: {stderr}")]
    Runtime { exit_code: i64, stderr: String },

    /// Config proposer (LLM collaborator) failed to produce a completion
    #[error("Config proposer error: {0}")]
    Proposer(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Type alias for Results that return SandboxError
pub type Result<T> = std::result::Result<T, SandboxError>;

/// Failure classification surfaced on `ExecutionResult`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    Configuration,
    Connection,
    Timeout,
    Runtime,
}

impl SandboxError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SandboxError::Configuration(_)
            | SandboxError::Proposer(_)
            | SandboxError::Json(_) => ErrorKind::Configuration,
            SandboxError::Connection(_) => ErrorKind::Connection,
            SandboxError::Timeout { .. } => ErrorKind::Timeout,
            SandboxError::Engine(_) | SandboxError::Runtime { .. } | SandboxError::Io(_) => {
                ErrorKind::Runtime
            }
        }
    }
}

impl From<bollard::errors::Error> for SandboxError {
    fn from(err: bollard::errors::Error) -> Self {
        use bollard::errors::Error as BollardError;

        match err {
            BollardError::IOError { .. }
            | BollardError::HyperResponseError { .. }
            | BollardError::RequestTimeoutError => SandboxError::Connection(err.to_string()),
            _ => SandboxError::Engine(err.to_string()),
        }
    }
}
