// ABOUTME: Error types for requirement detection, experiences and the project-command tool
// ABOUTME: Experience errors carry stable codes so callers can map them to user-facing hints

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExperienceError {
    #[error("EXPERIENCE_NOT_FOUND: experience '{0}' does not exist")]
    NotFound(String),

    #[error("EXPERIENCE_EXISTS: experience '{0}' already exists")]
    Exists(String),

    #[error("EXPERIENCE_RETIRED: experience '{0}' was already committed or discarded")]
    Retired(String),

    #[error("INVALID_EXPERIENCE_ID: '{0}' must be 1-128 characters from [A-Za-z0-9_-]")]
    InvalidId(String),

    #[error("FILESYSTEM_ERROR: {context}: {source}")]
    Filesystem {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl ExperienceError {
    pub fn code(&self) -> &'static str {
        match self {
            ExperienceError::NotFound(_) => "EXPERIENCE_NOT_FOUND",
            ExperienceError::Exists(_) => "EXPERIENCE_EXISTS",
            ExperienceError::Retired(_) => "EXPERIENCE_RETIRED",
            ExperienceError::InvalidId(_) => "INVALID_EXPERIENCE_ID",
            ExperienceError::Filesystem { .. } => "FILESYSTEM_ERROR",
        }
    }

    pub(crate) fn fs(context: impl Into<String>, source: std::io::Error) -> Self {
        ExperienceError::Filesystem {
            context: context.into(),
            source,
        }
    }
}

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("Project path does not exist or is not a directory: {0}")]
    NotADirectory(PathBuf),

    #[error("Invalid manifest {path}: {reason}")]
    InvalidManifest { path: PathBuf, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum ToolError {
    #[error("Unknown agent: {0}")]
    UnknownAgent(String),

    #[error("Project path {0} is outside the allowed roots")]
    PathNotAllowed(PathBuf),

    #[error("Action '{0}' requires a command")]
    MissingCommand(&'static str),

    #[error("Action '{0}' requires an experienceId")]
    MissingExperienceId(&'static str),

    #[error(transparent)]
    Experience(#[from] ExperienceError),

    #[error("Requirement detection failed: {0}")]
    Detector(#[from] DetectorError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ToolError {
    pub fn code(&self) -> &'static str {
        match self {
            ToolError::UnknownAgent(_) => "UNKNOWN_AGENT",
            ToolError::PathNotAllowed(_) => "PATH_NOT_ALLOWED",
            ToolError::MissingCommand(_) => "MISSING_COMMAND",
            ToolError::MissingExperienceId(_) => "MISSING_EXPERIENCE_ID",
            ToolError::Experience(e) => e.code(),
            ToolError::Detector(_) => "DETECTION_FAILED",
            ToolError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

pub type ExperienceResult<T> = std::result::Result<T, ExperienceError>;
pub type DetectorResult<T> = std::result::Result<T, DetectorError>;
