// ABOUTME: Configuration and environment variable management for Runbox
// ABOUTME: Exposes variable names, parsing helpers and the validated RunnerConfig

pub mod constants;
pub mod env;
pub mod settings;

pub use settings::{default_cache_dir, RunnerConfig};

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Environment variable {var} has unparseable value '{value}'")]
    Unparseable { var: String, value: String },
    #[error("Environment variable {var}={value} is out of range ({min}..={max})")]
    OutOfRange {
        var: String,
        value: String,
        min: String,
        max: String,
    },
}
