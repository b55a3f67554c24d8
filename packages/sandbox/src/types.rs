// ABOUTME: Core type definitions for config resolution and sandboxed execution
// ABOUTME: Defines container configs, execution requests/results and cache statistics

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::error::{ErrorKind, SandboxError};

pub const DEFAULT_WORKDIR: &str = "/app";
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

fn default_workdir() -> String {
    DEFAULT_WORKDIR.to_string()
}

fn default_shell() -> Vec<String> {
    vec!["sh".to_string(), "-c".to_string()]
}

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

/// Named volume mounted into every container that declares it, so package
/// manager downloads survive between runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheVolumeConfig {
    pub name: String,
    pub mount_path: String,
}

impl CacheVolumeConfig {
    pub fn new(name: impl Into<String>, mount_path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mount_path: mount_path.into(),
        }
    }
}

/// Everything needed to build and run one container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerConfig {
    pub base_image: String,
    #[serde(default = "default_workdir")]
    pub workdir: String,
    #[serde(default)]
    pub cache_volumes: Vec<CacheVolumeConfig>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    /// Run in order through `shell`; the first failure stops the sequence
    #[serde(default)]
    pub setup_commands: Vec<String>,
    /// argv, never passed through a shell
    pub run_command: Vec<String>,
    /// Interpreter argv used for setup commands and project commands
    #[serde(default = "default_shell")]
    pub shell: Vec<String>,
}

impl ContainerConfig {
    pub fn new(base_image: impl Into<String>, run_command: Vec<String>) -> Self {
        Self {
            base_image: base_image.into(),
            workdir: default_workdir(),
            cache_volumes: Vec::new(),
            environment: BTreeMap::new(),
            setup_commands: Vec::new(),
            run_command,
            shell: default_shell(),
        }
    }

    /// Reject configs that cannot be executed
    pub fn validate(&self) -> Result<(), SandboxError> {
        if self.base_image.trim().is_empty() {
            return Err(SandboxError::Configuration(
                "baseImage is missing or empty".to_string(),
            ));
        }
        if self.run_command.is_empty() || self.run_command.iter().all(|a| a.trim().is_empty()) {
            return Err(SandboxError::Configuration(
                "runCommand is missing or empty".to_string(),
            ));
        }
        if !self.workdir.starts_with('/') {
            return Err(SandboxError::Configuration(format!(
                "workdir must be an absolute path, got '{}'",
                self.workdir
            )));
        }
        if self.shell.is_empty() {
            return Err(SandboxError::Configuration(
                "shell must name an interpreter".to_string(),
            ));
        }
        for volume in &self.cache_volumes {
            if volume.name.trim().is_empty() || !volume.mount_path.starts_with('/') {
                return Err(SandboxError::Configuration(format!(
                    "invalid cache volume '{}' -> '{}'",
                    volume.name, volume.mount_path
                )));
            }
        }
        Ok(())
    }

    /// argv for running `command` through this config's interpreter
    pub fn shell_command(&self, command: &str) -> Vec<String> {
        let mut argv = self.shell.clone();
        argv.push(command.to_string());
        argv
    }
}

/// Loosely-typed config as returned by a proposer. Every field is optional so
/// that missing fields surface as configuration errors instead of parse panics.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposedConfig {
    pub base_image: Option<String>,
    pub workdir: Option<String>,
    #[serde(default)]
    pub cache_volumes: Vec<CacheVolumeConfig>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub setup_commands: Vec<String>,
    pub run_command: Option<Vec<String>>,
    pub shell: Option<Vec<String>>,
}

impl TryFrom<ProposedConfig> for ContainerConfig {
    type Error = SandboxError;

    fn try_from(proposed: ProposedConfig) -> Result<Self, Self::Error> {
        let base_image = proposed
            .base_image
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| SandboxError::Configuration("baseImage is missing".to_string()))?;
        let run_command = proposed
            .run_command
            .filter(|argv| !argv.is_empty())
            .ok_or_else(|| SandboxError::Configuration("runCommand is missing".to_string()))?;

        let config = ContainerConfig {
            base_image,
            workdir: proposed.workdir.unwrap_or_else(default_workdir),
            cache_volumes: proposed.cache_volumes,
            environment: proposed.environment,
            setup_commands: proposed.setup_commands,
            run_command,
            shell: proposed.shell.unwrap_or_else(default_shell),
        };
        config.validate()?;
        Ok(config)
    }
}

/// Request to execute a code snippet
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRequest {
    pub code: String,
    pub language: String,
    /// Wall clock limit in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    /// Correlation tag, echoed back unchanged
    #[serde(default)]
    pub model_name: Option<String>,
    #[serde(default, rename = "useAIConfig")]
    pub use_ai_config: bool,
}

impl ExecutionRequest {
    pub fn new(code: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            language: language.into(),
            timeout: DEFAULT_TIMEOUT_SECS,
            model_name: None,
            use_ai_config: false,
        }
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout = seconds;
        self
    }

    pub fn with_model_name(mut self, model_name: impl Into<String>) -> Self {
        self.model_name = Some(model_name.into());
        self
    }

    pub fn with_ai_config(mut self, use_ai_config: bool) -> Self {
        self.use_ai_config = use_ai_config;
        self
    }
}

/// Outcome of one execution. Every failure mode is represented here.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_config: Option<ContainerConfig>,
    pub cached: bool,
    /// Milliseconds since the call started
    pub execution_time: u64,
    /// Raw stderr of the final command, kept separately from `error` for
    /// callers that need both streams
    #[serde(skip)]
    pub stderr: String,
}

impl ExecutionResult {
    pub fn is_timeout(&self) -> bool {
        self.error_kind == Some(ErrorKind::Timeout)
    }
}

/// Snapshot of both cache tiers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub memory_size: usize,
    pub disk_size: usize,
    pub cache_dir: PathBuf,
}
