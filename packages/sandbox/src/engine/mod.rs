// ABOUTME: Container engine trait and the scoped container session built on it
// ABOUTME: Sessions always remove their container, explicitly or from Drop on cancellation

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::types::CacheVolumeConfig;

pub mod docker;
#[cfg(any(test, feature = "test-support"))]
pub mod scripted;

pub use docker::DockerEngine;

/// Exit code reserved for "exceeded wall clock"
pub const TIMEOUT_EXIT_CODE: i64 = 124;

/// Labels applied to every container this crate creates
pub const MANAGED_LABEL: &str = "runbox.managed";
pub const RUN_LABEL: &str = "runbox.run_id";

/// Resource limits applied to execution containers
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceLimits {
    /// Memory limit in megabytes
    pub memory_mb: u64,
    /// CPU cores (can be fractional, e.g., 0.5 for half a core)
    pub cpu_cores: f64,
    /// Maximum number of processes inside the container
    pub pids_limit: i64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_mb: 2048,
            cpu_cores: 2.0,
            pids_limit: 512,
        }
    }
}

/// Host directory bind-mounted into the container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    pub host_path: String,
    pub container_path: String,
    pub readonly: bool,
}

/// Engine-level description of one container
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub working_dir: String,
    pub env: BTreeMap<String, String>,
    pub volumes: Vec<CacheVolumeConfig>,
    pub binds: Vec<BindMount>,
    pub limits: ResourceLimits,
    pub labels: HashMap<String, String>,
}

impl ContainerSpec {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        let name = name.into();
        let mut labels = HashMap::new();
        labels.insert(MANAGED_LABEL.to_string(), "true".to_string());
        labels.insert(RUN_LABEL.to_string(), name.clone());

        Self {
            name,
            image: image.into(),
            working_dir: crate::types::DEFAULT_WORKDIR.to_string(),
            env: BTreeMap::new(),
            volumes: Vec::new(),
            binds: Vec::new(),
            limits: ResourceLimits::default(),
            labels,
        }
    }
}

/// Output of a command run inside a container
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecResult {
    pub exit_code: i64,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// The engine-side deadline fired before the command finished; stdout and
    /// stderr hold whatever was produced until then
    pub timed_out: bool,
}

impl ExecResult {
    pub fn stdout_string(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_string(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Operations the executor needs from a container engine
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Fails with a connection error when the engine is unreachable
    async fn ping(&self) -> Result<()>;

    /// Pull the image if it is not available locally
    async fn ensure_image(&self, image: &str) -> Result<()>;

    /// Create and start a long-lived container; returns its id
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;

    /// Force-remove a container. Already-removed containers are not an error.
    async fn remove_container(&self, container_id: &str) -> Result<()>;

    /// Write one file into `dir` inside the container
    async fn upload_file(
        &self,
        container_id: &str,
        dir: &str,
        file_name: &str,
        contents: &[u8],
    ) -> Result<()>;

    /// Run `command` and collect its output. When `deadline` elapses the
    /// partial output is returned with `timed_out` set.
    async fn exec_command(
        &self,
        container_id: &str,
        command: Vec<String>,
        working_dir: Option<&str>,
        deadline: Option<Duration>,
    ) -> Result<ExecResult>;
}

/// A container owned by exactly one execution.
///
/// Call [`ContainerSession::release`] on every path; if the owning future is
/// dropped first, `Drop` schedules the removal on the current runtime.
pub struct ContainerSession {
    engine: Arc<dyn ContainerEngine>,
    container_id: Option<String>,
}

impl ContainerSession {
    pub async fn acquire(engine: Arc<dyn ContainerEngine>, spec: &ContainerSpec) -> Result<Self> {
        engine.ensure_image(&spec.image).await?;
        let container_id = engine.create_container(spec).await?;
        debug!("Acquired container session {} ({})", spec.name, container_id);

        Ok(Self {
            engine,
            container_id: Some(container_id),
        })
    }

    pub fn id(&self) -> &str {
        self.container_id.as_deref().unwrap_or_default()
    }

    pub fn engine(&self) -> &dyn ContainerEngine {
        self.engine.as_ref()
    }

    pub async fn release(mut self) -> Result<()> {
        match self.container_id.take() {
            Some(id) => {
                let result = self.engine.remove_container(&id).await;
                if result.is_ok() {
                    debug!("Released container session {}", id);
                }
                result
            }
            None => Ok(()),
        }
    }
}

impl Drop for ContainerSession {
    fn drop(&mut self) {
        let Some(id) = self.container_id.take() else {
            return;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                info!("Container session {} dropped before release, removing", id);
                let engine = self.engine.clone();
                handle.spawn(async move {
                    if let Err(e) = engine.remove_container(&id).await {
                        warn!("Failed to remove abandoned container {}: {}", id, e);
                    }
                });
            }
            Err(_) => {
                warn!(
                    "Container {} leaked: session dropped outside a tokio runtime",
                    id
                );
            }
        }
    }
}

/// Wrap `command` with coreutils `timeout` so overruns exit with 124
pub fn wrap_with_timeout(timeout_secs: u64, command: &[String]) -> Vec<String> {
    let mut argv = Vec::with_capacity(command.len() + 2);
    argv.push("timeout".to_string());
    argv.push(timeout_secs.to_string());
    argv.extend(command.iter().cloned());
    argv
}
