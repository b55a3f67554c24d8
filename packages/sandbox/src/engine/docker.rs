// ABOUTME: Docker implementation of the container engine
// ABOUTME: Uses bollard to create keep-alive containers, upload sources and exec commands

use async_trait::async_trait;
use bollard::{
    container::{
        Config, CreateContainerOptions, LogOutput, RemoveContainerOptions, StartContainerOptions,
        UploadToContainerOptions,
    },
    errors::Error as BollardError,
    exec::{CreateExecOptions, StartExecResults},
    image::CreateImageOptions,
    models::{HostConfig, Mount, MountTypeEnum},
    Docker,
};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use super::{ContainerEngine, ContainerSpec, ExecResult, TIMEOUT_EXIT_CODE};
use crate::error::{Result, SandboxError};

/// Keeps the container alive between execs; works on busybox and coreutils
const KEEP_ALIVE: [&str; 3] = ["tail", "-f", "/dev/null"];

/// How long a verified image is trusted before it is inspected again
const IMAGE_CACHE_TTL_SECS: i64 = 600;

pub struct DockerEngine {
    client: Docker,
    /// When each image was last seen locally; fresh entries skip the inspect
    image_cache: Arc<RwLock<HashMap<String, chrono::DateTime<chrono::Utc>>>>,
    pull_timeout: Duration,
}

impl DockerEngine {
    /// Connect with the platform defaults (DOCKER_HOST or the local socket).
    /// The connection is lazy; reachability is checked by `ping`.
    pub fn connect() -> Result<Self> {
        Self::connect_with_pull_timeout(Duration::from_secs(600))
    }

    pub fn connect_with_pull_timeout(pull_timeout: Duration) -> Result<Self> {
        let client = Docker::connect_with_defaults()
            .map_err(|e| SandboxError::Connection(e.to_string()))?;
        Ok(Self::with_client(client, pull_timeout))
    }

    pub fn with_client(client: Docker, pull_timeout: Duration) -> Self {
        Self {
            client,
            image_cache: Arc::new(RwLock::new(HashMap::new())),
            pull_timeout,
        }
    }

    fn to_bollard_config(spec: &ContainerSpec) -> Config<String> {
        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let mounts: Vec<Mount> = spec
            .volumes
            .iter()
            .map(|v| Mount {
                target: Some(v.mount_path.clone()),
                source: Some(v.name.clone()),
                typ: Some(MountTypeEnum::VOLUME),
                read_only: Some(false),
                ..Default::default()
            })
            .collect();

        let binds: Vec<String> = spec
            .binds
            .iter()
            .map(|b| {
                format!(
                    "{}:{}:{}",
                    b.host_path,
                    b.container_path,
                    if b.readonly { "ro" } else { "rw" }
                )
            })
            .collect();

        let host_config = HostConfig {
            mounts: if mounts.is_empty() { None } else { Some(mounts) },
            binds: if binds.is_empty() { None } else { Some(binds) },
            memory: Some((spec.limits.memory_mb * 1024 * 1024) as i64),
            nano_cpus: Some((spec.limits.cpu_cores * 1_000_000_000.0) as i64),
            pids_limit: Some(spec.limits.pids_limit),
            privileged: Some(false),
            security_opt: Some(vec!["no-new-privileges".to_string()]),
            ..Default::default()
        };

        Config {
            image: Some(spec.image.clone()),
            entrypoint: Some(KEEP_ALIVE.iter().map(|s| s.to_string()).collect()),
            env: Some(env),
            working_dir: Some(spec.working_dir.clone()),
            labels: Some(spec.labels.clone()),
            host_config: Some(host_config),
            attach_stdout: Some(false),
            attach_stderr: Some(false),
            tty: Some(false),
            ..Default::default()
        }
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        match self.client.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        info!("Pulling image: {} (timeout: {:?})", image, self.pull_timeout);

        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let stream = self.client.create_image(Some(options), None, None);

        let result = tokio::time::timeout(self.pull_timeout, async {
            let mut stream = stream;
            let mut last_status = String::new();

            while let Some(result) = stream.next().await {
                let info = result?;
                if let Some(error) = info.error {
                    return Err(SandboxError::Engine(format!(
                        "Failed to pull image {}: {}",
                        image, error
                    )));
                }
                if let Some(status) = info.status {
                    if status != last_status {
                        debug!("Pull status: {}", status);
                        last_status = status;
                    }
                }
            }
            Ok(())
        })
        .await;

        match result {
            Ok(Ok(())) => {
                info!("Successfully pulled image: {}", image);
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(SandboxError::Engine(format!(
                "Timeout pulling image {} after {:?}",
                image, self.pull_timeout
            ))),
        }
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn ping(&self) -> Result<()> {
        self.client.ping().await.map(|_| ()).map_err(|e| {
            warn!("Docker not available: {}", e);
            SandboxError::Connection(format!("Docker daemon unreachable: {}", e))
        })
    }

    async fn ensure_image(&self, image: &str) -> Result<()> {
        let now = chrono::Utc::now();
        if let Some(verified_at) = self.image_cache.read().await.get(image) {
            if is_fresh(*verified_at, now) {
                debug!("Image {} verified recently, skipping inspect", image);
                return Ok(());
            }
        }

        if !self.image_exists(image).await? {
            self.pull_image(image).await?;
        }
        self.image_cache.write().await.insert(image.to_string(), now);
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        info!("Creating container {} from {}", spec.name, spec.image);

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };
        let container = self
            .client
            .create_container(Some(options), Self::to_bollard_config(spec))
            .await
            .map_err(|e| {
                error!("Failed to create container {}: {}", spec.name, e);
                SandboxError::from(e)
            })?;

        if let Err(e) = self
            .client
            .start_container(&container.id, None::<StartContainerOptions<String>>)
            .await
        {
            error!("Failed to start container {}: {}", container.id, e);
            if let Err(remove_err) = self.remove_container(&container.id).await {
                warn!(
                    "Failed to remove unstarted container {}: {}",
                    container.id, remove_err
                );
            }
            return Err(e.into());
        }

        debug!("Started container {}", container.id);
        Ok(container.id)
    }

    async fn remove_container(&self, container_id: &str) -> Result<()> {
        debug!("Removing container {}", container_id);

        let options = RemoveContainerOptions {
            force: true,
            v: true, // Anonymous volumes only; named cache volumes survive
            ..Default::default()
        };

        match self
            .client
            .remove_container(container_id, Some(options))
            .await
        {
            Ok(_) => Ok(()),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                debug!("Container {} already removed", container_id);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn upload_file(
        &self,
        container_id: &str,
        dir: &str,
        file_name: &str,
        contents: &[u8],
    ) -> Result<()> {
        debug!("Uploading {} ({} bytes) to {}:{}", file_name, contents.len(), container_id, dir);

        let tar_data = single_file_tar(file_name, contents)?;
        let options = UploadToContainerOptions {
            path: dir.to_string(),
            ..Default::default()
        };

        self.client
            .upload_to_container(container_id, Some(options), tar_data.into())
            .await?;
        Ok(())
    }

    async fn exec_command(
        &self,
        container_id: &str,
        command: Vec<String>,
        working_dir: Option<&str>,
        deadline: Option<Duration>,
    ) -> Result<ExecResult> {
        debug!("Executing in container {}: {:?}", container_id, command);

        let exec_config = CreateExecOptions {
            cmd: Some(command),
            working_dir: working_dir.map(str::to_string),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let exec = self.client.create_exec(container_id, exec_config).await?;
        let start_result = self.client.start_exec(&exec.id, None).await?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        let mut output = match start_result {
            StartExecResults::Attached { output, .. } => output,
            StartExecResults::Detached => {
                return Err(SandboxError::Engine(
                    "Exec was detached unexpectedly".to_string(),
                ))
            }
        };

        let collect = async {
            while let Some(msg) = output.next().await {
                match msg? {
                    LogOutput::StdOut { message } | LogOutput::Console { message } => {
                        stdout.extend_from_slice(&message)
                    }
                    LogOutput::StdErr { message } => stderr.extend_from_slice(&message),
                    _ => {}
                }
            }
            Ok::<(), SandboxError>(())
        };

        let finished = match deadline {
            Some(deadline) => tokio::time::timeout(deadline, collect).await.ok(),
            None => Some(collect.await),
        };

        match finished {
            Some(result) => result?,
            None => {
                warn!(
                    "Exec in container {} exceeded engine deadline {:?}",
                    container_id, deadline
                );
                return Ok(ExecResult {
                    exit_code: TIMEOUT_EXIT_CODE,
                    stdout,
                    stderr,
                    timed_out: true,
                });
            }
        }

        let inspect = self.client.inspect_exec(&exec.id).await?;
        let exit_code = inspect.exit_code.unwrap_or_else(|| {
            warn!("Exec {} finished without an exit code", exec.id);
            -1
        });

        Ok(ExecResult {
            exit_code,
            stdout,
            stderr,
            timed_out: false,
        })
    }
}

/// In-memory tar archive holding a single regular file
fn single_file_tar(file_name: &str, contents: &[u8]) -> Result<Vec<u8>> {
    let mut header = tar::Header::new_gnu();
    header.set_path(file_name)?;
    header.set_size(contents.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(chrono::Utc::now().timestamp().max(0) as u64);
    header.set_cksum();

    let mut archive = tar::Builder::new(Vec::new());
    archive.append(&header, contents)?;
    Ok(archive.into_inner()?)
}

fn is_fresh(verified_at: chrono::DateTime<chrono::Utc>, now: chrono::DateTime<chrono::Utc>) -> bool {
    now.signed_duration_since(verified_at) < chrono::Duration::seconds(IMAGE_CACHE_TTL_SECS)
}
