// ABOUTME: Executor running code snippets and project commands in ephemeral containers
// ABOUTME: Resolves configs, owns one container session per run and classifies every outcome

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use runbox_config::constants::MAX_TIMEOUT_SECS;
use runbox_config::RunnerConfig;

use crate::ai::AnthropicProposer;
use crate::engine::{
    wrap_with_timeout, BindMount, ContainerEngine, ContainerSession, ContainerSpec, DockerEngine,
    ExecResult, ResourceLimits, TIMEOUT_EXIT_CODE,
};
use crate::error::{ErrorKind, Result, SandboxError};
use crate::languages;
use crate::resolver::ConfigResolver;
use crate::types::{CacheStats, ContainerConfig, ExecutionRequest, ExecutionResult};

const DEFAULT_TIMEOUT_GRACE: Duration = Duration::from_secs(5);
const DEFAULT_SETUP_TIMEOUT: Duration = Duration::from_secs(600);

/// Run a shell command inside a project directory
#[derive(Debug, Clone)]
pub struct ProjectRunRequest {
    /// Prepared config; its `runCommand` is replaced by `command`
    pub config: ContainerConfig,
    /// Host directory bind-mounted at the config's workdir
    pub host_dir: PathBuf,
    pub command: String,
    /// Wall clock limit in seconds
    pub timeout: u64,
    /// Extra variables (typically secrets). Added to the container only,
    /// never echoed back in the result.
    pub environment: BTreeMap<String, String>,
    pub model_name: Option<String>,
}

struct Upload<'a> {
    file_name: String,
    contents: &'a [u8],
}

struct RunPlan<'a> {
    config: &'a ContainerConfig,
    spec: ContainerSpec,
    upload: Option<Upload<'a>>,
    timeout_secs: u64,
}

enum RunOutcome {
    Finished { result: ExecResult, elapsed: Duration },
    SetupFailed { command: String, result: ExecResult },
    SetupTimedOut {
        command: String,
        result: ExecResult,
        seconds: u64,
    },
}

pub struct Executor {
    engine: Arc<dyn ContainerEngine>,
    resolver: Arc<ConfigResolver>,
    timeout_grace: Duration,
    setup_timeout: Duration,
    limits: ResourceLimits,
}

impl Executor {
    pub fn new(engine: Arc<dyn ContainerEngine>, resolver: Arc<ConfigResolver>) -> Self {
        Self {
            engine,
            resolver,
            timeout_grace: DEFAULT_TIMEOUT_GRACE,
            setup_timeout: DEFAULT_SETUP_TIMEOUT,
            limits: ResourceLimits::default(),
        }
    }

    /// Docker-backed executor. A proposer is attached only when an Anthropic
    /// API key is configured.
    pub fn from_config(config: &RunnerConfig) -> Result<Self> {
        let engine = DockerEngine::connect_with_pull_timeout(config.image_pull_timeout)?;

        let mut resolver = ConfigResolver::new(&config.cache_dir);
        if config.anthropic_api_key.is_some() {
            resolver = resolver.with_proposer(Arc::new(AnthropicProposer::from_config(config)?));
        } else {
            info!("ANTHROPIC_API_KEY not set, AI-assisted configuration disabled");
        }

        Ok(Self::new(Arc::new(engine), Arc::new(resolver)).with_timeout_grace(config.timeout_grace))
    }

    pub fn with_timeout_grace(mut self, grace: Duration) -> Self {
        self.timeout_grace = grace;
        self
    }

    pub fn with_setup_timeout(mut self, timeout: Duration) -> Self {
        self.setup_timeout = timeout;
        self
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn resolver(&self) -> &ConfigResolver {
        &self.resolver
    }

    pub async fn cache_stats(&self) -> CacheStats {
        self.resolver.cache_stats().await
    }

    pub async fn clear_cache(&self) -> Result<()> {
        self.resolver.clear_cache().await
    }

    pub fn supported_languages(&self) -> Vec<&'static str> {
        self.resolver.supported_languages()
    }

    /// Execute a snippet. Never fails: every failure is reported in the result.
    pub async fn run_code(&self, request: ExecutionRequest) -> ExecutionResult {
        let report = Report::start(request.model_name.clone());
        info!(
            "Running {} snippet ({} bytes, timeout {}s)",
            request.language,
            request.code.len(),
            request.timeout
        );

        if let Err(e) = check_timeout(request.timeout) {
            return report.failed(e);
        }

        let resolved = match self
            .resolver
            .resolve(&request.code, &request.language, request.use_ai_config)
            .await
        {
            Ok(resolved) => resolved,
            Err(e) => {
                warn!("No container config for {}: {}", request.language, e);
                return report.failed(e);
            }
        };

        let plan = RunPlan {
            config: &resolved.config,
            spec: self.container_spec(&resolved.config),
            upload: Some(Upload {
                file_name: source_file_for(&resolved.config, &request.language),
                contents: request.code.as_bytes(),
            }),
            timeout_secs: request.timeout,
        };

        let outcome = self.execute(plan).await;
        report
            .with_config(resolved.config.clone(), resolved.cached)
            .finish(outcome, request.timeout)
    }

    /// Run `request.command` through the config's shell with the project
    /// directory mounted at the workdir
    pub async fn run_project_command(&self, request: ProjectRunRequest) -> ExecutionResult {
        let report = Report::start(request.model_name.clone());
        info!(
            "Running project command in {} (timeout {}s)",
            request.host_dir.display(),
            request.timeout
        );

        if let Err(e) = check_timeout(request.timeout) {
            return report.failed(e);
        }
        if request.command.trim().is_empty() {
            return report.failed(SandboxError::Configuration(
                "command must not be empty".to_string(),
            ));
        }

        let mut config = request.config;
        config.run_command = config.shell_command(&request.command);
        if let Err(e) = config.validate() {
            return report.failed(e);
        }

        let host_dir = match tokio::fs::canonicalize(&request.host_dir).await {
            Ok(dir) => dir,
            Err(e) => {
                return report.with_config(config, false).failed(SandboxError::Configuration(
                    format!(
                        "project directory {} is not accessible: {}",
                        request.host_dir.display(),
                        e
                    ),
                ))
            }
        };

        let mut spec = self.container_spec(&config);
        spec.env.extend(request.environment);
        spec.binds.push(BindMount {
            host_path: host_dir.to_string_lossy().into_owned(),
            container_path: config.workdir.clone(),
            readonly: false,
        });

        let plan = RunPlan {
            config: &config,
            spec,
            upload: None,
            timeout_secs: request.timeout,
        };

        let outcome = self.execute(plan).await;
        report
            .with_config(config.clone(), false)
            .finish(outcome, request.timeout)
    }

    fn container_spec(&self, config: &ContainerConfig) -> ContainerSpec {
        let name = format!("runbox-{}", uuid::Uuid::new_v4().simple());
        let mut spec = ContainerSpec::new(name, config.base_image.clone());
        spec.working_dir = config.workdir.clone();
        spec.env = config.environment.clone();
        spec.volumes = config.cache_volumes.clone();
        spec.limits = self.limits.clone();
        spec
    }

    async fn execute(&self, plan: RunPlan<'_>) -> Result<RunOutcome> {
        self.engine.ping().await?;

        let session = ContainerSession::acquire(self.engine.clone(), &plan.spec).await?;
        let outcome = self.run_in_session(&session, &plan).await;

        if let Err(e) = session.release().await {
            warn!("Failed to release container {}: {}", plan.spec.name, e);
        }
        outcome
    }

    async fn run_in_session(
        &self,
        session: &ContainerSession,
        plan: &RunPlan<'_>,
    ) -> Result<RunOutcome> {
        let engine = session.engine();
        let workdir = plan.config.workdir.as_str();

        if let Some(upload) = &plan.upload {
            engine
                .upload_file(session.id(), workdir, &upload.file_name, upload.contents)
                .await?;
        }

        for command in &plan.config.setup_commands {
            debug!("Setup: {}", command);
            let result = engine
                .exec_command(
                    session.id(),
                    plan.config.shell_command(command),
                    Some(workdir),
                    Some(self.setup_timeout),
                )
                .await?;

            if result.timed_out {
                warn!("Setup command timed out: {}", command);
                return Ok(RunOutcome::SetupTimedOut {
                    command: command.clone(),
                    result,
                    seconds: self.setup_timeout.as_secs(),
                });
            }
            if result.exit_code != 0 {
                warn!(
                    "Setup command failed with exit code {}: {}",
                    result.exit_code, command
                );
                return Ok(RunOutcome::SetupFailed {
                    command: command.clone(),
                    result,
                });
            }
        }

        let argv = wrap_with_timeout(plan.timeout_secs, &plan.config.run_command);
        let deadline = Duration::from_secs(plan.timeout_secs).saturating_add(self.timeout_grace);
        let started = Instant::now();
        let result = engine
            .exec_command(session.id(), argv, Some(workdir), Some(deadline))
            .await?;

        Ok(RunOutcome::Finished {
            result,
            elapsed: started.elapsed(),
        })
    }
}

/// Timeouts must lie in `1..=MAX_TIMEOUT_SECS`
fn check_timeout(seconds: u64) -> Result<()> {
    if seconds == 0 || seconds > MAX_TIMEOUT_SECS {
        return Err(SandboxError::Configuration(format!(
            "timeout must be between 1 and {} seconds, got {}",
            MAX_TIMEOUT_SECS, seconds
        )));
    }
    Ok(())
}

/// Classify a finished run command. `None` means success.
///
/// 137/143 (SIGKILL/SIGTERM) count as timeouts only once the wall clock has
/// passed the limit; before that they are ordinary crashes (e.g. OOM kills).
pub fn classify_exit(
    exit_code: i64,
    engine_timed_out: bool,
    elapsed: Duration,
    timeout: Duration,
) -> Option<ErrorKind> {
    if engine_timed_out || exit_code == TIMEOUT_EXIT_CODE {
        return Some(ErrorKind::Timeout);
    }
    match exit_code {
        0 => None,
        137 | 143 if elapsed >= timeout => Some(ErrorKind::Timeout),
        _ => Some(ErrorKind::Runtime),
    }
}

/// Source file name for the snippet: the registry extension when the
/// language is known, else whatever `main.*` the run command refers to
fn source_file_for(config: &ContainerConfig, language: &str) -> String {
    if let Some(extension) = languages::extension_for(language) {
        return languages::source_file_name(extension);
    }

    config
        .run_command
        .iter()
        .flat_map(|arg| arg.split_whitespace())
        .map(|token| token.trim_end_matches(|c: char| !c.is_alphanumeric()))
        .find(|token| token.starts_with("main.") && token.len() > "main.".len())
        .map(str::to_string)
        .unwrap_or_else(|| languages::source_file_name(&languages::normalize(language)))
}

fn non_empty(text: &str) -> Option<String> {
    let trimmed = text.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Accumulates the fields every result carries
struct Report {
    started: Instant,
    model_name: Option<String>,
    container_config: Option<ContainerConfig>,
    cached: bool,
}

impl Report {
    fn start(model_name: Option<String>) -> Self {
        Self {
            started: Instant::now(),
            model_name,
            container_config: None,
            cached: false,
        }
    }

    fn with_config(mut self, config: ContainerConfig, cached: bool) -> Self {
        self.container_config = Some(config);
        self.cached = cached;
        self
    }

    fn result(self, success: bool) -> ExecutionResult {
        ExecutionResult {
            success,
            output: None,
            error: None,
            error_kind: None,
            exit_code: None,
            model_name: self.model_name,
            container_config: self.container_config,
            cached: self.cached,
            execution_time: self.started.elapsed().as_millis() as u64,
            stderr: String::new(),
        }
    }

    fn failed(self, err: SandboxError) -> ExecutionResult {
        let kind = err.kind();
        let exit_code = match &err {
            SandboxError::Timeout { .. } => Some(TIMEOUT_EXIT_CODE),
            SandboxError::Runtime { exit_code, .. } => Some(*exit_code),
            _ => None,
        };

        let mut result = self.result(false);
        result.error = Some(err.to_string());
        result.error_kind = Some(kind);
        result.exit_code = exit_code;
        result
    }

    fn finish(self, outcome: Result<RunOutcome>, timeout_secs: u64) -> ExecutionResult {
        let (result, elapsed) = match outcome {
            Err(e) => {
                warn!("Execution failed: {}", e);
                return self.failed(e);
            }
            Ok(RunOutcome::SetupFailed { command, result }) => {
                let stderr = result.stderr_string();
                let mut report = self.result(false);
                report.error = Some(format!(
                    "Setup command `{}` failed with exit code {}: {}",
                    command,
                    result.exit_code,
                    stderr.trim()
                ));
                report.error_kind = Some(ErrorKind::Runtime);
                report.exit_code = Some(result.exit_code);
                report.output = non_empty(&result.stdout_string());
                report.stderr = stderr;
                return report;
            }
            Ok(RunOutcome::SetupTimedOut {
                command,
                result,
                seconds,
            }) => {
                let stderr = result.stderr_string();
                let mut report = self.result(false);
                let mut message = format!(
                    "Setup command `{}` failed: {}",
                    command,
                    SandboxError::Timeout { seconds }
                );
                if let Some(stderr) = non_empty(&stderr) {
                    message.push('\n');
                    message.push_str(&stderr);
                }
                report.error = Some(message);
                report.error_kind = Some(ErrorKind::Timeout);
                report.exit_code = Some(TIMEOUT_EXIT_CODE);
                report.output = non_empty(&result.stdout_string());
                report.stderr = stderr;
                return report;
            }
            Ok(RunOutcome::Finished { result, elapsed }) => (result, elapsed),
        };

        let stdout = result.stdout_string();
        let stderr = result.stderr_string();
        let kind = classify_exit(
            result.exit_code,
            result.timed_out,
            elapsed,
            Duration::from_secs(timeout_secs),
        );

        let mut report = self.result(kind.is_none());
        report.stderr = stderr.clone();
        match kind {
            None => {
                debug!("Execution succeeded in {}ms", report.execution_time);
                report.output = Some(stdout.trim().to_string());
                report.exit_code = Some(0);
            }
            Some(ErrorKind::Timeout) => {
                warn!("Execution timed out after {}s", timeout_secs);
                let mut message = SandboxError::Timeout {
                    seconds: timeout_secs,
                }
                .to_string();
                if let Some(stderr) = non_empty(&stderr) {
                    message.push('\n');
                    message.push_str(&stderr);
                }
                report.output = non_empty(&stdout);
                report.error = Some(message);
                report.error_kind = Some(ErrorKind::Timeout);
                report.exit_code = Some(TIMEOUT_EXIT_CODE);
            }
            Some(kind) => {
                debug!("Execution exited with code {}", result.exit_code);
                report.output = non_empty(&stdout);
                report.error = Some(
                    non_empty(&stderr)
                        .unwrap_or_else(|| format!("Process exited with code {}", result.exit_code)),
                );
                report.error_kind = Some(kind);
                report.exit_code = Some(result.exit_code);
            }
        }
        report
    }
}
