// ABOUTME: Project-command tool letting an agent run commands inside experiences of its project
// ABOUTME: Resolves agents to allowed project roots, detects requirements and injects only named secrets

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

use runbox_config::RunnerConfig;
use runbox_sandbox::{Executor, ProjectRunRequest, SandboxError, DEFAULT_TIMEOUT_SECS, DEFAULT_WORKDIR};

use crate::detector::RequirementsDetector;
use crate::error::{ExperienceError, ToolError};
use crate::experiences::{Experience, ExperienceManager};
use crate::types::ProjectRequirements;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExperienceAction {
    New,
    Continue,
    Commit,
    Discard,
}

impl ExperienceAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExperienceAction::New => "new",
            ExperienceAction::Continue => "continue",
            ExperienceAction::Commit => "commit",
            ExperienceAction::Discard => "discard",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectCommandInput {
    pub agent_id: String,
    pub action: ExperienceAction,
    #[serde(default)]
    pub experience_id: Option<String>,
    #[serde(default)]
    pub command: Option<String>,
    /// Seconds
    #[serde(default)]
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectCommandOutput {
    pub experience_id: String,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timed_out: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detected_requirements: Option<ProjectRequirements>,
}

impl ProjectCommandOutput {
    fn finalized(experience_id: String, status: &str, message: String) -> Self {
        Self {
            experience_id,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: 0,
            success: true,
            status: Some(status.to_string()),
            timed_out: None,
            error: None,
            message: Some(message),
            detected_requirements: None,
        }
    }

    fn from_error(experience_id: String, err: &ToolError) -> Self {
        Self {
            experience_id,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: -1,
            success: false,
            status: None,
            timed_out: None,
            error: Some(err.code().to_string()),
            message: Some(hint(err)),
            detected_requirements: None,
        }
    }
}

fn hint(err: &ToolError) -> String {
    match err {
        ToolError::Experience(ExperienceError::NotFound(id)) => format!(
            "Experience '{}' does not exist. Start one with action 'new'.",
            id
        ),
        ToolError::Experience(ExperienceError::Exists(id)) => format!(
            "Experience '{}' already exists. Use action 'continue' to keep working in it.",
            id
        ),
        ToolError::Experience(ExperienceError::Retired(id)) => format!(
            "Experience '{}' was already committed or discarded. Start a new experience.",
            id
        ),
        other => other.to_string(),
    }
}

/// What an agent id resolves to
#[derive(Clone, Default)]
pub struct AgentProject {
    pub project_path: PathBuf,
    pub allowed_roots: Vec<PathBuf>,
    /// Candidate secret values by variable name
    pub secrets: HashMap<String, String>,
}

impl fmt::Debug for AgentProject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.secrets.keys().collect();
        names.sort();
        f.debug_struct("AgentProject")
            .field("project_path", &self.project_path)
            .field("allowed_roots", &self.allowed_roots)
            .field("secrets", &names)
            .finish()
    }
}

/// Resolves agent ids to their project, allowed roots and secrets
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AgentDirectory: Send + Sync {
    async fn lookup(&self, agent_id: &str) -> Option<AgentProject>;
}

/// In-memory directory for embedders with a fixed set of agents
#[derive(Debug, Default)]
pub struct StaticAgentDirectory {
    agents: HashMap<String, AgentProject>,
}

impl StaticAgentDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_agent(mut self, agent_id: impl Into<String>, project: AgentProject) -> Self {
        self.agents.insert(agent_id.into(), project);
        self
    }
}

#[async_trait]
impl AgentDirectory for StaticAgentDirectory {
    async fn lookup(&self, agent_id: &str) -> Option<AgentProject> {
        self.agents.get(agent_id).cloned()
    }
}

pub struct ProjectCommandTool {
    executor: Arc<Executor>,
    directory: Arc<dyn AgentDirectory>,
    detector: RequirementsDetector,
    default_timeout: u64,
}

impl ProjectCommandTool {
    pub fn new(executor: Arc<Executor>, directory: Arc<dyn AgentDirectory>) -> Self {
        Self {
            executor,
            directory,
            detector: RequirementsDetector::default(),
            default_timeout: DEFAULT_TIMEOUT_SECS,
        }
    }

    /// Docker-backed tool using the runner settings for limits and detection
    pub fn from_config(
        config: &RunnerConfig,
        directory: Arc<dyn AgentDirectory>,
    ) -> Result<Self, SandboxError> {
        let executor = Executor::from_config(config)?;
        Ok(Self::new(Arc::new(executor), directory)
            .with_detector(RequirementsDetector::from_config(config))
            .with_default_timeout(config.default_timeout.as_secs()))
    }

    pub fn with_detector(mut self, detector: RequirementsDetector) -> Self {
        self.detector = detector;
        self
    }

    pub fn with_default_timeout(mut self, seconds: u64) -> Self {
        self.default_timeout = seconds;
        self
    }

    /// Handle one tool call. Errors are reported in the output, never returned.
    pub async fn call(&self, input: ProjectCommandInput) -> ProjectCommandOutput {
        let experience_id = match (&input.experience_id, input.action) {
            (Some(id), _) => id.clone(),
            (None, ExperienceAction::New) => uuid::Uuid::new_v4().to_string(),
            (None, _) => String::new(),
        };
        info!(
            "Project command: agent={} action={} experience={}",
            input.agent_id,
            input.action.as_str(),
            experience_id
        );

        match self.dispatch(&input, experience_id.clone()).await {
            Ok(output) => output,
            Err(e) => {
                warn!("Project command failed: {}", e);
                ProjectCommandOutput::from_error(experience_id, &e)
            }
        }
    }

    async fn dispatch(
        &self,
        input: &ProjectCommandInput,
        id: String,
    ) -> Result<ProjectCommandOutput, ToolError> {
        let action = input.action;
        if id.is_empty() {
            return Err(ToolError::MissingExperienceId(action.as_str()));
        }

        let (project_path, project) = self.resolve_project(&input.agent_id).await?;
        let manager = ExperienceManager::new(project_path.clone())?;

        match action {
            ExperienceAction::New | ExperienceAction::Continue => {
                let command = input
                    .command
                    .as_deref()
                    .map(str::trim)
                    .filter(|c| !c.is_empty())
                    .ok_or(ToolError::MissingCommand(action.as_str()))?
                    .to_string();

                let agent_id = input.agent_id.clone();
                let experience = blocking(move || {
                    if action == ExperienceAction::New {
                        manager.start(&id, &project_path, Some(&agent_id))
                    } else {
                        manager.continue_experience(&id)
                    }
                })
                .await?;

                self.run(experience, command, input, &project).await
            }
            ExperienceAction::Commit => {
                let committed = blocking(move || manager.commit(&id)).await?;
                Ok(ProjectCommandOutput::finalized(
                    committed.experience_id.clone(),
                    "committed",
                    format!(
                        "Experience '{}' was merged into {}",
                        committed.experience_id,
                        committed.source_path.display()
                    ),
                ))
            }
            ExperienceAction::Discard => {
                let discarded = id.clone();
                blocking(move || manager.discard(&id)).await?;
                Ok(ProjectCommandOutput::finalized(
                    discarded.clone(),
                    "discarded",
                    format!("Experience '{}' was discarded", discarded),
                ))
            }
        }
    }

    /// Canonical project path, checked against the agent's allowed roots
    async fn resolve_project(&self, agent_id: &str) -> Result<(PathBuf, AgentProject), ToolError> {
        let project = self
            .directory
            .lookup(agent_id)
            .await
            .ok_or_else(|| ToolError::UnknownAgent(agent_id.to_string()))?;

        let project_path = tokio::fs::canonicalize(&project.project_path)
            .await
            .map_err(|e| {
                ExperienceError::fs(
                    format!(
                        "project path {} is not accessible",
                        project.project_path.display()
                    ),
                    e,
                )
            })?;

        for root in &project.allowed_roots {
            match tokio::fs::canonicalize(root).await {
                Ok(root) if project_path.starts_with(&root) => {
                    return Ok((project_path, project));
                }
                Ok(_) => {}
                Err(e) => debug!("Skipping unusable allowed root {}: {}", root.display(), e),
            }
        }

        Err(ToolError::PathNotAllowed(project_path))
    }

    async fn run(
        &self,
        experience: Experience,
        command: String,
        input: &ProjectCommandInput,
        project: &AgentProject,
    ) -> Result<ProjectCommandOutput, ToolError> {
        let detector = self.detector.clone();
        let path = experience.path.clone();
        let requirements = blocking(move || detector.detect(&path)).await?;

        let environment: BTreeMap<String, String> = requirements
            .env_var_names
            .iter()
            .filter_map(|name| {
                project
                    .secrets
                    .get(name)
                    .map(|value| (name.clone(), value.clone()))
            })
            .collect();
        debug!(
            "Injecting {} of {} referenced variables",
            environment.len(),
            requirements.env_var_names.len()
        );

        let result = self
            .executor
            .run_project_command(ProjectRunRequest {
                config: requirements.to_container_config(DEFAULT_WORKDIR),
                host_dir: experience.path.clone(),
                command,
                timeout: input.timeout.unwrap_or(self.default_timeout),
                environment,
                model_name: Some(input.agent_id.clone()),
            })
            .await;

        let timed_out = result.is_timeout();
        Ok(ProjectCommandOutput {
            experience_id: experience.metadata.experience_id,
            stdout: result.output.unwrap_or_default(),
            stderr: result.stderr,
            exit_code: result.exit_code.unwrap_or(-1),
            success: result.success,
            status: Some("active".to_string()),
            timed_out: Some(timed_out),
            error: if result.success { None } else { result.error },
            message: None,
            detected_requirements: Some(requirements),
        })
    }
}

async fn blocking<T, E, F>(f: F) -> Result<T, ToolError>
where
    F: FnOnce() -> Result<T, E> + Send + 'static,
    T: Send + 'static,
    E: Into<ToolError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ToolError::Internal(format!("blocking task failed: {}", e)))?
        .map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use runbox_sandbox::engine::scripted::{ScriptedEngine, ScriptedExec};
    use runbox_sandbox::ConfigResolver;
    use std::fs;
    use tempfile::TempDir;

    struct Fixture {
        root: TempDir,
        engine: Arc<ScriptedEngine>,
        tool: ProjectCommandTool,
    }

    fn fixture(engine: ScriptedEngine) -> Fixture {
        let root = TempDir::new().unwrap();
        let project = root.path().join("workspace/app");
        fs::create_dir_all(&project).unwrap();
        fs::write(project.join("package.json"), r#"{"name": "app"}"#).unwrap();
        fs::write(
            project.join("index.js"),
            "console.log(process.env.OPENAI_API_KEY)\n",
        )
        .unwrap();

        let mut secrets = HashMap::new();
        secrets.insert("OPENAI_API_KEY".to_string(), "sk-test".to_string());
        secrets.insert("UNRELATED_TOKEN".to_string(), "nope".to_string());

        let directory = StaticAgentDirectory::new().with_agent(
            "agent-1",
            AgentProject {
                project_path: project,
                allowed_roots: vec![root.path().join("workspace")],
                secrets,
            },
        );

        let engine = Arc::new(engine);
        let executor = Executor::new(
            engine.clone(),
            Arc::new(ConfigResolver::new(root.path().join("cache"))),
        );
        let tool = ProjectCommandTool::new(Arc::new(executor), Arc::new(directory));
        Fixture { root, engine, tool }
    }

    fn input(action: ExperienceAction, id: Option<&str>, command: Option<&str>) -> ProjectCommandInput {
        ProjectCommandInput {
            agent_id: "agent-1".to_string(),
            action,
            experience_id: id.map(str::to_string),
            command: command.map(str::to_string),
            timeout: Some(60),
        }
    }

    #[tokio::test]
    async fn test_new_runs_command_with_detected_secrets_only() {
        let f = fixture(ScriptedEngine::new().on_exec("node index.js", ScriptedExec::ok("sk-test\n")));

        let output = f
            .tool
            .call(input(ExperienceAction::New, None, Some("node index.js")))
            .await;

        assert!(output.success, "{:?}", output);
        assert_eq!(output.stdout, "sk-test");
        assert_eq!(output.exit_code, 0);
        assert_eq!(output.status.as_deref(), Some("active"));
        assert_eq!(output.timed_out, Some(false));
        assert!(uuid::Uuid::parse_str(&output.experience_id).is_ok());

        let requirements = output.detected_requirements.unwrap();
        assert_eq!(requirements.env_var_names, vec!["OPENAI_API_KEY"]);

        let spec = &f.engine.created()[0];
        assert_eq!(spec.env.get("OPENAI_API_KEY").map(String::as_str), Some("sk-test"));
        assert!(!spec.env.contains_key("UNRELATED_TOKEN"));
        assert!(spec.binds[0].host_path.contains(&output.experience_id));
    }

    #[tokio::test]
    async fn test_continue_unknown_experience_maps_code() {
        let f = fixture(ScriptedEngine::new());
        let output = f
            .tool
            .call(input(ExperienceAction::Continue, Some("missing"), Some("ls")))
            .await;

        assert!(!output.success);
        assert_eq!(output.error.as_deref(), Some("EXPERIENCE_NOT_FOUND"));
        assert!(output.message.unwrap().contains("action 'new'"));
        assert!(f.engine.created().is_empty());
    }

    #[tokio::test]
    async fn test_new_then_commit_merges_changes() {
        let f = fixture(ScriptedEngine::new());
        let started = f
            .tool
            .call(input(ExperienceAction::New, Some("exp-1"), Some("true")))
            .await;
        assert!(started.success, "{:?}", started);

        let manager = ExperienceManager::new(
            fs::canonicalize(f.root.path().join("workspace/app")).unwrap(),
        )
        .unwrap();
        let experience = manager.get("exp-1").unwrap();
        fs::write(experience.path.join("CHANGELOG.md"), "v2\n").unwrap();

        let committed = f
            .tool
            .call(input(ExperienceAction::Commit, Some("exp-1"), None))
            .await;
        assert!(committed.success);
        assert_eq!(committed.status.as_deref(), Some("committed"));
        assert!(f.root.path().join("workspace/app/CHANGELOG.md").is_file());

        let again = f
            .tool
            .call(input(ExperienceAction::New, Some("exp-1"), Some("true")))
            .await;
        assert_eq!(again.error.as_deref(), Some("EXPERIENCE_RETIRED"));
    }

    #[tokio::test]
    async fn test_discard_reports_status() {
        let f = fixture(ScriptedEngine::new());
        f.tool
            .call(input(ExperienceAction::New, Some("scratch"), Some("true")))
            .await;

        let output = f
            .tool
            .call(input(ExperienceAction::Discard, Some("scratch"), None))
            .await;
        assert!(output.success);
        assert_eq!(output.status.as_deref(), Some("discarded"));
    }

    #[tokio::test]
    async fn test_missing_command_and_id() {
        let f = fixture(ScriptedEngine::new());

        let output = f.tool.call(input(ExperienceAction::New, None, None)).await;
        assert_eq!(output.error.as_deref(), Some("MISSING_COMMAND"));

        let output = f
            .tool
            .call(input(ExperienceAction::Commit, None, None))
            .await;
        assert_eq!(output.error.as_deref(), Some("MISSING_EXPERIENCE_ID"));
    }

    #[tokio::test]
    async fn test_unknown_agent() {
        let f = fixture(ScriptedEngine::new());
        let mut request = input(ExperienceAction::New, None, Some("ls"));
        request.agent_id = "stranger".to_string();

        let output = f.tool.call(request).await;
        assert_eq!(output.error.as_deref(), Some("UNKNOWN_AGENT"));
    }

    #[tokio::test]
    async fn test_project_outside_allowed_roots_is_rejected() {
        let root = TempDir::new().unwrap();
        let project = root.path().join("elsewhere");
        fs::create_dir_all(&project).unwrap();
        fs::create_dir_all(root.path().join("allowed")).unwrap();

        let mut directory = MockAgentDirectory::new();
        let project_path = project.clone();
        let allowed = root.path().join("allowed");
        directory.expect_lookup().returning(move |_| {
            Some(AgentProject {
                project_path: project_path.clone(),
                allowed_roots: vec![allowed.clone()],
                secrets: HashMap::new(),
            })
        });

        let engine = Arc::new(ScriptedEngine::new());
        let executor = Executor::new(
            engine.clone(),
            Arc::new(ConfigResolver::new(root.path().join("cache"))),
        );
        let tool = ProjectCommandTool::new(Arc::new(executor), Arc::new(directory));

        let output = tool
            .call(input(ExperienceAction::New, None, Some("ls")))
            .await;
        assert_eq!(output.error.as_deref(), Some("PATH_NOT_ALLOWED"));
        assert!(!root.path().join(".elsewhere.experiences").exists());
    }

    #[tokio::test]
    async fn test_timeout_is_reported() {
        let f = fixture(ScriptedEngine::new().on_exec(
            "npm test",
            ScriptedExec::Exit {
                code: 124,
                stdout: "running\n".to_string(),
                stderr: String::new(),
            },
        ));

        let output = f
            .tool
            .call(input(ExperienceAction::New, Some("slow"), Some("npm test")))
            .await;
        assert!(!output.success);
        assert_eq!(output.timed_out, Some(true));
        assert_eq!(output.exit_code, 124);
        assert_eq!(output.stdout, "running");
        assert!(output.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_out_of_range_timeout_is_reported_not_run() {
        let f = fixture(ScriptedEngine::new());
        let mut request = input(ExperienceAction::New, Some("huge"), Some("npm test"));
        request.timeout = Some(u64::MAX);

        let output = f.tool.call(request).await;
        assert!(!output.success);
        assert_eq!(output.timed_out, Some(false));
        assert!(output.error.unwrap().contains("timeout must be between"));
        assert!(f.engine.created().is_empty());
    }

    #[test]
    fn test_agent_project_debug_hides_secret_values() {
        let mut secrets = HashMap::new();
        secrets.insert("API_KEY".to_string(), "very-secret".to_string());
        let project = AgentProject {
            project_path: PathBuf::from("/p"),
            allowed_roots: vec![],
            secrets,
        };
        let debug = format!("{:?}", project);
        assert!(debug.contains("API_KEY"));
        assert!(!debug.contains("very-secret"));
    }

    #[test]
    fn test_input_deserializes_camel_case() {
        let input: ProjectCommandInput = serde_json::from_str(
            r#"{"agentId": "a", "action": "continue", "experienceId": "e1", "command": "ls"}"#,
        )
        .unwrap();
        assert_eq!(input.action, ExperienceAction::Continue);
        assert_eq!(input.experience_id.as_deref(), Some("e1"));
        assert_eq!(input.timeout, None);
    }
}
