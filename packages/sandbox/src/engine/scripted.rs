// ABOUTME: In-memory container engine with scripted exec responses for tests
// ABOUTME: Records every container, upload and exec so tests can assert on lifecycle

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use super::{ContainerEngine, ContainerSpec, ExecResult, TIMEOUT_EXIT_CODE};
use crate::error::{Result, SandboxError};

/// Canned behaviour for commands whose argv contains a given fragment
#[derive(Debug, Clone)]
pub enum ScriptedExec {
    Exit {
        code: i64,
        stdout: String,
        stderr: String,
    },
    /// Print `stdout`, then never finish; the engine deadline decides
    Hang { stdout: String },
    /// The engine rejects the exec itself
    EngineError(String),
}

impl ScriptedExec {
    pub fn ok(stdout: impl Into<String>) -> Self {
        ScriptedExec::Exit {
            code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn fail(code: i64, stderr: impl Into<String>) -> Self {
        ScriptedExec::Exit {
            code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UploadRecord {
    pub container_id: String,
    pub dir: String,
    pub file_name: String,
    pub contents: Vec<u8>,
}

#[derive(Default)]
struct State {
    unreachable: bool,
    create_error: Option<String>,
    scripts: Vec<(String, ScriptedExec)>,
    next_id: u64,
    created: Vec<ContainerSpec>,
    live: HashSet<String>,
    removed: Vec<String>,
    uploads: Vec<UploadRecord>,
    execs: Vec<Vec<String>>,
    pulled: Vec<String>,
}

#[derive(Default)]
pub struct ScriptedEngine {
    state: Mutex<State>,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `ping` fails with a connection error
    pub fn unreachable() -> Self {
        let engine = Self::default();
        engine.lock().unreachable = true;
        engine
    }

    /// First script whose fragment appears in the joined argv wins.
    /// Unmatched commands exit 0 with no output.
    pub fn on_exec(self, fragment: impl Into<String>, exec: ScriptedExec) -> Self {
        self.lock().scripts.push((fragment.into(), exec));
        self
    }

    pub fn failing_create(self, message: impl Into<String>) -> Self {
        self.lock().create_error = Some(message.into());
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn created(&self) -> Vec<ContainerSpec> {
        self.lock().created.clone()
    }

    pub fn live_containers(&self) -> usize {
        self.lock().live.len()
    }

    pub fn removed(&self) -> Vec<String> {
        self.lock().removed.clone()
    }

    pub fn uploads(&self) -> Vec<UploadRecord> {
        self.lock().uploads.clone()
    }

    pub fn execs(&self) -> Vec<Vec<String>> {
        self.lock().execs.clone()
    }

    pub fn pulled(&self) -> Vec<String> {
        self.lock().pulled.clone()
    }
}

#[async_trait]
impl ContainerEngine for ScriptedEngine {
    async fn ping(&self) -> Result<()> {
        if self.lock().unreachable {
            return Err(SandboxError::Connection(
                "scripted engine is unreachable".to_string(),
            ));
        }
        Ok(())
    }

    async fn ensure_image(&self, image: &str) -> Result<()> {
        self.lock().pulled.push(image.to_string());
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let mut state = self.lock();
        if let Some(message) = &state.create_error {
            return Err(SandboxError::Engine(message.clone()));
        }
        state.next_id += 1;
        let id = format!("scripted-{}", state.next_id);
        state.created.push(spec.clone());
        state.live.insert(id.clone());
        Ok(id)
    }

    async fn remove_container(&self, container_id: &str) -> Result<()> {
        let mut state = self.lock();
        state.live.remove(container_id);
        state.removed.push(container_id.to_string());
        Ok(())
    }

    async fn upload_file(
        &self,
        container_id: &str,
        dir: &str,
        file_name: &str,
        contents: &[u8],
    ) -> Result<()> {
        self.lock().uploads.push(UploadRecord {
            container_id: container_id.to_string(),
            dir: dir.to_string(),
            file_name: file_name.to_string(),
            contents: contents.to_vec(),
        });
        Ok(())
    }

    async fn exec_command(
        &self,
        container_id: &str,
        command: Vec<String>,
        _working_dir: Option<&str>,
        deadline: Option<Duration>,
    ) -> Result<ExecResult> {
        let script = {
            let mut state = self.lock();
            if !state.live.contains(container_id) {
                return Err(SandboxError::Engine(format!(
                    "no such container: {}",
                    container_id
                )));
            }
            let joined = command.join(" ");
            state.execs.push(command);
            state
                .scripts
                .iter()
                .find(|(fragment, _)| joined.contains(fragment.as_str()))
                .map(|(_, exec)| exec.clone())
        };

        match script {
            None => Ok(ExecResult::default()),
            Some(ScriptedExec::Exit {
                code,
                stdout,
                stderr,
            }) => Ok(ExecResult {
                exit_code: code,
                stdout: stdout.into_bytes(),
                stderr: stderr.into_bytes(),
                timed_out: false,
            }),
            Some(ScriptedExec::Hang { stdout }) => {
                let deadline = deadline.ok_or_else(|| {
                    SandboxError::Engine("hanging exec without a deadline".to_string())
                })?;
                tokio::time::sleep(deadline).await;
                Ok(ExecResult {
                    exit_code: TIMEOUT_EXIT_CODE,
                    stdout: stdout.into_bytes(),
                    stderr: Vec::new(),
                    timed_out: true,
                })
            }
            Some(ScriptedExec::EngineError(message)) => Err(SandboxError::Engine(message)),
        }
    }
}
