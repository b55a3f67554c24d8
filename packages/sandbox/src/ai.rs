// ABOUTME: LLM collaborator that proposes container configs for unknown languages
// ABOUTME: Defines the ConfigProposer seam, an Anthropic-backed proposer and strict response parsing

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

use runbox_config::RunnerConfig;

use crate::error::{Result, SandboxError};
use crate::types::{ContainerConfig, ProposedConfig};

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";
const DEFAULT_MAX_TOKENS: u32 = 1024;
const DEFAULT_TEMPERATURE: f32 = 0.0;

const SYSTEM_PROMPT: &str = "You configure Docker containers that run a single source file. \
Reply with one JSON object and nothing else, using exactly these fields: \
baseImage (string, a public Docker image), workdir (absolute path, default /app), \
cacheVolumes (array of {name, mountPath}), environment (object of string values), \
setupCommands (array of shell commands run in order before the program), \
runCommand (argv array that runs the file main.<ext> from the workdir).";

/// What the proposer is asked to configure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProposalRequest {
    pub code: String,
    pub language: String,
}

impl ProposalRequest {
    pub fn new(code: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            language: language.into(),
        }
    }

    fn prompt(&self) -> String {
        format!(
            "Language: {}\nThe file will be saved as main.<ext> where <ext> is the usual \
             extension for this language.\n\nSource:\n```\n{}\n```",
            self.language, self.code
        )
    }
}

/// Opaque "propose a configuration" function. Returns raw completion text;
/// callers validate it with [`parse_proposed_config`].
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConfigProposer: Send + Sync {
    async fn propose(&self, request: &ProposalRequest) -> Result<String>;
}

/// Parse completion text into a validated config. Accepts a bare JSON object
/// or one wrapped in a Markdown code fence; anything else is a configuration
/// error.
pub fn parse_proposed_config(text: &str) -> Result<ContainerConfig> {
    let body = extract_json_object(text).ok_or_else(|| {
        SandboxError::Configuration("proposer response contains no JSON object".to_string())
    })?;

    let proposed: ProposedConfig = serde_json::from_str(body).map_err(|e| {
        SandboxError::Configuration(format!("proposer response is not a container config: {}", e))
    })?;

    ContainerConfig::try_from(proposed)
}

fn extract_json_object(text: &str) -> Option<&str> {
    let trimmed = text.trim();
    let unfenced = match trimmed.strip_prefix("```") {
        Some(rest) => {
            let rest = rest.strip_prefix("json").unwrap_or(rest);
            rest.rsplit_once("```").map(|(inner, _)| inner).unwrap_or(rest)
        }
        None => trimmed,
    };
    let start = unfenced.find('{')?;
    let end = unfenced.rfind('}')?;
    (end > start).then(|| &unfenced[start..=end])
}

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    temperature: f32,
    system: String,
    messages: Vec<Message>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    content_type: String,
    #[serde(default)]
    text: String,
}

/// Proposer backed by the Anthropic Messages API
pub struct AnthropicProposer {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl AnthropicProposer {
    pub fn new(api_key: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| SandboxError::Proposer(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_key: api_key.into(),
            model: DEFAULT_MODEL.to_string(),
            base_url: ANTHROPIC_API_URL.to_string(),
        })
    }

    /// Build from settings; a missing API key means AI assistance is not
    /// available.
    pub fn from_config(config: &RunnerConfig) -> Result<Self> {
        let api_key = config.anthropic_api_key.clone().ok_or_else(|| {
            SandboxError::Configuration("ANTHROPIC_API_KEY is not set".to_string())
        })?;

        let mut proposer = Self::new(api_key)?;
        if let Some(model) = &config.anthropic_model {
            info!("Using custom Anthropic model: {}", model);
            proposer.model = model.clone();
        }
        if let Some(base_url) = &config.anthropic_base_url {
            proposer.base_url = base_url.clone();
        }
        Ok(proposer)
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[async_trait]
impl ConfigProposer for AnthropicProposer {
    async fn propose(&self, request: &ProposalRequest) -> Result<String> {
        info!(
            "Requesting container config proposal for language {} (model {})",
            request.language, self.model
        );

        let body = AnthropicRequest {
            model: self.model.clone(),
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: DEFAULT_TEMPERATURE,
            system: SYSTEM_PROMPT.to_string(),
            messages: vec![Message {
                role: "user".to_string(),
                content: request.prompt(),
            }],
        };

        let url = format!("{}/v1/messages", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| SandboxError::Proposer(format!("request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(SandboxError::Proposer(format!(
                "API returned {}: {}",
                status, error_text
            )));
        }

        let parsed: AnthropicResponse = response
            .json()
            .await
            .map_err(|e| SandboxError::Proposer(format!("unreadable response: {}", e)))?;

        let text: String = parsed
            .content
            .into_iter()
            .filter(|block| block.content_type == "text")
            .map(|block| block.text)
            .collect();

        debug!("Proposer returned {} characters", text.len());
        Ok(text)
    }
}
