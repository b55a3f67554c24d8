// ABOUTME: Types describing what a project needs to run inside a container
// ABOUTME: ProjectRequirements converts into a sandbox ContainerConfig for project mode

use runbox_sandbox::{CacheVolumeConfig, ContainerConfig};
use serde::{Deserialize, Serialize};

/// Project type detected from manifest files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectType {
    Node,
    Python,
    Rust,
    Go,
    Ruby,
    Unknown,
}

impl ProjectType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectType::Node => "node",
            ProjectType::Python => "python",
            ProjectType::Rust => "rust",
            ProjectType::Go => "go",
            ProjectType::Ruby => "ruby",
            ProjectType::Unknown => "unknown",
        }
    }

    pub fn base_image(&self) -> &'static str {
        match self {
            ProjectType::Node => "node:20-bookworm",
            ProjectType::Python => "python:3.12-bookworm",
            ProjectType::Rust => "rust:1-bookworm",
            ProjectType::Go => "golang:1.22-bookworm",
            ProjectType::Ruby => "ruby:3.3-bookworm",
            ProjectType::Unknown => "ubuntu:22.04",
        }
    }
}

/// Auxiliary git repository cloned into the container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkillRepo {
    pub name: String,
    pub git_repo: String,
    pub container_path: String,
    #[serde(default)]
    pub apt_packages: Vec<String>,
    #[serde(default)]
    pub setup_commands: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectRequirements {
    pub project_type: ProjectType,
    pub detected_tools: Vec<String>,
    /// Names only; values are injected by the caller
    pub env_var_names: Vec<String>,
    pub apt_packages: Vec<String>,
    pub npm_global_packages: Vec<String>,
    /// Project-level setup (package manager bootstrap, dependency install)
    pub setup_commands: Vec<String>,
    pub base_image: String,
    pub cache_volumes: Vec<CacheVolumeConfig>,
    pub skill_repos: Vec<SkillRepo>,
}

impl ProjectRequirements {
    /// Container config for running commands against the project mounted at
    /// `workdir`. Setup order: apt packages, npm globals, skill repos, project
    /// setup. The run command is left empty; it is supplied per run.
    pub fn to_container_config(&self, workdir: &str) -> ContainerConfig {
        let mut setup = Vec::new();

        if !self.apt_packages.is_empty() {
            setup.push(format!(
                "apt-get update && DEBIAN_FRONTEND=noninteractive apt-get install -y --no-install-recommends {}",
                self.apt_packages.join(" ")
            ));
        }
        if !self.npm_global_packages.is_empty() {
            setup.push(format!(
                "npm install -g {}",
                self.npm_global_packages.join(" ")
            ));
        }
        for skill in &self.skill_repos {
            let path = shell_quote(&skill.container_path);
            setup.push(format!(
                "[ -d {path}/.git ] || git clone --depth 1 {} {path}",
                shell_quote(&skill.git_repo)
            ));
            for command in &skill.setup_commands {
                setup.push(format!("cd {} && {}", path, command));
            }
        }
        setup.extend(self.setup_commands.iter().cloned());

        let mut config = ContainerConfig::new(self.base_image.clone(), Vec::new());
        config.workdir = workdir.to_string();
        config.cache_volumes = self.cache_volumes.clone();
        config.setup_commands = setup;
        config
    }
}

/// Single-quote `value` for POSIX sh
pub(crate) fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn requirements() -> ProjectRequirements {
        ProjectRequirements {
            project_type: ProjectType::Node,
            detected_tools: vec!["ffmpeg".into()],
            env_var_names: vec!["OPENAI_API_KEY".into()],
            apt_packages: vec!["ffmpeg".into(), "git".into()],
            npm_global_packages: vec!["pnpm".into()],
            setup_commands: vec!["pnpm install --frozen-lockfile".into()],
            base_image: ProjectType::Node.base_image().to_string(),
            cache_volumes: vec![CacheVolumeConfig::new(
                "runbox-pnpm-store",
                "/root/.local/share/pnpm/store",
            )],
            skill_repos: vec![SkillRepo {
                name: "slides".into(),
                git_repo: "https://github.com/example/slides.git".into(),
                container_path: "/skills/slides".into(),
                apt_packages: vec![],
                setup_commands: vec!["npm ci".into()],
            }],
        }
    }

    #[test]
    fn test_container_config_setup_order() {
        let config = requirements().to_container_config("/app");
        assert_eq!(config.base_image, "node:20-bookworm");
        assert_eq!(config.workdir, "/app");
        assert_eq!(config.cache_volumes.len(), 1);
        assert!(config.run_command.is_empty());

        let setup = &config.setup_commands;
        assert_eq!(setup.len(), 5);
        assert!(setup[0].starts_with("apt-get update"));
        assert!(setup[0].ends_with("ffmpeg git"));
        assert_eq!(setup[1], "npm install -g pnpm");
        assert_eq!(
            setup[2],
            "[ -d '/skills/slides'/.git ] || git clone --depth 1 'https://github.com/example/slides.git' '/skills/slides'"
        );
        assert_eq!(setup[3], "cd '/skills/slides' && npm ci");
        assert_eq!(setup[4], "pnpm install --frozen-lockfile");
    }

    #[test]
    fn test_empty_requirements_have_no_setup() {
        let mut reqs = requirements();
        reqs.apt_packages.clear();
        reqs.npm_global_packages.clear();
        reqs.skill_repos.clear();
        reqs.setup_commands.clear();
        assert!(reqs.to_container_config("/app").setup_commands.is_empty());
    }

    #[test]
    fn test_shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn test_serializes_camel_case() {
        let json = serde_json::to_value(requirements()).unwrap();
        assert_eq!(json["projectType"], "node");
        assert_eq!(json["envVarNames"][0], "OPENAI_API_KEY");
        assert_eq!(json["skillRepos"][0]["containerPath"], "/skills/slides");
    }
}
