// ABOUTME: Read-only project inspection producing ProjectRequirements
// ABOUTME: Classifies project type, lockfiles, tool usage, env var names and skill repos

use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};

use runbox_config::RunnerConfig;
use runbox_sandbox::CacheVolumeConfig;

use crate::error::{DetectorError, DetectorResult};
use crate::types::{ProjectRequirements, ProjectType, SkillRepo};

const DEFAULT_MAX_FILES: usize = 2000;
const DEFAULT_MAX_FILE_BYTES: u64 = 256 * 1024;
const SKILLS_MANIFEST: &str = "skills.json";

/// Manifest files in priority order; first match decides the project type
const MANIFESTS: &[(&str, ProjectType)] = &[
    ("package.json", ProjectType::Node),
    ("pyproject.toml", ProjectType::Python),
    ("requirements.txt", ProjectType::Python),
    ("Pipfile", ProjectType::Python),
    ("setup.py", ProjectType::Python),
    ("Cargo.toml", ProjectType::Rust),
    ("go.mod", ProjectType::Go),
    ("Gemfile", ProjectType::Ruby),
];

struct Lockfile {
    file: &'static str,
    volume: &'static str,
    mount_path: &'static str,
    /// npm global needed to use the package manager
    npm_global: Option<&'static str>,
    /// Commands bootstrapping the package manager, before `install`
    bootstrap: &'static [&'static str],
    install: &'static str,
}

const LOCKFILES: &[Lockfile] = &[
    Lockfile {
        file: "package-lock.json",
        volume: "runbox-npm-cache",
        mount_path: "/root/.npm",
        npm_global: None,
        bootstrap: &[],
        install: "npm ci",
    },
    Lockfile {
        file: "pnpm-lock.yaml",
        volume: "runbox-pnpm-store",
        mount_path: "/root/.local/share/pnpm/store",
        npm_global: Some("pnpm"),
        bootstrap: &[],
        install: "pnpm install --frozen-lockfile",
    },
    Lockfile {
        file: "yarn.lock",
        volume: "runbox-yarn-cache",
        mount_path: "/usr/local/share/.cache/yarn",
        npm_global: None,
        bootstrap: &[],
        install: "yarn install --frozen-lockfile",
    },
    Lockfile {
        file: "bun.lockb",
        volume: "runbox-bun-cache",
        mount_path: "/root/.bun/install/cache",
        npm_global: Some("bun"),
        bootstrap: &[],
        install: "bun install --frozen-lockfile",
    },
    Lockfile {
        file: "bun.lock",
        volume: "runbox-bun-cache",
        mount_path: "/root/.bun/install/cache",
        npm_global: Some("bun"),
        bootstrap: &[],
        install: "bun install --frozen-lockfile",
    },
    Lockfile {
        file: "requirements.txt",
        volume: "runbox-pip-cache",
        mount_path: "/root/.cache/pip",
        npm_global: None,
        bootstrap: &[],
        install: "pip install -r requirements.txt",
    },
    Lockfile {
        file: "poetry.lock",
        volume: "runbox-poetry-cache",
        mount_path: "/root/.cache/pypoetry",
        npm_global: None,
        bootstrap: &["pip install poetry"],
        install: "poetry install --no-interaction --no-root",
    },
    Lockfile {
        file: "uv.lock",
        volume: "runbox-uv-cache",
        mount_path: "/root/.cache/uv",
        npm_global: None,
        bootstrap: &["pip install uv"],
        install: "uv sync --frozen",
    },
    Lockfile {
        file: "Pipfile.lock",
        volume: "runbox-pipenv-cache",
        mount_path: "/root/.cache/pipenv",
        npm_global: None,
        bootstrap: &["pip install pipenv"],
        install: "pipenv install --deploy --system",
    },
    Lockfile {
        file: "Cargo.lock",
        volume: "runbox-cargo-registry",
        mount_path: "/usr/local/cargo/registry",
        npm_global: None,
        bootstrap: &[],
        install: "cargo fetch",
    },
    Lockfile {
        file: "go.sum",
        volume: "runbox-go-mod-cache",
        mount_path: "/go/pkg/mod",
        npm_global: None,
        bootstrap: &[],
        install: "go mod download",
    },
    Lockfile {
        file: "Gemfile.lock",
        volume: "runbox-bundler-cache",
        mount_path: "/usr/local/bundle",
        npm_global: None,
        bootstrap: &[],
        install: "bundle install",
    },
];

const NODE_LOCKFILES: &[&str] = &[
    "package-lock.json",
    "pnpm-lock.yaml",
    "yarn.lock",
    "bun.lockb",
    "bun.lock",
];

/// Directories never descended into
const SKIPPED_DIRS: &[&str] = &[
    ".git",
    "node_modules",
    "target",
    "dist",
    "build",
    ".next",
    "__pycache__",
    ".venv",
    "venv",
    "vendor",
];

/// The only dotenv-style files whose keys are read
const ENV_TEMPLATES: &[&str] = &[".env.example", ".env.sample", ".env.template"];

/// Extensions scanned for tool usage
const TOOL_SCAN_EXTENSIONS: &[&str] = &[
    "sh", "bash", "zsh", "py", "js", "mjs", "cjs", "ts", "tsx", "jsx", "md", "markdown",
];

/// Extensions scanned for env var references
const SOURCE_EXTENSIONS: &[&str] = &[
    "js", "mjs", "cjs", "ts", "tsx", "jsx", "py", "rs", "go", "rb", "sh", "bash",
];

/// Shell and runtime variables that are never worth surfacing
const IGNORED_ENV_VARS: &[&str] = &[
    "PATH", "HOME", "USER", "SHELL", "PWD", "OLDPWD", "TERM", "LANG", "LC_ALL", "TMPDIR", "TMP",
    "TEMP", "HOSTNAME", "LOGNAME", "EDITOR", "NODE_ENV", "CI",
];

struct ToolRule {
    name: &'static str,
    apt: &'static [&'static str],
    pattern: &'static str,
}

const TOOLS: &[ToolRule] = &[
    ToolRule {
        name: "imagemagick",
        apt: &["imagemagick"],
        pattern: r"(?i)\bimage-?magick\b|\bmagick\s+\S",
    },
    ToolRule {
        name: "ffmpeg",
        apt: &["ffmpeg"],
        pattern: r"\bffmpeg\b|\bffprobe\b",
    },
    ToolRule {
        name: "sharp",
        apt: &[],
        pattern: r#"require\(\s*['"]sharp['"]\s*\)|from\s+['"]sharp['"]|"sharp"\s*:"#,
    },
    ToolRule {
        name: "playwright",
        apt: &[],
        pattern: r"\bplaywright\b",
    },
    ToolRule {
        name: "puppeteer",
        apt: &[
            "libasound2",
            "libatk-bridge2.0-0",
            "libgbm1",
            "libnss3",
            "libxkbcommon0",
        ],
        pattern: r"\bpuppeteer\b",
    },
    ToolRule {
        name: "github-cli",
        apt: &["gh"],
        pattern: r"\bgh\s+(?:pr|issue|repo|release|api|auth|run|workflow)\b",
    },
    ToolRule {
        name: "jq",
        apt: &["jq"],
        pattern: r"\bjq\s+['.\-]",
    },
    ToolRule {
        name: "git",
        apt: &["git"],
        pattern: r"\bgit\s+(?:clone|pull|push|commit|checkout|fetch|log|diff|status|rev-parse)\b|simple-git|\bgitpython\b",
    },
    ToolRule {
        name: "curl",
        apt: &["curl"],
        pattern: r"\bcurl\s+-|\bcurl\s+https?://",
    },
    ToolRule {
        name: "pandoc",
        apt: &["pandoc"],
        pattern: r"\bpandoc\b",
    },
];

lazy_static! {
    static ref TOOL_PATTERNS: Vec<(&'static ToolRule, Regex)> = TOOLS
        .iter()
        .filter_map(|rule| match Regex::new(rule.pattern) {
            Ok(re) => Some((rule, re)),
            Err(e) => {
                warn!("Invalid tool pattern for {}: {}", rule.name, e);
                None
            }
        })
        .collect();

    static ref ENV_PATTERNS: Vec<Regex> = [
        r#"process\.env\.([A-Z_][A-Z0-9_]*)"#,
        r#"process\.env\[\s*['"]([A-Z_][A-Z0-9_]*)['"]\s*\]"#,
        r#"import\.meta\.env\.([A-Z_][A-Z0-9_]*)"#,
        r#"os\.environ(?:\.get)?\s*[\[(]\s*['"]([A-Z_][A-Z0-9_]*)['"]"#,
        r#"os\.getenv\(\s*['"]([A-Z_][A-Z0-9_]*)['"]"#,
        r#"env::var(?:_os)?\(\s*"([A-Z_][A-Z0-9_]*)""#,
        r#"os\.(?:Getenv|LookupEnv)\(\s*"([A-Z_][A-Z0-9_]*)""#,
        r#"ENV(?:\.fetch\(|\[)\s*['"]([A-Z_][A-Z0-9_]*)['"]"#,
    ]
    .iter()
    .filter_map(|pattern| Regex::new(pattern).ok())
    .collect();

    static ref ENV_TEMPLATE_KEY: Regex =
        Regex::new(r"^\s*(?:export\s+)?([A-Za-z_][A-Za-z0-9_]*)\s*=").expect("valid regex");
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SkillManifestEntry {
    name: String,
    git_repo: String,
    container_path: Option<String>,
    #[serde(default)]
    apt_packages: Vec<String>,
    #[serde(default)]
    setup_commands: Vec<String>,
}

/// Read-only project inspection
#[derive(Debug, Clone)]
pub struct RequirementsDetector {
    max_files: usize,
    max_file_bytes: u64,
}

impl Default for RequirementsDetector {
    fn default() -> Self {
        Self {
            max_files: DEFAULT_MAX_FILES,
            max_file_bytes: DEFAULT_MAX_FILE_BYTES,
        }
    }
}

impl RequirementsDetector {
    pub fn new(max_files: usize, max_file_bytes: u64) -> Self {
        Self {
            max_files,
            max_file_bytes,
        }
    }

    pub fn from_config(config: &RunnerConfig) -> Self {
        Self {
            max_files: config.detector_max_files,
            ..Self::default()
        }
    }

    /// Inspect `project_path`. Never writes to the project and never opens
    /// `.env` files that hold values.
    pub fn detect(&self, project_path: &Path) -> DetectorResult<ProjectRequirements> {
        if !project_path.is_dir() {
            return Err(DetectorError::NotADirectory(project_path.to_path_buf()));
        }
        debug!("Detecting requirements in {}", project_path.display());

        let project_type = MANIFESTS
            .iter()
            .find(|(file, _)| project_path.join(file).is_file())
            .map(|(_, project_type)| *project_type)
            .unwrap_or(ProjectType::Unknown);

        let mut apt = BTreeSet::new();
        let mut npm_globals = BTreeSet::new();
        let mut setup = Vec::new();
        let mut cache_volumes: Vec<CacheVolumeConfig> = Vec::new();

        for lockfile in LOCKFILES {
            if !project_path.join(lockfile.file).is_file() {
                continue;
            }
            debug!("Found lockfile {}", lockfile.file);
            if !cache_volumes.iter().any(|v| v.name == lockfile.volume) {
                cache_volumes.push(CacheVolumeConfig::new(lockfile.volume, lockfile.mount_path));
            }
            if let Some(global) = lockfile.npm_global {
                npm_globals.insert(global.to_string());
            }
            for command in lockfile.bootstrap {
                push_unique(&mut setup, command);
            }
            push_unique(&mut setup, lockfile.install);
        }

        if project_type == ProjectType::Node
            && !NODE_LOCKFILES
                .iter()
                .any(|file| project_path.join(file).is_file())
        {
            push_unique(&mut setup, "npm install");
        }

        let scan = self.scan(project_path);

        let mut tools = scan.tools;
        tools.extend(package_json_tools(project_path));
        for rule in TOOLS.iter().filter(|rule| tools.contains(rule.name)) {
            apt.extend(rule.apt.iter().map(|p| p.to_string()));
        }
        if tools.contains("playwright") {
            match project_type {
                ProjectType::Python => {
                    push_unique(&mut setup, "python -m playwright install --with-deps chromium")
                }
                _ => push_unique(&mut setup, "npx playwright install --with-deps chromium"),
            }
        }

        let skill_repos = read_skill_manifest(project_path)?;
        if !skill_repos.is_empty() {
            apt.insert("git".to_string());
            for skill in &skill_repos {
                apt.extend(skill.apt_packages.iter().cloned());
            }
        }

        // Tools are reported in vocabulary order
        let detected_tools = TOOLS
            .iter()
            .filter(|rule| tools.contains(rule.name))
            .map(|rule| rule.name.to_string())
            .collect();

        let requirements = ProjectRequirements {
            project_type,
            detected_tools,
            env_var_names: scan.env_vars.into_iter().collect(),
            apt_packages: apt.into_iter().collect(),
            npm_global_packages: npm_globals.into_iter().collect(),
            setup_commands: setup,
            base_image: project_type.base_image().to_string(),
            cache_volumes,
            skill_repos,
        };

        debug!(
            "Detected {} project: {} tools, {} env vars, {} skill repos",
            project_type.as_str(),
            requirements.detected_tools.len(),
            requirements.env_var_names.len(),
            requirements.skill_repos.len()
        );
        Ok(requirements)
    }

    fn scan(&self, root: &Path) -> ScanResult {
        let mut result = ScanResult::default();
        let mut visited = 0usize;

        let walker = WalkDir::new(root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|entry| entry.depth() == 0 || !is_skipped_dir(entry));

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    debug!("Skipping unreadable entry: {}", e);
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }

            visited += 1;
            if visited > self.max_files {
                warn!(
                    "Stopped scanning {} after {} files",
                    root.display(),
                    self.max_files
                );
                break;
            }

            let name = entry.file_name().to_string_lossy();
            let is_env_template = ENV_TEMPLATES.contains(&&*name);
            if name.starts_with(".env") && !is_env_template {
                continue;
            }

            let extension = entry
                .path()
                .extension()
                .map(|e| e.to_string_lossy().to_lowercase())
                .unwrap_or_default();
            let scan_tools = TOOL_SCAN_EXTENSIONS.contains(&extension.as_str());
            let scan_env = SOURCE_EXTENSIONS.contains(&extension.as_str());
            if !(scan_tools || scan_env || is_env_template) {
                continue;
            }

            let Some(contents) = self.read_bounded(&entry) else {
                continue;
            };

            if is_env_template {
                for line in contents.lines() {
                    if let Some(caps) = ENV_TEMPLATE_KEY.captures(line) {
                        result.insert_env_var(&caps[1]);
                    }
                }
                continue;
            }
            if scan_tools {
                for (rule, re) in TOOL_PATTERNS.iter() {
                    if re.is_match(&contents) {
                        result.tools.insert(rule.name);
                    }
                }
            }
            if scan_env {
                for re in ENV_PATTERNS.iter() {
                    for caps in re.captures_iter(&contents) {
                        result.insert_env_var(&caps[1]);
                    }
                }
            }
        }

        result
    }

    fn read_bounded(&self, entry: &DirEntry) -> Option<String> {
        let len = entry.metadata().ok()?.len();
        if len > self.max_file_bytes {
            debug!("Skipping large file {}", entry.path().display());
            return None;
        }
        fs::read_to_string(entry.path()).ok()
    }
}

#[derive(Default)]
struct ScanResult {
    tools: BTreeSet<&'static str>,
    env_vars: BTreeSet<String>,
}

impl ScanResult {
    fn insert_env_var(&mut self, name: &str) {
        if !IGNORED_ENV_VARS.contains(&name) {
            self.env_vars.insert(name.to_string());
        }
    }
}

fn is_skipped_dir(entry: &DirEntry) -> bool {
    if !entry.file_type().is_dir() {
        return false;
    }
    let name = entry.file_name().to_string_lossy();
    SKIPPED_DIRS.contains(&&*name) || name.ends_with(".experiences")
}

fn push_unique(commands: &mut Vec<String>, command: &str) {
    if !commands.iter().any(|c| c == command) {
        commands.push(command.to_string());
    }
}

/// Tools referenced from package.json scripts and dependency names
fn package_json_tools(project_path: &Path) -> BTreeSet<&'static str> {
    let mut tools = BTreeSet::new();
    let path = project_path.join("package.json");
    let Ok(contents) = fs::read_to_string(&path) else {
        return tools;
    };
    let package_json: Value = match serde_json::from_str(&contents) {
        Ok(value) => value,
        Err(e) => {
            warn!("Ignoring invalid package.json {}: {}", path.display(), e);
            return tools;
        }
    };

    let mut haystack = String::new();
    if let Some(scripts) = package_json.get("scripts").and_then(|s| s.as_object()) {
        for script in scripts.values().filter_map(|v| v.as_str()) {
            haystack.push_str(script);
            haystack.push('\n');
        }
    }
    for section in ["dependencies", "devDependencies", "optionalDependencies"] {
        if let Some(deps) = package_json.get(section).and_then(|d| d.as_object()) {
            for name in deps.keys() {
                haystack.push_str(&format!("\"{}\": \n", name));
            }
        }
    }

    for (rule, re) in TOOL_PATTERNS.iter() {
        if re.is_match(&haystack) {
            tools.insert(rule.name);
        }
    }
    tools
}

fn read_skill_manifest(project_path: &Path) -> DetectorResult<Vec<SkillRepo>> {
    let path = project_path.join(SKILLS_MANIFEST);
    let contents = match fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let entries: Vec<SkillManifestEntry> =
        serde_json::from_str(&contents).map_err(|e| DetectorError::InvalidManifest {
            path: path.clone(),
            reason: e.to_string(),
        })?;

    entries
        .into_iter()
        .map(|entry| {
            if entry.name.trim().is_empty() || entry.git_repo.trim().is_empty() {
                return Err(DetectorError::InvalidManifest {
                    path: path.clone(),
                    reason: "skill entries need a name and a gitRepo".to_string(),
                });
            }
            let container_path = entry
                .container_path
                .unwrap_or_else(|| format!("/skills/{}", entry.name));
            Ok(SkillRepo {
                name: entry.name,
                git_repo: entry.git_repo,
                container_path,
                apt_packages: entry.apt_packages,
                setup_commands: entry.setup_commands,
            })
        })
        .collect()
}
