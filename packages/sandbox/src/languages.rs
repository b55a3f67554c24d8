// ABOUTME: Static language registry mapping language ids to file extensions and images
// ABOUTME: Unknown languages return None so callers can fall back to proposed configs

use crate::types::ContainerConfig;

/// Built-in template for one language
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LanguageTemplate {
    pub name: &'static str,
    pub extension: &'static str,
    pub base_image: &'static str,
    /// argv; `{file}` is replaced with the injected source file name
    pub run_command: &'static [&'static str],
}

const LANGUAGES: &[LanguageTemplate] = &[
    LanguageTemplate {
        name: "python",
        extension: "py",
        base_image: "python:3.12-slim",
        run_command: &["python", "-u", "{file}"],
    },
    LanguageTemplate {
        name: "javascript",
        extension: "js",
        base_image: "node:20-slim",
        run_command: &["node", "{file}"],
    },
    LanguageTemplate {
        name: "typescript",
        extension: "ts",
        base_image: "oven/bun:1",
        run_command: &["bun", "run", "{file}"],
    },
    LanguageTemplate {
        name: "ruby",
        extension: "rb",
        base_image: "ruby:3.3-slim",
        run_command: &["ruby", "{file}"],
    },
    LanguageTemplate {
        name: "go",
        extension: "go",
        base_image: "golang:1.22",
        run_command: &["go", "run", "{file}"],
    },
    LanguageTemplate {
        name: "rust",
        extension: "rs",
        base_image: "rust:1-slim",
        run_command: &["sh", "-c", "rustc -O -o /tmp/main {file} && /tmp/main"],
    },
    LanguageTemplate {
        name: "bash",
        extension: "sh",
        base_image: "bash:5",
        run_command: &["bash", "{file}"],
    },
    LanguageTemplate {
        name: "php",
        extension: "php",
        base_image: "php:8.3-cli",
        run_command: &["php", "{file}"],
    },
    LanguageTemplate {
        name: "perl",
        extension: "pl",
        base_image: "perl:5.38-slim",
        run_command: &["perl", "{file}"],
    },
    LanguageTemplate {
        name: "java",
        extension: "java",
        base_image: "eclipse-temurin:21-jdk",
        run_command: &["java", "{file}"],
    },
];

/// Map common aliases onto registry names. Lowercases everything.
pub fn normalize(language: &str) -> String {
    let lower = language.trim().to_lowercase();
    match lower.as_str() {
        "py" | "python3" => "python".to_string(),
        "js" | "node" | "nodejs" => "javascript".to_string(),
        "ts" => "typescript".to_string(),
        "rb" => "ruby".to_string(),
        "golang" => "go".to_string(),
        "rs" => "rust".to_string(),
        "sh" | "shell" => "bash".to_string(),
        _ => lower,
    }
}

/// Whether a normalized language name is safe to embed in cache file names:
/// `[a-z0-9+#._-]` only, and never `..`
pub fn is_valid_name(language: &str) -> bool {
    !language.is_empty()
        && !language.contains("..")
        && language
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "+#._-".contains(c))
}

pub fn template_for(language: &str) -> Option<&'static LanguageTemplate> {
    let name = normalize(language);
    LANGUAGES.iter().find(|t| t.name == name)
}

pub fn extension_for(language: &str) -> Option<&'static str> {
    template_for(language).map(|t| t.extension)
}

pub fn known_languages() -> Vec<&'static str> {
    LANGUAGES.iter().map(|t| t.name).collect()
}

/// Source file name used inside the container, e.g. `main.py`
pub fn source_file_name(extension: &str) -> String {
    format!("main.{}", extension)
}

impl LanguageTemplate {
    /// Minimal config: base image plus run command, no setup
    pub fn to_container_config(&self) -> ContainerConfig {
        let file = source_file_name(self.extension);
        let run_command = self
            .run_command
            .iter()
            .map(|arg| arg.replace("{file}", &file))
            .collect();
        ContainerConfig::new(self.base_image, run_command)
    }
}
