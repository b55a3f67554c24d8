// ABOUTME: Two-tier container config cache (process memory + JSON files on disk)
// ABOUTME: Keys are derived from the language and a normalized SHA-256 of the code

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::Result;
use crate::types::{CacheStats, ContainerConfig};

/// How a cached config was derived. Part of the key so a template config is
/// never served for a request that asked for a proposed one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSource {
    Template,
    Proposed,
}

impl ConfigSource {
    fn as_str(&self) -> &'static str {
        match self {
            ConfigSource::Template => "static",
            ConfigSource::Proposed => "ai",
        }
    }
}

/// Canonical form of `code` used for fingerprinting: LF line endings, no
/// trailing whitespace, no blank lines, no full-line comments. Indentation
/// is kept.
pub fn normalize_code(code: &str) -> String {
    code.replace("\r\n", "\n")
        .lines()
        .map(str::trim_end)
        .filter(|line| {
            let t = line.trim_start();
            !(t.is_empty() || t.starts_with('#') || t.starts_with("//") || t.starts_with("--"))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// `<language>-<static|ai>-<first 16 hex chars of sha256(normalized code)>`
pub fn cache_key(language: &str, source: ConfigSource, code: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_code(code).as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    format!("{}-{}-{}", language, source.as_str(), &digest[..16])
}

pub struct ConfigCache {
    memory: RwLock<HashMap<String, ContainerConfig>>,
    cache_dir: PathBuf,
}

impl ConfigCache {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            memory: RwLock::new(HashMap::new()),
            cache_dir: cache_dir.into(),
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    fn disk_path(&self, key: &str) -> PathBuf {
        self.cache_dir.join(format!("{}.json", key))
    }

    pub async fn get_memory(&self, key: &str) -> Option<ContainerConfig> {
        self.memory.read().await.get(key).cloned()
    }

    /// Read from disk and promote into memory. Unreadable or invalid entries
    /// are treated as misses.
    pub async fn get_disk(&self, key: &str) -> Option<ContainerConfig> {
        let path = self.disk_path(key);
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("Failed to read cached config {}: {}", path.display(), e);
                return None;
            }
        };

        let config: ContainerConfig = match serde_json::from_str(&contents) {
            Ok(config) => config,
            Err(e) => {
                warn!("Ignoring corrupt cached config {}: {}", path.display(), e);
                return None;
            }
        };
        if let Err(e) = config.validate() {
            warn!("Ignoring invalid cached config {}: {}", path.display(), e);
            return None;
        }

        debug!("Promoting disk cache entry {} to memory", key);
        self.memory
            .write()
            .await
            .insert(key.to_string(), config.clone());
        Some(config)
    }

    /// Write to both tiers. The disk write goes through a temp file and a
    /// rename so readers never observe a half-written entry.
    pub async fn put(&self, key: &str, config: &ContainerConfig) -> Result<()> {
        self.memory
            .write()
            .await
            .insert(key.to_string(), config.clone());

        tokio::fs::create_dir_all(&self.cache_dir).await?;
        let path = self.disk_path(key);
        let tmp = self
            .cache_dir
            .join(format!(".{}.{}.tmp", key, uuid::Uuid::new_v4().simple()));
        let json = serde_json::to_vec_pretty(config)?;
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;

        debug!("Cached config {} at {}", key, path.display());
        Ok(())
    }

    pub async fn stats(&self) -> CacheStats {
        let memory_size = self.memory.read().await.len();
        let disk_size = match self.disk_entries().await {
            Ok(entries) => entries.len(),
            Err(e) => {
                debug!("Cache dir {} not readable: {}", self.cache_dir.display(), e);
                0
            }
        };

        CacheStats {
            memory_size,
            disk_size,
            cache_dir: self.cache_dir.clone(),
        }
    }

    /// Empty both tiers. Returns after every disk entry has been removed.
    pub async fn clear(&self) -> Result<()> {
        self.memory.write().await.clear();

        let entries = match self.disk_entries().await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        for path in entries {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn disk_entries(&self) -> std::io::Result<Vec<PathBuf>> {
        let mut entries = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.cache_dir).await?;
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            let is_entry = path.extension().is_some_and(|ext| ext == "json")
                && !path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with('.'));
            if is_entry {
                entries.push(path);
            }
        }
        Ok(entries)
    }
}
