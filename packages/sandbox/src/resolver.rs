// ABOUTME: Container config resolver consulting memory cache, disk cache, templates and proposer
// ABOUTME: Explicitly constructed service with per-key single-flight for proposer calls

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::ai::{parse_proposed_config, ConfigProposer, ProposalRequest};
use crate::cache::{cache_key, ConfigCache, ConfigSource};
use crate::error::{Result, SandboxError};
use crate::languages;
use crate::types::{CacheStats, ContainerConfig};

/// A resolved config and whether it came from a cache tier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedConfig {
    pub config: ContainerConfig,
    pub cached: bool,
}

pub struct ConfigResolver {
    cache: ConfigCache,
    proposer: Option<Arc<dyn ConfigProposer>>,
    /// One lock per key being derived; entries are dropped once derivation ends
    in_flight: InFlightMap,
}

impl ConfigResolver {
    /// Resolver without AI assistance: only built-in templates are available
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache: ConfigCache::new(cache_dir),
            proposer: None,
            in_flight: StdMutex::new(HashMap::new()),
        }
    }

    pub fn with_proposer(mut self, proposer: Arc<dyn ConfigProposer>) -> Self {
        self.proposer = Some(proposer);
        self
    }

    pub fn has_proposer(&self) -> bool {
        self.proposer.is_some()
    }

    /// Resolve the config for `code` in `language`.
    ///
    /// Lookup order: memory, disk, built-in template (unless `use_ai_config`),
    /// proposer. Freshly derived configs are written to both tiers.
    pub async fn resolve(
        &self,
        code: &str,
        language: &str,
        use_ai_config: bool,
    ) -> Result<ResolvedConfig> {
        let language = languages::normalize(language);
        if !languages::is_valid_name(&language) {
            return Err(SandboxError::Configuration(format!(
                "invalid language '{}': expected letters, digits or one of + # . _ -",
                language
            )));
        }

        let template = languages::template_for(&language).filter(|_| !use_ai_config);
        let source = if template.is_some() {
            ConfigSource::Template
        } else {
            ConfigSource::Proposed
        };
        let key = cache_key(&language, source, code);

        if let Some(config) = self.lookup(&key).await {
            return Ok(ResolvedConfig {
                config,
                cached: true,
            });
        }

        if let Some(template) = template {
            let config = template.to_container_config();
            self.cache.put(&key, &config).await?;
            debug!("Derived template config for {} ({})", language, key);
            return Ok(ResolvedConfig {
                config,
                cached: false,
            });
        }

        let proposer = self.proposer.as_ref().ok_or_else(|| {
            SandboxError::Configuration(if use_ai_config {
                format!(
                    "AI-assisted configuration requested for '{}' but no config proposer is configured",
                    language
                )
            } else {
                format!(
                    "unsupported language '{}' and no config proposer is configured (supported: {})",
                    language,
                    languages::known_languages().join(", ")
                )
            })
        })?;

        let entry = self.in_flight_entry(&key);
        let result = {
            let _guard = entry.lock.lock().await;
            // Another caller may have finished deriving this key while we waited
            match self.lookup(&key).await {
                Some(config) => Ok(ResolvedConfig {
                    config,
                    cached: true,
                }),
                None => self
                    .propose(proposer.as_ref(), &key, code, &language)
                    .await
                    .map(|config| ResolvedConfig {
                        config,
                        cached: false,
                    }),
            }
        };
        drop(entry);
        result
    }

    async fn lookup(&self, key: &str) -> Option<ContainerConfig> {
        if let Some(config) = self.cache.get_memory(key).await {
            debug!("Config cache hit (memory): {}", key);
            return Some(config);
        }
        if let Some(config) = self.cache.get_disk(key).await {
            debug!("Config cache hit (disk): {}", key);
            return Some(config);
        }
        debug!("Config cache miss: {}", key);
        None
    }

    async fn propose(
        &self,
        proposer: &dyn ConfigProposer,
        key: &str,
        code: &str,
        language: &str,
    ) -> Result<ContainerConfig> {
        info!("Asking config proposer for a {} container", language);
        let text = proposer
            .propose(&ProposalRequest::new(code, language))
            .await?;
        let config = parse_proposed_config(&text)?;
        self.cache.put(key, &config).await?;
        info!(
            "Cached proposed config for {} (image {})",
            language, config.base_image
        );
        Ok(config)
    }

    fn in_flight_entry(&self, key: &str) -> InFlight<'_> {
        let lock = lock_map(&self.in_flight)
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        InFlight {
            map: &self.in_flight,
            key: key.to_string(),
            lock,
        }
    }

    #[cfg(test)]
    fn in_flight_len(&self) -> usize {
        lock_map(&self.in_flight).len()
    }

    pub async fn cache_stats(&self) -> CacheStats {
        self.cache.stats().await
    }

    pub async fn clear_cache(&self) -> Result<()> {
        info!("Clearing container config cache");
        self.cache.clear().await
    }

    pub fn supported_languages(&self) -> Vec<&'static str> {
        languages::known_languages()
    }
}

type InFlightMap = StdMutex<HashMap<String, Arc<Mutex<()>>>>;

fn lock_map(map: &InFlightMap) -> std::sync::MutexGuard<'_, HashMap<String, Arc<Mutex<()>>>> {
    map.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Holds a key's derivation lock. Removes the map entry on drop, including
/// when the resolving future is cancelled while waiting.
struct InFlight<'a> {
    map: &'a InFlightMap,
    key: String,
    lock: Arc<Mutex<()>>,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut map = lock_map(self.map);
        // Two references left: the map's and ours. Nobody else is waiting.
        if Arc::strong_count(&self.lock) <= 2 {
            map.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::MockConfigProposer;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    const JULIA_CONFIG: &str = r#"{"baseImage": "julia:1.10", "runCommand": ["julia", "main.jl"]}"#;

    #[tokio::test]
    async fn test_template_config_cached_on_second_call() {
        let dir = TempDir::new().unwrap();
        let resolver = ConfigResolver::new(dir.path());

        let first = resolver.resolve("print('hi')", "python", false).await.unwrap();
        assert!(!first.cached);
        assert_eq!(first.config.base_image, "python:3.12-slim");

        let second = resolver.resolve("print('hi')", "python", false).await.unwrap();
        assert!(second.cached);
        assert_eq!(first.config, second.config);
    }

    #[tokio::test]
    async fn test_template_configs_are_persisted_to_disk() {
        let dir = TempDir::new().unwrap();
        let resolver = ConfigResolver::new(dir.path());
        resolver.resolve("puts 1", "ruby", false).await.unwrap();

        let stats = resolver.cache_stats().await;
        assert_eq!(stats.memory_size, 1);
        assert_eq!(stats.disk_size, 1);

        // A second resolver over the same directory hits the disk tier
        let other = ConfigResolver::new(dir.path());
        let resolved = other.resolve("puts 1", "rb", false).await.unwrap();
        assert!(resolved.cached);
    }

    #[tokio::test]
    async fn test_clear_cache_forces_fresh_resolution() {
        let dir = TempDir::new().unwrap();
        let resolver = ConfigResolver::new(dir.path());
        resolver.resolve("console.log(1)", "javascript", false).await.unwrap();
        resolver.clear_cache().await.unwrap();

        let resolved = resolver.resolve("console.log(1)", "javascript", false).await.unwrap();
        assert!(!resolved.cached);
    }

    #[tokio::test]
    async fn test_unsupported_language_without_proposer_fails() {
        let dir = TempDir::new().unwrap();
        let resolver = ConfigResolver::new(dir.path());

        let err = resolver.resolve("println(1)", "julia", false).await.unwrap_err();
        assert!(matches!(err, SandboxError::Configuration(_)));
        assert!(err.to_string().contains("julia"));

        // Nothing was cached
        assert_eq!(resolver.cache_stats().await.disk_size, 0);
    }

    #[tokio::test]
    async fn test_ai_requested_without_proposer_fails() {
        let dir = TempDir::new().unwrap();
        let resolver = ConfigResolver::new(dir.path());
        let err = resolver.resolve("print(1)", "python", true).await.unwrap_err();
        assert!(matches!(err, SandboxError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_unknown_language_uses_proposer_once() {
        let dir = TempDir::new().unwrap();
        let mut proposer = MockConfigProposer::new();
        proposer
            .expect_propose()
            .times(1)
            .returning(|request| {
                assert_eq!(request.language, "julia");
                Ok(JULIA_CONFIG.to_string())
            });

        let resolver = ConfigResolver::new(dir.path()).with_proposer(Arc::new(proposer));

        let first = resolver.resolve("println(1)", "julia", false).await.unwrap();
        assert!(!first.cached);
        assert_eq!(first.config.base_image, "julia:1.10");

        let second = resolver.resolve("println(1)", "julia", false).await.unwrap();
        assert!(second.cached);
    }

    #[tokio::test]
    async fn test_use_ai_config_bypasses_template() {
        let dir = TempDir::new().unwrap();
        let mut proposer = MockConfigProposer::new();
        proposer.expect_propose().times(1).returning(|_| {
            Ok(r#"{"baseImage": "python:3.12", "setupCommands": ["pip install requests"], "runCommand": ["python", "main.py"]}"#.to_string())
        });
        let resolver = ConfigResolver::new(dir.path()).with_proposer(Arc::new(proposer));

        let resolved = resolver
            .resolve("import requests", "python", true)
            .await
            .unwrap();
        assert_eq!(resolved.config.setup_commands, vec!["pip install requests"]);

        // The template path is keyed separately and still works
        let template = resolver
            .resolve("import requests", "python", false)
            .await
            .unwrap();
        assert!(!template.cached);
        assert!(template.config.setup_commands.is_empty());
    }

    #[tokio::test]
    async fn test_partial_proposal_is_rejected_and_not_cached() {
        let dir = TempDir::new().unwrap();
        let mut proposer = MockConfigProposer::new();
        proposer
            .expect_propose()
            .times(2)
            .returning(|_| Ok(r#"{"baseImage": "julia:1.10"}"#.to_string()));
        let resolver = ConfigResolver::new(dir.path()).with_proposer(Arc::new(proposer));

        for _ in 0..2 {
            let err = resolver.resolve("x", "julia", false).await.unwrap_err();
            assert!(matches!(err, SandboxError::Configuration(_)));
        }
        assert_eq!(resolver.cache_stats().await.memory_size, 0);
    }

    #[tokio::test]
    async fn test_proposer_failure_propagates() {
        let dir = TempDir::new().unwrap();
        let mut proposer = MockConfigProposer::new();
        proposer
            .expect_propose()
            .returning(|_| Err(SandboxError::Proposer("rate limited".to_string())));
        let resolver = ConfigResolver::new(dir.path()).with_proposer(Arc::new(proposer));

        let err = resolver.resolve("x", "zig", false).await.unwrap_err();
        assert!(err.to_string().contains("rate limited"));
    }

    #[tokio::test]
    async fn test_concurrent_misses_share_one_proposal() {
        let dir = TempDir::new().unwrap();
        let mut proposer = MockConfigProposer::new();
        proposer
            .expect_propose()
            .times(1)
            .returning(|_| Ok(JULIA_CONFIG.to_string()));
        let resolver = Arc::new(ConfigResolver::new(dir.path()).with_proposer(Arc::new(proposer)));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let resolver = resolver.clone();
                tokio::spawn(async move { resolver.resolve("println(2)", "julia", false).await })
            })
            .collect();

        let mut fresh = 0;
        for handle in handles {
            let resolved = handle.await.unwrap().unwrap();
            if !resolved.cached {
                fresh += 1;
            }
        }
        assert_eq!(fresh, 1);
    }

    #[tokio::test]
    async fn test_unsafe_language_names_are_rejected() {
        let dir = TempDir::new().unwrap();
        let mut proposer = MockConfigProposer::new();
        proposer.expect_propose().times(0);
        let resolver = ConfigResolver::new(dir.path().join("cache"))
            .with_proposer(Arc::new(proposer));

        for language in ["c/c++", "../x"] {
            let err = resolver.resolve("x", language, false).await.unwrap_err();
            assert!(matches!(err, SandboxError::Configuration(_)), "{}", err);
        }
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_resolve_leaves_no_in_flight_entry() {
        let dir = TempDir::new().unwrap();
        let resolver = Arc::new(ConfigResolver::new(dir.path()));
        let key = cache_key("julia", ConfigSource::Proposed, "x");

        let held = resolver.in_flight_entry(&key);
        let guard = held.lock.lock().await;

        let waiter = {
            let resolver = resolver.clone();
            let key = key.clone();
            tokio::spawn(async move {
                let entry = resolver.in_flight_entry(&key);
                let _guard = entry.lock.lock().await;
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        waiter.abort();
        let _ = waiter.await;

        drop(guard);
        drop(held);
        assert_eq!(resolver.in_flight_len(), 0);
    }
}
