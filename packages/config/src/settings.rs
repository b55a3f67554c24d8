// ABOUTME: Runtime settings for config resolution, execution and project detection
// ABOUTME: Loaded from environment variables with validated defaults

use std::path::PathBuf;
use std::time::Duration;

use crate::constants::*;
use crate::env::{parse_var, parse_var_in_range};
use crate::ConfigError;

/// Settings shared by the sandbox and project packages.
#[derive(Debug, Clone, PartialEq)]
pub struct RunnerConfig {
    /// Directory holding the on-disk container config cache
    pub cache_dir: PathBuf,
    /// Wall clock limit applied when a request does not carry one
    pub default_timeout: Duration,
    /// Extra time given to the engine before a run is aborted from the outside
    pub timeout_grace: Duration,
    pub image_pull_timeout: Duration,
    pub detector_max_files: usize,
    pub anthropic_api_key: Option<String>,
    pub anthropic_model: Option<String>,
    pub anthropic_base_url: Option<String>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            default_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            timeout_grace: Duration::from_secs(DEFAULT_TIMEOUT_GRACE_SECS),
            image_pull_timeout: Duration::from_secs(DEFAULT_IMAGE_PULL_TIMEOUT_SECS),
            detector_max_files: DEFAULT_DETECTOR_MAX_FILES,
            anthropic_api_key: None,
            anthropic_model: None,
            anthropic_base_url: None,
        }
    }
}

impl RunnerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build settings from an arbitrary variable source.
    pub fn from_lookup<L>(lookup: L) -> Result<Self, ConfigError>
    where
        L: Fn(&str) -> Option<String>,
    {
        let cache_dir = parse_var::<PathBuf, _>(&lookup, RUNBOX_CACHE_DIR)?
            .unwrap_or_else(default_cache_dir);

        let default_timeout = parse_var_in_range(
            &lookup,
            RUNBOX_DEFAULT_TIMEOUT_SECS,
            DEFAULT_TIMEOUT_SECS,
            1,
            MAX_TIMEOUT_SECS,
        )?;
        let timeout_grace = parse_var_in_range(
            &lookup,
            RUNBOX_TIMEOUT_GRACE_SECS,
            DEFAULT_TIMEOUT_GRACE_SECS,
            0,
            300,
        )?;
        let image_pull_timeout = parse_var_in_range(
            &lookup,
            RUNBOX_IMAGE_PULL_TIMEOUT_SECS,
            DEFAULT_IMAGE_PULL_TIMEOUT_SECS,
            10,
            7200,
        )?;
        let detector_max_files = parse_var_in_range(
            &lookup,
            RUNBOX_DETECTOR_MAX_FILES,
            DEFAULT_DETECTOR_MAX_FILES,
            1,
            1_000_000,
        )?;

        let non_empty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        Ok(Self {
            cache_dir,
            default_timeout: Duration::from_secs(default_timeout),
            timeout_grace: Duration::from_secs(timeout_grace),
            image_pull_timeout: Duration::from_secs(image_pull_timeout),
            detector_max_files,
            anthropic_api_key: non_empty(ANTHROPIC_API_KEY),
            anthropic_model: non_empty(ANTHROPIC_MODEL),
            anthropic_base_url: non_empty(ANTHROPIC_BASE_URL),
        })
    }
}

/// `~/.cache/runbox/container-configs` (platform cache dir), or a temp dir
/// fallback when the platform has none.
pub fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("runbox")
        .join("container-configs")
}
