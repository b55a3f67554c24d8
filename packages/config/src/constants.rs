// ABOUTME: Environment variable name constants
// ABOUTME: Centralized definitions of all environment variable names used across Runbox

// Config Cache
pub const RUNBOX_CACHE_DIR: &str = "RUNBOX_CACHE_DIR";

// Execution Limits
pub const RUNBOX_DEFAULT_TIMEOUT_SECS: &str = "RUNBOX_DEFAULT_TIMEOUT_SECS";
pub const RUNBOX_TIMEOUT_GRACE_SECS: &str = "RUNBOX_TIMEOUT_GRACE_SECS";
pub const RUNBOX_IMAGE_PULL_TIMEOUT_SECS: &str = "RUNBOX_IMAGE_PULL_TIMEOUT_SECS";

// Project Detection
pub const RUNBOX_DETECTOR_MAX_FILES: &str = "RUNBOX_DETECTOR_MAX_FILES";

// Config Proposer (Anthropic)
pub const ANTHROPIC_API_KEY: &str = "ANTHROPIC_API_KEY";
pub const ANTHROPIC_MODEL: &str = "ANTHROPIC_MODEL";
pub const ANTHROPIC_BASE_URL: &str = "ANTHROPIC_BASE_URL";

// Defaults
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
pub const MAX_TIMEOUT_SECS: u64 = 3600;
pub const DEFAULT_TIMEOUT_GRACE_SECS: u64 = 5;
pub const DEFAULT_IMAGE_PULL_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_DETECTOR_MAX_FILES: usize = 2000;
