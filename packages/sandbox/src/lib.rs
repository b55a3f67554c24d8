// ABOUTME: Container config resolution and sandboxed code execution
// ABOUTME: Exposes the resolver, the container engine seam and the executor built on both

pub mod ai;
pub mod cache;
pub mod engine;
pub mod error;
pub mod executor;
pub mod languages;
pub mod resolver;
pub mod types;

pub use ai::{parse_proposed_config, AnthropicProposer, ConfigProposer, ProposalRequest};
pub use cache::{cache_key, normalize_code, ConfigCache, ConfigSource};
pub use engine::{
    BindMount, ContainerEngine, ContainerSession, ContainerSpec, DockerEngine, ExecResult,
    ResourceLimits, TIMEOUT_EXIT_CODE,
};
pub use error::{ErrorKind, Result, SandboxError};
pub use executor::{classify_exit, Executor, ProjectRunRequest};
pub use resolver::{ConfigResolver, ResolvedConfig};
pub use types::{
    CacheStats, CacheVolumeConfig, ContainerConfig, ExecutionRequest, ExecutionResult,
    ProposedConfig, DEFAULT_TIMEOUT_SECS, DEFAULT_WORKDIR,
};
