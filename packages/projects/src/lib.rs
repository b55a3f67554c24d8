//! # Runbox Projects
//!
//! Runs agent commands against real projects. Requirements are detected from
//! the project tree, work happens inside isolated experience copies, and the
//! project-command tool ties both to the sandbox executor.

pub mod detector;
pub mod error;
pub mod experiences;
pub mod tool;
pub mod types;

pub use detector::RequirementsDetector;
pub use error::{DetectorError, DetectorResult, ExperienceError, ExperienceResult, ToolError};
pub use experiences::{validate_experience_id, Experience, ExperienceManager, ExperienceMetadata};
pub use tool::{
    AgentDirectory, AgentProject, ExperienceAction, ProjectCommandInput, ProjectCommandOutput,
    ProjectCommandTool, StaticAgentDirectory,
};
pub use types::{ProjectRequirements, ProjectType, SkillRepo};
