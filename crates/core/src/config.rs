//! TOML-based configuration for the MergeFlow engine.
//!
//! Every section is optional; an empty file yields [`EngineConfig::default`].

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::ConfigError;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level engine configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Merge request workflow settings.
    #[serde(default)]
    pub workflow: WorkflowConfig,

    /// History listing settings.
    #[serde(default)]
    pub history: HistoryConfig,

    /// Optional SQLite persistence.
    #[serde(default)]
    pub database: DatabaseConfig,
}

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

/// Merge request workflow configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Distinct approvals needed before a request becomes mergeable (default 1).
    #[serde(default = "default_approval_threshold")]
    pub approval_threshold: usize,

    /// Message of generated merge commits. `{source}` and `{target}` are
    /// replaced with the branch names.
    #[serde(default = "default_merge_message")]
    pub merge_message: String,
}

fn default_approval_threshold() -> usize {
    1
}
fn default_merge_message() -> String {
    "Merge branch '{source}' into '{target}'".into()
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            approval_threshold: default_approval_threshold(),
            merge_message: default_merge_message(),
        }
    }
}

impl WorkflowConfig {
    /// Render the merge commit message for the given branch names.
    pub fn merge_message_for(&self, source: &str, target: &str) -> String {
        self.merge_message
            .replace("{source}", source)
            .replace("{target}", target)
    }
}

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

/// Commit listing configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Page size used when a listing does not ask for one (default 50).
    #[serde(default = "default_page_size")]
    pub default_page_size: usize,

    /// Upper bound on any requested page size (default 500).
    #[serde(default = "default_max_page_size")]
    pub max_page_size: usize,
}

fn default_page_size() -> usize {
    50
}
fn default_max_page_size() -> usize {
    500
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            default_page_size: default_page_size(),
            max_page_size: default_max_page_size(),
        }
    }
}

impl HistoryConfig {
    /// Effective page size for a requested limit.
    pub fn page_size(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.default_page_size)
            .min(self.max_page_size)
    }
}

// ---------------------------------------------------------------------------
// Database
// ---------------------------------------------------------------------------

/// SQLite persistence configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database file. When unset the engine keeps everything in memory.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Loading & validation
// ---------------------------------------------------------------------------

impl EngineConfig {
    /// Load an [`EngineConfig`] from a TOML file at the given path.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: EngineConfig =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        debug!("configuration parsed successfully");
        Ok(config)
    }

    /// Validate that all values are sane.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workflow.approval_threshold == 0 {
            return Err(ConfigError::InvalidValue {
                field: "workflow.approval_threshold".into(),
                detail: "approval threshold must be at least 1".into(),
            });
        }
        if self.workflow.merge_message.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "workflow.merge_message".into(),
                detail: "merge message must not be empty".into(),
            });
        }
        if self.history.max_page_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "history.max_page_size".into(),
                detail: "max page size must be > 0".into(),
            });
        }
        if self.history.default_page_size == 0
            || self.history.default_page_size > self.history.max_page_size
        {
            return Err(ConfigError::InvalidValue {
                field: "history.default_page_size".into(),
                detail: format!(
                    "default page size must be between 1 and {}",
                    self.history.max_page_size
                ),
            });
        }

        Ok(())
    }

    /// Convenience: load and validate in one call.
    pub fn load_and_validate<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::load_from_file(path)?;
        config.validate()?;
        Ok(config)
    }
}
