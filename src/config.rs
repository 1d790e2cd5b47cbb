//! Configuration System
//!
//! Layered configuration: built-in defaults, then the global file, then the
//! workspace file, then `PICTUREBOOK_*` environment variables.

use crate::engine::GenerationConfig;
use crate::error::PipelineError;
use crate::logging::LoggingConfig;
use crate::references::ReferencesConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub use crate::provider::{ProviderConfig, ProviderType};

mod merge {
    pub mod merge_policy;
}
mod sources {
    pub mod global_file;
    pub mod workspace_file;
}

pub use merge::merge_policy::default_store_path;
pub use sources::global_file::global_config_path;
pub use sources::workspace_file::WORKSPACE_CONFIG_FILE;

/// Root configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PicturebookConfig {
    #[serde(default)]
    pub generation: GenerationConfig,

    #[serde(default)]
    pub provider: ProviderConfig,

    #[serde(default)]
    pub references: ReferencesConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for PicturebookConfig {
    fn default() -> Self {
        Self {
            generation: GenerationConfig::default(),
            provider: ProviderConfig::default(),
            references: ReferencesConfig::default(),
            storage: StorageConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Storage paths
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory of the sled database
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            store_path: default_store_path(),
        }
    }
}

impl StorageConfig {
    /// Store path resolved against the workspace when relative.
    pub fn resolve_store_path(&self, workspace_root: &Path) -> PathBuf {
        if self.store_path.is_absolute() {
            self.store_path.clone()
        } else {
            workspace_root.join(&self.store_path)
        }
    }
}

/// Configuration validation errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    Generation(String),
    Provider(String),
    Storage(String),
    Logging(String),
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::Generation(msg) => write!(f, "Generation: {}", msg),
            ValidationError::Provider(msg) => write!(f, "Provider: {}", msg),
            ValidationError::Storage(msg) => write!(f, "Storage: {}", msg),
            ValidationError::Logging(msg) => write!(f, "Logging: {}", msg),
        }
    }
}

impl std::error::Error for ValidationError {}

impl PicturebookConfig {
    /// Validate the entire configuration. Provider credentials are left to
    /// [`ProviderConfig::validate`] at the point a provider is built, so commands
    /// that never call the provider work without them.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if let Err(e) = self.generation.validate() {
            errors.push(ValidationError::Generation(e));
        }
        if self.provider.model.trim().is_empty() {
            errors.push(ValidationError::Provider("Model name cannot be empty".to_string()));
        }
        if self.provider.timeout_secs == 0 {
            errors.push(ValidationError::Provider(
                "Timeout must be greater than zero".to_string(),
            ));
        }
        if self.storage.store_path.as_os_str().is_empty() {
            errors.push(ValidationError::Storage("Store path cannot be empty".to_string()));
        }
        if let Err(e) = crate::logging::validate(&self.logging) {
            errors.push(ValidationError::Logging(e));
        }
        errors
    }

    /// Validate and fold every problem into one error.
    pub fn ensure_valid(&self) -> Result<(), PipelineError> {
        let errors = self.validate();
        if errors.is_empty() {
            return Ok(());
        }
        let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        Err(PipelineError::ConfigError(format!(
            "Configuration validation failed:\n{}",
            messages.join("\n")
        )))
    }

    /// Render as TOML.
    pub fn to_toml(&self) -> Result<String, PipelineError> {
        toml::to_string_pretty(self)
            .map_err(|e| PipelineError::ConfigError(format!("Failed to render config: {}", e)))
    }
}

/// Builds [`PicturebookConfig`] from its sources.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Defaults only.
    pub fn default() -> PicturebookConfig {
        PicturebookConfig::default()
    }

    /// Load the full layered configuration for a workspace.
    pub fn load(workspace_root: &Path) -> Result<PicturebookConfig, PipelineError> {
        Self::load_layers(global_config_path(), workspace_root)
    }

    /// Load with an explicit global file location (or none).
    pub fn load_layers(
        global: Option<PathBuf>,
        workspace_root: &Path,
    ) -> Result<PicturebookConfig, PipelineError> {
        let builder = merge::merge_policy::builder_with_defaults()?;
        let builder = sources::global_file::add_to_builder(builder, global);
        let builder = sources::workspace_file::add_to_builder(builder, workspace_root);
        let builder = merge::merge_policy::add_environment(builder);
        Ok(builder.build()?.try_deserialize()?)
    }

    /// Defaults plus a single file, no environment.
    pub fn load_from_file(path: &Path) -> Result<PicturebookConfig, PipelineError> {
        let builder = merge::merge_policy::builder_with_defaults()?
            .add_source(config::File::from(path.to_path_buf()).required(true));
        Ok(builder.build()?.try_deserialize()?)
    }
}
