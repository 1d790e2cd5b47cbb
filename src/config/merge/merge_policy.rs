//! Merge rules: defaults first, then global file, workspace file and environment.

use config::builder::DefaultState;
use config::{Config, ConfigBuilder, ConfigError, Environment};
use std::path::PathBuf;

/// Prefix of environment overrides, e.g. `PICTUREBOOK_GENERATION__MAX_ATTEMPTS=5`.
pub const ENV_PREFIX: &str = "PICTUREBOOK";

/// Create a Config builder with every default applied.
pub fn builder_with_defaults() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    Config::builder()
        .set_default("generation.max_attempts", 3_i64)?
        .set_default("generation.retry_delay_ms", 1000_i64)?
        .set_default("generation.backoff_multiplier", 2.0_f64)?
        .set_default("generation.max_retry_delay_ms", 30_000_i64)?
        .set_default("generation.rate_limit_ms", 250_i64)?
        .set_default("generation.max_concurrent_stories", 2_i64)?
        .set_default("generation.use_previous_page_reference", true)?
        .set_default("generation.require_global_reference", true)?
        .set_default("references.notice_ttl_ms", 5000_i64)?
        .set_default("references.regenerate_degraded_pages", false)?
        .set_default(
            "storage.store_path",
            default_store_path().to_string_lossy().into_owned(),
        )
}

/// Environment variables override every file.
pub fn add_environment(builder: ConfigBuilder<DefaultState>) -> ConfigBuilder<DefaultState> {
    builder.add_source(
        Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true),
    )
}

/// `$XDG_DATA_HOME/picturebook/store`, or a workspace-relative fallback when no
/// home directory can be determined.
pub fn default_store_path() -> PathBuf {
    directories::ProjectDirs::from("", "", "picturebook")
        .map(|dirs| dirs.data_dir().join("store"))
        .unwrap_or_else(|| PathBuf::from(".picturebook/store"))
}
