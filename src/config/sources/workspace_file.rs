//! Workspace config file source: picturebook.toml and picturebook.{env}.toml

use config::builder::DefaultState;
use config::{ConfigBuilder, File};
use std::path::Path;

pub const WORKSPACE_CONFIG_FILE: &str = "picturebook.toml";

/// Add workspace config files to the builder.
/// Precedence: picturebook.toml (base) then picturebook.{PICTUREBOOK_ENV}.toml.
pub fn add_to_builder(
    mut builder: ConfigBuilder<DefaultState>,
    workspace_root: &Path,
) -> ConfigBuilder<DefaultState> {
    let base = workspace_root.join(WORKSPACE_CONFIG_FILE);
    if base.exists() {
        builder = builder.add_source(File::from(base).required(false));
    }

    if let Ok(env_name) = std::env::var("PICTUREBOOK_ENV") {
        let env_config = workspace_root.join(format!("picturebook.{}.toml", env_name));
        if env_config.exists() {
            builder = builder.add_source(File::from(env_config).required(false));
        }
    }
    builder
}
