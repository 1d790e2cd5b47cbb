//! CLI output: error mapping from pipeline errors to the CLI surface.

use crate::error::PipelineError;

/// Map pipeline errors to a string for CLI output.
pub fn map_error(e: &PipelineError) -> String {
    match e {
        PipelineError::ProviderNotConfigured(msg) => {
            format!("{}\nSet [provider] in picturebook.toml or PICTUREBOOK_PROVIDER__API_KEY.", msg)
        }
        other => other.to_string(),
    }
}
