//! CLI parse: clap types for picturebook. No behavior; definitions only.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Picturebook CLI - consistent, resumable story illustration
#[derive(Parser)]
#[command(name = "picturebook")]
#[command(about = "Generate consistent illustrations for picture-book stories")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Workspace root directory
    #[arg(long, default_value = ".")]
    pub workspace: PathBuf,

    /// Configuration file path (overrides default config loading)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging (default: off)
    #[arg(long, default_value = "false")]
    pub verbose: bool,

    /// Log level (trace, debug, info, warn, error, off)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Log format (json, text)
    #[arg(long)]
    pub log_format: Option<String>,

    /// Log output (stdout, stderr, file)
    #[arg(long)]
    pub log_output: Option<String>,

    /// Log file path (if output is "file")
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Plan and illustrate one story
    Run {
        /// Story JSON produced by story structuring
        story: PathBuf,
        /// Collection visual context JSON shared by sibling stories
        #[arg(long)]
        collection: Option<PathBuf>,
    },
    /// Resume every task left in the durable store
    Resume,
    /// Show tasks and illustration progress
    Status {
        /// Limit to one story
        #[arg(long)]
        story: Option<String>,
        /// Output format (text or json)
        #[arg(long, default_value = "text")]
        format: String,
    },
    /// Reset a failed or abandoned task and run it again
    Retry {
        task_id: String,
    },
    /// Clear a page's illustration and generate a new one
    Regenerate {
        story: String,
        page: u32,
    },
    /// Remove abandoned tasks from the durable store
    Prune,
    /// Configuration commands
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Print the effective configuration as TOML
    Show,
    /// Validate the effective configuration
    Validate,
}
