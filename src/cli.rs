//! CLI domain: parse, route, output and presentation only.
//! No pipeline logic; the route table dispatches to the engine and store.

mod output;
mod parse;
mod presentation;
mod route;

pub use output::map_error;
pub use parse::{Cli, Commands, ConfigCommands};
pub use presentation::{format_run_summary, format_status_json, format_status_text, StoryStatus};
pub use route::RunContext;
