//! CLI presentation: text and json formatters.

use crate::error::PipelineError;
use crate::story::ProgressSnapshot;
use crate::store::TaskRecord;
use crate::types::StoryId;
use chrono::{TimeZone, Utc};
use comfy_table::Table;
use serde::Serialize;

/// Everything `status` shows for one story.
#[derive(Debug, Clone, Serialize)]
pub struct StoryStatus {
    pub story_id: StoryId,
    pub title: String,
    pub progress: ProgressSnapshot,
    pub tasks: Vec<TaskRecord>,
}

fn format_timestamp(ms: u64) -> String {
    match Utc.timestamp_millis_opt(ms as i64).single() {
        Some(ts) => ts.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => "-".to_string(),
    }
}

pub fn format_status_text(stories: &[StoryStatus]) -> String {
    if stories.is_empty() {
        return "No stories in the store.".to_string();
    }
    let mut out = String::new();
    for story in stories {
        out.push_str(&format!(
            "{} ({}): {}\n",
            story.title,
            story.story_id,
            story.progress.label()
        ));
        if story.tasks.is_empty() {
            out.push_str("  no active tasks\n");
            continue;
        }
        let mut table = Table::new();
        table.load_preset(comfy_table::presets::UTF8_FULL);
        table.set_header(vec!["Task", "Type", "Page", "Priority", "Status", "Attempts", "Updated", "Last Error"]);
        for task in &story.tasks {
            let page = task
                .page_number
                .map(|n| n.to_string())
                .unwrap_or_else(|| "-".to_string());
            table.add_row(vec![
                task.id.to_string(),
                task.task_type.as_str().to_string(),
                page,
                task.priority.as_str().to_string(),
                task.status.as_str().to_string(),
                task.attempt_count.to_string(),
                format_timestamp(task.last_updated_at_ms),
                task.last_error.clone().unwrap_or_default(),
            ]);
        }
        out.push_str(&table.to_string());
        out.push('\n');
    }
    out
}

pub fn format_status_json(stories: &[StoryStatus]) -> Result<String, PipelineError> {
    serde_json::to_string_pretty(stories)
        .map_err(|e| PipelineError::ConfigError(format!("Failed to render status: {}", e)))
}

/// One line per story run.
pub fn format_run_summary(results: &[(StoryId, Result<ProgressSnapshot, PipelineError>)]) -> String {
    if results.is_empty() {
        return "Nothing to resume.".to_string();
    }
    results
        .iter()
        .map(|(story_id, result)| match result {
            Ok(progress) => format!("{}: {}", story_id, progress.label()),
            Err(e) => format!("{}: failed: {}", story_id, e),
        })
        .collect::<Vec<_>>()
        .join("\n")
}
