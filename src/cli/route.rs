//! CLI route: single route table and run context.

use crate::config::{ConfigLoader, PicturebookConfig};
use crate::engine::GenerationEngine;
use crate::error::PipelineError;
use crate::progress::PipelineEvent;
use crate::provider::create_provider;
use crate::scheduler::QueueCommand;
use crate::store::{prune_abandoned, PageStore, SledStore, TaskRecordStore};
use crate::story::{ProgressSnapshot, StoryInput};
use crate::types::{StoryId, TaskId};
use crate::visual::CollectionVisualContext;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast::error::TryRecvError;
use tracing::{debug, info};

use crate::cli::parse::{Commands, ConfigCommands};
use crate::cli::presentation::{
    format_run_summary, format_status_json, format_status_text, StoryStatus,
};

/// Runtime context for CLI execution: workspace, effective config and the store.
pub struct RunContext {
    workspace_root: PathBuf,
    config: PicturebookConfig,
    store: Arc<SledStore>,
}

impl RunContext {
    /// Create run context from workspace root and optional config path.
    pub fn new(workspace_root: PathBuf, config_path: Option<PathBuf>) -> Result<Self, PipelineError> {
        let config = match config_path {
            Some(ref path) => ConfigLoader::load_from_file(path)?,
            None => ConfigLoader::load(&workspace_root)?,
        };
        config.ensure_valid()?;

        let store_path = config.storage.resolve_store_path(&workspace_root);
        std::fs::create_dir_all(&store_path).map_err(|e| {
            PipelineError::StorageError(format!(
                "Failed to create store directory {}: {}",
                store_path.display(),
                e
            ))
        })?;
        let store = SledStore::shared(&store_path)?;
        debug!(store_path = %store_path.display(), "Opened store");

        Ok(Self {
            workspace_root,
            config,
            store,
        })
    }

    pub fn config(&self) -> &PicturebookConfig {
        &self.config
    }

    /// Execute a CLI command via the single route table.
    pub fn execute(&self, command: &Commands) -> Result<String, PipelineError> {
        match command {
            Commands::Run { story, collection } => self.handle_run(story, collection.as_deref()),
            Commands::Resume => self.handle_resume(),
            Commands::Status { story, format } => self.handle_status(story.as_deref(), format),
            Commands::Retry { task_id } => {
                self.handle_command(QueueCommand::Retry(TaskId::new(task_id.as_str())))
            }
            Commands::Regenerate { story, page } => self.handle_command(QueueCommand::Regenerate {
                story_id: StoryId::new(story.as_str()),
                page_number: *page,
            }),
            Commands::Prune => {
                let pruned = prune_abandoned(self.store.as_ref())?;
                Ok(format!("Pruned {} abandoned task(s)", pruned.len()))
            }
            Commands::Config { command } => match command {
                ConfigCommands::Show => self.config.to_toml(),
                ConfigCommands::Validate => {
                    self.config.ensure_valid()?;
                    self.config
                        .provider
                        .validate()
                        .map_err(PipelineError::ProviderNotConfigured)?;
                    Ok("Configuration is valid".to_string())
                }
            },
        }
    }

    fn engine(&self) -> Result<GenerationEngine, PipelineError> {
        let provider = create_provider(&self.config.provider)?;
        let tasks: Arc<dyn TaskRecordStore> = self.store.clone();
        let pages: Arc<dyn PageStore> = self.store.clone();
        Ok(
            GenerationEngine::new(provider, tasks, pages, self.config.generation.clone())
                .with_references_config(self.config.references.clone()),
        )
    }

    fn runtime() -> Result<tokio::runtime::Runtime, PipelineError> {
        tokio::runtime::Runtime::new()
            .map_err(|e| PipelineError::ConfigError(format!("Failed to start async runtime: {}", e)))
    }

    fn handle_run(&self, story_path: &Path, collection_path: Option<&Path>) -> Result<String, PipelineError> {
        let input: StoryInput = self.read_json(story_path)?;
        let collection: Option<CollectionVisualContext> = match collection_path {
            Some(path) => Some(self.read_json(path)?),
            None => None,
        };
        let story_id = input.id.clone();

        let engine = self.engine()?;
        engine.resume();
        let planned = engine.submit_story(input, collection.as_ref())?;
        info!(story_id = %story_id, tasks = planned.len(), "Running story");

        let mut events = engine.subscribe();
        let rt = Self::runtime()?;
        let progress = rt.block_on(engine.run_story(&story_id))?;

        let mut notices = Vec::new();
        loop {
            match events.try_recv() {
                Ok(PipelineEvent::ReferencesFailed { message, .. }) => notices.push(message),
                Ok(_) | Err(TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
        let mut out = format_run_summary(&[(story_id, Ok(progress))]);
        for notice in notices {
            out.push_str(&format!("\nnote: {}", notice));
        }
        Ok(out)
    }

    fn handle_resume(&self) -> Result<String, PipelineError> {
        let engine = self.engine()?;
        let recovery = engine.resume();
        info!(
            tasks = recovery.tasks.len(),
            interrupted = recovery.interrupted,
            "Resuming durable tasks"
        );
        let rt = Self::runtime()?;
        let results = rt.block_on(engine.run_all());
        Ok(format_run_summary(&results))
    }

    fn handle_command(&self, command: QueueCommand) -> Result<String, PipelineError> {
        let engine = self.engine()?;
        engine.resume();
        let task_id = engine.handle(command)?;
        let story_id = engine
            .task(&task_id)
            .map(|t| t.story_id)
            .ok_or_else(|| PipelineError::TaskNotFound(task_id.clone()))?;
        let rt = Self::runtime()?;
        let progress: ProgressSnapshot = rt.block_on(engine.run_story(&story_id))?;
        Ok(format!("Task {} processed. {}: {}", task_id, story_id, progress.label()))
    }

    fn handle_status(&self, story: Option<&str>, format: &str) -> Result<String, PipelineError> {
        let stories = match story {
            Some(id) => {
                let id = StoryId::new(id);
                vec![self
                    .store
                    .get_story(&id)?
                    .ok_or(PipelineError::StoryNotFound(id))?]
            }
            None => self.store.list_stories()?,
        };
        let (records, _) = self.store.list_tasks()?;

        let mut statuses = Vec::with_capacity(stories.len());
        for story in stories {
            let pages = self.store.list_pages(&story.id)?;
            statuses.push(StoryStatus {
                progress: ProgressSnapshot::from_pages(&pages),
                tasks: records
                    .iter()
                    .filter(|r| r.story_id == story.id)
                    .cloned()
                    .collect(),
                story_id: story.id,
                title: story.title,
            });
        }

        if format == "json" {
            format_status_json(&statuses)
        } else {
            Ok(format_status_text(&statuses))
        }
    }

    fn read_json<T: DeserializeOwned>(&self, path: &Path) -> Result<T, PipelineError> {
        let path = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.workspace_root.join(path)
        };
        let raw = std::fs::read_to_string(&path).map_err(|e| {
            PipelineError::ConfigError(format!("Failed to read {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            PipelineError::ConfigError(format!("Failed to parse {}: {}", path.display(), e))
        })
    }
}
