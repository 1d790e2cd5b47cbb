//! Durable Task Store
//!
//! Persisted mirror of in-flight tasks plus the story, page and image records the
//! pipeline reads and writes. The durable record is the source of truth for
//! resuming work after a restart.

pub mod persistence;

pub use persistence::SledStore;

use crate::error::StorageError;
use crate::story::{Page, StoryRecord};
use crate::task::{IllustrationTask, TaskPriority, TaskStatus, TaskType};
use crate::types::{CollectionId, ImageRef, PageId, StoryId, TaskId};
use crate::visual::CollectionVisualContext;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use tracing::{info, warn};

/// Persisted projection of an [`IllustrationTask`].
///
/// Identity, status, priority, timestamps, attempts and the dependency set map
/// losslessly in both directions. `total_pages`, `prompt` and
/// `previous_illustration_path` are denormalized for debugging only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub page_id: Option<PageId>,
    pub story_id: StoryId,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    pub task_type: TaskType,
    pub page_number: Option<u32>,
    #[serde(default)]
    pub total_pages: Option<u32>,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub previous_illustration_path: Option<String>,
    #[serde(default)]
    pub global_reference_image: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<TaskId>,
    pub attempt_count: u32,
    pub created_at_ms: u64,
    pub last_updated_at_ms: u64,
    #[serde(default)]
    pub next_attempt_at_ms: Option<u64>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl TaskRecord {
    pub fn from_task(task: &IllustrationTask) -> Self {
        Self {
            id: task.id.clone(),
            page_id: task.page_id.clone(),
            story_id: task.story_id.clone(),
            priority: task.priority,
            status: task.status,
            task_type: task.task_type,
            page_number: task.page_index,
            total_pages: None,
            prompt: None,
            previous_illustration_path: task
                .previous_illustration
                .as_ref()
                .map(|r| r.as_str().to_string()),
            global_reference_image: task
                .global_reference_image
                .as_ref()
                .map(|r| r.as_str().to_string()),
            dependencies: task.dependencies.iter().cloned().collect(),
            attempt_count: task.attempt_count,
            created_at_ms: task.created_at_ms,
            last_updated_at_ms: task.last_updated_at_ms,
            next_attempt_at_ms: task.next_attempt_at_ms,
            last_error: task.last_error.clone(),
        }
    }

    pub fn with_context(mut self, total_pages: Option<u32>, prompt: Option<String>) -> Self {
        self.total_pages = total_pages;
        self.prompt = prompt;
        self
    }

    pub fn into_task(self) -> IllustrationTask {
        IllustrationTask {
            id: self.id,
            page_id: self.page_id,
            story_id: self.story_id,
            priority: self.priority,
            status: self.status,
            task_type: self.task_type,
            page_index: self.page_number,
            previous_illustration: self.previous_illustration_path.map(ImageRef::new),
            global_reference_image: self.global_reference_image.map(ImageRef::new),
            dependencies: self.dependencies.into_iter().collect(),
            attempt_count: self.attempt_count,
            created_at_ms: self.created_at_ms,
            last_updated_at_ms: self.last_updated_at_ms,
            next_attempt_at_ms: self.next_attempt_at_ms,
            last_error: self.last_error,
        }
    }
}

impl From<&IllustrationTask> for TaskRecord {
    fn from(task: &IllustrationTask) -> Self {
        TaskRecord::from_task(task)
    }
}

/// Durable task records. Writes are last-writer-wins per task id.
pub trait TaskRecordStore: Send + Sync {
    fn put_task(&self, record: &TaskRecord) -> Result<(), StorageError>;
    fn get_task(&self, id: &TaskId) -> Result<Option<TaskRecord>, StorageError>;
    fn remove_task(&self, id: &TaskId) -> Result<(), StorageError>;

    /// All readable records. Unreadable records are skipped and reported in the
    /// second element so callers can log or purge them.
    fn list_tasks(&self) -> Result<(Vec<TaskRecord>, Vec<String>), StorageError>;
    fn flush(&self) -> Result<(), StorageError>;
}

/// Story, page, collection and image persistence consumed by the pipeline.
pub trait PageStore: Send + Sync {
    fn put_story(&self, story: &StoryRecord) -> Result<(), StorageError>;
    fn get_story(&self, id: &StoryId) -> Result<Option<StoryRecord>, StorageError>;
    fn list_stories(&self) -> Result<Vec<StoryRecord>, StorageError>;

    fn put_page(&self, page: &Page) -> Result<(), StorageError>;
    fn get_page(&self, story_id: &StoryId, page_number: u32) -> Result<Option<Page>, StorageError>;
    fn list_pages(&self, story_id: &StoryId) -> Result<Vec<Page>, StorageError>;

    fn put_collection(&self, context: &CollectionVisualContext) -> Result<(), StorageError>;
    fn get_collection(&self, id: &CollectionId)
        -> Result<Option<CollectionVisualContext>, StorageError>;

    /// Store image bytes under their content hash.
    fn put_image(&self, bytes: &[u8]) -> Result<ImageRef, StorageError>;
    fn get_image(&self, image: &ImageRef) -> Result<Option<Vec<u8>>, StorageError>;
}

/// Outcome of reading the durable store at startup.
#[derive(Debug, Clone, Default)]
pub struct Recovery {
    /// Tasks to load into the scheduler: pending, failed and abandoned.
    pub tasks: Vec<IllustrationTask>,
    /// Ready records whose commit was interrupted; their dependents treat them as done.
    pub completed: Vec<TaskId>,
    /// Records found `generating` and reset to `pending`.
    pub interrupted: usize,
    /// Unreadable record keys that were dropped.
    pub discarded: Vec<String>,
}

/// Rebuild the active task set from durable storage.
///
/// A task found `generating` was interrupted mid-flight and is reset to `pending`,
/// never dropped and never completed. A store that cannot be read at all degrades
/// to an empty recovery.
pub fn recover(store: &dyn TaskRecordStore) -> Recovery {
    let (records, discarded) = match store.list_tasks() {
        Ok(listing) => listing,
        Err(e) => {
            warn!(error = %e, "Durable task store unreadable, starting fresh");
            return Recovery::default();
        }
    };

    let mut recovery = Recovery {
        discarded,
        ..Recovery::default()
    };
    for key in &recovery.discarded {
        warn!(key = %key, "Discarding unreadable task record");
        if let Err(e) = store.remove_task(&TaskId::new(key.as_str())) {
            warn!(key = %key, error = %e, "Failed to purge unreadable task record");
        }
    }

    for record in records {
        match record.status {
            TaskStatus::Ready => {
                if let Err(e) = store.remove_task(&record.id) {
                    warn!(task_id = %record.id, error = %e, "Failed to clear committed task record");
                }
                recovery.completed.push(record.id);
            }
            TaskStatus::Generating => {
                let mut task = record.into_task();
                task.update_status(TaskStatus::Pending);
                if let Err(e) = store.put_task(&TaskRecord::from_task(&task)) {
                    warn!(task_id = %task.id, error = %e, "Failed to persist recovered task");
                }
                recovery.interrupted += 1;
                recovery.tasks.push(task);
            }
            TaskStatus::Pending | TaskStatus::Failed | TaskStatus::Abandoned => {
                recovery.tasks.push(record.into_task());
            }
        }
    }

    // A dependency without a record was committed (or pruned) before the restart.
    let known: HashSet<&TaskId> = recovery.tasks.iter().map(|t| &t.id).collect();
    let mut settled: BTreeSet<TaskId> = BTreeSet::new();
    for task in &recovery.tasks {
        settled.extend(task.dependencies.iter().filter(|d| !known.contains(d)).cloned());
    }
    settled.retain(|id| !recovery.completed.contains(id));
    recovery.completed.extend(settled);

    if let Err(e) = store.flush() {
        warn!(error = %e, "Failed to flush task store after recovery");
    }

    info!(
        tasks = recovery.tasks.len(),
        interrupted = recovery.interrupted,
        completed = recovery.completed.len(),
        discarded = recovery.discarded.len(),
        "Recovered durable tasks"
    );
    recovery
}

/// Delete abandoned task records. Returns the removed ids.
pub fn prune_abandoned(store: &dyn TaskRecordStore) -> Result<Vec<TaskId>, StorageError> {
    let (records, _) = store.list_tasks()?;
    let mut pruned = Vec::new();
    for record in records.into_iter().filter(|r| r.status == TaskStatus::Abandoned) {
        store.remove_task(&record.id)?;
        pruned.push(record.id);
    }
    store.flush()?;
    if !pruned.is_empty() {
        info!(pruned = pruned.len(), "Pruned abandoned task records");
    }
    Ok(pruned)
}
