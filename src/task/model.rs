//! The illustration task entity.

use crate::error::PipelineError;
use crate::task::status::{TaskPriority, TaskStatus, TaskType};
use crate::types::{tick_after, tick_millis, ImageRef, PageId, StoryId, TaskId};
use std::collections::BTreeSet;
use std::hash::{Hash, Hasher};

/// One unit of generation work.
///
/// Identity is the `id`: equality and hashing ignore every other field, so two
/// snapshots of the same logical task always compare equal.
#[derive(Debug, Clone)]
pub struct IllustrationTask {
    pub id: TaskId,
    /// `None` for the story-wide global reference task.
    pub page_id: Option<PageId>,
    pub story_id: StoryId,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    pub task_type: TaskType,
    pub page_index: Option<u32>,
    pub previous_illustration: Option<ImageRef>,
    pub global_reference_image: Option<ImageRef>,
    pub dependencies: BTreeSet<TaskId>,
    /// Failed attempts since creation or the last manual reset.
    pub attempt_count: u32,
    pub created_at_ms: u64,
    pub last_updated_at_ms: u64,
    /// Earliest time an automatic retry may start.
    pub next_attempt_at_ms: Option<u64>,
    pub last_error: Option<String>,
}

impl IllustrationTask {
    pub fn create(
        page_id: Option<PageId>,
        story_id: StoryId,
        priority: TaskPriority,
        task_type: TaskType,
        dependencies: impl IntoIterator<Item = TaskId>,
    ) -> Self {
        let now = tick_millis();
        Self {
            id: TaskId::generate(),
            page_id,
            story_id,
            priority,
            status: TaskStatus::Pending,
            task_type,
            page_index: None,
            previous_illustration: None,
            global_reference_image: None,
            dependencies: dependencies.into_iter().collect(),
            attempt_count: 0,
            created_at_ms: now,
            last_updated_at_ms: now,
            next_attempt_at_ms: None,
            last_error: None,
        }
    }

    /// Task for the story's global reference image.
    pub fn global_reference(story_id: StoryId) -> Self {
        Self::create(
            None,
            story_id,
            TaskType::GlobalReference.default_priority(),
            TaskType::GlobalReference,
            [],
        )
    }

    /// Task for one page's illustration.
    pub fn page(
        story_id: StoryId,
        page_number: u32,
        priority: TaskPriority,
        dependencies: impl IntoIterator<Item = TaskId>,
    ) -> Self {
        let mut task = Self::create(
            Some(PageId::for_page(&story_id, page_number)),
            story_id,
            priority,
            TaskType::PageIllustration,
            dependencies,
        );
        task.page_index = Some(page_number);
        task
    }

    /// Set the status unconditionally. Always moves `last_updated_at_ms` forward.
    pub fn update_status(&mut self, status: TaskStatus) {
        self.status = status;
        self.touch();
    }

    /// Set the status only if the lifecycle allows it.
    pub fn transition(&mut self, to: TaskStatus) -> Result<(), PipelineError> {
        if !self.status.can_transition_to(to) {
            return Err(PipelineError::InvalidTransition {
                task_id: self.id.clone(),
                from: self.status.as_str(),
                to: to.as_str(),
            });
        }
        self.update_status(to);
        Ok(())
    }

    pub fn increment_attempt(&mut self) {
        self.attempt_count += 1;
        self.touch();
    }

    pub fn reset_attempts(&mut self) {
        self.attempt_count = 0;
        self.next_attempt_at_ms = None;
        self.last_error = None;
        self.touch();
    }

    /// Add a dependency edge. Returns `false` if it already existed.
    pub fn add_dependency(&mut self, id: TaskId) -> bool {
        if id == self.id {
            return false;
        }
        let added = self.dependencies.insert(id);
        if added {
            self.touch();
        }
        added
    }

    pub fn remove_dependency(&mut self, id: &TaskId) -> bool {
        let removed = self.dependencies.remove(id);
        if removed {
            self.touch();
        }
        removed
    }

    /// Whether the attempt budget still allows an automatic retry.
    pub fn has_attempts_left(&self, max_attempts: u32) -> bool {
        self.attempt_count < max_attempts
    }

    pub fn page_number(&self) -> Option<u32> {
        self.page_index
    }

    fn touch(&mut self) {
        self.last_updated_at_ms = tick_after(self.last_updated_at_ms);
    }
}

impl PartialEq for IllustrationTask {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for IllustrationTask {}

impl Hash for IllustrationTask {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}
