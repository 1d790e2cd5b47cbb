//! Task Queue and Scheduler
//!
//! Id-keyed pool of active illustration tasks. Decides which task may run next
//! from status, attempt budget, dependencies and priority; plans the task set for
//! a story; and applies retry / regenerate commands from the presentation layer.

use crate::error::PipelineError;
use crate::story::Page;
use crate::store::Recovery;
use crate::task::{IllustrationTask, TaskPriority, TaskStatus, TaskType};
use crate::types::{PageId, StoryId, TaskId};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Manual recovery triggers sent from the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueCommand {
    /// Reset a failed or abandoned task's attempts and make it pending again.
    Retry(TaskId),
    /// Clear a page's illustration and generate it again.
    Regenerate { story_id: StoryId, page_number: u32 },
}

/// How a story's tasks are laid out.
#[derive(Debug, Clone, Copy)]
pub struct StoryPlanOptions {
    /// Create a global reference task every page task depends on.
    pub global_reference: bool,
    /// Make each page depend on the previous page's task so its image can be
    /// used as a continuity hint.
    pub chain_previous_page: bool,
}

/// Queue statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: usize,
    pub generating: usize,
    /// Ready tasks, including those committed and pruned from the pool.
    pub ready: usize,
    pub failed: usize,
    pub abandoned: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct TaskIdentity {
    story_id: StoryId,
    page_id: Option<PageId>,
    task_type: TaskType,
}

impl TaskIdentity {
    fn of(task: &IllustrationTask) -> Self {
        Self {
            story_id: task.story_id.clone(),
            page_id: task.page_id.clone(),
            task_type: task.task_type,
        }
    }
}

/// Selection order: higher priority first, then older first.
fn selection_order(a: &IllustrationTask, b: &IllustrationTask) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| a.created_at_ms.cmp(&b.created_at_ms))
        .then_with(|| a.id.cmp(&b.id))
}

/// Pick the next eligible task from `pool`.
///
/// Eligible means: status `pending`, or `failed` with attempts left; and every
/// dependency resolved according to `is_resolved`. Among eligible tasks the
/// highest priority wins, ties going to the oldest.
pub fn next_eligible_task<'a, I, F>(pool: I, max_attempts: u32, is_resolved: F) -> Option<&'a IllustrationTask>
where
    I: IntoIterator<Item = &'a IllustrationTask>,
    F: Fn(&TaskId) -> bool,
{
    pool.into_iter()
        .filter(|task| status_allows(task, max_attempts))
        .filter(|task| task.dependencies.iter().all(&is_resolved))
        .min_by(|a, b| selection_order(a, b))
}

fn status_allows(task: &IllustrationTask, max_attempts: u32) -> bool {
    match task.status {
        TaskStatus::Pending => true,
        TaskStatus::Failed => task.has_attempts_left(max_attempts),
        _ => false,
    }
}

/// Active task pool.
#[derive(Debug)]
pub struct TaskQueue {
    tasks: HashMap<TaskId, IllustrationTask>,
    identities: HashMap<TaskIdentity, TaskId>,
    completed: HashSet<TaskId>,
    max_attempts: u32,
}

impl TaskQueue {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            tasks: HashMap::new(),
            identities: HashMap::new(),
            completed: HashSet::new(),
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn get(&self, id: &TaskId) -> Option<&IllustrationTask> {
        self.tasks.get(id)
    }

    pub fn get_mut(&mut self, id: &TaskId) -> Option<&mut IllustrationTask> {
        self.tasks.get_mut(id)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &IllustrationTask> {
        self.tasks.values()
    }

    pub fn story_tasks<'a>(&'a self, story_id: &'a StoryId) -> impl Iterator<Item = &'a IllustrationTask> + 'a {
        self.tasks.values().filter(move |t| &t.story_id == story_id)
    }

    /// Active task targeting a page, if any.
    pub fn task_for_page(&self, page_id: &PageId) -> Option<&IllustrationTask> {
        self.tasks
            .values()
            .find(|t| t.page_id.as_ref() == Some(page_id))
    }

    /// Add a task. If an active task with the same story, page and type exists,
    /// nothing is inserted and the existing id is returned.
    pub fn insert(&mut self, task: IllustrationTask) -> TaskId {
        let identity = TaskIdentity::of(&task);
        if let Some(existing) = self.identities.get(&identity) {
            debug!(task_id = %existing, "Deduplicated task insert");
            return existing.clone();
        }
        let id = task.id.clone();
        self.identities.insert(identity, id.clone());
        self.tasks.insert(id.clone(), task);
        id
    }

    /// Replace the stored snapshot of a task already in the pool.
    pub fn update(&mut self, task: IllustrationTask) -> Result<(), PipelineError> {
        match self.tasks.get_mut(&task.id) {
            Some(slot) => {
                *slot = task;
                Ok(())
            }
            None => Err(PipelineError::TaskNotFound(task.id)),
        }
    }

    /// Mark ids as committed successes (used when recovering).
    pub fn mark_completed(&mut self, ids: impl IntoIterator<Item = TaskId>) {
        self.completed.extend(ids);
    }

    /// Seed the pool from a durable-store recovery.
    pub fn load_recovery(&mut self, recovery: Recovery) -> usize {
        self.mark_completed(recovery.completed);
        let mut loaded = 0;
        for task in recovery.tasks {
            let id = task.id.clone();
            if self.insert(task) == id {
                loaded += 1;
            }
        }
        loaded
    }

    /// Remove a ready task from the pool after its result has been committed.
    pub fn commit(&mut self, id: &TaskId) -> Option<IllustrationTask> {
        let task = self.remove(id)?;
        self.completed.insert(task.id.clone());
        Some(task)
    }

    pub fn remove(&mut self, id: &TaskId) -> Option<IllustrationTask> {
        let task = self.tasks.remove(id)?;
        self.identities.remove(&TaskIdentity::of(&task));
        Some(task)
    }

    /// A dependency is resolved once its task reached `ready`, whether still in the
    /// pool or already committed. Unknown ids are unresolved.
    pub fn is_resolved(&self, id: &TaskId) -> bool {
        if self.completed.contains(id) {
            return true;
        }
        self.tasks
            .get(id)
            .map(|t| t.status.is_success())
            .unwrap_or(false)
    }

    pub fn is_eligible(&self, task: &IllustrationTask) -> bool {
        status_allows(task, self.max_attempts)
            && task.dependencies.iter().all(|d| self.is_resolved(d))
    }

    /// Next task to run, ignoring retry backoff.
    pub fn next_eligible_task(&self) -> Option<&IllustrationTask> {
        next_eligible_task(self.tasks.values(), self.max_attempts, |id| self.is_resolved(id))
    }

    /// Next task to run at `now_ms`: failed tasks wait out their backoff.
    pub fn next_eligible_task_at(&self, now_ms: u64) -> Option<&IllustrationTask> {
        next_eligible_task(
            self.tasks
                .values()
                .filter(|t| t.next_attempt_at_ms.map(|at| at <= now_ms).unwrap_or(true)),
            self.max_attempts,
            |id| self.is_resolved(id),
        )
    }

    /// Next task for one story at `now_ms`.
    pub fn next_for_story<'a>(
        &'a self,
        story_id: &'a StoryId,
        now_ms: u64,
    ) -> Option<&'a IllustrationTask> {
        next_eligible_task(
            self.story_tasks(story_id)
                .filter(|t| t.next_attempt_at_ms.map(|at| at <= now_ms).unwrap_or(true)),
            self.max_attempts,
            |id| self.is_resolved(id),
        )
    }

    /// Whether a story still has work that could run now or after a backoff.
    pub fn has_runnable_work(&self, story_id: &StoryId) -> bool {
        self.story_tasks(story_id)
            .any(|t| status_allows(t, self.max_attempts) || t.status == TaskStatus::Generating)
    }

    /// Earliest pending backoff deadline for a story's eligible-by-dependency tasks.
    pub fn next_wakeup(&self, story_id: &StoryId) -> Option<u64> {
        self.story_tasks(story_id)
            .filter(|t| self.is_eligible(t))
            .filter_map(|t| t.next_attempt_at_ms)
            .min()
    }

    /// Create the task set for a story: optionally one global reference task, then
    /// one task per page lacking an illustration. Returns the ids in creation order
    /// (existing ids when the story was already planned).
    pub fn plan_story(&mut self, story_id: &StoryId, pages: &[Page], options: StoryPlanOptions) -> Vec<TaskId> {
        let mut ids = Vec::new();

        let global = if options.global_reference {
            let id = self.insert(IllustrationTask::global_reference(story_id.clone()));
            ids.push(id.clone());
            Some(id)
        } else {
            None
        };

        let mut previous: Option<TaskId> = None;
        let mut ordered: Vec<&Page> = pages.iter().collect();
        ordered.sort_by_key(|p| p.page_number);
        for page in ordered {
            if page.illustration().is_some() {
                previous = None;
                continue;
            }
            let mut task = IllustrationTask::page(
                story_id.clone(),
                page.page_number,
                TaskPriority::for_page(page.page_number),
                global.iter().cloned(),
            );
            if options.chain_previous_page {
                if let Some(prev) = &previous {
                    task.add_dependency(prev.clone());
                }
            }
            let id = self.insert(task);
            ids.push(id.clone());
            previous = Some(id);
        }

        debug!(
            story_id = %story_id,
            tasks = ids.len(),
            global_reference = options.global_reference,
            "Planned story tasks"
        );
        ids
    }

    /// Drop a dependency edge from every task that declares it. Used when a global
    /// reference task is abandoned so its pages proceed without references.
    pub fn release_dependents(&mut self, id: &TaskId) -> Vec<TaskId> {
        let mut released = Vec::new();
        for task in self.tasks.values_mut() {
            if task.remove_dependency(id) {
                released.push(task.id.clone());
            }
        }
        released
    }

    /// Manual retry: reset attempts and make the task pending.
    pub fn retry(&mut self, id: &TaskId) -> Result<&IllustrationTask, PipelineError> {
        let task = self
            .tasks
            .get_mut(id)
            .ok_or_else(|| PipelineError::TaskNotFound(id.clone()))?;
        if !matches!(task.status, TaskStatus::Failed | TaskStatus::Abandoned) {
            return Err(PipelineError::InvalidTransition {
                task_id: id.clone(),
                from: task.status.as_str(),
                to: TaskStatus::Pending.as_str(),
            });
        }
        task.reset_attempts();
        task.transition(TaskStatus::Pending)?;
        Ok(task)
    }

    /// Fails while the page's task is mid-flight: its result would land after the
    /// slot is cleared.
    pub fn ensure_regenerable(&self, story_id: &StoryId, page_number: u32) -> Result<(), PipelineError> {
        let page_id = PageId::for_page(story_id, page_number);
        match self.task_for_page(&page_id) {
            Some(task) if task.status == TaskStatus::Generating => Err(PipelineError::InvalidTransition {
                task_id: task.id.clone(),
                from: TaskStatus::Generating.as_str(),
                to: TaskStatus::Pending.as_str(),
            }),
            _ => Ok(()),
        }
    }

    /// Queue a page for regeneration. Reuses the page's active task when one exists
    /// and is not mid-flight; otherwise creates a new high-priority task.
    pub fn regenerate(&mut self, story_id: &StoryId, page_number: u32) -> Result<TaskId, PipelineError> {
        self.ensure_regenerable(story_id, page_number)?;
        let page_id = PageId::for_page(story_id, page_number);
        if let Some(existing) = self.task_for_page(&page_id).map(|t| t.id.clone()) {
            let task = self
                .tasks
                .get_mut(&existing)
                .ok_or_else(|| PipelineError::TaskNotFound(existing.clone()))?;
            if task.status != TaskStatus::Pending {
                task.reset_attempts();
                task.transition(TaskStatus::Pending)?;
            }
            return Ok(existing);
        }

        let previous_page = PageId::for_page(story_id, page_number.saturating_sub(1));
        let dependencies: Vec<TaskId> = self
            .story_tasks(story_id)
            .filter(|t| {
                t.task_type == TaskType::GlobalReference
                    || (page_number > 1 && t.page_id.as_ref() == Some(&previous_page))
            })
            .filter(|t| t.status != TaskStatus::Abandoned)
            .map(|t| t.id.clone())
            .collect();
        let task = IllustrationTask::page(story_id.clone(), page_number, TaskPriority::High, dependencies);
        Ok(self.insert(task))
    }

    pub fn stats(&self) -> QueueStats {
        let mut stats = QueueStats {
            ready: self.completed.len(),
            ..QueueStats::default()
        };
        for task in self.tasks.values() {
            match task.status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::Generating => stats.generating += 1,
                TaskStatus::Failed => stats.failed += 1,
                TaskStatus::Abandoned => stats.abandoned += 1,
                TaskStatus::Ready => stats.ready += 1,
            }
        }
        stats
    }

    /// Drop abandoned tasks from the pool. Returns their ids.
    pub fn prune_abandoned(&mut self) -> Vec<TaskId> {
        let ids: Vec<TaskId> = self
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Abandoned)
            .map(|t| t.id.clone())
            .collect();
        for id in &ids {
            self.remove(id);
        }
        ids
    }
}
