//! Generation Engine
//!
//! Executes illustration tasks against the image provider. Every status change is
//! written to the durable task store before it becomes visible through the queue
//! or the event bus. Failures are recorded on the task and page, never thrown as
//! fatal errors: the attempt budget decides between an automatic retry and
//! `abandoned`.

use crate::error::PipelineError;
use crate::progress::{EventBus, PipelineEvent};
use crate::provider::{ImageProvider, ImageRequest};
use crate::references::{CharacterReferenceGenerator, NoticeBoard, ReferencesConfig};
use crate::scheduler::{QueueCommand, QueueStats, StoryPlanOptions, TaskQueue};
use crate::store::{recover, PageStore, Recovery, TaskRecord, TaskRecordStore};
use crate::story::{Illustration, Page, ProgressSnapshot, StoryInput};
use crate::task::{IllustrationStatus, IllustrationTask, TaskStatus, TaskType};
use crate::types::{now_millis, ImageRef, PageId, StoryId, TaskId};
use crate::visual::{page_prompt, CollectionVisualContext, PromptInputs};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex as AsyncMutex, Semaphore};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Generation engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Failed attempts allowed before a task is abandoned
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first automatic retry (milliseconds)
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,
    /// Minimum delay between provider calls (milliseconds)
    #[serde(default = "default_rate_limit_ms")]
    pub rate_limit_ms: u64,
    /// Stories processed at the same time
    #[serde(default = "default_max_concurrent_stories")]
    pub max_concurrent_stories: usize,
    /// Attach the previous page's image and make pages depend on their predecessor
    #[serde(default = "default_true")]
    pub use_previous_page_reference: bool,
    /// Generate a global reference image for standalone stories with characters
    #[serde(default = "default_true")]
    pub require_global_reference: bool,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_retry_delay_ms() -> u64 {
    30_000
}

fn default_rate_limit_ms() -> u64 {
    250
}

fn default_max_concurrent_stories() -> usize {
    2
}

fn default_true() -> bool {
    true
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_retry_delay_ms: default_max_retry_delay_ms(),
            rate_limit_ms: default_rate_limit_ms(),
            max_concurrent_stories: default_max_concurrent_stories(),
            use_previous_page_reference: true,
            require_global_reference: true,
        }
    }
}

impl GenerationConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be at least 1".to_string());
        }
        if self.backoff_multiplier < 1.0 {
            return Err("backoff_multiplier must be >= 1.0".to_string());
        }
        if self.max_concurrent_stories == 0 {
            return Err("max_concurrent_stories must be at least 1".to_string());
        }
        if self.max_retry_delay_ms < self.retry_delay_ms {
            return Err("max_retry_delay_ms must be >= retry_delay_ms".to_string());
        }
        Ok(())
    }

    /// Delay before the next automatic retry after `attempt` failures.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let delay = self.retry_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        Duration::from_millis(delay.min(self.max_retry_delay_ms as f64) as u64)
    }
}

/// Minimum spacing between provider calls.
struct RateLimiter {
    min_delay: Option<Duration>,
    last_call: AsyncMutex<Option<Instant>>,
}

impl RateLimiter {
    fn new(min_delay_ms: u64) -> Self {
        Self {
            min_delay: (min_delay_ms > 0).then(|| Duration::from_millis(min_delay_ms)),
            last_call: AsyncMutex::new(None),
        }
    }

    async fn acquire(&self) {
        let Some(min_delay) = self.min_delay else {
            return;
        };
        let mut last = self.last_call.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < min_delay {
                sleep(min_delay - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

/// What a successful task produced.
struct TaskOutput {
    prompt: Option<String>,
    total_pages: Option<u32>,
    previous_illustration: Option<ImageRef>,
    global_reference_image: Option<ImageRef>,
}

pub struct GenerationEngine {
    queue: Arc<Mutex<TaskQueue>>,
    provider: Arc<dyn ImageProvider>,
    tasks: Arc<dyn TaskRecordStore>,
    pages: Arc<dyn PageStore>,
    references: CharacterReferenceGenerator,
    config: GenerationConfig,
    reference_config: ReferencesConfig,
    events: EventBus,
    limiter: RateLimiter,
    stories: Semaphore,
}

impl GenerationEngine {
    pub fn new(
        provider: Arc<dyn ImageProvider>,
        tasks: Arc<dyn TaskRecordStore>,
        pages: Arc<dyn PageStore>,
        config: GenerationConfig,
    ) -> Self {
        let references = CharacterReferenceGenerator::new(Arc::clone(&provider), Arc::clone(&pages));
        Self {
            queue: Arc::new(Mutex::new(TaskQueue::new(config.max_attempts))),
            provider,
            tasks,
            pages,
            references,
            limiter: RateLimiter::new(config.rate_limit_ms),
            stories: Semaphore::new(config.max_concurrent_stories.max(1)),
            config,
            reference_config: ReferencesConfig::default(),
            events: EventBus::new(),
        }
    }

    pub fn with_references_config(mut self, reference_config: ReferencesConfig) -> Self {
        self.reference_config = reference_config;
        self
    }

    pub fn config(&self) -> &GenerationConfig {
        &self.config
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    pub fn notices(&self) -> &NoticeBoard {
        self.references.notices()
    }

    pub fn stats(&self) -> QueueStats {
        self.queue.lock().stats()
    }

    pub fn task(&self, id: &TaskId) -> Option<IllustrationTask> {
        self.queue.lock().get(id).cloned()
    }

    /// Active tasks of a story, ordered by creation.
    pub fn story_tasks(&self, story_id: &StoryId) -> Vec<IllustrationTask> {
        let queue = self.queue.lock();
        let mut tasks: Vec<IllustrationTask> = queue.story_tasks(story_id).cloned().collect();
        tasks.sort_by_key(|t| t.created_at_ms);
        tasks
    }

    pub fn all_tasks(&self) -> Vec<IllustrationTask> {
        let queue = self.queue.lock();
        let mut tasks: Vec<IllustrationTask> = queue.tasks().cloned().collect();
        tasks.sort_by_key(|t| t.created_at_ms);
        tasks
    }

    /// Ready / total page counts for a story.
    pub fn progress(&self, story_id: &StoryId) -> Result<ProgressSnapshot, PipelineError> {
        let pages = self.pages.list_pages(story_id)?;
        Ok(ProgressSnapshot::from_pages(&pages))
    }

    /// Store a story and its pages, then plan its tasks. Pages that already hold an
    /// illustration from an earlier submission keep it.
    pub fn submit_story(
        &self,
        input: StoryInput,
        collection: Option<&CollectionVisualContext>,
    ) -> Result<Vec<TaskId>, PipelineError> {
        if let Some(collection) = collection {
            self.pages.put_collection(collection)?;
        }
        let (mut story, pages) = input.into_parts(collection)?;

        if let Some(existing) = self.pages.get_story(&story.id)? {
            if existing.visual_guide.has_global_reference()
                && existing.visual_guide.character_definitions == story.visual_guide.character_definitions
            {
                story.visual_guide = existing.visual_guide;
            }
        }

        let mut stored_pages = Vec::with_capacity(pages.len());
        for page in pages {
            let kept = match self.pages.get_page(&story.id, page.page_number)? {
                Some(previous) if previous.illustration().is_some() => previous,
                _ => page,
            };
            self.pages.put_page(&kept)?;
            stored_pages.push(kept);
        }

        let requirement = CharacterReferenceGenerator::requirement(
            &story,
            &stored_pages,
            collection,
            self.config.require_global_reference,
        );
        story.references_pending = requirement.needs_generation();
        self.pages.put_story(&story)?;

        let options = StoryPlanOptions {
            global_reference: requirement.needs_generation(),
            chain_previous_page: self.config.use_previous_page_reference,
        };
        let planned: Vec<IllustrationTask> = {
            let mut queue = self.queue.lock();
            let ids = queue.plan_story(&story.id, &stored_pages, options);
            ids.iter().filter_map(|id| queue.get(id).cloned()).collect()
        };
        for task in &planned {
            self.tasks.put_task(
                &TaskRecord::from_task(task).with_context(Some(story.total_pages), None),
            )?;
        }
        self.tasks.flush()?;

        info!(
            story_id = %story.id,
            pages = story.total_pages,
            tasks = planned.len(),
            references = ?requirement,
            "Submitted story"
        );
        Ok(planned.into_iter().map(|t| t.id).collect())
    }

    /// Run one task to its next resting state and return that status.
    ///
    /// Provider, decode and store failures are recorded on the task; only a missing
    /// task or an illegal transition is returned as an error.
    pub async fn execute(&self, task_id: &TaskId) -> Result<TaskStatus, PipelineError> {
        let task = {
            let mut queue = self.queue.lock();
            let task = queue
                .get_mut(task_id)
                .ok_or_else(|| PipelineError::TaskNotFound(task_id.clone()))?;
            let previous = task.clone();
            task.transition(TaskStatus::Generating)?;
            let snapshot = task.clone();
            if let Err(e) = self.tasks.put_task(&TaskRecord::from_task(&snapshot)) {
                // Not durable, so not started.
                *task = previous;
                drop(queue);
                warn!(task_id = %task_id, error = %e, "Failed to persist task start");
                return self.record_failure(task_id, PipelineError::from(e));
            }
            snapshot
        };

        let attempt = task.attempt_count + 1;
        info!(
            task_id = %task.id,
            story_id = %task.story_id,
            task_type = task.task_type.as_str(),
            attempt,
            "Starting illustration task"
        );
        self.events.emit(PipelineEvent::TaskStarted {
            story_id: task.story_id.clone(),
            task_id: task.id.clone(),
            task_type: task.task_type,
            page_id: task.page_id.clone(),
            attempt,
        });

        let outcome = match task.task_type {
            TaskType::GlobalReference => self.run_global_reference(&task).await,
            TaskType::PageIllustration => self.run_page(&task).await,
        };

        match outcome {
            Ok(output) => self.record_success(&task, output),
            Err(e) => self.record_failure(&task.id, e),
        }
    }

    async fn run_global_reference(&self, task: &IllustrationTask) -> Result<TaskOutput, PipelineError> {
        self.events.emit(PipelineEvent::ReferencesPreparing {
            story_id: task.story_id.clone(),
        });
        let story = self
            .pages
            .get_story(&task.story_id)?
            .ok_or_else(|| PipelineError::StoryNotFound(task.story_id.clone()))?;

        self.limiter.acquire().await;
        let (guide, references) = self.references.generate(&story).await?;

        self.events.emit(PipelineEvent::ReferencesReady {
            story_id: task.story_id.clone(),
            characters: references.len(),
        });
        Ok(TaskOutput {
            prompt: Some(CharacterReferenceGenerator::reference_prompt(&guide)),
            total_pages: Some(story.total_pages),
            previous_illustration: None,
            global_reference_image: guide.global_reference_image,
        })
    }

    async fn run_page(&self, task: &IllustrationTask) -> Result<TaskOutput, PipelineError> {
        let page_number = task
            .page_number()
            .ok_or_else(|| PipelineError::PageNotFound(PageId::new(task.id.as_str())))?;
        let story = self
            .pages
            .get_story(&task.story_id)?
            .ok_or_else(|| PipelineError::StoryNotFound(task.story_id.clone()))?;
        let mut page = self
            .pages
            .get_page(&task.story_id, page_number)?
            .ok_or_else(|| PipelineError::PageNotFound(PageId::for_page(&task.story_id, page_number)))?;

        page.illustration_status = IllustrationStatus::Generating;
        self.pages.put_page(&page)?;

        let guide = &story.visual_guide;
        let missing = guide.missing_characters(&page.visual_plan);
        if !missing.is_empty() {
            warn!(
                page_id = %page.id,
                missing = ?missing,
                "Page references characters without descriptions"
            );
        }

        let global = match &guide.global_reference_image {
            Some(image) => self.load_image(image).map(|bytes| (image.clone(), bytes)),
            None => None,
        };
        let previous_page = if self.config.use_previous_page_reference && page_number > 1 {
            self.pages.get_page(&task.story_id, page_number - 1)?
        } else {
            None
        };
        // The previous page was given up on, so this page runs without the hint.
        let continuity_lost = previous_page
            .as_ref()
            .map(|p| p.illustration().is_none())
            .unwrap_or(false);
        let previous = previous_page.as_ref().and_then(|p| self.previous_page_image(p));

        let prompt = page_prompt(PromptInputs {
            guide,
            plan: &page.visual_plan,
            page_text: &page.text,
            total_pages: story.total_pages,
            has_previous_page_image: previous.is_some(),
            has_global_reference: global.is_some(),
        });
        let mut request = ImageRequest::new(prompt.clone());
        if let Some((_, bytes)) = &global {
            request = request.with_reference("global_reference", bytes.clone());
        }
        if let Some((_, bytes)) = &previous {
            request = request.with_reference("previous_page", bytes.clone());
        }

        self.limiter.acquire().await;
        let response = self.provider.generate(request).await?;
        if response.bytes.is_empty() {
            return Err(PipelineError::MalformedResponse("empty image".to_string()));
        }
        let image = self.pages.put_image(&response.bytes)?;

        // The slot is emptied and refilled in one write.
        page.clear_illustration();
        page.embed(Illustration::generated(image))?;
        page.degraded = !missing.is_empty()
            || continuity_lost
            || (!guide.character_definitions.is_empty() && global.is_none());
        self.pages.put_page(&page)?;

        debug!(
            page_id = %page.id,
            model = %response.model,
            degraded = page.degraded,
            "Embedded page illustration"
        );
        Ok(TaskOutput {
            prompt: Some(prompt),
            total_pages: Some(story.total_pages),
            previous_illustration: previous.map(|(image, _)| image),
            global_reference_image: global.map(|(image, _)| image),
        })
    }

    fn load_image(&self, image: &ImageRef) -> Option<Vec<u8>> {
        match self.pages.get_image(image) {
            Ok(Some(bytes)) => Some(bytes),
            Ok(None) => {
                warn!(image = %image, "Reference image missing from store");
                None
            }
            Err(e) => {
                warn!(image = %image, error = %e, "Failed to read reference image");
                None
            }
        }
    }

    fn previous_page_image(&self, previous: &Page) -> Option<(ImageRef, Vec<u8>)> {
        let key = previous.illustration().and_then(|i| i.cache_key()).cloned()?;
        self.load_image(&key).map(|bytes| (key, bytes))
    }

    fn record_success(&self, task: &IllustrationTask, output: TaskOutput) -> Result<TaskStatus, PipelineError> {
        let mut snapshot = self
            .queue
            .lock()
            .get(&task.id)
            .cloned()
            .ok_or_else(|| PipelineError::TaskNotFound(task.id.clone()))?;
        snapshot.transition(TaskStatus::Ready)?;
        snapshot.previous_illustration = output.previous_illustration;
        snapshot.global_reference_image = output.global_reference_image;
        snapshot.next_attempt_at_ms = None;
        snapshot.last_error = None;

        let record = TaskRecord::from_task(&snapshot).with_context(output.total_pages, output.prompt);
        if let Err(e) = self.tasks.put_task(&record) {
            if let Some(page_number) = snapshot.page_number() {
                self.discard_illustration(&snapshot.story_id, page_number);
            }
            return self.record_failure(&task.id, PipelineError::from(e));
        }
        self.queue.lock().update(snapshot.clone())?;

        info!(task_id = %snapshot.id, story_id = %snapshot.story_id, "Illustration task ready");
        self.events.emit(PipelineEvent::TaskReady {
            story_id: snapshot.story_id.clone(),
            task_id: snapshot.id.clone(),
            page_id: snapshot.page_id.clone(),
            attempt_count: snapshot.attempt_count,
        });

        self.queue.lock().commit(&snapshot.id);
        if let Err(e) = self.tasks.remove_task(&snapshot.id) {
            warn!(task_id = %snapshot.id, error = %e, "Failed to clear committed task record");
        }
        if let Err(e) = self.tasks.flush() {
            warn!(error = %e, "Failed to flush task store");
        }

        if snapshot.task_type == TaskType::GlobalReference && self.reference_config.regenerate_degraded_pages {
            let requeued = self.regenerate_degraded(&snapshot.story_id)?;
            if !requeued.is_empty() {
                info!(story_id = %snapshot.story_id, pages = requeued.len(), "Requeued degraded pages");
            }
        }
        self.emit_progress(&snapshot.story_id);
        Ok(TaskStatus::Ready)
    }

    fn record_failure(&self, task_id: &TaskId, failure: PipelineError) -> Result<TaskStatus, PipelineError> {
        let message = failure.to_string();
        let snapshot = {
            let mut queue = self.queue.lock();
            let task = queue
                .get_mut(task_id)
                .ok_or_else(|| PipelineError::TaskNotFound(task_id.clone()))?;
            if task.status == TaskStatus::Generating {
                task.transition(TaskStatus::Failed)?;
            } else {
                task.update_status(TaskStatus::Failed);
            }
            task.increment_attempt();
            task.last_error = Some(message.clone());
            if task.has_attempts_left(self.config.max_attempts) {
                let delay = self.config.retry_delay(task.attempt_count);
                task.next_attempt_at_ms = Some(now_millis() + delay.as_millis() as u64);
            } else {
                task.next_attempt_at_ms = None;
                task.transition(TaskStatus::Abandoned)?;
            }
            task.clone()
        };

        if let Err(e) = self.tasks.put_task(&TaskRecord::from_task(&snapshot)) {
            error!(task_id = %snapshot.id, error = %e, "Failed to persist task failure");
        }
        if let Some(page_number) = snapshot.page_number() {
            self.set_page_status(&snapshot.story_id, page_number, IllustrationStatus::Failed);
        }

        let abandoned = snapshot.status == TaskStatus::Abandoned;
        if failure.is_transient() {
            warn!(task_id = %snapshot.id, attempt = snapshot.attempt_count, abandoned, error = %message, "Illustration task failed");
        } else {
            error!(task_id = %snapshot.id, attempt = snapshot.attempt_count, abandoned, error = %message, "Illustration task failed");
        }

        if abandoned {
            self.events.emit(PipelineEvent::TaskAbandoned {
                story_id: snapshot.story_id.clone(),
                task_id: snapshot.id.clone(),
                page_id: snapshot.page_id.clone(),
                error: message.clone(),
            });
            match snapshot.task_type {
                TaskType::GlobalReference => self.proceed_without_references(&snapshot, &message),
                TaskType::PageIllustration => {
                    let released = self.release_dependents(&snapshot);
                    if !released.is_empty() {
                        warn!(
                            task_id = %snapshot.id,
                            released = released.len(),
                            "Continuing without previous page image"
                        );
                    }
                }
            }
        } else {
            self.events.emit(PipelineEvent::TaskFailed {
                story_id: snapshot.story_id.clone(),
                task_id: snapshot.id.clone(),
                page_id: snapshot.page_id.clone(),
                attempt: snapshot.attempt_count,
                error: message,
            });
        }
        if let Err(e) = self.tasks.flush() {
            warn!(error = %e, "Failed to flush task store");
        }
        Ok(snapshot.status)
    }

    /// Character references gave up: let the pages run without them and show a
    /// notice for the configured window.
    fn proceed_without_references(&self, task: &IllustrationTask, message: &str) {
        let released = self.release_dependents(task);
        warn!(
            story_id = %task.story_id,
            released = released.len(),
            "Continuing without character references"
        );

        let ttl_ms = self.reference_config.notice_ttl_ms;
        let notice = self.references.notices().raise(
            &task.story_id,
            format!("Character references unavailable: {}", message),
            ttl_ms,
        );
        self.events.emit(PipelineEvent::ReferencesFailed {
            story_id: task.story_id.clone(),
            message: notice.message,
        });

        let notices = self.references.notices().clone();
        let events = self.events.clone();
        let story_id = task.story_id.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(ttl_ms)).await;
            notices.clear(&story_id);
            events.emit(PipelineEvent::NoticeCleared { story_id });
        });
    }

    /// Drop the dependency edge on an abandoned task so its dependents can run.
    fn release_dependents(&self, task: &IllustrationTask) -> Vec<TaskId> {
        let released: Vec<IllustrationTask> = {
            let mut queue = self.queue.lock();
            let ids = queue.release_dependents(&task.id);
            ids.iter().filter_map(|id| queue.get(id).cloned()).collect()
        };
        for dependent in &released {
            if let Err(e) = self.tasks.put_task(&TaskRecord::from_task(dependent)) {
                warn!(task_id = %dependent.id, error = %e, "Failed to persist released task");
            }
        }
        released.into_iter().map(|t| t.id).collect()
    }

    /// Empty a page slot whose task could not be committed.
    fn discard_illustration(&self, story_id: &StoryId, page_number: u32) {
        let result = self.pages.get_page(story_id, page_number).and_then(|page| match page {
            Some(mut page) => {
                page.clear_illustration();
                self.pages.put_page(&page)
            }
            None => Ok(()),
        });
        if let Err(e) = result {
            warn!(story_id = %story_id, page_number, error = %e, "Failed to discard page illustration");
        }
    }

    fn set_page_status(&self, story_id: &StoryId, page_number: u32, status: IllustrationStatus) {
        let result = self.pages.get_page(story_id, page_number).and_then(|page| match page {
            Some(mut page) => {
                page.illustration_status = status;
                self.pages.put_page(&page)
            }
            None => Ok(()),
        });
        if let Err(e) = result {
            warn!(story_id = %story_id, page_number, error = %e, "Failed to update page status");
        }
    }

    fn emit_progress(&self, story_id: &StoryId) {
        match self.progress(story_id) {
            Ok(snapshot) => self.events.emit(PipelineEvent::progress(story_id.clone(), snapshot)),
            Err(e) => warn!(story_id = %story_id, error = %e, "Failed to compute progress"),
        }
    }

    /// Drive a story's tasks until nothing is left to run, waiting out retry
    /// backoff in between. Stories beyond `max_concurrent_stories` wait their turn.
    pub async fn run_story(&self, story_id: &StoryId) -> Result<ProgressSnapshot, PipelineError> {
        let _permit = self
            .stories
            .acquire()
            .await
            .map_err(|_| PipelineError::EngineClosed(story_id.clone()))?;

        loop {
            let now = now_millis();
            let next = self
                .queue
                .lock()
                .next_for_story(story_id, now)
                .map(|t| t.id.clone());
            if let Some(task_id) = next {
                self.execute(&task_id).await?;
                continue;
            }
            let wakeup = self.queue.lock().next_wakeup(story_id);
            match wakeup {
                Some(at) => sleep(Duration::from_millis(at.saturating_sub(now))).await,
                None => break,
            }
        }

        let snapshot = self.progress(story_id)?;
        info!(story_id = %story_id, ready = snapshot.ready, total = snapshot.total, "Story run finished");
        self.events.emit(PipelineEvent::progress(story_id.clone(), snapshot));
        Ok(snapshot)
    }

    /// Stop admitting story runs. Runs already holding a slot finish normally.
    pub fn close(&self) {
        self.stories.close();
    }

    /// Run every story with queued work. Independent stories run concurrently.
    pub async fn run_all(&self) -> Vec<(StoryId, Result<ProgressSnapshot, PipelineError>)> {
        let story_ids: BTreeSet<StoryId> = self
            .queue
            .lock()
            .tasks()
            .map(|t| t.story_id.clone())
            .collect();
        let runs = story_ids.into_iter().map(|story_id| async move {
            let result = self.run_story(&story_id).await;
            (story_id, result)
        });
        join_all(runs).await
    }

    /// Reload durable tasks into the queue. Pages left `generating` by the
    /// interrupted run go back to `pending`.
    pub fn resume(&self) -> Recovery {
        let recovery = recover(self.tasks.as_ref());
        for task in recovery.tasks.iter().filter(|t| t.task_type == TaskType::PageIllustration) {
            if let Some(page_number) = task.page_number() {
                if let Ok(Some(page)) = self.pages.get_page(&task.story_id, page_number) {
                    if page.illustration_status == IllustrationStatus::Generating {
                        self.set_page_status(&task.story_id, page_number, IllustrationStatus::Pending);
                    }
                }
            }
        }
        let summary = recovery.clone();
        let loaded = self.queue.lock().load_recovery(recovery);
        debug!(loaded, "Loaded recovered tasks into queue");
        summary
    }

    /// Apply a manual recovery command.
    pub fn handle(&self, command: QueueCommand) -> Result<TaskId, PipelineError> {
        match command {
            QueueCommand::Retry(task_id) => self.retry(&task_id),
            QueueCommand::Regenerate { story_id, page_number } => self.regenerate(&story_id, page_number),
        }
    }

    fn retry(&self, task_id: &TaskId) -> Result<TaskId, PipelineError> {
        let snapshot = self.queue.lock().retry(task_id)?.clone();
        self.tasks.put_task(&TaskRecord::from_task(&snapshot))?;
        self.tasks.flush()?;
        if let Some(page_number) = snapshot.page_number() {
            self.set_page_status(&snapshot.story_id, page_number, IllustrationStatus::Pending);
        }
        info!(task_id = %task_id, "Task queued for manual retry");
        Ok(snapshot.id)
    }

    fn regenerate(&self, story_id: &StoryId, page_number: u32) -> Result<TaskId, PipelineError> {
        let (page_id, snapshot) = {
            let mut queue = self.queue.lock();
            let page = self.clear_page_slot(&queue, story_id, page_number)?;
            let id = queue.regenerate(story_id, page_number)?;
            let task = queue.get(&id).cloned().ok_or(PipelineError::TaskNotFound(id))?;
            (page.id, task)
        };
        self.tasks.put_task(&TaskRecord::from_task(&snapshot))?;
        self.tasks.flush()?;

        info!(task_id = %snapshot.id, page_id = %page_id, "Page queued for regeneration");
        self.emit_progress(story_id);
        Ok(snapshot.id)
    }

    /// Empty a page slot ahead of its regeneration task. Runs under the queue lock
    /// so no worker can pick the task before the slot is clear.
    fn clear_page_slot(&self, queue: &TaskQueue, story_id: &StoryId, page_number: u32) -> Result<Page, PipelineError> {
        queue.ensure_regenerable(story_id, page_number)?;
        let mut page = self
            .pages
            .get_page(story_id, page_number)?
            .ok_or_else(|| PipelineError::PageNotFound(PageId::for_page(story_id, page_number)))?;
        page.clear_illustration();
        self.pages.put_page(&page)?;
        Ok(page)
    }

    /// Queue every degraded page of a story for regeneration. Pages whose task is
    /// mid-flight are skipped.
    pub fn regenerate_degraded(&self, story_id: &StoryId) -> Result<Vec<TaskId>, PipelineError> {
        let degraded: Vec<u32> = self
            .pages
            .list_pages(story_id)?
            .into_iter()
            .filter(|p| p.degraded)
            .map(|p| p.page_number)
            .collect();
        let tasks: Vec<IllustrationTask> = {
            let mut queue = self.queue.lock();
            let mut tasks = Vec::new();
            for page_number in degraded {
                if let Err(e) = queue.ensure_regenerable(story_id, page_number) {
                    debug!(story_id = %story_id, page_number, error = %e, "Skipping degraded page");
                    continue;
                }
                self.clear_page_slot(&queue, story_id, page_number)?;
                let id = queue.regenerate(story_id, page_number)?;
                tasks.extend(queue.get(&id).cloned());
            }
            tasks
        };
        for task in &tasks {
            self.tasks.put_task(&TaskRecord::from_task(task))?;
        }
        self.tasks.flush()?;
        Ok(tasks.into_iter().map(|t| t.id).collect())
    }

    /// Drop abandoned tasks from the queue and the durable store.
    pub fn prune_abandoned(&self) -> Result<Vec<TaskId>, PipelineError> {
        let pruned = self.queue.lock().prune_abandoned();
        for id in &pruned {
            self.tasks.remove_task(id)?;
        }
        self.tasks.flush()?;
        Ok(pruned)
    }
}
