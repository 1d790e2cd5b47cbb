//! Shared fixtures for integration tests: a scripted provider, story builders and
//! an engine harness backed by a temporary sled store.

use async_trait::async_trait;
use parking_lot::Mutex;
use picturebook::engine::{GenerationConfig, GenerationEngine};
use picturebook::error::{PipelineError, StorageError};
use picturebook::provider::{ImageProvider, ImageRequest, ImageResponse};
use picturebook::references::ReferencesConfig;
use picturebook::store::{PageStore, SledStore, TaskRecord, TaskRecordStore};
use picturebook::story::{PageInput, StoryInput};
use picturebook::types::{StoryId, TaskId};
use picturebook::visual::PageVisualPlan;
use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::Semaphore;

/// Prefix of every reference-sheet prompt.
pub const REFERENCE_PROMPT: &str = "Character reference sheet";

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub prompt: String,
    pub reference_labels: Vec<String>,
}

/// In-memory provider that replays scripted failures before succeeding.
///
/// Prompts containing a fragment registered with [`ScriptedProvider::always_fail`]
/// fail on every call.
#[derive(Default)]
pub struct ScriptedProvider {
    script: Mutex<VecDeque<PipelineError>>,
    always_fail: Mutex<Vec<String>>,
    calls: Mutex<Vec<RecordedCall>>,
    gate: Mutex<Option<Arc<Semaphore>>>,
}

impl ScriptedProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the next `count` calls with `error`.
    pub fn fail_next(&self, count: usize, error: PipelineError) {
        let mut script = self.script.lock();
        for _ in 0..count {
            script.push_back(error.clone());
        }
    }

    pub fn always_fail(&self, prompt_fragment: &str) {
        self.always_fail.lock().push(prompt_fragment.to_string());
    }

    /// Block every later call until the returned semaphore hands out a permit.
    pub fn hold(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.gate.lock() = Some(Arc::clone(&gate));
        gate
    }

    /// Drop every scripted and permanent failure.
    pub fn recover(&self) {
        self.script.lock().clear();
        self.always_fail.lock().clear();
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn page_calls(&self) -> Vec<RecordedCall> {
        self.calls()
            .into_iter()
            .filter(|c| !c.prompt.starts_with(REFERENCE_PROMPT))
            .collect()
    }
}

#[async_trait]
impl ImageProvider for ScriptedProvider {
    async fn generate(&self, request: ImageRequest) -> Result<ImageResponse, PipelineError> {
        let call_number = {
            let mut calls = self.calls.lock();
            calls.push(RecordedCall {
                prompt: request.prompt.clone(),
                reference_labels: request.reference_images.iter().map(|r| r.label.clone()).collect(),
            });
            calls.len()
        };

        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            gate.acquire().await.unwrap().forget();
        }

        let blocked = self
            .always_fail
            .lock()
            .iter()
            .any(|fragment| request.prompt.contains(fragment.as_str()));
        if blocked {
            return Err(PipelineError::ProviderRequestFailed("scripted outage".to_string()));
        }
        if let Some(error) = self.script.lock().pop_front() {
            return Err(error);
        }
        Ok(ImageResponse {
            bytes: format!("image-{}", call_number).into_bytes(),
            model: "scripted".to_string(),
        })
    }

    fn provider_name(&self) -> &str {
        "scripted"
    }

    fn model_name(&self) -> &str {
        "scripted"
    }
}

/// Task store that can be switched into failing writes.
pub struct FlakyTaskStore {
    inner: Arc<SledStore>,
    failing: AtomicBool,
    writes_left: Mutex<Option<usize>>,
}

impl FlakyTaskStore {
    pub fn new(inner: Arc<SledStore>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            failing: AtomicBool::new(false),
            writes_left: Mutex::new(None),
        })
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Allow `writes` more writes, then fail every later one.
    pub fn fail_after(&self, writes: usize) {
        *self.writes_left.lock() = Some(writes);
    }

    fn check(&self) -> Result<(), StorageError> {
        let exhausted = match self.writes_left.lock().as_mut() {
            Some(0) => true,
            Some(left) => {
                *left -= 1;
                false
            }
            None => false,
        };
        if exhausted || self.failing.load(Ordering::SeqCst) {
            return Err(StorageError::IoError(std::io::Error::new(
                std::io::ErrorKind::Other,
                "disk unavailable",
            )));
        }
        Ok(())
    }
}

impl TaskRecordStore for FlakyTaskStore {
    fn put_task(&self, record: &TaskRecord) -> Result<(), StorageError> {
        self.check()?;
        self.inner.put_task(record)
    }

    fn get_task(&self, id: &TaskId) -> Result<Option<TaskRecord>, StorageError> {
        self.inner.get_task(id)
    }

    fn remove_task(&self, id: &TaskId) -> Result<(), StorageError> {
        self.check()?;
        self.inner.remove_task(id)
    }

    fn list_tasks(&self) -> Result<(Vec<TaskRecord>, Vec<String>), StorageError> {
        self.inner.list_tasks()
    }

    fn flush(&self) -> Result<(), StorageError> {
        TaskRecordStore::flush(self.inner.as_ref())
    }
}

/// Engine settings that keep tests fast.
pub fn fast_config() -> GenerationConfig {
    GenerationConfig {
        max_attempts: 3,
        retry_delay_ms: 1,
        backoff_multiplier: 1.0,
        max_retry_delay_ms: 5,
        rate_limit_ms: 0,
        ..GenerationConfig::default()
    }
}

/// A story of `pages` pages. With characters, every page features Milo.
pub fn story(id: &str, pages: u32, with_characters: bool) -> StoryInput {
    let mut characters = BTreeMap::new();
    if with_characters {
        characters.insert("Milo".to_string(), "a grey kitten with a blue bell".to_string());
    }
    StoryInput {
        id: StoryId::new(id),
        title: format!("Story {}", id),
        collection_id: None,
        style_guide: "soft watercolor".to_string(),
        characters,
        settings: BTreeMap::new(),
        pages: (1..=pages)
            .map(|n| PageInput {
                page_number: n,
                text: format!("Page {} text", n),
                visual_plan: Some(PageVisualPlan {
                    page_number: n,
                    characters: if with_characters { vec!["Milo".to_string()] } else { Vec::new() },
                    ..PageVisualPlan::default()
                }),
                bundled_asset: None,
            })
            .collect(),
    }
}

/// Engine over a sled store in a temporary directory.
pub struct Harness {
    pub engine: GenerationEngine,
    pub store: Arc<SledStore>,
    pub provider: Arc<ScriptedProvider>,
    pub dir: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(fast_config(), ReferencesConfig::default())
    }

    pub fn with_config(config: GenerationConfig, references: ReferencesConfig) -> Self {
        let dir = TempDir::new().unwrap();
        let provider = ScriptedProvider::new();
        let store = SledStore::shared(store_path(&dir)).unwrap();
        let engine = build_engine(&provider, &store, config, references);
        Self {
            engine,
            store,
            provider,
            dir,
        }
    }

    /// Simulate a restart: close the store and open a fresh engine on the same data.
    pub fn reopen(self) -> Self {
        let Harness {
            engine,
            store,
            provider,
            dir,
        } = self;
        let config = engine.config().clone();
        drop(engine);
        drop(store);
        let store = SledStore::shared(store_path(&dir)).unwrap();
        let engine = build_engine(&provider, &store, config, ReferencesConfig::default());
        Self {
            engine,
            store,
            provider,
            dir,
        }
    }

    /// Harness whose task store is `tasks` instead of the sled store itself.
    pub fn with_task_store(tasks: Arc<dyn TaskRecordStore>, store: Arc<SledStore>, dir: TempDir) -> Self {
        let provider = ScriptedProvider::new();
        let pages: Arc<dyn PageStore> = store.clone();
        let engine = GenerationEngine::new(provider.clone(), tasks, pages, fast_config());
        Self {
            engine,
            store,
            provider,
            dir,
        }
    }

    pub fn pages(&self, story_id: &str) -> Vec<picturebook::story::Page> {
        self.store.list_pages(&StoryId::new(story_id)).unwrap()
    }
}

pub fn store_path(dir: &TempDir) -> PathBuf {
    dir.path().join("store")
}

fn build_engine(
    provider: &Arc<ScriptedProvider>,
    store: &Arc<SledStore>,
    config: GenerationConfig,
    references: ReferencesConfig,
) -> GenerationEngine {
    let provider: Arc<dyn ImageProvider> = provider.clone();
    let tasks: Arc<dyn TaskRecordStore> = store.clone();
    let pages: Arc<dyn PageStore> = store.clone();
    GenerationEngine::new(provider, tasks, pages, config).with_references_config(references)
}
