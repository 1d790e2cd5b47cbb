//! Pipeline events for presentation collaborators.
//!
//! The engine publishes on a broadcast channel; a UI subscribes and renders
//! "preparing character references…" or "N of M illustrations ready" from them.

use crate::story::ProgressSnapshot;
use crate::task::TaskType;
use crate::types::{PageId, StoryId, TaskId};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    ReferencesPreparing {
        story_id: StoryId,
    },
    ReferencesReady {
        story_id: StoryId,
        characters: usize,
    },
    /// Advisory only. Followed by `NoticeCleared` once the display window ends.
    ReferencesFailed {
        story_id: StoryId,
        message: String,
    },
    NoticeCleared {
        story_id: StoryId,
    },
    TaskStarted {
        story_id: StoryId,
        task_id: TaskId,
        task_type: TaskType,
        page_id: Option<PageId>,
        attempt: u32,
    },
    TaskReady {
        story_id: StoryId,
        task_id: TaskId,
        page_id: Option<PageId>,
        /// Failed attempts before this one succeeded.
        attempt_count: u32,
    },
    TaskFailed {
        story_id: StoryId,
        task_id: TaskId,
        page_id: Option<PageId>,
        attempt: u32,
        error: String,
    },
    /// Attempt budget exhausted. The UI may offer a manual retry.
    TaskAbandoned {
        story_id: StoryId,
        task_id: TaskId,
        page_id: Option<PageId>,
        error: String,
    },
    Progress {
        story_id: StoryId,
        ready: usize,
        total: usize,
    },
}

impl PipelineEvent {
    pub fn story_id(&self) -> &StoryId {
        match self {
            PipelineEvent::ReferencesPreparing { story_id }
            | PipelineEvent::ReferencesReady { story_id, .. }
            | PipelineEvent::ReferencesFailed { story_id, .. }
            | PipelineEvent::NoticeCleared { story_id }
            | PipelineEvent::TaskStarted { story_id, .. }
            | PipelineEvent::TaskReady { story_id, .. }
            | PipelineEvent::TaskFailed { story_id, .. }
            | PipelineEvent::TaskAbandoned { story_id, .. }
            | PipelineEvent::Progress { story_id, .. } => story_id,
        }
    }

    pub fn progress(story_id: StoryId, snapshot: ProgressSnapshot) -> Self {
        PipelineEvent::Progress {
            story_id,
            ready: snapshot.ready,
            total: snapshot.total,
        }
    }
}

/// Fan-out of pipeline events. Sending never fails the pipeline: with no
/// subscribers an event is simply dropped.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<PipelineEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: PipelineEvent) {
        let _ = self.sender.send(event);
    }
}
