//! Priority, status and type enums with their per-variant behavior.

use serde::{Deserialize, Serialize};

/// Priority level for illustration tasks. Higher variants are picked first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low = 0,
    Medium = 1,
    High = 2,
    Critical = 3,
}

impl TaskPriority {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskPriority::Low => "low",
            TaskPriority::Medium => "medium",
            TaskPriority::High => "high",
            TaskPriority::Critical => "critical",
        }
    }

    /// Default priority of a page by position: the first content page must be
    /// visible early, the tail of the book can wait.
    pub fn for_page(page_number: u32) -> Self {
        match page_number {
            0 | 1 => TaskPriority::High,
            2 | 3 => TaskPriority::Medium,
            _ => TaskPriority::Low,
        }
    }
}

/// Task lifecycle.
///
/// `pending → generating → ready`, `generating → failed`, `failed → generating`.
/// `failed → abandoned` once the attempt budget is spent. Manual retry and page
/// regeneration move a task back to `pending`; recovery does the same for a task
/// interrupted while `generating`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Generating,
    Ready,
    Failed,
    Abandoned,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Generating => "generating",
            TaskStatus::Ready => "ready",
            TaskStatus::Failed => "failed",
            TaskStatus::Abandoned => "abandoned",
        }
    }

    /// States the scheduler may pick a task up from.
    pub fn is_schedulable(self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Failed)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Ready | TaskStatus::Abandoned)
    }

    pub fn is_success(self) -> bool {
        self == TaskStatus::Ready
    }

    pub fn allowed_transitions(self) -> &'static [TaskStatus] {
        use TaskStatus::*;
        match self {
            Pending => &[Generating],
            Generating => &[Ready, Failed, Pending],
            Failed => &[Generating, Abandoned, Pending],
            Ready => &[Pending],
            Abandoned => &[Pending],
        }
    }

    pub fn can_transition_to(self, to: TaskStatus) -> bool {
        self.allowed_transitions().contains(&to)
    }

    /// Status a page shows while this task drives it.
    pub fn page_status(self) -> IllustrationStatus {
        match self {
            TaskStatus::Pending => IllustrationStatus::Pending,
            TaskStatus::Generating => IllustrationStatus::Generating,
            TaskStatus::Ready => IllustrationStatus::Ready,
            TaskStatus::Failed | TaskStatus::Abandoned => IllustrationStatus::Failed,
        }
    }
}

/// Per-page illustration status exposed to the presentation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IllustrationStatus {
    #[default]
    Pending,
    Generating,
    Ready,
    Failed,
}

impl IllustrationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            IllustrationStatus::Pending => "pending",
            IllustrationStatus::Generating => "generating",
            IllustrationStatus::Ready => "ready",
            IllustrationStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    GlobalReference,
    PageIllustration,
}

impl TaskType {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskType::GlobalReference => "global_reference",
            TaskType::PageIllustration => "page_illustration",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            TaskType::GlobalReference => "Preparing character references",
            TaskType::PageIllustration => "Illustrating page",
        }
    }

    pub fn default_priority(self) -> TaskPriority {
        match self {
            TaskType::GlobalReference => TaskPriority::Critical,
            TaskType::PageIllustration => TaskPriority::Medium,
        }
    }
}
