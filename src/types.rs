//! Shared identifiers and clock helpers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static TASK_COUNTER: AtomicU64 = AtomicU64::new(1);
static LAST_TICK_MS: AtomicU64 = AtomicU64::new(0);

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Opaque identity of an illustration task. Two task values are the same
    /// task exactly when their ids are equal.
    TaskId
);
string_id!(
    /// Identity of a single story page.
    PageId
);
string_id!(StoryId);
string_id!(CollectionId);

impl TaskId {
    /// Generate a process-unique task id.
    pub fn generate() -> Self {
        let ts = now_millis();
        let pid = std::process::id();
        let seq = TASK_COUNTER.fetch_add(1, Ordering::Relaxed);
        TaskId(format!("task-{ts}-{pid}-{seq}"))
    }
}

impl PageId {
    /// Page ids are derived from the owning story and the page number.
    pub fn for_page(story_id: &StoryId, page_number: u32) -> Self {
        PageId(format!("{}:p{:03}", story_id, page_number))
    }
}

/// Content-addressed reference to an image held by the page store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageRef(String);

impl ImageRef {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Derive the cache key for a blob of image bytes.
    pub fn for_bytes(bytes: &[u8]) -> Self {
        Self(hex::encode(blake3::hash(bytes).as_bytes()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Current time as milliseconds since Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Wall-clock milliseconds, strictly increasing across calls in this process.
///
/// Task timestamps use this so that every status change moves `last_updated_at_ms`
/// forward and creation order is never ambiguous within a priority band.
pub fn tick_millis() -> u64 {
    let now = now_millis();
    let mut last = LAST_TICK_MS.load(Ordering::Relaxed);
    loop {
        let next = now.max(last + 1);
        match LAST_TICK_MS.compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(observed) => last = observed,
        }
    }
}

/// Tick strictly after `previous`, even if the process clock was seeded behind it
/// (records loaded from a store written by a faster clock).
pub fn tick_after(previous: u64) -> u64 {
    let tick = tick_millis();
    if tick > previous {
        return tick;
    }
    LAST_TICK_MS.fetch_max(previous + 1, Ordering::AcqRel);
    tick_millis()
}
