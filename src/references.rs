//! Character Reference Generator
//!
//! Produces the story's canonical reference image before any page that depends on
//! it is illustrated, and folds the reference back into a new [`VisualGuide`].
//! Failures here are advisory: they raise a transient notice and never block
//! page generation.

use crate::error::PipelineError;
use crate::provider::{ImageProvider, ImageRequest};
use crate::story::{Page, StoryRecord};
use crate::store::PageStore;
use crate::types::{now_millis, ImageRef, StoryId};
use crate::visual::guide::character_line;
use crate::visual::{CollectionVisualContext, VisualGuide};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info};

/// Character reference configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferencesConfig {
    /// How long a reference failure notice stays visible (milliseconds)
    #[serde(default = "default_notice_ttl_ms")]
    pub notice_ttl_ms: u64,
    /// Regenerate pages illustrated without references once references succeed
    #[serde(default)]
    pub regenerate_degraded_pages: bool,
}

fn default_notice_ttl_ms() -> u64 {
    5000
}

impl Default for ReferencesConfig {
    fn default() -> Self {
        Self {
            notice_ttl_ms: default_notice_ttl_ms(),
            regenerate_degraded_pages: false,
        }
    }
}

/// Whether a story needs a reference image generated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceRequirement {
    /// Every page already ships with a bundled illustration.
    SkipBundled,
    /// The guide already carries a global reference image.
    AlreadyAvailable,
    /// Nothing to keep consistent.
    NotNeeded,
    Required,
}

impl ReferenceRequirement {
    pub fn needs_generation(self) -> bool {
        self == ReferenceRequirement::Required
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacterReference {
    pub description: String,
    pub image: ImageRef,
}

/// One description resolved to one image reference per character.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReferenceSet {
    characters: BTreeMap<String, CharacterReference>,
}

impl ReferenceSet {
    /// Resolve every character of `guide` against its global reference image.
    /// Empty when the guide has no reference yet.
    pub fn from_guide(guide: &VisualGuide) -> Self {
        let Some(image) = guide.global_reference_image.as_ref() else {
            return Self::default();
        };
        let characters = guide
            .character_definitions
            .iter()
            .map(|(name, description)| {
                (
                    name.clone(),
                    CharacterReference {
                        description: description.clone(),
                        image: image.clone(),
                    },
                )
            })
            .collect();
        Self { characters }
    }

    pub fn get(&self, name: &str) -> Option<&CharacterReference> {
        self.characters.get(name)
    }

    pub fn len(&self) -> usize {
        self.characters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.characters.is_empty()
    }

    /// Prompt lines in sorted name order.
    pub fn prompt_lines(&self) -> Vec<String> {
        self.characters
            .iter()
            .map(|(name, reference)| character_line(name, &reference.description))
            .collect()
    }
}

/// A transient, user-visible message about reference generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceNotice {
    pub message: String,
    pub raised_at_ms: u64,
    pub ttl_ms: u64,
}

impl ReferenceNotice {
    pub fn is_visible(&self, now_ms: u64) -> bool {
        now_ms < self.raised_at_ms.saturating_add(self.ttl_ms)
    }
}

/// Per-story notices with a bounded display window.
#[derive(Debug, Clone, Default)]
pub struct NoticeBoard {
    notices: Arc<RwLock<HashMap<StoryId, ReferenceNotice>>>,
}

impl NoticeBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self, story_id: &StoryId, message: impl Into<String>, ttl_ms: u64) -> ReferenceNotice {
        let notice = ReferenceNotice {
            message: message.into(),
            raised_at_ms: now_millis(),
            ttl_ms,
        };
        self.notices.write().insert(story_id.clone(), notice.clone());
        notice
    }

    /// The story's notice, if still inside its display window. Expired notices
    /// are dropped on read.
    pub fn visible(&self, story_id: &StoryId, now_ms: u64) -> Option<ReferenceNotice> {
        let notice = self.notices.read().get(story_id).cloned()?;
        if notice.is_visible(now_ms) {
            Some(notice)
        } else {
            self.notices.write().remove(story_id);
            None
        }
    }

    pub fn clear(&self, story_id: &StoryId) -> bool {
        self.notices.write().remove(story_id).is_some()
    }
}

/// Generates and caches the global reference image for a story.
pub struct CharacterReferenceGenerator {
    provider: Arc<dyn ImageProvider>,
    store: Arc<dyn PageStore>,
    notices: NoticeBoard,
}

impl CharacterReferenceGenerator {
    pub fn new(provider: Arc<dyn ImageProvider>, store: Arc<dyn PageStore>) -> Self {
        Self {
            provider,
            store,
            notices: NoticeBoard::new(),
        }
    }

    pub fn notices(&self) -> &NoticeBoard {
        &self.notices
    }

    /// Decide whether a reference image must be generated for `story`.
    ///
    /// Collections that require character consistency always need one; standalone
    /// stories need one when `require_global` is set and they define characters.
    pub fn requirement(
        story: &StoryRecord,
        pages: &[Page],
        collection: Option<&CollectionVisualContext>,
        require_global: bool,
    ) -> ReferenceRequirement {
        if !pages.is_empty() && pages.iter().all(Page::has_bundled_illustration) {
            return ReferenceRequirement::SkipBundled;
        }
        if story.visual_guide.has_global_reference() {
            return ReferenceRequirement::AlreadyAvailable;
        }
        let collection_wants = collection
            .map(|c| c.requires_character_consistency)
            .unwrap_or(false);
        let story_wants = require_global && !story.visual_guide.character_definitions.is_empty();
        if collection_wants || story_wants {
            ReferenceRequirement::Required
        } else {
            ReferenceRequirement::NotNeeded
        }
    }

    /// Prompt for the global reference sheet.
    pub fn reference_prompt(guide: &VisualGuide) -> String {
        let mut prompt = format!(
            "Character reference sheet for a children's picture book. Art style: {}.",
            guide.style_guide.trim()
        );
        let lines = guide.character_lines();
        if !lines.is_empty() {
            prompt.push_str("\nShow each character in full, side by side, on a plain background:");
            for line in lines {
                prompt.push_str("\n- ");
                prompt.push_str(&line);
            }
        }
        if !guide.setting_definitions.is_empty() {
            prompt.push_str("\nKey elements:");
            for (name, description) in &guide.setting_definitions {
                prompt.push_str(&format!("\n- {}: {}", name, description));
            }
        }
        prompt
    }

    /// Generate the reference image for `story` and persist the updated guide.
    ///
    /// No-op when the stored guide already has a reference.
    pub async fn generate(&self, story: &StoryRecord) -> Result<(VisualGuide, ReferenceSet), PipelineError> {
        let current = self
            .store
            .get_story(&story.id)?
            .unwrap_or_else(|| story.clone());
        if current.visual_guide.has_global_reference() {
            debug!(story_id = %story.id, "Character references already available");
            let references = ReferenceSet::from_guide(&current.visual_guide);
            return Ok((current.visual_guide, references));
        }

        let prompt = Self::reference_prompt(&current.visual_guide);
        info!(
            story_id = %story.id,
            characters = current.visual_guide.character_definitions.len(),
            provider = self.provider.provider_name(),
            "Generating character references"
        );
        let response = self.provider.generate(ImageRequest::new(prompt)).await?;
        if response.bytes.is_empty() {
            return Err(PipelineError::MalformedResponse("empty reference image".to_string()));
        }
        let image = self.store.put_image(&response.bytes)?;

        let guide = current.visual_guide.with_global_reference(image);
        let updated = StoryRecord {
            visual_guide: guide.clone(),
            references_pending: false,
            ..current
        };
        self.store.put_story(&updated)?;
        self.notices.clear(&story.id);

        let references = ReferenceSet::from_guide(&guide);
        Ok((guide, references))
    }
}
