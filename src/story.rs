//! Stories, pages and the per-page illustration slot.

use crate::error::PipelineError;
use crate::task::IllustrationStatus;
use crate::types::{now_millis, CollectionId, ImageRef, PageId, StoryId};
use crate::visual::{CollectionVisualContext, PageVisualPlan, VisualGuide};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Where an embedded illustration came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum IllustrationSource {
    /// Shipped with the app; never regenerated by the pipeline.
    Bundled { asset: String },
    /// Produced by the image provider; bytes live in the image store.
    Generated { cache_key: ImageRef },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Illustration {
    pub source: IllustrationSource,
    pub embedded_at_ms: u64,
}

impl Illustration {
    pub fn generated(cache_key: ImageRef) -> Self {
        Self {
            source: IllustrationSource::Generated { cache_key },
            embedded_at_ms: now_millis(),
        }
    }

    pub fn bundled(asset: impl Into<String>) -> Self {
        Self {
            source: IllustrationSource::Bundled {
                asset: asset.into(),
            },
            embedded_at_ms: now_millis(),
        }
    }

    pub fn is_bundled(&self) -> bool {
        matches!(self.source, IllustrationSource::Bundled { .. })
    }

    pub fn cache_key(&self) -> Option<&ImageRef> {
        match &self.source {
            IllustrationSource::Generated { cache_key } => Some(cache_key),
            IllustrationSource::Bundled { .. } => None,
        }
    }
}

/// One story page. Owns at most one embedded illustration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page {
    pub id: PageId,
    pub story_id: StoryId,
    pub page_number: u32,
    pub text: String,
    pub visual_plan: PageVisualPlan,
    illustration: Option<Illustration>,
    pub illustration_status: IllustrationStatus,
    /// Illustrated without character references; eligible for regeneration once
    /// references become available.
    #[serde(default)]
    pub degraded: bool,
}

impl Page {
    pub fn new(story_id: &StoryId, page_number: u32, text: impl Into<String>, plan: PageVisualPlan) -> Self {
        Self {
            id: PageId::for_page(story_id, page_number),
            story_id: story_id.clone(),
            page_number,
            text: text.into(),
            visual_plan: plan,
            illustration: None,
            illustration_status: IllustrationStatus::Pending,
            degraded: false,
        }
    }

    pub fn illustration(&self) -> Option<&Illustration> {
        self.illustration.as_ref()
    }

    pub fn has_bundled_illustration(&self) -> bool {
        self.illustration.as_ref().map(Illustration::is_bundled).unwrap_or(false)
            && self.illustration_status == IllustrationStatus::Ready
    }

    /// Empty the illustration slot. Returns the previous content.
    pub fn clear_illustration(&mut self) -> Option<Illustration> {
        self.illustration_status = IllustrationStatus::Pending;
        self.degraded = false;
        self.illustration.take()
    }

    /// Write an illustration into an empty slot and mark the page ready.
    ///
    /// Fails if the slot is occupied: a page never holds two live images, so a
    /// replacement must go through [`Page::clear_illustration`] first.
    pub fn embed(&mut self, illustration: Illustration) -> Result<(), PipelineError> {
        if self.illustration.is_some() {
            return Err(PipelineError::EmbedFailed(format!(
                "page {} already holds an illustration",
                self.id
            )));
        }
        self.illustration = Some(illustration);
        self.illustration_status = IllustrationStatus::Ready;
        Ok(())
    }
}

/// Story-level record: everything but the pages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoryRecord {
    pub id: StoryId,
    pub title: String,
    pub collection_id: Option<CollectionId>,
    pub visual_guide: VisualGuide,
    pub total_pages: u32,
    /// Character references were requested and are still missing.
    #[serde(default)]
    pub references_pending: bool,
}

/// Ready / total counts for progress display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub ready: usize,
    pub total: usize,
}

impl ProgressSnapshot {
    pub fn from_pages<'a>(pages: impl IntoIterator<Item = &'a Page>) -> Self {
        let mut snapshot = ProgressSnapshot::default();
        for page in pages {
            snapshot.total += 1;
            if page.illustration_status == IllustrationStatus::Ready {
                snapshot.ready += 1;
            }
        }
        snapshot
    }

    pub fn is_complete(&self) -> bool {
        self.ready == self.total
    }

    pub fn label(&self) -> String {
        format!("{} of {} illustrations ready", self.ready, self.total)
    }
}

/// Story as handed over by story structuring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoryInput {
    pub id: StoryId,
    pub title: String,
    #[serde(default)]
    pub collection_id: Option<CollectionId>,
    pub style_guide: String,
    #[serde(default)]
    pub characters: BTreeMap<String, String>,
    #[serde(default)]
    pub settings: BTreeMap<String, String>,
    pub pages: Vec<PageInput>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageInput {
    pub page_number: u32,
    pub text: String,
    #[serde(default)]
    pub visual_plan: Option<PageVisualPlan>,
    /// Pre-made illustration shipped with the content.
    #[serde(default)]
    pub bundled_asset: Option<String>,
}

impl StoryInput {
    /// Split into a story record and its pages, aligning the guide with the
    /// collection when one is given.
    pub fn into_parts(
        self,
        collection: Option<&CollectionVisualContext>,
    ) -> Result<(StoryRecord, Vec<Page>), PipelineError> {
        if self.pages.is_empty() {
            return Err(PipelineError::ConfigError(format!(
                "story {} has no pages",
                self.id
            )));
        }
        let guide = VisualGuide::new(self.style_guide, self.characters, self.settings);
        let guide = match collection {
            Some(ctx) => ctx.apply_to(&guide),
            None => guide,
        };
        let collection_id = self
            .collection_id
            .or_else(|| collection.map(|c| c.collection_id.clone()));

        let mut pages = Vec::with_capacity(self.pages.len());
        for input in self.pages {
            let plan = input.visual_plan.unwrap_or_else(|| PageVisualPlan {
                page_number: input.page_number,
                ..PageVisualPlan::default()
            });
            let mut page = Page::new(&self.id, input.page_number, input.text, plan);
            if let Some(asset) = input.bundled_asset {
                page.embed(Illustration::bundled(asset))?;
            }
            pages.push(page);
        }
        pages.sort_by_key(|p| p.page_number);

        let record = StoryRecord {
            id: self.id,
            title: self.title,
            collection_id,
            visual_guide: guide,
            total_pages: pages.len() as u32,
            references_pending: false,
        };
        Ok((record, pages))
    }
}
