//! Story-level visual guide.

use crate::types::ImageRef;
use crate::visual::plan::PageVisualPlan;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Art style plus name → description maps for every element that must render
/// consistently across a story.
///
/// A guide is never mutated after it is published. When the global reference image
/// becomes available a new, otherwise identical guide is produced with
/// [`VisualGuide::with_global_reference`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisualGuide {
    pub style_guide: String,
    #[serde(default)]
    pub character_definitions: BTreeMap<String, String>,
    #[serde(default)]
    pub setting_definitions: BTreeMap<String, String>,
    #[serde(default)]
    pub global_reference_image: Option<ImageRef>,
}

impl VisualGuide {
    pub fn new(
        style_guide: impl Into<String>,
        character_definitions: BTreeMap<String, String>,
        setting_definitions: BTreeMap<String, String>,
    ) -> Self {
        Self {
            style_guide: style_guide.into(),
            character_definitions,
            setting_definitions,
            global_reference_image: None,
        }
    }

    /// Copy of this guide with the global reference image folded in.
    pub fn with_global_reference(&self, image: ImageRef) -> Self {
        Self {
            global_reference_image: Some(image),
            ..self.clone()
        }
    }

    pub fn has_global_reference(&self) -> bool {
        self.global_reference_image.is_some()
    }

    pub fn character_description(&self, name: &str) -> Option<&str> {
        self.character_definitions.get(name).map(String::as_str)
    }

    /// Characters a page plan references that this guide does not define.
    pub fn missing_characters(&self, plan: &PageVisualPlan) -> Vec<String> {
        let mut missing: Vec<String> = plan
            .characters
            .iter()
            .filter(|name| !self.character_definitions.contains_key(name.as_str()))
            .cloned()
            .collect();
        missing.sort();
        missing.dedup();
        missing
    }

    /// One line per character in sorted name order:
    /// `"{name} is {description} in the reference image"`.
    pub fn character_lines(&self) -> Vec<String> {
        self.character_definitions
            .iter()
            .map(|(name, description)| character_line(name, description))
            .collect()
    }

    /// Character lines restricted to `names`, still in sorted order. Unknown names
    /// are left out.
    pub fn character_lines_for<'a>(&self, names: impl IntoIterator<Item = &'a String>) -> Vec<String> {
        let mut wanted: Vec<&String> = names.into_iter().collect();
        wanted.sort();
        wanted.dedup();
        wanted
            .into_iter()
            .filter_map(|name| {
                self.character_definitions
                    .get(name)
                    .map(|description| character_line(name, description))
            })
            .collect()
    }

    /// Full textual rendering used in prompts.
    pub fn format_for_prompt(&self) -> String {
        let mut out = format!("Art style: {}", self.style_guide.trim());
        if !self.character_definitions.is_empty() {
            out.push_str("\nCharacters:");
            for line in self.character_lines() {
                out.push_str("\n- ");
                out.push_str(&line);
            }
        }
        if !self.setting_definitions.is_empty() {
            out.push_str("\nSettings and props:");
            for (name, description) in &self.setting_definitions {
                out.push_str(&format!("\n- {}: {}", name, description));
            }
        }
        out
    }
}

pub(crate) fn character_line(name: &str, description: &str) -> String {
    format!("{} is {} in the reference image", name, description.trim())
}
