//! Collection-wide visual context shared by sibling stories.

use crate::types::CollectionId;
use crate::visual::guide::VisualGuide;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Consistency contract for every story in one themed collection. Created once
/// when the collection is generated and read-only afterwards.
///
/// Shared character and prop entries are written `"Name: description"`. An entry
/// without a description only pins the name; the story's own description is used.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionVisualContext {
    pub collection_id: CollectionId,
    pub theme: String,
    #[serde(default)]
    pub shared_characters: BTreeSet<String>,
    pub unified_art_style: String,
    #[serde(default)]
    pub developmental_focus: String,
    #[serde(default)]
    pub age_group: String,
    #[serde(default = "default_true")]
    pub requires_character_consistency: bool,
    #[serde(default)]
    pub allows_style_variation: bool,
    #[serde(default)]
    pub shared_props: BTreeSet<String>,
}

fn default_true() -> bool {
    true
}

impl CollectionVisualContext {
    /// Parsed `name → description` pairs from `shared_characters`.
    pub fn shared_character_definitions(&self) -> BTreeMap<String, String> {
        parse_entries(&self.shared_characters)
    }

    pub fn shared_prop_definitions(&self) -> BTreeMap<String, String> {
        parse_entries(&self.shared_props)
    }

    pub fn shares_character(&self, name: &str) -> bool {
        self.shared_character_definitions().contains_key(name)
    }

    /// Align a story's guide with the collection.
    ///
    /// Shared characters override the story's descriptions when consistency is
    /// required, shared props join the setting definitions, and the art style is
    /// replaced by the unified style unless variation is allowed. Returns a new guide.
    pub fn apply_to(&self, guide: &VisualGuide) -> VisualGuide {
        let mut characters = guide.character_definitions.clone();
        for (name, description) in self.shared_character_definitions() {
            if description.is_empty() {
                continue;
            }
            if self.requires_character_consistency || !characters.contains_key(&name) {
                characters.insert(name, description);
            }
        }

        let mut settings = guide.setting_definitions.clone();
        for (name, description) in self.shared_prop_definitions() {
            if !description.is_empty() {
                settings.entry(name).or_insert(description);
            }
        }

        let style_guide = if self.allows_style_variation && !guide.style_guide.trim().is_empty() {
            format!("{} ({})", guide.style_guide.trim(), self.unified_art_style.trim())
        } else {
            self.unified_art_style.clone()
        };

        VisualGuide {
            style_guide,
            character_definitions: characters,
            setting_definitions: settings,
            global_reference_image: guide.global_reference_image.clone(),
        }
    }
}

fn parse_entries(entries: &BTreeSet<String>) -> BTreeMap<String, String> {
    entries
        .iter()
        .filter_map(|entry| {
            let (name, description) = match entry.split_once(':') {
                Some((name, description)) => (name.trim(), description.trim()),
                None => (entry.trim(), ""),
            };
            if name.is_empty() {
                None
            } else {
                Some((name.to_string(), description.to_string()))
            }
        })
        .collect()
}
