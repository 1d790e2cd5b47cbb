//! Per-page visual plan and page prompt rendering.

use crate::visual::guide::VisualGuide;
use serde::{Deserialize, Serialize};

/// Declarative description of what one page should show. Produced by story
/// structuring and consumed read-only here.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageVisualPlan {
    pub page_number: u32,
    #[serde(default)]
    pub characters: Vec<String>,
    #[serde(default)]
    pub settings: Vec<String>,
    #[serde(default)]
    pub props: Vec<String>,
    #[serde(default)]
    pub visual_focus: String,
    #[serde(default)]
    pub emotional_tone: String,
}

/// Everything a page prompt is built from.
#[derive(Debug, Clone, Copy)]
pub struct PromptInputs<'a> {
    pub guide: &'a VisualGuide,
    pub plan: &'a PageVisualPlan,
    pub page_text: &'a str,
    pub total_pages: u32,
    /// The previous page's image is attached as a continuity hint.
    pub has_previous_page_image: bool,
    /// The global reference image is attached.
    pub has_global_reference: bool,
}

/// Render the provider prompt for one page.
///
/// Output depends only on the inputs; element lists are sorted so that the same
/// page produces the same text across runs.
pub fn page_prompt(inputs: PromptInputs<'_>) -> String {
    let PromptInputs {
        guide,
        plan,
        page_text,
        total_pages,
        has_previous_page_image,
        has_global_reference,
    } = inputs;

    let mut sections = Vec::new();
    sections.push(format!(
        "Illustration for page {} of {} of a children's picture book.",
        plan.page_number, total_pages
    ));
    sections.push(format!("Art style: {}", guide.style_guide.trim()));

    let character_lines = guide.character_lines_for(&plan.characters);
    if !character_lines.is_empty() {
        let mut block = String::from("Characters on this page:");
        for line in character_lines {
            block.push_str("\n- ");
            block.push_str(&line);
        }
        sections.push(block);
    }

    let mut elements: Vec<&String> = plan.settings.iter().chain(plan.props.iter()).collect();
    elements.sort();
    elements.dedup();
    if !elements.is_empty() {
        let mut block = String::from("Setting and props:");
        for name in elements {
            match guide.setting_definitions.get(name) {
                Some(description) => block.push_str(&format!("\n- {}: {}", name, description)),
                None => block.push_str(&format!("\n- {}", name)),
            }
        }
        sections.push(block);
    }

    if !plan.visual_focus.trim().is_empty() {
        sections.push(format!("Focus: {}", plan.visual_focus.trim()));
    }
    if !plan.emotional_tone.trim().is_empty() {
        sections.push(format!("Mood: {}", plan.emotional_tone.trim()));
    }
    if !page_text.trim().is_empty() {
        sections.push(format!("Page text: {}", page_text.trim()));
    }

    if has_global_reference {
        sections.push(
            "Match every character exactly as drawn in the attached reference image.".to_string(),
        );
    }
    if has_previous_page_image {
        sections.push(
            "Keep characters, palette and lighting continuous with the attached previous page."
                .to_string(),
        );
    }
    sections.push("Do not include any text or lettering in the image.".to_string());

    sections.join("\n\n")
}
