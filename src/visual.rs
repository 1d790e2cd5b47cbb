//! Visual consistency model
//!
//! The style guide and element descriptions a story is illustrated against, the
//! collection-wide context shared by sibling stories, and the per-page visual plan
//! supplied by story structuring.

pub mod collection;
pub mod guide;
pub mod plan;

pub use collection::CollectionVisualContext;
pub use guide::VisualGuide;
pub use plan::{page_prompt, PageVisualPlan, PromptInputs};
