//! Illustration tasks
//!
//! One unit of generation work: either the story's global reference image or a
//! single page's illustration, with its priority, dependency set and status lifecycle.

pub mod model;
pub mod status;

pub use model::IllustrationTask;
pub use status::{IllustrationStatus, TaskPriority, TaskStatus, TaskType};
