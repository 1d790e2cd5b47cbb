//! Picturebook: Consistent, Resumable Story Illustration
//!
//! Turns structured picture-book stories into illustrated pages. A per-story
//! visual guide and shared character references keep characters consistent from
//! page to page, and a durable task queue lets interrupted runs resume where they
//! stopped.

pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod progress;
pub mod provider;
pub mod references;
pub mod scheduler;
pub mod store;
pub mod story;
pub mod task;
pub mod types;
pub mod visual;
