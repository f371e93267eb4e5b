//! MergeFlow core library.
//!
//! This crate provides the versioning and review engine for binary-heavy
//! project files: an immutable commit graph with branches, merge-base
//! discovery, three-way conflict detection and resolution, the merge request
//! workflow, configuration, and optional SQLite persistence.

pub mod config;
pub mod conflict;
pub mod content;
pub mod db;
pub mod engine;
pub mod errors;
pub mod history;
mod locking;
pub mod merge_request;
pub mod models;

// Re-exports for convenience.
pub use config::EngineConfig;
pub use content::{ContentStore, MemoryContentStore};
pub use db::Database;
pub use engine::{CommitRequest, CommitTarget, Engine, OpenMergeRequest};
pub use errors::{CoreError, CoreResult};
pub use history::HistoryGraph;
pub use merge_request::{MergeRequest, MergeRequestStatus};
