//! Human-facing diff of a conflict's two sides.
//!
//! This is presentation only: conflict classification is decided by hash
//! equality in [`super::detector`], never by the textual diff.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::detector::Conflict;
use crate::content::ContentStore;
use crate::errors::CoreResult;
use crate::models::{ConflictId, ContentHash};

/// Presence and size of one side of a conflict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SideSummary {
    /// `None` when the file is absent on this side.
    pub content: Option<ContentHash>,
    /// Size in bytes; zero when absent.
    pub size: u64,
}

impl SideSummary {
    pub fn exists(&self) -> bool {
        self.content.is_some()
    }
}

/// Source/target comparison for one conflict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictDiff {
    pub conflict_id: ConflictId,
    pub path: String,
    pub base: SideSummary,
    pub source: SideSummary,
    pub target: SideSummary,
    pub content_changed: bool,
    /// Target size minus source size.
    pub size_diff: i64,
    /// Unified diff from source to target, when both exist and are UTF-8.
    pub patch: Option<String>,
}

impl ConflictDiff {
    /// Build the diff, fetching blobs from `store`.
    pub fn build(conflict: &Conflict, store: &dyn ContentStore) -> CoreResult<Self> {
        let base = summarize(&conflict.base, store)?;
        let source = summarize(&conflict.source, store)?;
        let target = summarize(&conflict.target, store)?;

        let patch = match (&conflict.source, &conflict.target) {
            (Some(s), Some(t)) => {
                let source_bytes = store.get(s)?;
                let target_bytes = store.get(t)?;
                match (
                    std::str::from_utf8(&source_bytes),
                    std::str::from_utf8(&target_bytes),
                ) {
                    (Ok(source_text), Ok(target_text)) => {
                        Some(diffy::create_patch(source_text, target_text).to_string())
                    }
                    _ => {
                        debug!(path = %conflict.path, "binary content, skipping text patch");
                        None
                    }
                }
            }
            _ => None,
        };

        Ok(Self {
            conflict_id: conflict.id,
            path: conflict.path.clone(),
            content_changed: conflict.source != conflict.target,
            size_diff: target.size as i64 - source.size as i64,
            base,
            source,
            target,
            patch,
        })
    }
}

fn summarize(content: &Option<ContentHash>, store: &dyn ContentStore) -> CoreResult<SideSummary> {
    let size = match content {
        Some(hash) => store.size(hash)?,
        None => 0,
    };
    Ok(SideSummary {
        content: content.clone(),
        size,
    })
}
