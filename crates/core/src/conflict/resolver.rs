//! Conflict resolution actions.
//!
//! The [`ConflictResolver`] turns a named [`Resolution`] into the content a
//! conflicting path gets in the merge, and overlays every resolution onto the
//! pending manifest once all conflicts have one.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::detector::{Conflict, ConflictState};
use crate::content::ContentStore;
use crate::errors::{CoreResult, StateConflictError, StructuralError};
use crate::models::{ContentHash, Manifest};

/// Named resolution strategies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "choice", content = "content", rename_all = "snake_case")]
pub enum Resolution {
    /// Keep the source branch's version.
    AcceptSource,
    /// Keep the target branch's version.
    AcceptTarget,
    /// Revert to the common ancestor's version.
    AcceptBase,
    /// Use arbitrary content already present in the content store.
    AcceptContent(ContentHash),
    /// Drop the path from the merge.
    Delete,
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AcceptSource => write!(f, "accept_source"),
            Self::AcceptTarget => write!(f, "accept_target"),
            Self::AcceptBase => write!(f, "accept_base"),
            Self::AcceptContent(hash) => write!(f, "accept_content({})", hash.short()),
            Self::Delete => write!(f, "delete"),
        }
    }
}

/// Stateless conflict resolution operations.
pub struct ConflictResolver;

impl ConflictResolver {
    /// Get the content that should be used for `conflict` under `resolution`.
    ///
    /// `Ok(None)` means the path is deleted in the merge. Picking a side with
    /// no content is an error rather than an implicit deletion, and explicit
    /// content must already be in `store`.
    pub fn resolved_content(
        resolution: &Resolution,
        conflict: &Conflict,
        store: &dyn ContentStore,
    ) -> CoreResult<Option<ContentHash>> {
        let side = |content: &Option<ContentHash>, name: &str| {
            content.clone().map(Some).ok_or_else(|| StructuralError::AbsentSide {
                path: conflict.path.clone(),
                side: name.to_string(),
            })
        };

        let content = match resolution {
            Resolution::AcceptSource => side(&conflict.source, "source")?,
            Resolution::AcceptTarget => side(&conflict.target, "target")?,
            Resolution::AcceptBase => side(&conflict.base, "base")?,
            Resolution::AcceptContent(hash) => {
                if !store.contains(hash)? {
                    return Err(StructuralError::UnknownContent(hash.clone()).into());
                }
                Some(hash.clone())
            }
            Resolution::Delete => None,
        };
        debug!(path = %conflict.path, %resolution, "resolution content chosen");
        Ok(content)
    }

    /// Overlay every conflict's resolution onto `pending`.
    ///
    /// Fails with `UnresolvedConflicts` listing every unresolved path; an
    /// unresolved conflict is never defaulted to one side.
    pub fn apply(
        pending: &Manifest,
        conflicts: &[Conflict],
    ) -> Result<Manifest, StateConflictError> {
        let unresolved: Vec<String> = conflicts
            .iter()
            .filter(|c| !c.is_resolved())
            .map(|c| c.path.clone())
            .collect();
        if !unresolved.is_empty() {
            return Err(StateConflictError::UnresolvedConflicts { paths: unresolved });
        }

        let mut manifest = pending.clone();
        for conflict in conflicts {
            if let ConflictState::Resolved { content, .. } = &conflict.state {
                match content {
                    Some(hash) => {
                        manifest.insert(conflict.path.clone(), hash.clone());
                    }
                    None => {
                        manifest.remove(&conflict.path);
                    }
                }
            }
        }
        info!(
            files = manifest.len(),
            resolved = conflicts.len(),
            "resolutions applied"
        );
        Ok(manifest)
    }
}
