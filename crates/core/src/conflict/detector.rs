//! Conflict detection logic.
//!
//! Manifests are compared by content hash only: a file either holds the same
//! blob on two sides or it does not. Given a base and two descendant
//! manifests, the detector decides per path whether one side's change can be
//! taken automatically or whether a human has to pick.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::models::{ConflictId, ContentHash, Manifest};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// How one path differs between a base manifest and a side manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Change {
    Added { new: ContentHash },
    Removed { old: ContentHash },
    Modified { old: ContentHash, new: ContentHash },
    Unchanged { hash: ContentHash },
}

impl Change {
    /// Content of the path on the side after the change (`None` = absent).
    pub fn result(&self) -> Option<&ContentHash> {
        match self {
            Self::Added { new } | Self::Modified { new, .. } => Some(new),
            Self::Unchanged { hash } => Some(hash),
            Self::Removed { .. } => None,
        }
    }
}

/// Per-path decision of a three-way merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeOutcome {
    /// Neither side touched the path.
    Unchanged,
    /// Only the source side changed it.
    TakeSource,
    /// Only the target side changed it.
    TakeTarget,
    /// Both sides made the identical change.
    Convergent,
    /// Both sides changed it differently.
    Conflict,
}

impl std::fmt::Display for MergeOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unchanged => write!(f, "unchanged"),
            Self::TakeSource => write!(f, "take_source"),
            Self::TakeTarget => write!(f, "take_target"),
            Self::Convergent => write!(f, "convergent"),
            Self::Conflict => write!(f, "conflict"),
        }
    }
}

/// The three versions of one path and the decision taken for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMerge {
    pub path: String,
    pub base: Option<ContentHash>,
    pub source: Option<ContentHash>,
    pub target: Option<ContentHash>,
    pub outcome: MergeOutcome,
}

/// Resolution state of a conflict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ConflictState {
    Unresolved,
    Resolved {
        /// Chosen content; `None` deletes the path in the merge.
        content: Option<ContentHash>,
        resolved_by: String,
        resolved_at: DateTime<Utc>,
        /// Free-form reviewer notes; empty when none were given.
        #[serde(default)]
        notes: String,
    },
}

/// A path both sides changed differently, awaiting a manual choice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conflict {
    /// Unique conflict ID.
    pub id: ConflictId,
    /// The file path where the conflict occurs.
    pub path: String,
    /// Common-ancestor content (`None` = added on both sides).
    pub base: Option<ContentHash>,
    /// Source-side content (`None` = deleted on the source side).
    pub source: Option<ContentHash>,
    /// Target-side content (`None` = deleted on the target side).
    pub target: Option<ContentHash>,
    pub state: ConflictState,
}

impl Conflict {
    /// Create an unresolved conflict with a fresh id.
    pub fn new(
        path: impl Into<String>,
        base: Option<ContentHash>,
        source: Option<ContentHash>,
        target: Option<ContentHash>,
    ) -> Self {
        Self {
            id: ConflictId::new(),
            path: path.into(),
            base,
            source,
            target,
            state: ConflictState::Unresolved,
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self.state, ConflictState::Resolved { .. })
    }

    /// The chosen content, if resolved.
    pub fn resolution(&self) -> Option<&Option<ContentHash>> {
        match &self.state {
            ConflictState::Resolved { content, .. } => Some(content),
            ConflictState::Unresolved => None,
        }
    }

    /// Whether `other` describes the same three versions of the same path.
    pub fn same_versions(&self, other: &Conflict) -> bool {
        self.path == other.path
            && self.base == other.base
            && self.source == other.source
            && self.target == other.target
    }
}

/// Result of a three-way manifest merge.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreeWayMerge {
    /// Every path of the union of the three manifests, in path order.
    pub files: Vec<FileMerge>,
    /// The merged manifest of every non-conflicting path.
    pub pending: Manifest,
    /// Conflicting paths, in path order.
    pub conflicts: Vec<Conflict>,
}

impl ThreeWayMerge {
    pub fn has_conflicts(&self) -> bool {
        !self.conflicts.is_empty()
    }

    /// Number of paths taken from one side without conflict.
    pub fn auto_merged(&self) -> usize {
        self.files
            .iter()
            .filter(|f| {
                matches!(
                    f.outcome,
                    MergeOutcome::TakeSource | MergeOutcome::TakeTarget | MergeOutcome::Convergent
                )
            })
            .count()
    }
}

// ---------------------------------------------------------------------------
// Detector
// ---------------------------------------------------------------------------

/// Stateless manifest comparator.
pub struct ConflictDetector;

impl ConflictDetector {
    /// Describe how every path of `base` ∪ `side` changed from `base` to `side`.
    pub fn compute_diff(base: &Manifest, side: &Manifest) -> BTreeMap<String, Change> {
        let paths: BTreeSet<&String> = base.keys().chain(side.keys()).collect();
        paths
            .into_iter()
            .filter_map(|path| {
                let change = match (base.get(path), side.get(path)) {
                    (None, Some(new)) => Change::Added { new: new.clone() },
                    (Some(old), None) => Change::Removed { old: old.clone() },
                    (Some(old), Some(new)) if old == new => Change::Unchanged { hash: old.clone() },
                    (Some(old), Some(new)) => Change::Modified {
                        old: old.clone(),
                        new: new.clone(),
                    },
                    (None, None) => return None,
                };
                Some((path.clone(), change))
            })
            .collect()
    }

    /// Merge `source` and `target` against their common `base`.
    ///
    /// Paths are processed in lexicographic order so the conflict list and
    /// the pending manifest are deterministic.
    pub fn three_way(base: &Manifest, source: &Manifest, target: &Manifest) -> ThreeWayMerge {
        let paths: BTreeSet<&String> = base
            .keys()
            .chain(source.keys())
            .chain(target.keys())
            .collect();
        info!(paths = paths.len(), "computing three-way merge");

        let mut merge = ThreeWayMerge::default();
        for path in paths {
            let b = base.get(path);
            let s = source.get(path);
            let t = target.get(path);

            let (outcome, taken) = if s == t {
                let outcome = if s == b {
                    MergeOutcome::Unchanged
                } else {
                    MergeOutcome::Convergent
                };
                (outcome, s)
            } else if s == b {
                (MergeOutcome::TakeTarget, t)
            } else if t == b {
                (MergeOutcome::TakeSource, s)
            } else {
                (MergeOutcome::Conflict, None)
            };

            if outcome == MergeOutcome::Conflict {
                debug!(path = %path, "conflict detected");
                merge
                    .conflicts
                    .push(Conflict::new(path.clone(), b.cloned(), s.cloned(), t.cloned()));
            } else if let Some(hash) = taken {
                merge.pending.insert(path.clone(), hash.clone());
            }

            merge.files.push(FileMerge {
                path: path.clone(),
                base: b.cloned(),
                source: s.cloned(),
                target: t.cloned(),
                outcome,
            });
        }

        info!(
            conflicts = merge.conflicts.len(),
            auto_merged = merge.auto_merged(),
            "three-way merge computed"
        );
        merge
    }
}
