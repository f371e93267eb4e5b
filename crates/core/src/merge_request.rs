//! Merge request state machine.
//!
//! ```text
//! open ──approve──▶ approved ──merge──▶ merged
//!   │                  │
//!   └──────close───────┴──────────────▶ closed
//! ```
//!
//! `merged` and `closed` are terminal. Every transition is a method on
//! [`MergeRequest`] returning a classified error; the engine calls them while
//! holding the request's mutex.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::conflict::{Conflict, ConflictResolver, ConflictState, ThreeWayMerge};
use crate::errors::{CoreResult, StateConflictError, StructuralError};
use crate::models::{
    Approval, ApprovalId, Branch, BranchId, Comment, CommentId, CommitId, ConflictId,
    ContentHash, Manifest, MergeRequestId, ProjectId,
};

/// Lifecycle state of a merge request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MergeRequestStatus {
    Open,
    Approved,
    Merged {
        commit: CommitId,
        merged_at: DateTime<Utc>,
    },
    Closed {
        closed_at: DateTime<Utc>,
    },
}

impl MergeRequestStatus {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Approved => "approved",
            Self::Merged { .. } => "merged",
            Self::Closed { .. } => "closed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Merged { .. } | Self::Closed { .. })
    }
}

impl fmt::Display for MergeRequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Status filter for listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusFilter {
    Open,
    Approved,
    Merged,
    Closed,
}

impl StatusFilter {
    pub fn matches(&self, status: &MergeRequestStatus) -> bool {
        matches!(
            (self, status),
            (Self::Open, MergeRequestStatus::Open)
                | (Self::Approved, MergeRequestStatus::Approved)
                | (Self::Merged, MergeRequestStatus::Merged { .. })
                | (Self::Closed, MergeRequestStatus::Closed { .. })
        )
    }
}

/// A request to merge a source branch into a target branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeRequest {
    pub id: MergeRequestId,
    pub project_id: ProjectId,
    pub source_branch: BranchId,
    pub target_branch: BranchId,
    pub title: String,
    pub description: String,
    pub author: String,
    /// Merge base the conflict set was computed against.
    pub base: CommitId,
    /// Source tip observed when the conflict set was computed.
    pub source_tip: CommitId,
    /// Target tip observed when the conflict set was computed.
    pub target_tip: CommitId,
    pub status: MergeRequestStatus,
    /// Paths that need a manual choice.
    pub conflicts: BTreeMap<String, Conflict>,
    /// Merged manifest of every non-conflicting path.
    pub pending: Manifest,
    pub approvals: Vec<Approval>,
    pub comments: Vec<Comment>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Title, description and author of a new merge request.
#[derive(Debug, Clone, Default)]
pub struct MergeRequestInfo {
    pub title: String,
    pub description: String,
    pub author: String,
}

impl MergeRequest {
    /// Build an open merge request from a computed three-way merge.
    pub fn new(
        source: &Branch,
        target: &Branch,
        base: CommitId,
        merge: ThreeWayMerge,
        info: MergeRequestInfo,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: MergeRequestId::new(),
            project_id: target.project_id,
            source_branch: source.id,
            target_branch: target.id,
            title: info.title,
            description: info.description,
            author: info.author,
            base,
            source_tip: source.tip.clone(),
            target_tip: target.tip.clone(),
            status: MergeRequestStatus::Open,
            conflicts: merge
                .conflicts
                .into_iter()
                .map(|c| (c.path.clone(), c))
                .collect(),
            pending: merge.pending,
            approvals: Vec::new(),
            comments: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Fail with `NotOpenOrApproved` unless the request is still active.
    pub fn ensure_active(&self) -> Result<(), StateConflictError> {
        if self.status.is_terminal() {
            return Err(StateConflictError::NotOpenOrApproved {
                merge_request: self.id,
                status: self.status.to_string(),
            });
        }
        Ok(())
    }

    pub fn approval_count(&self) -> usize {
        self.approvals.len()
    }

    /// Conflicts in path order.
    pub fn conflict_list(&self) -> Vec<Conflict> {
        self.conflicts.values().cloned().collect()
    }

    pub fn conflict_by_id(&self, id: ConflictId) -> Option<&Conflict> {
        self.conflicts.values().find(|c| c.id == id)
    }

    /// Paths whose conflict has not been resolved, in path order.
    pub fn unresolved_paths(&self) -> Vec<String> {
        self.conflicts
            .values()
            .filter(|c| !c.is_resolved())
            .map(|c| c.path.clone())
            .collect()
    }

    /// Record `approver`'s approval. Repeat approvals by the same approver
    /// are no-ops. Returns whether a new approval was added.
    pub fn approve(&mut self, approver: &str, threshold: usize) -> Result<bool, StateConflictError> {
        self.ensure_active()?;
        if self.approvals.iter().any(|a| a.approver == approver) {
            debug!(merge_request = %self.id, approver, "duplicate approval ignored");
            return Ok(false);
        }

        self.approvals.push(Approval {
            id: ApprovalId::new(),
            merge_request_id: self.id,
            approver: approver.to_string(),
            created_at: Utc::now(),
        });
        if self.status == MergeRequestStatus::Open && self.approvals.len() >= threshold {
            info!(merge_request = %self.id, approvals = self.approvals.len(), "merge request approved");
            self.status = MergeRequestStatus::Approved;
        }
        self.updated_at = Utc::now();
        Ok(true)
    }

    /// Record the chosen content for the conflict at `path`. Resolving an
    /// already-resolved path overwrites the earlier choice.
    pub fn resolve(
        &mut self,
        path: &str,
        content: Option<ContentHash>,
        resolved_by: &str,
        notes: &str,
    ) -> CoreResult<&Conflict> {
        self.ensure_active()?;
        let id = self.id;
        let conflict = self
            .conflicts
            .get_mut(path)
            .ok_or_else(|| StructuralError::UnknownPath {
                merge_request: id,
                path: path.to_string(),
            })?;
        conflict.state = ConflictState::Resolved {
            content,
            resolved_by: resolved_by.to_string(),
            resolved_at: Utc::now(),
            notes: notes.to_string(),
        };
        self.updated_at = Utc::now();
        debug!(merge_request = %id, path, resolved_by, "conflict resolved");
        Ok(conflict)
    }

    /// Append a comment. Comments never affect merge eligibility.
    pub fn add_comment(&mut self, author: &str, content: &str) -> Result<Comment, StateConflictError> {
        self.ensure_active()?;
        let comment = Comment {
            id: CommentId::new(),
            merge_request_id: self.id,
            author: author.to_string(),
            content: content.to_string(),
            created_at: Utc::now(),
        };
        self.comments.push(comment.clone());
        self.updated_at = Utc::now();
        Ok(comment)
    }

    pub fn close(&mut self) -> Result<(), StateConflictError> {
        self.ensure_active()?;
        let now = Utc::now();
        self.status = MergeRequestStatus::Closed { closed_at: now };
        self.updated_at = now;
        info!(merge_request = %self.id, "merge request closed");
        Ok(())
    }

    /// Decide whether the request can merge given the branches' current
    /// tips, returning the materialized manifest if so.
    ///
    /// Checks run in a fixed order: terminal status, staleness of either
    /// tip, unresolved conflicts, then approvals.
    pub fn check_mergeable(
        &self,
        threshold: usize,
        source_tip: &CommitId,
        target_tip: &CommitId,
    ) -> Result<Manifest, StateConflictError> {
        self.ensure_active()?;

        // Conflicts and approvals are only valid for the observed tips.
        if source_tip != &self.source_tip || target_tip != &self.target_tip {
            return Err(StateConflictError::StaleBase {
                merge_request: self.id,
                source_tip: source_tip.clone(),
                target_tip: target_tip.clone(),
            });
        }

        let unresolved = self.unresolved_paths();
        if !unresolved.is_empty() {
            return Err(StateConflictError::UnresolvedConflicts { paths: unresolved });
        }

        if self.status == MergeRequestStatus::Open {
            return Err(StateConflictError::NotApproved {
                merge_request: self.id,
                approvals: self.approvals.len(),
                required: threshold,
            });
        }

        let conflicts: Vec<Conflict> = self.conflict_list();
        ConflictResolver::apply(&self.pending, &conflicts)
    }

    pub fn mark_merged(&mut self, commit: CommitId) {
        let now = Utc::now();
        info!(merge_request = %self.id, commit = %commit.short(), "merge request merged");
        self.status = MergeRequestStatus::Merged {
            commit,
            merged_at: now,
        };
        self.updated_at = now;
    }

    /// Replace the conflict set after either tip moved.
    ///
    /// A resolution survives when its path conflicts again with the same
    /// base/source/target triple; the conflict keeps its id in that case.
    /// Approvals and comments are kept.
    pub fn rebase_onto(
        &mut self,
        base: CommitId,
        source_tip: CommitId,
        target_tip: CommitId,
        merge: ThreeWayMerge,
    ) -> Result<(), StateConflictError> {
        self.ensure_active()?;
        let mut kept = 0usize;
        let mut conflicts = BTreeMap::new();
        for mut conflict in merge.conflicts {
            if let Some(previous) = self.conflicts.get(&conflict.path) {
                if previous.same_versions(&conflict) {
                    conflict.id = previous.id;
                    conflict.state = previous.state.clone();
                    if conflict.is_resolved() {
                        kept += 1;
                    }
                }
            }
            conflicts.insert(conflict.path.clone(), conflict);
        }

        info!(
            merge_request = %self.id,
            base = %base.short(),
            conflicts = conflicts.len(),
            kept_resolutions = kept,
            "merge request refreshed"
        );
        self.base = base;
        self.source_tip = source_tip;
        self.target_tip = target_tip;
        self.conflicts = conflicts;
        self.pending = merge.pending;
        self.updated_at = Utc::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::ConflictDetector;
    use crate::errors::CoreError;
    use crate::history::CommitDraft;

    fn h(content: &str) -> ContentHash {
        ContentHash::of(content.as_bytes())
    }

    fn manifest(entries: &[(&str, &str)]) -> Manifest {
        entries.iter().map(|(p, c)| (p.to_string(), h(c))).collect()
    }

    fn commit_id(tag: &str) -> CommitId {
        CommitDraft::new(ProjectId::new(), vec![], "t", tag, manifest(&[("f", tag)]))
            .seal()
            .id
    }

    fn branch(project: ProjectId, name: &str, tip: &CommitId) -> Branch {
        Branch {
            id: BranchId::new(),
            project_id: project,
            name: name.into(),
            tip: tip.clone(),
            version: 0,
            created_at: Utc::now(),
        }
    }

    /// A request with one conflicting path ("x") and one auto-merged path.
    fn conflicted_request() -> MergeRequest {
        let project = ProjectId::new();
        let base = manifest(&[("x", "0"), ("y", "0")]);
        let source = manifest(&[("x", "s"), ("y", "1")]);
        let target = manifest(&[("x", "t"), ("y", "0")]);
        let merge = ConflictDetector::three_way(&base, &source, &target);
        MergeRequest::new(
            &branch(project, "feature", &commit_id("s")),
            &branch(project, "main", &commit_id("t")),
            commit_id("b"),
            merge,
            MergeRequestInfo {
                title: "Feature".into(),
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_new_request_is_open_with_conflicts() {
        let mr = conflicted_request();
        assert_eq!(mr.status, MergeRequestStatus::Open);
        assert_eq!(mr.unresolved_paths(), vec!["x".to_string()]);
        assert_eq!(mr.pending, manifest(&[("y", "1")]));
    }

    #[test]
    fn test_approval_is_idempotent_per_approver() {
        let mut mr = conflicted_request();
        assert!(mr.approve("alice", 2).unwrap());
        assert!(!mr.approve("alice", 2).unwrap());
        assert_eq!(mr.approval_count(), 1);
        assert_eq!(mr.status, MergeRequestStatus::Open);

        assert!(mr.approve("bob", 2).unwrap());
        assert_eq!(mr.status, MergeRequestStatus::Approved);
    }

    #[test]
    fn test_resolve_unknown_path() {
        let mut mr = conflicted_request();
        let err = mr.resolve("y", Some(h("1")), "alice", "").unwrap_err();
        assert!(matches!(
            err,
            CoreError::Structural(StructuralError::UnknownPath { .. })
        ));
    }

    #[test]
    fn test_resolve_last_write_wins() {
        let mut mr = conflicted_request();
        mr.resolve("x", Some(h("s")), "alice", "").unwrap();
        mr.resolve("x", None, "bob", "drop the old fixture").unwrap();
        match &mr.conflicts["x"].state {
            ConflictState::Resolved {
                content,
                resolved_by,
                notes,
                ..
            } => {
                assert_eq!(content, &None);
                assert_eq!(resolved_by, "bob");
                assert_eq!(notes, "drop the old fixture");
            }
            other => panic!("unexpected state: {other:?}"),
        }
    }

    #[test]
    fn test_check_mergeable_error_order() {
        let mut mr = conflicted_request();
        let (s, t) = (mr.source_tip.clone(), mr.target_tip.clone());
        let moved = commit_id("moved");

        // Staleness wins over unresolved conflicts and missing approvals.
        assert!(matches!(
            mr.check_mergeable(1, &s, &moved),
            Err(StateConflictError::StaleBase { .. })
        ));
        assert!(matches!(
            mr.check_mergeable(1, &moved, &t),
            Err(StateConflictError::StaleBase { .. })
        ));

        assert!(matches!(
            mr.check_mergeable(1, &s, &t),
            Err(StateConflictError::UnresolvedConflicts { .. })
        ));

        mr.resolve("x", Some(h("t")), "alice", "").unwrap();
        assert!(matches!(
            mr.check_mergeable(1, &s, &t),
            Err(StateConflictError::NotApproved { approvals: 0, required: 1, .. })
        ));

        mr.approve("alice", 1).unwrap();
        let merged = mr.check_mergeable(1, &s, &t).unwrap();
        assert_eq!(merged, manifest(&[("x", "t"), ("y", "1")]));
    }

    #[test]
    fn test_terminal_requests_reject_everything() {
        let mut mr = conflicted_request();
        mr.close().unwrap();
        assert!(mr.status.is_terminal());
        assert!(mr.approve("alice", 1).is_err());
        assert!(mr.add_comment("alice", "late").is_err());
        assert!(mr.resolve("x", None, "alice", "").is_err());
        assert!(mr.close().is_err());
        let (s, t) = (mr.source_tip.clone(), mr.target_tip.clone());
        match mr.check_mergeable(1, &s, &t) {
            Err(StateConflictError::NotOpenOrApproved { status, .. }) => {
                assert_eq!(status, "closed")
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_comments_are_ordered() {
        let mut mr = conflicted_request();
        mr.add_comment("alice", "first").unwrap();
        mr.add_comment("bob", "second").unwrap();
        let texts: Vec<&str> = mr.comments.iter().map(|c| c.content.as_str()).collect();
        assert_eq!(texts, vec!["first", "second"]);
    }

    #[test]
    fn test_rebase_keeps_matching_resolutions() {
        let mut mr = conflicted_request();
        mr.resolve("x", Some(h("t")), "alice", "").unwrap();
        mr.approve("alice", 1).unwrap();
        let old_id = mr.conflicts["x"].id;

        // Same conflict on x, plus a new conflict on z.
        let base = manifest(&[("x", "0"), ("z", "0")]);
        let source = manifest(&[("x", "s"), ("z", "s2")]);
        let target = manifest(&[("x", "t"), ("z", "t2")]);
        let merge = ConflictDetector::three_way(&base, &source, &target);
        mr.rebase_onto(commit_id("b2"), commit_id("s2"), commit_id("t2"), merge)
            .unwrap();

        assert_eq!(mr.conflicts["x"].id, old_id);
        assert!(mr.conflicts["x"].is_resolved());
        assert_eq!(mr.unresolved_paths(), vec!["z".to_string()]);
        assert_eq!(mr.status, MergeRequestStatus::Approved);
    }

    #[test]
    fn test_rebase_drops_resolution_when_versions_change() {
        let mut mr = conflicted_request();
        mr.resolve("x", Some(h("t")), "alice", "").unwrap();

        let base = manifest(&[("x", "0")]);
        let source = manifest(&[("x", "s")]);
        let target = manifest(&[("x", "t-new")]);
        let merge = ConflictDetector::three_way(&base, &source, &target);
        mr.rebase_onto(commit_id("b"), commit_id("s"), commit_id("t3"), merge)
            .unwrap();
        assert_eq!(mr.unresolved_paths(), vec!["x".to_string()]);
    }

    #[test]
    fn test_status_serializes_as_tagged_state() {
        let status = MergeRequestStatus::Merged {
            commit: commit_id("m"),
            merged_at: Utc::now(),
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["status"], "merged");
        assert!(json["commit"].is_string());
        assert!(StatusFilter::Merged.matches(&status));
        assert!(!StatusFilter::Open.matches(&status));
    }
}
