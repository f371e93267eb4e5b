//! Error taxonomy for the MergeFlow core library.
//!
//! Each failure class has its own error type derived with `thiserror`, and a
//! top-level [`CoreError`] enum unifies them for callers that want a single
//! error type. The classes map onto how a caller should react:
//!
//! - [`StructuralError`]: the caller passed inconsistent identifiers or data.
//!   Never retried.
//! - [`StateConflictError`]: a legitimate concurrent-use condition. Carries
//!   enough detail (current tips, versions, unresolved paths) to retry.
//! - [`NotFoundError`]: an unknown project, branch, commit, merge request,
//!   conflict or file version.
//! - [`StorageError`]: the content store failed; retrying is the
//!   collaborator's job.

use thiserror::Error;

use crate::models::{
    BranchId, CommitId, ConflictId, ContentHash, FileVersionId, MergeRequestId, ProjectId,
};

/// Convenience alias used throughout the crate.
pub type CoreResult<T> = Result<T, CoreError>;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for the entire core library.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Structural(#[from] StructuralError),

    #[error(transparent)]
    State(#[from] StateConflictError),

    #[error(transparent)]
    NotFound(#[from] NotFoundError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Coarse classification of a [`CoreError`], used by transport layers to pick
/// a response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Structural,
    StateConflict,
    NotFound,
    Storage,
    Internal,
}

impl CoreError {
    /// The failure class of this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Structural(_) => ErrorClass::Structural,
            Self::State(_) => ErrorClass::StateConflict,
            Self::NotFound(_) => ErrorClass::NotFound,
            Self::Storage(_) => ErrorClass::Storage,
            Self::Database(_) | Self::Config(_) => ErrorClass::Internal,
        }
    }

    /// Whether the caller may retry after refreshing its view of the world.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::State(_) | Self::Storage(StorageError::Unavailable(_))
        )
    }
}

// ---------------------------------------------------------------------------
// Structural errors
// ---------------------------------------------------------------------------

/// The caller passed identifiers or data that are inconsistent with the graph.
#[derive(Debug, Error)]
pub enum StructuralError {
    /// A commit parent does not exist (or belongs to another project).
    #[error("invalid parent commit: {0}")]
    InvalidParent(CommitId),

    /// A non-merge commit must snapshot at least one file.
    #[error("manifest must not be empty for a non-merge commit")]
    EmptyManifest,

    /// The path is not part of the merge request's conflict set.
    #[error("path '{path}' is not a conflict of merge request {merge_request}")]
    UnknownPath {
        merge_request: MergeRequestId,
        path: String,
    },

    /// The two tips share no common ancestor.
    #[error("unrelated histories: {source_tip} and {target_tip} share no common ancestor")]
    UnrelatedHistories {
        source_tip: CommitId,
        target_tip: CommitId,
    },

    /// Source and target of a merge request are the same branch.
    #[error("source and target are the same branch: {0}")]
    SameBranch(BranchId),

    /// Source and target branches belong to different projects.
    #[error("branches belong to different projects ({source_project} vs {target_project})")]
    CrossProject {
        source_project: ProjectId,
        target_project: ProjectId,
    },

    /// A branch with this name already exists in the project.
    #[error("branch '{name}' already exists in project {project}")]
    BranchExists { project: ProjectId, name: String },

    /// A resolution referenced content the content store does not hold.
    #[error("unknown content: {0}")]
    UnknownContent(ContentHash),

    /// A resolution picked a side that has no content for the path.
    #[error("{side} side has no content for '{path}'; resolve with an explicit deletion")]
    AbsentSide { path: String, side: String },

    /// A file path is malformed or not present where required.
    #[error("invalid path '{path}': {detail}")]
    InvalidPath { path: String, detail: String },

    /// Any other malformed argument (empty names, bad identifiers).
    #[error("invalid value for '{field}': {detail}")]
    InvalidArgument { field: String, detail: String },
}

// ---------------------------------------------------------------------------
// State conflict errors
// ---------------------------------------------------------------------------

/// A legitimate concurrent-use condition the caller can react to.
#[derive(Debug, Error)]
pub enum StateConflictError {
    /// The proposed tip does not descend from the branch's current tip.
    #[error("commit {proposed} does not descend from {current}, the tip of branch {branch}")]
    NotDescendant {
        branch: BranchId,
        current: CommitId,
        proposed: CommitId,
    },

    /// An optimistic tip update raced with another writer.
    #[error("branch {branch} moved: tip is now {current} at version {version}")]
    StaleTip {
        branch: BranchId,
        current: CommitId,
        version: u64,
    },

    /// A branch tip advanced after the merge request's conflicts were computed.
    #[error(
        "merge request {merge_request} is stale: source tip is {source_tip}, target tip is {target_tip}"
    )]
    StaleBase {
        merge_request: MergeRequestId,
        source_tip: CommitId,
        target_tip: CommitId,
    },

    /// The merge request has not collected enough approvals.
    #[error("merge request {merge_request} is not approved ({approvals}/{required} approvals)")]
    NotApproved {
        merge_request: MergeRequestId,
        approvals: usize,
        required: usize,
    },

    /// At least one conflict still needs a manual resolution.
    #[error("unresolved conflicts: {}", paths.join(", "))]
    UnresolvedConflicts { paths: Vec<String> },

    /// The merge request is already merged or closed.
    #[error("merge request {merge_request} is {status}")]
    NotOpenOrApproved {
        merge_request: MergeRequestId,
        status: String,
    },

    /// The source branch has nothing the target does not already contain.
    #[error("no changes: branch {source_branch} is already contained in {target_branch}")]
    NoChanges {
        source_branch: BranchId,
        target_branch: BranchId,
    },
}

// ---------------------------------------------------------------------------
// Not-found errors
// ---------------------------------------------------------------------------

/// An identifier that does not resolve to a known record.
#[derive(Debug, Error)]
pub enum NotFoundError {
    #[error("project not found: {0}")]
    Project(ProjectId),

    #[error("branch not found: {0}")]
    Branch(BranchId),

    #[error("commit not found: {0}")]
    Commit(CommitId),

    #[error("merge request not found: {0}")]
    MergeRequest(MergeRequestId),

    #[error("conflict not found: {0}")]
    Conflict(ConflictId),

    #[error("file version not found: {0}")]
    FileVersion(FileVersionId),
}

// ---------------------------------------------------------------------------
// Storage errors
// ---------------------------------------------------------------------------

/// Errors from the content store collaborator.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The store could not be reached or failed transiently.
    #[error("content store unavailable: {0}")]
    Unavailable(String),

    /// The store answered but does not hold the requested blob.
    #[error("blob missing from content store: {0}")]
    BlobMissing(ContentHash),
}

// ---------------------------------------------------------------------------
// Database errors
// ---------------------------------------------------------------------------

/// Errors from the SQLite persistence layer.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Underlying rusqlite error.
    #[error("database error: {0}")]
    SqliteError(#[from] rusqlite::Error),

    /// A migration failed.
    #[error("database migration failed (version {version}): {detail}")]
    MigrationFailed { version: u32, detail: String },

    /// A record was not found.
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// A branch row was updated by someone else since it was read.
    #[error("branch {branch} version conflict: expected version {expected}")]
    VersionConflict { branch: String, expected: u64 },

    /// A stored row could not be decoded.
    #[error("corrupt {entity} record '{id}': {detail}")]
    Corrupt {
        entity: String,
        id: String,
        detail: String,
    },

    /// JSON (de)serialization of a stored document failed.
    #[error("database serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic I/O error (e.g. file permissions).
    #[error("database I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue { field: String, detail: String },

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_messages() {
        let err = StructuralError::EmptyManifest;
        assert_eq!(
            err.to_string(),
            "manifest must not be empty for a non-merge commit"
        );

        let err = StateConflictError::UnresolvedConflicts {
            paths: vec!["a.txt".into(), "b.txt".into()],
        };
        assert_eq!(err.to_string(), "unresolved conflicts: a.txt, b.txt");

        let err = ConfigError::InvalidValue {
            field: "workflow.approval_threshold".into(),
            detail: "must be at least 1".into(),
        };
        assert!(err.to_string().contains("approval_threshold"));
    }

    #[test]
    fn test_classification() {
        let err: CoreError = StructuralError::EmptyManifest.into();
        assert_eq!(err.class(), ErrorClass::Structural);
        assert!(!err.is_retryable());

        let err: CoreError = StateConflictError::UnresolvedConflicts { paths: vec![] }.into();
        assert_eq!(err.class(), ErrorClass::StateConflict);
        assert!(err.is_retryable());

        let err: CoreError = NotFoundError::Project(ProjectId::new()).into();
        assert_eq!(err.class(), ErrorClass::NotFound);

        let err: CoreError = StorageError::Unavailable("timeout".into()).into();
        assert_eq!(err.class(), ErrorClass::Storage);
        assert!(err.is_retryable());

        let err: CoreError = DatabaseError::NotFound {
            entity: "branch".into(),
            id: "x".into(),
        }
        .into();
        assert_eq!(err.class(), ErrorClass::Internal);
    }
}
