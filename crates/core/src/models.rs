//! Domain model types used throughout MergeFlow.
//!
//! Entity identities come in two flavours: random UUIDs for mutable records
//! (projects, branches, merge requests, conflicts, approvals, comments) and
//! SHA-256 hex digests for immutable, content-addressed records (blobs,
//! commits, file versions).

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::errors::StructuralError;

/// A commit's complete file set: path to content hash, ordered by path.
pub type Manifest = BTreeMap<String, ContentHash>;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Generate a fresh random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Parse an identifier from its hyphenated string form.
            pub fn parse(s: &str) -> Result<Self, StructuralError> {
                Uuid::parse_str(s)
                    .map(Self)
                    .map_err(|e| StructuralError::InvalidArgument {
                        field: stringify!($name).into(),
                        detail: e.to_string(),
                    })
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

macro_rules! digest_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap a finished SHA-256 hasher.
            pub(crate) fn from_hasher(hasher: Sha256) -> Self {
                Self(hex::encode(hasher.finalize()))
            }

            /// Parse a 64-character lowercase hex digest.
            pub fn parse(s: &str) -> Result<Self, StructuralError> {
                let valid = s.len() == 64
                    && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
                if !valid {
                    return Err(StructuralError::InvalidArgument {
                        field: stringify!($name).into(),
                        detail: format!("'{s}' is not a sha256 hex digest"),
                    });
                }
                Ok(Self(s.to_string()))
            }

            /// The full hex digest.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Abbreviated form for log lines and messages.
            pub fn short(&self) -> &str {
                &self.0[..12.min(self.0.len())]
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

uuid_id!(
    /// Identity of a [`Project`].
    ProjectId
);
uuid_id!(
    /// Identity of a [`Branch`].
    BranchId
);
uuid_id!(
    /// Identity of a merge request.
    MergeRequestId
);
uuid_id!(
    /// Identity of a single file conflict inside a merge request.
    ConflictId
);
uuid_id!(
    /// Identity of an [`Approval`].
    ApprovalId
);
uuid_id!(
    /// Identity of a [`Comment`].
    CommentId
);

digest_id!(
    /// SHA-256 of a blob's bytes.
    ContentHash
);
digest_id!(
    /// SHA-256 of a commit's canonical record.
    CommitId
);
digest_id!(
    /// SHA-256 of a (path, content hash) pair.
    FileVersionId
);

impl ContentHash {
    /// Hash raw file bytes.
    pub fn of(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self::from_hasher(hasher)
    }
}

// ---------------------------------------------------------------------------
// Projects and branches
// ---------------------------------------------------------------------------

/// A versioned project: a namespace for branches and commits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub name: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

/// Snapshot of a branch pointer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Branch {
    pub id: BranchId,
    pub project_id: ProjectId,
    pub name: String,
    /// Current tip commit.
    pub tip: CommitId,
    /// Bumped on every tip advance; used for optimistic concurrency.
    pub version: u64,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Files
// ---------------------------------------------------------------------------

/// An immutable file snapshot: one path holding one blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileVersion {
    pub id: FileVersionId,
    pub path: String,
    pub content_hash: ContentHash,
    pub size: u64,
}

impl FileVersion {
    /// Build the version record for `content_hash` stored at `path`.
    pub fn new(path: impl Into<String>, content_hash: ContentHash, size: u64) -> Self {
        let path = path.into();
        let id = Self::id_for(&path, &content_hash);
        Self {
            id,
            path,
            content_hash,
            size,
        }
    }

    /// Deterministic identity of a (path, content) pair.
    pub fn id_for(path: &str, content_hash: &ContentHash) -> FileVersionId {
        let mut hasher = Sha256::new();
        hasher.update(path.as_bytes());
        hasher.update([0u8]);
        hasher.update(content_hash.as_str().as_bytes());
        FileVersionId::from_hasher(hasher)
    }
}

/// A file to snapshot in a new commit.
#[derive(Debug, Clone)]
pub struct FileUpload {
    pub path: String,
    pub bytes: Vec<u8>,
}

impl FileUpload {
    pub fn new(path: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            path: path.into(),
            bytes: bytes.into(),
        }
    }
}

/// Reject paths that cannot be stored in a manifest.
pub fn validate_path(path: &str) -> Result<(), StructuralError> {
    let detail = if path.is_empty() {
        Some("path must not be empty")
    } else if path.starts_with('/') {
        Some("path must be relative")
    } else if path.contains('\0') {
        Some("path must not contain NUL bytes")
    } else if path.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..") {
        Some("path must not contain empty, '.' or '..' segments")
    } else {
        None
    };

    match detail {
        Some(detail) => Err(StructuralError::InvalidPath {
            path: path.to_string(),
            detail: detail.to_string(),
        }),
        None => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Review records
// ---------------------------------------------------------------------------

/// One reviewer's approval of a merge request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Approval {
    pub id: ApprovalId,
    pub merge_request_id: MergeRequestId,
    pub approver: String,
    pub created_at: DateTime<Utc>,
}

/// A discussion comment on a merge request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub id: CommentId,
    pub merge_request_id: MergeRequestId,
    pub author: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Offset/limit window over a newest-first commit listing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Page {
    /// Maximum number of entries; `None` uses the configured default.
    pub limit: Option<usize>,
    pub offset: usize,
}
