//! Immutable, content-addressed commit records.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::models::{CommitId, Manifest, ProjectId};

/// A snapshot of a project's files plus its position in the history DAG.
///
/// The id is the SHA-256 of the commit's canonical record, so two commits
/// are the same node exactly when every field matches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub id: CommitId,
    pub project_id: ProjectId,
    /// Ordered parents: none for a root, one for a normal commit, two or more
    /// for a merge commit.
    pub parents: Vec<CommitId>,
    pub author: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub manifest: Manifest,
}

/// Everything needed to create a commit, before its id is known.
#[derive(Debug, Clone)]
pub struct CommitDraft {
    pub project_id: ProjectId,
    pub parents: Vec<CommitId>,
    pub author: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub manifest: Manifest,
}

impl CommitDraft {
    /// Start a draft stamped with the current time.
    pub fn new(
        project_id: ProjectId,
        parents: Vec<CommitId>,
        author: impl Into<String>,
        message: impl Into<String>,
        manifest: Manifest,
    ) -> Self {
        Self {
            project_id,
            parents,
            author: author.into(),
            message: message.into(),
            timestamp: Utc::now(),
            manifest,
        }
    }

    pub fn is_merge(&self) -> bool {
        self.parents.len() >= 2
    }

    /// Seal the draft into a commit with its content-derived id.
    pub fn seal(self) -> Commit {
        let id = Commit::compute_id(
            &self.project_id,
            &self.parents,
            &self.author,
            &self.message,
            &self.timestamp,
            &self.manifest,
        );
        Commit {
            id,
            project_id: self.project_id,
            parents: self.parents,
            author: self.author,
            message: self.message,
            timestamp: self.timestamp,
            manifest: self.manifest,
        }
    }
}

impl Commit {
    pub fn is_root(&self) -> bool {
        self.parents.is_empty()
    }

    pub fn is_merge(&self) -> bool {
        self.parents.len() >= 2
    }

    /// Whether the stored id matches the record's content.
    pub fn verify_id(&self) -> bool {
        self.id
            == Self::compute_id(
                &self.project_id,
                &self.parents,
                &self.author,
                &self.message,
                &self.timestamp,
                &self.manifest,
            )
    }

    /// Hash the canonical record. Free-text fields are length-prefixed so no
    /// two distinct records share an encoding.
    fn compute_id(
        project_id: &ProjectId,
        parents: &[CommitId],
        author: &str,
        message: &str,
        timestamp: &DateTime<Utc>,
        manifest: &Manifest,
    ) -> CommitId {
        let mut hasher = Sha256::new();
        hasher.update(format!("project {project_id}\n"));
        for parent in parents {
            hasher.update(format!("parent {parent}\n"));
        }
        hasher.update(format!("author {}:{author}\n", author.len()));
        hasher.update(format!(
            "timestamp {}\n",
            timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true)
        ));
        hasher.update(format!("message {}:{message}\n", message.len()));
        for (path, hash) in manifest {
            hasher.update(format!("file {}:{path} {hash}\n", path.len()));
        }
        CommitId::from_hasher(hasher)
    }
}
