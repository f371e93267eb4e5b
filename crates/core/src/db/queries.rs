//! Typed query helpers for every table in the MergeFlow database.
//!
//! Writers are free functions over a `&Connection` so the engine can group
//! several of them inside one [`Database::transaction`]. Readers live on
//! [`Database`] and are used to rebuild in-memory state at startup.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection};
use tracing::debug;

use super::Database;
use crate::errors::DatabaseError;
use crate::history::Commit;
use crate::merge_request::MergeRequest;
use crate::models::{
    Branch, BranchId, CommitId, ContentHash, FileVersion, FileVersionId, Manifest,
    MergeRequestId, Project, ProjectId,
};

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

/// A row from the `audit_log` table.
#[derive(Debug, Clone)]
pub struct AuditLogEntry {
    pub id: i64,
    pub action: String,
    pub project_id: Option<String>,
    pub merge_request_id: Option<String>,
    pub commit_id: Option<String>,
    pub actor: Option<String>,
    pub details: Option<String>,
    pub created_at: String,
}

/// An audit event to record.
#[derive(Debug, Clone, Default)]
pub struct AuditRecord {
    pub action: String,
    pub project_id: Option<ProjectId>,
    pub merge_request_id: Option<MergeRequestId>,
    pub commit_id: Option<CommitId>,
    pub actor: Option<String>,
    pub details: Option<String>,
}

impl AuditRecord {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            ..Default::default()
        }
    }

    pub fn project(mut self, id: ProjectId) -> Self {
        self.project_id = Some(id);
        self
    }

    pub fn merge_request(mut self, id: MergeRequestId) -> Self {
        self.merge_request_id = Some(id);
        self
    }

    pub fn commit(mut self, id: &CommitId) -> Self {
        self.commit_id = Some(id.clone());
        self
    }

    pub fn actor(mut self, actor: &str) -> Self {
        self.actor = Some(actor.to_string());
        self
    }

    pub fn details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Writers
// ---------------------------------------------------------------------------

pub fn insert_project(conn: &Connection, project: &Project) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO projects (id, name, description, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![
            project.id.to_string(),
            project.name,
            project.description,
            timestamp(&project.created_at)
        ],
    )?;
    debug!(project = %project.id, name = %project.name, "inserted project");
    Ok(())
}

/// Insert a commit; re-inserting an existing id is ignored. Returns whether
/// a row was written.
pub fn insert_commit(conn: &Connection, commit: &Commit) -> Result<bool, DatabaseError> {
    let parents = serde_json::to_string(&commit.parents)?;
    let manifest = serde_json::to_string(&commit.manifest)?;
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO commits (id, project_id, parents, author, message, timestamp, manifest)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            commit.id.as_str(),
            commit.project_id.to_string(),
            parents,
            commit.author,
            commit.message,
            timestamp(&commit.timestamp),
            manifest
        ],
    )?;
    debug!(commit = %commit.id.short(), inserted = inserted > 0, "inserted commit");
    Ok(inserted > 0)
}

pub fn insert_branch(conn: &Connection, branch: &Branch) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO branches (id, project_id, name, tip, version, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            branch.id.to_string(),
            branch.project_id.to_string(),
            branch.name,
            branch.tip.as_str(),
            branch.version as i64,
            timestamp(&branch.created_at)
        ],
    )?;
    debug!(branch = %branch.id, name = %branch.name, "inserted branch");
    Ok(())
}

/// Move a branch tip, guarded by its version column.
///
/// Fails with [`DatabaseError::VersionConflict`] when the stored version is
/// no longer `expected_version`.
pub fn update_branch_tip(
    conn: &Connection,
    branch: BranchId,
    expected_version: u64,
    tip: &CommitId,
) -> Result<(), DatabaseError> {
    let changed = conn.execute(
        "UPDATE branches SET tip = ?1, version = version + 1 WHERE id = ?2 AND version = ?3",
        params![tip.as_str(), branch.to_string(), expected_version as i64],
    )?;
    if changed == 0 {
        return Err(DatabaseError::VersionConflict {
            branch: branch.to_string(),
            expected: expected_version,
        });
    }
    debug!(branch = %branch, tip = %tip.short(), "updated branch tip");
    Ok(())
}

pub fn insert_file_version(conn: &Connection, version: &FileVersion) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO file_versions (id, path, content_hash, size) VALUES (?1, ?2, ?3, ?4)",
        params![
            version.id.as_str(),
            version.path,
            version.content_hash.as_str(),
            version.size as i64
        ],
    )?;
    Ok(())
}

/// Insert or replace the stored document of a merge request.
pub fn upsert_merge_request(conn: &Connection, mr: &MergeRequest) -> Result<(), DatabaseError> {
    let data = serde_json::to_string(mr)?;
    conn.execute(
        "INSERT INTO merge_requests
             (id, project_id, source_branch, target_branch, status, data, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(id) DO UPDATE SET
             status = excluded.status, data = excluded.data, updated_at = excluded.updated_at",
        params![
            mr.id.to_string(),
            mr.project_id.to_string(),
            mr.source_branch.to_string(),
            mr.target_branch.to_string(),
            mr.status.name(),
            data,
            timestamp(&mr.created_at),
            timestamp(&mr.updated_at)
        ],
    )?;
    debug!(merge_request = %mr.id, status = %mr.status, "stored merge request");
    Ok(())
}

/// Insert an audit-log entry.
pub fn insert_audit_log(conn: &Connection, record: &AuditRecord) -> Result<i64, DatabaseError> {
    conn.execute(
        "INSERT INTO audit_log (action, project_id, merge_request_id, commit_id, actor, details, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            record.action,
            record.project_id.map(|id| id.to_string()),
            record.merge_request_id.map(|id| id.to_string()),
            record.commit_id.as_ref().map(|id| id.as_str().to_string()),
            record.actor,
            record.details,
            timestamp(&Utc::now())
        ],
    )?;
    let id = conn.last_insert_rowid();
    debug!(id, action = %record.action, "inserted audit_log entry");
    Ok(id)
}

// ---------------------------------------------------------------------------
// Readers
// ---------------------------------------------------------------------------

impl Database {
    /// All projects, in insertion order.
    pub fn load_projects(&self) -> Result<Vec<Project>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare("SELECT id, name, description, created_at FROM projects ORDER BY rowid")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(id, name, description, created_at)| {
                Ok(Project {
                    id: ProjectId::parse(&id).map_err(|e| corrupt("project", &id, e))?,
                    created_at: parse_timestamp("project", &id, &created_at)?,
                    name,
                    description,
                })
            })
            .collect()
    }

    /// All commits, in insertion order (parents always precede children).
    ///
    /// Every commit's id is re-derived from its record; a mismatch is
    /// reported as [`DatabaseError::Corrupt`].
    pub fn load_commits(&self) -> Result<Vec<Commit>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, project_id, parents, author, message, timestamp, manifest
             FROM commits ORDER BY rowid",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut commits = Vec::with_capacity(rows.len());
        for (id, project_id, parents, author, message, ts, manifest) in rows {
            let parents: Vec<CommitId> = serde_json::from_str(&parents)?;
            let manifest: Manifest = serde_json::from_str(&manifest)?;
            let commit = Commit {
                id: CommitId::parse(&id).map_err(|e| corrupt("commit", &id, e))?,
                project_id: ProjectId::parse(&project_id).map_err(|e| corrupt("commit", &id, e))?,
                parents,
                author,
                message,
                timestamp: parse_timestamp("commit", &id, &ts)?,
                manifest,
            };
            if !commit.verify_id() {
                return Err(corrupt("commit", &id, "id does not match record"));
            }
            commits.push(commit);
        }
        Ok(commits)
    }

    /// All branches, in insertion order.
    pub fn load_branches(&self) -> Result<Vec<Branch>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, project_id, name, tip, version, created_at FROM branches ORDER BY rowid",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(id, project_id, name, tip, version, created_at)| {
                Ok(Branch {
                    id: BranchId::parse(&id).map_err(|e| corrupt("branch", &id, e))?,
                    project_id: ProjectId::parse(&project_id)
                        .map_err(|e| corrupt("branch", &id, e))?,
                    tip: CommitId::parse(&tip).map_err(|e| corrupt("branch", &id, e))?,
                    version: u64::try_from(version).map_err(|e| corrupt("branch", &id, e))?,
                    created_at: parse_timestamp("branch", &id, &created_at)?,
                    name,
                })
            })
            .collect()
    }

    /// Stored version counter of one branch.
    pub fn branch_version(&self, branch: BranchId) -> Result<u64, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT version FROM branches WHERE id = ?1")?;
        let mut rows = stmt.query_map(params![branch.to_string()], |row| row.get::<_, i64>(0))?;
        match rows.next() {
            Some(Ok(version)) => {
                u64::try_from(version).map_err(|e| corrupt("branch", &branch.to_string(), e))
            }
            Some(Err(e)) => Err(e.into()),
            None => Err(DatabaseError::NotFound {
                entity: "branch".into(),
                id: branch.to_string(),
            }),
        }
    }

    pub fn load_file_versions(&self) -> Result<Vec<FileVersion>, DatabaseError> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT id, path, content_hash, size FROM file_versions ORDER BY rowid")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(id, path, content_hash, size)| {
                Ok(FileVersion {
                    id: FileVersionId::parse(&id).map_err(|e| corrupt("file_version", &id, e))?,
                    content_hash: ContentHash::parse(&content_hash)
                        .map_err(|e| corrupt("file_version", &id, e))?,
                    size: u64::try_from(size).map_err(|e| corrupt("file_version", &id, e))?,
                    path,
                })
            })
            .collect()
    }

    /// All merge requests, in creation order.
    pub fn load_merge_requests(&self) -> Result<Vec<MergeRequest>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT data FROM merge_requests ORDER BY rowid")?;
        let documents = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        documents
            .iter()
            .map(|data| serde_json::from_str(data).map_err(DatabaseError::from))
            .collect()
    }

    /// List recent audit-log entries, newest first.
    pub fn list_audit_log(&self, limit: u32) -> Result<Vec<AuditLogEntry>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, action, project_id, merge_request_id, commit_id, actor, details, created_at
             FROM audit_log ORDER BY id DESC LIMIT ?1",
        )?;
        let entries = stmt
            .query_map(params![limit], |row| {
                Ok(AuditLogEntry {
                    id: row.get(0)?,
                    action: row.get(1)?,
                    project_id: row.get(2)?,
                    merge_request_id: row.get(3)?,
                    commit_id: row.get(4)?,
                    actor: row.get(5)?,
                    details: row.get(6)?,
                    created_at: row.get(7)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// Count total audit-log entries.
    pub fn count_audit_log(&self) -> Result<i64, DatabaseError> {
        let conn = self.conn();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM audit_log", [], |row| row.get(0))?;
        Ok(count)
    }
}

/// Timestamps are stored with nanosecond precision so commit ids can be
/// re-derived after a reload.
fn timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_timestamp(entity: &str, id: &str, s: &str) -> Result<DateTime<Utc>, DatabaseError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| corrupt(entity, id, e))
}

fn corrupt(entity: &str, id: &str, detail: impl ToString) -> DatabaseError {
    DatabaseError::Corrupt {
        entity: entity.to_string(),
        id: id.to_string(),
        detail: detail.to_string(),
    }
}
