//! The MergeFlow engine: one shared handle exposing every operation a
//! transport layer needs.
//!
//! The engine is `Send + Sync` and meant to be shared through an `Arc` by
//! independent sessions. State lives in memory (history graph, projects,
//! merge requests); when a database is configured every mutation is written
//! through inside the same critical section that applies it, so a failed
//! write leaves both sides untouched.
//!
//! Lock order, outermost first: merge request mutex, branch tip mutexes
//! (pairs ordered by branch id), then the graph's internal locks.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

use chrono::Utc;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::conflict::{
    Conflict, ConflictDetector, ConflictDiff, ConflictResolver, Resolution, ThreeWayMerge,
};
use crate::content::ContentStore;
use crate::db::queries::{self, AuditLogEntry, AuditRecord};
use crate::db::Database;
use crate::errors::{
    CoreResult, DatabaseError, NotFoundError, StateConflictError, StructuralError,
};
use crate::history::{lock_tip_pair, BranchEntry, Commit, CommitDraft, HistoryGraph, TipState};
use crate::locking;
use crate::merge_request::{MergeRequest, MergeRequestInfo, StatusFilter};
use crate::models::{
    validate_path, Branch, BranchId, Comment, CommitId, ConflictId, FileUpload, FileVersion,
    FileVersionId, Manifest, MergeRequestId, Page, Project, ProjectId,
};

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

/// Where a new commit goes.
#[derive(Debug, Clone)]
pub enum CommitTarget {
    /// Advance an existing branch. When `expected_tip` is set the commit is
    /// refused with `StaleTip` if the branch has moved since the caller
    /// looked at it.
    Branch {
        branch: BranchId,
        expected_tip: Option<CommitId>,
    },
    /// Create a branch named `name` whose first commit has `parent` as its
    /// only parent (or none, for a project's first commit).
    NewBranch {
        name: String,
        parent: Option<CommitId>,
    },
}

/// Snapshot uploads and removals into a new commit.
#[derive(Debug, Clone)]
pub struct CommitRequest {
    pub project_id: ProjectId,
    pub target: CommitTarget,
    pub author: String,
    pub message: String,
    pub files: Vec<FileUpload>,
    /// Paths of the parent manifest to drop.
    pub removals: Vec<String>,
}

/// Result of [`Engine::create_commit`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatedCommit {
    pub commit: Commit,
    pub branch: Branch,
    pub file_versions: Vec<FileVersion>,
}

/// One page of a branch's history, newest first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitPage {
    pub commits: Vec<Commit>,
    pub offset: usize,
    pub limit: usize,
    pub has_more: bool,
}

/// Parameters of [`Engine::open_merge_request`].
#[derive(Debug, Clone)]
pub struct OpenMergeRequest {
    pub source_branch: BranchId,
    pub target_branch: BranchId,
    pub title: String,
    pub description: String,
    pub author: String,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

type MergeRequestCell = Arc<Mutex<MergeRequest>>;

pub struct Engine {
    config: EngineConfig,
    graph: HistoryGraph,
    projects: RwLock<HashMap<ProjectId, Project>>,
    merge_requests: RwLock<HashMap<MergeRequestId, MergeRequestCell>>,
    conflict_index: RwLock<HashMap<ConflictId, MergeRequestId>>,
    store: Arc<dyn ContentStore>,
    db: Option<Database>,
}

impl Engine {
    /// Create an in-memory engine. `config.database` is ignored and the
    /// config is taken as is; use [`Engine::open`] or
    /// [`EngineConfig::load_and_validate`] for checked settings.
    pub fn new(config: EngineConfig, store: Arc<dyn ContentStore>) -> Self {
        Self {
            config,
            graph: HistoryGraph::new(),
            projects: Default::default(),
            merge_requests: Default::default(),
            conflict_index: Default::default(),
            store,
            db: None,
        }
    }

    /// Create an engine from validated configuration, opening and replaying
    /// the database when `config.database.path` is set.
    pub fn open(config: EngineConfig, store: Arc<dyn ContentStore>) -> CoreResult<Self> {
        config.validate()?;
        match config.database.path.clone() {
            Some(path) => {
                let db = Database::new(&path)?;
                Self::with_database(config, store, db)
            }
            None => {
                info!("no database configured, running in memory");
                Ok(Self::new(config, store))
            }
        }
    }

    /// Create an engine backed by `db`, migrating it and rebuilding all
    /// in-memory state from it.
    pub fn with_database(
        config: EngineConfig,
        store: Arc<dyn ContentStore>,
        db: Database,
    ) -> CoreResult<Self> {
        config.validate()?;
        db.initialize()?;
        let mut engine = Self::new(config, store);
        engine.restore(&db)?;
        engine.db = Some(db);
        Ok(engine)
    }

    fn restore(&mut self, db: &Database) -> CoreResult<()> {
        let projects = db.load_projects()?;
        let commits = db.load_commits()?;
        let branches = db.load_branches()?;
        let file_versions = db.load_file_versions()?;
        let merge_requests = db.load_merge_requests()?;
        info!(
            projects = projects.len(),
            commits = commits.len(),
            branches = branches.len(),
            merge_requests = merge_requests.len(),
            "restoring state from database"
        );

        {
            let mut map = locking::write(&self.projects);
            for project in projects {
                map.insert(project.id, project);
            }
        }
        for commit in commits {
            self.graph.insert_commit(commit);
        }
        for branch in branches {
            self.graph.insert_branch_with(branch, |_| Ok(()))?;
        }
        for version in file_versions {
            self.graph.record_file_version(version);
        }
        for mr in merge_requests {
            self.index_conflicts(&mr);
            locking::write(&self.merge_requests).insert(mr.id, Arc::new(Mutex::new(mr)));
        }
        Ok(())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The underlying history graph, for read-only queries.
    pub fn graph(&self) -> &HistoryGraph {
        &self.graph
    }

    pub fn store(&self) -> &Arc<dyn ContentStore> {
        &self.store
    }

    /// Run `f` in a database transaction; a no-op without a database.
    fn persist<F>(&self, f: F) -> CoreResult<()>
    where
        F: FnOnce(&Connection) -> Result<(), DatabaseError>,
    {
        match &self.db {
            Some(db) => Ok(db.transaction(f)?),
            None => Ok(()),
        }
    }

    /// Recent audit-log entries, newest first. Empty without a database.
    pub fn audit_log(&self, limit: u32) -> CoreResult<Vec<AuditLogEntry>> {
        match &self.db {
            Some(db) => Ok(db.list_audit_log(limit)?),
            None => Ok(Vec::new()),
        }
    }

    // -- projects -----------------------------------------------------------

    pub fn create_project(&self, name: &str, description: &str) -> CoreResult<Project> {
        if name.trim().is_empty() {
            return Err(StructuralError::InvalidArgument {
                field: "project.name".into(),
                detail: "project name must not be empty".into(),
            }
            .into());
        }
        let project = Project {
            id: ProjectId::new(),
            name: name.to_string(),
            description: description.to_string(),
            created_at: Utc::now(),
        };

        let mut projects = locking::write(&self.projects);
        self.persist(|conn| {
            queries::insert_project(conn, &project)?;
            queries::insert_audit_log(
                conn,
                &AuditRecord::new("project_created")
                    .project(project.id)
                    .details(&project.name),
            )?;
            Ok(())
        })?;
        projects.insert(project.id, project.clone());
        info!(project = %project.id, name = %project.name, "project created");
        Ok(project)
    }

    /// All projects, oldest first.
    pub fn list_projects(&self) -> Vec<Project> {
        let mut projects: Vec<Project> = locking::read(&self.projects).values().cloned().collect();
        projects.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.name.cmp(&b.name)));
        projects
    }

    pub fn project(&self, id: ProjectId) -> CoreResult<Project> {
        locking::read(&self.projects)
            .get(&id)
            .cloned()
            .ok_or_else(|| NotFoundError::Project(id).into())
    }

    // -- branches -----------------------------------------------------------

    /// Create a branch at the tip of `from_branch`, or at the tip of the
    /// project's oldest branch when none is given.
    pub fn create_branch(
        &self,
        project_id: ProjectId,
        name: &str,
        from_branch: Option<BranchId>,
    ) -> CoreResult<Branch> {
        let project = self.project(project_id)?;
        let from = match from_branch {
            Some(id) => self.graph.branch(id)?,
            None => self
                .graph
                .branches_of(project.id)
                .into_iter()
                .min_by_key(|b| b.created_at)
                .ok_or_else(|| StructuralError::InvalidArgument {
                    field: "from_branch".into(),
                    detail: "project has no branches yet; create its first commit on a new branch"
                        .into(),
                })?,
        };
        if from.project_id != project.id {
            return Err(StructuralError::CrossProject {
                source_project: from.project_id,
                target_project: project.id,
            }
            .into());
        }

        let branch = Branch {
            id: BranchId::new(),
            project_id: project.id,
            name: name.to_string(),
            tip: from.tip,
            version: 0,
            created_at: Utc::now(),
        };
        self.graph.insert_branch_with(branch, |b| {
            self.persist(|conn| {
                queries::insert_branch(conn, b)?;
                queries::insert_audit_log(
                    conn,
                    &AuditRecord::new("branch_created")
                        .project(b.project_id)
                        .commit(&b.tip)
                        .details(format!("{} from {}", b.name, from.name)),
                )?;
                Ok(())
            })
        })
    }

    /// Branches of a project, ordered by name.
    pub fn branches(&self, project_id: ProjectId) -> CoreResult<Vec<Branch>> {
        self.project(project_id)?;
        Ok(self.graph.branches_of(project_id))
    }

    pub fn branch(&self, id: BranchId) -> CoreResult<Branch> {
        self.graph.branch(id)
    }

    // -- commits ------------------------------------------------------------

    /// Store the uploads, build the new manifest from the parent's and
    /// append the commit, advancing or creating the target branch.
    pub fn create_commit(&self, request: CommitRequest) -> CoreResult<CreatedCommit> {
        let project = self.project(request.project_id)?;
        if request.files.is_empty() && request.removals.is_empty() {
            return Err(StructuralError::InvalidArgument {
                field: "files".into(),
                detail: "a commit must upload or remove at least one file".into(),
            }
            .into());
        }
        for upload in &request.files {
            validate_path(&upload.path)?;
        }

        // Blobs are immutable and content-addressed, so storing them before
        // the branch is locked cannot leave anything half-applied.
        let mut changes = Manifest::new();
        let mut file_versions = Vec::with_capacity(request.files.len());
        for upload in &request.files {
            let hash = self.store.put(&upload.bytes)?;
            file_versions.push(FileVersion::new(
                upload.path.clone(),
                hash.clone(),
                upload.bytes.len() as u64,
            ));
            changes.insert(upload.path.clone(), hash);
        }

        let created = match request.target {
            CommitTarget::Branch {
                branch,
                expected_tip,
            } => self.commit_on_branch(
                &project,
                branch,
                expected_tip.as_ref(),
                &request.author,
                &request.message,
                &changes,
                &request.removals,
                file_versions,
            )?,
            CommitTarget::NewBranch { name, parent } => self.commit_on_new_branch(
                &project,
                &name,
                parent,
                &request.author,
                &request.message,
                &changes,
                &request.removals,
                file_versions,
            )?,
        };

        info!(
            project = %project.id,
            branch = %created.branch.name,
            commit = %created.commit.id.short(),
            files = created.commit.manifest.len(),
            "commit created"
        );
        Ok(created)
    }

    #[allow(clippy::too_many_arguments)]
    fn commit_on_branch(
        &self,
        project: &Project,
        branch_id: BranchId,
        expected_tip: Option<&CommitId>,
        author: &str,
        message: &str,
        changes: &Manifest,
        removals: &[String],
        file_versions: Vec<FileVersion>,
    ) -> CoreResult<CreatedCommit> {
        let entry = self.graph.branch_entry(branch_id)?;
        if entry.project_id() != project.id {
            return Err(StructuralError::CrossProject {
                source_project: project.id,
                target_project: entry.project_id(),
            }
            .into());
        }

        let mut tip = entry.lock_tip();
        if let Some(expected) = expected_tip {
            if expected != &tip.commit {
                return Err(StateConflictError::StaleTip {
                    branch: branch_id,
                    current: tip.commit.clone(),
                    version: tip.version,
                }
                .into());
            }
        }

        let parent = self.graph.commit(&tip.commit)?;
        let manifest = overlay(&parent.manifest, changes, removals)?;
        let draft = CommitDraft::new(
            project.id,
            vec![tip.commit.clone()],
            author,
            message,
            manifest,
        );
        let commit = self.graph.prepare_commit(draft)?;
        self.graph.check_advance(&entry, &tip, &commit)?;

        self.persist(|conn| {
            for version in &file_versions {
                queries::insert_file_version(conn, version)?;
            }
            queries::insert_commit(conn, &commit)?;
            queries::update_branch_tip(conn, branch_id, tip.version, &commit.id)?;
            queries::insert_audit_log(
                conn,
                &AuditRecord::new("commit_created")
                    .project(project.id)
                    .commit(&commit.id)
                    .actor(author)
                    .details(entry.name()),
            )?;
            Ok(())
        })?;

        for version in &file_versions {
            self.graph.record_file_version(version.clone());
        }
        let commit = self.graph.insert_commit(commit);
        tip.advance_to(commit.id.clone());
        debug!(branch = %branch_id, version = tip.version, "branch advanced by commit");

        Ok(CreatedCommit {
            commit: (*commit).clone(),
            branch: entry.snapshot_with(&tip),
            file_versions,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn commit_on_new_branch(
        &self,
        project: &Project,
        name: &str,
        parent: Option<CommitId>,
        author: &str,
        message: &str,
        changes: &Manifest,
        removals: &[String],
        file_versions: Vec<FileVersion>,
    ) -> CoreResult<CreatedCommit> {
        let base = match &parent {
            Some(id) => match self.graph.commit(id) {
                Ok(commit) if commit.project_id == project.id => commit.manifest.clone(),
                _ => return Err(StructuralError::InvalidParent(id.clone()).into()),
            },
            None => Manifest::new(),
        };
        let manifest = overlay(&base, changes, removals)?;
        let draft = CommitDraft::new(
            project.id,
            parent.into_iter().collect(),
            author,
            message,
            manifest,
        );
        let commit = self.graph.prepare_commit(draft)?;

        let branch = Branch {
            id: BranchId::new(),
            project_id: project.id,
            name: name.to_string(),
            tip: commit.id.clone(),
            version: 0,
            created_at: Utc::now(),
        };
        // The commit only becomes visible together with its branch.
        let branch = self.graph.insert_branch_with(branch, |b| {
            self.persist(|conn| {
                for version in &file_versions {
                    queries::insert_file_version(conn, version)?;
                }
                queries::insert_commit(conn, &commit)?;
                queries::insert_branch(conn, b)?;
                queries::insert_audit_log(
                    conn,
                    &AuditRecord::new("commit_created")
                        .project(project.id)
                        .commit(&commit.id)
                        .actor(author)
                        .details(format!("new branch {}", b.name)),
                )?;
                Ok(())
            })?;
            for version in &file_versions {
                self.graph.record_file_version(version.clone());
            }
            self.graph.insert_commit(commit.clone());
            Ok(())
        })?;

        Ok(CreatedCommit {
            commit,
            branch,
            file_versions,
        })
    }

    pub fn commit(&self, id: &CommitId) -> CoreResult<Commit> {
        Ok((*self.graph.commit(id)?).clone())
    }

    /// The downloadable file versions of a commit's manifest, in path order.
    pub fn commit_file_versions(&self, id: &CommitId) -> CoreResult<Vec<FileVersion>> {
        let commit = self.graph.commit(id)?;
        commit
            .manifest
            .iter()
            .map(|(path, hash)| self.graph.file_version(&FileVersion::id_for(path, hash)))
            .collect()
    }

    /// Distinct versions of `path` reachable from `branch`'s tip, newest
    /// first. Empty when the path never existed on the branch.
    pub fn file_history(&self, branch: BranchId, path: &str) -> CoreResult<Vec<FileVersion>> {
        validate_path(path)?;
        let tip = self.graph.branch(branch)?.tip;
        let mut seen = HashSet::new();
        let mut versions = Vec::new();
        for id in self.graph.ancestors_of(&tip)? {
            let commit = self.graph.commit(&id)?;
            if let Some(hash) = commit.manifest.get(path) {
                let version_id = FileVersion::id_for(path, hash);
                if seen.insert(version_id.clone()) {
                    versions.push(self.graph.file_version(&version_id)?);
                }
            }
        }
        debug!(branch = %branch, path, versions = versions.len(), "file history listed");
        Ok(versions)
    }

    /// A page of `branch`'s history in breadth-first ancestor order,
    /// starting at the tip.
    pub fn list_commits(&self, branch: BranchId, page: Page) -> CoreResult<CommitPage> {
        let tip = self.graph.branch(branch)?.tip;
        let limit = self.config.history.page_size(page.limit);

        let mut ids: Vec<CommitId> = self
            .graph
            .ancestors_of(&tip)?
            .skip(page.offset)
            .take(limit + 1)
            .collect();
        let has_more = ids.len() > limit;
        ids.truncate(limit);

        let commits = ids
            .iter()
            .map(|id| self.commit(id))
            .collect::<CoreResult<Vec<_>>>()?;
        Ok(CommitPage {
            commits,
            offset: page.offset,
            limit,
            has_more,
        })
    }

    // -- files --------------------------------------------------------------

    pub fn file_version(&self, id: &FileVersionId) -> CoreResult<FileVersion> {
        self.graph.file_version(id)
    }

    /// Fetch the bytes of a file version from the content store.
    pub fn download(&self, id: &FileVersionId) -> CoreResult<Vec<u8>> {
        let version = self.graph.file_version(id)?;
        debug!(file_version = %id.short(), path = %version.path, "downloading file version");
        Ok(self.store.get(&version.content_hash)?)
    }

    // -- merge requests -----------------------------------------------------

    pub fn open_merge_request(&self, request: OpenMergeRequest) -> CoreResult<MergeRequest> {
        if request.source_branch == request.target_branch {
            return Err(StructuralError::SameBranch(request.source_branch).into());
        }
        let source_entry = self.graph.branch_entry(request.source_branch)?;
        let target_entry = self.graph.branch_entry(request.target_branch)?;
        if source_entry.project_id() != target_entry.project_id() {
            return Err(StructuralError::CrossProject {
                source_project: source_entry.project_id(),
                target_project: target_entry.project_id(),
            }
            .into());
        }

        let (source, target) = {
            let (s, t) = lock_tip_pair(&source_entry, &target_entry);
            (source_entry.snapshot_with(&s), target_entry.snapshot_with(&t))
        };
        let no_changes = || StateConflictError::NoChanges {
            source_branch: source.id,
            target_branch: target.id,
        };
        if source.tip == target.tip {
            return Err(no_changes().into());
        }

        let base = self.merge_base(&source.tip, &target.tip)?;
        if base == source.tip {
            return Err(no_changes().into());
        }
        let merge = self.three_way(&base, &source.tip, &target.tip)?;

        let mr = MergeRequest::new(
            &source,
            &target,
            base,
            merge,
            MergeRequestInfo {
                title: request.title,
                description: request.description,
                author: request.author,
            },
        );

        let mut requests = locking::write(&self.merge_requests);
        self.persist(|conn| {
            queries::upsert_merge_request(conn, &mr)?;
            queries::insert_audit_log(
                conn,
                &AuditRecord::new("merge_request_opened")
                    .project(mr.project_id)
                    .merge_request(mr.id)
                    .actor(&mr.author)
                    .details(format!("{} -> {}", source.name, target.name)),
            )?;
            Ok(())
        })?;
        self.index_conflicts(&mr);
        requests.insert(mr.id, Arc::new(Mutex::new(mr.clone())));

        info!(
            merge_request = %mr.id,
            source = %source.name,
            target = %target.name,
            base = %mr.base.short(),
            conflicts = mr.conflicts.len(),
            "merge request opened"
        );
        Ok(mr)
    }

    pub fn merge_request(&self, id: MergeRequestId) -> CoreResult<MergeRequest> {
        let cell = self.merge_request_cell(id)?;
        let mr = locking::lock(&cell).clone();
        Ok(mr)
    }

    /// Merge requests, optionally filtered, oldest first.
    pub fn list_merge_requests(
        &self,
        project: Option<ProjectId>,
        status: Option<StatusFilter>,
    ) -> Vec<MergeRequest> {
        let cells: Vec<MergeRequestCell> =
            locking::read(&self.merge_requests).values().cloned().collect();
        let mut requests: Vec<MergeRequest> = cells
            .iter()
            .map(|cell| locking::lock(cell).clone())
            .filter(|mr| project.map_or(true, |p| mr.project_id == p))
            .filter(|mr| status.map_or(true, |s| s.matches(&mr.status)))
            .collect();
        requests.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        requests
    }

    /// Conflicts of a merge request, in path order.
    pub fn conflicts(&self, id: MergeRequestId) -> CoreResult<Vec<Conflict>> {
        Ok(self.merge_request(id)?.conflict_list())
    }

    pub fn conflict(&self, id: ConflictId) -> CoreResult<Conflict> {
        let mr = self.merge_request(self.conflict_owner(id)?)?;
        mr.conflict_by_id(id)
            .cloned()
            .ok_or_else(|| NotFoundError::Conflict(id).into())
    }

    /// Size summary and text patch of one conflict.
    pub fn conflict_diff(&self, id: ConflictId) -> CoreResult<ConflictDiff> {
        let conflict = self.conflict(id)?;
        ConflictDiff::build(&conflict, self.store.as_ref())
    }

    /// Record a resolution for the conflict at `path`. Later resolutions of
    /// the same path replace earlier ones.
    pub fn resolve_conflict(
        &self,
        id: MergeRequestId,
        path: &str,
        resolution: Resolution,
        resolved_by: &str,
        notes: &str,
    ) -> CoreResult<Conflict> {
        self.update_merge_request(id, |mr| {
            mr.ensure_active()?;
            let conflict = mr.conflicts.get(path).ok_or_else(|| StructuralError::UnknownPath {
                merge_request: mr.id,
                path: path.to_string(),
            })?;
            let content =
                ConflictResolver::resolved_content(&resolution, conflict, self.store.as_ref())?;
            let resolved = mr.resolve(path, content, resolved_by, notes)?.clone();
            info!(merge_request = %mr.id, path, %resolution, resolved_by, "conflict resolved");
            let audit = AuditRecord::new("conflict_resolved")
                .project(mr.project_id)
                .merge_request(mr.id)
                .actor(resolved_by)
                .details(format!("{path}: {resolution}"));
            Ok((resolved, Some(audit)))
        })
    }

    pub fn resolve_conflict_by_id(
        &self,
        id: ConflictId,
        resolution: Resolution,
        resolved_by: &str,
        notes: &str,
    ) -> CoreResult<Conflict> {
        let owner = self.conflict_owner(id)?;
        let path = {
            let mr = self.merge_request(owner)?;
            match mr.conflict_by_id(id) {
                Some(conflict) => conflict.path.clone(),
                None => return Err(NotFoundError::Conflict(id).into()),
            }
        };
        self.resolve_conflict(owner, &path, resolution, resolved_by, notes)
    }

    /// Approve a merge request. Repeat approvals by one approver are no-ops.
    pub fn add_approval(&self, id: MergeRequestId, approver: &str) -> CoreResult<MergeRequest> {
        let threshold = self.config.workflow.approval_threshold;
        self.update_merge_request(id, |mr| {
            let added = mr.approve(approver, threshold)?;
            let audit = added.then(|| {
                AuditRecord::new("merge_request_approved")
                    .project(mr.project_id)
                    .merge_request(mr.id)
                    .actor(approver)
                    .details(format!("{}/{} approvals", mr.approval_count(), threshold))
            });
            Ok((mr.clone(), audit))
        })
    }

    pub fn add_comment(
        &self,
        id: MergeRequestId,
        author: &str,
        content: &str,
    ) -> CoreResult<Comment> {
        self.update_merge_request(id, |mr| {
            let comment = mr.add_comment(author, content)?;
            Ok((comment, None))
        })
    }

    /// Comments of a merge request, in the order they were added.
    pub fn comments(&self, id: MergeRequestId) -> CoreResult<Vec<Comment>> {
        Ok(self.merge_request(id)?.comments)
    }

    pub fn close_merge_request(&self, id: MergeRequestId, actor: &str) -> CoreResult<MergeRequest> {
        self.update_merge_request(id, |mr| {
            mr.close()?;
            let audit = AuditRecord::new("merge_request_closed")
                .project(mr.project_id)
                .merge_request(mr.id)
                .actor(actor);
            Ok((mr.clone(), Some(audit)))
        })
    }

    /// Recompute the merge base and conflict set against the branches'
    /// current tips. Resolutions whose base/source/target triple did not
    /// change are kept, as are approvals.
    pub fn refresh_merge_request(&self, id: MergeRequestId) -> CoreResult<MergeRequest> {
        let cell = self.merge_request_cell(id)?;
        let mut guard = locking::lock(&cell);
        guard.ensure_active()?;

        let source_entry = self.graph.branch_entry(guard.source_branch)?;
        let target_entry = self.graph.branch_entry(guard.target_branch)?;
        let (source_tip, target_tip) = {
            let (s, t) = lock_tip_pair(&source_entry, &target_entry);
            (s.commit.clone(), t.commit.clone())
        };
        if source_tip == guard.source_tip && target_tip == guard.target_tip {
            debug!(merge_request = %id, "merge request already current");
            return Ok(guard.clone());
        }

        let base = self.merge_base(&source_tip, &target_tip)?;
        let merge = self.three_way(&base, &source_tip, &target_tip)?;
        let mut draft = guard.clone();
        draft.rebase_onto(base, source_tip, target_tip, merge)?;

        self.persist(|conn| {
            queries::upsert_merge_request(conn, &draft)?;
            queries::insert_audit_log(
                conn,
                &AuditRecord::new("merge_request_refreshed")
                    .project(draft.project_id)
                    .merge_request(draft.id)
                    .commit(&draft.base),
            )?;
            Ok(())
        })?;
        self.reindex_conflicts(&guard, &draft);
        *guard = draft;
        Ok(guard.clone())
    }

    /// Merge an approved request with every conflict resolved.
    ///
    /// The staleness check, the merge commit append and the target advance
    /// happen while holding both branch tips, so no commit or other merge on
    /// either branch can interleave.
    pub fn merge(&self, id: MergeRequestId, author: &str) -> CoreResult<Commit> {
        let cell = self.merge_request_cell(id)?;
        let mut guard = locking::lock(&cell);

        let source_entry = self.graph.branch_entry(guard.source_branch)?;
        let target_entry = self.graph.branch_entry(guard.target_branch)?;
        let (source_tip, mut target_tip) = lock_tip_pair(&source_entry, &target_entry);

        let manifest = match guard.check_mergeable(
            self.config.workflow.approval_threshold,
            &source_tip.commit,
            &target_tip.commit,
        ) {
            Ok(manifest) => manifest,
            Err(err) => {
                warn!(merge_request = %id, error = %err, "merge refused");
                return Err(err.into());
            }
        };

        let message = self
            .config
            .workflow
            .merge_message_for(source_entry.name(), target_entry.name());
        let draft = CommitDraft::new(
            guard.project_id,
            vec![target_tip.commit.clone(), source_tip.commit.clone()],
            author,
            message,
            manifest,
        );
        let commit = self.graph.prepare_commit(draft)?;
        self.graph.check_advance(&target_entry, &target_tip, &commit)?;
        let file_versions = self.unrecorded_file_versions(&commit.manifest)?;

        let mut merged = guard.clone();
        merged.mark_merged(commit.id.clone());
        self.persist_merge(
            &merged,
            &commit,
            &file_versions,
            &target_entry,
            &target_tip,
            author,
        )?;

        for version in file_versions {
            self.graph.record_file_version(version);
        }
        let commit = self.graph.insert_commit(commit);
        target_tip.advance_to(commit.id.clone());
        *guard = merged;

        info!(
            merge_request = %id,
            commit = %commit.id.short(),
            target = %target_entry.name(),
            files = commit.manifest.len(),
            "merge completed"
        );
        Ok((*commit).clone())
    }

    fn persist_merge(
        &self,
        merged: &MergeRequest,
        commit: &Commit,
        file_versions: &[FileVersion],
        target: &BranchEntry,
        target_tip: &TipState,
        author: &str,
    ) -> CoreResult<()> {
        self.persist(|conn| {
            for version in file_versions {
                queries::insert_file_version(conn, version)?;
            }
            queries::insert_commit(conn, commit)?;
            queries::update_branch_tip(conn, target.id(), target_tip.version, &commit.id)?;
            queries::upsert_merge_request(conn, merged)?;
            queries::insert_audit_log(
                conn,
                &AuditRecord::new("merge_request_merged")
                    .project(merged.project_id)
                    .merge_request(merged.id)
                    .commit(&commit.id)
                    .actor(author),
            )?;
            Ok(())
        })
    }

    // -- helpers ------------------------------------------------------------

    /// File versions for manifest entries that have none yet. Uploaded files
    /// are recorded at commit time, so this only finds content introduced by
    /// a conflict resolution.
    fn unrecorded_file_versions(&self, manifest: &Manifest) -> CoreResult<Vec<FileVersion>> {
        let mut versions = Vec::new();
        for (path, hash) in manifest {
            if self.graph.has_file_version(&FileVersion::id_for(path, hash)) {
                continue;
            }
            let size = self.store.size(hash)?;
            versions.push(FileVersion::new(path.clone(), hash.clone(), size));
        }
        Ok(versions)
    }

    fn merge_request_cell(&self, id: MergeRequestId) -> CoreResult<MergeRequestCell> {
        locking::read(&self.merge_requests)
            .get(&id)
            .cloned()
            .ok_or_else(|| NotFoundError::MergeRequest(id).into())
    }

    fn conflict_owner(&self, id: ConflictId) -> CoreResult<MergeRequestId> {
        locking::read(&self.conflict_index)
            .get(&id)
            .copied()
            .ok_or_else(|| NotFoundError::Conflict(id).into())
    }

    fn index_conflicts(&self, mr: &MergeRequest) {
        let mut index = locking::write(&self.conflict_index);
        for conflict in mr.conflicts.values() {
            index.insert(conflict.id, mr.id);
        }
    }

    fn reindex_conflicts(&self, before: &MergeRequest, after: &MergeRequest) {
        let mut index = locking::write(&self.conflict_index);
        for conflict in before.conflicts.values() {
            index.remove(&conflict.id);
        }
        for conflict in after.conflicts.values() {
            index.insert(conflict.id, after.id);
        }
    }

    /// Apply `f` to a copy of the merge request under its mutex and, if the
    /// copy changed, write it through before replacing the original.
    fn update_merge_request<T, F>(&self, id: MergeRequestId, f: F) -> CoreResult<T>
    where
        F: FnOnce(&mut MergeRequest) -> CoreResult<(T, Option<AuditRecord>)>,
    {
        let cell = self.merge_request_cell(id)?;
        let mut guard = locking::lock(&cell);
        let mut draft = guard.clone();
        let (value, audit) = f(&mut draft)?;
        if draft != *guard {
            self.persist(|conn| {
                queries::upsert_merge_request(conn, &draft)?;
                if let Some(record) = &audit {
                    queries::insert_audit_log(conn, record)?;
                }
                Ok(())
            })?;
            *guard = draft;
        }
        Ok(value)
    }

    fn merge_base(&self, source_tip: &CommitId, target_tip: &CommitId) -> CoreResult<CommitId> {
        self.graph
            .find_merge_base(target_tip, source_tip)?
            .ok_or_else(|| {
                StructuralError::UnrelatedHistories {
                    source_tip: source_tip.clone(),
                    target_tip: target_tip.clone(),
                }
                .into()
            })
    }

    fn three_way(
        &self,
        base: &CommitId,
        source_tip: &CommitId,
        target_tip: &CommitId,
    ) -> CoreResult<ThreeWayMerge> {
        let base = self.graph.commit(base)?;
        let source = self.graph.commit(source_tip)?;
        let target = self.graph.commit(target_tip)?;
        Ok(ConflictDetector::three_way(
            &base.manifest,
            &source.manifest,
            &target.manifest,
        ))
    }
}

/// `base` with `changes` written over it and `removals` dropped.
fn overlay(base: &Manifest, changes: &Manifest, removals: &[String]) -> CoreResult<Manifest> {
    let mut manifest = base.clone();
    for (path, hash) in changes {
        manifest.insert(path.clone(), hash.clone());
    }
    for path in removals {
        if changes.contains_key(path) {
            return Err(StructuralError::InvalidPath {
                path: path.clone(),
                detail: "path is both uploaded and removed".into(),
            }
            .into());
        }
        if manifest.remove(path).is_none() {
            return Err(StructuralError::InvalidPath {
                path: path.clone(),
                detail: "path does not exist in the parent commit".into(),
            }
            .into());
        }
    }
    Ok(manifest)
}
