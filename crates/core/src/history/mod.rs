//! Append-only commit DAG and branch pointers.
//!
//! Commits live in an arena indexed by their content hash and are never
//! mutated or removed. Branch tips are the only mutable edges: each branch
//! owns a mutex-guarded [`TipState`] so that advancing one branch is a
//! single-writer critical section while unrelated branches proceed in
//! parallel.

pub mod commit;
pub mod merge_base;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use chrono::{DateTime, Utc};
use tracing::{debug, info};

pub use commit::{Commit, CommitDraft};

use crate::errors::{CoreResult, NotFoundError, StateConflictError, StructuralError};
use crate::locking;
use crate::models::{
    validate_path, Branch, BranchId, CommitId, FileVersion, FileVersionId, ProjectId,
};

// ---------------------------------------------------------------------------
// Branch cells
// ---------------------------------------------------------------------------

/// The mutable part of a branch: its tip and a version counter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TipState {
    pub commit: CommitId,
    pub version: u64,
}

impl TipState {
    pub(crate) fn advance_to(&mut self, commit: CommitId) {
        self.commit = commit;
        self.version += 1;
    }
}

/// A branch's immutable identity plus its lockable tip.
#[derive(Debug)]
pub struct BranchEntry {
    id: BranchId,
    project_id: ProjectId,
    name: String,
    created_at: DateTime<Utc>,
    tip: Mutex<TipState>,
}

impl BranchEntry {
    fn from_branch(branch: Branch) -> Self {
        Self {
            id: branch.id,
            project_id: branch.project_id,
            name: branch.name,
            created_at: branch.created_at,
            tip: Mutex::new(TipState {
                commit: branch.tip,
                version: branch.version,
            }),
        }
    }

    pub fn id(&self) -> BranchId {
        self.id
    }

    pub fn project_id(&self) -> ProjectId {
        self.project_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enter the branch's single-writer section.
    pub fn lock_tip(&self) -> MutexGuard<'_, TipState> {
        locking::lock(&self.tip)
    }

    /// Snapshot using an already-held tip.
    pub fn snapshot_with(&self, tip: &TipState) -> Branch {
        Branch {
            id: self.id,
            project_id: self.project_id,
            name: self.name.clone(),
            tip: tip.commit.clone(),
            version: tip.version,
            created_at: self.created_at,
        }
    }

    pub fn snapshot(&self) -> Branch {
        let tip = self.lock_tip();
        self.snapshot_with(&tip)
    }
}

/// Lock the tips of two distinct branches in a global order (by id) so that
/// concurrent callers locking the same pair never deadlock. The guards are
/// returned in argument order.
pub fn lock_tip_pair<'a>(
    first: &'a BranchEntry,
    second: &'a BranchEntry,
) -> (MutexGuard<'a, TipState>, MutexGuard<'a, TipState>) {
    if first.id <= second.id {
        let a = first.lock_tip();
        let b = second.lock_tip();
        (a, b)
    } else {
        let b = second.lock_tip();
        let a = first.lock_tip();
        (a, b)
    }
}

// ---------------------------------------------------------------------------
// Graph
// ---------------------------------------------------------------------------

/// Arena of immutable commits plus branch pointers and file versions.
#[derive(Debug, Default)]
pub struct HistoryGraph {
    commits: RwLock<HashMap<CommitId, Arc<Commit>>>,
    branches: RwLock<HashMap<BranchId, Arc<BranchEntry>>>,
    file_versions: RwLock<HashMap<FileVersionId, FileVersion>>,
}

impl HistoryGraph {
    pub fn new() -> Self {
        Self::default()
    }

    // -- commits ------------------------------------------------------------

    /// Look up a commit by id.
    pub fn commit(&self, id: &CommitId) -> CoreResult<Arc<Commit>> {
        locking::read(&self.commits)
            .get(id)
            .cloned()
            .ok_or_else(|| NotFoundError::Commit(id.clone()).into())
    }

    pub fn contains_commit(&self, id: &CommitId) -> bool {
        locking::read(&self.commits).contains_key(id)
    }

    pub fn commit_count(&self) -> usize {
        locking::read(&self.commits).len()
    }

    /// Validate a draft against the graph and seal it, without inserting.
    ///
    /// Fails with `InvalidParent` when a parent is unknown or belongs to a
    /// different project, and with `EmptyManifest` when a non-merge commit
    /// snapshots no files.
    pub fn prepare_commit(&self, draft: CommitDraft) -> CoreResult<Commit> {
        {
            let commits = locking::read(&self.commits);
            for parent in &draft.parents {
                match commits.get(parent) {
                    Some(p) if p.project_id == draft.project_id => {}
                    _ => return Err(StructuralError::InvalidParent(parent.clone()).into()),
                }
            }
        }
        if draft.manifest.is_empty() && !draft.is_merge() {
            return Err(StructuralError::EmptyManifest.into());
        }
        for path in draft.manifest.keys() {
            validate_path(path)?;
        }
        Ok(draft.seal())
    }

    /// Insert a sealed commit. Re-inserting an existing id returns the
    /// stored commit unchanged.
    pub fn insert_commit(&self, commit: Commit) -> Arc<Commit> {
        let mut commits = locking::write(&self.commits);
        if let Some(existing) = commits.get(&commit.id) {
            return Arc::clone(existing);
        }
        debug!(
            commit = %commit.id.short(),
            parents = commit.parents.len(),
            files = commit.manifest.len(),
            "appending commit"
        );
        let commit = Arc::new(commit);
        commits.insert(commit.id.clone(), Arc::clone(&commit));
        commit
    }

    /// Validate and append a commit in one step.
    pub fn append_commit(&self, draft: CommitDraft) -> CoreResult<Arc<Commit>> {
        let commit = self.prepare_commit(draft)?;
        Ok(self.insert_commit(commit))
    }

    // -- ancestry -----------------------------------------------------------

    /// Lazily walk the ancestors of `id`, starting with `id` itself.
    pub fn ancestors_of(&self, id: &CommitId) -> CoreResult<Ancestors<'_>> {
        if !self.contains_commit(id) {
            return Err(NotFoundError::Commit(id.clone()).into());
        }
        Ok(Ancestors::new(self, id.clone()))
    }

    /// Whether `ancestor` is reachable from `descendant` (a commit is its own
    /// ancestor).
    pub fn is_ancestor(&self, ancestor: &CommitId, descendant: &CommitId) -> CoreResult<bool> {
        if !self.contains_commit(ancestor) {
            return Err(NotFoundError::Commit(ancestor.clone()).into());
        }
        Ok(self.ancestors_of(descendant)?.any(|id| &id == ancestor))
    }

    /// Nearest common ancestor of two commits; see [`merge_base::find_merge_base`].
    pub fn find_merge_base(&self, a: &CommitId, b: &CommitId) -> CoreResult<Option<CommitId>> {
        merge_base::find_merge_base(self, a, b)
    }

    // -- branches -----------------------------------------------------------

    /// Create a branch named `name` pointing at `at`.
    pub fn create_branch(
        &self,
        project_id: ProjectId,
        name: &str,
        at: &CommitId,
    ) -> CoreResult<Branch> {
        let commit = self.commit(at)?;
        if commit.project_id != project_id {
            return Err(StructuralError::InvalidParent(at.clone()).into());
        }
        let branch = Branch {
            id: BranchId::new(),
            project_id,
            name: name.to_string(),
            tip: at.clone(),
            version: 0,
            created_at: Utc::now(),
        };
        self.insert_branch_with(branch, |_| Ok(()))
    }

    /// Register `branch`, running `persist` while the branch map is locked so
    /// the name-uniqueness check and the write are one step. The caller must
    /// make sure the tip commit exists (or is inserted by `persist`).
    pub fn insert_branch_with<F>(&self, branch: Branch, persist: F) -> CoreResult<Branch>
    where
        F: FnOnce(&Branch) -> CoreResult<()>,
    {
        if branch.name.trim().is_empty() {
            return Err(StructuralError::InvalidArgument {
                field: "branch.name".into(),
                detail: "branch name must not be empty".into(),
            }
            .into());
        }

        let mut branches = locking::write(&self.branches);
        let taken = branches
            .values()
            .any(|b| b.project_id == branch.project_id && b.name == branch.name);
        if taken {
            return Err(StructuralError::BranchExists {
                project: branch.project_id,
                name: branch.name,
            }
            .into());
        }

        persist(&branch)?;

        info!(
            branch = %branch.id,
            name = %branch.name,
            tip = %branch.tip.short(),
            "branch created"
        );
        branches.insert(branch.id, Arc::new(BranchEntry::from_branch(branch.clone())));
        Ok(branch)
    }

    /// Shared handle to a branch cell.
    pub fn branch_entry(&self, id: BranchId) -> CoreResult<Arc<BranchEntry>> {
        locking::read(&self.branches)
            .get(&id)
            .cloned()
            .ok_or_else(|| NotFoundError::Branch(id).into())
    }

    pub fn branch(&self, id: BranchId) -> CoreResult<Branch> {
        Ok(self.branch_entry(id)?.snapshot())
    }

    /// All branches of a project, ordered by name.
    pub fn branches_of(&self, project_id: ProjectId) -> Vec<Branch> {
        let entries: Vec<Arc<BranchEntry>> = locking::read(&self.branches)
            .values()
            .filter(|b| b.project_id == project_id)
            .cloned()
            .collect();
        let mut branches: Vec<Branch> = entries.iter().map(|b| b.snapshot()).collect();
        branches.sort_by(|a, b| a.name.cmp(&b.name));
        branches
    }

    pub fn find_branch(&self, project_id: ProjectId, name: &str) -> Option<Branch> {
        let entry = locking::read(&self.branches)
            .values()
            .find(|b| b.project_id == project_id && b.name == name)
            .cloned();
        entry.map(|b| b.snapshot())
    }

    /// Check that moving `branch` from `tip` to `commit` only moves forward:
    /// the current tip must be `commit` itself or one of its ancestors.
    /// `commit` may be sealed but not yet inserted.
    pub fn check_advance(
        &self,
        branch: &BranchEntry,
        tip: &TipState,
        commit: &Commit,
    ) -> CoreResult<()> {
        if commit.project_id != branch.project_id {
            return Err(StructuralError::CrossProject {
                source_project: commit.project_id,
                target_project: branch.project_id,
            }
            .into());
        }
        if commit.id == tip.commit {
            return Ok(());
        }
        for parent in &commit.parents {
            if self.is_ancestor(&tip.commit, parent)? {
                return Ok(());
            }
        }
        Err(StateConflictError::NotDescendant {
            branch: branch.id,
            current: tip.commit.clone(),
            proposed: commit.id.clone(),
        }
        .into())
    }

    /// Fast-forward `branch` to `commit`.
    pub fn advance_branch(&self, branch: BranchId, commit: &CommitId) -> CoreResult<Branch> {
        let entry = self.branch_entry(branch)?;
        let commit = self.commit(commit)?;
        let mut tip = entry.lock_tip();
        self.check_advance(&entry, &tip, &commit)?;
        if tip.commit != commit.id {
            tip.advance_to(commit.id.clone());
            debug!(branch = %branch, tip = %commit.id.short(), version = tip.version, "branch advanced");
        }
        Ok(entry.snapshot_with(&tip))
    }

    /// Advance `branch` only if its version still equals `expected_version`.
    pub fn advance_branch_checked(
        &self,
        branch: BranchId,
        expected_version: u64,
        commit: &CommitId,
    ) -> CoreResult<Branch> {
        let entry = self.branch_entry(branch)?;
        let commit = self.commit(commit)?;
        let mut tip = entry.lock_tip();
        if tip.version != expected_version {
            return Err(StateConflictError::StaleTip {
                branch,
                current: tip.commit.clone(),
                version: tip.version,
            }
            .into());
        }
        self.check_advance(&entry, &tip, &commit)?;
        if tip.commit != commit.id {
            tip.advance_to(commit.id.clone());
        }
        Ok(entry.snapshot_with(&tip))
    }

    // -- file versions ------------------------------------------------------

    /// Register a file version; existing ids are left untouched.
    pub fn record_file_version(&self, version: FileVersion) {
        locking::write(&self.file_versions)
            .entry(version.id.clone())
            .or_insert(version);
    }

    pub fn file_version(&self, id: &FileVersionId) -> CoreResult<FileVersion> {
        locking::read(&self.file_versions)
            .get(id)
            .cloned()
            .ok_or_else(|| NotFoundError::FileVersion(id.clone()).into())
    }

    pub fn has_file_version(&self, id: &FileVersionId) -> bool {
        locking::read(&self.file_versions).contains_key(id)
    }
}

// ---------------------------------------------------------------------------
// Ancestor traversal
// ---------------------------------------------------------------------------

/// Breadth-first, parent-first walk over a commit's ancestry.
///
/// Each id is yielded once even when reachable through several paths. The
/// walk is lazy (commits are looked up one at a time), finite (the DAG is
/// acyclic and deduplicated), and restartable via [`Ancestors::restart`] or
/// by cloning before iterating.
#[derive(Debug, Clone)]
pub struct Ancestors<'g> {
    graph: &'g HistoryGraph,
    start: CommitId,
    queue: VecDeque<CommitId>,
    seen: HashSet<CommitId>,
}

impl<'g> Ancestors<'g> {
    fn new(graph: &'g HistoryGraph, start: CommitId) -> Self {
        let mut walk = Self {
            graph,
            start,
            queue: VecDeque::new(),
            seen: HashSet::new(),
        };
        walk.restart();
        walk
    }

    /// Rewind to the starting commit.
    pub fn restart(&mut self) {
        self.queue.clear();
        self.seen.clear();
        self.queue.push_back(self.start.clone());
        self.seen.insert(self.start.clone());
    }
}

impl Iterator for Ancestors<'_> {
    type Item = CommitId;

    fn next(&mut self) -> Option<CommitId> {
        let id = self.queue.pop_front()?;
        let commits = locking::read(&self.graph.commits);
        if let Some(commit) = commits.get(&id) {
            for parent in &commit.parents {
                if self.seen.insert(parent.clone()) {
                    self.queue.push_back(parent.clone());
                }
            }
        }
        Some(id)
    }
}
