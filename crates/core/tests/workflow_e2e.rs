//! End-to-end tests for the merge request workflow.
//!
//! These tests drive the public `Engine` API the way a transport layer
//! would: projects, branches, commits with uploads, merge requests,
//! conflict resolution, approval and merge. Persistence tests use real
//! SQLite files in temporary directories.

use std::sync::Arc;

use tempfile::TempDir;

use mergeflow_core::config::EngineConfig;
use mergeflow_core::conflict::{ConflictState, Resolution};
use mergeflow_core::db::Database;
use mergeflow_core::engine::{CommitRequest, CommitTarget, CreatedCommit, Engine, OpenMergeRequest};
use mergeflow_core::errors::{CoreError, StateConflictError};
use mergeflow_core::merge_request::{MergeRequestStatus, StatusFilter};
use mergeflow_core::models::{Branch, CommitId, FileUpload, FileVersion, Page, ProjectId};
use mergeflow_core::{ContentStore, MemoryContentStore};

// ===========================================================================
// Helpers
// ===========================================================================

fn engine() -> Engine {
    Engine::new(EngineConfig::default(), Arc::new(MemoryContentStore::new()))
}

fn files(entries: &[(&str, &str)]) -> Vec<FileUpload> {
    entries
        .iter()
        .map(|(path, content)| FileUpload::new(*path, content.as_bytes().to_vec()))
        .collect()
}

fn new_branch(
    engine: &Engine,
    project: ProjectId,
    name: &str,
    parent: Option<&CommitId>,
    entries: &[(&str, &str)],
) -> CreatedCommit {
    engine
        .create_commit(CommitRequest {
            project_id: project,
            target: CommitTarget::NewBranch {
                name: name.into(),
                parent: parent.cloned(),
            },
            author: "alice".into(),
            message: format!("start {name}"),
            files: files(entries),
            removals: vec![],
        })
        .expect("new branch commit failed")
}

fn advance(engine: &Engine, branch: &Branch, entries: &[(&str, &str)]) -> CreatedCommit {
    engine
        .create_commit(CommitRequest {
            project_id: branch.project_id,
            target: CommitTarget::Branch {
                branch: branch.id,
                expected_tip: None,
            },
            author: "alice".into(),
            message: "update".into(),
            files: files(entries),
            removals: vec![],
        })
        .expect("commit failed")
}

fn open(engine: &Engine, source: &Branch, target: &Branch) -> mergeflow_core::MergeRequest {
    engine
        .open_merge_request(OpenMergeRequest {
            source_branch: source.id,
            target_branch: target.id,
            title: format!("{} into {}", source.name, target.name),
            description: String::new(),
            author: "bob".into(),
        })
        .expect("open merge request failed")
}

fn content_of(engine: &Engine, commit: &CommitId, path: &str) -> String {
    let commit = engine.commit(commit).unwrap();
    let hash = commit.manifest.get(path).expect("path missing from manifest");
    String::from_utf8(engine.store().get(hash).unwrap()).unwrap()
}

/// `main` at A {x:1}, `feature` at B {x:2} with parent A.
fn fast_forwardable(engine: &Engine) -> (ProjectId, CreatedCommit, CreatedCommit) {
    let project = engine.create_project("bracket", "mounting bracket").unwrap();
    let a = new_branch(engine, project.id, "main", None, &[("x", "1")]);
    let b = new_branch(engine, project.id, "feature", Some(&a.commit.id), &[("x", "2")]);
    (project.id, a, b)
}

// ===========================================================================
// Scenarios
// ===========================================================================

#[test]
fn test_merge_without_conflicts() {
    let engine = engine();
    let (_, a, b) = fast_forwardable(&engine);

    let mr = open(&engine, &b.branch, &a.branch);
    assert_eq!(mr.base, a.commit.id);
    assert!(mr.conflicts.is_empty());

    engine.add_approval(mr.id, "carol").unwrap();
    let merge = engine.merge(mr.id, "bob").unwrap();

    assert_eq!(merge.parents, vec![a.commit.id.clone(), b.commit.id.clone()]);
    assert_eq!(content_of(&engine, &merge.id, "x"), "2");
    assert_eq!(merge.manifest.len(), 1);

    let main = engine.branch(a.branch.id).unwrap();
    assert_eq!(main.tip, merge.id);
    assert_eq!(main.version, 1);

    let mr = engine.merge_request(mr.id).unwrap();
    assert!(matches!(mr.status, MergeRequestStatus::Merged { ref commit, .. } if *commit == merge.id));
}

#[test]
fn test_merge_fails_when_target_moved() {
    let engine = engine();
    let (_, a, b) = fast_forwardable(&engine);

    let mr = open(&engine, &b.branch, &a.branch);
    engine.add_approval(mr.id, "carol").unwrap();
    let c = advance(&engine, &a.branch, &[("x", "3")]);

    let err = engine.merge(mr.id, "bob").unwrap_err();
    assert!(err.is_retryable());
    match err {
        CoreError::State(StateConflictError::StaleBase { target_tip, .. }) => {
            assert_eq!(target_tip, c.commit.id);
        }
        other => panic!("expected StaleBase, got {other}"),
    }
    assert_eq!(engine.branch(a.branch.id).unwrap().tip, c.commit.id);
}

#[test]
fn test_unapproved_request_reports_stale_base_first() {
    let engine = engine();
    let (_, a, b) = fast_forwardable(&engine);

    let mr = open(&engine, &b.branch, &a.branch);
    let c = advance(&engine, &a.branch, &[("x", "3")]);

    match engine.merge(mr.id, "bob").unwrap_err() {
        CoreError::State(StateConflictError::StaleBase { target_tip, .. }) => {
            assert_eq!(target_tip, c.commit.id);
        }
        other => panic!("expected StaleBase, got {other}"),
    }
}

#[test]
fn test_outdated_conflict_set_reports_stale_base() {
    let engine = engine();
    let (_, a, b) = fast_forwardable(&engine);
    let c = advance(&engine, &a.branch, &[("x", "3")]);
    let mr = open(&engine, &b.branch, &c.branch);
    engine.add_approval(mr.id, "carol").unwrap();

    // main converges on the source's content; the recorded conflict on x
    // no longer exists against the new tip.
    advance(&engine, &a.branch, &[("x", "2")]);
    assert!(matches!(
        engine.merge(mr.id, "bob"),
        Err(CoreError::State(StateConflictError::StaleBase { .. }))
    ));

    let refreshed = engine.refresh_merge_request(mr.id).unwrap();
    assert!(refreshed.conflicts.is_empty());
    let merge = engine.merge(mr.id, "bob").unwrap();
    assert_eq!(content_of(&engine, &merge.id, "x"), "2");
}

#[test]
fn test_resolved_content_is_downloadable_after_merge() {
    let engine = engine();
    let (_, a, b) = fast_forwardable(&engine);
    let c = advance(&engine, &a.branch, &[("x", "3")]);
    let mr = open(&engine, &b.branch, &c.branch);

    let merged = engine.store().put(b"2+3").unwrap();
    engine
        .resolve_conflict(
            mr.id,
            "x",
            Resolution::AcceptContent(merged.clone()),
            "bob",
            "kept both edits",
        )
        .unwrap();
    engine.add_approval(mr.id, "carol").unwrap();
    let merge = engine.merge(mr.id, "bob").unwrap();

    let version_id = FileVersion::id_for("x", &merged);
    let version = engine.file_version(&version_id).unwrap();
    assert_eq!(version.size, 3);
    assert_eq!(engine.download(&version_id).unwrap(), b"2+3");

    let versions = engine.commit_file_versions(&merge.id).unwrap();
    assert_eq!(versions, vec![version.clone()]);
    let history = engine.file_history(a.branch.id, "x").unwrap();
    assert_eq!(history.first(), Some(&version));
    assert_eq!(history.len(), 4);
}

#[test]
fn test_genuine_conflict_requires_resolution() {
    let engine = engine();
    let (_, a, b) = fast_forwardable(&engine);
    let c = advance(&engine, &a.branch, &[("x", "3")]);

    let mr = open(&engine, &b.branch, &c.branch);
    assert_eq!(mr.base, a.commit.id);
    let conflicts = engine.conflicts(mr.id).unwrap();
    assert_eq!(conflicts.len(), 1);
    let conflict = &conflicts[0];
    assert_eq!(conflict.path, "x");
    assert_eq!(conflict.base.as_ref(), a.commit.manifest.get("x"));
    assert_eq!(conflict.source.as_ref(), b.commit.manifest.get("x"));
    assert_eq!(conflict.target.as_ref(), c.commit.manifest.get("x"));

    engine.add_approval(mr.id, "carol").unwrap();
    match engine.merge(mr.id, "bob").unwrap_err() {
        CoreError::State(StateConflictError::UnresolvedConflicts { paths }) => {
            assert_eq!(paths, vec!["x".to_string()]);
        }
        other => panic!("expected UnresolvedConflicts, got {other}"),
    }

    engine
        .resolve_conflict(mr.id, "x", Resolution::AcceptSource, "bob", "")
        .unwrap();
    let merge = engine.merge(mr.id, "bob").unwrap();
    assert_eq!(content_of(&engine, &merge.id, "x"), "2");
    assert_eq!(merge.parents, vec![c.commit.id.clone(), b.commit.id.clone()]);
}

#[test]
fn test_resolution_with_new_content() {
    let engine = engine();
    let (_, a, b) = fast_forwardable(&engine);
    advance(&engine, &a.branch, &[("x", "3")]);
    let mr = open(&engine, &b.branch, &a.branch);

    let merged = engine.store().put(b"2+3").unwrap();
    engine
        .resolve_conflict(mr.id, "x", Resolution::AcceptContent(merged), "bob", "")
        .unwrap();
    // Last write wins.
    engine
        .resolve_conflict(mr.id, "x", Resolution::AcceptTarget, "carol", "")
        .unwrap();
    engine.add_approval(mr.id, "dave").unwrap();

    let merge = engine.merge(mr.id, "bob").unwrap();
    assert_eq!(content_of(&engine, &merge.id, "x"), "3");
}

#[test]
fn test_zero_conflict_merge_overlays_source_changes() {
    let engine = engine();
    let project = engine.create_project("assembly", "").unwrap();
    let a = new_branch(
        &engine,
        project.id,
        "main",
        None,
        &[("frame", "f0"), ("wheel", "w0"), ("seat", "s0")],
    );
    let feature = engine
        .create_branch(project.id, "feature", Some(a.branch.id))
        .unwrap();

    // Source edits one path and removes another; target edits a third.
    engine
        .create_commit(CommitRequest {
            project_id: project.id,
            target: CommitTarget::Branch {
                branch: feature.id,
                expected_tip: None,
            },
            author: "bob".into(),
            message: "lighter frame, no seat".into(),
            files: files(&[("frame", "f1"), ("bell", "b1")]),
            removals: vec!["seat".into()],
        })
        .unwrap();
    let target = advance(&engine, &a.branch, &[("wheel", "w1")]);

    let mr = open(&engine, &feature, &a.branch);
    assert!(mr.conflicts.is_empty());
    engine.add_approval(mr.id, "carol").unwrap();
    let merge = engine.merge(mr.id, "bob").unwrap();

    let mut expected = target.commit.manifest.clone();
    let source = engine.commit(&engine.branch(feature.id).unwrap().tip).unwrap();
    for path in ["frame", "bell"] {
        expected.insert(path.to_string(), source.manifest[path].clone());
    }
    expected.remove("seat");
    assert_eq!(merge.manifest, expected);
}

#[test]
fn test_approval_threshold_and_idempotence() {
    let mut config = EngineConfig::default();
    config.workflow.approval_threshold = 2;
    let engine = Engine::new(config, Arc::new(MemoryContentStore::new()));
    let (_, a, b) = fast_forwardable(&engine);
    let mr = open(&engine, &b.branch, &a.branch);

    engine.add_approval(mr.id, "carol").unwrap();
    let again = engine.add_approval(mr.id, "carol").unwrap();
    assert_eq!(again.approvals.len(), 1);
    assert_eq!(again.status, MergeRequestStatus::Open);
    assert!(matches!(
        engine.merge(mr.id, "bob"),
        Err(CoreError::State(StateConflictError::NotApproved { approvals: 1, required: 2, .. }))
    ));

    let approved = engine.add_approval(mr.id, "dave").unwrap();
    assert_eq!(approved.status, MergeRequestStatus::Approved);
    engine.merge(mr.id, "bob").unwrap();

    assert!(matches!(
        engine.add_approval(mr.id, "erin"),
        Err(CoreError::State(StateConflictError::NotOpenOrApproved { .. }))
    ));
    assert_eq!(
        engine
            .list_merge_requests(None, Some(StatusFilter::Merged))
            .len(),
        1
    );
}

#[test]
fn test_parent_is_its_own_merge_base() {
    let engine = engine();
    let (_, a, b) = fast_forwardable(&engine);
    let c = advance(&engine, &a.branch, &[("x", "3")]);
    let mr = open(&engine, &b.branch, &c.branch);
    engine
        .resolve_conflict(mr.id, "x", Resolution::AcceptTarget, "bob", "")
        .unwrap();
    engine.add_approval(mr.id, "carol").unwrap();
    let merge = engine.merge(mr.id, "bob").unwrap();

    for parent in &merge.parents {
        let base = engine
            .graph()
            .find_merge_base(&merge.id, parent)
            .unwrap()
            .unwrap();
        assert_eq!(&base, parent);
    }
}

// ===========================================================================
// Concurrency
// ===========================================================================

#[test]
fn test_parallel_commits_with_expected_tip_first_writer_wins() {
    let engine = engine();
    let project = engine.create_project("race", "").unwrap();
    let a = new_branch(&engine, project.id, "main", None, &[("x", "0")]);

    let results: Vec<_> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let engine = &engine;
                let a = &a;
                scope.spawn(move || {
                    engine.create_commit(CommitRequest {
                        project_id: a.branch.project_id,
                        target: CommitTarget::Branch {
                            branch: a.branch.id,
                            expected_tip: Some(a.commit.id.clone()),
                        },
                        author: format!("user{i}"),
                        message: "racing".into(),
                        files: files(&[("x", i.to_string().as_str())]),
                        removals: vec![],
                    })
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let winners = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1);
    for result in &results {
        if let Err(err) = result {
            assert!(matches!(
                err,
                CoreError::State(StateConflictError::StaleTip { .. })
            ));
        }
    }
    assert_eq!(engine.branch(a.branch.id).unwrap().version, 1);
}

#[test]
fn test_parallel_commits_serialize_on_branch() {
    let engine = engine();
    let project = engine.create_project("race", "").unwrap();
    let a = new_branch(&engine, project.id, "main", None, &[("x", "0")]);

    std::thread::scope(|scope| {
        for i in 0..8 {
            let engine = &engine;
            let branch = &a.branch;
            scope.spawn(move || advance(engine, branch, &[("x", format!("v{i}").as_str())]));
        }
    });

    let main = engine.branch(a.branch.id).unwrap();
    assert_eq!(main.version, 8);
    let page = engine
        .list_commits(main.id, Page { limit: Some(100), offset: 0 })
        .unwrap();
    // A linear chain: every commit has exactly one parent until the root.
    assert_eq!(page.commits.len(), 9);
    for pair in page.commits.windows(2) {
        assert_eq!(pair[0].parents, vec![pair[1].id.clone()]);
    }
}

#[test]
fn test_merge_races_with_target_commit() {
    let engine = engine();
    let (_, a, b) = fast_forwardable(&engine);
    let mr = open(&engine, &b.branch, &a.branch);
    engine.add_approval(mr.id, "carol").unwrap();

    let merged = std::thread::scope(|scope| {
        let merging = scope.spawn(|| engine.merge(mr.id, "bob"));
        scope.spawn(|| advance(&engine, &a.branch, &[("y", "1")]));
        merging.join().unwrap()
    });

    let main = engine.branch(a.branch.id).unwrap();
    assert_eq!(main.version, 2 - u64::from(merged.is_err()));
    match merged {
        Ok(commit) => {
            // The racing commit landed on top of the merge.
            let tip = engine.commit(&main.tip).unwrap();
            assert_eq!(tip.parents, vec![commit.id]);
        }
        Err(err) => assert!(matches!(
            err,
            CoreError::State(StateConflictError::StaleBase { .. })
        )),
    }
}

// ===========================================================================
// Persistence
// ===========================================================================

#[test]
fn test_state_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let mut config = EngineConfig::default();
    config.database.path = Some(dir.path().join("mergeflow.db"));
    let store: Arc<MemoryContentStore> = Arc::new(MemoryContentStore::new());

    let (project, main_id, mr_id, conflict_id, merge_id, resolved) = {
        let engine = Engine::open(config.clone(), store.clone()).unwrap();
        let (project, a, b) = fast_forwardable(&engine);
        let c = advance(&engine, &a.branch, &[("x", "3")]);
        let mr = open(&engine, &b.branch, &c.branch);
        let conflict_id = mr.conflicts["x"].id;
        engine.add_comment(mr.id, "carol", "which one?").unwrap();
        let resolved = engine.store().put(b"2+3").unwrap();
        engine
            .resolve_conflict_by_id(
                conflict_id,
                Resolution::AcceptContent(resolved.clone()),
                "bob",
                "hand-merged",
            )
            .unwrap();
        engine.add_approval(mr.id, "carol").unwrap();
        let merge = engine.merge(mr.id, "bob").unwrap();
        (project, a.branch.id, mr.id, conflict_id, merge.id, resolved)
    };

    let engine = Engine::open(config, store).unwrap();
    assert_eq!(engine.list_projects().len(), 1);
    assert_eq!(engine.branches(project).unwrap().len(), 2);

    let main = engine.branch(main_id).unwrap();
    assert_eq!(main.tip, merge_id);
    assert_eq!(main.version, 2);
    assert_eq!(content_of(&engine, &merge_id, "x"), "2+3");
    assert_eq!(
        engine.download(&FileVersion::id_for("x", &resolved)).unwrap(),
        b"2+3"
    );

    let mr = engine.merge_request(mr_id).unwrap();
    assert_eq!(mr.status.name(), "merged");
    assert_eq!(mr.comments.len(), 1);
    assert!(matches!(
        engine.conflict(conflict_id).unwrap().state,
        ConflictState::Resolved { ref notes, .. } if notes == "hand-merged"
    ));

    // Tips advance from the persisted version.
    let next = advance(&engine, &main, &[("y", "1")]);
    assert_eq!(next.branch.version, 3);

    let actions: Vec<String> = engine
        .audit_log(100)
        .unwrap()
        .into_iter()
        .map(|entry| entry.action)
        .collect();
    for action in [
        "project_created",
        "commit_created",
        "merge_request_opened",
        "conflict_resolved",
        "merge_request_approved",
        "merge_request_merged",
    ] {
        assert!(actions.iter().any(|a| a == action), "missing audit action {action}");
    }
}

#[test]
fn test_failed_commit_is_not_persisted() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("mergeflow.db");
    let store = Arc::new(MemoryContentStore::new());
    let db = Database::new(&path).unwrap();
    let engine = Engine::with_database(EngineConfig::default(), store.clone(), db).unwrap();
    let (_, a, _) = fast_forwardable(&engine);

    let duplicate = engine.create_commit(CommitRequest {
        project_id: a.branch.project_id,
        target: CommitTarget::NewBranch {
            name: "main".into(),
            parent: Some(a.commit.id.clone()),
        },
        author: "alice".into(),
        message: "duplicate".into(),
        files: files(&[("x", "9")]),
        removals: vec![],
    });
    assert!(duplicate.is_err());
    drop(engine);

    let reopened = Engine::with_database(
        EngineConfig::default(),
        store,
        Database::new(&path).unwrap(),
    )
    .unwrap();
    assert_eq!(reopened.graph().commit_count(), 2);
}
