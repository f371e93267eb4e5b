//! Nearest-common-ancestor search over the commit DAG.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use super::HistoryGraph;
use crate::errors::CoreResult;
use crate::models::CommitId;

/// Find the merge base of `a` and `b`.
///
/// The full ancestor set of `a` is collected first. The ancestors of `b` are
/// then walked breadth-first, one depth level at a time, and the first level
/// containing a member of `a`'s set decides the result. When several common
/// ancestors share that level, the one reached through the fewest merge
/// commits from `b` wins, then the earliest in parent order.
///
/// Returns `Ok(None)` only when the histories are disconnected.
pub fn find_merge_base(
    graph: &HistoryGraph,
    a: &CommitId,
    b: &CommitId,
) -> CoreResult<Option<CommitId>> {
    let a_ancestors: HashSet<CommitId> = graph.ancestors_of(a)?.collect();
    graph.commit(b)?;

    let mut visited: HashSet<CommitId> = HashSet::from([b.clone()]);
    // (commit, merge commits crossed on the cheapest path from `b`)
    let mut level: Vec<(CommitId, usize)> = vec![(b.clone(), 0)];
    let mut depth = 0usize;

    while !level.is_empty() {
        let best = level
            .iter()
            .filter(|(id, _)| a_ancestors.contains(id))
            .min_by_key(|(_, merge_hops)| *merge_hops);
        if let Some((id, merge_hops)) = best {
            debug!(
                a = %a.short(),
                b = %b.short(),
                base = %id.short(),
                depth,
                merge_hops,
                "merge base found"
            );
            return Ok(Some(id.clone()));
        }

        let mut next: Vec<(CommitId, usize)> = Vec::new();
        let mut slot: HashMap<CommitId, usize> = HashMap::new();
        for (id, merge_hops) in &level {
            let commit = graph.commit(id)?;
            let cost = if commit.is_merge() {
                merge_hops + 1
            } else {
                *merge_hops
            };
            for parent in &commit.parents {
                if let Some(&i) = slot.get(parent) {
                    next[i].1 = next[i].1.min(cost);
                } else if visited.insert(parent.clone()) {
                    slot.insert(parent.clone(), next.len());
                    next.push((parent.clone(), cost));
                }
            }
        }
        level = next;
        depth += 1;
    }

    debug!(a = %a.short(), b = %b.short(), "no common ancestor");
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::CommitDraft;
    use crate::models::{ContentHash, Manifest, ProjectId};

    struct Dag {
        graph: HistoryGraph,
        project: ProjectId,
        counter: usize,
    }

    impl Dag {
        fn new() -> Self {
            Self {
                graph: HistoryGraph::new(),
                project: ProjectId::new(),
                counter: 0,
            }
        }

        fn commit(&mut self, parents: &[&CommitId]) -> CommitId {
            self.counter += 1;
            let mut manifest = Manifest::new();
            manifest.insert(
                "file".into(),
                ContentHash::of(self.counter.to_string().as_bytes()),
            );
            let draft = CommitDraft::new(
                self.project,
                parents.iter().map(|p| (*p).clone()).collect(),
                "tester",
                format!("commit {}", self.counter),
                manifest,
            );
            self.graph.append_commit(draft).unwrap().id.clone()
        }

        fn base(&self, a: &CommitId, b: &CommitId) -> Option<CommitId> {
            find_merge_base(&self.graph, a, b).unwrap()
        }
    }

    #[test]
    fn test_parent_is_merge_base_with_child() {
        let mut dag = Dag::new();
        let root = dag.commit(&[]);
        let left = dag.commit(&[&root]);
        let right = dag.commit(&[&root]);
        let merge = dag.commit(&[&left, &right]);

        for child in [&left, &right, &merge] {
            let commit = dag.graph.commit(child).unwrap();
            for parent in &commit.parents {
                assert_eq!(dag.base(child, parent).as_ref(), Some(parent));
            }
        }
    }

    #[test]
    fn test_diverged_branches() {
        let mut dag = Dag::new();
        let root = dag.commit(&[]);
        let fork = dag.commit(&[&root]);
        let main = dag.commit(&[&fork]);
        let main2 = dag.commit(&[&main]);
        let feature = dag.commit(&[&fork]);

        assert_eq!(dag.base(&main2, &feature), Some(fork.clone()));
        assert_eq!(dag.base(&feature, &main2), Some(fork));
    }

    #[test]
    fn test_same_commit() {
        let mut dag = Dag::new();
        let root = dag.commit(&[]);
        assert_eq!(dag.base(&root, &root), Some(root));
    }

    #[test]
    fn test_after_previous_merge() {
        // main: r - m1 ------ M - m2
        //            \       /
        // feature:    f1 - f2 - f3
        let mut dag = Dag::new();
        let r = dag.commit(&[]);
        let m1 = dag.commit(&[&r]);
        let f1 = dag.commit(&[&m1]);
        let f2 = dag.commit(&[&f1]);
        let merged = dag.commit(&[&m1, &f2]);
        let m2 = dag.commit(&[&merged]);
        let f3 = dag.commit(&[&f2]);

        assert_eq!(dag.base(&m2, &f3), Some(f2));
    }

    #[test]
    fn test_disconnected_histories() {
        let mut dag = Dag::new();
        let a = dag.commit(&[]);
        let b = dag.commit(&[]);
        assert_eq!(dag.base(&a, &b), None);
    }

    #[test]
    fn test_tie_prefers_fewest_merge_hops() {
        // b has parents [m, l]. m is a merge over [c2, z]; l is linear over c1.
        // c1 and c2 are both common ancestors at depth 2, c2 is discovered
        // first but only through an extra merge commit.
        let mut dag = Dag::new();
        let root = dag.commit(&[]);
        let c1 = dag.commit(&[&root]);
        let c2 = dag.commit(&[&root]);
        let z = dag.commit(&[&root]);
        let m = dag.commit(&[&c2, &z]);
        let l = dag.commit(&[&c1]);
        let b = dag.commit(&[&m, &l]);
        let a = dag.commit(&[&c2, &c1]);

        assert_eq!(dag.base(&a, &b), Some(c1));
    }

    #[test]
    fn test_equal_hops_fall_back_to_parent_order() {
        let mut dag = Dag::new();
        let root = dag.commit(&[]);
        let x = dag.commit(&[&root]);
        let y = dag.commit(&[&root]);
        let b = dag.commit(&[&x, &y]);
        let a = dag.commit(&[&y, &x]);

        assert_eq!(dag.base(&a, &b), Some(x));
    }
}
