//! Stage dependency graph and readiness batches.
//!
//! Stages are nodes in a directed acyclic graph. An edge `A -> B` means
//! "B depends on A": A must succeed before B may start.
//!
//! Cycles are rejected at insertion time, so a graph that accepted every
//! `add_stage` call is always schedulable once its references resolve.
//! Readiness batches are Kahn levels emitted lazily; within a batch stages
//! keep insertion order so the partition is deterministic.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::domain::{GraphError, StageSpec};

/// Directed dependency graph over [`StageSpec`]s.
#[derive(Debug, Clone, Default)]
pub struct StageGraph {
    /// Insertion order, used for deterministic batch ordering.
    order: Vec<String>,
    stages: HashMap<String, StageSpec>,
}

impl StageGraph {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a graph from specs in order, stopping at the first error.
    pub fn from_specs(specs: impl IntoIterator<Item = StageSpec>) -> Result<Self, GraphError> {
        let mut graph = Self::new();
        for spec in specs {
            graph.add_stage(spec)?;
        }
        Ok(graph)
    }

    /// Add a stage with its predecessor ids.
    ///
    /// Predecessors may be added later (forward references). Returns
    /// [`GraphError::Cycle`] if the new edges would close a cycle; the graph
    /// is left unchanged in that case.
    pub fn add_stage(&mut self, spec: StageSpec) -> Result<(), GraphError> {
        if self.stages.contains_key(&spec.id) {
            return Err(GraphError::DuplicateStage { stage: spec.id });
        }

        for dep in &spec.depends_on {
            if dep == &spec.id {
                return Err(GraphError::Cycle {
                    path: vec![spec.id.clone(), spec.id.clone()],
                });
            }
            if let Some(mut path) = self.upstream_path(dep, &spec.id) {
                path.insert(0, spec.id.clone());
                return Err(GraphError::Cycle { path });
            }
        }

        self.order.push(spec.id.clone());
        self.stages.insert(spec.id.clone(), spec);
        Ok(())
    }

    /// Check that every referenced predecessor exists.
    pub fn validate(&self) -> Result<(), GraphError> {
        for id in &self.order {
            let spec = &self.stages[id];
            for dep in &spec.depends_on {
                if !self.stages.contains_key(dep) {
                    return Err(GraphError::UnknownDependency {
                        stage: id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn stage(&self, id: &str) -> Option<&StageSpec> {
        self.stages.get(id)
    }

    /// Stages in insertion order.
    pub fn stages(&self) -> impl Iterator<Item = &StageSpec> {
        self.order.iter().map(move |id| &self.stages[id])
    }

    /// Direct predecessors of `id`.
    pub fn predecessors(&self, id: &str) -> Result<&[String], GraphError> {
        self.stages
            .get(id)
            .map(|s| s.depends_on.as_slice())
            .ok_or_else(|| GraphError::StageNotFound {
                stage: id.to_string(),
            })
    }

    /// Direct dependents of `id`, in insertion order.
    pub fn dependents(&self, id: &str) -> Result<Vec<&str>, GraphError> {
        self.require(id)?;
        Ok(self
            .stages()
            .filter(|s| s.depends_on.iter().any(|d| d == id))
            .map(|s| s.id.as_str())
            .collect())
    }

    /// All transitive dependents of `id` (BFS over downstream edges).
    pub fn transitive_dependents(&self, id: &str) -> Result<HashSet<String>, GraphError> {
        self.require(id)?;

        let mut visited = HashSet::new();
        let mut queue = VecDeque::from([id.to_string()]);
        while let Some(current) = queue.pop_front() {
            for dependent in self.dependents(&current)? {
                if visited.insert(dependent.to_string()) {
                    queue.push_back(dependent.to_string());
                }
            }
        }
        Ok(visited)
    }

    /// Lazy sequence of readiness batches.
    ///
    /// Batch `n + 1` holds the stages whose predecessors all appeared in
    /// batches `0..=n`. Each call starts over from the first batch.
    pub fn batches(&self) -> Result<Batches<'_>, GraphError> {
        self.validate()?;
        let remaining = self
            .order
            .iter()
            .map(|id| (id.as_str(), self.stages[id].depends_on.len()))
            .collect();
        Ok(Batches {
            graph: self,
            remaining,
            emitted: HashSet::new(),
        })
    }

    fn require(&self, id: &str) -> Result<(), GraphError> {
        if self.stages.contains_key(id) {
            Ok(())
        } else {
            Err(GraphError::StageNotFound {
                stage: id.to_string(),
            })
        }
    }

    /// DFS over `depends_on` edges from `from`, returning the chain that
    /// reaches `target` if one exists.
    fn upstream_path(&self, from: &str, target: &str) -> Option<Vec<String>> {
        let mut visited = HashSet::new();
        let mut path = Vec::new();
        if self.dfs_upstream(from, target, &mut visited, &mut path) {
            Some(path)
        } else {
            None
        }
    }

    fn dfs_upstream(
        &self,
        node: &str,
        target: &str,
        visited: &mut HashSet<String>,
        path: &mut Vec<String>,
    ) -> bool {
        path.push(node.to_string());
        if node == target {
            return true;
        }
        if visited.insert(node.to_string()) {
            if let Some(spec) = self.stages.get(node) {
                for dep in &spec.depends_on {
                    if self.dfs_upstream(dep, target, visited, path) {
                        return true;
                    }
                }
            }
        }
        path.pop();
        false
    }
}

/// Iterator over readiness batches of a [`StageGraph`].
#[derive(Debug)]
pub struct Batches<'a> {
    graph: &'a StageGraph,
    /// Unsatisfied predecessor count per stage.
    remaining: HashMap<&'a str, usize>,
    emitted: HashSet<&'a str>,
}

impl<'a> Iterator for Batches<'a> {
    type Item = Vec<&'a StageSpec>;

    fn next(&mut self) -> Option<Self::Item> {
        let ready: Vec<&'a StageSpec> = self
            .graph
            .order
            .iter()
            .map(|id| &self.graph.stages[id])
            .filter(|s| {
                !self.emitted.contains(s.id.as_str()) && self.remaining[s.id.as_str()] == 0
            })
            .collect();

        if ready.is_empty() {
            return None;
        }

        for spec in &ready {
            self.emitted.insert(spec.id.as_str());
        }
        for spec in &ready {
            for dependent in self.graph.stages() {
                let hits = dependent.depends_on.iter().filter(|d| **d == spec.id).count();
                if hits > 0 {
                    if let Some(count) = self.remaining.get_mut(dependent.id.as_str()) {
                        *count = count.saturating_sub(hits);
                    }
                }
            }
        }
        Some(ready)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ActionRef;

    fn stage(id: &str, deps: &[&str]) -> StageSpec {
        deps.iter().fold(
            StageSpec::new(id, ActionRef::command(["true"])),
            |s, d| s.depends_on(*d),
        )
    }

    fn ids(batches: Batches<'_>) -> Vec<Vec<String>> {
        batches
            .map(|b| b.into_iter().map(|s| s.id.clone()).collect())
            .collect()
    }

    fn deploy_graph() -> StageGraph {
        StageGraph::from_specs([
            stage("lint", &[]),
            stage("test", &["lint"]),
            stage("build", &["test"]),
            stage("deploy", &["test"]),
        ])
        .unwrap()
    }

    #[test]
    fn test_batches_follow_dependency_levels() {
        let g = deploy_graph();
        assert_eq!(
            ids(g.batches().unwrap()),
            vec![
                vec!["lint".to_string()],
                vec!["test".to_string()],
                vec!["build".to_string(), "deploy".to_string()],
            ]
        );
    }

    #[test]
    fn test_batches_restart_per_call() {
        let g = deploy_graph();
        let first = ids(g.batches().unwrap());
        let second = ids(g.batches().unwrap());
        assert_eq!(first, second);
    }

    #[test]
    fn test_self_dependency_is_cycle() {
        let mut g = StageGraph::new();
        let err = g.add_stage(stage("loop", &["loop"])).unwrap_err();
        assert!(matches!(err, GraphError::Cycle { .. }));
        assert!(g.is_empty());
    }

    #[test]
    fn test_forward_reference_cycle_rejected() {
        let mut g = StageGraph::new();
        g.add_stage(stage("a", &["b"])).unwrap();
        let err = g.add_stage(stage("b", &["a"])).unwrap_err();
        assert_eq!(
            err,
            GraphError::Cycle {
                path: vec!["b".to_string(), "a".to_string(), "b".to_string()]
            }
        );
        assert_eq!(g.len(), 1);
    }

    #[test]
    fn test_forward_reference_resolves() {
        let mut g = StageGraph::new();
        g.add_stage(stage("deploy", &["build"])).unwrap();
        assert!(matches!(
            g.batches(),
            Err(GraphError::UnknownDependency { .. })
        ));
        g.add_stage(stage("build", &[])).unwrap();
        assert_eq!(
            ids(g.batches().unwrap()),
            vec![vec!["build".to_string()], vec!["deploy".to_string()]]
        );
    }

    #[test]
    fn test_duplicate_stage_rejected() {
        let mut g = StageGraph::new();
        g.add_stage(stage("lint", &[])).unwrap();
        assert!(matches!(
            g.add_stage(stage("lint", &[])),
            Err(GraphError::DuplicateStage { .. })
        ));
    }

    #[test]
    fn test_transitive_dependents_covers_chain() {
        let g = deploy_graph();
        let deps = g.transitive_dependents("lint").unwrap();
        assert_eq!(deps.len(), 3);
        assert!(deps.contains("deploy"));
        assert!(!deps.contains("lint"));
    }

    #[test]
    fn test_diamond_waits_for_both_branches() {
        let g = StageGraph::from_specs([
            stage("a", &[]),
            stage("b", &["a"]),
            stage("c", &["a"]),
            stage("d", &["b", "c"]),
        ])
        .unwrap();
        let batches = ids(g.batches().unwrap());
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[2], vec!["d".to_string()]);
    }

    #[test]
    fn test_unknown_stage_lookup() {
        let g = deploy_graph();
        assert!(matches!(
            g.dependents("missing"),
            Err(GraphError::StageNotFound { .. })
        ));
        assert_eq!(g.predecessors("build").unwrap(), ["test".to_string()]);
    }
}
