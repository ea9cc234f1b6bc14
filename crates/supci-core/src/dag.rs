//! Job dependency graph.
//!
//! Jobs are nodes in a directed acyclic graph. An edge `A → B` means "B
//! depends on A": A must finish (succeeded or skipped) before B may run.
//! Each node carries a [`Guard`] over the [`RunContext`]; a false guard
//! skips the node without blocking its dependents.
//!
//! Ordering is computed via Kahn's algorithm with insertion order as the
//! tie-breaker, so plans are deterministic.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::context::RunContext;
use crate::error::ReleaseError;

/// A failed job: the error plus any diagnostics captured on the way out.
#[derive(Debug)]
pub struct JobFailure {
    pub error: ReleaseError,
    pub diagnostics: Option<String>,
}

impl JobFailure {
    pub fn with_diagnostics(error: ReleaseError, diagnostics: Option<String>) -> Self {
        Self { error, diagnostics }
    }
}

impl From<ReleaseError> for JobFailure {
    fn from(error: ReleaseError) -> Self {
        Self {
            error,
            diagnostics: None,
        }
    }
}

impl fmt::Display for JobFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

/// The work a job performs.
#[async_trait]
pub trait JobAction: Send + Sync {
    async fn run(&self, ctx: &RunContext, cancel: &CancellationToken) -> Result<(), JobFailure>;
}

/// Predicate deciding whether a job executes in this run.
#[derive(Clone)]
pub struct Guard {
    label: &'static str,
    predicate: Arc<dyn Fn(&RunContext) -> bool + Send + Sync>,
}

impl Guard {
    pub fn new<F>(label: &'static str, predicate: F) -> Self
    where
        F: Fn(&RunContext) -> bool + Send + Sync + 'static,
    {
        Self {
            label,
            predicate: Arc::new(predicate),
        }
    }

    pub fn always() -> Self {
        Self::new("always", |_| true)
    }

    /// Only in publish mode.
    pub fn publish_only() -> Self {
        Self::new("publish", |ctx| ctx.publish)
    }

    pub fn evaluate(&self, ctx: &RunContext) -> bool {
        (self.predicate)(ctx)
    }

    pub fn label(&self) -> &'static str {
        self.label
    }
}

impl fmt::Debug for Guard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Guard").field("label", &self.label).finish()
    }
}

/// A single job in the graph.
#[derive(Clone)]
pub struct JobNode {
    pub name: String,
    pub dependencies: Vec<String>,
    pub guard: Guard,
    pub action: Arc<dyn JobAction>,
}

impl JobNode {
    pub fn new(name: impl Into<String>, action: Arc<dyn JobAction>) -> Self {
        Self {
            name: name.into(),
            dependencies: Vec::new(),
            guard: Guard::always(),
            action,
        }
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn guarded(mut self, guard: Guard) -> Self {
        self.guard = guard;
        self
    }
}

impl fmt::Debug for JobNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobNode")
            .field("name", &self.name)
            .field("dependencies", &self.dependencies)
            .field("guard", &self.guard)
            .finish()
    }
}

/// Directed dependency graph over [`JobNode`]s.
#[derive(Debug, Clone, Default)]
pub struct JobGraph {
    nodes: Vec<JobNode>,
    index: HashMap<String, usize>,
}

impl JobGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node. Names must be unique.
    pub fn add_node(&mut self, node: JobNode) -> Result<(), ReleaseError> {
        if self.index.contains_key(&node.name) {
            return Err(ReleaseError::Graph(format!(
                "duplicate job name: {}",
                node.name
            )));
        }
        self.index.insert(node.name.clone(), self.nodes.len());
        self.nodes.push(node);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, name: &str) -> Option<&JobNode> {
        self.index.get(name).map(|&i| &self.nodes[i])
    }

    /// Nodes in insertion order.
    pub fn nodes(&self) -> &[JobNode] {
        &self.nodes
    }

    /// Reject unknown dependencies and cycles.
    pub fn validate(&self) -> Result<(), ReleaseError> {
        for node in &self.nodes {
            for dep in &node.dependencies {
                if !self.index.contains_key(dep) {
                    return Err(ReleaseError::Graph(format!(
                        "job '{}' depends on unknown job '{}'",
                        node.name, dep
                    )));
                }
                if dep == &node.name {
                    return Err(ReleaseError::Graph(format!(
                        "job '{}' depends on itself",
                        node.name
                    )));
                }
            }
        }
        self.topological_order().map(|_| ())
    }

    /// Job names in dependency order (dependencies before dependents).
    pub fn topological_order(&self) -> Result<Vec<&str>, ReleaseError> {
        Ok(self.levels()?.into_iter().flatten().collect())
    }

    /// Jobs grouped by depth; jobs in one level have no edges between them.
    pub fn levels(&self) -> Result<Vec<Vec<&str>>, ReleaseError> {
        let mut in_degree: Vec<usize> = self
            .nodes
            .iter()
            .map(|n| {
                n.dependencies
                    .iter()
                    .filter(|d| self.index.contains_key(d.as_str()))
                    .count()
            })
            .collect();

        let mut current: VecDeque<usize> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, &deg)| deg == 0)
            .map(|(i, _)| i)
            .collect();

        let mut levels = Vec::new();
        let mut visited = 0usize;

        while !current.is_empty() {
            let mut level = Vec::new();
            let mut next = Vec::new();
            while let Some(i) = current.pop_front() {
                visited += 1;
                level.push(self.nodes[i].name.as_str());
                for (j, node) in self.nodes.iter().enumerate() {
                    let edges = node
                        .dependencies
                        .iter()
                        .filter(|d| **d == self.nodes[i].name)
                        .count();
                    if edges > 0 {
                        in_degree[j] -= edges;
                        if in_degree[j] == 0 {
                            next.push(j);
                        }
                    }
                }
            }
            next.sort_unstable();
            levels.push(level);
            current.extend(next);
        }

        if visited != self.nodes.len() {
            let stuck: Vec<String> = in_degree
                .iter()
                .enumerate()
                .filter(|(_, &deg)| deg > 0)
                .map(|(i, _)| self.nodes[i].name.clone())
                .collect();
            return Err(ReleaseError::Graph(format!(
                "dependency cycle detected involving jobs: {stuck:?}"
            )));
        }

        Ok(levels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::TriggerKind;

    struct Noop;

    #[async_trait]
    impl JobAction for Noop {
        async fn run(&self, _ctx: &RunContext, _cancel: &CancellationToken) -> Result<(), JobFailure> {
            Ok(())
        }
    }

    fn node(name: &str, deps: &[&str]) -> JobNode {
        JobNode::new(name, Arc::new(Noop)).depends_on(deps.iter().copied())
    }

    fn ctx(publish: bool) -> RunContext {
        RunContext {
            trigger_kind: TriggerKind::Manual,
            channel: "dev".to_string(),
            version: "1.0.0".to_string(),
            publish,
            stable: false,
            requirements_changed: false,
        }
    }

    #[test]
    fn test_levels_follow_dependencies() {
        let mut graph = JobGraph::new();
        graph.add_node(node("build:amd64", &[])).unwrap();
        graph.add_node(node("build:aarch64", &[])).unwrap();
        graph
            .add_node(node("sign", &["build:amd64", "build:aarch64"]))
            .unwrap();
        graph
            .add_node(node("integration", &["build:amd64", "build:aarch64"]))
            .unwrap();
        graph
            .add_node(node("version", &["sign", "integration"]))
            .unwrap();

        let levels = graph.levels().expect("levels");
        assert_eq!(
            levels,
            vec![
                vec!["build:amd64", "build:aarch64"],
                vec!["sign", "integration"],
                vec!["version"],
            ]
        );
        graph.validate().expect("valid graph");
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut graph = JobGraph::new();
        graph.add_node(node("a", &[])).unwrap();
        assert!(graph.add_node(node("a", &[])).is_err());
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let mut graph = JobGraph::new();
        graph.add_node(node("a", &["ghost"])).unwrap();
        let err = graph.validate().unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn test_cycle_detected() {
        let mut graph = JobGraph::new();
        graph.add_node(node("a", &["b"])).unwrap();
        graph.add_node(node("b", &["a"])).unwrap();
        graph.add_node(node("c", &[])).unwrap();
        let err = graph.topological_order().unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("cycle"));
        assert!(msg.contains("\"a\""));
        assert!(!msg.contains("\"c\""));
    }

    #[test]
    fn test_publish_guard() {
        let guard = Guard::publish_only();
        assert!(guard.evaluate(&ctx(true)));
        assert!(!guard.evaluate(&ctx(false)));
        assert!(Guard::always().evaluate(&ctx(false)));
        assert_eq!(guard.label(), "publish");
    }
}
