//! DAG executor.
//!
//! Every node whose dependencies are terminal is either resolved in place
//! (blocked, cancelled, skipped) or spawned onto the runtime. Spawned nodes
//! live in a `FuturesUnordered` work set; each completion re-scans the graph
//! in topological order.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::context::RunContext;
use crate::dag::{JobFailure, JobGraph};
use crate::error::{ReleaseError, Result};
use crate::obs;

/// Terminal status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Succeeded,
    Failed,
    /// Guard was false.
    Skipped,
    /// An upstream job failed.
    Blocked,
    /// Never started because the run was cancelled, or stopped by it.
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Skipped => "skipped",
            JobStatus::Blocked => "blocked",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Whether dependents may run after this status.
    pub fn satisfies_dependents(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Skipped)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOutcome {
    pub name: String,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// Result of one orchestrated run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub context: RunContext,
    pub started_at: DateTime<Utc>,
    /// Outcomes in topological order.
    pub outcomes: Vec<JobOutcome>,
    pub success: bool,
    /// Diagnostics captured by failed jobs, keyed by job name.
    pub diagnostics: BTreeMap<String, String>,
}

impl RunReport {
    pub fn outcome(&self, name: &str) -> Option<&JobOutcome> {
        self.outcomes.iter().find(|o| o.name == name)
    }

    pub fn status(&self, name: &str) -> Option<JobStatus> {
        self.outcome(name).map(|o| o.status)
    }

    pub fn failures(&self) -> impl Iterator<Item = &JobOutcome> {
        self.outcomes
            .iter()
            .filter(|o| !o.status.satisfies_dependents())
    }
}

/// One row of a dry-run plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedJob {
    pub name: String,
    pub dependencies: Vec<String>,
    pub guard: String,
    pub runs: bool,
}

/// Executes a [`JobGraph`] against one run context.
pub struct Orchestrator {
    graph: JobGraph,
}

impl Orchestrator {
    pub fn new(graph: JobGraph) -> Result<Self> {
        graph.validate()?;
        Ok(Self { graph })
    }

    pub fn graph(&self) -> &JobGraph {
        &self.graph
    }

    /// Topological listing with guard results, without running anything.
    pub fn plan(&self, ctx: &RunContext) -> Result<Vec<PlannedJob>> {
        let order = self.graph.topological_order()?;
        Ok(order
            .into_iter()
            .filter_map(|name| self.graph.node(name))
            .map(|node| PlannedJob {
                name: node.name.clone(),
                dependencies: node.dependencies.clone(),
                guard: node.guard.label().to_string(),
                runs: node.guard.evaluate(ctx),
            })
            .collect())
    }

    /// Run the graph to completion.
    pub async fn execute(&self, ctx: Arc<RunContext>, cancel: &CancellationToken) -> Result<RunReport> {
        let run_id = Uuid::new_v4();
        let span = obs::run_span(&run_id.to_string(), &ctx.version);
        self.execute_inner(run_id, ctx, cancel).instrument(span).await
    }

    async fn execute_inner(
        &self,
        run_id: Uuid,
        ctx: Arc<RunContext>,
        cancel: &CancellationToken,
    ) -> Result<RunReport> {
        let run_id_str = run_id.to_string();
        let started_at = Utc::now();
        let started = Instant::now();

        let nodes = self.graph.nodes();
        let positions: HashMap<&str, usize> = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.name.as_str(), i))
            .collect();
        let order: Vec<usize> = self
            .graph
            .topological_order()?
            .into_iter()
            .filter_map(|name| positions.get(name).copied())
            .collect();
        let deps: Vec<Vec<usize>> = nodes
            .iter()
            .map(|n| {
                n.dependencies
                    .iter()
                    .filter_map(|d| positions.get(d.as_str()).copied())
                    .collect()
            })
            .collect();
        // Guards are evaluated exactly once per run.
        let guards: Vec<bool> = nodes.iter().map(|n| n.guard.evaluate(&ctx)).collect();

        obs::emit_run_started(&run_id_str, nodes.len(), ctx.publish);

        let mut outcomes: Vec<Option<JobOutcome>> = vec![None; nodes.len()];
        let mut running = vec![false; nodes.len()];
        let mut diagnostics = BTreeMap::new();
        let mut in_flight = FuturesUnordered::new();

        loop {
            for &i in &order {
                if outcomes[i].is_some() || running[i] {
                    continue;
                }
                let statuses: Option<Vec<JobStatus>> = deps[i]
                    .iter()
                    .map(|&d| outcomes[d].as_ref().map(|o| o.status))
                    .collect();
                let Some(statuses) = statuses else {
                    continue;
                };

                let node = &nodes[i];
                let resolved = if statuses.iter().any(|s| !s.satisfies_dependents()) {
                    Some(JobStatus::Blocked)
                } else if cancel.is_cancelled() {
                    Some(JobStatus::Cancelled)
                } else if !guards[i] {
                    obs::emit_job_skipped(&node.name, node.guard.label());
                    Some(JobStatus::Skipped)
                } else {
                    None
                };

                if let Some(status) = resolved {
                    outcomes[i] = Some(JobOutcome {
                        name: node.name.clone(),
                        status,
                        error: None,
                        duration_ms: 0,
                    });
                    continue;
                }

                obs::emit_job_started(&node.name);
                running[i] = true;
                let action = Arc::clone(&node.action);
                let job_ctx = Arc::clone(&ctx);
                let job_cancel = cancel.child_token();
                let span = tracing::info_span!("supci.job", job = %node.name);
                let job_name = node.name.clone();
                let handle = tokio::spawn(
                    async move {
                        let job_started = Instant::now();
                        let result = action.run(&job_ctx, &job_cancel).await;
                        (result, job_started.elapsed().as_millis() as u64)
                    }
                    .instrument(span),
                );
                in_flight.push(async move {
                    match handle.await {
                        Ok((result, elapsed)) => (i, result, elapsed),
                        Err(join_err) => (
                            i,
                            Err(JobFailure::from(ReleaseError::Process {
                                command: job_name,
                                reason: format!("job task failed: {join_err}"),
                            })),
                            0,
                        ),
                    }
                });
            }

            let Some((i, result, duration_ms)) = in_flight.next().await else {
                break;
            };
            running[i] = false;

            let name = nodes[i].name.clone();
            let outcome = match result {
                Ok(()) => JobOutcome {
                    name: name.clone(),
                    status: JobStatus::Succeeded,
                    error: None,
                    duration_ms,
                },
                Err(failure) => {
                    obs::emit_job_failed(&name, &failure);
                    if let Some(text) = failure.diagnostics {
                        diagnostics.insert(name.clone(), text);
                    }
                    let status = if failure.error.is_cancelled() {
                        JobStatus::Cancelled
                    } else {
                        JobStatus::Failed
                    };
                    JobOutcome {
                        name: name.clone(),
                        status,
                        error: Some(failure.error.to_string()),
                        duration_ms,
                    }
                }
            };
            obs::emit_job_finished(&name, outcome.status.as_str(), duration_ms);
            outcomes[i] = Some(outcome);
        }

        let outcomes: Vec<JobOutcome> = order
            .iter()
            .filter_map(|&i| outcomes[i].take())
            .collect();
        let success = outcomes.len() == nodes.len()
            && outcomes.iter().all(|o| o.status.satisfies_dependents());

        obs::emit_run_finished(&run_id_str, started.elapsed().as_millis() as u64, success);

        Ok(RunReport {
            run_id,
            context: (*ctx).clone(),
            started_at,
            outcomes,
            success,
            diagnostics,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::TriggerKind;
    use crate::dag::{Guard, JobAction, JobNode};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        calls: AtomicUsize,
        fail: bool,
    }

    impl Counting {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl JobAction for Counting {
        async fn run(
            &self,
            _ctx: &RunContext,
            _cancel: &CancellationToken,
        ) -> std::result::Result<(), JobFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(JobFailure::with_diagnostics(
                    ReleaseError::Provision("boom".to_string()),
                    Some("instance log".to_string()),
                ))
            } else {
                Ok(())
            }
        }
    }

    fn ctx(publish: bool) -> Arc<RunContext> {
        Arc::new(RunContext {
            trigger_kind: TriggerKind::Manual,
            channel: "dev".to_string(),
            version: "1.0.0".to_string(),
            publish,
            stable: false,
            requirements_changed: false,
        })
    }

    #[tokio::test]
    async fn test_failure_blocks_dependents_and_keeps_diagnostics() {
        let a = Counting::new(false);
        let b = Counting::new(true);
        let c = Counting::new(false);
        let mut graph = JobGraph::new();
        graph.add_node(JobNode::new("a", a.clone())).unwrap();
        graph
            .add_node(JobNode::new("b", b.clone()).depends_on(["a"]))
            .unwrap();
        graph
            .add_node(JobNode::new("c", c.clone()).depends_on(["b"]))
            .unwrap();

        let report = Orchestrator::new(graph)
            .unwrap()
            .execute(ctx(false), &CancellationToken::new())
            .await
            .unwrap();

        assert!(!report.success);
        assert_eq!(report.status("a"), Some(JobStatus::Succeeded));
        assert_eq!(report.status("b"), Some(JobStatus::Failed));
        assert_eq!(report.status("c"), Some(JobStatus::Blocked));
        assert_eq!(c.calls(), 0);
        assert_eq!(
            report.diagnostics.get("b").map(String::as_str),
            Some("instance log")
        );
    }

    #[tokio::test]
    async fn test_skipped_guard_satisfies_dependents() {
        let guarded = Counting::new(false);
        let after = Counting::new(false);
        let mut graph = JobGraph::new();
        graph
            .add_node(JobNode::new("g", guarded.clone()).guarded(Guard::publish_only()))
            .unwrap();
        graph
            .add_node(JobNode::new("after", after.clone()).depends_on(["g"]))
            .unwrap();

        let report = Orchestrator::new(graph)
            .unwrap()
            .execute(ctx(false), &CancellationToken::new())
            .await
            .unwrap();

        assert!(report.success);
        assert_eq!(report.status("g"), Some(JobStatus::Skipped));
        assert_eq!(report.status("after"), Some(JobStatus::Succeeded));
        assert_eq!(guarded.calls(), 0);
        assert_eq!(after.calls(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_run_starts_nothing() {
        let a = Counting::new(false);
        let mut graph = JobGraph::new();
        graph.add_node(JobNode::new("a", a.clone())).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = Orchestrator::new(graph)
            .unwrap()
            .execute(ctx(false), &cancel)
            .await
            .unwrap();

        assert!(!report.success);
        assert_eq!(report.status("a"), Some(JobStatus::Cancelled));
        assert_eq!(a.calls(), 0);
    }

    #[test]
    fn test_plan_reports_guards() {
        let mut graph = JobGraph::new();
        graph
            .add_node(JobNode::new("a", Counting::new(false)))
            .unwrap();
        graph
            .add_node(
                JobNode::new("b", Counting::new(false))
                    .depends_on(["a"])
                    .guarded(Guard::publish_only()),
            )
            .unwrap();
        let plan = Orchestrator::new(graph).unwrap().plan(&ctx(false)).unwrap();
        assert_eq!(plan.len(), 2);
        assert!(plan[0].runs);
        assert!(!plan[1].runs);
        assert_eq!(plan[1].guard, "publish");
    }

    #[test]
    fn test_cyclic_graph_rejected() {
        let mut graph = JobGraph::new();
        graph
            .add_node(JobNode::new("a", Counting::new(false)).depends_on(["b"]))
            .unwrap();
        graph
            .add_node(JobNode::new("b", Counting::new(false)).depends_on(["a"]))
            .unwrap();
        assert!(matches!(
            Orchestrator::new(graph),
            Err(ReleaseError::Graph(_))
        ));
    }
}
