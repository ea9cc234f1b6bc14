//! Release pipeline assembly.
//!
//! Wires the collaborators into the job graph:
//!
//! ```text
//! build:<arch> (×N) ──┬──> sign ─────────┬──> version
//!                     └──> integration ──┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::build::{
    ArtifactBuilder, BuildAction, CacheBuilder, CommandCacheBuilder, CommandPackager,
    CommandRegistryLogin, Packager, RegistryLogin,
};
use crate::config::{validate, ReleaseConfig};
use crate::context::{RunContext, Trigger};
use crate::control::{ControlApi, HttpControlApi};
use crate::dag::{Guard, JobGraph, JobNode};
use crate::error::{ReleaseError, Result};
use crate::integration::{IntegrationAction, IntegrationRunner};
use crate::matrix::ArchitectureMatrix;
use crate::orchestrator::{Orchestrator, PlannedJob, RunReport};
use crate::publish::{FileVersionStore, PublishAction, VersionPublisher, VersionStore};
use crate::runtime::{ContainerRuntime, DockerRuntime};
use crate::sign::{CommandSigner, SignAction, Signer};
use crate::version::{ChangeSource, VersionResolver};

pub const SIGN_JOB: &str = "sign";
pub const INTEGRATION_JOB: &str = "integration";
pub const VERSION_JOB: &str = "version";

/// `build:<arch>`
pub fn build_job_name(architecture: &str) -> String {
    format!("build:{architecture}")
}

/// External services a run talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub packager: Arc<dyn Packager>,
    pub cache: Arc<dyn CacheBuilder>,
    pub login: Arc<dyn RegistryLogin>,
    pub signer: Arc<dyn Signer>,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub control: Arc<dyn ControlApi>,
    pub store: Arc<dyn VersionStore>,
}

impl Collaborators {
    /// Command-line tools, the Docker CLI, HTTP control API and a JSON
    /// version file. `SUPERVISOR_TOKEN` authenticates control calls if set.
    pub fn from_config(config: &ReleaseConfig) -> Result<Self> {
        let templates = config.commands.clone();
        let control = HttpControlApi::new(
            Duration::from_secs(30),
            std::env::var("SUPERVISOR_TOKEN").ok(),
        )?;
        Ok(Self {
            packager: Arc::new(CommandPackager::new(templates.clone())),
            cache: Arc::new(CommandCacheBuilder::new(
                templates.clone(),
                config.workspace.clone(),
            )),
            login: Arc::new(CommandRegistryLogin::new(templates.clone())),
            signer: Arc::new(CommandSigner::new(templates.clone())),
            runtime: Arc::new(
                DockerRuntime::new(templates.timeout_secs).with_cli(templates.container_cli.clone()),
            ),
            control: Arc::new(control),
            store: Arc::new(FileVersionStore::new(config.version_store_path.clone())),
        })
    }
}

/// Build the release job graph for a matrix.
pub fn release_graph(
    config: Arc<ReleaseConfig>,
    matrix: &ArchitectureMatrix,
    collab: &Collaborators,
) -> Result<JobGraph> {
    let builder = Arc::new(ArtifactBuilder::new(
        Arc::clone(&config),
        Arc::clone(&collab.packager),
        Arc::clone(&collab.cache),
        Arc::clone(&collab.login),
    ));

    let mut graph = JobGraph::new();
    let build_jobs: Vec<String> = matrix.iter().map(build_job_name).collect();
    for (arch, name) in matrix.iter().zip(&build_jobs) {
        graph.add_node(JobNode::new(
            name.clone(),
            Arc::new(BuildAction::new(Arc::clone(&builder), arch)),
        ))?;
    }

    let sign = SignAction::new(
        Arc::clone(&collab.signer),
        config.workspace.clone(),
        config.signer_organization.clone(),
    );
    graph.add_node(
        JobNode::new(SIGN_JOB, Arc::new(sign))
            .depends_on(build_jobs.iter().cloned())
            .guarded(Guard::publish_only()),
    )?;

    let runner = IntegrationRunner::new(
        Arc::clone(&config),
        builder,
        Arc::clone(&collab.runtime),
        Arc::clone(&collab.control),
    );
    graph.add_node(
        JobNode::new(INTEGRATION_JOB, Arc::new(IntegrationAction::new(runner)))
            .depends_on(build_jobs.iter().cloned()),
    )?;

    let publisher = VersionPublisher::new(Arc::clone(&collab.store), config.artifact_name.clone());
    graph.add_node(
        JobNode::new(VERSION_JOB, Arc::new(PublishAction::new(publisher)))
            .depends_on([SIGN_JOB, INTEGRATION_JOB])
            .guarded(Guard::publish_only()),
    )?;

    Ok(graph)
}

/// One end-to-end release run.
pub struct ReleaseRun {
    config: Arc<ReleaseConfig>,
    collab: Collaborators,
}

impl ReleaseRun {
    pub fn new(config: ReleaseConfig, collab: Collaborators) -> Self {
        Self {
            config: Arc::new(config),
            collab,
        }
    }

    pub fn config(&self) -> &ReleaseConfig {
        &self.config
    }

    /// Validate configuration and resolve the run context. Nothing runs yet.
    pub async fn prepare(
        &self,
        trigger: &Trigger,
        changes: &dyn ChangeSource,
        now: DateTime<Utc>,
    ) -> Result<(RunContext, Orchestrator)> {
        validate(&self.config)?;
        let matrix = ArchitectureMatrix::from_config(&self.config)?;
        // The integration instance runs an artifact this run produced.
        if !matrix.contains(&self.config.runner_architecture) {
            return Err(ReleaseError::Configuration(format!(
                "runner architecture '{}' is not in the build matrix",
                self.config.runner_architecture
            )));
        }
        let ctx = VersionResolver::from_config(&self.config)
            .resolve(trigger, changes, now)
            .await?;
        let graph = release_graph(Arc::clone(&self.config), &matrix, &self.collab)?;
        Ok((ctx, Orchestrator::new(graph)?))
    }

    /// Job listing with guard results for a trigger.
    pub async fn plan(
        &self,
        trigger: &Trigger,
        changes: &dyn ChangeSource,
        now: DateTime<Utc>,
    ) -> Result<Vec<PlannedJob>> {
        let (ctx, orchestrator) = self.prepare(trigger, changes, now).await?;
        orchestrator.plan(&ctx)
    }

    /// Resolve, then execute the whole graph.
    ///
    /// Resolution and matrix errors surface here before any job starts.
    pub async fn run(
        &self,
        trigger: &Trigger,
        changes: &dyn ChangeSource,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<RunReport> {
        let (ctx, orchestrator) = self.prepare(trigger, changes, now).await?;
        info!(
            jobs = orchestrator.graph().len(),
            version = %ctx.version,
            publish = ctx.publish,
            "starting release run"
        );
        orchestrator.execute(Arc::new(ctx), cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::*;

    fn collaborators() -> Collaborators {
        Collaborators {
            packager: Arc::new(FakePackager::new()),
            cache: Arc::new(FakeCacheBuilder::new()),
            login: Arc::new(FakeRegistryLogin::new()),
            signer: Arc::new(FakeSigner::new()),
            runtime: Arc::new(FakeRuntime::new()),
            control: Arc::new(ScriptedControlApi::new()),
            store: Arc::new(MemoryVersionStore::new()),
        }
    }

    #[test]
    fn test_release_graph_shape() {
        let config = Arc::new(ReleaseConfig::default());
        let matrix = ArchitectureMatrix::from_config(&config).unwrap();
        let graph = release_graph(config, &matrix, &collaborators()).unwrap();

        assert_eq!(graph.len(), 5);
        let levels = graph.levels().unwrap();
        assert_eq!(levels[0], vec!["build:aarch64", "build:amd64"]);
        assert_eq!(levels[1], vec![SIGN_JOB, INTEGRATION_JOB]);
        assert_eq!(levels[2], vec![VERSION_JOB]);
        assert_eq!(
            graph.node(VERSION_JOB).unwrap().guard.label(),
            "publish"
        );
        assert_eq!(graph.node(INTEGRATION_JOB).unwrap().guard.label(), "always");
    }

    #[test]
    fn test_build_job_name() {
        assert_eq!(build_job_name("armv7"), "build:armv7");
    }
}
