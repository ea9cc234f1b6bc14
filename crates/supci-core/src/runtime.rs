//! Container runtime seam for the integration instance.
//!
//! The isolation flags are carried as an opaque [`CapabilityGrants`] value;
//! the runtime translates them, the orchestration core never inspects them.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::InstanceConfig;
use crate::error::{ReleaseError, Result};
use crate::process::{CommandSpec, ProcessRunner};

/// A bind mount into the instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    pub source: PathBuf,
    pub target: PathBuf,
    pub read_only: bool,
}

impl Mount {
    pub fn rw(source: impl Into<PathBuf>, target: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            read_only: false,
        }
    }

    pub fn ro(source: impl Into<PathBuf>, target: impl Into<PathBuf>) -> Self {
        Self {
            read_only: true,
            ..Self::rw(source, target)
        }
    }
}

/// Fixed set of privileges granted to the instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityGrants {
    pub privileged: bool,
    pub security_opts: Vec<String>,
    pub mounts: Vec<Mount>,
}

impl CapabilityGrants {
    /// Grants a Supervisor instance needs: privileged, unconfined, with the
    /// container socket, D-Bus socket, data directory and machine id.
    pub fn supervisor(instance: &InstanceConfig) -> Self {
        Self {
            privileged: true,
            security_opts: vec![
                "seccomp=unconfined".to_string(),
                "apparmor=unconfined".to_string(),
            ],
            mounts: vec![
                Mount::rw("/run/docker.sock", "/run/docker.sock"),
                Mount::ro("/run/dbus", "/run/dbus"),
                Mount::rw(instance.data_dir.clone(), "/data"),
                Mount::ro("/etc/machine-id", "/etc/machine-id"),
            ],
        }
    }
}

/// Everything needed to start the instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchSpec {
    pub name: String,
    pub image: String,
    pub grants: CapabilityGrants,
    pub env: BTreeMap<String, String>,
    pub control_port: u16,
}

impl LaunchSpec {
    /// Development Supervisor on a fixed synthetic machine type.
    pub fn supervisor(image: impl Into<String>, instance: &InstanceConfig) -> Self {
        let mut env = BTreeMap::new();
        env.insert(
            "SUPERVISOR_SHARE".to_string(),
            instance.data_dir.to_string_lossy().to_string(),
        );
        env.insert("SUPERVISOR_NAME".to_string(), instance.container_name.clone());
        env.insert("SUPERVISOR_DEV".to_string(), "1".to_string());
        env.insert("SUPERVISOR_MACHINE".to_string(), instance.machine.clone());

        Self {
            name: instance.container_name.clone(),
            image: image.into(),
            grants: CapabilityGrants::supervisor(instance),
            env,
            control_port: instance.control_port,
        }
    }
}

/// Identity of a started instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceHandle {
    pub id: String,
    /// `host:port` of the control API.
    pub address: String,
    pub started_at: DateTime<Utc>,
}

/// Container runtime operations used by the integration runner.
///
/// `logs` and `remove` take no cancellation token: they run on the way out
/// of a cancelled run.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn pull(&self, image: &str, cancel: &CancellationToken) -> Result<()>;

    async fn tag(&self, source: &str, target: &str, cancel: &CancellationToken) -> Result<()>;

    async fn launch(&self, spec: &LaunchSpec, cancel: &CancellationToken)
        -> Result<InstanceHandle>;

    async fn logs(&self, instance: &InstanceHandle) -> Result<String>;

    async fn remove(&self, instance: &InstanceHandle) -> Result<()>;
}

/// Docker CLI backed runtime.
pub struct DockerRuntime {
    /// CLI prefix, e.g. `["docker"]` or `["sudo", "docker"]`.
    cli: Vec<String>,
    timeout_secs: u64,
}

impl DockerRuntime {
    pub fn new(timeout_secs: u64) -> Self {
        Self {
            cli: vec!["docker".to_string()],
            timeout_secs,
        }
    }

    pub fn with_cli(mut self, cli: Vec<String>) -> Self {
        if !cli.is_empty() {
            self.cli = cli;
        }
        self
    }

    fn docker(&self, name: &str, args: Vec<String>) -> CommandSpec {
        let mut argv = self.cli.clone();
        argv.extend(args);
        CommandSpec::new(name, argv).with_timeout(self.timeout_secs)
    }

    async fn network_address(
        &self,
        id: &str,
        control_port: u16,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let inspect = self.docker(
            "docker_inspect",
            vec![
                "inspect".to_string(),
                "-f".to_string(),
                "{{range .NetworkSettings.Networks}}{{.IPAddress}}{{end}}".to_string(),
                id.to_string(),
            ],
        );
        let output = ProcessRunner::execute_checked(&inspect, cancel).await?;
        let ip = output.stdout.trim();
        if ip.is_empty() {
            return Err(ReleaseError::Provision(format!(
                "container {id} has no network address"
            )));
        }
        Ok(format!("{ip}:{control_port}"))
    }

    /// Remove a container that never became an [`InstanceHandle`].
    async fn discard(&self, container: &str) {
        let rm = self.docker(
            "docker_rm",
            vec!["rm".to_string(), "-f".to_string(), container.to_string()],
        );
        if let Err(e) = ProcessRunner::execute_checked(&rm, &CancellationToken::new()).await {
            warn!(container, error = %e, "failed to remove half-started instance");
        }
    }

    /// `docker run` arguments for a launch spec.
    pub fn run_args(spec: &LaunchSpec) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            spec.name.clone(),
        ];
        if spec.grants.privileged {
            args.push("--privileged".to_string());
        }
        for opt in &spec.grants.security_opts {
            args.push("--security-opt".to_string());
            args.push(opt.clone());
        }
        for mount in &spec.grants.mounts {
            let mut volume = format!(
                "{}:{}",
                mount.source.to_string_lossy(),
                mount.target.to_string_lossy()
            );
            volume.push_str(if mount.read_only { ":ro" } else { ":rw" });
            args.push("-v".to_string());
            args.push(volume);
        }
        for (key, value) in &spec.env {
            args.push("-e".to_string());
            args.push(format!("{key}={value}"));
        }
        args.push(spec.image.clone());
        args
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn pull(&self, image: &str, cancel: &CancellationToken) -> Result<()> {
        let spec = self.docker("docker_pull", vec!["pull".to_string(), image.to_string()]);
        ProcessRunner::execute_checked(&spec, cancel).await?;
        Ok(())
    }

    async fn tag(&self, source: &str, target: &str, cancel: &CancellationToken) -> Result<()> {
        let spec = self.docker(
            "docker_tag",
            vec!["tag".to_string(), source.to_string(), target.to_string()],
        );
        ProcessRunner::execute_checked(&spec, cancel).await?;
        Ok(())
    }

    async fn launch(
        &self,
        spec: &LaunchSpec,
        cancel: &CancellationToken,
    ) -> Result<InstanceHandle> {
        // A leftover container from an aborted run would block the name.
        let stale = self.docker(
            "docker_rm_stale",
            vec!["rm".to_string(), "-f".to_string(), spec.name.clone()],
        );
        let _ = ProcessRunner::execute(&stale, cancel).await;

        let run = self.docker("docker_run", Self::run_args(spec));
        let output = match ProcessRunner::execute_checked(&run, cancel).await {
            Ok(output) => output,
            Err(e) => {
                // `run -d` can create the container and then fail to start it.
                self.discard(&spec.name).await;
                return Err(e);
            }
        };
        let id = output.stdout.trim().to_string();
        if id.is_empty() {
            self.discard(&spec.name).await;
            return Err(ReleaseError::Provision(
                "docker run returned no container id".to_string(),
            ));
        }

        // From here on the container exists and must not outlive an error.
        let address = match self.network_address(&id, spec.control_port, cancel).await {
            Ok(address) => address,
            Err(e) => {
                self.discard(&id).await;
                return Err(e);
            }
        };

        let handle = InstanceHandle {
            id,
            address,
            started_at: Utc::now(),
        };
        info!(container = %handle.id, address = %handle.address, "instance started");
        Ok(handle)
    }

    async fn logs(&self, instance: &InstanceHandle) -> Result<String> {
        let spec = self.docker(
            "docker_logs",
            vec!["logs".to_string(), instance.id.clone()],
        );
        let output = ProcessRunner::execute_checked(&spec, &CancellationToken::new()).await?;
        // The instance logs to both streams.
        Ok(format!("{}{}", output.stdout, output.stderr))
    }

    async fn remove(&self, instance: &InstanceHandle) -> Result<()> {
        debug!(container = %instance.id, "removing instance");
        let spec = self.docker(
            "docker_rm",
            vec!["rm".to_string(), "-f".to_string(), instance.id.clone()],
        );
        ProcessRunner::execute_checked(&spec, &CancellationToken::new()).await?;
        Ok(())
    }
}
