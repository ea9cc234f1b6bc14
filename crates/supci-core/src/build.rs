//! Per-architecture artifact builds.
//!
//! One [`BuildAction`] exists per architecture in the matrix. Cells share no
//! mutable state; each owns its cache scope `(architecture, platform tag)`.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use crate::config::{render_template, CommandTemplates, ReleaseConfig};
use crate::context::RunContext;
use crate::dag::{JobAction, JobFailure};
use crate::error::{ReleaseError, Result};
use crate::process::{CommandSpec, ProcessRunner};

/// Tag given to locally built test images and the integration instance.
pub const RUNNER_TAG: &str = "runner";

/// Input handed to the packager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRequest {
    pub architecture: String,
    pub version: String,
    /// Image repository without tag.
    pub image: String,
    /// Tags to apply; the first is the primary tag.
    pub tags: Vec<String>,
    pub test_mode: bool,
    pub workspace: PathBuf,
}

/// A built image, addressed by content digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildArtifact {
    pub architecture: String,
    pub image: String,
    pub tags: Vec<String>,
    /// `sha256:<hex>`
    pub digest: String,
}

impl BuildArtifact {
    /// Content-addressed reference, `image@sha256:...`.
    pub fn reference(&self) -> String {
        format!("{}@{}", self.image, self.digest)
    }
}

/// Dependency-cache entry scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheScope {
    pub architecture: String,
    pub platform_tag: String,
    pub abi: String,
}

/// Turns a workspace into a container image.
#[async_trait]
pub trait Packager: Send + Sync {
    async fn package(
        &self,
        request: &BuildRequest,
        cancel: &CancellationToken,
    ) -> Result<BuildArtifact>;
}

/// Rebuilds the dependency cache for one scope.
#[async_trait]
pub trait CacheBuilder: Send + Sync {
    async fn rebuild(&self, scope: &CacheScope, cancel: &CancellationToken) -> Result<()>;
}

/// Resolves registry credentials.
#[async_trait]
pub trait RegistryLogin: Send + Sync {
    async fn login(&self, registry: &str, cancel: &CancellationToken) -> Result<()>;
}

/// One matrix cell.
#[derive(Debug, Clone)]
pub struct BuildJob {
    pub architecture: String,
    pub context: Arc<RunContext>,
    pub cache_rebuild: bool,
}

impl BuildJob {
    pub fn new(architecture: impl Into<String>, context: Arc<RunContext>) -> Self {
        let cache_rebuild = context.requirements_changed;
        Self {
            architecture: architecture.into(),
            context,
            cache_rebuild,
        }
    }
}

/// Tags for a build: the version plus `runner` in test mode, or plus the
/// channel (and `latest` for stable) when publishing.
pub fn artifact_tags(ctx: &RunContext) -> Vec<String> {
    let mut tags = vec![ctx.version.clone()];
    if ctx.test_mode() {
        tags.push(RUNNER_TAG.to_string());
    } else {
        tags.push(ctx.channel.clone());
        if ctx.stable {
            tags.push("latest".to_string());
        }
    }
    tags.dedup();
    tags
}

/// Builds artifacts for matrix cells.
pub struct ArtifactBuilder {
    packager: Arc<dyn Packager>,
    cache: Arc<dyn CacheBuilder>,
    login: Arc<dyn RegistryLogin>,
    config: Arc<ReleaseConfig>,
}

impl ArtifactBuilder {
    pub fn new(
        config: Arc<ReleaseConfig>,
        packager: Arc<dyn Packager>,
        cache: Arc<dyn CacheBuilder>,
        login: Arc<dyn RegistryLogin>,
    ) -> Self {
        Self {
            packager,
            cache,
            login,
            config,
        }
    }

    #[instrument(skip_all, fields(arch = %job.architecture))]
    pub async fn build(&self, job: &BuildJob, cancel: &CancellationToken) -> Result<BuildArtifact> {
        let ctx = &job.context;
        let arch = job.architecture.as_str();
        let build_err = |reason: String| ReleaseError::Build {
            architecture: arch.to_string(),
            reason,
        };

        // A required rebuild that fails must not fall through to a stale cache.
        if job.cache_rebuild {
            let scope = CacheScope {
                architecture: arch.to_string(),
                platform_tag: self.config.cache_platform_tag.clone(),
                abi: self.config.cache_abi.clone(),
            };
            info!(platform = %scope.platform_tag, "rebuilding dependency cache");
            self.cache
                .rebuild(&scope, cancel)
                .await
                .map_err(|e| passthrough_cancel(e, |e| build_err(format!("cache rebuild: {e}"))))?;
        }

        if ctx.publish {
            self.login
                .login(&self.config.registry, cancel)
                .await
                .map_err(|e| passthrough_cancel(e, |e| build_err(format!("registry login: {e}"))))?;
        }

        let request = BuildRequest {
            architecture: arch.to_string(),
            version: ctx.version.clone(),
            image: self.config.image_for(arch),
            tags: artifact_tags(ctx),
            test_mode: ctx.test_mode(),
            workspace: self.config.workspace.clone(),
        };

        let artifact = self
            .packager
            .package(&request, cancel)
            .await
            .map_err(|e| passthrough_cancel(e, |e| build_err(e.to_string())))?;

        info!(reference = %artifact.reference(), tags = ?artifact.tags, "artifact built");
        Ok(artifact)
    }
}

fn passthrough_cancel(e: ReleaseError, wrap: impl FnOnce(ReleaseError) -> ReleaseError) -> ReleaseError {
    if e.is_cancelled() {
        e
    } else {
        wrap(e)
    }
}

/// DAG action for one architecture.
pub struct BuildAction {
    builder: Arc<ArtifactBuilder>,
    architecture: String,
}

impl BuildAction {
    pub fn new(builder: Arc<ArtifactBuilder>, architecture: impl Into<String>) -> Self {
        Self {
            builder,
            architecture: architecture.into(),
        }
    }
}

#[async_trait]
impl JobAction for BuildAction {
    async fn run(&self, ctx: &RunContext, cancel: &CancellationToken) -> std::result::Result<(), JobFailure> {
        let job = BuildJob::new(self.architecture.clone(), Arc::new(ctx.clone()));
        self.builder.build(&job, cancel).await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Command-backed collaborators
// ---------------------------------------------------------------------------

/// Packager driven by an argument template.
pub struct CommandPackager {
    templates: CommandTemplates,
}

impl CommandPackager {
    pub fn new(templates: CommandTemplates) -> Self {
        Self { templates }
    }

    pub fn argv(&self, request: &BuildRequest) -> Vec<String> {
        let workspace = request.workspace.to_string_lossy().to_string();
        let mut argv = render_template(
            &self.templates.packager,
            &[
                ("arch", request.architecture.as_str()),
                ("version", request.version.as_str()),
                ("image", request.image.as_str()),
                ("workspace", workspace.as_str()),
            ],
        );
        for tag in request.tags.iter().filter(|t| **t != request.version) {
            argv.push(self.templates.packager_tag_flag.clone());
            argv.push(tag.clone());
        }
        if request.test_mode {
            argv.extend(self.templates.packager_test_args.iter().cloned());
        }
        argv
    }
}

#[async_trait]
impl Packager for CommandPackager {
    async fn package(
        &self,
        request: &BuildRequest,
        cancel: &CancellationToken,
    ) -> Result<BuildArtifact> {
        let spec = CommandSpec::new(format!("package_{}", request.architecture), self.argv(request))
            .with_timeout(self.templates.timeout_secs);
        let output = ProcessRunner::execute_checked(&spec, cancel).await?;

        let digest = find_digest(&output.stdout).unwrap_or_else(|| {
            let mut hasher = Sha256::new();
            hasher.update(request.image.as_bytes());
            hasher.update(b":");
            hasher.update(request.version.as_bytes());
            hasher.update(b"\n");
            hasher.update(output.stdout.as_bytes());
            format!("sha256:{}", hex::encode(hasher.finalize()))
        });

        Ok(BuildArtifact {
            architecture: request.architecture.clone(),
            image: request.image.clone(),
            tags: request.tags.clone(),
            digest,
        })
    }
}

/// Last `sha256:<64 hex>` token in packager output.
pub fn find_digest(output: &str) -> Option<String> {
    output
        .match_indices("sha256:")
        .filter_map(|(i, prefix)| {
            let hex_part: String = output[i + prefix.len()..]
                .chars()
                .take_while(|c| c.is_ascii_hexdigit())
                .collect();
            (hex_part.len() == 64).then(|| format!("sha256:{}", hex_part.to_ascii_lowercase()))
        })
        .last()
}

/// Cache rebuild driven by an argument template.
pub struct CommandCacheBuilder {
    templates: CommandTemplates,
    workspace: PathBuf,
}

impl CommandCacheBuilder {
    pub fn new(templates: CommandTemplates, workspace: PathBuf) -> Self {
        Self {
            templates,
            workspace,
        }
    }
}

#[async_trait]
impl CacheBuilder for CommandCacheBuilder {
    async fn rebuild(&self, scope: &CacheScope, cancel: &CancellationToken) -> Result<()> {
        let workspace = self.workspace.to_string_lossy().to_string();
        let argv = render_template(
            &self.templates.cache_rebuild,
            &[
                ("arch", scope.architecture.as_str()),
                ("platform", scope.platform_tag.as_str()),
                ("abi", scope.abi.as_str()),
                ("workspace", workspace.as_str()),
            ],
        );
        let spec = CommandSpec::new(format!("cache_{}", scope.architecture), argv)
            .with_timeout(self.templates.timeout_secs);
        ProcessRunner::execute_checked(&spec, cancel).await?;
        Ok(())
    }
}

/// Registry login with credentials from `SUPCI_REGISTRY_USER` and
/// `SUPCI_REGISTRY_TOKEN`.
pub struct CommandRegistryLogin {
    templates: CommandTemplates,
}

impl CommandRegistryLogin {
    pub fn new(templates: CommandTemplates) -> Self {
        Self { templates }
    }
}

#[async_trait]
impl RegistryLogin for CommandRegistryLogin {
    async fn login(&self, registry: &str, cancel: &CancellationToken) -> Result<()> {
        let username = std::env::var("SUPCI_REGISTRY_USER").map_err(|_| {
            ReleaseError::Configuration("SUPCI_REGISTRY_USER not set".to_string())
        })?;
        let token = std::env::var("SUPCI_REGISTRY_TOKEN").map_err(|_| {
            ReleaseError::Configuration("SUPCI_REGISTRY_TOKEN not set".to_string())
        })?;
        let host = registry.split('/').next().unwrap_or(registry);
        let argv = render_template(
            &self.templates.registry_login,
            &[("registry_host", host), ("username", username.as_str())],
        );
        let spec = CommandSpec::new("registry_login", argv)
            .with_stdin(token)
            .with_timeout(120);
        ProcessRunner::execute_checked(&spec, cancel).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::TriggerKind;

    fn ctx(publish: bool, stable: bool) -> RunContext {
        RunContext {
            trigger_kind: TriggerKind::Manual,
            channel: "beta".to_string(),
            version: "2024.10.1".to_string(),
            publish,
            stable,
            requirements_changed: false,
        }
    }

    #[test]
    fn test_artifact_tags_by_mode() {
        assert_eq!(artifact_tags(&ctx(false, false)), vec!["2024.10.1", "runner"]);
        assert_eq!(artifact_tags(&ctx(true, false)), vec!["2024.10.1", "beta"]);
        assert_eq!(
            artifact_tags(&ctx(true, true)),
            vec!["2024.10.1", "beta", "latest"]
        );
    }

    #[test]
    fn test_find_digest_takes_last_full_digest() {
        let a = "a".repeat(64);
        let b = "B".repeat(64);
        let out = format!("pushed sha256:{a}\nshort sha256:abc\nfinal sha256:{b}\n");
        assert_eq!(find_digest(&out), Some(format!("sha256:{}", "b".repeat(64))));
        assert_eq!(find_digest("no digest here"), None);
    }

    #[test]
    fn test_packager_argv_test_mode() {
        let packager = CommandPackager::new(CommandTemplates::default());
        let request = BuildRequest {
            architecture: "amd64".to_string(),
            version: "2024.10.1".to_string(),
            image: "ghcr.io/home-assistant/amd64-hassio-supervisor".to_string(),
            tags: vec!["2024.10.1".to_string(), "runner".to_string()],
            test_mode: true,
            workspace: PathBuf::from("/src"),
        };
        let argv = packager.argv(&request);
        assert!(argv.contains(&"--amd64".to_string()));
        assert!(argv.contains(&"/src:/data".to_string()));
        assert!(argv.contains(&"--test".to_string()));
        let tag_pos = argv
            .iter()
            .position(|a| a == "--additional-tag")
            .expect("tag flag");
        assert_eq!(argv[tag_pos + 1], "runner");
    }

    #[test]
    fn test_build_job_inherits_cache_decision() {
        let mut context = ctx(false, false);
        context.requirements_changed = true;
        let job = BuildJob::new("aarch64", Arc::new(context));
        assert!(job.cache_rebuild);
    }

    #[tokio::test]
    async fn test_command_packager_uses_output_digest() {
        let digest = "c".repeat(64);
        let mut templates = CommandTemplates::default();
        templates.packager = vec![
            "sh".to_string(),
            "-c".to_string(),
            format!("echo built {{image}} sha256:{digest}"),
        ];
        templates.packager_tag_flag = "#".to_string();
        templates.packager_test_args = Vec::new();
        let packager = CommandPackager::new(templates);
        let request = BuildRequest {
            architecture: "amd64".to_string(),
            version: "1.0.0".to_string(),
            image: "repo/img".to_string(),
            tags: vec!["1.0.0".to_string()],
            test_mode: false,
            workspace: PathBuf::from("."),
        };
        let artifact = packager
            .package(&request, &CancellationToken::new())
            .await
            .expect("package");
        assert_eq!(artifact.digest, format!("sha256:{digest}"));
        assert_eq!(artifact.reference(), format!("repo/img@sha256:{digest}"));
    }
}
