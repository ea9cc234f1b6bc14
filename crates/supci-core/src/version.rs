//! Version, channel and publish-mode resolution.
//!
//! [`VersionResolver`] is the only place trigger facts are interpreted. Its
//! output, a [`RunContext`], is handed to every job unchanged.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::ReleaseConfig;
use crate::context::{RunContext, Trigger};
use crate::error::{ReleaseError, Result};
use crate::process::{CommandSpec, ProcessRunner};

/// Channel for development builds.
pub const DEV_CHANNEL: &str = "dev";

/// Channel for tagged releases.
pub const RELEASE_CHANNEL: &str = "beta";

/// Source of the files touched by the triggering change.
#[async_trait]
pub trait ChangeSource: Send + Sync {
    async fn changed_files(&self, trigger: &Trigger) -> Result<Vec<String>>;
}

/// Lists changed files with `git diff --name-only`.
pub struct GitChangeSource {
    repo: PathBuf,
}

impl GitChangeSource {
    pub fn new(repo: impl Into<PathBuf>) -> Self {
        Self { repo: repo.into() }
    }

    fn diff_range(trigger: &Trigger) -> String {
        match trigger {
            Trigger::PullRequest { base_ref } => format!("origin/{base_ref}...HEAD"),
            _ => "HEAD~1...HEAD".to_string(),
        }
    }
}

#[async_trait]
impl ChangeSource for GitChangeSource {
    async fn changed_files(&self, trigger: &Trigger) -> Result<Vec<String>> {
        let spec = CommandSpec::new(
            "git_diff",
            vec![
                "git".to_string(),
                "-C".to_string(),
                self.repo.to_string_lossy().to_string(),
                "diff".to_string(),
                "--name-only".to_string(),
                Self::diff_range(trigger),
            ],
        )
        .with_env("GIT_TERMINAL_PROMPT", "0")
        .with_timeout(60);

        let output = ProcessRunner::execute_checked(&spec, &CancellationToken::new()).await?;
        Ok(output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }
}

/// Version/channel/publish portion of a run context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionInfo {
    pub channel: String,
    pub version: String,
    pub publish: bool,
    pub stable: bool,
}

/// Resolves a trigger into a [`RunContext`].
pub struct VersionResolver {
    default_branch: String,
    watch_list: Vec<String>,
}

impl VersionResolver {
    pub fn new(default_branch: impl Into<String>, watch_list: Vec<String>) -> Self {
        Self {
            default_branch: default_branch.into(),
            watch_list,
        }
    }

    pub fn from_config(config: &ReleaseConfig) -> Self {
        Self::new(config.default_branch.clone(), config.watch_list.clone())
    }

    /// Derive version, channel and publish flag. Pure for a fixed `now`.
    pub fn version_info(&self, trigger: &Trigger, now: DateTime<Utc>) -> Result<VersionInfo> {
        match trigger {
            Trigger::Manual(inputs) => {
                let version = inputs
                    .version
                    .as_deref()
                    .map(str::trim)
                    .filter(|v| !v.is_empty())
                    .ok_or_else(|| {
                        ReleaseError::Configuration(
                            "manual dispatch requires a version input".to_string(),
                        )
                    })?;
                if inputs.channel.trim().is_empty() {
                    return Err(ReleaseError::Configuration(
                        "manual dispatch requires a channel input".to_string(),
                    ));
                }
                Ok(VersionInfo {
                    channel: inputs.channel.trim().to_string(),
                    version: version.to_string(),
                    publish: inputs.publish,
                    stable: inputs.stable,
                })
            }
            Trigger::PullRequest { .. } => Ok(VersionInfo {
                channel: DEV_CHANNEL.to_string(),
                version: dev_version(now),
                publish: false,
                stable: false,
            }),
            Trigger::Release { tag } => {
                let tag = tag.trim();
                let version = tag.strip_prefix('v').unwrap_or(tag);
                if version.is_empty() {
                    return Err(ReleaseError::Configuration(
                        "release trigger has an empty tag".to_string(),
                    ));
                }
                Ok(VersionInfo {
                    channel: RELEASE_CHANNEL.to_string(),
                    version: version.to_string(),
                    publish: true,
                    stable: false,
                })
            }
            Trigger::Push { branch } => Ok(VersionInfo {
                channel: DEV_CHANNEL.to_string(),
                version: dev_version(now),
                publish: *branch == self.default_branch,
                stable: false,
            }),
        }
    }

    /// Resolve the full run context, including `requirements_changed`.
    pub async fn resolve(
        &self,
        trigger: &Trigger,
        changes: &dyn ChangeSource,
        now: DateTime<Utc>,
    ) -> Result<RunContext> {
        let info = self.version_info(trigger, now)?;

        // Publish runs skip the history diff.
        let requirements_changed = if info.publish {
            false
        } else {
            match changes.changed_files(trigger).await {
                Ok(files) => touches_watch_list(&files, &self.watch_list),
                Err(e) => {
                    warn!(error = %e, "could not diff changed files, assuming requirements unchanged");
                    false
                }
            }
        };

        let ctx = RunContext {
            trigger_kind: trigger.kind(),
            channel: info.channel,
            version: info.version,
            publish: info.publish,
            stable: info.stable,
            requirements_changed,
        };

        info!(
            trigger = ctx.trigger_kind.name(),
            version = %ctx.version,
            channel = %ctx.channel,
            publish = ctx.publish,
            requirements_changed = ctx.requirements_changed,
            "run context resolved"
        );
        Ok(ctx)
    }
}

/// Dev version stamp: `YYYY.MM.devDDHH` in UTC.
pub fn dev_version(now: DateTime<Utc>) -> String {
    now.format("%Y.%m.dev%d%H").to_string()
}

/// Whether any changed file matches the watch-list by path or file name.
pub fn touches_watch_list(changed: &[String], watch_list: &[String]) -> bool {
    changed.iter().any(|file| {
        let name = Path::new(file)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        watch_list.iter().any(|w| file == w || name == *w)
    })
}
