//! Static repository configuration for a release run.
//!
//! Defaults describe the Supervisor pipeline. A JSON file may override any
//! field, and a handful of `SUPCI_*` environment variables override the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ReleaseError, Result};

/// Full orchestrator configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReleaseConfig {
    /// Key under which versions are recorded in the version store.
    pub artifact_name: String,
    /// Target architectures, in build order.
    pub architectures: Vec<String>,
    /// Branch whose pushes publish.
    pub default_branch: String,
    /// Registry namespace, e.g. `ghcr.io/home-assistant`.
    pub registry: String,
    /// Image name template; `{registry}` and `{arch}` are substituted.
    pub image_template: String,
    /// Architecture used for the integration instance.
    pub runner_architecture: String,
    /// Dependency manifests whose change forces a cache rebuild.
    pub watch_list: Vec<String>,
    /// Platform tag scoping dependency-cache entries.
    pub cache_platform_tag: String,
    /// Interpreter ABI scoping dependency-cache entries.
    pub cache_abi: String,
    /// Organization the signer attests for.
    pub signer_organization: String,
    /// Workspace root handed to the packager and signer.
    pub workspace: PathBuf,
    /// JSON file backing the version store.
    pub version_store_path: PathBuf,
    pub readiness: ReadinessConfig,
    pub instance: InstanceConfig,
    pub commands: CommandTemplates,
    /// Add-on slugs installed and started after the core checks.
    pub addon_smoke_tests: Vec<String>,
}

impl Default for ReleaseConfig {
    fn default() -> Self {
        Self {
            artifact_name: "supervisor".to_string(),
            architectures: vec!["aarch64".to_string(), "amd64".to_string()],
            default_branch: "main".to_string(),
            registry: "ghcr.io/home-assistant".to_string(),
            image_template: "{registry}/{arch}-hassio-supervisor".to_string(),
            runner_architecture: "amd64".to_string(),
            watch_list: vec!["requirements.txt".to_string(), "build.yaml".to_string()],
            cache_platform_tag: "musllinux_1_2".to_string(),
            cache_abi: "cp313".to_string(),
            signer_organization: "home-assistant.io".to_string(),
            workspace: PathBuf::from("."),
            version_store_path: PathBuf::from(".supci/versions.json"),
            readiness: ReadinessConfig::default(),
            instance: InstanceConfig::default(),
            commands: CommandTemplates::default(),
            addon_smoke_tests: Vec::new(),
        }
    }
}

impl ReleaseConfig {
    /// Load a config file, falling back to defaults for absent fields.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: ReleaseConfig = serde_json::from_str(&raw)?;
        Ok(config)
    }

    /// Load from an optional file, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    /// Apply `SUPCI_*` environment overrides.
    pub fn apply_env(&mut self) {
        if let Ok(archs) = std::env::var("SUPCI_ARCHITECTURES") {
            self.architectures = archs
                .split(',')
                .map(str::trim)
                .filter(|a| !a.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Ok(registry) = std::env::var("SUPCI_REGISTRY") {
            self.registry = registry;
        }
        if let Ok(branch) = std::env::var("SUPCI_DEFAULT_BRANCH") {
            self.default_branch = branch;
        }
        if let Some(secs) = std::env::var("SUPCI_READY_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
        {
            self.readiness.timeout_secs = secs;
        }
    }

    /// Image repository for an architecture.
    pub fn image_for(&self, architecture: &str) -> String {
        self.image_template
            .replace("{registry}", &self.registry)
            .replace("{arch}", architecture)
    }
}

/// Readiness poll bounds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReadinessConfig {
    pub interval_secs: u64,
    pub timeout_secs: u64,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            interval_secs: 5,
            timeout_secs: 600,
        }
    }
}

impl ReadinessConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Identity of the launched integration instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct InstanceConfig {
    pub container_name: String,
    pub machine: String,
    pub data_dir: PathBuf,
    pub control_port: u16,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            container_name: "hassio_supervisor".to_string(),
            machine: "qemux86-64".to_string(),
            data_dir: PathBuf::from("/tmp/supervisor/data"),
            control_port: 80,
        }
    }
}

/// Argument templates for command-backed collaborators.
///
/// Placeholders: `{arch}`, `{version}`, `{image}`, `{workspace}`,
/// `{platform}`, `{abi}`, `{organization}`, `{registry_host}`, `{username}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CommandTemplates {
    pub packager: Vec<String>,
    /// Extra packager arguments appended in test mode.
    pub packager_test_args: Vec<String>,
    /// Flag preceding each additional image tag.
    pub packager_tag_flag: String,
    pub cache_rebuild: Vec<String>,
    pub signer: Vec<String>,
    pub registry_login: Vec<String>,
    /// Container CLI prefix used to run the integration instance.
    pub container_cli: Vec<String>,
    /// Per-command timeout for external tools.
    pub timeout_secs: u64,
}

impl Default for CommandTemplates {
    fn default() -> Self {
        let s = |v: &[&str]| v.iter().map(|a| a.to_string()).collect::<Vec<_>>();
        Self {
            packager: s(&[
                "docker",
                "run",
                "--rm",
                "--privileged",
                "-v",
                "/run/docker.sock:/run/docker.sock",
                "-v",
                "{workspace}:/data",
                "ghcr.io/home-assistant/amd64-builder",
                "--{arch}",
                "--target",
                "/data",
                "--image",
                "{image}",
                "--version",
                "{version}",
            ]),
            packager_test_args: s(&["--test"]),
            packager_tag_flag: "--additional-tag".to_string(),
            cache_rebuild: s(&[
                "docker",
                "run",
                "--rm",
                "-v",
                "{workspace}:/data",
                "ghcr.io/home-assistant/{arch}-wheels:{platform}",
                "--arch",
                "{arch}",
                "--abi",
                "{abi}",
                "--requirements",
                "/data/requirements.txt",
            ]),
            signer: s(&[
                "cas",
                "notarize",
                "--signerID",
                "{organization}",
                "--name",
                "{version}",
                "{workspace}",
            ]),
            registry_login: s(&[
                "docker",
                "login",
                "{registry_host}",
                "--username",
                "{username}",
                "--password-stdin",
            ]),
            container_cli: s(&["docker"]),
            timeout_secs: 3600,
        }
    }
}

/// Substitute `{key}` placeholders in every argument.
pub fn render_template(template: &[String], vars: &[(&str, &str)]) -> Vec<String> {
    template
        .iter()
        .map(|arg| {
            vars.iter().fold(arg.clone(), |acc, (key, value)| {
                acc.replace(&format!("{{{key}}}"), value)
            })
        })
        .collect()
}

/// Reject configurations that cannot drive a run.
pub fn validate(config: &ReleaseConfig) -> Result<()> {
    if config.artifact_name.trim().is_empty() {
        return Err(ReleaseError::Configuration(
            "artifact_name must not be empty".into(),
        ));
    }
    if config.readiness.interval_secs == 0 {
        return Err(ReleaseError::Configuration(
            "readiness.interval_secs must be positive".into(),
        ));
    }
    if config.readiness.timeout_secs == 0 {
        return Err(ReleaseError::Configuration(
            "readiness.timeout_secs must be positive".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validates() {
        let config = ReleaseConfig::default();
        validate(&config).expect("default config should validate");
        assert_eq!(config.readiness.interval(), Duration::from_secs(5));
    }

    #[test]
    fn test_image_for_substitutes_registry_and_arch() {
        let config = ReleaseConfig::default();
        assert_eq!(
            config.image_for("aarch64"),
            "ghcr.io/home-assistant/aarch64-hassio-supervisor"
        );
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("supci.json");
        std::fs::write(&path, r#"{"architectures": ["amd64"], "readiness": {"timeout_secs": 30}}"#)
            .expect("write config");

        let config = ReleaseConfig::from_file(&path).expect("load config");
        assert_eq!(config.architectures, vec!["amd64".to_string()]);
        assert_eq!(config.readiness.timeout_secs, 30);
        assert_eq!(config.readiness.interval_secs, 5);
        assert_eq!(config.artifact_name, "supervisor");
    }

    #[test]
    fn test_render_template_replaces_all_placeholders() {
        let template = vec!["--{arch}".to_string(), "{image}:{version}".to_string()];
        let rendered = render_template(
            &template,
            &[("arch", "amd64"), ("image", "repo/img"), ("version", "2024.10.0")],
        );
        assert_eq!(rendered, vec!["--amd64", "repo/img:2024.10.0"]);
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let mut config = ReleaseConfig::default();
        config.readiness.timeout_secs = 0;
        assert!(matches!(
            validate(&config),
            Err(ReleaseError::Configuration(_))
        ));
    }
}
